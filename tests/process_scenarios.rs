use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use weft_core::config::EngineConfig;
use weft_core::types::{
    AgentOutput, DecisionSpec, LoopSpec, ProcessKind, Task, TaskId, TaskStatus,
};
use weft_engine::{ProcessEngine, RunOptions, TerminalReason};
use weft_test_utils::{tasks, validation_loop, CallLog, MockAgent, RecordingObserver};

fn ids(names: &[&str]) -> Vec<TaskId> {
    names.iter().map(|n| TaskId::from(*n)).collect()
}

// ---------------------------------------------------------------------------
// Sequential
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_runs_in_order_and_chains_context() {
    let agent = Arc::new(MockAgent::new("w"));
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .tasks(tasks(&["a", "b", "c"]))
        .build()
        .unwrap();

    let result = engine.run(Some("topic: rust".into())).await;

    assert_eq!(result.terminal, TerminalReason::Completed);
    assert_eq!(result.order_names(), vec!["a", "b", "c"]);
    assert_eq!(result.iterations, 3);

    let log = agent.log();
    assert_eq!(log.requests_for("a")[0].context, "## Input\ntopic: rust");
    assert_eq!(log.requests_for("b")[0].context, "## Context from a\na done");
    // Only the most recent upstream output by default.
    assert_eq!(log.requests_for("c")[0].context, "## Context from b\nb done");
}

#[tokio::test]
async fn sequential_skips_tasks_whose_dependencies_failed() {
    let agent = Arc::new(MockAgent::new("w").fail_on("b"));
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .task(Task::new("a", "a"))
        .task(Task::new("b", "b"))
        .task(Task::new("c", "c").depends_on(ids(&["b"])))
        .task(Task::new("d", "d"))
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::PartialFailure);
    let b = result.by_name("b").unwrap();
    assert_eq!(b.status, TaskStatus::Failed);
    assert!(b.error.as_deref().unwrap().contains("scripted failure"));
    assert_eq!(result.by_name("c").unwrap().status, TaskStatus::NotStarted);
    assert_eq!(result.by_name("d").unwrap().status, TaskStatus::Completed);
    assert!(result.diagnostics.iter().any(|d| d.contains("'c' not started")));
    assert_eq!(agent.log().calls("c"), 0);
}

#[tokio::test]
async fn sequential_ignores_condition_tables() {
    let agent = Arc::new(MockAgent::new("w").respond("check", ["invalid"]));
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .tasks(validation_loop(3))
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::Completed);
    assert_eq!(result.order_names(), vec!["write", "check"]);
    // No label hint outside workflow mode.
    assert!(!agent.log().requests_for("check")[0]
        .expected_output
        .contains("Answer with exactly one of"));
}

#[tokio::test]
async fn placeholders_are_filled_from_run_inputs() {
    let agent = Arc::new(MockAgent::new("w"));
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .task(
            Task::new("a", "a")
                .with_description("Write about {topic} for {audience}")
                .with_expected_output("A {unknown} post"),
        )
        .build()
        .unwrap();

    let options = RunOptions::new()
        .with_var("topic", "ownership")
        .with_var("audience", "beginners");
    engine.run_with(options).await;

    let request = &agent.log().requests()[0];
    assert_eq!(request.description, "Write about ownership for beginners");
    assert_eq!(request.expected_output, "A {unknown} post");
}

#[tokio::test]
async fn observers_see_every_finished_task() {
    let observer = RecordingObserver::new();
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(Arc::new(MockAgent::new("w").fail_on("b")))
        .tasks(tasks(&["a", "b"]))
        .observer(observer.clone())
        .build()
        .unwrap();

    let result = engine
        .run_with(RunOptions::new().with_run_id("run-obs"))
        .await;

    assert_eq!(result.run_id, "run-obs");
    assert_eq!(
        observer.summary(),
        vec![
            ("a".to_string(), TaskStatus::Completed),
            ("b".to_string(), TaskStatus::Failed),
        ]
    );
    assert!(observer.events().iter().all(|e| e.run_id == "run-obs"));
}

#[tokio::test]
async fn engine_can_be_run_twice() {
    let agent = Arc::new(MockAgent::new("w"));
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .tasks(tasks(&["a", "b"]))
        .build()
        .unwrap();

    let first = engine.run(None).await;
    let second = engine.run(None).await;

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.by_name("a").unwrap().attempts, 1);
    assert_eq!(agent.log().calls("a"), 2);
}

// ---------------------------------------------------------------------------
// Async execution
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn async_tasks_overlap_and_join_before_dependent() {
    let agent = Arc::new(
        MockAgent::new("w")
            .delay("x", Duration::from_millis(100))
            .delay("y", Duration::from_millis(100)),
    );
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .task(Task::new("x", "x").run_async())
        .task(Task::new("y", "y").run_async())
        .task(
            Task::new("z", "z")
                .depends_on(ids(&["x", "y"]))
                .retain_full_context(),
        )
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::Completed);
    let log = agent.log();
    assert!(log.position("start:y").unwrap() < log.position("end:x").unwrap());
    assert!(log.position("start:z").unwrap() > log.position("end:x").unwrap());
    assert!(log.position("start:z").unwrap() > log.position("end:y").unwrap());
    assert_eq!(log.peak_concurrency(), 2);

    let context = &log.requests_for("z")[0].context;
    assert!(context.contains("## Context from x\nx done"));
    assert!(context.contains("## Context from y\ny done"));
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_is_respected() {
    let agent = Arc::new(MockAgent::new("w").delay_all(Duration::from_millis(50)));
    let names = ["t1", "t2", "t3", "t4", "t5", "t6"];
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .tasks(tasks(&names).into_iter().map(Task::run_async).collect())
        .max_concurrency(2)
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::Completed);
    assert_eq!(agent.log().requests().len(), 6);
    assert_eq!(agent.log().peak_concurrency(), 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_async_agent_fails_only_its_task() {
    let agent = Arc::new(MockAgent::new("w").panic_on("x"));
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent)
        .task(Task::new("x", "x").run_async())
        .task(Task::new("y", "y"))
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::PartialFailure);
    let x = result.by_name("x").unwrap();
    assert_eq!(x.status, TaskStatus::Failed);
    assert!(x.error.as_deref().unwrap().contains("panicked"));
    assert_eq!(result.by_name("y").unwrap().status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn failed_async_dependency_still_releases_dependent() {
    let agent = Arc::new(MockAgent::new("w").fail_on("x"));
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .task(Task::new("x", "x").run_async())
        .task(Task::new("z", "z").depends_on(ids(&["x"])))
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::PartialFailure);
    assert_eq!(result.by_name("x").unwrap().status, TaskStatus::Failed);
    assert_eq!(result.by_name("z").unwrap().status, TaskStatus::Completed);
    assert_eq!(agent.log().calls("z"), 1);
    assert!(!result.diagnostics.iter().any(|d| d.contains("'z' not started")));
}

// ---------------------------------------------------------------------------
// Bounds: cancellation, timeout, iterations
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_the_running_task() {
    let agent = Arc::new(MockAgent::new("w").delay("b", Duration::from_secs(10)));
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .tasks(tasks(&["a", "b", "c"]))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let result = engine.run_with(RunOptions::new().with_cancel(cancel)).await;

    assert_eq!(result.terminal, TerminalReason::Cancelled);
    assert_eq!(result.by_name("a").unwrap().status, TaskStatus::Completed);
    let b = result.by_name("b").unwrap();
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.error.as_deref(), Some("interrupted"));
    assert_eq!(result.by_name("c").unwrap().status, TaskStatus::NotStarted);
    assert_eq!(agent.log().calls("c"), 0);
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let agent = Arc::new(MockAgent::new("w"));
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .tasks(tasks(&["a"]))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = engine.run_with(RunOptions::new().with_cancel(cancel)).await;

    assert_eq!(result.terminal, TerminalReason::Cancelled);
    assert_eq!(result.iterations, 0);
    assert!(agent.log().requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_timeout_stops_a_slow_run() {
    let agent = Arc::new(MockAgent::new("w").delay("slow", Duration::from_secs(60)));
    let config = EngineConfig {
        run_timeout_secs: Some(5),
        ..EngineConfig::default()
    };
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent)
        .tasks(tasks(&["fast", "slow", "after"]))
        .config(config)
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::TimedOut);
    assert_eq!(result.by_name("fast").unwrap().status, TaskStatus::Completed);
    assert_eq!(
        result.by_name("slow").unwrap().error.as_deref(),
        Some("interrupted")
    );
    assert_eq!(result.by_name("after").unwrap().status, TaskStatus::NotStarted);
}

#[tokio::test]
async fn unbounded_cycle_hits_iteration_bound() {
    let engine = ProcessEngine::builder(ProcessKind::Workflow)
        .agent(Arc::new(MockAgent::new("w")))
        .task(Task::new("ping", "ping").start().then(ids(&["pong"])))
        .task(Task::new("pong", "pong").then(ids(&["ping"])))
        .max_iterations(5)
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::MaxIterationsReached);
    assert_eq!(result.iterations, 5);
    assert_eq!(result.order_names(), vec!["ping", "pong", "ping", "pong", "ping"]);
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.contains("iteration bound of 5")));
}

// ---------------------------------------------------------------------------
// Workflow routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validation_loop_retries_until_valid() {
    let agent = Arc::new(
        MockAgent::new("w").respond("check", ["invalid", "invalid", "invalid", "valid"]),
    );
    let engine = ProcessEngine::builder(ProcessKind::Workflow)
        .agent(agent.clone())
        .tasks(validation_loop(5))
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::Completed);
    let write = result.by_name("write").unwrap();
    assert_eq!(write.attempts, 4);
    assert_eq!(write.retries, 3);
    assert!(!write.retry_exhausted);
    assert_eq!(agent.log().calls("write"), 4);
    assert_eq!(agent.log().calls("check"), 4);
    assert_eq!(result.by_name("check").unwrap().result_text.as_deref(), Some("valid"));
}

#[tokio::test]
async fn validation_loop_exhausts_retry_budget() {
    let agent = Arc::new(MockAgent::new("w").respond("check", ["invalid"]));
    let engine = ProcessEngine::builder(ProcessKind::Workflow)
        .agent(agent.clone())
        .tasks(validation_loop(2))
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::RetryBudgetExhausted);
    let write = result.by_name("write").unwrap();
    assert!(write.retry_exhausted);
    assert_eq!(write.retries, 2);
    assert_eq!(agent.log().calls("write"), 3);
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.contains("retry budget exhausted for task 'write'")));
}

#[tokio::test]
async fn observers_get_one_event_per_execution() {
    let observer = RecordingObserver::new();
    let engine = ProcessEngine::builder(ProcessKind::Workflow)
        .agent(Arc::new(MockAgent::new("w").respond("check", ["invalid"])))
        .tasks(validation_loop(2))
        .observer(observer.clone())
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::RetryBudgetExhausted);
    let events = observer.events();
    assert_eq!(events.iter().filter(|e| e.task_name == "write").count(), 3);
    assert_eq!(events.iter().filter(|e| e.task_name == "check").count(), 3);
    assert_eq!(events.len(), result.iterations);
    assert!(result.by_name("write").unwrap().retry_exhausted);
}

#[tokio::test]
async fn failing_branch_does_not_stop_its_sibling() {
    let agent = Arc::new(MockAgent::new("w").fail_on("a"));
    let engine = ProcessEngine::builder(ProcessKind::Workflow)
        .agent(agent.clone())
        .task(Task::new("a", "a").start().then(ids(&["b"])))
        .task(Task::new("b", "b"))
        .task(Task::new("c", "c").start().then(ids(&["d"])))
        .task(Task::new("d", "d"))
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::PartialFailure);
    assert_eq!(result.by_name("a").unwrap().status, TaskStatus::Failed);
    assert_eq!(result.by_name("b").unwrap().status, TaskStatus::NotStarted);
    assert_eq!(result.by_name("c").unwrap().status, TaskStatus::Completed);
    assert_eq!(result.by_name("d").unwrap().status, TaskStatus::Completed);
    assert_eq!(agent.log().calls("b"), 0);
}

#[tokio::test]
async fn feedback_reaches_the_re_entered_task() {
    let agent = Arc::new(
        MockAgent::new("w")
            .respond("write", ["draft 1", "draft 2"])
            .respond_with(
                "check",
                [
                    AgentOutput::text("invalid")
                        .with_structured(json!({"label": "invalid", "feedback": "too short"})),
                    AgentOutput::text("valid"),
                ],
            ),
    );
    let engine = ProcessEngine::builder(ProcessKind::Workflow)
        .agent(agent.clone())
        .tasks(validation_loop(3))
        .build()
        .unwrap();

    let result = engine.run(Some("brief".into())).await;

    assert_eq!(result.terminal, TerminalReason::Completed);
    let writes = agent.log().requests_for("write");
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].context, "## Input\nbrief");
    assert_eq!(
        writes[1].context,
        "## Validation feedback\ntoo short\n\n## Input\nbrief"
    );
    assert!(agent.log().requests_for("check")[0]
        .expected_output
        .contains("Answer with exactly one of: invalid, valid"));
}

#[tokio::test]
async fn unmatched_label_falls_through_to_next_tasks() {
    let agent = Arc::new(MockAgent::new("w").respond("triage", ["unsure"]));
    let engine = ProcessEngine::builder(ProcessKind::Workflow)
        .agent(agent.clone())
        .task(
            Task::new("triage", "triage")
                .start()
                .then(ids(&["fallback"]))
                .decision(DecisionSpec::new().on("urgent", ids(&["escalate"]))),
        )
        .task(Task::new("escalate", "escalate"))
        .task(Task::new("fallback", "fallback"))
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.order_names(), vec!["triage", "fallback"]);
    assert_eq!(result.by_name("escalate").unwrap().status, TaskStatus::NotStarted);
}

#[tokio::test(start_paused = true)]
async fn workflow_fans_out_and_joins() {
    let log = CallLog::new();
    let agent = Arc::new(
        MockAgent::new("w")
            .with_log(log.clone())
            .delay("left", Duration::from_millis(30))
            .delay("right", Duration::from_millis(10)),
    );
    let engine = ProcessEngine::builder(ProcessKind::Workflow)
        .agent(agent)
        .task(Task::new("plan", "plan").start().then(ids(&["left", "right"])))
        .task(Task::new("left", "left").run_async())
        .task(Task::new("right", "right").run_async())
        .task(Task::new("merge", "merge").depends_on(ids(&["left", "right"])))
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::Completed);
    assert_eq!(result.order_names(), vec!["plan", "left", "right", "merge"]);
    assert!(log.position("start:merge").unwrap() > log.position("end:left").unwrap());
    // right finished first, left last: left is the most recent context.
    assert_eq!(
        log.requests_for("merge")[0].context,
        "## Context from left\nleft done"
    );
}

#[tokio::test]
async fn context_keeps_all_sources_when_asked() {
    let agent = Arc::new(MockAgent::new("w"));
    let engine = ProcessEngine::builder(ProcessKind::Workflow)
        .agent(agent.clone())
        .task(Task::new("research", "research").start())
        .task(Task::new("outline", "outline").start())
        .task(Task::new("draft", "draft").depends_on(ids(&["research", "outline"])))
        .task(
            Task::new("report", "report")
                .depends_on(ids(&["research", "outline"]))
                .retain_full_context(),
        )
        .build()
        .unwrap();

    let result = engine.run(Some("input".into())).await;

    assert_eq!(result.terminal, TerminalReason::Completed);
    let log = agent.log();
    assert_eq!(log.requests_for("outline")[0].context, "## Input\ninput");
    assert_eq!(
        log.requests_for("draft")[0].context,
        "## Context from outline\noutline done"
    );
    assert_eq!(
        log.requests_for("report")[0].context,
        "## Context from research\nresearch done\n\n## Context from outline\noutline done"
    );
}

#[tokio::test]
async fn loop_task_collects_one_output_per_item() {
    let agent = Arc::new(
        MockAgent::new("w")
            .respond("list", ["alpha\nbeta\n\ngamma"])
            .respond("each", ["A", "B", "G"]),
    );
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .task(Task::new("list", "list"))
        .task(
            Task::new("each", "each")
                .depends_on(ids(&["list"]))
                .looping(LoopSpec::default().from_task("list")),
        )
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::Completed);
    let each = result.by_name("each").unwrap();
    assert_eq!(each.result_text.as_deref(), Some("A\n\nB\n\nG"));
    assert_eq!(each.structured_result, Some(json!(["A", "B", "G"])));
    let passes = agent.log().requests_for("each");
    assert_eq!(passes.len(), 3);
    assert!(passes[2].context.ends_with("Current item (3/3): gamma"));
    assert_eq!(result.iterations, 2);
}

#[tokio::test]
async fn loop_without_items_falls_back_to_stop_label() {
    let agent = Arc::new(
        MockAgent::new("w")
            .respond("list", [""])
            .respond("each", ["one", "DONE"]),
    );
    let engine = ProcessEngine::builder(ProcessKind::Sequential)
        .agent(agent.clone())
        .task(Task::new("list", "list"))
        .task(
            Task::new("each", "each")
                .depends_on(ids(&["list"]))
                .looping(LoopSpec::default().from_task("list").stop_on("DONE")),
        )
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::Completed);
    let each = result.by_name("each").unwrap();
    assert_eq!(each.status, TaskStatus::Completed);
    assert_eq!(each.result_text.as_deref(), Some("one"));
    assert_eq!(agent.log().calls("each"), 2);
}

// ---------------------------------------------------------------------------
// Hierarchical
// ---------------------------------------------------------------------------

fn crew() -> (Arc<MockAgent>, Arc<MockAgent>) {
    (
        Arc::new(MockAgent::new("writer").with_role("Writes prose")),
        Arc::new(MockAgent::new("editor").with_role("Checks prose")),
    )
}

#[tokio::test]
async fn manager_assigns_and_skips() {
    let (writer, editor) = crew();
    let boss = Arc::new(
        MockAgent::new("boss")
            .respond("delegate: draft", [r#"{"agent": "writer"}"#])
            .respond(
                "delegate: review",
                [r#"```json
{"skip": true, "reason": "draft already reviewed"}
```"#],
            ),
    );
    let engine = ProcessEngine::builder(ProcessKind::Hierarchical)
        .manager(boss.clone())
        .agent(writer.clone())
        .agent(editor.clone())
        .tasks(tasks(&["draft", "review", "publish"]))
        .task(Task::new("sign", "sign").with_agent("editor"))
        .build()
        .unwrap();

    // publish: the manager's default answer is not JSON
    let result = engine.run(None).await;

    assert_eq!(writer.log().calls("draft"), 1);
    let review = result.by_name("review").unwrap();
    assert_eq!(review.status, TaskStatus::Completed);
    assert!(review.skipped);
    assert_eq!(review.result_text.as_deref(), Some("draft already reviewed"));
    assert_eq!(editor.log().calls("review"), 0);

    let publish = result.by_name("publish").unwrap();
    assert_eq!(publish.status, TaskStatus::Failed);
    assert!(publish
        .error
        .as_deref()
        .unwrap()
        .contains("malformed manager response"));

    // Statically assigned tasks bypass the manager.
    assert_eq!(editor.log().calls("sign"), 1);
    assert_eq!(boss.log().calls("delegate: sign"), 0);
    assert_eq!(result.terminal, TerminalReason::PartialFailure);

    let roster = &boss.log().requests_for("delegate: draft")[0].description;
    assert!(roster.contains("- writer: Writes prose"));
    assert!(roster.contains("- editor: Checks prose"));
    assert!(!roster.contains("- boss"));
}

#[tokio::test]
async fn manager_choosing_unknown_agent_fails_the_task() {
    let (writer, editor) = crew();
    let boss = Arc::new(MockAgent::new("boss").respond("delegate: draft", [r#"{"agent": "ghost"}"#]));
    let engine = ProcessEngine::builder(ProcessKind::Hierarchical)
        .manager(boss)
        .agent(writer.clone())
        .agent(editor)
        .tasks(tasks(&["draft"]))
        .build()
        .unwrap();

    let result = engine.run(None).await;

    assert_eq!(result.terminal, TerminalReason::PartialFailure);
    let draft = result.by_name("draft").unwrap();
    assert!(draft.error.as_deref().unwrap().contains("unknown agent 'ghost'"));
    assert!(writer.log().requests().is_empty());
}
