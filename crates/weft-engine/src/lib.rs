pub mod context;
pub mod coordinator;
pub mod delegate;
pub mod process;
pub mod registry;
pub mod rehearsal;
pub mod router;
pub mod run_log;
pub mod store;

pub use context::ContextBuilder;
pub use coordinator::{AsyncCompletion, AsyncCoordinator, AsyncHandle, AsyncOutcome};
pub use delegate::{Assignment, ManagerDelegate};
pub use process::{
    ProcessEngine, ProcessEngineBuilder, ProcessResult, RunOptions, TaskReport, TerminalReason,
};
pub use registry::AgentRegistry;
pub use rehearsal::{RehearsalScript, ScriptedAgent};
pub use router::{ConditionRouter, Route, RouteReport};
pub use run_log::RunLogger;
pub use store::TaskStore;
