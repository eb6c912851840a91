pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{DelegationError, GraphError, Result, WeftError};
pub use event::EventBus;
pub use graph::{GraphSpec, TaskGraph};
pub use traits::{Agent, TaskObserver};
pub use types::*;
