pub mod executors;
pub mod heartbeat;
pub mod registry;
pub mod service;

pub use executors::{register_builtin_handlers, EchoHandler, ShellHandler};
pub use heartbeat::HeartbeatReporter;
pub use registry::{HandlerError, HandlerRegistry, HandlerResult, TaskHandler};
pub use service::{Dispatcher, DispatcherBuilder, TaskOutcome};
