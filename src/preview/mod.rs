//! Development preview servers: one per project.

mod lifecycle;
pub mod output;
mod state;
mod supervisor;

pub use lifecycle::{LifecycleController, ServerControl};
pub use output::{LogLine, LogStream};
pub use state::{ServerSnapshot, ServerStartInfo, ServerStatus, ServerTable};
pub use supervisor::ServerSupervisor;
