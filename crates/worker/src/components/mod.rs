pub mod heartbeat_manager;
pub mod launcher;
pub mod processor;

pub use heartbeat_manager::{HeartbeatManager, LifecycleEvent};
pub use launcher::Launcher;
pub use processor::{Processor, ProcessorState};
