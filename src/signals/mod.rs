//! Signal pipeline: message classification and per-message orchestration.

pub mod coordinator;
pub mod processor;

pub use coordinator::SignalCoordinator;
pub use processor::MessageProcessor;
