//! Leadership and leader-only processing.

pub mod assignment;
pub mod election;
pub mod manager;
pub mod process;

pub use election::{ElectionFactory, Elector, FactoryParams};
pub use manager::NamespaceManager;
pub use process::{Processor, ProcessorFactory, ShardProcessor, ShardProcessorFactory};
