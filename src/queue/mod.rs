//! Named FIFO queues connecting the dispatcher, pipeline stages, and
//! delivery workers, with drain-and-persist on shutdown and
//! reload-and-requeue on startup.

pub mod broker;

pub use broker::{NamedQueue, QueueBroker};
