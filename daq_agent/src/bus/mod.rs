pub mod publisher;

pub use publisher::{AmqpBusPublisher, BusPublisher, Publication, RecordingBusPublisher};
