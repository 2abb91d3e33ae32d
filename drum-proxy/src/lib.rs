pub mod client;
pub mod manager;
pub mod queue;
pub mod worker;

pub use client::{ApiTransport, UpstreamClient};
pub use manager::{Manager, TransportFactory};
pub use worker::Worker;
