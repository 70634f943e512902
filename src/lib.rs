// src/lib.rs
//! Client-side log shipping.
//!
//! Application values are turned into [`SerializedNode`] trees by
//! [`serialize`], wrapped in [`LogEntry`] values and batched by a
//! [`DeliveryQueue`] that delivers through a [`LogSender`]. When the process
//! is torn down, [`DeliveryQueue::drain`] pushes whatever is left through
//! synchronous teardown transports.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod entry;
pub mod host;
pub mod logger;
pub mod queue;
pub mod sender;
pub mod serialize;
pub mod telemetry;
pub mod value;

pub use bridge::{DrainGuard, TeardownBridge, TeardownEvent};
pub use config::ShipperConfig;
pub use entry::{Level, LogEntry};
pub use host::{classify_host, HostIndicators, HostProfile};
pub use logger::Logger;
pub use queue::{
    DeliveryError, DeliveryQueue, DrainOutcome, FlushOutcome, QueueConfig, QueuePhase,
};
pub use sender::{EndpointCache, HttpSender, LogSender, SendError};
pub use serialize::{deserialize, serialize, SerializeOptions, SerializedNode};
pub use value::Value;

// Re-export tracing for use in other modules
pub use tracing;
