//! Implementations - 開発・テスト用の in-process 実装
//!
//! - **InMemoryBroker**: fully capable broker adapter (priority, delays,
//!   visibility leases, DLQ), the reference implementation of the port
//! - **sinks**: callback / memory / broadcast event sinks

pub mod inmem_broker;
pub mod sinks;

pub use self::inmem_broker::{BrokerCounts, InMemoryBroker};
pub use self::sinks::{BroadcastSink, CallbackSink, MemorySink};
