//! Ports - 抽象化レイヤー
//!
//! Hexagonal "ports": each trait is the contract an external collaborator
//! (broker backend, payload codec, clock, event destination) must satisfy.
//! The worker core only ever talks to these traits; `impls/` carries the
//! in-process implementations used for development and tests.

pub mod broker;
pub mod serializer;
pub mod clock;
pub mod event_sink;

pub use self::broker::{Broker, BrokerCapabilities, BrokerError, call_with_retry};
pub use self::clock::{Clock, FixedClock, Sleeper, SystemClock};
pub use self::event_sink::{EventEmitter, EventSink, SinkError};
pub use self::serializer::{CallArgs, CodecError, Serializer};
