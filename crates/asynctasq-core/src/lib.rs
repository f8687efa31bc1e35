//! asynctasq-core
//!
//! Worker runtime for the AsyncTasQ distributed task queue: producers put
//! typed jobs on named queues, worker processes pull them off with
//! at-least-once delivery, retries, dead-lettering, and crash recovery via
//! visibility timeouts. This crate is the consumer side; broker adapters,
//! payload codecs and the producer API plug in through the `ports` traits.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, outcome, retry, decision, state, events）
//! - **ports**: 抽象化レイヤー（Broker, Serializer, Clock, EventSink）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TaskRegistry, PayloadCodec）
//! - **app**: アプリケーションロジック（config, gate, dispatcher, renewer, poller, pool, worker）
//! - **impls**: 実装（InMemoryBroker, event sinks など開発・テスト用）

pub mod domain;
pub mod ports;
pub mod typed;
pub mod app;
pub mod impls;
