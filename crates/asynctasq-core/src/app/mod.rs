//! App - アプリケーション層
//!
//! Wires the ports together into the worker runtime.
//!
//! # 主要コンポーネント
//! - **WorkerConfig**: 設定値と検証
//! - **ConcurrencyGate**: in-flight 上限（バックプレッシャの唯一の源）
//! - **Dispatcher**: 1 envelope の実行（deadline, cancellation, 終端 broker 操作）
//! - **LeaseRenewer**: visibility lease の延長
//! - **Poller**: dequeue ループ（優先度順、empty-sleep、max_tasks）
//! - **ProcessPool**: CPU-bound handler 用の子プロセスプール
//! - **Worker / WorkerBuilder**: ライフサイクル、シグナル、heartbeat、shutdown

pub mod config;
pub mod gate;
pub mod status;
pub mod renewer;
pub mod dispatcher;
pub mod poller;
pub mod pool;
pub mod worker;
pub mod builder;

pub use self::builder::{BuildError, WorkerBuilder};
pub use self::config::{ConfigError, WorkerConfig};
pub use self::gate::ConcurrencyGate;
pub use self::pool::{PoolConfig, ProcessPool, child_main};
pub use self::status::{StatsSnapshot, WorkerStats};
pub use self::worker::{Worker, WorkerError, WorkerHandle};
