//! ratewarden：基于 Counter Store（Redis）的分布式限流、用量统计与安全事件监控引擎
//!
//! 入口是 [`SecurityEngine`]，通过 [`EngineBuilder`] 按 [`EngineConfig`] 构建。

pub mod alerting;
pub mod blocklist;
pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod keys;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod store;
pub mod suspicion;
pub mod usage;

pub use alerting::notifier::{FnNotifier, LogNotifier, Notifier, NotifyError, WebhookNotifier};
pub use alerting::{AlertThreshold, SecurityAlert};
pub use blocklist::{BlockKind, BlockState, BlockTarget};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, FailMode, StoreBackend};
pub use engine::{EngineBuilder, SecurityEngine, SecurityMetrics};
pub use error::{EngineError, Result};
pub use events::{SecurityEvent, SecurityEventType, Severity};
pub use gate::{GateVerdict, RequestMeta};
pub use limiter::CallerIdentity;
pub use store::{CounterStore, MemoryStore, RedisStore, StoreError};
pub use usage::{CostModel, PerTokenRate, UsageKind, UsageStats};
