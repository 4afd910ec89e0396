//! Multi-device MODBUS polling engine.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Tick Scheduler (PollerEngine::run_tick)                         │
//! │   └─ per-device fan-out, joined before commit                  │
//! │        ├─ Device Supervisor   — eligibility / backoff          │
//! │        ├─ Write Queue Drain   — pending TagWriteRequest rows    │
//! │        ├─ Block Planner       — coalesce tags into read ranges │
//! │        ├─ Transport           — MBAP-framed MODBUS I/O         │
//! │        ├─ Tag Evaluator       — decode + change detection      │
//! │        └─ History Sampler     — interval-gated history rows    │
//! │   └─ Alarm Evaluator          — priority arbitration           │
//! │   └─ Persistence              — sole writer this tick          │
//! │   └─ Subscription Fan-out     — per-client filtered websocket  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! See `model` for the entity shapes and `scheduler::PollerEngine` for
//! the orchestration entry point.

pub mod alarm;
pub mod block;
pub mod codec;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod fanout;
pub mod history;
pub mod model;
pub mod notify;
pub mod persistence;
pub mod scheduler;
pub mod supervisor;
pub mod transport;
pub mod write_queue;

pub use config::PollerConfig;
pub use error::{PollerError, Result};
pub use scheduler::PollerEngine;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
