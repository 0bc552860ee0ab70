//! Outbox relay engine with at-least-once delivery guarantees.
//!
//! Implements the claim -> publish -> finalize loop over the outbox table
//! using PostgreSQL `FOR UPDATE SKIP LOCKED` for lock-free work
//! distribution across workers and processes. Correctness rests on the
//! lease + fencing-token protocol, not on in-process synchronization:
//!
//! ```text
//!                  ┌──────────────────────────────────────────┐
//!                  │                PostgreSQL                │
//!                  │   outbox table: PENDING/FAILED rows      │
//!                  │   claim = SKIP LOCKED + lease + token    │
//!                  └──────────────────────────────────────────┘
//!                          │                       ▲
//!                claim_batch(token)        fenced finalize /
//!                          │                heartbeat renew
//!                          ▼                       │
//!                 ┌─────────────────┐      ┌───────────────┐
//!                 │  RelayWorker(s) │─────▶│   Publisher   │
//!                 └─────────────────┘      └───────────────┘
//!                          ▲
//!                  Reaper returns expired leases to PENDING
//! ```
//!
//! Parallel workers make progress without serializing; a worker that loses
//! its lease cannot mutate the row, and the reaper bounds how long a
//! crashed worker's claim survives. Global event ordering is deliberately
//! not preserved.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod listener;
pub mod publisher;
pub mod reaper;
pub mod retry;
pub mod worker;
pub mod worker_pool;

pub use error::{PublishError, RelayError, Result};
pub use listener::{ChangeListener, CHANGE_CHANNEL};
pub use publisher::Publisher;
pub use reaper::Reaper;
pub use retry::RetryPolicy;
pub use worker::{RelayConfig, RelayEngine, RelayStats, RelayWorker};
pub use worker_pool::WorkerPool;
