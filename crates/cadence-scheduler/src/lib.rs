//! `cadence-scheduler`: durable single-fire task store with a Tokio poll loop.
//!
//! # Overview
//!
//! Tasks are persisted to a SQLite `tasks` table, one row per task id. The
//! [`engine::SchedulerEngine`] polls the table every `poll_interval`, claims
//! any task whose `fire_at` has arrived and forwards it over an mpsc channel
//! to whoever routes fired tasks. The receiver acknowledges with
//! [`TaskStore::mark_fired`] once the task's effect has been applied.
//!
//! # Task lifecycle
//!
//! | Status    | Meaning                                              |
//! |-----------|------------------------------------------------------|
//! | `pending` | Armed, waiting for `fire_at`                         |
//! | `running` | Claimed by the engine, handed to the router          |
//! | `fired`   | Effect applied; terminal until the id is re-armed    |
//!
//! Cancelling a task deletes its row. `put` on an existing id replaces the
//! row and resets it to `pending`.

pub mod db;
pub mod engine;
pub mod error;
pub mod store;
pub mod types;

pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use store::{SqliteTaskStore, TaskStore};
pub use types::{Task, TaskStatus};
