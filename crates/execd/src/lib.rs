//! Supervision of a long-lived external daemon.
//!
//! `Daemon` owns exactly one child process for its lifetime: it spawns
//! the process, restarts it on unexpected exit under a backoff cap, and
//! exposes signal-based reload plus a graceful-then-forceful stop.

pub mod daemon;
pub mod process;

pub use daemon::{Daemon, DaemonState, ExecError, RESTART_BACKOFF};
pub use process::{CommandSpawner, Process, Spawner};
