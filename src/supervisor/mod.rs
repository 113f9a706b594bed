//! Process supervisor
//!
//! The single long-running process per host that owns the process registry,
//! starts and stops nameserver and daemon subprocesses, restarts crashed
//! ones and answers control-plane requests from the CLI.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                 lab supervisor                  │
//! ├────────────────────────────────────────────────┤
//! │ ProcessManager │ control plane  │ HealthManager │
//! │  (registry)    │ (unix socket)  │  (recovery)   │
//! ├────────────────────────────────────────────────┤
//! │ nameserver default │ daemon lockable │ ...      │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! A lockfile guarantees one supervisor per host. Control requests are rkyv
//! archives in length-prefixed frames, one request per connection.

pub mod client;
pub mod health;
pub mod lockfile;
pub mod log_buffer;
pub mod log_files;
pub mod os;
pub mod processes;
pub mod protocol;
pub mod server;

pub use client::{launch_detached, SupervisorClient};
pub use health::{CrashPolicy, HealthManager};
pub use lockfile::{LockInfo, Lockfile};
pub use processes::{Launcher, ProcessManager, ProcessPaths, SelfLauncher};
pub use protocol::{
    Payload, ProcessSnapshot, ProcessState, ProfileRef, ReloadReport, Request, Response,
    StatusTarget,
};
pub use server::{Supervisor, SupervisorOptions};
