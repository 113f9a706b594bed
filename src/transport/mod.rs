//! Remote-object transport
//!
//! Objects are published by an [`ObjectServer`] under an [`Address`] and
//! reached through a [`Proxy`]. Each connection carries length-prefixed JSON
//! [`Call`]/[`Reply`] frames; the server reports connection open/close to its
//! [`Dispatch`] so hosts can scope state (locks, per-session instances) to a
//! connection.

mod proxy;
mod server;
mod wire;

pub use proxy::{probe, Proxy};
pub use server::{Dispatch, Listener, ObjectServer};
pub use wire::{read_frame, write_frame, Address, Call, Endpoint, RemoteError, Reply, MAX_FRAME_LEN};
