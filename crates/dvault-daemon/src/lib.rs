//! # dvault-daemon
//!
//! The `dvaultd` server. A [`Daemon`] accepts TCP connections and hands
//! each request to the store actor, which owns the [`dvault_manifest::Store`]
//! and applies requests one at a time.

pub mod actor;
pub mod server;

pub use actor::{spawn_store_actor, ConnectionId, StoreActor, StoreHandle};
pub use server::Daemon;
