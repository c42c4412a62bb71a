//! Core HTTP/1.1 client state machine and remote directory fetch engine
//! for an automatic file distribution daemon.
//!
//! The crate is split the way the ancestor FUSE implementation split a
//! filesystem into wire I/O, a request-reply state machine, and a
//! persistence layer: [`wire`] owns raw/TLS byte transport, [`hmr`] owns
//! one connection's request/response lifecycle, [`http`] drives HTTP
//! verbs over it, [`auth`] computes the credentials those verbs carry,
//! [`retrieve_list`] and [`ledger`] persist what has and hasn't been
//! fetched yet, and [`orchestrator`] ties a listing ([`protocol`]) to the
//! retrieve list for one fetch pass.
//!
//! Nothing here opens a config file, spawns a worker, or owns a control
//! socket; this crate is the engine a daemon's process/IPC layer drives,
//! not the daemon itself.

pub mod auth;
pub mod config;
pub mod error;
pub mod hmr;
pub mod http;
pub mod ledger;
pub mod orchestrator;
pub mod protocol;
pub mod reader;
pub mod retrieve_list;
pub mod wire;

pub use error::{Error, Result};
pub use hmr::Hmr;
pub use reader::MessageReader;
