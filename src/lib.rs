//! A stateful TCP/UDP connection engine for load-testing network equipment,
//! emulating large numbers of independent client/server connections.
//!
//! The engine is built around a per-worker, share-nothing model: each worker
//! owns a private pool of connection control blocks, a connection lookup
//! table, three timer wheels and the scheduling queues that drive the test
//! lifecycle. The TCP connection machine is derived from [RFC 793], reduced
//! to the subset a traffic generator needs (no congestion control, no SACK,
//! no options beyond window size).
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod log;

pub mod error;
pub use error::{Error, Result};

pub mod seq;

pub mod packet;

pub mod config;

pub mod stats;

pub mod timer;

pub mod lookup;

pub mod app;

pub mod ccb;

pub mod tcp;

pub mod udp;

pub mod session;

pub mod worker;

pub mod mgmt;
