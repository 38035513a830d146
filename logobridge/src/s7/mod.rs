//! S7 communication over ISO-on-TCP (RFC 1006)
//!
//! Only the subset needed to read and write bytes of a single data block is
//! implemented: the COTP connect, the communication setup, and single-item
//! read/write jobs.

mod client;
pub(crate) mod frame;

pub use client::{S7Connection, S7Connector, S7Settings};
