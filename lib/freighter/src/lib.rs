//! Point-to-point reliable bulk transfer over a one-sided
//! remote-memory-write fabric. A passive getter receives and verifies a
//! byte stream that an active putter writes directly into the getter's
//! pre-published buffers; many concurrent sessions multiplex over a small
//! pool of polling worker threads.

#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

pub mod buffer;
pub mod config;
pub mod ctl;
pub mod fabric;
pub mod fifo;
pub mod get;
pub mod logging;
pub mod mr;
pub mod msg;
pub mod put;
pub mod rcvr;
pub mod session;
pub mod support;
pub mod terminal;
pub mod worker;
pub mod xmtr;

/// Default service the getter binds and the putter dials.
pub const SERVICE_NAME: &str = "4242";
