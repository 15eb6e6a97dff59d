//! `tether` is the client-side networking core of a realtime game framework.
//!
//! It multiplexes one reliable stream and one unreliable datagram channel to
//! the same logical peer, exchanges tagged binary messages framed over both,
//! and keeps the hot path allocation-light through a hierarchy of recycled
//! buffers and objects. A small round-trip-time helper rides along so game
//! code can observe latency without extra plumbing.
//!
//! The three layers, bottom up:
//!
//! - `pool`: size-classed byte blocks and bounded object pools, instantiated
//!   per thread so the recycle path stays lock-free.
//! - `message`: reference-counted buffer windows, the tagged message view
//!   over them, and the payload cursors.
//! - `net`: the bi-channel connection state machine and the `Client` facade
//!   that drives connect, handshake, events and pings.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod logging;
pub mod shared;

pub mod pool;

pub mod message;

pub mod net;

pub mod prelude;
