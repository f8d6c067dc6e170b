//! Packline sans-IO core.
//!
//! The protocol logic between the wire format (`packline-proto`) and the
//! Tokio runtime (`packline-server`): the incremental packet stream reader,
//! the pooled payload arena, the connection lifecycle state machine, the IP
//! admission store with its pluggable criterion chain, and the opaque
//! cipher seam.
//!
//! Nothing in this crate performs I/O or reads a clock. Time and randomness
//! flow in through the [`env::Environment`] trait or as method parameters,
//! which keeps every state machine deterministic under test.

pub mod admission;
pub mod arena;
pub mod cipher;
pub mod connection;
pub mod env;
pub mod error;
pub mod reader;

pub use admission::{
    AdmissionCriterion, AdmissionStore, BanRecord, RateLimitConfig, SlidingWindowLimiter,
};
pub use arena::PayloadArena;
pub use cipher::{CipherError, PacketCipher};
pub use connection::{
    Connection, ConnectionAction, ConnectionConfig, ConnectionState, DisconnectReason,
};
pub use env::Environment;
pub use error::{AdmissionError, ConnectionError};
pub use reader::PacketReader;
