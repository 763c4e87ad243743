#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

//! Publish/subscribe key-value coordination over TCP.
//!
//! One server and any number of clients share a namespace of typed entries
//! keyed by hierarchical paths. Updates propagate eventually; concurrent
//! writes to the same entry resolve last-writer-wins through 16-bit
//! sequence numbers.

/// Highest protocol revision spoken by this implementation.
pub const PROTO_REV_3: u16 = 0x0300;
/// Lowest protocol revision accepted after downgrade.
pub const PROTO_REV_2: u16 = 0x0200;

/// Default TCP listen/connect port.
pub const DEFAULT_PORT: u16 = 1735;

/// Network entry id meaning "not yet assigned by the server".
pub const UNASSIGNED_ID: u16 = 0xffff;

pub mod instance;
pub mod message;
pub mod net;
pub mod notifier;
pub mod persist;
pub mod rpc;
pub mod seqnum;
pub mod storage;
pub mod value;
pub mod wire;

pub use crate::instance::{instance, Instance};
pub use crate::value::{Value, ValueType};
