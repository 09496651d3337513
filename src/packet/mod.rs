//! Packet-level parsing: fixed TCP header, flags, and the option table.
//!
//! Laid out the way `retina_core::protocols::packet` lays out one module
//! per wire concern, but adapted from zero-copy `Mbuf` reads to owned
//! `&[u8]` slices, since the engine's input is a `(metadata, raw bytes)`
//! pair handed in by an external capture source rather
//! than a DPDK-backed buffer.

pub mod header;
pub mod mptcp_opt;
pub mod options;

pub use header::{flags_letters, flags_names, Flags, TcpHeader};
pub use options::{SackRange, TcpOption};
