//! A per-packet TCP dissection and stream-analysis engine.
//!
//! This crate parses raw TCP segments carried over IPv4/IPv6, maintains
//! per-flow state across a conversation's lifetime, classifies sequence and
//! acknowledgment anomalies (retransmissions, zero windows, duplicate acks,
//! keepalives, ...), reassembles application-layer PDUs that span multiple
//! segments, computes round-trip and bytes-in-flight metrics, and follows
//! MPTCP subflows back to their shared connection. It does not capture
//! packets, read a configuration file, or run any I/O of its own: the
//! embedding application owns both, and hands each segment to
//! [`Engine::process_segment`] one at a time, in either capture or replay
//! order.
//!
//! ```rust
//! use tcpscope_core::config::default_config;
//! use tcpscope_core::{Engine, Segment};
//!
//! let mut engine = Engine::new(default_config());
//! let bytes: &[u8] = &[0u8; 20]; // a raw TCP segment, header onward
//! let seg = Segment {
//!     src_addr: "10.0.0.1".parse().unwrap(),
//!     dst_addr: "10.0.0.2".parse().unwrap(),
//!     frame: 1,
//!     timestamp: 0.0,
//!     visited: false,
//!     fragmented: false,
//!     in_error: false,
//!     bytes,
//! };
//! let _ = engine.process_segment(&seg);
//! for _pdu in engine.iter_reassembled() {
//!     // deliver reassembled application-layer bytes
//! }
//! ```

pub mod config;
pub mod conntrack;
mod engine;
pub mod error;
pub mod mptcp;
pub mod packet;
pub mod stats;
pub mod utils;

pub use self::conntrack::conn_id::{ConnId, FiveTuple};
pub use self::conntrack::{AnalysisFlags, AnalysisRecord};
pub use self::engine::{Engine, HeaderRecord, MptcpOutcome, Outcome, Segment};
pub use self::error::{ExpertInfo, TcpParseError};
