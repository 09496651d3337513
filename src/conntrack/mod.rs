//! Connection tracking: conversation table, per-direction flow state,
//! sequence analysis, reassembly, and timing. Laid out the way `retina_core::conntrack` separates `conn_id`,
//! the connection table, and per-connection state into sibling modules.

pub mod conn_id;
pub mod conversation;
pub mod flow;
pub mod reassembly;
pub mod seq_analysis;
pub mod timing;

pub use conn_id::{ConnId, FiveTuple};
pub use conversation::{Conversation, ConversationTable, Direction};
pub use flow::FlowState;
pub use seq_analysis::{AnalysisFlags, AnalysisRecord};
