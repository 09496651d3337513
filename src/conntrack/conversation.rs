//! Conversation table: maps the unordered address/port
//! 4-tuple to a bidirectional [`Conversation`], handling direction
//! assignment and port-reuse re-keying.

use crate::conntrack::conn_id::{ConnId, FiveTuple};
use crate::conntrack::flow::FlowState;
use crate::conntrack::seq_analysis::AnalysisRecord;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Which of a conversation's two flows a segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// The bidirectional association of two [`FlowState`]s sharing a 4-tuple.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub stream_id: usize,
    pub five_tuple: FiveTuple,
    pub flow1: FlowState,
    pub flow2: FlowState,

    pub ts_first: f64,
    pub ts_prev: f64,
    pub ts_mru_syn: Option<f64>,
    pub ts_first_rtt: Option<f64>,

    pub server_port: Option<u16>,
    pub acked_table: HashMap<(u64, u32, u32), AnalysisRecord>,

    pub mptcp_analysis: Option<crate::mptcp::MptcpAnalysisId>,
    pub last_frame: u64,
}

impl Conversation {
    fn new(stream_id: usize, five_tuple: FiveTuple, unacked_cap: usize, ts: f64) -> Self {
        Conversation {
            stream_id,
            five_tuple,
            flow1: FlowState::new(unacked_cap),
            flow2: FlowState::new(unacked_cap),
            ts_first: ts,
            ts_prev: ts,
            ts_mru_syn: None,
            ts_first_rtt: None,
            server_port: None,
            acked_table: HashMap::new(),
            mptcp_analysis: None,
            last_frame: 0,
        }
    }

    /// Direction assignment: compare source to destination
    /// address, ties broken by `srcport > dstport`.
    pub fn direction_of(&self, src: SocketAddr) -> Direction {
        if src == self.five_tuple.orig {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }

    pub fn flows_mut(&mut self, dir: Direction) -> (&mut FlowState, &mut FlowState) {
        match dir {
            Direction::Forward => (&mut self.flow1, &mut self.flow2),
            Direction::Reverse => (&mut self.flow2, &mut self.flow1),
        }
    }

    pub fn flows(&self, dir: Direction) -> (&FlowState, &FlowState) {
        match dir {
            Direction::Forward => (&self.flow1, &self.flow2),
            Direction::Reverse => (&self.flow2, &self.flow1),
        }
    }
}

/// Directional address ordering used to decide `orig`/`resp` the first
/// time a 4-tuple is seen.
fn is_lower(a: SocketAddr, b: SocketAddr) -> bool {
    match a.ip().cmp(&b.ip()) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => a.port() > b.port(),
    }
}

/// Owns every live [`Conversation`], keyed by its unordered 4-tuple and
/// allocating dense `stream_id`s in creation (insertion) order. Backed by
/// `IndexMap` rather than a separate `Vec`/`HashMap` pair: a conversation's
/// `stream_id` is just its index in the map, and lookups by `ConnId` stay
/// O(1).
#[derive(Debug, Default)]
pub struct ConversationTable {
    conversations: IndexMap<ConnId, Conversation>,
    unacked_cap: usize,
}

impl ConversationTable {
    pub fn new(unacked_cap: usize) -> Self {
        ConversationTable {
            conversations: IndexMap::new(),
            unacked_cap,
        }
    }

    pub fn get(&self, slot: usize) -> &Conversation {
        self.conversations.get_index(slot).expect("valid slot").1
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Conversation {
        self.conversations.get_index_mut(slot).expect("valid slot").1
    }

    /// Finds or creates the conversation for `(src, dst)`, handling the
    /// port-reuse rule: a pure-SYN whose `seq` differs from the
    /// stored `base_seq` for that direction starts a *new* conversation,
    /// whose first `AnalysisRecord` should be tagged `REUSED_PORTS` by the
    /// caller.
    pub fn find_or_create(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        is_pure_syn: bool,
        syn_seq: u32,
        ts: f64,
    ) -> (usize, Direction, bool) {
        let conn_id = ConnId::new(src, dst);
        if let Some(slot) = self.conversations.get_index_of(&conn_id) {
            let conv = &self.conversations[slot];
            let dir = conv.direction_of(src);
            if is_pure_syn {
                let existing_base = match dir {
                    Direction::Forward => conv.flow1.base_seq,
                    Direction::Reverse => conv.flow2.base_seq,
                };
                let base_is_set = match dir {
                    Direction::Forward => conv
                        .flow1
                        .static_flags
                        .contains(crate::conntrack::flow::StaticFlags::BaseSeqSet),
                    Direction::Reverse => conv
                        .flow2
                        .static_flags
                        .contains(crate::conntrack::flow::StaticFlags::BaseSeqSet),
                };
                if base_is_set && existing_base != syn_seq {
                    let reused = self.create(src, dst, ts, conn_id);
                    let dir = self.conversations[reused].direction_of(src);
                    return (reused, dir, true);
                }
            }
            return (slot, dir, false);
        }
        let slot = self.create(src, dst, ts, conn_id);
        let dir = self.conversations[slot].direction_of(src);
        (slot, dir, false)
    }

    fn create(&mut self, src: SocketAddr, dst: SocketAddr, ts: f64, conn_id: ConnId) -> usize {
        let (orig, resp) = if is_lower(src, dst) { (src, dst) } else { (dst, src) };
        let five_tuple = FiveTuple::new(orig, resp);
        let stream_id = self.conversations.len();
        let conv = Conversation::new(stream_id, five_tuple, self.unacked_cap, ts);
        self.conversations.insert(conn_id, conv);
        stream_id
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(ip: &str, port: u16) -> SocketAddr {
        format!("{ip}:{port}").parse().unwrap()
    }

    #[test]
    fn first_segment_creates_conversation_with_stream_zero() {
        let mut table = ConversationTable::new(10_000);
        let (slot, dir, reused) =
            table.find_or_create(addr("1.2.3.4", 1234), addr("5.6.7.8", 80), true, 1000, 0.0);
        assert_eq!(slot, 0);
        assert_eq!(dir, Direction::Forward);
        assert!(!reused);
        assert_eq!(table.get(slot).stream_id, 0);
    }

    #[test]
    fn same_four_tuple_reuses_conversation() {
        let mut table = ConversationTable::new(10_000);
        let (first, ..) =
            table.find_or_create(addr("1.2.3.4", 1234), addr("5.6.7.8", 80), true, 1000, 0.0);
        table.get_mut(first).flow1.maybe_set_base_seq(1000, true);
        let (second, _, reused) =
            table.find_or_create(addr("5.6.7.8", 80), addr("1.2.3.4", 1234), false, 0, 1.0);
        assert_eq!(first, second);
        assert!(!reused);
    }

    #[test]
    fn new_syn_with_different_seq_creates_new_conversation() {
        let mut table = ConversationTable::new(10_000);
        let (first, ..) =
            table.find_or_create(addr("1.2.3.4", 1234), addr("5.6.7.8", 80), true, 1000, 0.0);
        table.get_mut(first).flow1.maybe_set_base_seq(1000, true);
        let (second, _, reused) =
            table.find_or_create(addr("1.2.3.4", 1234), addr("5.6.7.8", 80), true, 9000, 2.0);
        assert_ne!(first, second);
        assert!(reused);
        assert_eq!(table.get(second).stream_id, 1);
    }
}
