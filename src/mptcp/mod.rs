//! MPTCP analyzer: links TCP subflows sharing a token
//! into one `MptcpAnalysis`, converts subflow SSN <-> MPTCP DSN via each
//! subflow's DSS mapping tree, and optionally detects cross-subflow
//! reinjection.
//!
//! Cyclic references (meta <-> subflows <-> conversations) are modeled as
//! arena indices rather than shared ownership:
//! `MptcpAnalysisId`/`SubflowId` are plain handles into `MptcpAnalyzer`'s
//! `Vec`s, which is how `retina_core`'s own connection table avoids `Rc`
//! cycles between a `Conversation` and its subscribers.

pub mod crypto;

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

pub type MptcpAnalysisId = usize;
pub type SubflowId = usize;

/// Per-meta-flow static identity.
#[derive(Debug, Clone)]
pub struct MetaFlow {
    pub key: Option<u64>,
    pub token: Option<u32>,
    pub base_dsn: Option<u64>,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub has_base_dsn_msb: bool,
}

impl MetaFlow {
    fn empty() -> Self {
        MetaFlow {
            key: None,
            token: None,
            base_dsn: None,
            ip: None,
            port: None,
            has_base_dsn_msb: false,
        }
    }

    /// Binds this meta flow to a key (MP_CAPABLE sighting), deriving token
    /// and base DSN via SHA-1.
    pub fn bind_key(&mut self, key: u64, ip: IpAddr, port: u16) {
        self.key = Some(key);
        self.token = Some(crypto::token(key));
        self.base_dsn = Some(crypto::base_dsn(key));
        self.has_base_dsn_msb = true;
        self.ip = Some(ip);
        self.port = Some(port);
    }
}

/// One DSS mapping: an SSN range and the DSN it corresponds to.
#[derive(Debug, Clone, Copy)]
pub struct DssMapping {
    pub rawdsn: u64,
    pub ssn_low: u32,
    pub ssn_high: u32,
    pub extended_dsn: u64,
    pub frame: u64,
}

/// A single TCP subflow attached to an MPTCP connection. The mapping tree is a `BTreeMap` keyed by `ssn_low`,
/// a deliberate simplification of a full interval tree (documented in
/// `DESIGN.md`): ranges in one subflow's DSS stream do not overlap in
/// practice, so a sorted map with a "find candidate below, check coverage"
/// lookup gives the same answers with far less code.
#[derive(Debug, Clone, Default)]
pub struct MptcpSubflow {
    pub address_id: Option<u8>,
    pub nonce: Option<u32>,
    pub meta: Option<MptcpAnalysisId>,
    pub is_orig: bool,
    ssn_to_dsn_mappings: BTreeMap<u32, DssMapping>,
    /// dsn_low -> (dsn_high, frame), for cross-subflow reinjection lookups.
    dsn_to_packet_map: BTreeMap<u64, (u64, u64)>,
}

impl MptcpSubflow {
    /// Inserts a DSS mapping. Non-visited frames only;
    /// the caller enforces that.
    pub fn insert_mapping(&mut self, mapping: DssMapping) {
        self.ssn_to_dsn_mappings.insert(mapping.ssn_low, mapping);
    }

    /// Finds the mapping covering `[ssn, ssn+seglen)`, if any.
    pub fn lookup(&self, ssn: u32, seglen: u32) -> Option<DssMapping> {
        let end = ssn.wrapping_add(seglen.max(1)).wrapping_sub(1);
        self.ssn_to_dsn_mappings
            .range(..=ssn)
            .next_back()
            .map(|(_, m)| *m)
            .filter(|m| ssn >= m.ssn_low && end <= m.ssn_high)
    }

    pub fn register_dsn_range(&mut self, dsn_low: u64, dsn_high: u64, frame: u64) {
        self.dsn_to_packet_map.insert(dsn_low, (dsn_high, frame));
    }

    /// Finds an overlapping DSN range registered on this subflow, if any.
    fn find_overlap(&self, dsn_low: u64, dsn_high: u64) -> Option<(u64, u64)> {
        self.dsn_to_packet_map
            .range(..=dsn_high)
            .rev()
            .find(|(lo, (hi, _))| *hi >= dsn_low && *lo <= dsn_high)
            .map(|(_, (_, frame))| (*frame, 0))
    }
}

/// Outcome of the reinjection check for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reinjection {
    /// This segment reinjects data originally sent on `original_frame`.
    ReinjectionOf { original_frame: u64 },
    /// This segment's data was later reinjected on another subflow.
    ReinjectedIn { other_frame: u64 },
}

/// One MPTCP connection: two meta flows plus every attached subflow.
#[derive(Debug, Clone)]
pub struct MptcpAnalysis {
    pub stream_id: usize,
    pub meta: [MetaFlow; 2],
    pub subflows: Vec<SubflowId>,
}

/// Owns every `MptcpAnalysis`/`MptcpSubflow` for the engine's lifetime and
/// the token-to-analysis index used to merge subflows sharing a token.
#[derive(Debug, Default)]
pub struct MptcpAnalyzer {
    analyses: Vec<MptcpAnalysis>,
    subflows: Vec<MptcpSubflow>,
    /// Token collisions are last-writer-wins.
    token_index: HashMap<u32, MptcpAnalysisId>,
}

impl MptcpAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analysis(&self, id: MptcpAnalysisId) -> &MptcpAnalysis {
        &self.analyses[id]
    }

    pub fn subflow(&self, id: SubflowId) -> &MptcpSubflow {
        &self.subflows[id]
    }

    pub fn subflow_mut(&mut self, id: SubflowId) -> &mut MptcpSubflow {
        &mut self.subflows[id]
    }

    /// Allocates a fresh, unbound MPTCP connection.
    fn new_analysis(&mut self) -> MptcpAnalysisId {
        let id = self.analyses.len();
        self.analyses.push(MptcpAnalysis {
            stream_id: id,
            meta: [MetaFlow::empty(), MetaFlow::empty()],
            subflows: Vec::new(),
        });
        id
    }

    /// Finds the MPTCP connection for `token`, creating one if this is the
    /// first sighting.
    pub fn find_or_create_by_token(&mut self, token: u32) -> MptcpAnalysisId {
        if let Some(&id) = self.token_index.get(&token) {
            return id;
        }
        let id = self.new_analysis();
        self.token_index.insert(token, id);
        id
    }

    /// Binds a key (from MP_CAPABLE) to one of `analysis`'s two meta slots
    /// and indexes the derived token.
    pub fn bind_key(
        &mut self,
        analysis: MptcpAnalysisId,
        slot: usize,
        key: u64,
        ip: IpAddr,
        port: u16,
    ) {
        let token = crypto::token(key);
        self.analyses[analysis].meta[slot].bind_key(key, ip, port);
        self.token_index.insert(token, analysis);
    }

    /// Allocates a subflow and attaches it to `analysis`.
    pub fn new_subflow(&mut self, analysis: MptcpAnalysisId, is_orig: bool) -> SubflowId {
        let id = self.subflows.len();
        self.subflows.push(MptcpSubflow {
            meta: Some(analysis),
            is_orig,
            ..Default::default()
        });
        self.analyses[analysis].subflows.push(id);
        id
    }

    /// Cross-subflow reinjection detection. Registers `[dsn_low,
    /// dsn_high]` for `subflow` at `frame`, then queries every *other*
    /// subflow of the same connection for an overlap.
    pub fn check_reinjection(
        &mut self,
        analysis: MptcpAnalysisId,
        subflow: SubflowId,
        dsn_low: u64,
        dsn_high: u64,
        frame: u64,
    ) -> Vec<Reinjection> {
        let mut hits = Vec::new();
        let siblings: Vec<SubflowId> = self.analyses[analysis]
            .subflows
            .iter()
            .copied()
            .filter(|s| *s != subflow)
            .collect();
        for sibling in siblings {
            if let Some((other_frame, _)) = self.subflows[sibling].find_overlap(dsn_low, dsn_high)
            {
                if other_frame < frame {
                    hits.push(Reinjection::ReinjectionOf {
                        original_frame: other_frame,
                    });
                } else if other_frame > frame {
                    hits.push(Reinjection::ReinjectedIn {
                        other_frame,
                    });
                }
            }
        }
        self.subflows[subflow].register_dsn_range(dsn_low, dsn_high, frame);
        hits
    }
}

/// Converts a 32-bit raw DSN to its 64-bit extended form using the meta
/// flow's `base_dsn`.
pub fn extend_dsn(raw32: u32, base_dsn: u64) -> u64 {
    (base_dsn & 0xFFFF_FFFF_0000_0000) | (raw32 as u64)
}

/// Truncates a 64-bit DSN to its low 32 bits ("64->32").
pub fn truncate_dsn(dsn: u64) -> u32 {
    dsn as u32
}

/// Converts an absolute DSN to a value relative to `base_dsn`. Requires
/// `has_base_dsn_msb`; otherwise the conversion fails and the raw value
/// should be reported instead.
pub fn relative_dsn(dsn: u64, base_dsn: u64, has_base_dsn_msb: bool) -> Option<u64> {
    if !has_base_dsn_msb {
        return None;
    }
    Some(dsn.wrapping_sub(base_dsn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extend_and_relative_dsn_round_trip() {
        let base = crypto::base_dsn(1);
        let dsn = extend_dsn(5, base);
        assert_eq!(dsn & 0xFFFF_FFFF, 5);
        let rel = relative_dsn(dsn, base, true).unwrap();
        assert_eq!(rel, 5u64.wrapping_sub(base & 0xFFFF_FFFF));
    }

    #[test]
    fn find_or_create_by_token_merges_subflows() {
        let mut az = MptcpAnalyzer::new();
        let a = az.find_or_create_by_token(42);
        let b = az.find_or_create_by_token(42);
        assert_eq!(a, b);
        let c = az.find_or_create_by_token(7);
        assert_ne!(a, c);
    }

    #[test]
    fn subflow_mapping_lookup() {
        let mut az = MptcpAnalyzer::new();
        let analysis = az.find_or_create_by_token(1);
        let sf = az.new_subflow(analysis, true);
        az.subflow_mut(sf).insert_mapping(DssMapping {
            rawdsn: 5,
            ssn_low: 100,
            ssn_high: 199,
            extended_dsn: 5,
            frame: 3,
        });
        assert!(az.subflow(sf).lookup(150, 10).is_some());
        assert!(az.subflow(sf).lookup(500, 10).is_none());
    }

    #[test]
    fn reinjection_detected_across_subflows() {
        let mut az = MptcpAnalyzer::new();
        let analysis = az.find_or_create_by_token(9);
        let sf1 = az.new_subflow(analysis, true);
        let sf2 = az.new_subflow(analysis, false);
        az.check_reinjection(analysis, sf1, 1000, 1099, 10);
        let hits = az.check_reinjection(analysis, sf2, 1000, 1099, 20);
        assert_eq!(
            hits,
            vec![Reinjection::ReinjectionOf { original_frame: 10 }]
        );
    }
}
