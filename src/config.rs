//! Engine configuration.
//!
//! Shaped like `retina_core::config::ConnTrackConfig`: a flat, serde
//! (de)serializable struct with per-field `#[serde(default = ...)]`
//! fallbacks and a `Default` impl. Unlike `retina_core::config::load_config`,
//! this crate never reads a file itself, so the embedding application owns
//! loading the TOML and hands the engine an already-parsed `EngineConfig`.

use serde::{Deserialize, Serialize};

/// Runtime options for the dissection and stream-analysis engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Verify the TCP checksum; on mismatch, disallow reassembly for that
    /// segment. Defaults to `false` (checksums are frequently offloaded and
    /// absent from captures).
    #[serde(default)]
    pub check_checksum: bool,

    /// Enable multisegment-PDU reassembly.
    #[serde(default = "default_true")]
    pub allow_desegment: bool,

    /// Enable out-of-order MSP tracking. Requires `allow_desegment`.
    #[serde(default)]
    pub reassemble_out_of_order: bool,

    /// Enable the sequence analyzer.
    #[serde(default = "default_true")]
    pub analyze_seq: bool,

    /// Present seq/ack relative to `base_seq` instead of raw.
    #[serde(default = "default_true")]
    pub relative_seq: bool,

    /// Window scaling shift to assume when no Window Scale option has been
    /// observed for the direction. `-1` means "unknown" (no scaling
    /// applied); `-2` is reserved for "known not scaled"; valid shifts are
    /// `0..=14`.
    #[serde(default = "default_window_scaling")]
    pub default_window_scaling: i8,

    /// Compute bytes-in-flight on each packet.
    #[serde(default = "default_true")]
    pub track_bytes_in_flight: bool,

    /// Compute `ts_relative`/`ts_delta`.
    #[serde(default = "default_true")]
    pub calculate_ts: bool,

    /// Suppress Timestamps option from the rendered info column.
    #[serde(default)]
    pub ignore_timestamps: bool,

    /// Skip the subdissector hand-off on a retransmission or
    /// out-of-order segment.
    #[serde(default)]
    pub no_subdissector_on_error: bool,

    /// Try heuristic subdissector dispatch before port-based dispatch.
    #[serde(default)]
    pub try_heuristic_first: bool,

    /// Treat experimental option kinds 253/254 as carrying a magic-number
    /// prefix (e.g. TFO's `0xF989`).
    #[serde(default = "default_true")]
    pub exp_options_with_magic: bool,

    /// Enable the MPTCP analyzer.
    #[serde(default)]
    pub analyze_mptcp: bool,

    /// Present DSNs relative to `base_dsn`.
    #[serde(default = "default_true")]
    pub mptcp_relative_seq: bool,

    /// Build the DSS interval tree (SSN -> DSN mappings).
    #[serde(default = "default_true")]
    pub mptcp_analyze_mappings: bool,

    /// Enable cross-subflow reinjection detection.
    #[serde(default)]
    pub mptcp_intersubflows_retransmission: bool,

    /// Upper bound on buffered unacked segments per direction before the
    /// oldest is dropped and `valid_bif` is invalidated.
    #[serde(default = "default_unacked_cap")]
    pub unacked_segments_cap: usize,

    /// Out-of-order classification threshold in milliseconds, used when no
    /// `ts_first_rtt` is yet known for the conversation.
    #[serde(default = "default_ooo_threshold_ms")]
    pub ooo_threshold_ms: f64,

    /// Window within which a retransmission following >=2 reverse dup-acks
    /// is classified as a fast retransmission.
    #[serde(default = "default_fast_retransmission_window_ms")]
    pub fast_retransmission_window_ms: f64,
}

fn default_true() -> bool {
    true
}

fn default_window_scaling() -> i8 {
    -1
}

fn default_unacked_cap() -> usize {
    10_000
}

fn default_ooo_threshold_ms() -> f64 {
    3.0
}

fn default_fast_retransmission_window_ms() -> f64 {
    20.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            check_checksum: false,
            allow_desegment: true,
            reassemble_out_of_order: false,
            analyze_seq: true,
            relative_seq: true,
            default_window_scaling: -1,
            track_bytes_in_flight: true,
            calculate_ts: true,
            ignore_timestamps: false,
            no_subdissector_on_error: false,
            try_heuristic_first: false,
            exp_options_with_magic: true,
            analyze_mptcp: false,
            mptcp_relative_seq: true,
            mptcp_analyze_mappings: true,
            mptcp_intersubflows_retransmission: false,
            unacked_segments_cap: 10_000,
            ooo_threshold_ms: 3.0,
            fast_retransmission_window_ms: 20.0,
        }
    }
}

/// Returns the library's default configuration. For demonstration and test
/// purposes; embedding applications typically deserialize their own.
pub fn default_config() -> EngineConfig {
    EngineConfig::default()
}
