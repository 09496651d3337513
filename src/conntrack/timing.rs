//! Timing metrics: relative timestamps and initial RTT.

use crate::conntrack::conversation::Conversation;
use crate::packet::header::Flags;

/// Per-segment timing outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timing {
    pub ts_relative: f64,
    pub ts_delta: f64,
    pub ts_first_rtt: Option<f64>,
}

/// Updates `conversation`'s running timestamps and returns this segment's
/// timing record.
pub fn compute(conv: &mut Conversation, now: f64, flags: Flags) -> Timing {
    let ts_relative = now - conv.ts_first;
    let ts_delta = now - conv.ts_prev;
    conv.ts_prev = now;

    if flags == Flags::Syn {
        // Only a pure SYN starts a new handshake clock; the SYN-ACK also
        // carries the SYN bit but must not reset it.
        conv.ts_mru_syn = Some(now);
    }
    if flags == Flags::Ack {
        if let (None, Some(syn_ts)) = (conv.ts_first_rtt, conv.ts_mru_syn) {
            conv.ts_first_rtt = Some(now - syn_ts);
        }
    }

    Timing {
        ts_relative,
        ts_delta,
        ts_first_rtt: conv.ts_first_rtt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::conntrack::conn_id::FiveTuple;
    use crate::conntrack::flow::FlowState;

    fn conv() -> Conversation {
        Conversation {
            stream_id: 0,
            five_tuple: FiveTuple::new(
                "1.2.3.4:1234".parse().unwrap(),
                "5.6.7.8:80".parse().unwrap(),
            ),
            flow1: FlowState::new(10_000),
            flow2: FlowState::new(10_000),
            ts_first: 0.0,
            ts_prev: 0.0,
            ts_mru_syn: None,
            ts_first_rtt: None,
            server_port: None,
            acked_table: Default::default(),
            mptcp_analysis: None,
            last_frame: 0,
        }
    }

    #[test]
    fn three_way_handshake_sets_first_rtt() {
        let mut c = conv();
        c.ts_first = 0.0;
        let t1 = compute(&mut c, 0.000, Flags::Syn);
        assert_eq!(t1.ts_relative, 0.0);
        let _t2 = compute(&mut c, 0.100, Flags::Syn | Flags::Ack);
        let t3 = compute(&mut c, 0.150, Flags::Ack);
        assert_eq!(t3.ts_first_rtt, Some(0.150));
    }
}
