//! Connection identifiers.
//!
//! Grounded on `retina_core::conntrack::conn_id`: a directional [`FiveTuple`]
//! (first-seen sender is `orig`) plus an order-independent [`ConnId`] used to
//! key the conversation table.

use std::cmp;
use std::fmt;
use std::net::SocketAddr;

/// Connection 5-tuple. The sender of the first observed segment becomes the
/// originator `orig`; the other endpoint is `resp`.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct FiveTuple {
    pub orig: SocketAddr,
    pub resp: SocketAddr,
}

impl FiveTuple {
    pub fn new(orig: SocketAddr, resp: SocketAddr) -> Self {
        FiveTuple { orig, resp }
    }

    /// Converts to the order-independent identifier used for table lookups.
    pub fn conn_id(&self) -> ConnId {
        ConnId::new(self.orig, self.resp)
    }

    /// True when `addr` is the originator of this 5-tuple.
    pub fn is_orig(&self, addr: SocketAddr) -> bool {
        addr == self.orig
    }

    pub fn reversed(&self) -> FiveTuple {
        FiveTuple {
            orig: self.resp,
            resp: self.orig,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.orig, self.resp)
    }
}

/// Generic connection identifier, independent of which endpoint sent first.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConnId(SocketAddr, SocketAddr);

impl ConnId {
    pub(super) fn new(a: SocketAddr, b: SocketAddr) -> Self {
        ConnId(cmp::max(a, b), cmp::min(a, b))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <> {}", self.0, self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn conn_id_is_order_independent() {
        let a = addr(1000);
        let b = addr(80);
        assert_eq!(ConnId::new(a, b), ConnId::new(b, a));
    }

    #[test]
    fn five_tuple_tracks_orig_resp() {
        let ft = FiveTuple::new(addr(1000), addr(80));
        assert!(ft.is_orig(addr(1000)));
        assert!(!ft.is_orig(addr(80)));
        assert_eq!(ft.reversed().orig, addr(80));
    }
}
