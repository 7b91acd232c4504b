//! Acceptance policy: which advertised networks this daemon will manage.

use std::net::Ipv4Addr;

use crate::ipmap::IpMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Ignore,
}

/// An `IpMap<Policy>` populated from `-A`/`-I` flags, first-definition-wins
/// (later `insert` calls for an already-present key are silently dropped).
/// Defaults to accept-everything when neither flag is given.
#[derive(Debug, Clone)]
pub struct Acceptance {
    map: IpMap<Policy>,
}

impl Acceptance {
    pub fn new() -> Self {
        Self { map: IpMap::new() }
    }

    pub fn add(&mut self, net: Ipv4Addr, prefix_len: u8, policy: Policy) {
        self.map.insert(u32::from(net), prefix_len, policy);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The effective policy for `(net, prefix_len)`: the longest covering
    /// prefix's policy, or [`Policy::Accept`] if nothing was configured at
    /// all (default accept-all).
    pub fn effective(&self, net: Ipv4Addr, prefix_len: u8) -> Policy {
        if self.map.is_empty() {
            return Policy::Accept;
        }
        self.map
            .nearest(u32::from(net), prefix_len)
            .copied()
            .unwrap_or(Policy::Ignore)
    }
}

impl Default for Acceptance {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_accept_all() {
        let a = Acceptance::new();
        assert_eq!(
            a.effective(Ipv4Addr::new(10, 0, 0, 0), 8),
            Policy::Accept
        );
    }

    #[test]
    fn narrower_ignore_overrides_wider_accept() {
        let mut a = Acceptance::new();
        a.add(Ipv4Addr::new(44, 0, 0, 0), 8, Policy::Accept);
        a.add(Ipv4Addr::new(44, 100, 0, 0), 16, Policy::Ignore);

        assert_eq!(a.effective(Ipv4Addr::new(44, 1, 0, 0), 16), Policy::Accept);
        assert_eq!(
            a.effective(Ipv4Addr::new(44, 100, 0, 0), 16),
            Policy::Ignore
        );
    }

    #[test]
    fn uncovered_network_with_explicit_policy_set_is_ignored() {
        let mut a = Acceptance::new();
        a.add(Ipv4Addr::new(44, 0, 0, 0), 8, Policy::Accept);

        assert_eq!(
            a.effective(Ipv4Addr::new(192, 168, 0, 0), 16),
            Policy::Ignore
        );
    }
}
