//! The per-advertisement reconciliation algorithm (§4.4), the expiration
//! sweep (§4.5), and tunnel rebase (§4.6).

use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

use tracing::{debug, info};

use crate::error::{FatalError, RejectReason};
use crate::model::{Graph, Route, RouteKey, Tunnel};
use crate::os::{InnerAddrAction, OsAdapter};
use crate::policy::{Acceptance, Policy};
use crate::rip::RipResponse;

/// RIPv2's standard route invalid timer (RFC 2453 §3.8).
pub const ROUTE_TIMEOUT: Duration = Duration::from_secs(180);

pub struct Reconciler<'o, O> {
    pub graph: Graph,
    pub acceptance: Acceptance,
    pub local_outer: Ipv4Addr,
    pub local_inner: Ipv4Addr,
    pub rtable: u32,
    os: &'o O,
    next_ifnum_hint: usize,
}

impl<'o, O: OsAdapter> Reconciler<'o, O> {
    pub fn new(
        graph: Graph,
        acceptance: Acceptance,
        local_outer: Ipv4Addr,
        local_inner: Ipv4Addr,
        rtable: u32,
        os: &'o O,
    ) -> Self {
        Self {
            graph,
            acceptance,
            local_outer,
            local_inner,
            rtable,
            os,
            next_ifnum_hint: 0,
        }
    }

    /// Handles one advertised `(ipaddr, subnetmask, nexthop)`, per the
    /// 9-step algorithm. A rejected advertisement is logged and absorbed;
    /// only a fatal condition propagates to the caller.
    pub fn handle_response(&mut self, resp: RipResponse, now: SystemTime) -> Result<(), FatalError> {
        match self.apply(resp, now) {
            Ok(()) => Ok(()),
            Err(ApplyError::Reject(reason)) => {
                info!(%reason, "rejected advertisement");
                Ok(())
            }
            Err(ApplyError::Fatal(e)) => Err(e),
        }
    }

    fn apply(&mut self, resp: RipResponse, now: SystemTime) -> Result<(), ApplyError> {
        let mask = u32::from(resp.subnet_mask);
        let prefix_len =
            contiguous_mask_len(mask).ok_or(ApplyError::Reject(RejectReason::NonContiguousMask))?;

        // Step 2: normalize.
        let ipnet = Ipv4Addr::from(u32::from(resp.ipaddr) & mask);
        let nexthop = resp.next_hop;

        // Step 3: self-referential gateway.
        if nexthop == self.local_outer {
            return Err(ApplyError::Reject(RejectReason::SelfReferentialGateway));
        }

        // Step 4: gateway inside advertised subnet.
        if (u32::from(nexthop) & mask) == u32::from(ipnet) {
            return Err(ApplyError::Reject(RejectReason::GatewayInsideSubnet));
        }

        // Step 5: acceptance policy.
        if self.acceptance.effective(ipnet, prefix_len) != Policy::Accept {
            return Err(ApplyError::Reject(RejectReason::PolicyIgnored {
                net: ipnet,
                len: prefix_len,
            }));
        }

        // Step 6: tunnel lookup / creation.
        let tunnel_key = nexthop;
        if self.graph.find_tunnel(tunnel_key).is_none() {
            self.create_tunnel(tunnel_key, ipnet)?;
        }

        // Step 7: route lookup.
        let route_key = (ipnet, prefix_len);
        if self.graph.find_route(route_key).is_none() {
            if let Some(cover) = self.graph.routes.nearest(u32::from(ipnet), prefix_len) {
                if cover.tunnel == Some(tunnel_key) {
                    return Ok(());
                }
                info!(net = %ipnet, len = prefix_len, "branching network: narrower route diverges from its cover");
            }
            self.graph.routes.insert(
                u32::from(ipnet),
                prefix_len,
                Route {
                    ipnet,
                    prefix_len,
                    gateway: Ipv4Addr::UNSPECIFIED,
                    expires_at: now,
                    tunnel: None,
                },
            );
        }

        // Step 8: (re)link.
        let current_tunnel = self.graph.find_route(route_key).and_then(|r| r.tunnel);
        if current_tunnel != Some(tunnel_key) {
            self.move_route(route_key, current_tunnel, tunnel_key)?;
        }

        // Step 9: refresh expiration.
        if let Some(route) = self.graph.find_route_mut(route_key) {
            route.expires_at = now + ROUTE_TIMEOUT;
        }

        Ok(())
    }

    fn create_tunnel(&mut self, outer_remote: Ipv4Addr, inner_remote: Ipv4Addr) -> Result<(), FatalError> {
        let ifnum = self.allocate_ifnum();
        let tunnel = Tunnel {
            outer_local: self.local_outer,
            outer_remote,
            inner_local: self.local_inner,
            inner_remote,
            ifname: format!("gif{ifnum}"),
            ifnum,
            routes: Vec::new(),
        };
        self.os.up_tunnel(&tunnel, self.rtable)?;
        self.graph.ifnums.set(ifnum);
        self.graph.tunnels.insert(u32::from(outer_remote), 32, tunnel);
        Ok(())
    }

    fn allocate_ifnum(&mut self) -> usize {
        let n = self.graph.ifnums.next_unset().max(self.next_ifnum_hint);
        self.next_ifnum_hint = n + 1;
        n
    }

    /// Moves `route_key` onto `new_tunnel`, rebasing `old_tunnel` first if
    /// the route being moved is its basis.
    fn move_route(
        &mut self,
        route_key: RouteKey,
        old_tunnel: Option<Ipv4Addr>,
        new_tunnel: Ipv4Addr,
    ) -> Result<(), FatalError> {
        let is_basis = old_tunnel
            .and_then(|k| self.graph.find_tunnel(k))
            .is_some_and(|t| t.inner_remote == route_key.0);

        if let Some(old_key) = old_tunnel {
            if is_basis {
                self.rebase(old_key, route_key)?;
            }
        }

        {
            let tunnel = self
                .graph
                .find_tunnel(new_tunnel)
                .cloned()
                .expect("caller ensures the tunnel exists");
            if old_tunnel.is_none() {
                self.os.add_route(route_key.0, route_key.1, &tunnel, self.rtable)?;
            } else {
                self.os.change_route(route_key.0, route_key.1, &tunnel, self.rtable)?;
            }
        }

        if let Some(old_key) = old_tunnel {
            self.graph.unlink_route(old_key, route_key);
            self.graph.collapse(old_key);
        }
        self.graph.link_route(new_tunnel, route_key);
        Ok(())
    }

    /// Reassigns `tunnel_key`'s basis to another of its routes (§4.6),
    /// because `old_basis` is about to move or be removed.
    fn rebase(&mut self, tunnel_key: Ipv4Addr, old_basis: RouteKey) -> Result<(), FatalError> {
        let tunnel = self
            .graph
            .find_tunnel(tunnel_key)
            .cloned()
            .expect("rebase called with a live tunnel");

        self.os.configure_tunnel_inner(&tunnel, InnerAddrAction::Delete)?;

        if tunnel.nref() <= 1 {
            // Last route: the caller's subsequent unlink+collapse finishes this off.
            return Ok(());
        }

        let new_basis_key = *tunnel
            .routes
            .iter()
            .find(|k| **k != old_basis)
            .expect("nref > 1 guarantees another route exists");

        let mut rebased = tunnel.clone();
        rebased.inner_remote = new_basis_key.0;
        self.os.configure_tunnel_inner(&rebased, InnerAddrAction::Add)?;

        for &key in &tunnel.routes {
            if key == old_basis || key == new_basis_key {
                continue;
            }
            self.os.add_route(key.0, key.1, &rebased, self.rtable)?;
        }

        if let Some(t) = self.graph.find_tunnel_mut(tunnel_key) {
            t.inner_remote = new_basis_key.0;
        }

        Ok(())
    }

    /// Walks every route; anything past its expiration is removed and its
    /// tunnel collapsed if left empty.
    pub fn sweep_expired(&mut self, now: SystemTime) -> Result<(), FatalError> {
        let mut expired = Vec::new();
        self.graph.routes.walk_topdown(|prefix, len, route: &Route| {
            if route.expires_at <= now {
                expired.push((Ipv4Addr::from(prefix), len, route.tunnel));
            }
        });

        for (net, len, tunnel_key) in expired {
            debug!(%net, len, "expiring route");
            self.os.remove_route(net, len, self.rtable)?;
            self.graph.routes.remove(u32::from(net), len);
            if let Some(tunnel_key) = tunnel_key {
                if let Some(tunnel) = self.graph.find_tunnel(tunnel_key) {
                    if tunnel.inner_remote == net && tunnel.nref() > 1 {
                        self.rebase(tunnel_key, (net, len))?;
                    }
                }
                self.graph.unlink_route(tunnel_key, (net, len));
                if let Some(tunnel) = self.graph.find_tunnel(tunnel_key).cloned() {
                    if tunnel.nref() == 0 {
                        self.os.down_tunnel(&tunnel)?;
                        self.graph.collapse(tunnel_key);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Either a rejected advertisement (absorbed by the caller) or a fatal
/// condition that must propagate out of the reconciler entirely.
enum ApplyError {
    Reject(RejectReason),
    Fatal(FatalError),
}

impl From<FatalError> for ApplyError {
    fn from(e: FatalError) -> Self {
        ApplyError::Fatal(e)
    }
}

impl From<crate::os::OsError> for ApplyError {
    fn from(e: crate::os::OsError) -> Self {
        ApplyError::Fatal(FatalError::from(e))
    }
}

/// Returns the prefix length of `mask` if it is a valid contiguous CIDR
/// mask (a run of 1 bits followed by a run of 0 bits), else `None`.
fn contiguous_mask_len(mask: u32) -> Option<u8> {
    let len = mask.leading_ones();
    if mask == (if len == 0 { 0 } else { u32::MAX << (32 - len) }) {
        Some(len as u8)
    } else {
        None
    }
}
