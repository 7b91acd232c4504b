//! The `Tunnel`/`Route` graph and the operations that keep its
//! reference-count and ownership invariants intact.
//!
//! `Route` lives exclusively in [`Graph::routes`]; a tunnel's `routes` field
//! is a non-owning index of lookup keys, and a route's `tunnel` field is a
//! non-owning key back into [`Graph::tunnels`]. This keeps both maps simple
//! owners instead of sharing `Route`/`Tunnel` through reference counting.

use std::net::Ipv4Addr;
use std::time::SystemTime;

use crate::bitvec::Bitvec;
use crate::ipmap::IpMap;

/// Lookup key for a route: its destination network and prefix length.
pub type RouteKey = (Ipv4Addr, u8);

#[derive(Debug, Clone)]
pub struct Route {
    pub ipnet: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub expires_at: SystemTime,
    /// Non-owning key into [`Graph::tunnels`] (the tunnel's `outer_remote`).
    pub tunnel: Option<Ipv4Addr>,
}

#[derive(Debug, Clone)]
pub struct Tunnel {
    pub outer_local: Ipv4Addr,
    pub outer_remote: Ipv4Addr,
    pub inner_local: Ipv4Addr,
    pub inner_remote: Ipv4Addr,
    pub ifname: String,
    pub ifnum: usize,
    /// Non-owning keys into [`Graph::routes`].
    pub routes: Vec<RouteKey>,
}

impl Tunnel {
    pub fn nref(&self) -> usize {
        self.routes.len()
    }
}

/// The mutable state a reconciler thread operates on: tunnels, routes, the
/// free-interface-number bookkeeping, and the acceptance policy all travel
/// together so every operation in this module has exactly the context it
/// needs and nothing is module-level global state.
#[derive(Debug, Default)]
pub struct Graph {
    pub tunnels: IpMap<Tunnel>,
    pub routes: IpMap<Route>,
    pub ifnums: Bitvec,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_tunnel(&self, outer_remote: Ipv4Addr) -> Option<&Tunnel> {
        self.tunnels.find(u32::from(outer_remote), 32)
    }

    pub fn find_tunnel_mut(&mut self, outer_remote: Ipv4Addr) -> Option<&mut Tunnel> {
        self.tunnels.find_mut(u32::from(outer_remote), 32)
    }

    pub fn find_route(&self, key: RouteKey) -> Option<&Route> {
        self.routes.find(u32::from(key.0), key.1)
    }

    pub fn find_route_mut(&mut self, key: RouteKey) -> Option<&mut Route> {
        self.routes.find_mut(u32::from(key.0), key.1)
    }

    /// Links `route_key` into `tunnel_key`'s route list and sets the route's
    /// back-reference and gateway. The route must currently be unlinked.
    pub fn link_route(&mut self, tunnel_key: Ipv4Addr, route_key: RouteKey) {
        let Some(tunnel) = self.find_tunnel_mut(tunnel_key) else {
            return;
        };
        let gateway = tunnel.outer_remote;
        if !tunnel.routes.contains(&route_key) {
            tunnel.routes.push(route_key);
        }
        if let Some(route) = self.find_route_mut(route_key) {
            route.tunnel = Some(tunnel_key);
            route.gateway = gateway;
        }
    }

    /// Unlinks `route_key` from `tunnel_key`'s route list and zeroes the
    /// route's gateway. Idempotent: a no-op if either side is already
    /// unlinked. Deliberately leaves `route.tunnel` set so the caller can
    /// still see which tunnel to [`Graph::collapse`] afterwards.
    pub fn unlink_route(&mut self, tunnel_key: Ipv4Addr, route_key: RouteKey) {
        if let Some(tunnel) = self.find_tunnel_mut(tunnel_key) {
            tunnel.routes.retain(|k| *k != route_key);
        }
        if let Some(route) = self.find_route_mut(route_key) {
            route.gateway = Ipv4Addr::UNSPECIFIED;
        }
    }

    /// Removes a tunnel with zero references from the index. The caller is
    /// responsible for having already told the OS adapter to tear it down.
    pub fn collapse(&mut self, tunnel_key: Ipv4Addr) -> Option<Tunnel> {
        let nref = self.find_tunnel(tunnel_key)?.nref();
        if nref != 0 {
            return None;
        }
        let tunnel = self.tunnels.remove(u32::from(tunnel_key), 32)?;
        self.ifnums.clear(tunnel.ifnum);
        Some(tunnel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    fn sample_tunnel(outer_remote: Ipv4Addr, ifnum: usize) -> Tunnel {
        Tunnel {
            outer_local: addr(198, 51, 100, 1),
            outer_remote,
            inner_local: addr(44, 0, 0, 1),
            inner_remote: addr(44, 1, 0, 0),
            ifname: format!("gif{ifnum}"),
            ifnum,
            routes: Vec::new(),
        }
    }

    fn sample_route(ipnet: Ipv4Addr, prefix_len: u8) -> Route {
        Route {
            ipnet,
            prefix_len,
            gateway: Ipv4Addr::UNSPECIFIED,
            expires_at: SystemTime::UNIX_EPOCH,
            tunnel: None,
        }
    }

    #[test]
    fn link_sets_gateway_and_back_reference() {
        let mut g = Graph::new();
        let peer = addr(203, 0, 113, 5);
        g.ifnums.set(0);
        g.tunnels.insert(u32::from(peer), 32, sample_tunnel(peer, 0));
        let route_key = (addr(10, 1, 0, 0), 16);
        g.routes
            .insert(u32::from(route_key.0), route_key.1, sample_route(route_key.0, route_key.1));

        g.link_route(peer, route_key);

        let route = g.find_route(route_key).unwrap();
        assert_eq!(route.tunnel, Some(peer));
        assert_eq!(route.gateway, peer);
        assert_eq!(g.find_tunnel(peer).unwrap().nref(), 1);
    }

    #[test]
    fn unlink_then_collapse_removes_empty_tunnel() {
        let mut g = Graph::new();
        let peer = addr(203, 0, 113, 5);
        g.ifnums.set(0);
        g.tunnels.insert(u32::from(peer), 32, sample_tunnel(peer, 0));
        let route_key = (addr(10, 1, 0, 0), 16);
        g.routes
            .insert(u32::from(route_key.0), route_key.1, sample_route(route_key.0, route_key.1));
        g.link_route(peer, route_key);

        g.unlink_route(peer, route_key);
        assert_eq!(g.find_tunnel(peer).unwrap().nref(), 0);

        let collapsed = g.collapse(peer);
        assert!(collapsed.is_some());
        assert!(g.find_tunnel(peer).is_none());
        assert!(!g.ifnums.get(0));
    }

    #[test]
    fn collapse_is_noop_while_referenced() {
        let mut g = Graph::new();
        let peer = addr(203, 0, 113, 5);
        g.ifnums.set(0);
        g.tunnels.insert(u32::from(peer), 32, sample_tunnel(peer, 0));
        let route_key = (addr(10, 1, 0, 0), 16);
        g.routes
            .insert(u32::from(route_key.0), route_key.1, sample_route(route_key.0, route_key.1));
        g.link_route(peer, route_key);

        assert!(g.collapse(peer).is_none());
        assert!(g.find_tunnel(peer).is_some());
    }
}
