//! Startup bootstrap: rebuild the in-memory graph from whatever the kernel
//! already has configured, then collapse redundant kernel-inserted basis
//! routes (§4.7).

use std::net::Ipv4Addr;
use std::time::SystemTime;

use tracing::info;

use crate::error::FatalError;
use crate::ipmap::IpMap;
use crate::model::{Graph, Route, Tunnel};
use crate::os::{Discovered, OsAdapter};
use crate::policy::{Acceptance, Policy};
use crate::reconciler::ROUTE_TIMEOUT;

/// Rebuilds `graph` from `os.discover(rtable)`. Fatal on any inconsistency
/// between the kernel's state and the acceptance policy, since a daemon
/// that can't trust its starting point can't safely reconcile further.
pub fn discover(os: &impl OsAdapter, acceptance: &Acceptance, rtable: u32, now: SystemTime) -> Result<Graph, FatalError> {
    let mut graph = Graph::new();
    let entries = os.discover(rtable)?;

    for entry in &entries {
        let Discovered::Interface {
            ifname,
            ifnum,
            outer_local,
            outer_remote,
            inner_local,
            inner_remote,
        } = entry
        else {
            continue;
        };

        if acceptance.effective(*inner_remote, 32) != Policy::Accept {
            return Err(FatalError::ForeignRoutingDomain {
                ifname: ifname.clone(),
                expected: rtable,
            });
        }

        graph.ifnums.set(*ifnum);
        graph.tunnels.insert(
            u32::from(*outer_remote),
            32,
            Tunnel {
                outer_local: *outer_local,
                outer_remote: *outer_remote,
                inner_local: *inner_local,
                inner_remote: *inner_remote,
                ifname: ifname.clone(),
                ifnum: *ifnum,
                routes: Vec::new(),
            },
        );
    }

    for entry in &entries {
        let Discovered::Route {
            net,
            prefix_len,
            gateway,
            ifname,
        } = entry
        else {
            continue;
        };

        let tunnel_key = resolve_tunnel(&graph, *gateway, ifname.as_deref());

        let Some(tunnel_key) = tunnel_key else {
            if acceptance.effective(*net, *prefix_len) == Policy::Accept {
                return Err(FatalError::AcceptableNetworkUnmanaged {
                    net: *net,
                    len: *prefix_len,
                });
            }
            continue;
        };

        if acceptance.effective(*net, *prefix_len) != Policy::Accept {
            return Err(FatalError::UnacceptableManagedNetwork {
                outer_remote: tunnel_key,
                net: *net,
                len: *prefix_len,
            });
        }

        if let Some(existing) = graph.find_route((*net, *prefix_len)) {
            if existing.tunnel != Some(tunnel_key) {
                return Err(FatalError::ConflictingDuplicateRoute {
                    net: *net,
                    len: *prefix_len,
                });
            }
            continue;
        }

        graph.routes.insert(
            u32::from(*net),
            *prefix_len,
            Route {
                ipnet: *net,
                prefix_len: *prefix_len,
                gateway: tunnel_key,
                expires_at: now + ROUTE_TIMEOUT,
                tunnel: Some(tunnel_key),
            },
        );
        if let Some(tunnel) = graph.find_tunnel_mut(tunnel_key) {
            tunnel.routes.push((*net, *prefix_len));
        }
    }

    fix_overlaps(&mut graph);
    Ok(graph)
}

fn resolve_tunnel(graph: &Graph, gateway: Option<Ipv4Addr>, ifname: Option<&str>) -> Option<Ipv4Addr> {
    if let Some(gw) = gateway {
        if graph.find_tunnel(gw).is_some() {
            return Some(gw);
        }
    }
    let ifname = ifname?;
    graph
        .tunnels
        .iter()
        .find(|(_, _, t)| t.ifname == ifname)
        .map(|(prefix, _, _)| Ipv4Addr::from(prefix))
}

/// For each tunnel, unlinks any route whose immediate covering route (within
/// that same tunnel) already subsumes it — this collapses the kernel's
/// implicit `/32` basis route once a broader advertised network covers it.
fn fix_overlaps(graph: &mut Graph) {
    let tunnel_keys: Vec<Ipv4Addr> = graph.tunnels.iter().map(|(p, _, _)| Ipv4Addr::from(p)).collect();

    for tunnel_key in tunnel_keys {
        let route_keys = graph.find_tunnel(tunnel_key).unwrap().routes.clone();

        let mut scratch: IpMap<()> = IpMap::new();
        for &(net, len) in &route_keys {
            scratch.insert(u32::from(net), len, ());
        }

        let mut redundant = Vec::new();
        scratch.walk_topdown(|prefix, len, ()| {
            let net = Ipv4Addr::from(prefix);
            if let Some(parent_len) = route_keys
                .iter()
                .filter(|&&(_, l)| l < len)
                .map(|&(_, l)| l)
                .max()
            {
                let parent = route_keys.iter().find(|&&(_, l)| l == parent_len).unwrap();
                let mask = if parent_len == 0 { 0 } else { u32::MAX << (32 - parent_len) };
                if (u32::from(parent.0) & mask) == (u32::from(net) & mask) {
                    redundant.push((net, len));
                }
            }
        });

        for key in redundant {
            info!(net = %key.0, len = key.1, tunnel = %tunnel_key, "collapsing redundant basis route");
            graph.unlink_route(tunnel_key, key);
        }

        if let Some(tunnel) = graph.find_tunnel(tunnel_key) {
            if tunnel.nref() == 0 {
                graph.collapse(tunnel_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{InnerAddrAction, OsError};

    struct FakeOs(Vec<Discovered>);

    impl OsAdapter for FakeOs {
        fn open_listener(&self, _rtable: u32) -> Result<std::net::UdpSocket, OsError> {
            unimplemented!()
        }
        fn up_tunnel(&self, _t: &Tunnel, _rtable: u32) -> Result<(), OsError> {
            Ok(())
        }
        fn down_tunnel(&self, _t: &Tunnel) -> Result<(), OsError> {
            Ok(())
        }
        fn configure_tunnel_inner(&self, _t: &Tunnel, _a: InnerAddrAction) -> Result<(), OsError> {
            Ok(())
        }
        fn add_route(&self, _n: Ipv4Addr, _l: u8, _t: &Tunnel, _rt: u32) -> Result<(), OsError> {
            Ok(())
        }
        fn change_route(&self, _n: Ipv4Addr, _l: u8, _t: &Tunnel, _rt: u32) -> Result<(), OsError> {
            Ok(())
        }
        fn remove_route(&self, _n: Ipv4Addr, _l: u8, _rt: u32) -> Result<(), OsError> {
            Ok(())
        }
        fn discover(&self, _rtable: u32) -> Result<Vec<Discovered>, OsError> {
            Ok(self.0.clone())
        }
    }

    fn addr(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    #[test]
    fn collapses_implicit_host_route_under_explicit_cover() {
        let os = FakeOs(vec![
            Discovered::Interface {
                ifname: "gif0".into(),
                ifnum: 0,
                outer_local: addr(198, 51, 100, 1),
                outer_remote: addr(203, 0, 113, 5),
                inner_local: addr(44, 0, 0, 1),
                inner_remote: addr(44, 3, 0, 5),
            },
            Discovered::Route {
                net: addr(44, 3, 0, 5),
                prefix_len: 32,
                gateway: Some(addr(203, 0, 113, 5)),
                ifname: None,
            },
            Discovered::Route {
                net: addr(44, 3, 0, 0),
                prefix_len: 24,
                gateway: Some(addr(203, 0, 113, 5)),
                ifname: None,
            },
        ]);
        let acceptance = Acceptance::new();

        let graph = discover(&os, &acceptance, 44, SystemTime::UNIX_EPOCH).unwrap();

        let tunnel = graph.find_tunnel(addr(203, 0, 113, 5)).unwrap();
        assert_eq!(tunnel.nref(), 1);
        assert!(graph.find_route((addr(44, 3, 0, 0), 24)).is_some());
        assert!(graph.find_route((addr(44, 3, 0, 5), 32)).is_none());
    }

    #[test]
    fn unacceptable_network_on_managed_tunnel_is_fatal() {
        let os = FakeOs(vec![
            Discovered::Interface {
                ifname: "gif0".into(),
                ifnum: 0,
                outer_local: addr(198, 51, 100, 1),
                outer_remote: addr(203, 0, 113, 5),
                inner_local: addr(44, 0, 0, 1),
                inner_remote: addr(10, 4, 0, 5),
            },
            Discovered::Route {
                net: addr(10, 4, 0, 0),
                prefix_len: 16,
                gateway: Some(addr(203, 0, 113, 5)),
                ifname: None,
            },
        ]);
        let mut acceptance = Acceptance::new();
        // The tunnel's own /32 basis is accepted, but the broader network
        // it also carries is not — this must fail, not silently manage it.
        acceptance.add(addr(10, 4, 0, 0), 16, Policy::Ignore);
        acceptance.add(addr(10, 4, 0, 5), 32, Policy::Accept);

        let result = discover(&os, &acceptance, 44, SystemTime::UNIX_EPOCH);
        assert!(matches!(
            result,
            Err(FatalError::UnacceptableManagedNetwork { .. })
        ));
    }
}
