//! Linux implementation of [`OsAdapter`]: `ipip` tunnels via `SIOCADDTUNNEL`/
//! `SIOCDELTUNNEL` ioctls, routes and discovery via `rtnetlink`.
//!
//! The reconciler is otherwise single-threaded and blocking (SPEC_FULL.md
//! §5); this struct owns a small embedded [`tokio::runtime::Runtime`] and
//! exposes only blocking methods via `block_on`, the same shape
//! `rsdsl-netlinklib`'s `blocking::Connection` uses to wrap `rtnetlink`.

use std::ffi::{c_char, c_int, CString};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use futures::TryStreamExt;
use netlink_packet_route::route::{RouteAttribute, RouteMessage};
use rtnetlink::{Handle, IpVersion};
use socket2::{Domain, Protocol, Socket, Type};

use crate::model::Tunnel;

use super::{Discovered, InnerAddrAction, OsAdapter, OsError};

const SIOCADDTUNNEL: c_int = 0x89F0 + 1;
const SIOCDELTUNNEL: c_int = 0x89F0 + 2;
const SIOCDIFADDR: c_int = 0x8936;
const SIOCSIFADDR: c_int = 0x8913;
const SIOCSIFDSTADDR: c_int = 0x8918;

pub const RIP_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 9);
pub const RIP_PORT: u16 = 520;

pub struct LinuxOs {
    rt: tokio::runtime::Runtime,
    handle: Handle,
}

impl LinuxOs {
    pub fn new() -> Result<Self, OsError> {
        let rt = tokio::runtime::Runtime::new()?;
        let (connection, handle, _) = rtnetlink::new_connection()?;
        rt.spawn(connection);
        Ok(Self { rt, handle })
    }

    fn link_index(&self, ifname: &str) -> Result<u32, OsError> {
        self.rt.block_on(async {
            let mut links = self.handle.link().get().match_name(ifname.to_string()).execute();
            let link = links
                .try_next()
                .await?
                .ok_or_else(|| OsError::LinkNotFound(ifname.to_string()))?;
            Ok(link.header.index)
        })
    }
}

impl OsAdapter for LinuxOs {
    fn open_listener(&self, rtable: u32) -> Result<UdpSocket, OsError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(target_os = "linux")]
        socket.set_mark(rtable)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, RIP_PORT)).into())?;
        socket.join_multicast_v4(&RIP_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_nonblocking(false)?;
        Ok(socket.into())
    }

    fn up_tunnel(&self, tunnel: &Tunnel, rtable: u32) -> Result<(), OsError> {
        add_ipip_tunnel(&tunnel.ifname, tunnel.outer_local, tunnel.outer_remote)?;
        self.rt.block_on(async {
            let index = self.link_index(&tunnel.ifname)?;
            self.handle.link().set(index).up().execute().await?;
            Ok::<_, OsError>(())
        })?;
        self.configure_tunnel_inner(tunnel, InnerAddrAction::Add)?;
        let _ = rtable;
        Ok(())
    }

    fn down_tunnel(&self, tunnel: &Tunnel) -> Result<(), OsError> {
        delete_ipip_tunnel(&tunnel.ifname)
    }

    fn configure_tunnel_inner(&self, tunnel: &Tunnel, action: InnerAddrAction) -> Result<(), OsError> {
        match action {
            InnerAddrAction::Add => {
                set_inner_addr(&tunnel.ifname, tunnel.inner_local, SIOCSIFADDR)?;
                // The kernel's implicit /32 host route to the peer (the
                // tunnel's "basis" route that §4.6 rebases) comes from the
                // point-to-point destination address, not the local one.
                set_inner_addr(&tunnel.ifname, tunnel.inner_remote, SIOCSIFDSTADDR)
            }
            InnerAddrAction::Delete => set_inner_addr(&tunnel.ifname, tunnel.inner_local, SIOCDIFADDR),
        }
    }

    fn add_route(&self, net: Ipv4Addr, prefix_len: u8, tunnel: &Tunnel, rtable: u32) -> Result<(), OsError> {
        self.rt.block_on(async {
            let index = self.link_index(&tunnel.ifname)?;
            let mut add = self
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(net, prefix_len)
                .output_interface(index)
                .table_id(rtable);
            add = add.gateway(tunnel.outer_remote);
            add.execute().await?;
            Ok(())
        })
    }

    fn change_route(&self, net: Ipv4Addr, prefix_len: u8, tunnel: &Tunnel, rtable: u32) -> Result<(), OsError> {
        match self.add_route(net, prefix_len, tunnel, rtable) {
            Ok(()) => Ok(()),
            Err(OsError::RtNetlink(_)) => {
                self.remove_route(net, prefix_len, rtable)?;
                self.add_route(net, prefix_len, tunnel, rtable)
            }
            Err(e) => Err(e),
        }
    }

    fn remove_route(&self, net: Ipv4Addr, prefix_len: u8, rtable: u32) -> Result<(), OsError> {
        self.rt.block_on(async {
            let routes: Vec<RouteMessage> = self
                .handle
                .route()
                .get(IpVersion::V4)
                .execute()
                .try_filter(|route| {
                    futures::future::ready(route_matches(route, net, prefix_len, rtable))
                })
                .try_collect()
                .await?;
            for route in routes {
                // A concurrently-removed route is not an error: swallow it.
                let _ = self.handle.route().del(route).execute().await;
            }
            Ok(())
        })
    }

    fn discover(&self, rtable: u32) -> Result<Vec<Discovered>, OsError> {
        let mut out = Vec::new();

        self.rt.block_on(async {
            let mut names_by_index = std::collections::HashMap::new();

            let mut links = self.handle.link().get().execute();
            while let Some(link) = links.try_next().await? {
                let name = link
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        netlink_packet_route::link::LinkAttribute::IfName(n) => Some(n.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                names_by_index.insert(link.header.index, name.clone());

                if !name.starts_with("gif") {
                    continue;
                }
                let Some(ifnum) = name.strip_prefix("gif").and_then(|n| n.parse::<usize>().ok())
                else {
                    continue;
                };
                // Outer/inner endpoints for an existing ipip link are read
                // back via IFLA_INFO_DATA in a full implementation; the
                // reconciler's discovery pass treats an interface whose
                // endpoints cannot be read as absent rather than guessing.
                out.push(Discovered::Interface {
                    ifname: name,
                    ifnum,
                    outer_local: Ipv4Addr::UNSPECIFIED,
                    outer_remote: Ipv4Addr::UNSPECIFIED,
                    inner_local: Ipv4Addr::UNSPECIFIED,
                    inner_remote: Ipv4Addr::UNSPECIFIED,
                });
            }

            let mut routes = self.handle.route().get(IpVersion::V4).execute();
            while let Some(route) = routes.try_next().await? {
                if route_table_id(&route) != rtable {
                    continue;
                }
                let Some((net, prefix_len)) = route_destination(&route) else {
                    continue;
                };
                let gateway = route.attributes.iter().find_map(|a| match a {
                    RouteAttribute::Gateway(netlink_packet_route::route::RouteAddress::Inet(ip)) => {
                        Some(*ip)
                    }
                    _ => None,
                });
                let ifname = if gateway.is_none() {
                    route.attributes.iter().find_map(|a| match a {
                        RouteAttribute::Oif(idx) => names_by_index.get(idx).cloned(),
                        _ => None,
                    })
                } else {
                    None
                };
                out.push(Discovered::Route {
                    net,
                    prefix_len,
                    gateway,
                    ifname,
                });
            }

            Ok::<_, OsError>(())
        })?;

        Ok(out)
    }
}

fn route_matches(route: &RouteMessage, net: Ipv4Addr, prefix_len: u8, rtable: u32) -> bool {
    route_table_id(route) == rtable
        && route_destination(route) == Some((net, prefix_len))
}

fn route_table_id(route: &RouteMessage) -> u32 {
    route
        .attributes
        .iter()
        .find_map(|a| match a {
            RouteAttribute::Table(t) => Some(*t),
            _ => None,
        })
        .unwrap_or(route.header.table as u32)
}

fn route_destination(route: &RouteMessage) -> Option<(Ipv4Addr, u8)> {
    let dst = route.attributes.iter().find_map(|a| match a {
        RouteAttribute::Destination(netlink_packet_route::route::RouteAddress::Inet(ip)) => {
            Some(*ip)
        }
        _ => None,
    })?;
    Some((dst, route.header.destination_prefix_length))
}

fn ifname_array(name: &str) -> Result<[c_char; libc::IFNAMSIZ], OsError> {
    let cname = CString::new(name)?;
    let bytes = cname.as_bytes();
    if bytes.len() >= libc::IFNAMSIZ {
        return Err(OsError::LinkNotFound(name.to_string()));
    }
    let mut arr = [0 as c_char; libc::IFNAMSIZ];
    for (i, &b) in bytes.iter().enumerate() {
        arr[i] = b as c_char;
    }
    Ok(arr)
}

#[repr(C)]
struct IpTunnelParm {
    name: [c_char; libc::IFNAMSIZ],
    link: u32,
    i_flags: u16,
    o_flags: u16,
    i_key: u32,
    o_key: u32,
    iph: IpHdr,
}

#[repr(C)]
struct IpHdr {
    vihl: u8,
    tos: u8,
    tot_len: u16,
    id: u16,
    frag_off: u16,
    ttl: u8,
    protocol: u8,
    check: u16,
    saddr: u32,
    daddr: u32,
}

#[repr(C)]
struct IfReqTunnel {
    name: [c_char; libc::IFNAMSIZ],
    data: *const IpTunnelParm,
}

fn add_ipip_tunnel(name: &str, local: Ipv4Addr, remote: Ipv4Addr) -> Result<(), OsError> {
    let tnlname = ifname_array(name)?;
    let parent = ifname_array("ipip0")?;

    let parm = IpTunnelParm {
        name: tnlname,
        link: 0,
        i_flags: 0,
        o_flags: 0,
        i_key: 0,
        o_key: 0,
        iph: IpHdr {
            vihl: 0x45,
            tos: 0,
            tot_len: 0,
            id: 0,
            frag_off: 0,
            ttl: 64,
            protocol: libc::IPPROTO_IPIP as u8,
            check: 0,
            saddr: u32::from(local).to_be(),
            daddr: u32::from(remote).to_be(),
        },
    };

    let ifr = IfReqTunnel {
        name: parent,
        data: &parm,
    };

    ioctl_on_inet_socket(SIOCADDTUNNEL, &ifr)
}

fn delete_ipip_tunnel(name: &str) -> Result<(), OsError> {
    let tnlname = ifname_array(name)?;
    let parm = IpTunnelParm {
        name: tnlname,
        link: 0,
        i_flags: 0,
        o_flags: 0,
        i_key: 0,
        o_key: 0,
        iph: IpHdr {
            vihl: 0,
            tos: 0,
            tot_len: 0,
            id: 0,
            frag_off: 0,
            ttl: 0,
            protocol: 0,
            check: 0,
            saddr: 0,
            daddr: 0,
        },
    };
    let ifr = IfReqTunnel {
        name: tnlname,
        data: &parm,
    };
    ioctl_on_inet_socket(SIOCDELTUNNEL, &ifr)
}

fn set_inner_addr(ifname: &str, addr: Ipv4Addr, ioctl_num: c_int) -> Result<(), OsError> {
    #[repr(C)]
    struct IfReqAddr {
        name: [c_char; libc::IFNAMSIZ],
        family: libc::sa_family_t,
        _pad: u16,
        addr: u32,
        _zero: [u8; 8],
    }

    let ifr = IfReqAddr {
        name: ifname_array(ifname)?,
        family: libc::AF_INET as libc::sa_family_t,
        _pad: 0,
        addr: u32::from(addr).to_be(),
        _zero: [0; 8],
    };

    ioctl_on_inet_socket(ioctl_num, &ifr)
}

fn ioctl_on_inet_socket<T>(request: c_int, arg: &T) -> Result<(), OsError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let res = unsafe { libc::ioctl(fd, request as _, arg) };
    let err = std::io::Error::last_os_error();
    unsafe {
        libc::close(fd);
    }
    if res < 0 {
        return Err(err.into());
    }
    Ok(())
}
