//! The boundary between the reconciler and the kernel. [`OsAdapter`] is the
//! only way the core touches tunnels or routes; a fake implementation lets
//! the reconciler be exercised deterministically in tests.

pub mod linux;

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::model::Tunnel;
use crate::rip::RipResponse;

#[derive(Debug, Error)]
pub enum OsError {
    #[error("interface {0} not found")]
    LinkNotFound(String),
    #[error("no free tunnel interface numbers remain")]
    NoFreeInterface,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("rtnetlink: {0}")]
    RtNetlink(#[from] rtnetlink::Error),
    #[error("ffi: {0}")]
    Nul(#[from] std::ffi::NulError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerAddrAction {
    Add,
    Delete,
}

/// A kernel interface or route surfaced during startup discovery, before
/// it has been matched against the in-memory graph.
#[derive(Debug, Clone)]
pub enum Discovered {
    Interface {
        ifname: String,
        ifnum: usize,
        outer_local: Ipv4Addr,
        outer_remote: Ipv4Addr,
        inner_local: Ipv4Addr,
        inner_remote: Ipv4Addr,
    },
    Route {
        net: Ipv4Addr,
        prefix_len: u8,
        /// `Some` when the kernel reported a numeric gateway directly.
        gateway: Option<Ipv4Addr>,
        /// `Some` when the kernel reported only a link-layer interface name.
        ifname: Option<String>,
    },
}

/// Everything the reconciler needs from the operating system. Blocking:
/// every method runs to completion before returning, matching the rest of
/// the daemon's single-threaded design.
pub trait OsAdapter {
    /// Binds and joins the RIP multicast group on `rtable`.
    fn open_listener(&self, rtable: u32) -> Result<std::net::UdpSocket, OsError>;

    /// Brings up a new tunnel interface and sets its outer addresses.
    fn up_tunnel(&self, tunnel: &Tunnel, rtable: u32) -> Result<(), OsError>;

    /// Destroys a tunnel interface.
    fn down_tunnel(&self, tunnel: &Tunnel) -> Result<(), OsError>;

    /// Adds or removes the tunnel's inner source/destination addresses.
    /// Adding implicitly installs a kernel `/32` route to `inner_remote`;
    /// deleting implicitly removes every route through the tunnel.
    fn configure_tunnel_inner(&self, tunnel: &Tunnel, action: InnerAddrAction) -> Result<(), OsError>;

    fn add_route(&self, net: Ipv4Addr, prefix_len: u8, tunnel: &Tunnel, rtable: u32) -> Result<(), OsError>;

    /// Must internally fall back to delete-then-add when the kernel reports
    /// no existing entry to change.
    fn change_route(&self, net: Ipv4Addr, prefix_len: u8, tunnel: &Tunnel, rtable: u32) -> Result<(), OsError>;

    /// Must swallow a "no such entry" response.
    fn remove_route(&self, net: Ipv4Addr, prefix_len: u8, rtable: u32) -> Result<(), OsError>;

    /// Enumerates tunnel-prefixed interfaces and routes in `rtable`.
    fn discover(&self, rtable: u32) -> Result<Vec<Discovered>, OsError>;
}

/// Blocking source of authenticated RIP responses: either the real
/// multicast socket or a deterministic file-replay source for tests.
pub trait Listener {
    /// Blocks until one datagram's worth of responses is available, or
    /// returns `Ok(None)` at a clean end of input (file-replay EOF only;
    /// the live socket never returns `None`).
    fn next_batch(&mut self) -> std::io::Result<Option<Vec<RipResponse>>>;
}
