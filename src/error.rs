//! Error taxonomy.
//!
//! [`FatalError`] covers conditions that leave the daemon unable to trust
//! its own state; it propagates with `?` up to `main`, which logs it and
//! exits non-zero. [`RejectReason`] covers a single malformed or
//! policy-rejected packet/response entry: it is logged at `info`/`debug`
//! and the loop continues.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("duplicate route {net}/{len} discovered with conflicting attributes")]
    ConflictingDuplicateRoute { net: Ipv4Addr, len: u8 },

    #[error("managed tunnel to {outer_remote} carries unacceptable network {net}/{len}")]
    UnacceptableManagedNetwork {
        outer_remote: Ipv4Addr,
        net: Ipv4Addr,
        len: u8,
    },

    #[error("acceptable network {net}/{len} is routed to an unmanaged destination")]
    AcceptableNetworkUnmanaged { net: Ipv4Addr, len: u8 },

    #[error("discovered interface {ifname} does not belong to routing domain {expected}")]
    ForeignRoutingDomain { ifname: String, expected: u32 },

    #[error("kernel operation failed: {0}")]
    Os(#[from] crate::os::OsError),

    #[error("invalid CLI argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MalformedPacket(String),
    AuthenticationFailed,
    PolicyIgnored { net: Ipv4Addr, len: u8 },
    SelfReferentialGateway,
    GatewayInsideSubnet,
    ZeroNextHop,
    NonContiguousMask,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MalformedPacket(why) => write!(f, "malformed packet: {why}"),
            RejectReason::AuthenticationFailed => write!(f, "authentication failed"),
            RejectReason::PolicyIgnored { net, len } => {
                write!(f, "policy ignores {net}/{len}")
            }
            RejectReason::SelfReferentialGateway => write!(f, "next hop is our own address"),
            RejectReason::GatewayInsideSubnet => {
                write!(f, "next hop lies inside the advertised subnet")
            }
            RejectReason::ZeroNextHop => write!(f, "response entry has a zero next hop"),
            RejectReason::NonContiguousMask => write!(f, "subnet mask is not a contiguous prefix"),
        }
    }
}
