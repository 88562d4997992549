//! Error types for prefix arithmetic and receivers.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use thiserror::Error;

/// Errors from address range calculations.
#[derive(Debug, Error)]
pub enum RangeError {
    /// A range suffix did not parse as an IPv6 address
    #[error("invalid suffix address {suffix:?}: {source}")]
    SuffixParse {
        suffix: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// Start address sorts after end address
    #[error("start address {start} is greater than end address {end}")]
    RangeInverted { start: Ipv6Addr, end: Ipv6Addr },

    /// An endpoint is not contained by the base prefix
    #[error("address {addr} is outside prefix {prefix}")]
    RangeOutsideParent { addr: Ipv6Addr, prefix: Ipv6Net },
}

/// Errors from subnet calculations.
#[derive(Debug, Error)]
pub enum SubnetError {
    /// The requested subnet is larger than the base prefix
    #[error("subnet prefix length {requested} is shorter than base prefix length {base}")]
    SubnetTooShort { requested: u8, base: u8 },

    /// The requested prefix length exceeds 128
    #[error("subnet prefix length {0} exceeds 128")]
    SubnetLengthInvalid(u8),

    /// The offset places the subnet outside the base prefix
    #[error("subnet {name:?} at offset {offset} is outside base prefix {base}")]
    SubnetOutsideParent {
        name: String,
        offset: u64,
        base: Ipv6Net,
    },

    /// A CIDR string did not parse
    #[error("invalid CIDR {cidr:?}: {source}")]
    PrefixParse {
        cidr: String,
        #[source]
        source: ipnet::AddrParseError,
    },
}

/// Errors from the DHCPv6 wire codec.
#[derive(Debug, Error)]
pub enum Dhcpv6Error {
    #[error("message truncated at {0} bytes")]
    Truncated(usize),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("option {code} truncated: declared {declared} bytes, {remaining} available")]
    OptionTruncated {
        code: u16,
        declared: usize,
        remaining: usize,
    },

    #[error("reply did not contain a matching IA_PD")]
    MissingIaPd,

    #[error("reply did not contain a server identifier")]
    MissingServerId,

    #[error("IA_PD status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("IA_PD did not contain any prefix with a nonzero valid lifetime")]
    NoValidPrefix,
}

/// Errors from receiver lifecycle and socket handling.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("interface {name:?} not found: {reason}")]
    InterfaceNotFound { name: String, reason: String },

    #[error("failed to open {kind} socket on {iface}: {source}")]
    Socket {
        kind: &'static str,
        iface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("socket i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dhcpv6(#[from] Dhcpv6Error),

    #[error("DHCPv6 exchange timed out waiting for {0}")]
    ExchangeTimeout(&'static str),
}

/// Errors from receiver construction.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// Neither DHCPv6-PD nor Router Advertisement acquisition is configured
    #[error("no acquisition method configured")]
    NoAcquisitionConfigured,

    /// An acquisition block is present but names no interface
    #[error("{receiver} interface is required")]
    MissingInterface { receiver: &'static str },
}
