//! ICMPv6 Router Advertisement parsing.
//!
//! Just enough NDP to observe delegated prefixes: the Router Advertisement
//! header and its Prefix Information options. Everything else on the wire is
//! ignored.

use std::net::Ipv6Addr;
use std::time::Duration;

/// ICMPv6 type of a Router Advertisement.
pub const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;

const OPTION_PREFIX_INFORMATION: u8 = 3;

/// A Prefix Information option from a Router Advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixInformation {
    /// Advertised prefix length in bits
    pub prefix_length: u8,

    /// L flag: the prefix is on-link
    pub on_link: bool,

    /// A flag: the prefix may be used for SLAAC
    pub autonomous: bool,

    /// Valid lifetime
    pub valid_lifetime: Duration,

    /// Preferred lifetime
    pub preferred_lifetime: Duration,

    /// The advertised prefix
    pub prefix: Ipv6Addr,
}

/// A parsed Router Advertisement, reduced to its prefix options.
#[derive(Debug, Clone, Default)]
pub struct RouterAdvertisement {
    /// Prefix Information options, in wire order
    pub prefixes: Vec<PrefixInformation>,
}

/// Parse an ICMPv6 message as a Router Advertisement.
///
/// Returns `None` for anything that is not a well-formed RA; the receive
/// loop treats that as unrelated traffic, not an error.
pub fn parse_router_advertisement(data: &[u8]) -> Option<RouterAdvertisement> {
    // RA header: type(1) code(1) checksum(2) hop-limit(1) flags(1)
    // router-lifetime(2) reachable-time(4) retrans-timer(4)
    if data.len() < 16 {
        return None;
    }
    if data[0] != ICMPV6_ROUTER_ADVERTISEMENT || data[1] != 0 {
        return None;
    }

    let mut ra = RouterAdvertisement::default();
    let mut options = &data[16..];

    while options.len() >= 2 {
        let opt_type = options[0];
        let opt_len = options[1] as usize * 8;
        if opt_len == 0 || options.len() < opt_len {
            // Malformed option; stop parsing but keep what we have.
            break;
        }

        if opt_type == OPTION_PREFIX_INFORMATION && opt_len >= 32 {
            let opt = &options[..32];
            let mut prefix_octets = [0u8; 16];
            prefix_octets.copy_from_slice(&opt[16..32]);

            ra.prefixes.push(PrefixInformation {
                prefix_length: opt[2],
                on_link: opt[3] & 0x80 != 0,
                autonomous: opt[3] & 0x40 != 0,
                valid_lifetime: lifetime(&opt[4..8]),
                preferred_lifetime: lifetime(&opt[8..12]),
                prefix: Ipv6Addr::from(prefix_octets),
            });
        }

        options = &options[opt_len..];
    }

    Some(ra)
}

fn lifetime(bytes: &[u8]) -> Duration {
    let secs = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Duration::from_secs(u64::from(secs))
}

/// Whether the address is a Global Unicast Address (2000::/3).
pub fn is_global_unicast(addr: Ipv6Addr) -> bool {
    (addr.octets()[0] & 0xE0) == 0x20
}

/// Whether the address is a Unique Local Address (fc00::/7).
pub fn is_unique_local(addr: Ipv6Addr) -> bool {
    (addr.octets()[0] & 0xFE) == 0xFC
}
