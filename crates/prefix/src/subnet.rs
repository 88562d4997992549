//! Subnet carving from a delegated prefix.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;

use crate::error::SubnetError;

/// A subnet to be carved from a base prefix.
#[derive(Debug, Clone)]
pub struct SubnetConfig {
    /// Identifier of this subnet
    pub name: String,

    /// Which Nth sibling subnet of the target size to select, counted from
    /// the base network address. With a /48 base and /64 target, offset 0 is
    /// the first /64, offset 1 the second, and so on.
    pub offset: u64,

    /// Desired prefix length of the subnet
    pub prefix_length: u8,
}

/// A calculated subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    /// Identifier of this subnet
    pub name: String,

    /// The subnet in CIDR notation
    pub cidr: Ipv6Net,
}

/// Calculate all configured subnets against a base prefix.
pub fn calculate_subnets(
    base: Ipv6Net,
    configs: &[SubnetConfig],
) -> Result<Vec<Subnet>, SubnetError> {
    configs
        .iter()
        .map(|cfg| calculate_subnet(base, cfg))
        .collect()
}

/// Calculate a single subnet against a base prefix.
///
/// The offset is interpreted in units of the target subnet size
/// (`2^(128 - prefix_length)` addresses) measured from the base network
/// address; the arithmetic is exact 128-bit integer addition.
pub fn calculate_subnet(base: Ipv6Net, cfg: &SubnetConfig) -> Result<Subnet, SubnetError> {
    if cfg.prefix_length > 128 {
        return Err(SubnetError::SubnetLengthInvalid(cfg.prefix_length));
    }
    if cfg.prefix_length < base.prefix_len() {
        return Err(SubnetError::SubnetTooShort {
            requested: cfg.prefix_length,
            base: base.prefix_len(),
        });
    }

    let outside = || SubnetError::SubnetOutsideParent {
        name: cfg.name.clone(),
        offset: cfg.offset,
        base,
    };

    let host_bits = 128 - u32::from(cfg.prefix_length);
    // A /0 target has no sibling subnets; only offset 0 stays in range.
    let delta = match 1u128.checked_shl(host_bits) {
        Some(subnet_size) => subnet_size
            .checked_mul(u128::from(cfg.offset))
            .ok_or_else(outside)?,
        None if cfg.offset == 0 => 0,
        None => return Err(outside()),
    };

    let base_int = u128::from(base.network());
    let subnet_int = base_int.checked_add(delta).ok_or_else(outside)?;

    let addr = Ipv6Addr::from(subnet_int);
    let cidr = Ipv6Net::new(addr, cfg.prefix_length)
        .map_err(|_| SubnetError::SubnetLengthInvalid(cfg.prefix_length))?
        .trunc();

    if !base.contains(&cidr.network()) {
        return Err(outside());
    }

    Ok(Subnet {
        name: cfg.name.clone(),
        cidr,
    })
}

/// Parse a CIDR string, normalized to its network address.
pub fn parse_prefix(cidr: &str) -> Result<Ipv6Net, SubnetError> {
    let prefix: Ipv6Net = cidr.parse().map_err(|source| SubnetError::PrefixParse {
        cidr: cidr.to_string(),
        source,
    })?;
    Ok(prefix.trunc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    fn cfg(name: &str, offset: u64, prefix_length: u8) -> SubnetConfig {
        SubnetConfig {
            name: name.to_string(),
            offset,
            prefix_length,
        }
    }

    #[test]
    fn carves_sibling_64s_from_a_48() {
        let base = net("2001:db8:cafe::/48");
        let subnets = calculate_subnets(
            base,
            &[
                cfg("services", 0, 64),
                cfg("pods", 1, 64),
                cfg("loadbalancers", 256, 64),
            ],
        )
        .unwrap();

        assert_eq!(subnets[0].cidr, net("2001:db8:cafe::/64"));
        assert_eq!(subnets[1].cidr, net("2001:db8:cafe:1::/64"));
        assert_eq!(subnets[2].cidr, net("2001:db8:cafe:100::/64"));
    }

    #[test]
    fn offset_zero_same_length_is_identity() {
        let base = net("2001:db8:cafe::/48");
        let subnet = calculate_subnet(base, &cfg("all", 0, 48)).unwrap();
        assert_eq!(subnet.cidr, base);
    }

    #[test]
    fn shorter_than_base_rejected() {
        let base = net("2001:db8:cafe::/48");
        let err = calculate_subnet(base, &cfg("bad", 0, 40)).unwrap_err();
        assert!(matches!(
            err,
            SubnetError::SubnetTooShort {
                requested: 40,
                base: 48
            }
        ));
    }

    #[test]
    fn longer_than_128_rejected() {
        let base = net("2001:db8:cafe::/48");
        let err = calculate_subnet(base, &cfg("bad", 0, 129)).unwrap_err();
        assert!(matches!(err, SubnetError::SubnetLengthInvalid(129)));
    }

    #[test]
    fn offset_escaping_base_rejected() {
        // A /48 holds 2^16 sibling /64s; offset 65536 is the first one past
        // the end.
        let base = net("2001:db8:cafe::/48");
        let err = calculate_subnet(base, &cfg("bad", 65536, 64)).unwrap_err();
        assert!(matches!(err, SubnetError::SubnetOutsideParent { .. }));

        assert!(calculate_subnet(base, &cfg("last", 65535, 64)).is_ok());
    }

    #[test]
    fn parse_prefix_normalizes_host_bits() {
        let prefix = parse_prefix("2001:db8:cafe::1/64").unwrap();
        assert_eq!(prefix, net("2001:db8:cafe::/64"));

        assert!(matches!(
            parse_prefix("not-a-prefix").unwrap_err(),
            SubnetError::PrefixParse { .. }
        ));
    }
}
