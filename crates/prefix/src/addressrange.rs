//! Address range arithmetic within a delegated prefix.
//!
//! Ranges are defined by suffixes overlaid on the prefix's host bits, so the
//! same spec keeps producing the matching range whenever the upstream prefix
//! rotates.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;

use crate::error::RangeError;

/// An address range to be calculated within a prefix.
#[derive(Debug, Clone)]
pub struct AddressRangeConfig {
    /// Identifier of this range
    pub name: String,

    /// Start suffix, e.g. "::f000:0:0:0"
    pub start: String,

    /// End suffix (inclusive), e.g. "::ffff:ffff:ffff:ffff"
    pub end: String,
}

/// A calculated address range with endpoint-inclusive bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    /// Identifier of this range
    pub name: String,

    /// First address in the range
    pub start: Ipv6Addr,

    /// Last address in the range
    pub end: Ipv6Addr,
}

/// Calculate all configured address ranges against a base prefix.
pub fn calculate_address_ranges(
    base: Ipv6Net,
    configs: &[AddressRangeConfig],
) -> Result<Vec<AddressRange>, RangeError> {
    configs
        .iter()
        .map(|cfg| calculate_address_range(base, cfg))
        .collect()
}

/// Calculate a single address range against a base prefix.
pub fn calculate_address_range(
    base: Ipv6Net,
    cfg: &AddressRangeConfig,
) -> Result<AddressRange, RangeError> {
    let start = parse_suffix(base, &cfg.start)?;
    let end = parse_suffix(base, &cfg.end)?;

    if start > end {
        return Err(RangeError::RangeInverted { start, end });
    }
    if !base.contains(&start) {
        return Err(RangeError::RangeOutsideParent {
            addr: start,
            prefix: base,
        });
    }
    if !base.contains(&end) {
        return Err(RangeError::RangeOutsideParent {
            addr: end,
            prefix: base,
        });
    }

    Ok(AddressRange {
        name: cfg.name.clone(),
        start,
        end,
    })
}

fn parse_suffix(base: Ipv6Net, suffix: &str) -> Result<Ipv6Addr, RangeError> {
    let addr: Ipv6Addr = suffix.parse().map_err(|source| RangeError::SuffixParse {
        suffix: suffix.to_string(),
        source,
    })?;
    Ok(combine_suffix(base, addr))
}

/// Overlay the host bits of `suffix` onto the network bits of `base`.
///
/// The boundary byte is merged bit-exactly: the prefix side keeps its top
/// `prefix_len % 8` bits, the suffix supplies the rest.
pub fn combine_suffix(base: Ipv6Net, suffix: Ipv6Addr) -> Ipv6Addr {
    let base_bytes = base.network().octets();
    let suffix_bytes = suffix.octets();
    let mut result = [0u8; 16];

    let prefix_bits = base.prefix_len() as usize;
    let full_bytes = prefix_bits / 8;
    let remaining_bits = prefix_bits % 8;

    result[..full_bytes].copy_from_slice(&base_bytes[..full_bytes]);

    let mut host_start = full_bytes;
    if remaining_bits > 0 && full_bytes < 16 {
        let mask = 0xFFu8 << (8 - remaining_bits);
        result[full_bytes] = (base_bytes[full_bytes] & mask) | (suffix_bytes[full_bytes] & !mask);
        host_start += 1;
    }

    result[host_start..].copy_from_slice(&suffix_bytes[host_start..]);

    Ipv6Addr::from(result)
}

/// The smallest CIDR containing the closed interval `[start, end]`.
///
/// Only an approximation for ranges that do not align to a CIDR boundary;
/// the precise bounds stay in start/end.
pub fn range_to_cidr(start: Ipv6Addr, end: Ipv6Addr) -> Ipv6Net {
    let xor = u128::from(start) ^ u128::from(end);
    let common_bits = xor.leading_zeros() as u8;
    // Cannot fail: common_bits <= 128.
    Ipv6Net::new(start, common_bits).unwrap().trunc()
}

/// Endpoint-inclusive number of addresses in `[start, end]`.
/// Returns 0 when the count does not fit in a u64.
pub fn address_count(start: Ipv6Addr, end: Ipv6Addr) -> u64 {
    let (start, end) = (u128::from(start), u128::from(end));
    if end < start {
        return 0;
    }
    let count = end - start + 1;
    u64::try_from(count).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn cfg(name: &str, start: &str, end: &str) -> AddressRangeConfig {
        AddressRangeConfig {
            name: name.to_string(),
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    #[test]
    fn suffix_overlay_on_aligned_prefix() {
        let base = net("2001:db8:1::/48");
        let range = calculate_address_range(base, &cfg("lb", "::f000:0:0:0", "::ffff:ffff:ffff:ffff"))
            .unwrap();

        assert_eq!(range.start, addr("2001:db8:1:0:f000::"));
        assert_eq!(range.end, addr("2001:db8:1:0:ffff:ffff:ffff:ffff"));
    }

    #[test]
    fn suffix_overlay_merges_partial_boundary_byte() {
        // /52 splits the seventh byte: top 4 bits from the base, low 4 from
        // the suffix.
        let base = net("2001:db8:0:f000::/52");
        let combined = combine_suffix(base, addr("::800:0:0:0:1"));
        assert_eq!(combined, addr("2001:db8:0:f800::1"));
    }

    #[test]
    fn inverted_range_rejected() {
        let base = net("2001:db8:1::/48");
        let err = calculate_address_range(base, &cfg("bad", "::2", "::1")).unwrap_err();
        assert!(matches!(err, RangeError::RangeInverted { .. }));
    }

    #[test]
    fn unparseable_suffix_rejected() {
        let base = net("2001:db8:1::/48");
        let err = calculate_address_range(base, &cfg("bad", "not-an-address", "::1")).unwrap_err();
        assert!(matches!(err, RangeError::SuffixParse { .. }));
    }

    #[test]
    fn single_address_range() {
        let base = net("2001:db8:1::/48");
        let range = calculate_address_range(base, &cfg("vip", "::10", "::10")).unwrap();
        assert_eq!(range.start, range.end);
        assert_eq!(range.start, addr("2001:db8:1::10"));
    }

    #[test]
    fn range_to_cidr_exact_block() {
        let prefix = range_to_cidr(addr("2001:db8::"), addr("2001:db8::ff"));
        assert_eq!(prefix, net("2001:db8::/120"));
    }

    #[test]
    fn range_to_cidr_unaligned_covers_range() {
        // [::1, ::10] does not align; the smallest enclosing CIDR is ::/123
        // (covering 0..31).
        let prefix = range_to_cidr(addr("::1"), addr("::10"));
        assert_eq!(prefix, net("::/123"));
        assert!(prefix.contains(&addr("::1")));
        assert!(prefix.contains(&addr("::10")));
    }

    #[test]
    fn range_to_cidr_single_address() {
        let prefix = range_to_cidr(addr("2001:db8::5"), addr("2001:db8::5"));
        assert_eq!(prefix, net("2001:db8::5/128"));
    }

    #[test]
    fn address_counting() {
        assert_eq!(address_count(addr("::1"), addr("::1")), 1);
        assert_eq!(address_count(addr("::1"), addr("::10")), 16);
        // Range spanning more than 2^64 addresses is not representable.
        assert_eq!(
            address_count(addr("2001:db8::"), addr("2001:db9::")),
            0
        );
    }
}
