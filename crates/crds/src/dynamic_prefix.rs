//! DynamicPrefix CRD
//!
//! Cluster-scoped resource describing a dynamically acquired IPv6 prefix,
//! how to receive it (DHCPv6-PD and/or Router Advertisements), and how to
//! project it into address ranges and subnets for downstream pools.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dynamic-prefix.io",
    version = "v1alpha1",
    kind = "DynamicPrefix",
    status = "DynamicPrefixStatus",
    shortname = "dp",
    shortname = "dprefix",
    printcolumn = r#"{"name":"Prefix","type":"string","jsonPath":".status.currentPrefix"}"#,
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".status.prefixSource"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPrefixSpec {
    /// How to receive the IPv6 prefix from the upstream network
    pub acquisition: AcquisitionSpec,

    /// Address ranges to reserve within the received prefix.
    /// Use this when a portion of the delegated prefix is set aside for
    /// LoadBalancer IPs that the router's DHCPv6/SLAAC will not hand out.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address_ranges: Vec<AddressRangeSpec>,

    /// Subnets to carve out of the received prefix.
    /// Use this to claim dedicated /64s from a larger delegation; the
    /// subnets must be announced to the router by a separate component.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetSpec>,

    /// Graceful transition settings applied when the prefix changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<TransitionSpec>,
}

/// How to acquire/receive the IPv6 prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionSpec {
    /// DHCPv6 Prefix Delegation client configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcpv6pd: Option<DHCPv6PDSpec>,

    /// Router Advertisement monitoring configuration (used as fallback
    /// when DHCPv6-PD is also configured)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_advertisement: Option<RouterAdvertisementSpec>,
}

/// Configuration for the DHCPv6 Prefix Delegation client.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DHCPv6PDSpec {
    /// Network interface to receive the delegated prefix on
    pub interface: String,

    /// Desired prefix length hint sent to the server (48-64, default 56)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_prefix_length: Option<u8>,
}

impl DHCPv6PDSpec {
    /// Effective requested prefix length: default 56, clamped to 48..=64.
    pub fn effective_prefix_length(&self) -> u8 {
        self.requested_prefix_length
            .map(|len| len.clamp(48, 64))
            .unwrap_or(56)
    }
}

/// Configuration for Router Advertisement monitoring.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouterAdvertisementSpec {
    /// Network interface to monitor for Router Advertisements
    #[serde(default)]
    pub interface: String,

    /// Whether RA monitoring is active (default true)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// An address range within the received prefix, given as suffixes that are
/// overlaid on the prefix's host bits. For example with start "::f000:0:0:0"
/// the range begins at prefix + 0xf000:0:0:0.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddressRangeSpec {
    /// Identifier referenced from pool and service annotations.
    /// Must match `^[a-z0-9]([-a-z0-9]*[a-z0-9])?$`, 1-63 characters.
    pub name: String,

    /// Start of the range as an IPv6 suffix
    pub start: String,

    /// End of the range (inclusive) as an IPv6 suffix
    pub end: String,
}

/// A subnet carved out of the received prefix.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Identifier referenced from pool and service annotations.
    /// Must match `^[a-z0-9]([-a-z0-9]*[a-z0-9])?$`, 1-63 characters.
    pub name: String,

    /// Which Nth sibling subnet of the target size to select (default 0)
    #[serde(default)]
    pub offset: u64,

    /// Prefix length of the subnet (48-128, must not be shorter than the
    /// received prefix)
    pub prefix_length: u8,
}

/// Transition behavior when the delegated prefix changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransitionMode {
    /// Keep multiple blocks in the pool; Services keep old IPs until the
    /// historical block is dropped.
    #[default]
    Simple,

    /// Keep both old and new IPs on the Service, with DNS pointing at the
    /// new IP only.
    Ha,
}

/// Settings for graceful prefix transitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransitionSpec {
    /// Transition behavior mode (default "simple")
    #[serde(default)]
    pub mode: TransitionMode,

    /// Maximum number of previous prefixes retained in pool blocks
    /// (1-10, default 2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_prefix_history: Option<u32>,
}

impl DynamicPrefixSpec {
    /// Effective transition mode, defaulting to simple.
    pub fn transition_mode(&self) -> TransitionMode {
        self.transition.as_ref().map(|t| t.mode).unwrap_or_default()
    }

    /// Effective history bound: default 2, clamped to 1..=10.
    pub fn max_prefix_history(&self) -> usize {
        self.transition
            .as_ref()
            .and_then(|t| t.max_prefix_history)
            .map(|n| n.clamp(1, 10) as usize)
            .unwrap_or(2)
    }
}

/// How a prefix was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum PrefixSource {
    Dhcpv6Pd,
    RouterAdvertisement,
    Static,
    #[default]
    Unknown,
}

/// Observed state of a DynamicPrefix.
///
/// Every field serializes even when empty: the controller writes status via
/// merge patch, and an omitted field would keep its stale server-side value
/// instead of clearing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPrefixStatus {
    /// Currently active IPv6 prefix in CIDR notation
    #[serde(default)]
    pub current_prefix: String,

    /// How the current prefix was obtained
    #[serde(default)]
    pub prefix_source: Option<PrefixSource>,

    /// When the DHCPv6 lease expires
    #[serde(default)]
    pub lease_expires_at: Option<Time>,

    /// Calculated address ranges for the current prefix
    #[serde(default)]
    pub address_ranges: Vec<AddressRangeStatus>,

    /// Calculated subnet CIDRs for the current prefix
    #[serde(default)]
    pub subnets: Vec<SubnetStatus>,

    /// Previous prefixes, ordered oldest to newest
    #[serde(default)]
    pub history: Vec<PrefixHistoryEntry>,

    /// Current conditions of the DynamicPrefix
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Calculated state of one address range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddressRangeStatus {
    /// Address range identifier
    pub name: String,

    /// First address in the range
    pub start: String,

    /// Last address in the range (inclusive)
    pub end: String,

    /// Approximate CIDR representation. May cover a larger range when
    /// start/end do not align to a CIDR boundary; start/end are the
    /// precise bounds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cidr: String,
}

/// Calculated state of one subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    /// Subnet identifier
    pub name: String,

    /// Calculated subnet in CIDR notation
    pub cidr: String,
}

/// Lifecycle state of a historical prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PrefixState {
    Active,
    Draining,
    Expired,
}

/// A previously active prefix retained for graceful transitions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrefixHistoryEntry {
    /// Historical prefix in CIDR notation
    pub prefix: String,

    /// When this prefix was first acquired
    pub acquired_at: Time,

    /// When this prefix was replaced by a newer one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_at: Option<Time>,

    /// Lifecycle state of this historical prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PrefixState>,
}

/// Condition type: a prefix has been acquired from the upstream network.
pub const CONDITION_PREFIX_ACQUIRED: &str = "PrefixAcquired";

/// Condition type: all referencing pools are synced.
pub const CONDITION_POOLS_SYNCED: &str = "PoolsSynced";

/// Condition type: the resource is degraded (e.g. projection failures).
pub const CONDITION_DEGRADED: &str = "Degraded";
