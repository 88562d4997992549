//! Pool projection reconciler.
//!
//! Watches Cilium pool resources annotated with `dynamic-prefix.io/name`
//! and rewrites their block lists to cover the referenced DynamicPrefix's
//! current prefix plus its bounded history. Pools are referenced, never
//! owned: only the documented spec fields and the last-sync annotation are
//! touched, and only when the projected content actually differs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use crds::DynamicPrefix;
use kube::api::{DynamicObject, Patch, PatchParams};
use kube_runtime::controller::Action;
use prefix::{
    calculate_address_range, calculate_subnet, parse_prefix, range_to_cidr, AddressRangeConfig,
    SubnetConfig,
};
use tracing::{debug, info, warn};

use super::{
    PoolKind, Reconciler, ANNOTATION_ADDRESS_RANGE, ANNOTATION_LAST_SYNC, ANNOTATION_NAME,
    ANNOTATION_SUBNET,
};
use crate::error::ControllerError;

const REQUEUE_PREFIX_MISSING: Duration = Duration::from_secs(30);
const REQUEUE_PREFIX_EMPTY: Duration = Duration::from_secs(10);
const REQUEUE_WRITE_FAILED: Duration = Duration::from_secs(30);

/// The resolved configuration for one pool block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolConfiguration {
    /// Use precise start/end endpoints instead of the CIDR
    pub use_address_range: bool,
    /// First address (address-range mode)
    pub start: String,
    /// Last address (address-range mode)
    pub end: String,
    /// CIDR notation (subnet and raw modes; approximation in range mode)
    pub cidr: String,
}

impl PoolConfiguration {
    fn from_cidr(cidr: String) -> Self {
        Self {
            use_address_range: false,
            start: String::new(),
            end: String::new(),
            cidr,
        }
    }
}

impl Reconciler {
    pub async fn reconcile_pool(
        &self,
        pool: Arc<DynamicObject>,
        kind: PoolKind,
    ) -> Result<Action, ControllerError> {
        let name = pool
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::InvalidConfig("pool resource missing name".into()))?;
        let resource_key = format!("{}/{}", kind.kind_name(), name);

        let annotations = pool.metadata.annotations.clone().unwrap_or_default();
        let Some(dp_name) = annotations.get(ANNOTATION_NAME) else {
            // Not managed by this operator
            return Ok(Action::await_change());
        };

        let dp = match self.dp_api.get(dp_name).await {
            Ok(dp) => dp,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                warn!(
                    "{} {} references missing DynamicPrefix {}",
                    kind.kind_name(),
                    name,
                    dp_name
                );
                return Ok(Action::requeue(REQUEUE_PREFIX_MISSING));
            }
            Err(e) => return Err(e.into()),
        };

        let configs = match build_pool_configurations(&dp, &annotations) {
            Ok(configs) if !configs.is_empty() => configs,
            Ok(_) => {
                debug!("No pool configurations generated for {}", name);
                return Ok(Action::requeue(REQUEUE_PREFIX_EMPTY));
            }
            Err(e) => {
                debug!("Cannot project {} {} yet: {}", kind.kind_name(), name, e);
                return Ok(Action::requeue(REQUEUE_PREFIX_EMPTY));
            }
        };

        let (field, desired) = match kind {
            PoolKind::LoadBalancerIpPool => ("blocks", lb_pool_blocks(&configs)),
            PoolKind::CidrGroup => ("externalCIDRs", cidr_group_entries(&configs)),
        };

        // Idempotence: an unchanged projection produces no write.
        let existing = pool.data.pointer(&format!("/spec/{field}"));
        if existing == Some(&desired) {
            debug!("{} {} already in sync", kind.kind_name(), name);
            self.reset_backoff(&resource_key);
            return Ok(Action::await_change());
        }

        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    ANNOTATION_LAST_SYNC:
                        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                }
            },
            "spec": { field: desired }
        });

        let api = match kind {
            PoolKind::LoadBalancerIpPool => &self.lb_pool_api,
            PoolKind::CidrGroup => &self.cidr_group_api,
        };

        if let Err(e) = api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!("Failed to update {} {}: {}", kind.kind_name(), name, e);
            return Ok(Action::requeue(REQUEUE_WRITE_FAILED));
        }

        info!(
            "Synced {} {} to {} block(s) from DynamicPrefix {}",
            kind.kind_name(),
            name,
            configs.len(),
            dp_name
        );
        self.reset_backoff(&resource_key);
        Ok(Action::await_change())
    }
}

/// `spec.blocks` entries for a CiliumLoadBalancerIPPool: `{start, stop}`
/// objects in address-range mode (Cilium spells the end "stop"), `{cidr}`
/// otherwise.
pub(crate) fn lb_pool_blocks(configs: &[PoolConfiguration]) -> serde_json::Value {
    let blocks: Vec<serde_json::Value> = configs
        .iter()
        .map(|config| {
            if config.use_address_range && !config.start.is_empty() && !config.end.is_empty() {
                serde_json::json!({ "start": config.start, "stop": config.end })
            } else {
                serde_json::json!({ "cidr": config.cidr })
            }
        })
        .collect();
    serde_json::Value::Array(blocks)
}

/// `spec.externalCIDRs` entries for a CiliumCIDRGroup: CIDR strings only;
/// unaligned ranges use their smallest enclosing CIDR.
pub(crate) fn cidr_group_entries(configs: &[PoolConfiguration]) -> serde_json::Value {
    let cidrs: Vec<serde_json::Value> = configs
        .iter()
        .map(|config| serde_json::Value::String(config.cidr.clone()))
        .collect();
    serde_json::Value::Array(cidrs)
}

/// Build the ordered block list for one annotated pool: the current prefix
/// first, then up to `maxPrefixHistory` historical entries.
pub(crate) fn build_pool_configurations(
    dp: &DynamicPrefix,
    annotations: &BTreeMap<String, String>,
) -> Result<Vec<PoolConfiguration>, ControllerError> {
    let status = dp.status.as_ref();
    let current_prefix = status.map(|s| s.current_prefix.as_str()).unwrap_or_default();
    if current_prefix.is_empty() {
        return Err(ControllerError::InvalidConfig(
            "DynamicPrefix has no current prefix".into(),
        ));
    }

    let max_history = dp.spec.max_prefix_history();

    let address_range = annotations
        .get(ANNOTATION_ADDRESS_RANGE)
        .filter(|name| !name.is_empty());
    let subnet = annotations
        .get(ANNOTATION_SUBNET)
        .filter(|name| !name.is_empty());

    if let Some(range_name) = address_range {
        return build_address_range_configs(dp, range_name, max_history);
    }
    if let Some(subnet_name) = subnet {
        return build_subnet_configs(dp, subnet_name, max_history);
    }
    Ok(build_raw_prefix_configs(dp, max_history))
}

fn build_address_range_configs(
    dp: &DynamicPrefix,
    range_name: &str,
    max_history: usize,
) -> Result<Vec<PoolConfiguration>, ControllerError> {
    let range_spec = dp.spec.address_ranges.iter().find(|r| r.name == range_name);
    let status = dp.status.as_ref();

    // Prefer the precomputed entry from status for the current prefix.
    let current = status
        .and_then(|s| s.address_ranges.iter().find(|r| r.name == range_name))
        .map(|r| PoolConfiguration {
            use_address_range: true,
            start: r.start.clone(),
            end: r.end.clone(),
            cidr: r.cidr.clone(),
        });

    let current = match current {
        Some(config) => config,
        None => {
            let spec = range_spec.ok_or_else(|| {
                ControllerError::ProjectionNotFound(format!(
                    "address range {range_name:?} not found in status or spec"
                ))
            })?;
            let current_prefix = status.map(|s| s.current_prefix.as_str()).unwrap_or_default();
            address_range_config(current_prefix, spec)?
        }
    };

    let mut configs = vec![current];

    // Historical prefixes are recomputed from the spec; a failure for one
    // entry is logged and skipped, not fatal.
    if let Some(spec) = range_spec {
        for entry in history_entries(dp, max_history) {
            match address_range_config(&entry.prefix, spec) {
                Ok(config) => configs.push(config),
                Err(e) => debug!(
                    "Skipping historical prefix {} for address range {:?}: {}",
                    entry.prefix, range_name, e
                ),
            }
        }
    }

    Ok(configs)
}

fn build_subnet_configs(
    dp: &DynamicPrefix,
    subnet_name: &str,
    max_history: usize,
) -> Result<Vec<PoolConfiguration>, ControllerError> {
    let subnet_spec = dp.spec.subnets.iter().find(|s| s.name == subnet_name);
    let status = dp.status.as_ref();

    let current = status
        .and_then(|s| s.subnets.iter().find(|s| s.name == subnet_name))
        .map(|s| PoolConfiguration::from_cidr(s.cidr.clone()));

    let current = match current {
        Some(config) => config,
        None => {
            let spec = subnet_spec.ok_or_else(|| {
                ControllerError::ProjectionNotFound(format!(
                    "subnet {subnet_name:?} not found in status or spec"
                ))
            })?;
            let current_prefix = status.map(|s| s.current_prefix.as_str()).unwrap_or_default();
            subnet_config(current_prefix, spec)?
        }
    };

    let mut configs = vec![current];

    if let Some(spec) = subnet_spec {
        for entry in history_entries(dp, max_history) {
            match subnet_config(&entry.prefix, spec) {
                Ok(config) => configs.push(config),
                Err(e) => debug!(
                    "Skipping historical prefix {} for subnet {:?}: {}",
                    entry.prefix, subnet_name, e
                ),
            }
        }
    }

    Ok(configs)
}

fn build_raw_prefix_configs(dp: &DynamicPrefix, max_history: usize) -> Vec<PoolConfiguration> {
    let Some(status) = dp.status.as_ref() else {
        return Vec::new();
    };

    let mut configs = vec![PoolConfiguration::from_cidr(status.current_prefix.clone())];
    for entry in history_entries(dp, max_history) {
        configs.push(PoolConfiguration::from_cidr(entry.prefix.clone()));
    }
    configs
}

/// Historical entries in block order: newest first, bounded.
fn history_entries(
    dp: &DynamicPrefix,
    max_history: usize,
) -> impl Iterator<Item = &crds::PrefixHistoryEntry> {
    dp.status
        .as_ref()
        .map(|s| s.history.as_slice())
        .unwrap_or_default()
        .iter()
        .rev()
        .take(max_history)
}

fn address_range_config(
    prefix_str: &str,
    spec: &crds::AddressRangeSpec,
) -> Result<PoolConfiguration, ControllerError> {
    let base = parse_prefix(prefix_str)
        .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;
    let cfg = AddressRangeConfig {
        name: spec.name.clone(),
        start: spec.start.clone(),
        end: spec.end.clone(),
    };
    let range = calculate_address_range(base, &cfg)
        .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;

    Ok(PoolConfiguration {
        use_address_range: true,
        start: range.start.to_string(),
        end: range.end.to_string(),
        cidr: range_to_cidr(range.start, range.end).to_string(),
    })
}

fn subnet_config(
    prefix_str: &str,
    spec: &crds::SubnetSpec,
) -> Result<PoolConfiguration, ControllerError> {
    let base = parse_prefix(prefix_str)
        .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;
    let cfg = SubnetConfig {
        name: spec.name.clone(),
        offset: spec.offset,
        prefix_length: spec.prefix_length,
    };
    let subnet = calculate_subnet(base, &cfg)
        .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;

    Ok(PoolConfiguration::from_cidr(subnet.cidr.to_string()))
}
