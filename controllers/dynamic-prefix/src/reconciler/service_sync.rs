//! HA-mode Service reconciler.
//!
//! For DynamicPrefixes in `ha` transition mode, keeps both old and new
//! Service IPs requested from LB-IPAM while pointing DNS at the new IP
//! only. The historical IPs are derived bit-exactly: the Service's offset
//! inside its range or subnet is recomputed against every historical
//! prefix over the full 128 bits.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use crds::{DynamicPrefix, TransitionMode};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Patch, PatchParams};
use kube_runtime::controller::Action;
use prefix::{calculate_address_range, calculate_subnet, parse_prefix, AddressRangeConfig, SubnetConfig};
use tracing::{debug, info, warn};

use super::{
    Reconciler, ANNOTATION_ADDRESS_RANGE, ANNOTATION_CILIUM_IPS, ANNOTATION_EXTERNAL_DNS_TARGET,
    ANNOTATION_LAST_SYNC, ANNOTATION_NAME, ANNOTATION_SERVICE_ADDRESS_RANGE,
    ANNOTATION_SERVICE_SUBNET, ANNOTATION_SUBNET,
};
use crate::error::ControllerError;

const REQUEUE_NO_INGRESS: Duration = Duration::from_secs(5);
const REQUEUE_PREFIX_MISSING: Duration = Duration::from_secs(30);
const REQUEUE_CALCULATION: Duration = Duration::from_secs(10);
const REQUEUE_WRITE_FAILED: Duration = Duration::from_secs(5);

impl Reconciler {
    pub async fn reconcile_service(&self, svc: Arc<Service>) -> Result<Action, ControllerError> {
        let name = svc
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::InvalidConfig("Service missing name".into()))?;
        let namespace = svc.metadata.namespace.as_deref().unwrap_or("default");

        if !is_load_balancer(&svc) {
            return Ok(Action::await_change());
        }

        let annotations = svc.metadata.annotations.clone().unwrap_or_default();
        let Some(dp_name) = annotations.get(ANNOTATION_NAME) else {
            return Ok(Action::await_change());
        };

        let dp = match self.dp_api.get(dp_name).await {
            Ok(dp) => dp,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                warn!(
                    "Service {}/{} references missing DynamicPrefix {}",
                    namespace, name, dp_name
                );
                return Ok(Action::requeue(REQUEUE_PREFIX_MISSING));
            }
            Err(e) => return Err(e.into()),
        };

        // Only HA mode manages Services; everything else is left untouched.
        if dp.spec.transition_mode() != TransitionMode::Ha {
            return Ok(Action::await_change());
        }

        let Some(current_ip) = current_service_ip(&svc) else {
            debug!(
                "Service {}/{} has no IPv6 ingress IP yet, waiting",
                namespace, name
            );
            return Ok(Action::requeue(REQUEUE_NO_INGRESS));
        };

        let all_ips = match calculate_service_ips(&dp, &annotations, current_ip) {
            Ok(ips) => ips,
            Err(e) => {
                warn!(
                    "Failed to calculate HA IPs for Service {}/{}: {}",
                    namespace, name, e
                );
                return Ok(Action::requeue(REQUEUE_CALCULATION));
            }
        };

        let desired_ips = all_ips.join(",");
        let desired_target = current_ip.to_string();

        // Only write when the annotation content changes; the last-sync
        // stamp moves with real updates only.
        let unchanged = annotations.get(ANNOTATION_CILIUM_IPS) == Some(&desired_ips)
            && annotations.get(ANNOTATION_EXTERNAL_DNS_TARGET) == Some(&desired_target);
        if unchanged {
            return Ok(Action::await_change());
        }

        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    ANNOTATION_CILIUM_IPS: desired_ips,
                    ANNOTATION_EXTERNAL_DNS_TARGET: desired_target,
                    ANNOTATION_LAST_SYNC:
                        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                }
            }
        });

        let namespaced: kube::Api<Service> =
            kube::Api::namespaced(self.client.clone(), namespace);
        if let Err(e) = namespaced
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(
                "Failed to update Service {}/{} annotations: {}",
                namespace, name, e
            );
            return Ok(Action::requeue(REQUEUE_WRITE_FAILED));
        }

        info!(
            "Service {}/{} HA annotations updated: ips={}, dns target={}",
            namespace, name, all_ips.join(","), current_ip
        );
        Ok(Action::await_change())
    }
}

pub(crate) fn is_load_balancer(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "LoadBalancer")
}

/// The Service's IPv6 ingress IP; IPv4-only status yields `None`.
pub(crate) fn current_service_ip(svc: &Service) -> Option<Ipv6Addr> {
    svc.status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .filter_map(|ingress| ingress.ip.as_deref())
        .find_map(|ip| ip.parse::<Ipv6Addr>().ok())
}

/// All IPs the Service should request: the current IP first, then its
/// counterpart in every historical prefix. Falls back to the current IP
/// alone when no range or subnet annotation matches.
pub(crate) fn calculate_service_ips(
    dp: &DynamicPrefix,
    annotations: &BTreeMap<String, String>,
    current_ip: Ipv6Addr,
) -> Result<Vec<String>, ControllerError> {
    let max_history = dp.spec.max_prefix_history();

    // Service-level annotations win over the pool-level ones.
    let range_name = [ANNOTATION_SERVICE_ADDRESS_RANGE, ANNOTATION_ADDRESS_RANGE]
        .iter()
        .find_map(|key| annotations.get(*key))
        .filter(|name| !name.is_empty());
    let subnet_name = [ANNOTATION_SERVICE_SUBNET, ANNOTATION_SUBNET]
        .iter()
        .find_map(|key| annotations.get(*key))
        .filter(|name| !name.is_empty());

    if let Some(range_name) = range_name {
        return address_range_ips(dp, current_ip, range_name, max_history);
    }
    if let Some(subnet_name) = subnet_name {
        return subnet_ips(dp, current_ip, subnet_name, max_history);
    }

    Ok(vec![current_ip.to_string()])
}

fn address_range_ips(
    dp: &DynamicPrefix,
    current_ip: Ipv6Addr,
    range_name: &str,
    max_history: usize,
) -> Result<Vec<String>, ControllerError> {
    let Some(range_spec) = dp.spec.address_ranges.iter().find(|r| r.name == range_name) else {
        // Unknown range name: use the current IP verbatim.
        return Ok(vec![current_ip.to_string()]);
    };

    let current_prefix = current_prefix(dp)?;
    let cfg = AddressRangeConfig {
        name: range_spec.name.clone(),
        start: range_spec.start.clone(),
        end: range_spec.end.clone(),
    };
    let current_range = calculate_address_range(current_prefix, &cfg)
        .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;

    let offset = ip_offset(current_range.start, current_ip);

    let mut ips = vec![current_ip.to_string()];
    for entry in history_entries(dp, max_history) {
        let Ok(hist_prefix) = parse_prefix(&entry.prefix) else {
            continue;
        };
        let Ok(hist_range) = calculate_address_range(hist_prefix, &cfg) else {
            continue;
        };
        if let Some(hist_ip) = apply_ip_offset(hist_range.start, offset) {
            ips.push(hist_ip.to_string());
        }
    }

    Ok(ips)
}

fn subnet_ips(
    dp: &DynamicPrefix,
    current_ip: Ipv6Addr,
    subnet_name: &str,
    max_history: usize,
) -> Result<Vec<String>, ControllerError> {
    let Some(subnet_spec) = dp.spec.subnets.iter().find(|s| s.name == subnet_name) else {
        return Ok(vec![current_ip.to_string()]);
    };

    let current_prefix = current_prefix(dp)?;
    let cfg = SubnetConfig {
        name: subnet_spec.name.clone(),
        offset: subnet_spec.offset,
        prefix_length: subnet_spec.prefix_length,
    };
    let current_subnet = calculate_subnet(current_prefix, &cfg)
        .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;

    let offset = ip_offset(current_subnet.cidr.network(), current_ip);

    let mut ips = vec![current_ip.to_string()];
    for entry in history_entries(dp, max_history) {
        let Ok(hist_prefix) = parse_prefix(&entry.prefix) else {
            continue;
        };
        let Ok(hist_subnet) = calculate_subnet(hist_prefix, &cfg) else {
            continue;
        };
        if let Some(hist_ip) = apply_ip_offset(hist_subnet.cidr.network(), offset) {
            ips.push(hist_ip.to_string());
        }
    }

    Ok(ips)
}

fn current_prefix(dp: &DynamicPrefix) -> Result<ipnet::Ipv6Net, ControllerError> {
    let current = dp
        .status
        .as_ref()
        .map(|s| s.current_prefix.as_str())
        .unwrap_or_default();
    if current.is_empty() {
        return Err(ControllerError::InvalidConfig(
            "DynamicPrefix has no current prefix".into(),
        ));
    }
    parse_prefix(current).map_err(|e| ControllerError::InvalidConfig(e.to_string()))
}

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

/// The distance from `base` to `target` as a full 128-bit unsigned
/// difference. IPv6 math must never be truncated to the low 64 bits.
pub(crate) fn ip_offset(base: Ipv6Addr, target: Ipv6Addr) -> u128 {
    u128::from(target).wrapping_sub(u128::from(base))
}

/// `base + offset` over the full 128 bits; `None` on overflow, which makes
/// the historical entry get skipped.
pub(crate) fn apply_ip_offset(base: Ipv6Addr, offset: u128) -> Option<Ipv6Addr> {
    u128::from(base).checked_add(offset).map(Ipv6Addr::from)
}
