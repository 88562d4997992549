//! DynamicPrefix reconciler.
//!
//! Converges the declarative DynamicPrefix status toward the live receiver
//! state: current prefix, projected address ranges and subnets, bounded
//! prefix history, and conditions. Also owns receiver lifecycle, bracketed
//! by the finalizer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crds::{
    AddressRangeSpec, AddressRangeStatus, DynamicPrefix, DynamicPrefixStatus, PrefixHistoryEntry,
    PrefixState, SubnetSpec, SubnetStatus, CONDITION_DEGRADED, CONDITION_PREFIX_ACQUIRED,
};
use ipnet::Ipv6Net;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Patch, PatchParams};
use kube_runtime::controller::Action;
use prefix::{
    calculate_address_range, calculate_subnet, range_to_cidr, AddressRangeConfig, Prefix,
    SubnetConfig,
};
use tracing::{info, warn};

use super::{Reconciler, FINALIZER};
use crate::conditions::{new_condition, set_condition, STATUS_FALSE, STATUS_TRUE};
use crate::error::ControllerError;

const REQUEUE_NO_PREFIX: Duration = Duration::from_secs(10);
const REQUEUE_RECEIVER_FAILED: Duration = Duration::from_secs(30);
const REQUEUE_MIN: Duration = Duration::from_secs(60);
const REQUEUE_MAX: Duration = Duration::from_secs(300);

impl Reconciler {
    pub async fn reconcile_dynamic_prefix(
        &self,
        dp: Arc<DynamicPrefix>,
    ) -> Result<Action, ControllerError> {
        let name = dp
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::InvalidConfig("DynamicPrefix missing name".into()))?;
        let resource_key = format!("dynamicprefix/{name}");

        // Deletion: run the finalizer, tearing the receiver down first.
        if dp.metadata.deletion_timestamp.is_some() {
            if has_finalizer(&dp) {
                info!("DynamicPrefix {} is being deleted, cleaning up receiver", name);
                self.cleanup_receiver(&name).await;
                self.remove_finalizer(&name, &dp).await?;
            }
            return Ok(Action::await_change());
        }

        // The finalizer must be in place before any receiver exists.
        if !has_finalizer(&dp) {
            self.add_finalizer(&name, &dp).await?;
            return Ok(Action::requeue(Duration::ZERO));
        }

        let mut status = dp.status.clone().unwrap_or_default();
        let generation = dp.metadata.generation;

        // Receiver construction failures are user-fixable configuration
        // problems; surface them and retry on a timer.
        let receiver = match self.ensure_receiver(&dp, &name).await {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("Failed to create receiver for DynamicPrefix {}: {}", name, e);
                set_condition(
                    &mut status.conditions,
                    new_condition(
                        CONDITION_PREFIX_ACQUIRED,
                        STATUS_FALSE,
                        "ReceiverCreationFailed",
                        e.to_string(),
                        generation,
                    ),
                );
                self.patch_dp_status(&name, &status).await?;
                return Ok(Action::requeue(REQUEUE_RECEIVER_FAILED));
            }
        };

        let Some(current) = receiver.current_prefix() else {
            info!("No prefix acquired yet for DynamicPrefix {}", name);
            if !status.current_prefix.is_empty() {
                // The receiver expired the lease; status must not keep
                // advertising a prefix nobody holds.
                push_history(&mut status, &dp, PrefixState::Expired);
                status.current_prefix = String::new();
                status.lease_expires_at = None;
                status.address_ranges = Vec::new();
                status.subnets = Vec::new();
            }
            set_condition(
                &mut status.conditions,
                new_condition(
                    CONDITION_PREFIX_ACQUIRED,
                    STATUS_FALSE,
                    "WaitingForPrefix",
                    "Waiting to receive prefix from upstream",
                    generation,
                ),
            );
            self.patch_dp_status(&name, &status).await?;
            return Ok(Action::requeue(REQUEUE_NO_PREFIX));
        };

        let network_str = current.network.to_string();
        if status.current_prefix != network_str {
            if !status.current_prefix.is_empty() {
                info!(
                    "DynamicPrefix {} changed: {} -> {}",
                    name, status.current_prefix, network_str
                );
                push_history(&mut status, &dp, PrefixState::Draining);
            }
            status.current_prefix = network_str.clone();
        }

        status.prefix_source = Some(receiver.source().into());
        status.lease_expires_at = current.expires_at().map(Time);

        // Project ranges and subnets; individual failures degrade the
        // resource but keep the rest of the status usable.
        let mut failures = Vec::new();
        status.address_ranges =
            project_address_ranges(current.network, &dp.spec.address_ranges, &mut failures);
        status.subnets = project_subnets(current.network, &dp.spec.subnets, &mut failures);

        if failures.is_empty() {
            set_condition(
                &mut status.conditions,
                new_condition(
                    CONDITION_DEGRADED,
                    STATUS_FALSE,
                    "Healthy",
                    "DynamicPrefix is operating normally",
                    generation,
                ),
            );
        } else {
            warn!(
                "DynamicPrefix {} projection failures: {}",
                name,
                failures.join("; ")
            );
            set_condition(
                &mut status.conditions,
                new_condition(
                    CONDITION_DEGRADED,
                    STATUS_TRUE,
                    "SubnetCalculationFailed",
                    failures.join("; "),
                    generation,
                ),
            );
        }

        set_condition(
            &mut status.conditions,
            new_condition(
                CONDITION_PREFIX_ACQUIRED,
                STATUS_TRUE,
                "PrefixAcquired",
                format!("Prefix {} acquired via {}", network_str, receiver.source()),
                generation,
            ),
        );

        self.patch_dp_status(&name, &status).await?;
        self.notify_downstream();
        self.reset_backoff(&resource_key);

        Ok(Action::requeue(calculate_requeue(&current)))
    }

    async fn patch_dp_status(
        &self,
        name: &str,
        status: &DynamicPrefixStatus,
    ) -> Result<(), ControllerError> {
        let patch = serde_json::json!({ "status": status });
        self.dp_api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str, dp: &DynamicPrefix) -> Result<(), ControllerError> {
        let mut finalizers = dp.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(name, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        name: &str,
        dp: &DynamicPrefix,
    ) -> Result<(), ControllerError> {
        let finalizers: Vec<String> = dp
            .metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != FINALIZER)
            .collect();
        self.patch_finalizers(name, finalizers).await
    }

    async fn patch_finalizers(
        &self,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ControllerError> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.dp_api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

pub(crate) fn has_finalizer(dp: &DynamicPrefix) -> bool {
    dp.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == FINALIZER))
}

/// Move the still-current prefix into history and trim to the configured
/// bound, dropping the oldest entries.
pub(crate) fn push_history(status: &mut DynamicPrefixStatus, dp: &DynamicPrefix, state: PrefixState) {
    let now = Time(Utc::now());

    // The old prefix became current when the previous history entry was
    // deprecated; for the first rotation fall back to resource creation.
    let acquired_at = status
        .history
        .last()
        .and_then(|entry| entry.deprecated_at.clone())
        .or_else(|| dp.metadata.creation_timestamp.clone())
        .unwrap_or_else(|| now.clone());

    status.history.push(PrefixHistoryEntry {
        prefix: status.current_prefix.clone(),
        acquired_at,
        deprecated_at: Some(now),
        state: Some(state),
    });

    let max_history = dp.spec.max_prefix_history();
    if status.history.len() > max_history {
        let excess = status.history.len() - max_history;
        status.history.drain(..excess);
    }
}

/// Calculate address range statuses, collecting per-entry failures.
pub(crate) fn project_address_ranges(
    network: Ipv6Net,
    specs: &[AddressRangeSpec],
    failures: &mut Vec<String>,
) -> Vec<AddressRangeStatus> {
    specs
        .iter()
        .filter_map(|spec| {
            let cfg = AddressRangeConfig {
                name: spec.name.clone(),
                start: spec.start.clone(),
                end: spec.end.clone(),
            };
            match calculate_address_range(network, &cfg) {
                Ok(range) => Some(AddressRangeStatus {
                    name: range.name,
                    start: range.start.to_string(),
                    end: range.end.to_string(),
                    cidr: range_to_cidr(range.start, range.end).to_string(),
                }),
                Err(e) => {
                    failures.push(format!("address range {:?}: {}", spec.name, e));
                    None
                }
            }
        })
        .collect()
}

/// Calculate subnet statuses, collecting per-entry failures.
pub(crate) fn project_subnets(
    network: Ipv6Net,
    specs: &[SubnetSpec],
    failures: &mut Vec<String>,
) -> Vec<SubnetStatus> {
    specs
        .iter()
        .filter_map(|spec| {
            let cfg = SubnetConfig {
                name: spec.name.clone(),
                offset: spec.offset,
                prefix_length: spec.prefix_length,
            };
            match calculate_subnet(network, &cfg) {
                Ok(subnet) => Some(SubnetStatus {
                    name: subnet.name,
                    cidr: subnet.cidr.to_string(),
                }),
                Err(e) => {
                    failures.push(format!("subnet {:?}: {}", spec.name, e));
                    None
                }
            }
        })
        .collect()
}

/// Requeue at 80 % of the remaining lease, clamped to [1 min, 5 min];
/// without a lease lifetime, poll every 5 minutes.
pub(crate) fn calculate_requeue(current: &Prefix) -> Duration {
    let Some(expires_at) = current.expires_at() else {
        return REQUEUE_MAX;
    };

    let remaining = (expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let requeue = remaining * 4 / 5;
    requeue.clamp(REQUEUE_MIN, REQUEUE_MAX)
}
