//! Reconciliation logic for the dynamic-prefix controllers.
//!
//! Three reconcilers share one `Reconciler` context:
//! - `dynamic_prefix`: projects the live receiver state into the
//!   DynamicPrefix status (current prefix, ranges, subnets, history,
//!   conditions) and owns the receiver lifecycle.
//! - `pool_sync`: rewrites annotated Cilium pool resources to the current
//!   and historical blocks.
//! - `service_sync`: rewrites LoadBalancer Service annotations for HA-mode
//!   prefix transitions.

pub mod dynamic_prefix;
pub mod pool_sync;
pub mod service_sync;
#[cfg(test)]
mod service_sync_test;
#[cfg(test)]
mod dynamic_prefix_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crds::DynamicPrefix;
use k8s_openapi::api::core::v1::Service;
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use kube::{Api, Client};
use prefix::{Receiver, ReceiverFactory};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;

/// Finalizer placed on DynamicPrefix resources so receivers are torn down
/// before deletion completes.
pub const FINALIZER: &str = "dynamic-prefix.io/finalizer";

/// Annotation referencing the DynamicPrefix by name.
pub const ANNOTATION_NAME: &str = "dynamic-prefix.io/name";
/// Annotation selecting a subnet from `status.subnets` for pool projection.
pub const ANNOTATION_SUBNET: &str = "dynamic-prefix.io/subnet";
/// Annotation selecting an address range from `status.addressRanges`.
pub const ANNOTATION_ADDRESS_RANGE: &str = "dynamic-prefix.io/address-range";
/// Annotation selecting the subnet used for Service IPs in HA mode.
pub const ANNOTATION_SERVICE_SUBNET: &str = "dynamic-prefix.io/service-subnet";
/// Annotation selecting the address range used for Service IPs in HA mode.
pub const ANNOTATION_SERVICE_ADDRESS_RANGE: &str = "dynamic-prefix.io/service-address-range";
/// Timestamp annotation written after each successful downstream update.
pub const ANNOTATION_LAST_SYNC: &str = "dynamic-prefix.io/last-sync";

/// Cilium LB-IPAM annotation listing the IPs requested for a Service.
pub const ANNOTATION_CILIUM_IPS: &str = "lbipam.cilium.io/ips";
/// external-dns annotation overriding the DNS target of a Service.
pub const ANNOTATION_EXTERNAL_DNS_TARGET: &str = "external-dns.alpha.kubernetes.io/target";

/// The downstream pool kinds this operator projects blocks into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// CiliumLoadBalancerIPPool: `spec.blocks` of `{cidr}` or `{start,stop}`
    LoadBalancerIpPool,
    /// CiliumCIDRGroup: `spec.externalCIDRs` of CIDR strings
    CidrGroup,
}

impl PoolKind {
    pub fn api_resource(&self) -> ApiResource {
        let gvk = match self {
            PoolKind::LoadBalancerIpPool => {
                GroupVersionKind::gvk("cilium.io", "v2alpha1", "CiliumLoadBalancerIPPool")
            }
            PoolKind::CidrGroup => {
                GroupVersionKind::gvk("cilium.io", "v2alpha1", "CiliumCIDRGroup")
            }
        };
        ApiResource::from_gvk(&gvk)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            PoolKind::LoadBalancerIpPool => "CiliumLoadBalancerIPPool",
            PoolKind::CidrGroup => "CiliumCIDRGroup",
        }
    }
}

/// One running receiver owned by a DynamicPrefix resource.
struct ReceiverEntry {
    receiver: Arc<dyn Receiver>,
    shutdown: CancellationToken,
    forwarder: tokio::task::JoinHandle<()>,
}

/// Wake-up channels connecting receiver events and DynamicPrefix status
/// writes to the controllers' trigger streams. Controllers never hold
/// references into each other's state; they only pass messages here.
pub struct Triggers {
    pub dynamic_prefix: mpsc::Sender<()>,
    pub lb_pools: mpsc::Sender<()>,
    pub cidr_groups: mpsc::Sender<()>,
    pub services: mpsc::Sender<()>,
}

/// Shared context for all three reconcilers.
pub struct Reconciler {
    pub(crate) client: Client,
    pub(crate) dp_api: Api<DynamicPrefix>,
    pub(crate) service_api: Api<Service>,
    pub(crate) lb_pool_api: Api<DynamicObject>,
    pub(crate) cidr_group_api: Api<DynamicObject>,

    factory: Box<dyn ReceiverFactory>,

    /// Receivers keyed by DynamicPrefix name. At most one receiver exists
    /// per name; lifecycle is init-on-reconcile, teardown-on-finalizer.
    receivers: RwLock<HashMap<String, ReceiverEntry>>,

    triggers: Triggers,

    /// Requeue backoff per resource key, reset on success.
    backoffs: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl Reconciler {
    pub fn new(client: Client, factory: Box<dyn ReceiverFactory>, triggers: Triggers) -> Self {
        Self {
            dp_api: Api::all(client.clone()),
            service_api: Api::all(client.clone()),
            lb_pool_api: Api::all_with(
                client.clone(),
                &PoolKind::LoadBalancerIpPool.api_resource(),
            ),
            cidr_group_api: Api::all_with(client.clone(), &PoolKind::CidrGroup.api_resource()),
            client,
            factory,
            receivers: RwLock::new(HashMap::new()),
            triggers,
            backoffs: Mutex::new(HashMap::new()),
        }
    }

    /// Return the receiver for this DynamicPrefix, constructing and starting
    /// one if none is registered yet.
    pub(crate) async fn ensure_receiver(
        &self,
        dp: &DynamicPrefix,
        name: &str,
    ) -> Result<Arc<dyn Receiver>, ControllerError> {
        {
            let receivers = self.receivers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = receivers.get(name) {
                return Ok(entry.receiver.clone());
            }
        }

        let receiver = self.factory.create_receiver(&dp.spec.acquisition)?;
        let shutdown = CancellationToken::new();
        receiver.start(shutdown.clone()).await?;

        let forwarder = self.spawn_event_forwarder(name, &receiver, shutdown.clone());

        let mut receivers = self.receivers.write().unwrap_or_else(|e| e.into_inner());
        // A concurrent reconcile of the same name cannot happen (single
        // flight per key), but guard against double construction anyway.
        if let Some(existing) = receivers.get(name) {
            shutdown.cancel();
            forwarder.abort();
            let duplicate = receiver;
            tokio::spawn(async move {
                let _ = duplicate.stop().await;
            });
            return Ok(existing.receiver.clone());
        }

        info!("Started {} receiver for DynamicPrefix {}", receiver.source(), name);
        receivers.insert(
            name.to_string(),
            ReceiverEntry {
                receiver: receiver.clone(),
                shutdown,
                forwarder,
            },
        );

        Ok(receiver)
    }

    /// Forward receiver events into the DynamicPrefix trigger stream so a
    /// reconcile runs promptly after every event. Dropped events are fine;
    /// the reconcile re-reads `current_prefix()` anyway.
    fn spawn_event_forwarder(
        &self,
        name: &str,
        receiver: &Arc<dyn Receiver>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut events = receiver.events();
        let trigger = self.triggers.dynamic_prefix.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            debug!(
                                "Receiver event {} for DynamicPrefix {}",
                                event.event_type, name
                            );
                            let _ = trigger.try_send(());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(
                                "Receiver events for DynamicPrefix {} lagged by {}",
                                name, n
                            );
                            let _ = trigger.try_send(());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Stop and forget the receiver registered under this name, if any.
    pub(crate) async fn cleanup_receiver(&self, name: &str) {
        let entry = {
            let mut receivers = self.receivers.write().unwrap_or_else(|e| e.into_inner());
            receivers.remove(name)
        };

        let Some(entry) = entry else {
            return;
        };

        info!("Stopping receiver for DynamicPrefix {}", name);
        entry.shutdown.cancel();
        if let Err(e) = entry.receiver.stop().await {
            error!("Failed to stop receiver for DynamicPrefix {}: {}", name, e);
        }
        entry.forwarder.abort();
    }

    /// Nudge the pool and service controllers after a DynamicPrefix status
    /// write. Fan-out is by trigger: every watched downstream re-reconciles
    /// and the ones not referencing this prefix no-op.
    pub(crate) fn notify_downstream(&self) {
        let _ = self.triggers.lb_pools.try_send(());
        let _ = self.triggers.cidr_groups.try_send(());
        let _ = self.triggers.services.try_send(());
    }

    /// Next error backoff for a resource key.
    pub(crate) fn backoff_for(&self, resource_key: &str) -> Duration {
        let mut backoffs = self.backoffs.lock().unwrap_or_else(|e| e.into_inner());
        backoffs
            .entry(resource_key.to_string())
            .or_insert_with(FibonacciBackoff::for_reconcile_errors)
            .next_backoff()
    }

    /// Reset the error backoff after a successful reconcile.
    pub(crate) fn reset_backoff(&self, resource_key: &str) {
        let mut backoffs = self.backoffs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(backoff) = backoffs.get_mut(resource_key) {
            backoff.reset();
        }
    }
}
