//! Kubernetes resource watchers.
//!
//! One kube-runtime Controller per resource family, all sharing the same
//! `Reconciler` context. Each controller also listens on a trigger stream:
//! the DynamicPrefix controller is woken by receiver events, and the pool
//! and Service controllers are woken after every DynamicPrefix status
//! write, so downstream projections converge without waiting for a timer.

use std::sync::Arc;
use std::time::Duration;

use crds::DynamicPrefix;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::DynamicObject;
use kube::Resource;
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{watcher, Controller};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::error::ControllerError;
use crate::reconciler::{PoolKind, Reconciler};

/// Debounce window batching bursts of watch events before reconciling.
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Concurrent reconciles per controller; a single resource is always
/// reconciled by at most one worker at a time.
const CONCURRENCY: u16 = 4;

/// Watches the resources managed by the dynamic-prefix operator.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    fn config() -> ControllerConfig {
        ControllerConfig::default()
            .debounce(DEBOUNCE)
            .concurrency(CONCURRENCY)
    }

    /// Watch DynamicPrefix resources. `trigger` fires on receiver events.
    pub async fn watch_dynamic_prefixes(
        &self,
        trigger: mpsc::Receiver<()>,
    ) -> Result<(), ControllerError> {
        info!("Starting DynamicPrefix watcher");

        let reconcile = |dp: Arc<DynamicPrefix>, ctx: Arc<Reconciler>| async move {
            ctx.reconcile_dynamic_prefix(dp).await
        };
        let error_policy = |dp: Arc<DynamicPrefix>, error: &ControllerError, ctx: Arc<Reconciler>| {
            let name = dp.meta().name.clone().unwrap_or_default();
            error!("Reconciliation error for DynamicPrefix {}: {}", name, error);
            Action::requeue(ctx.backoff_for(&format!("dynamicprefix/{name}")))
        };

        Controller::new(self.reconciler.dp_api.clone(), watcher::Config::default())
            .with_config(Self::config())
            .reconcile_all_on(ReceiverStream::new(trigger))
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|result| async move {
                if let Err(e) = result {
                    error!("DynamicPrefix controller error: {}", e);
                }
            })
            .await;

        Ok(())
    }

    /// Watch CiliumLoadBalancerIPPool resources. `trigger` fires after
    /// DynamicPrefix status writes.
    pub async fn watch_lb_pools(&self, trigger: mpsc::Receiver<()>) -> Result<(), ControllerError> {
        self.watch_pools(
            self.reconciler.lb_pool_api.clone(),
            PoolKind::LoadBalancerIpPool,
            trigger,
        )
        .await
    }

    /// Watch CiliumCIDRGroup resources. `trigger` fires after DynamicPrefix
    /// status writes.
    pub async fn watch_cidr_groups(
        &self,
        trigger: mpsc::Receiver<()>,
    ) -> Result<(), ControllerError> {
        self.watch_pools(
            self.reconciler.cidr_group_api.clone(),
            PoolKind::CidrGroup,
            trigger,
        )
        .await
    }

    async fn watch_pools(
        &self,
        api: kube::Api<DynamicObject>,
        kind: PoolKind,
        trigger: mpsc::Receiver<()>,
    ) -> Result<(), ControllerError> {
        info!("Starting {} watcher", kind.kind_name());

        let reconcile = move |pool: Arc<DynamicObject>, ctx: Arc<Reconciler>| async move {
            ctx.reconcile_pool(pool, kind).await
        };
        let error_policy = move |pool: Arc<DynamicObject>,
                                 error: &ControllerError,
                                 ctx: Arc<Reconciler>| {
            let name = pool.meta().name.clone().unwrap_or_default();
            error!(
                "Reconciliation error for {} {}: {}",
                kind.kind_name(),
                name,
                error
            );
            Action::requeue(ctx.backoff_for(&format!("{}/{name}", kind.kind_name())))
        };

        Controller::new_with(api, watcher::Config::default(), kind.api_resource())
            .with_config(Self::config())
            .reconcile_all_on(ReceiverStream::new(trigger))
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(move |result| async move {
                if let Err(e) = result {
                    error!("{} controller error: {}", kind.kind_name(), e);
                }
            })
            .await;

        Ok(())
    }

    /// Watch LoadBalancer Services for HA-mode management. `trigger` fires
    /// after DynamicPrefix status writes.
    pub async fn watch_services(&self, trigger: mpsc::Receiver<()>) -> Result<(), ControllerError> {
        info!("Starting Service watcher");

        let reconcile = |svc: Arc<Service>, ctx: Arc<Reconciler>| async move {
            ctx.reconcile_service(svc).await
        };
        let error_policy = |svc: Arc<Service>, error: &ControllerError, ctx: Arc<Reconciler>| {
            let name = svc.meta().name.clone().unwrap_or_default();
            let namespace = svc.meta().namespace.clone().unwrap_or_default();
            error!(
                "Reconciliation error for Service {}/{}: {}",
                namespace, name, error
            );
            Action::requeue(ctx.backoff_for(&format!("service/{namespace}/{name}")))
        };

        Controller::new(self.reconciler.service_api.clone(), watcher::Config::default())
            .with_config(Self::config())
            .reconcile_all_on(ReceiverStream::new(trigger))
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|result| async move {
                if let Err(e) = result {
                    error!("Service controller error: {}", e);
                }
            })
            .await;

        Ok(())
    }
}
