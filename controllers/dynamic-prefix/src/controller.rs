//! Main controller implementation.
//!
//! Wires the prefix receivers, the reconciler context, and the four
//! resource watchers together:
//! - DynamicPrefix: prefix lifecycle, projections, history, conditions
//! - CiliumLoadBalancerIPPool / CiliumCIDRGroup: pool block projection
//! - Service: HA-mode annotation management

use std::sync::Arc;

use prefix::DefaultReceiverFactory;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::ControllerError;
use crate::reconciler::{Reconciler, Triggers};
use crate::watcher::Watcher;

/// Capacity of the wake-up channels between reconcilers and watchers.
/// Triggers collapse: a full channel already guarantees a pending wake-up.
const TRIGGER_CAPACITY: usize = 16;

/// Main controller for dynamic-prefix management.
pub struct Controller {
    dynamic_prefix_watcher: JoinHandle<Result<(), ControllerError>>,
    lb_pool_watcher: JoinHandle<Result<(), ControllerError>>,
    cidr_group_watcher: JoinHandle<Result<(), ControllerError>>,
    service_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance connected to the cluster.
    pub async fn new() -> Result<Self, ControllerError> {
        info!("Initializing dynamic-prefix controller");

        let client = kube::Client::try_default().await?;

        let (dp_tx, dp_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (lb_pool_tx, lb_pool_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (cidr_group_tx, cidr_group_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (service_tx, service_rx) = mpsc::channel(TRIGGER_CAPACITY);

        let reconciler = Arc::new(Reconciler::new(
            client,
            Box::new(DefaultReceiverFactory::new()),
            Triggers {
                dynamic_prefix: dp_tx,
                lb_pools: lb_pool_tx,
                cidr_groups: cidr_group_tx,
                services: service_tx,
            },
        ));

        let watcher = Arc::new(Watcher::new(reconciler));

        let dynamic_prefix_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_dynamic_prefixes(dp_rx).await })
        };

        let lb_pool_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_lb_pools(lb_pool_rx).await })
        };

        let cidr_group_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_cidr_groups(cidr_group_rx).await })
        };

        let service_watcher =
            tokio::spawn(async move { watcher.watch_services(service_rx).await });

        Ok(Self {
            dynamic_prefix_watcher,
            lb_pool_watcher,
            cidr_group_watcher,
            service_watcher,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("dynamic-prefix controller running");

        // Wait for any watcher to exit (they should run forever)
        tokio::select! {
            result = &mut self.dynamic_prefix_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("DynamicPrefix watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("DynamicPrefix watcher error: {e}")))?;
            }
            result = &mut self.lb_pool_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("CiliumLoadBalancerIPPool watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("CiliumLoadBalancerIPPool watcher error: {e}")))?;
            }
            result = &mut self.cidr_group_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("CiliumCIDRGroup watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("CiliumCIDRGroup watcher error: {e}")))?;
            }
            result = &mut self.service_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Service watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("Service watcher error: {e}")))?;
            }
        }

        Ok(())
    }
}
