//! dynamic-prefix controller
//!
//! Keeps LoadBalancer IP pools, CIDR groups, and Services continuously
//! aligned with a dynamically delegated upstream IPv6 prefix.
//!
//! The controller learns the current prefix from the network (DHCPv6-PD
//! and/or Router Advertisements), projects it into the DynamicPrefix
//! status, and fans the result out to every annotated downstream resource.

mod backoff;
mod conditions;
mod controller;
mod error;
mod reconciler;
mod watcher;

use controller::Controller;
use error::ControllerError;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting dynamic-prefix controller");

    // Receivers open raw ICMPv6 and DHCPv6 sockets; this only works in the
    // host network namespace with CAP_NET_RAW.
    let controller = Controller::new().await?;
    controller.run().await?;

    Ok(())
}
