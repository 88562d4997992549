//! Receiver construction from an acquisition spec.

use std::sync::Arc;

use crds::AcquisitionSpec;

use crate::composite_receiver::CompositeReceiver;
use crate::dhcpv6pd_receiver::Dhcpv6PdReceiver;
use crate::error::FactoryError;
use crate::ra_receiver::RaReceiver;
use crate::types::Receiver;

/// Creates receivers for DynamicPrefix resources.
pub trait ReceiverFactory: Send + Sync {
    /// Build a receiver tree for the given acquisition spec.
    fn create_receiver(&self, spec: &AcquisitionSpec) -> Result<Arc<dyn Receiver>, FactoryError>;
}

/// The production factory.
///
/// Decision table:
/// 1. Only DHCPv6-PD configured → PD receiver.
/// 2. Only Router Advertisement configured (and enabled) → RA receiver.
/// 3. Both configured with RA enabled → composite (PD primary, RA fallback).
/// 4. DHCPv6-PD configured with RA disabled → PD receiver alone.
/// 5. Neither → error.
#[derive(Debug, Default)]
pub struct DefaultReceiverFactory;

impl DefaultReceiverFactory {
    pub fn new() -> Self {
        Self
    }

    fn create_dhcpv6pd(spec: &crds::DHCPv6PDSpec) -> Result<Arc<Dhcpv6PdReceiver>, FactoryError> {
        if spec.interface.is_empty() {
            return Err(FactoryError::MissingInterface {
                receiver: "DHCPv6-PD",
            });
        }
        Ok(Arc::new(Dhcpv6PdReceiver::new(
            &spec.interface,
            spec.effective_prefix_length(),
        )))
    }

    fn create_ra(spec: &crds::RouterAdvertisementSpec) -> Result<Arc<RaReceiver>, FactoryError> {
        if spec.interface.is_empty() {
            return Err(FactoryError::MissingInterface {
                receiver: "router advertisement",
            });
        }
        Ok(Arc::new(RaReceiver::new(&spec.interface)))
    }
}

impl ReceiverFactory for DefaultReceiverFactory {
    fn create_receiver(&self, spec: &AcquisitionSpec) -> Result<Arc<dyn Receiver>, FactoryError> {
        let dhcpv6pd = spec.dhcpv6pd.as_ref();
        let ra = spec
            .router_advertisement
            .as_ref()
            .filter(|ra| ra.enabled);

        match (dhcpv6pd, ra) {
            (Some(pd), Some(ra)) => {
                let primary = Self::create_dhcpv6pd(pd)?;
                let fallback = Self::create_ra(ra)?;
                Ok(Arc::new(CompositeReceiver::new(primary, fallback)))
            }
            (Some(pd), None) => Ok(Self::create_dhcpv6pd(pd)?),
            (None, Some(ra)) => Ok(Self::create_ra(ra)?),
            (None, None) => Err(FactoryError::NoAcquisitionConfigured),
        }
    }
}
