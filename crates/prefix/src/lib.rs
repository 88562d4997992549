//! IPv6 prefix engine for the dynamic-prefix operator.
//!
//! Provides the pure prefix arithmetic (address ranges, subnet carving,
//! CIDR approximation) and the prefix receivers that learn the delegated
//! prefix from the network, either as a DHCPv6-PD client or by passively
//! observing Router Advertisements.

pub mod addressrange;
pub mod composite_receiver;
pub mod dhcpv6;
pub mod dhcpv6pd_receiver;
pub mod error;
pub mod factory;
pub mod iface;
pub mod mock_receiver;
pub mod ndp;
pub mod ra_receiver;
pub mod subnet;
pub mod types;

pub use addressrange::{
    address_count, calculate_address_range, calculate_address_ranges, combine_suffix,
    range_to_cidr, AddressRange, AddressRangeConfig,
};
pub use composite_receiver::CompositeReceiver;
pub use dhcpv6pd_receiver::Dhcpv6PdReceiver;
pub use error::{Dhcpv6Error, FactoryError, RangeError, ReceiverError, SubnetError};
pub use factory::{DefaultReceiverFactory, ReceiverFactory};
pub use mock_receiver::MockReceiver;
pub use ra_receiver::RaReceiver;
pub use subnet::{calculate_subnet, calculate_subnets, parse_prefix, Subnet, SubnetConfig};
pub use types::{Event, EventType, Prefix, Receiver, Source};
