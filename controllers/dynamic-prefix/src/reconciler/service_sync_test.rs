//! Unit tests for HA-mode Service IP derivation.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;

use chrono::Utc;
use crds::{
    AddressRangeSpec, DynamicPrefix, DynamicPrefixSpec, DynamicPrefixStatus, PrefixHistoryEntry,
    PrefixState, SubnetSpec, TransitionMode, TransitionSpec,
};
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Service, ServiceSpec, ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use super::service_sync::{
    apply_ip_offset, calculate_service_ips, current_service_ip, ip_offset, is_load_balancer,
};
use super::{
    ANNOTATION_ADDRESS_RANGE, ANNOTATION_SERVICE_ADDRESS_RANGE, ANNOTATION_SERVICE_SUBNET,
};

fn annotations(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn ha_dp() -> DynamicPrefix {
    let mut dp = DynamicPrefix::new(
        "home",
        DynamicPrefixSpec {
            acquisition: Default::default(),
            address_ranges: vec![AddressRangeSpec {
                name: "lb".to_string(),
                start: "::f000:0:0:0".to_string(),
                end: "::ffff:ffff:ffff:ffff".to_string(),
            }],
            subnets: vec![SubnetSpec {
                name: "services".to_string(),
                offset: 0,
                prefix_length: 64,
            }],
            transition: Some(TransitionSpec {
                mode: TransitionMode::Ha,
                max_prefix_history: Some(2),
            }),
        },
    );
    dp.status = Some(DynamicPrefixStatus {
        current_prefix: "2001:db8:1::/48".to_string(),
        history: vec![PrefixHistoryEntry {
            prefix: "2001:db8:2::/48".to_string(),
            acquired_at: Time(Utc::now() - chrono::Duration::hours(2)),
            deprecated_at: Some(Time(Utc::now())),
            state: Some(PrefixState::Draining),
        }],
        ..Default::default()
    });
    dp
}

fn lb_service(ips: &[&str]) -> Service {
    Service {
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ..Default::default()
        }),
        status: Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(
                    ips.iter()
                        .map(|ip| LoadBalancerIngress {
                            ip: Some(ip.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn address_range_mode_derives_historical_ips() {
    let dp = ha_dp();
    let current: Ipv6Addr = "2001:db8:1:0:f000::10".parse().unwrap();
    let annotations = annotations(&[(ANNOTATION_SERVICE_ADDRESS_RANGE, "lb")]);

    let ips = calculate_service_ips(&dp, &annotations, current).unwrap();
    assert_eq!(
        ips,
        vec![
            "2001:db8:1:0:f000::10".to_string(),
            "2001:db8:2:0:f000::10".to_string(),
        ]
    );
}

#[test]
fn pool_level_range_annotation_is_honored() {
    let dp = ha_dp();
    let current: Ipv6Addr = "2001:db8:1:0:f000::10".parse().unwrap();
    let annotations = annotations(&[(ANNOTATION_ADDRESS_RANGE, "lb")]);

    let ips = calculate_service_ips(&dp, &annotations, current).unwrap();
    assert_eq!(ips.len(), 2);
    assert_eq!(ips[1], "2001:db8:2:0:f000::10");
}

#[test]
fn subnet_mode_derives_historical_ips() {
    let dp = ha_dp();
    let current: Ipv6Addr = "2001:db8:1::42".parse().unwrap();
    let annotations = annotations(&[(ANNOTATION_SERVICE_SUBNET, "services")]);

    let ips = calculate_service_ips(&dp, &annotations, current).unwrap();
    assert_eq!(
        ips,
        vec!["2001:db8:1::42".to_string(), "2001:db8:2::42".to_string()]
    );
}

#[test]
fn no_annotation_uses_current_ip_verbatim() {
    let dp = ha_dp();
    let current: Ipv6Addr = "2001:db8:1::7".parse().unwrap();

    let ips = calculate_service_ips(&dp, &annotations(&[]), current).unwrap();
    assert_eq!(ips, vec!["2001:db8:1::7".to_string()]);
}

#[test]
fn unknown_range_name_falls_back_to_current_ip() {
    let dp = ha_dp();
    let current: Ipv6Addr = "2001:db8:1::7".parse().unwrap();
    let annotations = annotations(&[(ANNOTATION_SERVICE_ADDRESS_RANGE, "nope")]);

    let ips = calculate_service_ips(&dp, &annotations, current).unwrap();
    assert_eq!(ips, vec!["2001:db8:1::7".to_string()]);
}

#[test]
fn offset_math_spans_all_128_bits() {
    let base: Ipv6Addr = "2001:db8::".parse().unwrap();
    let target: Ipv6Addr = "2001:db9::".parse().unwrap();

    // The difference lives above bit 64; truncating to the low 64 bits
    // would lose it entirely.
    let offset = ip_offset(base, target);
    assert_eq!(offset, 1u128 << 96);
    assert_eq!(apply_ip_offset(base, offset), Some(target));

    // Round trip through an arbitrary in-range address
    let base: Ipv6Addr = "2001:db8:1:0:f000::".parse().unwrap();
    let addr: Ipv6Addr = "2001:db8:1:0:f000::10".parse().unwrap();
    let offset = ip_offset(base, addr);
    assert_eq!(offset, 0x10);

    let hist_base: Ipv6Addr = "2001:db8:2:0:f000::".parse().unwrap();
    assert_eq!(
        apply_ip_offset(hist_base, offset),
        Some("2001:db8:2:0:f000::10".parse().unwrap())
    );
}

#[test]
fn offset_overflow_is_rejected() {
    let base: Ipv6Addr = "ffff:ffff:ffff:ffff:ffff:ffff:ffff:fffe".parse().unwrap();
    assert_eq!(apply_ip_offset(base, 2), None);
    assert_eq!(apply_ip_offset(base, 1), Some(Ipv6Addr::from(u128::MAX)));
}

#[test]
fn ingress_ip_extraction_prefers_ipv6() {
    let svc = lb_service(&["192.0.2.10", "2001:db8:1::5"]);
    assert_eq!(
        current_service_ip(&svc),
        Some("2001:db8:1::5".parse().unwrap())
    );

    // IPv4-only status yields nothing to manage.
    let svc = lb_service(&["192.0.2.10"]);
    assert_eq!(current_service_ip(&svc), None);

    let svc = lb_service(&[]);
    assert_eq!(current_service_ip(&svc), None);
}

#[test]
fn only_load_balancer_services_are_considered() {
    assert!(is_load_balancer(&lb_service(&[])));

    let cluster_ip = Service {
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert!(!is_load_balancer(&cluster_ip));
    assert!(!is_load_balancer(&Service::default()));
}
