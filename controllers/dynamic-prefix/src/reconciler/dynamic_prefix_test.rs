//! Unit tests for the DynamicPrefix reconciler's pure parts: history
//! handling, projections, and requeue timing.

use std::time::Duration;

use chrono::Utc;
use crds::{
    AddressRangeSpec, DynamicPrefix, DynamicPrefixSpec, DynamicPrefixStatus, PrefixState,
    SubnetSpec, TransitionSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use prefix::{Prefix, Source};

use super::dynamic_prefix::{
    calculate_requeue, has_finalizer, project_address_ranges, project_subnets, push_history,
};
use super::FINALIZER;

fn test_dp(max_history: Option<u32>) -> DynamicPrefix {
    let mut dp = DynamicPrefix::new(
        "home",
        DynamicPrefixSpec {
            acquisition: Default::default(),
            address_ranges: vec![AddressRangeSpec {
                name: "lb".to_string(),
                start: "::f000:0:0:0".to_string(),
                end: "::ffff:ffff:ffff:ffff".to_string(),
            }],
            subnets: vec![],
            transition: max_history.map(|n| TransitionSpec {
                mode: Default::default(),
                max_prefix_history: Some(n),
            }),
        },
    );
    dp.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::hours(1)));
    dp
}

fn status_with_prefix(prefix: &str) -> DynamicPrefixStatus {
    DynamicPrefixStatus {
        current_prefix: prefix.to_string(),
        ..Default::default()
    }
}

#[test]
fn prefix_change_pushes_draining_history() {
    let dp = test_dp(None);
    let mut status = status_with_prefix("2001:db8:1::/48");

    push_history(&mut status, &dp, PrefixState::Draining);

    assert_eq!(status.history.len(), 1);
    let entry = &status.history[0];
    assert_eq!(entry.prefix, "2001:db8:1::/48");
    assert_eq!(entry.state, Some(PrefixState::Draining));

    // First rotation: acquisition time falls back to resource creation.
    assert_eq!(
        entry.acquired_at,
        dp.metadata.creation_timestamp.clone().unwrap()
    );
    let deprecated = entry.deprecated_at.clone().unwrap();
    assert!(entry.acquired_at.0 <= deprecated.0);
    assert!(deprecated.0 <= Utc::now());
}

#[test]
fn second_rotation_carries_acquisition_time_forward() {
    let dp = test_dp(None);
    let mut status = status_with_prefix("2001:db8:1::/48");

    push_history(&mut status, &dp, PrefixState::Draining);
    let first_deprecated = status.history[0].deprecated_at.clone().unwrap();

    status.current_prefix = "2001:db8:2::/48".to_string();
    push_history(&mut status, &dp, PrefixState::Draining);

    // The second prefix became current when the first was deprecated.
    assert_eq!(status.history[1].acquired_at, first_deprecated);
}

#[test]
fn history_is_truncated_from_the_oldest_end() {
    let dp = test_dp(Some(2));
    let mut status = status_with_prefix("2001:db8:1::/48");

    for i in 2..6 {
        push_history(&mut status, &dp, PrefixState::Draining);
        status.current_prefix = format!("2001:db8:{i}::/48");
    }

    assert_eq!(status.history.len(), 2);
    assert_eq!(status.history[0].prefix, "2001:db8:3::/48");
    assert_eq!(status.history[1].prefix, "2001:db8:4::/48");
}

#[test]
fn address_range_projection_matches_prefix_rotation() {
    let dp = test_dp(None);
    let mut failures = Vec::new();

    let ranges = project_address_ranges(
        "2001:db8:1::/48".parse().unwrap(),
        &dp.spec.address_ranges,
        &mut failures,
    );

    assert!(failures.is_empty());
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].name, "lb");
    assert_eq!(ranges[0].start, "2001:db8:1:0:f000::");
    assert_eq!(ranges[0].end, "2001:db8:1:0:ffff:ffff:ffff:ffff");

    // Same spec against the rotated prefix yields the rebased range.
    let ranges = project_address_ranges(
        "2001:db8:2::/48".parse().unwrap(),
        &dp.spec.address_ranges,
        &mut failures,
    );
    assert_eq!(ranges[0].start, "2001:db8:2:0:f000::");
    assert_eq!(ranges[0].end, "2001:db8:2:0:ffff:ffff:ffff:ffff");
}

#[test]
fn bad_suffix_degrades_without_dropping_good_ranges() {
    let specs = vec![
        AddressRangeSpec {
            name: "good".to_string(),
            start: "::1".to_string(),
            end: "::10".to_string(),
        },
        AddressRangeSpec {
            name: "bad".to_string(),
            start: "not-an-address".to_string(),
            end: "::10".to_string(),
        },
    ];

    let mut failures = Vec::new();
    let ranges =
        project_address_ranges("2001:db8:1::/48".parse().unwrap(), &specs, &mut failures);

    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].name, "good");
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("bad"));
}

#[test]
fn subnet_projection_collects_failures() {
    let specs = vec![
        SubnetSpec {
            name: "services".to_string(),
            offset: 0,
            prefix_length: 64,
        },
        SubnetSpec {
            name: "too-short".to_string(),
            offset: 0,
            prefix_length: 40,
        },
    ];

    let mut failures = Vec::new();
    let subnets = project_subnets("2001:db8:cafe::/48".parse().unwrap(), &specs, &mut failures);

    assert_eq!(subnets.len(), 1);
    assert_eq!(subnets[0].cidr, "2001:db8:cafe::/64");
    assert_eq!(failures.len(), 1);
}

#[test]
fn requeue_tracks_the_lease() {
    let mut prefix = Prefix {
        network: "2001:db8:1::/48".parse().unwrap(),
        valid_lifetime: Duration::from_secs(3600),
        preferred_lifetime: Duration::from_secs(1800),
        source: Source::Dhcpv6Pd,
        received_at: Utc::now(),
    };

    // 80 % of an hour is 48 minutes, clamped to the 5 minute ceiling.
    assert_eq!(calculate_requeue(&prefix), Duration::from_secs(300));

    // A lease about to expire clamps to the 1 minute floor.
    prefix.valid_lifetime = Duration::from_secs(30);
    assert_eq!(calculate_requeue(&prefix), Duration::from_secs(60));

    // No lifetime: poll every 5 minutes.
    prefix.valid_lifetime = Duration::ZERO;
    assert_eq!(calculate_requeue(&prefix), Duration::from_secs(300));
}

#[test]
fn finalizer_detection() {
    let mut dp = test_dp(None);
    assert!(!has_finalizer(&dp));

    dp.metadata.finalizers = Some(vec!["other/finalizer".to_string()]);
    assert!(!has_finalizer(&dp));

    dp.metadata
        .finalizers
        .as_mut()
        .unwrap()
        .push(FINALIZER.to_string());
    assert!(has_finalizer(&dp));
}
