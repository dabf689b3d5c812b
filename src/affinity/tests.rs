use std::time::{Duration, Instant};

use tungstenite::http::{HeaderMap, HeaderValue, header};

use super::*;
use crate::presence::{HealthState, PresenceRecord, PresenceTracker};

fn cookie() -> AffinityCookie {
    AffinityCookie::new("node_affinity", Duration::from_secs(3600))
}

fn tracker_with(nodes: &[(&str, HealthState, u32)]) -> PresenceTracker {
    let tracker = PresenceTracker::new(Duration::from_secs(15));
    for (node, health, count) in nodes {
        tracker.observe(PresenceRecord::new(*node, *health, *count));
    }
    tracker
}

#[test]
fn set_cookie_carries_flags() {
    let token = AffinityToken::new("abc123");
    let value = cookie().set_cookie(&token);

    assert!(value.starts_with("node_affinity=abc123;"));
    assert!(value.contains("Max-Age=3600"));
    assert!(value.contains("HttpOnly"));
    assert!(value.contains("Secure"));
    assert!(value.contains("SameSite=Lax"));
}

#[test]
fn cookie_parse_finds_named_pair() {
    let c = cookie();
    assert_eq!(
        c.parse("theme=dark; node_affinity=tok-1; lang=en"),
        Some(AffinityToken::new("tok-1"))
    );
    assert_eq!(c.parse("node_affinity=\"quoted\""), Some(AffinityToken::new("quoted")));
    assert_eq!(c.parse("node_affinity=; other=1"), None);
    assert_eq!(c.parse("something=else"), None);
}

#[test]
fn header_token_wins_over_cookie() {
    let mut headers = HeaderMap::new();
    headers.insert(header::COOKIE, HeaderValue::from_static("node_affinity=from-cookie"));
    assert_eq!(
        token_from_request(&headers, &cookie()),
        Some(AffinityToken::new("from-cookie"))
    );

    headers.insert(AFFINITY_HEADER, HeaderValue::from_static("from-header"));
    assert_eq!(
        token_from_request(&headers, &cookie()),
        Some(AffinityToken::new("from-header"))
    );

    assert_eq!(token_from_request(&HeaderMap::new(), &cookie()), None);
}

#[test]
fn binding_sticks_while_node_keeps_sessions() {
    let tracker = tracker_with(&[("A", HealthState::Healthy, 0), ("B", HealthState::Draining, 0)]);
    let table = AffinityTable::new(Duration::from_secs(60));
    let to_a = AffinityToken::new("t-a");
    let to_b = AffinityToken::new("t-b");
    table.bind(to_a.clone(), "A");
    table.bind(to_b.clone(), "B");

    assert_eq!(table.resolve(&to_a, &tracker), Resolution::Sticky("A".into()));
    assert_eq!(table.resolve(&to_b, &tracker), Resolution::Sticky("B".into()));
    assert_eq!(
        table.resolve(&AffinityToken::new("unknown"), &tracker),
        Resolution::Reselect
    );
}

#[test]
fn unreachable_node_loses_all_bindings() {
    let tracker = PresenceTracker::new(Duration::from_millis(100));
    let long_ago = Instant::now();
    tracker.observe_at(PresenceRecord::new("A", HealthState::Healthy, 2), long_ago);

    let table = AffinityTable::new(Duration::from_secs(60));
    table.bind_at(AffinityToken::new("one"), "A", long_ago);
    table.bind_at(AffinityToken::new("two"), "A", long_ago);

    let later = long_ago + Duration::from_millis(500);
    assert_eq!(
        table.resolve_at(&AffinityToken::new("one"), &tracker, later),
        Resolution::Reselect
    );
    assert!(table.is_empty());
}

#[test]
fn expired_binding_is_reselected() {
    let tracker = tracker_with(&[("A", HealthState::Healthy, 0)]);
    let table = AffinityTable::new(Duration::from_secs(1));
    let now = Instant::now();
    let token = AffinityToken::new("t");
    table.bind_at(token.clone(), "A", now);

    assert_eq!(
        table.resolve_at(&token, &tracker, now + Duration::from_secs(2)),
        Resolution::Reselect
    );
    assert_eq!(table.len(), 0);
}

#[test]
fn selection_prefers_least_loaded_healthy_node() {
    let tracker = tracker_with(&[
        ("A", HealthState::Healthy, 10),
        ("B", HealthState::Healthy, 3),
        ("C", HealthState::Draining, 0),
        ("D", HealthState::Starting, 0),
    ]);
    let table = AffinityTable::new(Duration::from_secs(60));
    assert_eq!(table.select_node(&tracker), Some("B".to_string()));

    let empty = PresenceTracker::new(Duration::from_secs(1));
    assert_eq!(table.select_node(&empty), None);
}

#[test]
fn route_binds_new_clients_and_keeps_existing_ones() {
    let tracker = tracker_with(&[("A", HealthState::Healthy, 0)]);
    let table = AffinityTable::new(Duration::from_secs(60));

    let (token, node) = table.route(None, &tracker).unwrap();
    assert_eq!(node, "A");
    assert_eq!(table.len(), 1);

    let (again, node) = table.route(Some(&token), &tracker).unwrap();
    assert_eq!(again, token);
    assert_eq!(node, "A");
    assert_eq!(table.invalidate_node("A"), 1);
}
