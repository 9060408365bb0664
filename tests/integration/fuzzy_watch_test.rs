//! Fuzzy watch: catch-up on attach, single notification per new match, and
//! pattern replay after reconnect.

use std::sync::Arc;
use std::time::Duration;

use naming_sync::fuzzy::{FuzzyWatchPattern, PATTERN_OVER_LIMIT_CODE};
use naming_sync::transport::{KeyChange, PushMessage, Request};
use naming_sync::{ServiceKey, ServiceSnapshot};

use crate::common::{connected_client, eventually, instance, quiet_config, RecordingWatcher};

fn key(group: &str, name: &str) -> ServiceKey {
    ServiceKey::new("public", group, name)
}

#[tokio::test]
async fn test_catch_up_then_single_new_match() {
    let (client, transport) = connected_client(quiet_config()).await;
    for k in [
        key("g1", "order-api"),
        key("g1", "order-worker"),
        key("g1", "payments"),
        key("g2", "order-api"),
        key("g2", "billing"),
    ] {
        transport
            .push(PushMessage::Service(ServiceSnapshot::new(k, vec![instance("1.1.1.1", 80)], 1)))
            .await;
    }
    transport.set_fuzzy_matches(
        FuzzyWatchPattern::in_default_namespace("g1", "order*"),
        vec![key("g1", "order-api"), key("g1", "order-worker")],
    );

    let watcher = Arc::new(RecordingWatcher::default());
    let registration = client
        .fuzzy_watch("g1", "order*", watcher.clone())
        .await
        .unwrap();
    assert_eq!(watcher.service_names(), vec!["order-api", "order-worker"]);

    transport
        .push(PushMessage::ServiceKeyChanged {
            key: key("g1", "order-audit"),
            change: KeyChange::Added,
        })
        .await;
    transport
        .push(PushMessage::ServiceKeyChanged {
            key: key("g1", "order-audit"),
            change: KeyChange::Added,
        })
        .await;

    let events = watcher.events.lock().clone();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.change == KeyChange::Added));
    assert_eq!(events[2].key, key("g1", "order-audit"));
    assert_eq!(events[2].pattern, registration.pattern);
}

#[tokio::test]
async fn test_server_sync_adds_and_removes() {
    let (client, transport) = connected_client(quiet_config()).await;
    let watcher = Arc::new(RecordingWatcher::default());
    let registration = client.fuzzy_watch("g1", "*", watcher.clone()).await.unwrap();

    transport
        .push(PushMessage::FuzzyWatchSync {
            pattern: registration.pattern.clone(),
            keys: vec![key("g1", "a"), key("g1", "b")],
        })
        .await;
    transport
        .push(PushMessage::FuzzyWatchSync {
            pattern: registration.pattern.clone(),
            keys: vec![key("g1", "b")],
        })
        .await;

    let changes: Vec<(String, KeyChange)> = watcher
        .events
        .lock()
        .iter()
        .map(|e| (e.key.service_name().to_string(), e.change))
        .collect();
    assert_eq!(
        changes,
        vec![
            ("a".to_string(), KeyChange::Added),
            ("b".to_string(), KeyChange::Added),
            ("a".to_string(), KeyChange::Removed),
        ]
    );
}

#[tokio::test]
async fn test_pattern_replayed_with_known_keys_after_reconnect() {
    let (client, transport) = connected_client(quiet_config()).await;
    let pattern = FuzzyWatchPattern::in_default_namespace("g1", "order*");
    transport.set_fuzzy_matches(pattern.clone(), vec![key("g1", "order-api")]);

    let watcher = Arc::new(RecordingWatcher::default());
    client.fuzzy_watch("g1", "order*", watcher.clone()).await.unwrap();
    assert_eq!(watcher.service_names(), vec!["order-api"]);

    transport.drop_connection().await;
    transport.take_requests();
    assert!(client.wait_connected(Duration::from_secs(2)).await);
    assert!(eventually(|| transport.request_count("fuzzy_watch") == 1).await);

    let replayed = transport
        .requests()
        .into_iter()
        .find_map(|(_, r)| match r {
            Request::FuzzyWatch {
                received,
                initializing,
                ..
            } => Some((received, initializing)),
            _ => None,
        });
    assert_eq!(replayed, Some((vec![key("g1", "order-api")], false)));
    // Nothing new to report.
    assert_eq!(watcher.events.lock().len(), 1);
}

#[tokio::test]
async fn test_over_limit_rejection_reaches_watcher() {
    let (client, transport) = connected_client(quiet_config()).await;
    transport.set_reject(Some((PATTERN_OVER_LIMIT_CODE, "too many patterns".to_string())));

    let watcher = Arc::new(RecordingWatcher::default());
    let result = client.fuzzy_watch("g1", "*", watcher.clone()).await;
    assert!(result.is_err());
    assert_eq!(*watcher.over_limit.lock(), 1);
}
