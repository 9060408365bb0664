//! Shared utilities for integration tests.
//!
//! Builds clients on top of the in-memory mock transport and provides
//! recording listeners.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use naming_sync::fuzzy::{FuzzyWatchEvent, FuzzyWatcher};
use naming_sync::subscription::{ServiceChangeEvent, ServiceListener};
use naming_sync::transport::MockTransport;
use naming_sync::{InstanceRecord, NamingClient, NamingConfig};

/// Test config with timers long enough that only connection events and
/// explicit calls send requests.
pub fn quiet_config() -> NamingConfig {
    NamingConfig {
        redo_delay_ms: 60_000,
        fuzzy_check_interval_ms: 60_000,
        ..NamingConfig::for_test()
    }
}

/// Client on a fresh mock transport, already connected.
pub async fn connected_client(config: NamingConfig) -> (NamingClient, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let client = NamingClient::new(config, transport.clone()).unwrap();
    assert!(
        client.wait_connected(Duration::from_secs(2)).await,
        "client did not connect"
    );
    (client, transport)
}

/// Poll `check` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn instance(ip: &str, port: u16) -> InstanceRecord {
    InstanceRecord::new(ip, port).with_weight(1.0)
}

#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<ServiceChangeEvent>>,
}

impl RecordingListener {
    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn last(&self) -> Option<ServiceChangeEvent> {
        self.events.lock().last().cloned()
    }
}

impl ServiceListener for RecordingListener {
    fn on_event(&self, event: &ServiceChangeEvent) {
        self.events.lock().push(event.clone());
    }
}

#[derive(Default)]
pub struct RecordingWatcher {
    pub events: Mutex<Vec<FuzzyWatchEvent>>,
    pub over_limit: Mutex<usize>,
}

impl RecordingWatcher {
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .events
            .lock()
            .iter()
            .map(|e| e.key.service_name().to_string())
            .collect();
        names.sort();
        names
    }
}

impl FuzzyWatcher for RecordingWatcher {
    fn on_event(&self, event: &FuzzyWatchEvent) {
        self.events.lock().push(event.clone());
    }

    fn on_over_limit(&self, _pattern: &naming_sync::fuzzy::FuzzyWatchPattern) {
        *self.over_limit.lock() += 1;
    }
}
