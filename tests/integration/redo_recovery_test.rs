//! Reconnect recovery: intents recorded while connected or disconnected are
//! replayed exactly once on the next connection.

use std::sync::Arc;
use std::time::Duration;

use naming_sync::transport::{ConnectionState, Epoch};
use naming_sync::{DisconnectedPolicy, NamingConfig, ServiceKey, ServiceSnapshot, Submission};

use crate::common::{connected_client, eventually, instance, quiet_config, RecordingListener};

fn kinds_on(requests: &[(Epoch, naming_sync::transport::Request)], epoch: Epoch) -> Vec<&'static str> {
    let mut kinds: Vec<&'static str> = requests
        .iter()
        .filter(|(e, _)| *e == epoch)
        .map(|(_, r)| r.kind())
        .collect();
    kinds.sort();
    kinds
}

#[tokio::test]
async fn test_register_survives_reconnect() {
    let (client, transport) = connected_client(quiet_config()).await;
    let key = ServiceKey::simple("s1");
    let a = instance("1.1.1.1", 8888);
    transport.set_service(ServiceSnapshot::new(key.clone(), vec![a.clone()], 1));

    assert_eq!(
        client.register_instance(&key, a.clone()).await.unwrap(),
        Submission::Acknowledged
    );
    client
        .subscribe(&key, Arc::new(RecordingListener::default()))
        .await
        .unwrap();
    transport.take_requests();

    transport.set_fail_connect(true);
    transport.drop_connection().await;
    assert!(!client.connection_state().is_connected());

    // Cache stays readable while the connection is down.
    assert_eq!(client.get_instances(&key), vec![a.clone()]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.request_count("register_instance"), 0);

    transport.set_fail_connect(false);
    assert!(client.wait_connected(Duration::from_secs(2)).await);
    let epoch = match client.connection_state() {
        ConnectionState::Connected(epoch) => epoch,
        other => panic!("unexpected state {:?}", other),
    };
    assert!(epoch > 1);

    assert!(eventually(|| transport.request_count("subscribe") == 1).await);
    assert!(eventually(|| transport.request_count("register_instance") == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let requests = transport.requests();
    assert_eq!(kinds_on(&requests, epoch), vec!["register_instance", "subscribe"]);
    assert_eq!(client.get_instances(&key), vec![a]);
}

#[tokio::test]
async fn test_queued_registration_sent_on_first_connect() {
    let transport = naming_sync::transport::MockTransport::new();
    transport.set_fail_connect(true);
    let config = NamingConfig {
        disconnected_policy: DisconnectedPolicy::Queue,
        ..quiet_config()
    };
    let client = naming_sync::NamingClient::new(config, transport.clone()).unwrap();
    let key = ServiceKey::simple("s1");

    let submission = client
        .register_instance(&key, instance("1.1.1.1", 8888))
        .await
        .unwrap();
    assert_eq!(submission, Submission::Pending);
    assert!(transport.requests().is_empty());

    transport.set_fail_connect(false);
    assert!(client.wait_connected(Duration::from_secs(2)).await);
    assert!(eventually(|| transport.request_count("register_instance") == 1).await);
}

#[tokio::test]
async fn test_deregister_while_disconnected_is_not_replayed() {
    let (client, transport) = connected_client(NamingConfig {
        disconnected_policy: DisconnectedPolicy::Queue,
        ..quiet_config()
    })
    .await;
    let key = ServiceKey::simple("s1");
    let a = instance("1.1.1.1", 8888);
    client.register_instance(&key, a.clone()).await.unwrap();

    transport.set_fail_connect(true);
    transport.drop_connection().await;
    client.deregister_instance(&key, &a).await.unwrap();
    transport.take_requests();

    transport.set_fail_connect(false);
    assert!(client.wait_connected(Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The server dropped the instance with the old connection.
    assert_eq!(transport.request_count("register_instance"), 0);
    assert_eq!(transport.request_count("deregister_instance"), 0);
}

#[tokio::test]
async fn test_failed_request_retried_by_redo_timer() {
    let (client, transport) = connected_client(NamingConfig::for_test()).await;
    let key = ServiceKey::simple("s1");

    transport.set_fail_requests(true);
    let submission = client
        .register_instance(&key, instance("1.1.1.1", 8888))
        .await
        .unwrap();
    assert_eq!(submission, Submission::Pending);

    transport.set_fail_requests(false);
    // The failed attempt is recorded too; wait for the retry.
    assert!(eventually(|| transport.request_count("register_instance") >= 2).await);
}
