//! Server pushes flowing through the reconciler to subscribers.

use std::sync::Arc;

use naming_sync::transport::{PushAck, PushMessage};
use naming_sync::{ServiceKey, ServiceSnapshot};

use crate::common::{connected_client, instance, quiet_config, RecordingListener};

#[tokio::test]
async fn test_push_sequence_reports_diffs() {
    let (client, transport) = connected_client(quiet_config()).await;
    let key = ServiceKey::simple("s1");
    let (a, b, c) = (
        instance("1.1.1.1", 8888),
        instance("2.2.2.2", 8888),
        instance("3.3.3.3", 8888),
    );
    let listener = Arc::new(RecordingListener::default());
    client.subscribe(&key, listener.clone()).await.unwrap();
    let baseline = listener.count();

    let push = |instances, revision| {
        PushMessage::Service(ServiceSnapshot::new(key.clone(), instances, revision))
    };

    assert_eq!(transport.push(push(vec![a.clone(), b.clone()], 1)).await, PushAck::Ack);
    assert_eq!(listener.count(), baseline + 1);

    assert_eq!(transport.push(push(vec![a.clone(), c.clone()], 2)).await, PushAck::Ack);
    let event = listener.last().unwrap();
    assert_eq!(event.diff.added, vec![c.clone()]);
    assert_eq!(event.diff.removed, vec![b]);
    assert!(event.diff.modified.is_empty());

    // Same content again: stored, not announced.
    assert_eq!(transport.push(push(vec![c, a], 3)).await, PushAck::Ack);
    assert_eq!(listener.count(), baseline + 2);
}

#[tokio::test]
async fn test_out_of_order_push_is_dropped() {
    let (client, transport) = connected_client(quiet_config()).await;
    let key = ServiceKey::simple("s1");
    let a = instance("1.1.1.1", 8888);

    transport
        .push(PushMessage::Service(ServiceSnapshot::new(key.clone(), vec![a.clone()], 7)))
        .await;
    let ack = transport
        .push(PushMessage::Service(ServiceSnapshot::new(key.clone(), vec![], 6)))
        .await;
    assert_eq!(ack, PushAck::Ack);
    assert_eq!(client.get_instances(&key), vec![a]);
}

#[tokio::test]
async fn test_delta_push_applies_on_cached_list() {
    let (client, transport) = connected_client(quiet_config()).await;
    let key = ServiceKey::simple("s1");
    let (a, b, c) = (
        instance("1.1.1.1", 8888),
        instance("2.2.2.2", 8888),
        instance("3.3.3.3", 8888),
    );
    transport
        .push(PushMessage::Service(ServiceSnapshot::new(
            key.clone(),
            vec![a.clone(), b.clone()],
            1,
        )))
        .await;

    let ack = transport
        .push(PushMessage::ServiceDelta {
            key: key.clone(),
            revision: 2,
            upserted: vec![c.clone()],
            removed: vec![b.identity()],
        })
        .await;
    assert_eq!(ack, PushAck::Ack);

    let mut ips: Vec<String> = client.get_instances(&key).into_iter().map(|i| i.ip).collect();
    ips.sort();
    assert_eq!(ips, vec![a.ip, c.ip]);
}

#[tokio::test]
async fn test_batch_push_isolates_invalid_key() {
    let (client, transport) = connected_client(quiet_config()).await;
    let good = ServiceKey::simple("good");
    let bad = ServiceKey::simple("bad");

    let ack = transport
        .push(PushMessage::ServiceBatch(vec![
            ServiceSnapshot::new(bad.clone(), vec![instance("1.1.1.1", 80).with_weight(-1.0)], 1),
            ServiceSnapshot::new(good.clone(), vec![instance("2.2.2.2", 80)], 1),
        ]))
        .await;

    assert!(matches!(ack, PushAck::Nack(_)));
    assert_eq!(client.get_instances(&good).len(), 1);
    assert!(client.get_instances(&bad).is_empty());
}

#[tokio::test]
async fn test_selection_follows_pushes() {
    let (client, transport) = connected_client(quiet_config()).await;
    let key = ServiceKey::simple("s1");
    let healthy = instance("1.1.1.1", 8888);
    let sick = instance("2.2.2.2", 8888).with_healthy(false);
    let idle = instance("3.3.3.3", 8888).with_weight(0.0);

    transport
        .push(PushMessage::Service(ServiceSnapshot::new(
            key.clone(),
            vec![healthy.clone(), sick, idle],
            1,
        )))
        .await;

    assert_eq!(client.get_instances(&key).len(), 3);
    for _ in 0..20 {
        assert_eq!(client.select_one_healthy_instance(&key).unwrap(), healthy);
    }
}
