//! Local backup: changed snapshots are persisted and serve as a provisional
//! cache on the next start.

use std::path::Path;
use std::time::Duration;

use naming_sync::cache::LocalBackup;
use naming_sync::transport::{MockTransport, PushMessage};
use naming_sync::{NamingClient, NamingConfig, ServiceKey, ServiceSnapshot};

use crate::common::{connected_client, eventually, instance, quiet_config};

fn backup_config(dir: &Path) -> NamingConfig {
    NamingConfig {
        backup_enabled: true,
        cache_dir: Some(dir.to_path_buf()),
        ..quiet_config()
    }
}

async fn write_backup(dir: &Path, key: &ServiceKey, revision: u64) {
    let (client, transport) = connected_client(backup_config(dir)).await;
    transport
        .push(PushMessage::Service(ServiceSnapshot::new(
            key.clone(),
            vec![instance("1.1.1.1", 8888)],
            revision,
        )))
        .await;

    let path = LocalBackup::new(dir).path_for(key);
    assert!(eventually(|| path.exists()).await, "backup file not written");
    client.shutdown().await;
}

#[tokio::test]
async fn test_backup_loaded_at_start() {
    let dir = tempfile::tempdir().unwrap();
    let key = ServiceKey::simple("s1");
    write_backup(dir.path(), &key, 5).await;

    let transport = MockTransport::new();
    transport.set_fail_connect(true);
    let config = NamingConfig {
        load_cache_at_start: true,
        ..backup_config(dir.path())
    };
    let client = NamingClient::new(config, transport).unwrap();
    assert_eq!(client.get_instances(&key), vec![instance("1.1.1.1", 8888)]);
}

#[tokio::test]
async fn test_provisional_snapshot_replaced_by_any_push() {
    let dir = tempfile::tempdir().unwrap();
    let key = ServiceKey::simple("s1");
    write_backup(dir.path(), &key, 5).await;

    let (client, transport) = connected_client(NamingConfig {
        load_cache_at_start: true,
        ..backup_config(dir.path())
    })
    .await;
    assert_eq!(client.get_instances(&key).len(), 1);

    // Lower revision than the backup, but the backup is only provisional.
    transport
        .push(PushMessage::Service(ServiceSnapshot::new(
            key.clone(),
            vec![instance("2.2.2.2", 8888)],
            1,
        )))
        .await;
    assert_eq!(client.get_instances(&key), vec![instance("2.2.2.2", 8888)]);
}

#[tokio::test]
async fn test_unknown_key_seeded_from_backup_while_offline() {
    let dir = tempfile::tempdir().unwrap();
    let key = ServiceKey::simple("s1");
    write_backup(dir.path(), &key, 3).await;

    let transport = MockTransport::new();
    transport.set_fail_connect(true);
    let client = NamingClient::new(backup_config(dir.path()), transport).unwrap();

    assert!(client.get_instances(&key).is_empty());
    assert!(eventually(|| !client.get_instances(&key).is_empty()).await);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.get_instances(&key), vec![instance("1.1.1.1", 8888)]);
}
