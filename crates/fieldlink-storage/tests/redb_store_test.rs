//! Integration tests for the redb reading/command store.
//!
//! Tests include:
//! - Durability across reopen
//! - Unconfirmed command listing (redelivery sweep input)
//! - Concurrent appends from many tasks

use std::sync::Arc;

use chrono::Duration;
use fieldlink_core::model::now;
use fieldlink_core::{Command, PersistenceGateway, SensorReading};
use fieldlink_storage::RedbStore;
use serde_json::json;

fn reading(device: &str, moisture: i64) -> SensorReading {
    SensorReading::new(
        device,
        json!({ "moisture": moisture }).as_object().unwrap().clone(),
        now(),
    )
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("nested").join("fieldlink.redb");

    let cmd = Command::new("pump-1", "on");
    {
        let store = RedbStore::open(&path).expect("Failed to open store");
        store.append_reading(&reading("soil-1", 42)).await.unwrap();
        store.append_command(&cmd).await.unwrap();
    }

    let store = RedbStore::open(&path).expect("Failed to reopen store");
    let latest = store.latest_reading(None).await.unwrap().unwrap();
    assert_eq!(latest.device, "soil-1");
    assert_eq!(latest.values["moisture"], json!(42));

    let commands = store.list_commands(Some("pump-1")).await.unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command, cmd);
}

#[tokio::test]
async fn test_sequence_continues_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldlink.redb");

    {
        let store = RedbStore::open(&path).unwrap();
        store.append_reading(&reading("soil-1", 1)).await.unwrap();
    }
    let store = RedbStore::open(&path).unwrap();
    store.append_reading(&reading("soil-2", 2)).await.unwrap();

    let latest = store.latest_reading(None).await.unwrap().unwrap();
    assert_eq!(latest.device, "soil-2");
}

#[tokio::test]
async fn test_unconfirmed_commands_since() {
    let store = RedbStore::memory().unwrap();
    let base = now();

    let old = Command::issued_at("pump-1", "on", base - Duration::hours(2));
    let delivered = Command::issued_at("pump-1", "off", base - Duration::minutes(5));
    let pending = Command::issued_at("valve-3", "on", base - Duration::minutes(1));

    for cmd in [&old, &delivered, &pending] {
        store.append_command(cmd).await.unwrap();
    }
    store.confirm_delivery(delivered.id, base).await.unwrap();

    let unconfirmed = store
        .unconfirmed_commands(base - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(unconfirmed, vec![pending.clone()]);

    let all_unconfirmed = store
        .unconfirmed_commands(base - Duration::days(1))
        .await
        .unwrap();
    assert_eq!(all_unconfirmed, vec![old, pending]);
}

#[tokio::test]
async fn test_list_commands_filters_by_device_in_issue_order() {
    let store = RedbStore::memory().unwrap();
    let base = now();
    let a = Command::issued_at("pump-1", "on", base);
    let b = Command::issued_at("valve-3", "on", base + Duration::seconds(1));
    let c = Command::issued_at("pump-1", "off", base + Duration::seconds(2));
    for cmd in [&c, &a, &b] {
        store.append_command(cmd).await.unwrap();
    }

    let pump: Vec<_> = store
        .list_commands(Some("pump-1"))
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.command.command)
        .collect();
    assert_eq!(pump, vec!["on", "off"]);
    assert_eq!(store.list_commands(None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_concurrent_appends() {
    let store = Arc::new(RedbStore::memory().unwrap());

    let mut handles = Vec::new();
    for task in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                let device = format!("soil-{}", task);
                store.append_reading(&reading(&device, i)).await.unwrap();
                store
                    .append_command(&Command::new(device, "on"))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.list_commands(None).await.unwrap().len(), 80);
    for task in 0..8 {
        let latest = store
            .latest_reading(Some(&format!("soil-{}", task)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.values["moisture"], json!(9));
    }
}
