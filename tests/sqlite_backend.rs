#![cfg(feature = "sqlite")]

use std::sync::Arc;

use profile_store::prelude::*;
use profile_store::test::init_tracing;

async fn manager(dir: &tempfile::TempDir) -> SqlConnectionManager {
    init_tracing();
    let path = dir.path().join("profiles.db");
    let manager = SqlConnectionManager::new(format!("sqlite://{}?mode=rwc", path.display()));
    manager.setup_schema().await.unwrap();
    manager
}

#[tokio::test]
async fn upsert_only_touches_buffered_columns() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let manager = manager(&dir).await;
    let mut conn = manager.connect().await?;
    let key = ProfileKey::from("alice");

    assert_eq!(conn.load_profile(&key).await?, None);

    let mut fields = FieldSet::new();
    fields.insert(ProfileField::Balance, 150.into());
    fields.insert(ProfileField::UnlockedItems, vec!["WOOL".to_string(), "GLASS".to_string()].into());
    conn.upsert_fields(&key, &fields).await?;

    let stored = conn.load_profile(&key).await?.expect("row was inserted");
    assert_eq!(stored.balance, 150);
    assert_eq!(stored.unlocked_items, vec!["WOOL".to_string(), "GLASS".to_string()]);
    // Columns never written keep their defaults.
    assert_eq!(stored.selected_item, "AIR");
    assert_eq!(stored.selected_message, 1);

    let mut fields = FieldSet::new();
    fields.insert(ProfileField::Kills, 3.into());
    conn.upsert_fields(&key, &fields).await?;

    let stored = conn.load_profile(&key).await?.expect("row still there");
    assert_eq!(stored.balance, 150);
    assert_eq!(stored.kills, 3);

    let mut bad = FieldSet::new();
    bad.insert(ProfileField::Deaths, "many".into());
    assert!(matches!(
        conn.upsert_fields(&key, &bad).await,
        Err(StoreError::FieldType { .. })
    ));

    assert!(manager.is_valid(&mut conn).await);
    manager.close(conn).await;
    Ok(())
}

#[tokio::test]
async fn ledger_amounts_by_kind() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let manager = manager(&dir).await;
    let mut conn = manager.connect().await?;
    let key = ProfileKey::from("bob");
    let other = ProfileKey::from("carol");

    for amount in [10.0, 20.5, 30.0] {
        conn.append_ledger(&LedgerEntry::now(key.clone(), LedgerKind::Earn, amount)).await?;
    }
    conn.append_ledger(&LedgerEntry::now(key.clone(), LedgerKind::Spend, 7.0)).await?;
    conn.append_ledger(&LedgerEntry::now(other.clone(), LedgerKind::Earn, 99.0)).await?;

    let mut earned = conn.ledger_amounts(&key, LedgerKind::Earn).await?;
    earned.sort_by(f64::total_cmp);
    assert_eq!(earned, vec![10.0, 20.5, 30.0]);
    assert_eq!(conn.ledger_amounts(&key, LedgerKind::Spend).await?, vec![7.0]);

    Ok(())
}

#[tokio::test]
async fn service_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let manager = manager(&dir).await;

    let mut config = StoreConfig::default();
    config.pool.max_size = 4;
    config.pool.min_size = 1;
    config.pool.initial_size = 2;
    let service: Arc<ProfileService<SqlConnectionManager>> = ProfileService::from_config(manager.clone(), &config).await?;

    let key = ProfileKey::from("dave");
    service.on_session_start(&key).await?;
    service.mutate(&key, ProfileField::Balance, 100.into()).await?;
    service.mutate(&key, ProfileField::Balance, 150.into()).await?;
    service.mutate(&key, ProfileField::SelectedItem, "GLASS".into()).await?;
    service.record_transaction(&key, LedgerKind::Earn, 150.0).await?;
    service.on_session_end(&key).await?;

    assert_eq!(service.get_aggregate(&key, AggregateKind::Earnings).await, 150.0);
    service.shutdown().await;

    // A fresh stack over the same file sees what the first one wrote.
    let service = ProfileService::from_config(manager, &config).await?;
    let profile = service.get(&key).await?;
    assert_eq!(profile.balance, 150);
    assert_eq!(profile.selected_item, "GLASS");
    service.shutdown().await;

    Ok(())
}
