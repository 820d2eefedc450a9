//! Shared fixtures: sample business types and a simulated device.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tillsync_model::{Scope, SyncableData};
use tillsync_storage::SqliteStore;
use tillsync_sync::remote::mock::InMemoryRemote;
use tillsync_sync::{Backoff, SyncConfig, SyncEngine, SyncRepository};
use tillsync_types::{DeviceId, EntityClass, ManualTimeSource, StoreId, Timestamp};

pub const TENANT: &str = "tenant-1";
pub const STORE: &str = "store-1";
pub const T0: i64 = 1_700_000_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn scope() -> Scope {
    Scope::new(TENANT, STORE)
}

pub fn manual_clock() -> Arc<ManualTimeSource> {
    Arc::new(ManualTimeSource::new(Timestamp::from_millis(T0)))
}

// ── Sample business types ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub price_cents: i64,
    pub quantity: i64,
}

/// A sales ticket. The total is derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub items: Vec<LineItem>,
    pub tip_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
}

impl Ticket {
    pub fn new(items: Vec<(&str, i64)>) -> Self {
        Self {
            items: items
                .into_iter()
                .map(|(name, price_cents)| LineItem {
                    name: name.to_string(),
                    price_cents,
                    quantity: 1,
                })
                .collect(),
            tip_cents: 0,
            discount_cents: 0,
            total_cents: 0,
        }
    }

    pub fn subtotal(&self) -> i64 {
        self.items.iter().map(|i| i.price_cents * i.quantity).sum()
    }
}

impl SyncableData for Ticket {
    const ENTITY_TYPE: &'static str = "ticket";
    const CLASS: EntityClass = EntityClass::Financial;

    fn recompute_derived(&mut self) {
        self.total_cents = self.subtotal() - self.discount_cents + self.tip_cents;
    }

    fn validate(&self) -> Result<(), String> {
        if self.discount_cents > self.subtotal() {
            return Err("discount exceeds subtotal".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftCard {
    pub code: String,
    pub balance_cents: i64,
}

impl SyncableData for GiftCard {
    const ENTITY_TYPE: &'static str = "gift_card";
    const CLASS: EntityClass = EntityClass::Financial;

    fn validate(&self) -> Result<(), String> {
        if self.balance_cents < 0 {
            return Err("insufficient balance".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub price_cents: i64,
}

impl Service {
    pub fn new(name: &str, price_cents: i64) -> Self {
        Self {
            name: name.to_string(),
            price_cents,
        }
    }
}

impl SyncableData for Service {
    const ENTITY_TYPE: &'static str = "service";
    const CLASS: EntityClass = EntityClass::Catalog;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub client: String,
    pub slot: String,
}

impl SyncableData for Appointment {
    const ENTITY_TYPE: &'static str = "appointment";
    const CLASS: EntityClass = EntityClass::Scheduling;
}

// ── Simulated device ─────────────────────────────────────────────

pub fn config() -> SyncConfig {
    SyncConfig {
        device_id: DeviceId::new(),
        user_id: "staff-1".into(),
        store_ids: vec![StoreId::new(STORE)],
        ..SyncConfig::default()
    }
}

/// One install of the app: its own store, repository and engine, sharing a
/// server with other devices.
pub struct Device {
    pub config: SyncConfig,
    pub store: Arc<SqliteStore>,
    pub repo: SyncRepository<SqliteStore>,
    pub engine: SyncEngine<SqliteStore, InMemoryRemote>,
    pub clock: Arc<ManualTimeSource>,
}

impl Device {
    pub fn new(remote: &Arc<InMemoryRemote>, clock: &Arc<ManualTimeSource>) -> Self {
        Self::with_config(remote, clock, config())
    }

    pub fn with_config(
        remote: &Arc<InMemoryRemote>,
        clock: &Arc<ManualTimeSource>,
        config: SyncConfig,
    ) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        Self::with_store(store, remote, clock, config)
    }

    pub fn with_store(
        store: Arc<SqliteStore>,
        remote: &Arc<InMemoryRemote>,
        clock: &Arc<ManualTimeSource>,
        config: SyncConfig,
    ) -> Self {
        let repo =
            SyncRepository::from_config_with_clock(Arc::clone(&store), &config, clock.clone())
                .unwrap();
        let engine = SyncEngine::with_clock(
            Arc::clone(&store),
            Arc::clone(remote),
            config.clone(),
            clock.clone(),
        )
        .unwrap()
        .with_backoff(
            Backoff::new(Duration::from_millis(500), Duration::from_secs(300)).without_jitter(),
        );
        Self {
            config,
            store,
            repo,
            engine,
            clock: Arc::clone(clock),
        }
    }

    pub fn store_id(&self) -> StoreId {
        StoreId::new(STORE)
    }
}
