//! ---
//! shdr_section: "03-adapter-server"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Change-tracked store and SHDR broadcast server."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
//! Latest value per key per observation kind, with a sent flag per entry.
//!
//! A single mutex guards every map. Callers receive copies; nothing performs
//! I/O while the lock is held.

use indexmap::IndexMap;
use parking_lot::Mutex;
use shdr_codec::{Asset, ChangeId, Observation, ObservationKind};
use tracing::trace;

#[derive(Debug, Clone)]
struct Entry<T> {
    item: T,
    change_id: ChangeId,
    sent: bool,
}

impl<T> Entry<T> {
    fn pending(item: T, change_id: ChangeId) -> Self {
        Self {
            item,
            change_id,
            sent: false,
        }
    }
}

/// Insert or replace; returns true when the stored value changed.
fn upsert_entry<T>(
    map: &mut IndexMap<String, Entry<T>>,
    key: String,
    item: T,
    change_id: ChangeId,
) -> bool {
    match map.get_mut(&key) {
        Some(entry) if entry.change_id == change_id => false,
        Some(entry) => {
            *entry = Entry::pending(item, change_id);
            true
        }
        None => {
            map.insert(key, Entry::pending(item, change_id));
            true
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    observations: IndexMap<ObservationKind, IndexMap<String, Entry<Observation>>>,
    assets: IndexMap<String, Entry<Asset>>,
}

/// Every stored value, in flush order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    /// Observations grouped by kind in flush order, insertion order within a kind.
    pub observations: Vec<Observation>,
    /// Assets in insertion order.
    pub assets: Vec<Asset>,
}

/// Change-tracked store backing the adapter server.
#[derive(Debug, Default)]
pub struct ObservationStore {
    inner: Mutex<Inner>,
}

fn asset_key(asset: &Asset) -> String {
    match &asset.device {
        Some(device) => format!("{}:{}", device, asset.asset_id),
        None => asset.asset_id.clone(),
    }
}

impl ObservationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `observation`. New keys and changed values become pending; an
    /// identical value is a no-op. Returns true when the value changed.
    pub fn upsert(&self, observation: Observation) -> bool {
        let kind = observation.kind();
        let key = observation.qualified_key();
        let change_id = observation.change_id();
        let mut inner = self.inner.lock();
        let changed = upsert_entry(
            inner.observations.entry(kind).or_default(),
            key,
            observation,
            change_id,
        );
        if changed {
            trace!(kind = kind.as_str(), change_id = %change_id, "observation pending");
        }
        changed
    }

    /// Store an asset; same replacement rules as [`ObservationStore::upsert`].
    pub fn upsert_asset(&self, asset: Asset) -> bool {
        let key = asset_key(&asset);
        let change_id = asset.change_id();
        let mut inner = self.inner.lock();
        upsert_entry(&mut inner.assets, key, asset, change_id)
    }

    /// Copies of the unsent entries of `kind`, in insertion order.
    pub fn pending(&self, kind: ObservationKind) -> Vec<Observation> {
        let inner = self.inner.lock();
        inner
            .observations
            .get(&kind)
            .map(|entries| {
                entries
                    .values()
                    .filter(|entry| !entry.sent)
                    .map(|entry| entry.item.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copies of the unsent assets.
    pub fn pending_assets(&self) -> Vec<Asset> {
        let inner = self.inner.lock();
        inner
            .assets
            .values()
            .filter(|entry| !entry.sent)
            .map(|entry| entry.item.clone())
            .collect()
    }

    /// Flag `items` as sent. An entry replaced since `items` were read keeps its
    /// pending flag so the newer value still goes out.
    pub fn mark_sent(&self, kind: ObservationKind, items: &[Observation]) {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.observations.get_mut(&kind) else {
            return;
        };
        for item in items {
            if let Some(entry) = entries.get_mut(&item.qualified_key()) {
                if entry.change_id == item.change_id() {
                    entry.sent = true;
                }
            }
        }
    }

    /// Flag `assets` as sent, with the same staleness rule as [`ObservationStore::mark_sent`].
    pub fn mark_assets_sent(&self, assets: &[Asset]) {
        let mut inner = self.inner.lock();
        for asset in assets {
            if let Some(entry) = inner.assets.get_mut(&asset_key(asset)) {
                if entry.change_id == asset.change_id() {
                    entry.sent = true;
                }
            }
        }
    }

    /// Replace every stored observation with its unavailable form stamped at
    /// `timestamp`. Assets are left untouched. Returns the number of entries changed.
    pub fn set_unavailable(&self, timestamp: i64) -> usize {
        let mut inner = self.inner.lock();
        let mut changed = 0;
        for entries in inner.observations.values_mut() {
            for entry in entries.values_mut() {
                let unavailable = entry.item.to_unavailable().at(timestamp);
                let change_id = unavailable.change_id();
                if change_id != entry.change_id {
                    *entry = Entry::pending(unavailable, change_id);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Every current value regardless of its sent flag.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.lock();
        let observations = ObservationKind::ALL
            .iter()
            .filter_map(|kind| inner.observations.get(kind))
            .flat_map(|entries| entries.values().map(|entry| entry.item.clone()))
            .collect();
        let assets = inner
            .assets
            .values()
            .map(|entry| entry.item.clone())
            .collect();
        StoreSnapshot {
            observations,
            assets,
        }
    }

    /// Number of stored observations and assets.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.observations.values().map(IndexMap::len).sum::<usize>() + inner.assets.len()
    }

    /// True when nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
