use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{
    GroupDataProvider, GroupInfo, GroupKey, KeySet, ProviderIter, ProviderIterator,
};
use crate::fabric::{self, FabricIndex};

/// Number of iterators which can be alive at the same time.
pub const MAX_ITERATORS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKeySet {
    keyset: KeySet,
    group_session_ids: Vec<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FabricTables {
    groups: Vec<GroupInfo>,
    group_keys: Vec<GroupKey>,
    keysets: Vec<StoredKeySet>,
}

/// [GroupDataProvider] keeping tables in memory, optionally persisted as json file.
/// File is rewritten after every mutation.
pub struct StoreGroupDataProvider {
    path: Option<String>,
    fabrics: Mutex<BTreeMap<FabricIndex, FabricTables>>,
    active_iterators: Arc<AtomicUsize>,
}

struct SnapshotIter<T> {
    items: std::vec::IntoIter<T>,
    total: usize,
    active: Arc<AtomicUsize>,
}

impl<T> Iterator for SnapshotIter<T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.items.next()
    }
}

impl<T> ProviderIterator<T> for SnapshotIter<T> {
    fn total(&self) -> usize {
        self.total
    }
}

impl<T> Drop for SnapshotIter<T> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        log::trace!("group store iterator released");
    }
}

impl StoreGroupDataProvider {
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            path: None,
            fabrics: Mutex::new(BTreeMap::new()),
            active_iterators: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Load tables from json file. Missing file means empty store.
    pub fn load(path: &str) -> Result<Arc<Self>> {
        let fabrics = match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).context(format!("parsing {}", path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).context(format!("reading group store {}", path)),
        };
        Ok(Arc::new(Self {
            path: Some(path.to_owned()),
            fabrics: Mutex::new(fabrics),
            active_iterators: Arc::new(AtomicUsize::new(0)),
        }))
    }

    /// Number of iterators not yet released.
    pub fn active_iterators(&self) -> usize {
        self.active_iterators.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<FabricIndex, FabricTables>>> {
        self.fabrics
            .lock()
            .map_err(|e| anyhow::anyhow!("group store lock: {}", e))
    }

    fn save(&self, fabrics: &BTreeMap<FabricIndex, FabricTables>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(fabrics)?;
        std::fs::write(path, data).context(format!("writing group store to {}", path))
    }

    /// Apply mutation to copy of fabric tables. The copy replaces the tables only
    /// together with a successful save.
    fn mutate<F>(&self, fabric: FabricIndex, f: F) -> Result<()>
    where
        F: FnOnce(&mut FabricTables) -> Result<()>,
    {
        let mut fabrics = self.lock()?;
        let mut tables = fabrics.get(&fabric).cloned().unwrap_or_default();
        f(&mut tables)?;
        let previous = fabrics.insert(fabric, tables);
        if let Err(e) = self.save(&fabrics) {
            match previous {
                Some(p) => fabrics.insert(fabric, p),
                None => fabrics.remove(&fabric),
            };
            return Err(e);
        }
        Ok(())
    }

    fn snapshot<T, F>(&self, fabric: FabricIndex, f: F) -> Result<ProviderIter<'_, T>>
    where
        T: 'static,
        F: FnOnce(&FabricTables) -> Vec<T>,
    {
        self.active_iterators
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < MAX_ITERATORS).then_some(n + 1)
            })
            .map_err(|_| anyhow::anyhow!("group store iterator pool exhausted"))?;
        let active = self.active_iterators.clone();
        let items = match self.lock() {
            Ok(fabrics) => fabrics.get(&fabric).map(f).unwrap_or_default(),
            Err(e) => {
                active.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        Ok(Box::new(SnapshotIter {
            total: items.len(),
            items: items.into_iter(),
            active,
        }))
    }
}

impl GroupDataProvider for StoreGroupDataProvider {
    fn set_group_info(&self, fabric: FabricIndex, info: &GroupInfo) -> Result<()> {
        self.mutate(fabric, |t| {
            match t.groups.iter_mut().find(|g| g.group_id == info.group_id) {
                Some(existing) => *existing = info.clone(),
                None => t.groups.push(info.clone()),
            }
            Ok(())
        })
    }

    fn remove_group_info(&self, fabric: FabricIndex, group_id: u16) -> Result<()> {
        self.mutate(fabric, |t| {
            let pos = t
                .groups
                .iter()
                .position(|g| g.group_id == group_id)
                .context(format!("group 0x{:04x} not found", group_id))?;
            t.groups.remove(pos);
            Ok(())
        })
    }

    fn iterate_group_info(&self, fabric: FabricIndex) -> Result<ProviderIter<'_, GroupInfo>> {
        self.snapshot(fabric, |t| t.groups.clone())
    }

    fn set_group_key_at(&self, fabric: FabricIndex, index: usize, key: GroupKey) -> Result<()> {
        self.mutate(fabric, |t| {
            match index.cmp(&t.group_keys.len()) {
                std::cmp::Ordering::Less => t.group_keys[index] = key,
                std::cmp::Ordering::Equal => t.group_keys.push(key),
                std::cmp::Ordering::Greater => anyhow::bail!(
                    "group key index {} out of range ({} bindings)",
                    index,
                    t.group_keys.len()
                ),
            }
            Ok(())
        })
    }

    fn remove_group_key_at(&self, fabric: FabricIndex, index: usize) -> Result<()> {
        self.mutate(fabric, |t| {
            if index >= t.group_keys.len() {
                anyhow::bail!("no group key at index {}", index);
            }
            t.group_keys.remove(index);
            Ok(())
        })
    }

    fn iterate_group_keys(&self, fabric: FabricIndex) -> Result<ProviderIter<'_, GroupKey>> {
        self.snapshot(fabric, |t| t.group_keys.clone())
    }

    fn set_key_set(&self, fabric: FabricIndex, compressed_fabric_id: &[u8], keys: &KeySet) -> Result<()> {
        if keys.epoch_keys.is_empty() || keys.epoch_keys.len() > KeySet::EPOCH_KEYS_MAX {
            anyhow::bail!(
                "keyset 0x{:04x} has {} epoch keys",
                keys.keyset_id,
                keys.epoch_keys.len()
            );
        }
        let group_session_ids = keys
            .epoch_keys
            .iter()
            .map(|ek| {
                let op = fabric::operational_group_key(compressed_fabric_id, &ek.key)?;
                fabric::group_session_id(&op)
            })
            .collect::<Result<Vec<u16>>>()?;
        let stored = StoredKeySet {
            keyset: keys.clone(),
            group_session_ids,
        };
        self.mutate(fabric, |t| {
            match t.keysets.iter_mut().find(|k| k.keyset.keyset_id == keys.keyset_id) {
                Some(existing) => *existing = stored,
                None => t.keysets.push(stored),
            }
            Ok(())
        })
    }

    fn get_key_set(&self, fabric: FabricIndex, keyset_id: u16) -> Result<Option<KeySet>> {
        let fabrics = self.lock()?;
        Ok(fabrics.get(&fabric).and_then(|t| {
            t.keysets
                .iter()
                .find(|k| k.keyset.keyset_id == keyset_id)
                .map(|k| k.keyset.clone())
        }))
    }

    fn remove_key_set(&self, fabric: FabricIndex, keyset_id: u16) -> Result<()> {
        self.mutate(fabric, |t| {
            let pos = t
                .keysets
                .iter()
                .position(|k| k.keyset.keyset_id == keyset_id)
                .context(format!("keyset 0x{:04x} not found", keyset_id))?;
            t.keysets.remove(pos);
            Ok(())
        })
    }

    fn iterate_key_sets(&self, fabric: FabricIndex) -> Result<ProviderIter<'_, KeySet>> {
        self.snapshot(fabric, |t| t.keysets.iter().map(|k| k.keyset.clone()).collect())
    }

    fn group_session_ids(&self, fabric: FabricIndex, keyset_id: u16) -> Result<Vec<u16>> {
        let fabrics = self.lock()?;
        fabrics
            .get(&fabric)
            .and_then(|t| t.keysets.iter().find(|k| k.keyset.keyset_id == keyset_id))
            .map(|k| k.group_session_ids.clone())
            .context(format!("keyset 0x{:04x} not found", keyset_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::{EpochKey, SecurityPolicy};

    fn test_path(name: &str) -> String {
        let dir = std::env::temp_dir().join(format!("matc_groups_test_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("groups.json").to_str().unwrap().to_owned()
    }

    fn keyset(id: u16) -> KeySet {
        KeySet {
            keyset_id: id,
            policy: SecurityPolicy::CacheAndSync,
            epoch_keys: vec![EpochKey {
                start_time: 10,
                key: [id as u8; EpochKey::LENGTH_BYTES],
            }],
        }
    }

    #[test]
    fn persisted_round_trip() {
        let path = test_path("persist");
        let store = StoreGroupDataProvider::load(&path).unwrap();
        store
            .set_group_info(1, &GroupInfo { group_id: 0x10, name: "kitchen".into() })
            .unwrap();
        store.set_key_set(1, &[1, 2, 3, 4, 5, 6, 7, 8], &keyset(5)).unwrap();
        store
            .set_group_key_at(1, 0, GroupKey { group_id: 0x10, keyset_id: 5 })
            .unwrap();
        let ids = store.group_session_ids(1, 5).unwrap();
        drop(store);

        let store = StoreGroupDataProvider::load(&path).unwrap();
        let groups: Vec<_> = store.iterate_group_info(1).unwrap().collect();
        assert_eq!(groups, vec![GroupInfo { group_id: 0x10, name: "kitchen".into() }]);
        assert_eq!(store.get_key_set(1, 5).unwrap(), Some(keyset(5)));
        assert_eq!(store.group_session_ids(1, 5).unwrap(), ids);
        assert_eq!(store.iterate_group_keys(1).unwrap().total(), 1);
        // other fabric is empty
        assert_eq!(store.iterate_group_info(2).unwrap().total(), 0);
    }

    #[test]
    fn failed_save_keeps_previous_state() {
        let path = test_path("save_fail");
        let store = StoreGroupDataProvider::load(&path).unwrap();
        store
            .set_group_info(1, &GroupInfo { group_id: 1, name: "hall".into() })
            .unwrap();
        std::fs::remove_dir_all(std::path::Path::new(&path).parent().unwrap()).unwrap();

        assert!(store
            .set_group_info(1, &GroupInfo { group_id: 7, name: "x".into() })
            .is_err());
        assert!(store.set_group_info(2, &GroupInfo { group_id: 7, name: "x".into() }).is_err());
        assert!(store.set_key_set(1, &[0; 8], &keyset(3)).is_err());
        assert!(store.remove_group_info(1, 1).is_err());

        let groups: Vec<_> = store.iterate_group_info(1).unwrap().collect();
        assert_eq!(groups, vec![GroupInfo { group_id: 1, name: "hall".into() }]);
        assert_eq!(store.iterate_group_info(2).unwrap().total(), 0);
        assert_eq!(store.get_key_set(1, 3).unwrap(), None);
    }

    #[test]
    fn unreadable_store_is_error() {
        let path = test_path("unreadable");
        let mut data = br#"{"1":{"groups":[{"group_id":1,"name":"a"#.to_vec();
        data.push(0xff);
        data.extend_from_slice(br#""}],"group_keys":[],"keysets":[]}}"#);
        std::fs::write(&path, &data).unwrap();
        assert!(StoreGroupDataProvider::load(&path).is_err());
        // file is left alone
        assert_eq!(std::fs::read(&path).unwrap(), data);

        let dir = test_path("store_is_dir");
        std::fs::create_dir_all(&dir).unwrap();
        assert!(StoreGroupDataProvider::load(&dir).is_err());
    }

    #[test]
    fn group_key_index_semantics() {
        let store = StoreGroupDataProvider::in_memory();
        let k = |g, k| GroupKey { group_id: g, keyset_id: k };
        store.set_group_key_at(1, 0, k(1, 1)).unwrap();
        store.set_group_key_at(1, 1, k(2, 2)).unwrap();
        store.set_group_key_at(1, 2, k(3, 3)).unwrap();
        assert!(store.set_group_key_at(1, 5, k(4, 4)).is_err());
        store.set_group_key_at(1, 0, k(1, 9)).unwrap();

        store.remove_group_key_at(1, 1).unwrap();
        let keys: Vec<_> = store.iterate_group_keys(1).unwrap().collect();
        assert_eq!(keys, vec![k(1, 9), k(3, 3)]);
        assert!(store.remove_group_key_at(1, 2).is_err());
    }

    #[test]
    fn iterators_are_bounded_and_released() {
        let store = StoreGroupDataProvider::in_memory();
        {
            let iters: Vec<_> = (0..MAX_ITERATORS)
                .map(|_| store.iterate_key_sets(1).unwrap())
                .collect();
            assert_eq!(store.active_iterators(), MAX_ITERATORS);
            assert!(store.iterate_group_info(1).is_err());
            drop(iters);
        }
        assert_eq!(store.active_iterators(), 0);
        assert!(store.iterate_group_info(1).is_ok());
        assert_eq!(store.active_iterators(), 0);
    }

    #[test]
    fn remove_missing_records_fails() {
        let store = StoreGroupDataProvider::in_memory();
        assert!(store.remove_group_info(1, 7).is_err());
        assert!(store.remove_key_set(1, 7).is_err());
        assert!(store.group_session_ids(1, 7).is_err());
    }

    #[test]
    fn keyset_epoch_key_bounds() {
        let store = StoreGroupDataProvider::in_memory();
        let mut ks = keyset(1);
        ks.epoch_keys.clear();
        assert!(store.set_key_set(1, &[0; 8], &ks).is_err());
        ks.epoch_keys = vec![keyset(1).epoch_keys[0].clone(); KeySet::EPOCH_KEYS_MAX + 1];
        assert!(store.set_key_set(1, &[0; 8], &ks).is_err());
        assert_eq!(store.iterate_key_sets(1).unwrap().total(), 0);
    }
}
