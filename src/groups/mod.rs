//! Fabric scoped group records, keysets and group to keyset bindings.
//!
//! The records are owned by a [GroupDataProvider]; [settings::GroupSettings] is the
//! administrative front end used by controller tooling.

mod settings;
mod store;

pub use settings::{GroupRow, GroupSettings};
pub use store::StoreGroupDataProvider;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::fabric::FabricIndex;

/// Reserved group id, never valid for a group record.
pub const K_UNDEFINED_GROUP_ID: u16 = 0;
pub const MAX_GROUP_NAME_LENGTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: u16,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityPolicy {
    TrustFirst = 0,
    CacheAndSync = 1,
}

impl TryFrom<u8> for SecurityPolicy {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SecurityPolicy::TrustFirst),
            1 => Ok(SecurityPolicy::CacheAndSync),
            v => Err(anyhow::anyhow!("unknown key policy {}", v)),
        }
    }
}

impl std::fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityPolicy::TrustFirst => write!(f, "Trust First"),
            SecurityPolicy::CacheAndSync => write!(f, "Cache and Sync"),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochKey {
    pub start_time: u64,
    #[serde(with = "hex_key")]
    pub key: [u8; EpochKey::LENGTH_BYTES],
}

impl EpochKey {
    pub const LENGTH_BYTES: usize = 16;
}

// key material stays out of logs
impl std::fmt::Debug for EpochKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochKey")
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    pub keyset_id: u16,
    pub policy: SecurityPolicy,
    pub epoch_keys: Vec<EpochKey>,
}

impl KeySet {
    pub const EPOCH_KEYS_MAX: usize = 3;
}

/// Binding of group to keyset protecting its traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKey {
    pub group_id: u16,
    pub keyset_id: u16,
}

/// Iterator handed out by provider. Provider side resources are released on drop.
pub trait ProviderIterator<T>: Iterator<Item = T> {
    /// Number of records in iterated table.
    fn total(&self) -> usize;
}

pub type ProviderIter<'a, T> = Box<dyn ProviderIterator<T> + 'a>;

/// Persistent store of group records. All tables are scoped by fabric index.
pub trait GroupDataProvider: Send + Sync {
    /// Insert or replace group record with same id.
    fn set_group_info(&self, fabric: FabricIndex, info: &GroupInfo) -> Result<()>;
    fn remove_group_info(&self, fabric: FabricIndex, group_id: u16) -> Result<()>;
    fn iterate_group_info(&self, fabric: FabricIndex) -> Result<ProviderIter<'_, GroupInfo>>;

    /// Overwrite binding at index, or append when index equals number of bindings.
    fn set_group_key_at(&self, fabric: FabricIndex, index: usize, key: GroupKey) -> Result<()>;
    /// Remove binding at index; later bindings move one position down.
    fn remove_group_key_at(&self, fabric: FabricIndex, index: usize) -> Result<()>;
    fn iterate_group_keys(&self, fabric: FabricIndex) -> Result<ProviderIter<'_, GroupKey>>;

    fn set_key_set(&self, fabric: FabricIndex, compressed_fabric_id: &[u8], keys: &KeySet) -> Result<()>;
    fn get_key_set(&self, fabric: FabricIndex, keyset_id: u16) -> Result<Option<KeySet>>;
    fn remove_key_set(&self, fabric: FabricIndex, keyset_id: u16) -> Result<()>;
    fn iterate_key_sets(&self, fabric: FabricIndex) -> Result<ProviderIter<'_, KeySet>>;

    /// Group session ids derived for keyset epoch keys, in epoch key order.
    fn group_session_ids(&self, fabric: FabricIndex, keyset_id: u16) -> Result<Vec<u16>>;
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::EpochKey;

    pub fn serialize<S>(key: &[u8; EpochKey::LENGTH_BYTES], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; EpochKey::LENGTH_BYTES], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut out = [0u8; EpochKey::LENGTH_BYTES];
        hex::decode_to_slice(&s, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}
