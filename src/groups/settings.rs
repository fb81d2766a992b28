use std::sync::Arc;

use super::{
    EpochKey, GroupDataProvider, GroupInfo, GroupKey, KeySet, SecurityPolicy,
    K_UNDEFINED_GROUP_ID, MAX_GROUP_NAME_LENGTH,
};
use crate::{
    error::{Error, Result},
    fabric::{Fabric, FabricIndex},
};

const TABLE_WIDTH: usize = 60;

/// Row of group table: group with first keyset bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRow {
    pub group_id: u16,
    pub keyset_id: Option<u16>,
    pub name: String,
}

/// Administrative operations over group records of one fabric.
///
/// Every call goes straight to the provider, nothing is cached between calls.
pub struct GroupSettings {
    provider: Arc<dyn GroupDataProvider>,
    fabric_index: FabricIndex,
    compressed_fabric_id: Vec<u8>,
}

fn border() -> String {
    format!("  +{}+", "-".repeat(TABLE_WIDTH))
}

fn title(text: &str) -> String {
    format!("  | {:<w$}|", text, w = TABLE_WIDTH - 1)
}

fn group_line(id: &str, keyset: &str, name: &str) -> String {
    format!("  | {:<11}|  {:<14}|   {:<27}|", id, keyset, name)
}

fn keyset_line(id: &str, policy: &str) -> String {
    format!("  | {:<11}|   {:<44}|", id, policy)
}

fn emit(lines: Vec<String>) -> String {
    for l in &lines {
        log::info!("{}", l);
    }
    lines.join("\n")
}

fn parse_epoch_key(hex_key: &str) -> Result<[u8; EpochKey::LENGTH_BYTES]> {
    let s = hex_key.strip_prefix("hex:").unwrap_or(hex_key);
    let raw = hex::decode(s).map_err(|e| Error::invalid(format!("epoch key is not hex: {}", e)))?;
    raw.as_slice().try_into().map_err(|_| {
        Error::invalid(format!(
            "epoch key must be {} bytes, got {}",
            EpochKey::LENGTH_BYTES,
            raw.len()
        ))
    })
}

impl GroupSettings {
    pub fn new(provider: Arc<dyn GroupDataProvider>, fabric: &Fabric) -> anyhow::Result<Self> {
        Ok(Self {
            provider,
            fabric_index: fabric.index,
            compressed_fabric_id: fabric.compressed()?,
        })
    }

    pub fn fabric_index(&self) -> FabricIndex {
        self.fabric_index
    }

    /// First keyset bound to group, in binding order.
    fn bound_keyset(&self, group_id: u16) -> anyhow::Result<Option<u16>> {
        let mut iter = self.provider.iterate_group_keys(self.fabric_index)?;
        Ok(iter.find(|k| k.group_id == group_id).map(|k| k.keyset_id))
    }

    /// Groups of fabric with their bound keyset. Provider errors are logged and cut the list short.
    pub fn group_rows(&self) -> Vec<GroupRow> {
        let groups = match self.provider.iterate_group_info(self.fabric_index) {
            Ok(iter) => iter.collect::<Vec<GroupInfo>>(),
            Err(e) => {
                log::error!("failed to iterate groups: {:#}", e);
                return Vec::new();
            }
        };
        groups
            .into_iter()
            .map(|g| {
                let keyset_id = self.bound_keyset(g.group_id).unwrap_or_else(|e| {
                    log::error!("failed to iterate group keys: {:#}", e);
                    None
                });
                GroupRow {
                    group_id: g.group_id,
                    keyset_id,
                    name: g.name,
                }
            })
            .collect()
    }

    /// Render and log group table.
    pub fn show_groups(&self) -> String {
        let mut lines = vec![
            border(),
            title("Available Groups :"),
            border(),
            group_line("Group Id", "KeySet Id", "Group Name"),
        ];
        for row in self.group_rows() {
            let keyset = row
                .keyset_id
                .map(|k| format!("0x{:04x}", k))
                .unwrap_or_else(|| "None".to_owned());
            lines.push(group_line(&format!("0x{:04x}", row.group_id), &keyset, &row.name));
        }
        lines.push(border());
        emit(lines)
    }

    pub fn add_group(&self, name: &str, group_id: u16) -> Result<()> {
        if group_id == K_UNDEFINED_GROUP_ID {
            return Err(Error::invalid("undefined group id"));
        }
        if name.len() > MAX_GROUP_NAME_LENGTH {
            return Err(Error::invalid(format!(
                "group name longer than {} bytes",
                MAX_GROUP_NAME_LENGTH
            )));
        }
        let info = GroupInfo {
            group_id,
            name: name.to_owned(),
        };
        self.provider
            .set_group_info(self.fabric_index, &info)
            .inspect_err(|e| log::error!("failed to set group info 0x{:04x}: {:#}", group_id, e))?;
        log::debug!("group 0x{:04x} '{}' stored", group_id, name);
        Ok(())
    }

    pub fn remove_group(&self, group_id: u16) -> Result<()> {
        if group_id == K_UNDEFINED_GROUP_ID {
            return Err(Error::invalid("undefined group id"));
        }
        self.provider
            .remove_group_info(self.fabric_index, group_id)
            .inspect_err(|e| log::error!("failed to remove group 0x{:04x}: {:#}", group_id, e))?;
        Ok(())
    }

    pub fn keysets(&self) -> Vec<KeySet> {
        match self.provider.iterate_key_sets(self.fabric_index) {
            Ok(iter) => iter.collect(),
            Err(e) => {
                log::error!("failed to iterate keysets: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Render and log keyset table.
    pub fn show_keysets(&self) -> String {
        let mut lines = vec![
            border(),
            title("Available KeySets :"),
            border(),
            keyset_line("KeySet Id", "Key Policy"),
        ];
        for ks in self.keysets() {
            lines.push(keyset_line(&format!("0x{:04x}", ks.keyset_id), &ks.policy.to_string()));
        }
        lines.push(border());
        emit(lines)
    }

    /// Append binding. Existing bindings of the group are kept; lookups see the first one.
    pub fn bind_keyset(&self, group_id: u16, keyset_id: u16) -> Result<()> {
        let index = self.provider.iterate_group_keys(self.fabric_index)?.total();
        self.provider
            .set_group_key_at(self.fabric_index, index, GroupKey { group_id, keyset_id })
            .inspect_err(|e| log::error!("failed to bind keyset 0x{:04x}: {:#}", keyset_id, e))?;
        log::debug!(
            "group 0x{:04x} bound to keyset 0x{:04x} at index {}",
            group_id,
            keyset_id,
            index
        );
        Ok(())
    }

    pub fn unbind_keyset(&self, group_id: u16, keyset_id: u16) -> Result<()> {
        let index = self
            .provider
            .iterate_group_keys(self.fabric_index)?
            .position(|k| k.group_id == group_id && k.keyset_id == keyset_id);
        let Some(index) = index else {
            log::error!(
                "no binding of group 0x{:04x} to keyset 0x{:04x}",
                group_id,
                keyset_id
            );
            return Err(Error::NotFound);
        };
        self.provider
            .remove_group_key_at(self.fabric_index, index)
            .inspect_err(|e| log::error!("failed to remove group key at {}: {:#}", index, e))?;
        Ok(())
    }

    /// Store keyset with single epoch key. `policy` is 0 (trust first) or 1 (cache and sync),
    /// `epoch_key` is hex of exactly [EpochKey::LENGTH_BYTES] bytes.
    pub fn add_keyset(&self, keyset_id: u16, policy: u8, validity_time: u64, epoch_key: &str) -> Result<()> {
        let policy = SecurityPolicy::try_from(policy).map_err(|e| Error::invalid(e.to_string()))?;
        let key = parse_epoch_key(epoch_key)?;
        let keyset = KeySet {
            keyset_id,
            policy,
            epoch_keys: vec![EpochKey {
                start_time: validity_time,
                key,
            }],
        };
        self.provider
            .set_key_set(self.fabric_index, &self.compressed_fabric_id, &keyset)
            .inspect_err(|e| log::error!("failed to set keyset 0x{:04x}: {:#}", keyset_id, e))?;
        Ok(())
    }

    /// Remove every binding referencing keyset, then keyset itself.
    /// When a binding can't be removed the keyset record is kept.
    pub fn remove_keyset(&self, keyset_id: u16) -> Result<()> {
        let indices: Vec<usize> = self
            .provider
            .iterate_group_keys(self.fabric_index)?
            .enumerate()
            .filter(|(_, k)| k.keyset_id == keyset_id)
            .map(|(i, _)| i)
            .collect();
        // highest first, removal shifts later entries down
        for index in indices.into_iter().rev() {
            self.provider
                .remove_group_key_at(self.fabric_index, index)
                .inspect_err(|e| log::error!("failed to remove group key at {}: {:#}", index, e))?;
        }
        self.provider
            .remove_key_set(self.fabric_index, keyset_id)
            .inspect_err(|e| log::error!("failed to remove keyset 0x{:04x}: {:#}", keyset_id, e))?;
        Ok(())
    }

    /// Group session ids derived from keyset epoch keys.
    pub fn keyset_group_session_ids(&self, keyset_id: u16) -> Result<Vec<u16>> {
        Ok(self.provider.group_session_ids(self.fabric_index, keyset_id)?)
    }
}
