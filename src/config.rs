//! Controller identity persisted in `<base>/config.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fabric::{Fabric, FabricIndex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub fabric_index: FabricIndex,
    pub fabric_id: u64,
    /// Hex of uncompressed root CA public key.
    pub ca_public_key: String,
    /// File backing group data provider.
    pub group_store: String,
}

impl ControllerConfig {
    pub fn new(base: &str, fabric_index: FabricIndex, fabric_id: u64, ca_public_key: &[u8]) -> Self {
        Self {
            fabric_index,
            fabric_id,
            ca_public_key: hex::encode(ca_public_key),
            group_store: store_path(base),
        }
    }

    pub fn fabric(&self) -> Result<Fabric> {
        let ca = hex::decode(&self.ca_public_key).context("ca_public_key is not hex")?;
        Ok(Fabric::new(self.fabric_index, self.fabric_id, &ca))
    }
}

pub fn config_path(base: &str) -> String {
    format!("{}/config.json", base)
}

pub fn store_path(base: &str) -> String {
    format!("{}/groups.json", base)
}

pub fn load_config(base: &str) -> Result<ControllerConfig> {
    let path = config_path(base);
    let data = std::fs::read_to_string(&path).context(format!("reading config from {}", path))?;
    serde_json::from_str(&data).context("parsing config.json")
}

pub fn save_config(base: &str, config: &ControllerConfig) -> Result<()> {
    std::fs::create_dir_all(base).context(format!("creating {}", base))?;
    let path = config_path(base);
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, data).context(format!("writing config to {}", path))
}
