use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha2::Sha256;

/// Local index of fabric, scopes group and keyset tables.
pub type FabricIndex = u8;

pub struct Fabric {
    pub index: FabricIndex,
    pub id: u64,
    ca_public_key: Vec<u8>,
}

fn hkdf_sha256(salt: &[u8], secret: &[u8], info: &[u8], size: usize) -> Result<Vec<u8>> {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = vec![0u8; size];
    hk.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("hkdf error {:?}", e))?;
    Ok(okm)
}

impl Fabric {
    /// `ca_public_key` is uncompressed sec1 point of root CA (65 bytes, leading 0x04).
    pub fn new(index: FabricIndex, fabric_id: u64, ca_public_key: &[u8]) -> Self {
        Self {
            index,
            id: fabric_id,
            ca_public_key: ca_public_key.to_owned(),
        }
    }

    /// Compressed fabric identifier
    pub fn compressed(&self) -> Result<Vec<u8>> {
        if self.ca_public_key.len() < 2 {
            anyhow::bail!("ca public key too short: {} bytes", self.ca_public_key.len());
        }
        let mut buf_id = Vec::new();
        buf_id.write_u64::<BigEndian>(self.id)?;
        hkdf_sha256(
            &buf_id,
            &self.ca_public_key[1..],
            "CompressedFabric".as_bytes(),
            8,
        )
    }
}

/// Operational group key derived from epoch key for given compressed fabric id.
pub fn operational_group_key(compressed_fabric_id: &[u8], epoch_key: &[u8]) -> Result<Vec<u8>> {
    hkdf_sha256(compressed_fabric_id, epoch_key, "GroupKey v1.0".as_bytes(), 16)
}

/// Group session id carried in group message header for given operational key.
pub fn group_session_id(operational_key: &[u8]) -> Result<u16> {
    let hash = hkdf_sha256(&[], operational_key, "GroupKeyHash".as_bytes(), 2)?;
    Ok(std::io::Cursor::new(hash).read_u16::<BigEndian>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca_key(seed: u8) -> Vec<u8> {
        let mut k = vec![4u8];
        k.extend((0..64).map(|i| i as u8 ^ seed));
        k
    }

    #[test]
    fn compressed_id_depends_on_fabric_and_root() {
        let a = Fabric::new(1, 1000, &ca_key(0)).compressed().unwrap();
        let b = Fabric::new(2, 1000, &ca_key(0)).compressed().unwrap();
        let c = Fabric::new(1, 1001, &ca_key(0)).compressed().unwrap();
        let d = Fabric::new(1, 1000, &ca_key(7)).compressed().unwrap();
        assert_eq!(a.len(), 8);
        // index is local only
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(Fabric::new(1, 1, &[4]).compressed().is_err());
    }

    #[test]
    fn group_keys_are_bound_to_fabric() {
        let epoch = [0x23u8; 16];
        let cfid = Fabric::new(1, 1000, &ca_key(0)).compressed().unwrap();
        let other = Fabric::new(1, 2000, &ca_key(0)).compressed().unwrap();
        let k1 = operational_group_key(&cfid, &epoch).unwrap();
        let k2 = operational_group_key(&other, &epoch).unwrap();
        assert_eq!(k1.len(), 16);
        assert_ne!(k1, k2);
        assert_eq!(k1, operational_group_key(&cfid, &epoch).unwrap());
        assert_eq!(group_session_id(&k1).unwrap(), group_session_id(&k1).unwrap());
    }
}
