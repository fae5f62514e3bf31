//! Game save-data codec.
//!
//! Persists the state a game can legitimately change between sessions: the
//! EEPROM contents and every FX flash sector it modified. The record is
//! scoped to the exact program + FX image by an FNV-1a-64 hash, so a save
//! stream from a different game is discarded silently on load.
//!
//! ## Stream format
//!
//! ```text
//! +------------------+
//! | Magic "ASAV"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

/// Magic bytes identifying a save-data stream.
const MAGIC: &[u8; 4] = b"ASAV";
/// Current save-data format version.
const FORMAT_VERSION: u32 = 1;

pub const FNV_OFFSET: u64 = 0xCBF2_9CE4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// Fold `bytes` into a running FNV-1a-64 state. Start from [`FNV_OFFSET`].
pub fn fnv1a_64(state: u64, bytes: &[u8]) -> u64 {
    let mut h = state;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Per-game save record: EEPROM plus dirty FX sectors, keyed by the hash of
/// the loaded program + FX image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveData {
    pub game_hash: u64,
    pub eeprom: Vec<u8>,
    /// Sector index to 4096-byte sector contents.
    pub fx_sectors: BTreeMap<u32, Vec<u8>>,
}

impl SaveData {
    pub fn clear(&mut self) {
        *self = SaveData::default();
    }
}

/// Serialize a save record to a byte stream.
pub fn write_savedata(save: &SaveData, w: &mut impl Write) -> Result<(), String> {
    let payload = bincode::serialize(save).map_err(|e| format!("serialize error: {}", e))?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    w.write_all(MAGIC).map_err(|e| format!("write error: {}", e))?;
    w.write_all(&FORMAT_VERSION.to_le_bytes())
        .map_err(|e| format!("write error: {}", e))?;
    w.write_all(&compressed).map_err(|e| format!("write error: {}", e))
}

/// Deserialize a save record from a byte stream, verifying magic and version.
pub fn read_savedata(r: &mut impl Read) -> Result<SaveData, String> {
    let mut bytes = Vec::new();
    r.read_to_end(&mut bytes).map_err(|e| format!("read error: {}", e))?;

    if bytes.len() < 8 {
        return Err("save stream too short".into());
    }
    if &bytes[0..4] != MAGIC {
        return Err("not a save stream (bad magic)".into());
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(format!(
            "unsupported save version {} (expected {})",
            version, FORMAT_VERSION
        ));
    }

    let payload = miniz_oxide::inflate::decompress_to_vec(&bytes[8..])
        .map_err(|e| format!("decompress error: {:?}", e))?;
    bincode::deserialize(&payload).map_err(|e| format!("deserialize error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_empty_is_offset_basis() {
        assert_eq!(fnv1a_64(FNV_OFFSET, &[]), 0xCBF2_9CE4_8422_2325);
    }

    #[test]
    fn test_fnv_known_vector() {
        // FNV-1a-64("a") from the reference implementation
        assert_eq!(fnv1a_64(FNV_OFFSET, b"a"), 0xAF63_DC4C_8601_EC8C);
    }

    #[test]
    fn test_roundtrip() {
        let mut save = SaveData {
            game_hash: 0x1234_5678_9ABC_DEF0,
            eeprom: vec![0xAB; 1024],
            fx_sectors: BTreeMap::new(),
        };
        save.fx_sectors.insert(3, vec![0x77; 4096]);
        let mut buf = Vec::new();
        write_savedata(&save, &mut buf).unwrap();
        let loaded = read_savedata(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded, save);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let buf = b"NOPE\x01\x00\x00\x00junk".to_vec();
        assert!(read_savedata(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(read_savedata(&mut &b"AS"[..]).is_err());
    }
}
