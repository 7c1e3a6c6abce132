use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmdkError};

/// Byte budget shared by all cached grains.
pub const DEFAULT_GRAIN_CACHE_BYTES: usize = 16 * 1024 * 1024;
/// Maximum number of cached sectors.
pub const DEFAULT_SECTOR_CACHE_ENTRIES: usize = 16384;

/// Tunables applied when opening a VMDK image.
///
/// The same options are used for every parent image in the chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmdkOptions {
    /// Total size of decoded grains kept in memory, in bytes
    pub grain_cache_bytes: usize,
    /// Number of 512-byte sectors kept in memory
    pub sector_cache_entries: usize,
}

impl Default for VmdkOptions {
    fn default() -> Self {
        VmdkOptions {
            grain_cache_bytes: DEFAULT_GRAIN_CACHE_BYTES,
            sector_cache_entries: DEFAULT_SECTOR_CACHE_ENTRIES,
        }
    }
}

impl VmdkOptions {
    /// Loads options from a JSON file. Missing fields keep their default value.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| {
            VmdkError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid options file {}: {}", path.display(), e),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, r#"{{ "sector_cache_entries": 32 }}"#).unwrap();
        let options = VmdkOptions::from_json_file(tmp.path()).unwrap();
        assert_eq!(options.sector_cache_entries, 32);
        assert_eq!(options.grain_cache_bytes, DEFAULT_GRAIN_CACHE_BYTES);
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "not json").unwrap();
        assert!(VmdkOptions::from_json_file(tmp.path()).is_err());
    }
}
