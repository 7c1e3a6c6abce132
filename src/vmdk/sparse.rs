//! Binary headers of sparse extent files.
//!
//! Two layouts exist: the hosted sparse header (`KDMV`, VMware Workstation and
//! later) and the legacy ESX header (`COWD`, used by `VMFSSPARSE` extents).
//! Both are decoded into a [`SparseHeader`] carrying what the grain index
//! needs.

use std::io::SeekFrom;

use log::debug;
use serde::Serialize;

use crate::{
    backing::Backing,
    error::{Result, VmdkError},
};

pub const KDMV_MAGIC: &[u8; 4] = b"KDMV";
pub const COWD_MAGIC: &[u8; 4] = b"COWD";

/// Size of the hosted sparse header.
pub const KDMV_HEADER_SIZE: usize = 512;
/// Size of the legacy COWD header.
pub const COWD_HEADER_SIZE: usize = 2048;

/// Grain tables of COWD extents always have 4096 entries.
const COWD_GRAIN_TABLE_ENTRIES: u32 = 4096;
/// COWD flag set on root disks, which store a geometry instead of a parent name.
const COWD_FLAG_ROOT: u32 = 0x00000001;

// Flags used in hosted sparse extent file headers.
const _FLAG_VALID_NEWLINE_DETECTION_TEST: u32 = 0x00000001;
const FLAG_USE_SECONDARY_GRAIN_DIRECTORY: u32 = 0x00000002;
const _FLAG_USE_ZEROED_GRAIN_TABLE: u32 = 0x00000004;
const _FLAG_HAS_COMPRESSED_GRAIN_DATA: u32 = 0x00010000;
const _FLAG_HAS_METADATA: u32 = 0x00020000;

/// Primary grain directory value meaning "stored in the footer".
const GRAIN_DIRECTORY_AT_END: u64 = u64::MAX;

/// Compression method declared by a hosted sparse header. Only
/// uncompressed grains can be resolved.
pub const COMPRESSION_NONE: u16 = 0;

/// Header fields of a sparse extent, normalised across both layouts.
///
/// See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#41-file-header
#[derive(Clone, Debug, Serialize)]
pub struct SparseHeader {
    pub version: u32,
    pub flags: u32,
    /// Maximum number of data sectors
    pub capacity: u64,
    /// Sectors per grain
    pub grain_size: u64,
    /// Sector of the embedded descriptor, 0 if none
    pub descriptor_offset: u64,
    /// Number of sectors of the embedded descriptor
    pub descriptor_size: u64,
    pub grain_table_entries: u32,
    /// Sector of the redundant grain directory, 0 if none
    pub secondary_grain_directory_offset: u64,
    /// Sector of the primary grain directory
    pub grain_directory_offset: u64,
    /// Metadata (overhead) number of sectors
    pub overhead: u64,
    pub unclean_shutdown: bool,
    pub compression_method: u16,
    /// Fields only present in the legacy layout
    pub legacy: Option<LegacyFields>,
}

/// Extra information carried by the legacy COWD header.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LegacyFields {
    /// Number of grain directory entries declared by the header
    pub grain_directory_entries: u32,
    pub next_free_grain: u32,
    /// (cylinders, heads, sectors) of a root disk
    pub geometry: Option<(u32, u32, u32)>,
    /// Parent file name of a redo-log
    pub parent_file_name: Option<String>,
    pub parent_generation: Option<u32>,
    pub generation: u32,
    pub name: String,
    pub description: String,
}

/// Reads a little-endian integer from a slice whose bounds were checked by the caller.
fn le_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Decodes a NUL-padded text field.
fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

impl SparseHeader {
    /// Parses a hosted sparse (`KDMV`) header.
    ///
    /// # Errors
    ///
    /// [`VmdkError::InvalidHeader`] if the buffer is too short or the magic
    /// is wrong, [`VmdkError::UnsupportedCompression`] if grains are compressed.
    pub fn parse_hosted(data: &[u8]) -> Result<Self> {
        if data.len() < 80 {
            return Err(VmdkError::InvalidHeader("header data too short".to_string()));
        }
        if &data[0..4] != KDMV_MAGIC {
            return Err(VmdkError::InvalidHeader("invalid VMDK magic number".to_string()));
        }
        let compression_method = u16::from_le_bytes([data[77], data[78]]);
        if compression_method != COMPRESSION_NONE {
            return Err(VmdkError::UnsupportedCompression(compression_method));
        }
        Ok(SparseHeader {
            version: le_u32(data, 4),
            flags: le_u32(data, 8),
            capacity: le_u64(data, 12),
            grain_size: le_u64(data, 20),
            descriptor_offset: le_u64(data, 28),
            descriptor_size: le_u64(data, 36),
            grain_table_entries: le_u32(data, 44),
            secondary_grain_directory_offset: le_u64(data, 48),
            grain_directory_offset: le_u64(data, 56),
            overhead: le_u64(data, 64),
            unclean_shutdown: data[72] & 0x01 == 1,
            compression_method,
            legacy: None,
        })
    }

    /// Parses a legacy ESX (`COWD`) header.
    ///
    /// See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#5-cowd-sparse-extent-data-file
    pub fn parse_legacy(data: &[u8]) -> Result<Self> {
        if data.len() < COWD_HEADER_SIZE {
            return Err(VmdkError::InvalidHeader("COWD header data too short".to_string()));
        }
        if &data[0..4] != COWD_MAGIC {
            return Err(VmdkError::InvalidHeader("invalid COWD magic number".to_string()));
        }
        let flags = le_u32(data, 8);
        // Root disks store their geometry where redo-logs store the parent name.
        let (geometry, parent_file_name, parent_generation) = if flags & COWD_FLAG_ROOT != 0 {
            (
                Some((le_u32(data, 32), le_u32(data, 36), le_u32(data, 40))),
                None,
                None,
            )
        } else {
            (
                None,
                Some(c_string(&data[32..1056])),
                Some(le_u32(data, 1056)),
            )
        };
        Ok(SparseHeader {
            version: le_u32(data, 4),
            flags,
            capacity: u64::from(le_u32(data, 12)),
            grain_size: u64::from(le_u32(data, 16)),
            descriptor_offset: 0,
            descriptor_size: 0,
            grain_table_entries: COWD_GRAIN_TABLE_ENTRIES,
            secondary_grain_directory_offset: 0,
            grain_directory_offset: u64::from(le_u32(data, 20)),
            overhead: 0,
            unclean_shutdown: le_u32(data, 1648) != 0,
            compression_method: COMPRESSION_NONE,
            legacy: Some(LegacyFields {
                grain_directory_entries: le_u32(data, 24),
                next_free_grain: le_u32(data, 28),
                geometry,
                parent_file_name,
                parent_generation,
                generation: le_u32(data, 1060),
                name: c_string(&data[1064..1124]),
                description: c_string(&data[1124..1636]),
            }),
        })
    }

    /// Sector of the grain directory that must be used to build the index.
    ///
    /// The redundant directory wins when the header asks for it or when the
    /// primary offset is unset (`-1`).
    pub fn active_grain_directory(&self) -> u64 {
        if self.legacy.is_none()
            && (self.flags & FLAG_USE_SECONDARY_GRAIN_DIRECTORY == FLAG_USE_SECONDARY_GRAIN_DIRECTORY
                || self.grain_directory_offset == GRAIN_DIRECTORY_AT_END)
            && self.secondary_grain_directory_offset != 0
        {
            self.secondary_grain_directory_offset
        } else {
            self.grain_directory_offset
        }
    }

    /// Returns `true` if the header defers its grain directory to the footer.
    pub fn grain_directory_at_end(&self) -> bool {
        self.grain_directory_offset == GRAIN_DIRECTORY_AT_END
            && self.secondary_grain_directory_offset == 0
    }
}

/// Reads the sparse header found at the start of `backing`, whichever layout it uses.
///
/// A hosted header whose grain directory is stored at the end of the file is
/// replaced by the footer copy located 1024 bytes before the end.
pub fn read_sparse_header(backing: &mut Backing) -> Result<SparseHeader> {
    let magic = backing.read_header_at(SeekFrom::Start(0), 4)?;
    if magic.as_slice() == COWD_MAGIC {
        debug!("Legacy COWD header in {}", backing.path().display());
        let data = backing.read_header_at(SeekFrom::Start(0), COWD_HEADER_SIZE)?;
        return SparseHeader::parse_legacy(&data);
    }
    let data = backing.read_header_at(SeekFrom::Start(0), KDMV_HEADER_SIZE)?;
    let header = SparseHeader::parse_hosted(&data)?;
    if header.grain_directory_at_end() {
        debug!("Grain directory stored in footer of {}", backing.path().display());
        let footer = backing.read_header_at(SeekFrom::End(-1024), KDMV_HEADER_SIZE)?;
        return SparseHeader::parse_hosted(&footer);
    }
    Ok(header)
}

/// Returns `true` if `data` starts with the hosted sparse magic.
pub fn is_hosted_sparse(data: &[u8]) -> bool {
    data.len() >= 4 && &data[0..4] == KDMV_MAGIC
}
