//! Two-level grain directory / grain table of a sparse extent.
//!
//! The directory lists the sector of every grain table, and every table
//! lists the sector of every grain. Both levels are read once when the
//! extent is opened and flattened into a single array indexed by grain
//! number, so that resolving a sector is one division and one lookup.

use log::debug;

use crate::{
    backing::Backing,
    error::{Result, VmdkError},
};

use super::{sparse::SparseHeader, SECTOR_SIZE};

/// Grain table entry of a grain that was never written.
pub const GRAIN_UNALLOCATED: u32 = 0;
/// Grain table entry of a grain known to contain only zeros.
pub const GRAIN_ZEROED: u32 = 1;

/// Layout values needed to read a grain index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GrainLayout {
    /// Sectors per grain
    pub grain_size: u64,
    /// Sectors covered by the extent
    pub capacity: u64,
    /// Entries in each grain table
    pub entries_per_table: u32,
    /// Sector of the grain directory in the extent file
    pub directory_offset: u64,
}

impl From<&SparseHeader> for GrainLayout {
    fn from(header: &SparseHeader) -> Self {
        GrainLayout {
            grain_size: header.grain_size,
            capacity: header.capacity,
            entries_per_table: header.grain_table_entries,
            directory_offset: header.active_grain_directory(),
        }
    }
}

/// The flattened grain table of one sparse extent.
#[derive(Clone, Debug)]
pub struct GrainIndex {
    grain_size: u64,
    /// One entry per grain, in logical order
    table: Vec<u32>,
}

/// Decodes consecutive little-endian 32-bit values.
fn decode_entries(raw: &[u8]) -> impl Iterator<Item = u32> + '_ {
    raw.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
}

impl GrainIndex {
    /// Reads the grain directory and every grain table it references.
    ///
    /// # Errors
    ///
    /// [`VmdkError::CorruptGrainIndex`] if the layout yields no grain or no
    /// directory entry, or if the directory, a grain table or a grain cannot
    /// fit in the extent file. [`VmdkError::Io`] on seek errors or short reads.
    pub fn build(backing: &mut Backing, layout: GrainLayout) -> Result<Self> {
        if layout.grain_size == 0 {
            return Err(VmdkError::CorruptGrainIndex("grain size is zero"));
        }
        if layout.entries_per_table == 0 {
            return Err(VmdkError::CorruptGrainIndex("grain tables have no entry"));
        }
        let grains = layout.capacity.div_ceil(layout.grain_size);
        if grains == 0 {
            return Err(VmdkError::CorruptGrainIndex("extent has no grain"));
        }
        let entries_per_table = u64::from(layout.entries_per_table);
        let directory_entries = grains.div_ceil(entries_per_table);
        if directory_entries == 0 {
            return Err(VmdkError::CorruptGrainIndex("grain directory has no entry"));
        }

        // Sizes come straight from the header: bound them by the file before allocating.
        let file_len = backing.len()?;
        let directory_end = layout
            .directory_offset
            .checked_mul(SECTOR_SIZE)
            .zip(directory_entries.checked_mul(4))
            .and_then(|(start, len)| start.checked_add(len));
        if directory_end.map_or(true, |end| end > file_len) {
            return Err(VmdkError::CorruptGrainIndex(
                "grain directory does not fit in the extent file",
            ));
        }
        if entries_per_table * 4 > file_len {
            return Err(VmdkError::CorruptGrainIndex(
                "grain tables do not fit in the extent file",
            ));
        }
        let grain_bytes = layout
            .grain_size
            .checked_mul(SECTOR_SIZE)
            .ok_or(VmdkError::CorruptGrainIndex("grain size is too large"))?;
        let flat_entries = directory_entries
            .checked_mul(entries_per_table)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(VmdkError::CorruptGrainIndex("grain table is too large"))?;
        debug!(
            "Grain index: {} grains, {} directory entries, {} entries per table",
            grains, directory_entries, entries_per_table
        );

        let mut raw_directory = vec![0u8; directory_entries as usize * 4];
        backing.read_exact_at(layout.directory_offset * SECTOR_SIZE, &mut raw_directory)?;

        let mut table = Vec::new();
        table
            .try_reserve_exact(flat_entries)
            .map_err(|_| VmdkError::CorruptGrainIndex("grain table is too large"))?;
        let mut raw_table = vec![0u8; entries_per_table as usize * 4];
        for table_offset in decode_entries(&raw_directory) {
            if table_offset == GRAIN_UNALLOCATED {
                // The whole table was never allocated.
                table.resize(table.len() + entries_per_table as usize, GRAIN_UNALLOCATED);
                continue;
            }
            backing.read_exact_at(u64::from(table_offset) * SECTOR_SIZE, &mut raw_table)?;
            table.extend(decode_entries(&raw_table));
        }
        table.truncate(grains as usize);

        let index = GrainIndex {
            grain_size: layout.grain_size,
            table,
        };
        if index.allocated_grains() > 0 && grain_bytes > file_len {
            return Err(VmdkError::CorruptGrainIndex(
                "grains do not fit in the extent file",
            ));
        }
        Ok(index)
    }

    /// Sectors per grain.
    pub fn grain_size(&self) -> u64 {
        self.grain_size
    }

    /// Number of grains covered by the index.
    pub fn grain_count(&self) -> usize {
        self.table.len()
    }

    /// Returns the grain table entry covering `sector`, relative to the start of the extent.
    ///
    /// [`GRAIN_UNALLOCATED`] means the parent image must be consulted,
    /// [`GRAIN_ZEROED`] means the grain reads as zeros, any other value is
    /// the sector of the grain in the extent file. Sectors past the end of
    /// the index read as unallocated.
    pub fn grain_offset_for(&self, sector: u64) -> u32 {
        self.table
            .get((sector / self.grain_size) as usize)
            .copied()
            .unwrap_or(GRAIN_UNALLOCATED)
    }

    /// Number of grains with data stored in the extent file.
    pub fn allocated_grains(&self) -> usize {
        self.table
            .iter()
            .filter(|e| **e != GRAIN_UNALLOCATED && **e != GRAIN_ZEROED)
            .count()
    }
}
