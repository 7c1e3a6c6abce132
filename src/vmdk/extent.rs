//! Extent descriptor table.
//!
//! Every extent line of the descriptor becomes an [`Extent`] covering a run
//! of logical sectors. Extents are laid end to end in descriptor order, so
//! they partition `[0, total_sectors)` without gaps or overlaps.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;

use crate::{
    backing::Backing,
    error::{Result, VmdkError},
};

use super::{
    descriptor::{AccessMode, Descriptor, ExtentLine, ExtentType},
    grain::{GrainIndex, GrainLayout},
    sparse::{read_sparse_header, SparseHeader},
    SECTOR_SIZE,
};

/// How the sectors of an extent are stored.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum ExtentKind {
    /// Sectors stored contiguously in a RAW file
    Flat,
    /// Sectors stored in grains located through a grain index
    Sparse,
    /// Sectors that always read as zeros
    Zero,
    /// Sectors stored contiguously in a RAW file on VMFS
    Vmfs,
}

impl TryFrom<ExtentType> for ExtentKind {
    type Error = VmdkError;

    fn try_from(value: ExtentType) -> Result<Self> {
        match value {
            ExtentType::Flat => Ok(ExtentKind::Flat),
            ExtentType::Sparse | ExtentType::VmfsSparse => Ok(ExtentKind::Sparse),
            ExtentType::Zero => Ok(ExtentKind::Zero),
            ExtentType::Vmfs => Ok(ExtentKind::Vmfs),
            ExtentType::VmfsRdm | ExtentType::VmfsRaw => {
                Err(VmdkError::UnsupportedExtentKind(format!("{:?}", value)))
            }
        }
    }
}

/// Header and flattened grain table of a sparse extent.
#[derive(Debug)]
pub struct SparseMetadata {
    pub header: SparseHeader,
    pub grains: GrainIndex,
}

/// One contiguous run of logical sectors backed by one file.
#[derive(Debug)]
pub struct Extent {
    /// First logical sector covered by the extent
    pub start: u64,
    pub sector_count: u64,
    pub access: AccessMode,
    pub kind: ExtentKind,
    /// Backing file, `None` for zero extents
    pub backing: Option<Backing>,
    /// Byte offset of the extent data in a flat file
    pub byte_offset: u64,
    /// Grain index of a sparse extent
    pub sparse: Option<SparseMetadata>,
}

impl Extent {
    /// Returns `true` if `sector` falls inside the extent.
    pub fn contains(&self, sector: u64) -> bool {
        sector >= self.start && sector - self.start < self.sector_count
    }

    /// Name of the backing file, for display purposes.
    pub fn file_name(&self) -> Option<String> {
        self.backing
            .as_ref()
            .and_then(|b| b.path().file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }

    fn backing(&mut self) -> Result<&mut Backing> {
        self.backing.as_mut().ok_or_else(|| {
            VmdkError::UnsupportedExtentKind(format!("{:?} extent without backing file", self.kind))
        })
    }

    /// Reads the sectors at `relative` (from the start of the extent) of a flat or VMFS extent.
    pub fn read_flat(&mut self, relative: u64, buf: &mut [u8]) -> Result<()> {
        let position = self.byte_offset + relative * SECTOR_SIZE;
        self.backing()?.read_exact_at(position, buf)?;
        Ok(())
    }

    /// Reads the whole grain stored at sector `grain_offset` of the extent file.
    pub fn read_grain(&mut self, grain_offset: u32) -> Result<Vec<u8>> {
        let grain_bytes = self.grain_bytes();
        let mut grain = vec![0u8; grain_bytes];
        self.backing()?
            .read_exact_at(u64::from(grain_offset) * SECTOR_SIZE, &mut grain)?;
        Ok(grain)
    }

    /// Size of one grain in bytes, 0 for non-sparse extents.
    pub fn grain_bytes(&self) -> usize {
        self.sparse
            .as_ref()
            .map(|s| (s.grains.grain_size() * SECTOR_SIZE) as usize)
            .unwrap_or(0)
    }
}

/// Ordered extents of an image, keyed by their start sector.
#[derive(Debug, Default)]
pub struct ExtentTable {
    extents: Vec<Extent>,
    total_sectors: u64,
}

/// Resolves the file backing `line`.
///
/// Self-contained images (a single sparse file embedding its own descriptor)
/// always point back at the container, whatever name the descriptor uses.
fn resolve_extent_path(
    line: &ExtentLine,
    descriptor: &Descriptor,
    container: &Path,
) -> Result<PathBuf> {
    if descriptor.header.create_type.is_self_contained() && descriptor.extents.len() == 1 {
        return Ok(container.to_path_buf());
    }
    let file_name = line.file_name.as_ref().ok_or_else(|| {
        VmdkError::MalformedDescriptor(format!(
            "{:?} extent without file name",
            line.extent_type
        ))
    })?;
    // Extent names are relative to the descriptor.
    Ok(container
        .parent()
        .unwrap_or(Path::new(""))
        .join(file_name))
}

impl ExtentTable {
    /// Builds the table from the extent lines of `descriptor`.
    ///
    /// Flat and VMFS files are only checked for existence and opened on first
    /// read. Sparse files are opened immediately so their header and grain
    /// index can be loaded.
    ///
    /// # Errors
    ///
    /// [`VmdkError::ExtentNotFound`] if a backing file is missing,
    /// [`VmdkError::UnsupportedExtentKind`] for raw device extents, plus any
    /// header or grain index error of a sparse extent.
    pub fn build(descriptor: &Descriptor, container: &Path) -> Result<Self> {
        let mut extents = Vec::with_capacity(descriptor.extents.len());
        let mut next_start = 0u64;

        for line in &descriptor.extents {
            let kind = ExtentKind::try_from(line.extent_type)?;
            // Every byte position inside the extent and the disk must fit in a u64.
            let end = next_start
                .checked_add(line.sector_count)
                .filter(|end| end.checked_mul(SECTOR_SIZE).is_some());
            let byte_offset = line.file_offset.checked_mul(SECTOR_SIZE).filter(|offset| {
                line.sector_count
                    .checked_mul(SECTOR_SIZE)
                    .and_then(|len| offset.checked_add(len))
                    .is_some()
            });
            let (Some(end), Some(byte_offset)) = (end, byte_offset) else {
                return Err(VmdkError::MalformedDescriptor(format!(
                    "extent of {} sectors at file offset {} is too large",
                    line.sector_count, line.file_offset
                )));
            };
            let mut extent = Extent {
                start: next_start,
                sector_count: line.sector_count,
                access: line.access_mode,
                kind,
                backing: None,
                byte_offset,
                sparse: None,
            };

            if kind != ExtentKind::Zero {
                let path = resolve_extent_path(line, descriptor, container)?;
                if !path.is_file() {
                    return Err(VmdkError::ExtentNotFound(path));
                }
                debug!(
                    "Extent {:?} of {} sectors at sector {} backed by {}",
                    kind,
                    line.sector_count,
                    next_start,
                    path.display()
                );
                let mut backing = Backing::new(path);
                if kind == ExtentKind::Sparse {
                    let header = read_sparse_header(&mut backing)?;
                    if header.capacity != line.sector_count {
                        warn!(
                            "Sparse extent {} declares {} sectors but descriptor says {}",
                            backing.path().display(),
                            header.capacity,
                            line.sector_count
                        );
                    }
                    let grains = GrainIndex::build(&mut backing, GrainLayout::from(&header))?;
                    extent.sparse = Some(SparseMetadata { header, grains });
                }
                extent.backing = Some(backing);
            }

            next_start = end;
            extents.push(extent);
        }

        Ok(ExtentTable {
            extents,
            total_sectors: next_start,
        })
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.extents.iter()
    }

    /// Returns the index of the extent containing `sector`.
    ///
    /// This is the last extent whose start is not after `sector`.
    pub fn position(&self, sector: u64) -> Result<usize> {
        let index = self.extents.partition_point(|e| e.start <= sector);
        match index.checked_sub(1) {
            Some(i) if self.extents[i].contains(sector) => Ok(i),
            _ => Err(VmdkError::out_of_range(sector, 1, self.total_sectors)),
        }
    }

    /// Returns the extent containing `sector`.
    pub fn lookup(&self, sector: u64) -> Result<&Extent> {
        let index = self.position(sector)?;
        Ok(&self.extents[index])
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Extent> {
        self.extents.get_mut(index)
    }

    /// Largest grain of all sparse extents, in bytes.
    pub fn largest_grain_bytes(&self) -> usize {
        self.extents.iter().map(Extent::grain_bytes).max().unwrap_or(0)
    }
}
