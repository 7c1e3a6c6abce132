//! This module contains functionality for reading VMDK volumes.
//!
//! Flat, VMFS, zero and sparse extents are supported, sparse extents being
//! either hosted (`KDMV`) or legacy ESX (`COWD`) files. Unallocated grains of
//! a delta image are read from its parent image, which is opened along with
//! the child. Compressed grains and raw device mappings are not supported.
//!
//! Reads go through two bounded caches: decoded grains, and individual
//! sectors. Each cache is emptied as a whole once it reaches its bound.

pub mod cache;
pub mod descriptor;
pub mod extent;
pub mod grain;
pub mod options;
pub mod sparse;
pub mod writer;

use std::{
    cmp::min,
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    backing::Backing,
    error::{Result, VmdkError},
};

use cache::{CacheStats, GrainCache, GrainKey, SectorCache};
use descriptor::{AccessMode, Descriptor, DiskType, NO_PARENT_CID};
use extent::{ExtentKind, ExtentTable};
use grain::{GRAIN_UNALLOCATED, GRAIN_ZEROED};
use options::VmdkOptions;
use sparse::{is_hosted_sparse, SparseHeader, KDMV_HEADER_SIZE};

pub const SECTOR_SIZE: u64 = 512;

/// Descriptors larger than this are not descriptors.
const MAX_DESCRIPTOR_SIZE: u64 = 1024 * 1024;

/// Heads and sectors per track used when the descriptor has no geometry.
const DEFAULT_HEADS: u64 = 16;
const DEFAULT_SECTORS_PER_TRACK: u64 = 63;

/// Cylinder/head/sector geometry reported for the disk.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Geometry {
    pub cylinders: u64,
    pub heads: u64,
    pub sectors: u64,
}

impl Geometry {
    /// Geometry derived from the capacity alone: 16 heads, 63 sectors per track.
    pub fn from_capacity(total_sectors: u64) -> Self {
        Geometry {
            cylinders: total_sectors / (DEFAULT_HEADS * DEFAULT_SECTORS_PER_TRACK),
            heads: DEFAULT_HEADS,
            sectors: DEFAULT_SECTORS_PER_TRACK,
        }
    }
}

/// Summary of an opened image, suitable for display or JSON output.
#[derive(Clone, Debug, Serialize)]
pub struct DiskInfo {
    pub path: PathBuf,
    pub create_type: DiskType,
    pub cid: u32,
    pub parent_cid: Option<u32>,
    pub total_sectors: u64,
    pub sector_size: u64,
    pub geometry: Geometry,
    pub extents: Vec<ExtentInfo>,
    pub change_track_path: Option<String>,
    pub grain_cache_capacity: usize,
    pub sector_cache_capacity: usize,
    pub parent: Option<Box<DiskInfo>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExtentInfo {
    pub start: u64,
    pub sectors: u64,
    pub kind: ExtentKind,
    pub access: AccessMode,
    pub file: Option<String>,
    /// Grains with stored data, for sparse extents
    pub allocated_grains: Option<usize>,
}

/// Represents a VMDK virtual disk in memory with the state of its file handles and caches.
pub struct VMDK {
    /// Path of the descriptor (or self-contained sparse file)
    path: PathBuf,
    descriptor: Descriptor,
    extents: ExtentTable,
    /// Base image consulted for unallocated grains
    parent: Option<Box<VMDK>>,
    grain_cache: GrainCache,
    sector_cache: SectorCache,
    geometry: Geometry,
    /// Byte position used by the `Read` and `Seek` implementations
    position: u64,
}

/// Reads the descriptor of the container at `path`.
///
/// A file starting with the hosted sparse magic carries an embedded
/// descriptor; anything else is read as a standalone descriptor file.
fn read_descriptor(path: &Path) -> Result<Descriptor> {
    let mut file = File::open(path)?;
    let mut header_data = Vec::with_capacity(KDMV_HEADER_SIZE);
    (&mut file)
        .take(KDMV_HEADER_SIZE as u64)
        .read_to_end(&mut header_data)?;

    if is_hosted_sparse(&header_data) {
        debug!("Monolithic Sparse VMDK detected, extracting descriptor information");
        let header = SparseHeader::parse_hosted(&header_data)?;
        if header.descriptor_offset == 0 || header.descriptor_size == 0 {
            return Err(VmdkError::MalformedDescriptor(
                "no embedded descriptor found".to_string(),
            ));
        }
        let file_len = file.metadata()?.len();
        let start = header.descriptor_offset.checked_mul(SECTOR_SIZE);
        let size = header
            .descriptor_size
            .checked_mul(SECTOR_SIZE)
            .filter(|size| *size <= MAX_DESCRIPTOR_SIZE);
        let (start, size) = match start.zip(size) {
            Some((start, size)) if start.checked_add(size).is_some_and(|end| end <= file_len) => {
                (start, size)
            }
            _ => {
                return Err(VmdkError::MalformedDescriptor(format!(
                    "embedded descriptor of {} sectors at sector {} does not fit in {}",
                    header.descriptor_size,
                    header.descriptor_offset,
                    path.display()
                )))
            }
        };
        let mut backing = Backing::from_file(path, file);
        let mut raw = vec![0u8; size as usize];
        backing.read_exact_at(start, &mut raw)?;
        return String::from_utf8_lossy(&raw).parse();
    }

    debug!("Trying to decode standalone descriptor file");
    if file.metadata()?.len() > MAX_DESCRIPTOR_SIZE {
        return Err(VmdkError::MalformedDescriptor(format!(
            "{} is too large to be a descriptor file",
            path.display()
        )));
    }
    let raw = fs::read(path)?;
    String::from_utf8_lossy(&raw).parse()
}

impl VMDK {
    /// Opens the image at `path` with default cache sizes.
    ///
    /// `path` is either a descriptor file or a self-contained sparse file.
    /// If the descriptor names a parent image, the parent is opened too.
    ///
    /// # Errors
    ///
    /// Any descriptor, extent, header or parent error aborts the open.
    pub fn open(path: impl AsRef<Path>) -> Result<VMDK> {
        VMDK::open_with_options(path, &VmdkOptions::default())
    }

    /// Opens the image at `path` using the given cache configuration.
    pub fn open_with_options(path: impl AsRef<Path>, options: &VmdkOptions) -> Result<VMDK> {
        let mut visited = Vec::new();
        VMDK::open_chain(path.as_ref(), options, &mut visited)
    }

    /// Opens one image of a parent chain. `visited` holds the canonical path
    /// of every image already opened below it.
    fn open_chain(path: &Path, options: &VmdkOptions, visited: &mut Vec<PathBuf>) -> Result<VMDK> {
        debug!("Opening and reading VMDK descriptor file: {}", path.display());
        let canonical = path.canonicalize()?;
        if visited.contains(&canonical) {
            return Err(VmdkError::ParentCycleDetected(canonical));
        }
        visited.push(canonical);

        let descriptor = read_descriptor(path)?;
        let create_type = descriptor.header.create_type;
        if create_type.is_device() {
            return Err(VmdkError::UnsupportedExtentKind(format!(
                "disk type {:?}",
                create_type
            )));
        }

        let extents = ExtentTable::build(&descriptor, path)?;
        let parent = VMDK::open_parent(path, &descriptor, options, visited)?;

        let geometry = VMDK::pick_geometry(&descriptor, &extents);
        let grain_cache =
            GrainCache::with_budget(options.grain_cache_bytes, extents.largest_grain_bytes());
        let sector_cache = SectorCache::new(options.sector_cache_entries);
        debug!(
            "Opened {} ({:?}, {} sectors, grain cache of {} grains)",
            path.display(),
            create_type,
            extents.total_sectors(),
            grain_cache.capacity()
        );

        Ok(VMDK {
            path: path.to_path_buf(),
            descriptor,
            extents,
            parent,
            grain_cache,
            sector_cache,
            geometry,
            position: 0,
        })
    }

    /// Opens the parent named by `parentFileNameHint`, relative to the child.
    fn open_parent(
        path: &Path,
        descriptor: &Descriptor,
        options: &VmdkOptions,
        visited: &mut Vec<PathBuf>,
    ) -> Result<Option<Box<VMDK>>> {
        let Some(ref hint) = descriptor.header.parent_file_name_hint else {
            if descriptor.header.parent_cid != NO_PARENT_CID {
                warn!(
                    "{} is a delta image without parent hint, unallocated grains will read as zeros",
                    path.display()
                );
            }
            return Ok(None);
        };
        let parent_path = path.parent().unwrap_or(Path::new("")).join(hint);
        if !parent_path.is_file() {
            return Err(VmdkError::ParentNotFound(parent_path));
        }
        debug!("Opening parent image {}", parent_path.display());
        let parent = match VMDK::open_chain(&parent_path, options, visited) {
            Ok(parent) => parent,
            Err(VmdkError::ParentCycleDetected(p)) => return Err(VmdkError::ParentCycleDetected(p)),
            Err(e) => {
                return Err(VmdkError::ParentOpenFailed {
                    path: parent_path,
                    source: Box::new(e),
                })
            }
        };
        if parent.descriptor.header.cid != descriptor.header.parent_cid {
            warn!(
                "Parent {} has CID {:08x} but {} expects {:08x}",
                parent_path.display(),
                parent.descriptor.header.cid,
                path.display(),
                descriptor.header.parent_cid
            );
        }
        Ok(Some(Box::new(parent)))
    }

    /// Geometry from the disk database, then from a legacy sparse header,
    /// then derived from the capacity.
    fn pick_geometry(descriptor: &Descriptor, extents: &ExtentTable) -> Geometry {
        let ddb = &descriptor.disk_database;
        if let (Some(cylinders), Some(heads), Some(sectors)) =
            (ddb.geometry_cylinders, ddb.geometry_heads, ddb.geometry_sectors)
        {
            return Geometry {
                cylinders,
                heads,
                sectors,
            };
        }
        let legacy = extents
            .iter()
            .filter_map(|e| e.sparse.as_ref())
            .filter_map(|s| s.header.legacy.as_ref())
            .find_map(|l| l.geometry);
        if let Some((cylinders, heads, sectors)) = legacy {
            return Geometry {
                cylinders: u64::from(cylinders),
                heads: u64::from(heads),
                sectors: u64::from(sectors),
            };
        }
        Geometry::from_capacity(extents.total_sectors())
    }

    /// Number of logical sectors of the disk.
    pub fn total_sectors(&self) -> u64 {
        self.extents.total_sectors()
    }

    pub fn sector_size(&self) -> u64 {
        SECTOR_SIZE
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create_type(&self) -> DiskType {
        self.descriptor.header.create_type
    }

    pub fn parent(&self) -> Option<&VMDK> {
        self.parent.as_deref()
    }

    pub fn extents(&self) -> &ExtentTable {
        &self.extents
    }

    pub fn grain_cache_stats(&self) -> CacheStats {
        self.grain_cache.stats()
    }

    pub fn sector_cache_stats(&self) -> CacheStats {
        self.sector_cache.stats()
    }

    /// Number of grains currently held in the grain cache.
    pub fn cached_grains(&self) -> usize {
        self.grain_cache.len()
    }

    /// Reads one 512-byte logical sector.
    ///
    /// # Errors
    ///
    /// [`VmdkError::OutOfRange`] if `address` is past the end of the disk,
    /// [`VmdkError::AccessDenied`] for `NOACCESS` extents and
    /// [`VmdkError::Io`] if the backing file cannot be read.
    pub fn read_sector(&mut self, address: u64) -> Result<Vec<u8>> {
        let total = self.total_sectors();
        if address >= total {
            return Err(VmdkError::out_of_range(address, 1, total));
        }
        if let Some(sector) = self.sector_cache.get(&address) {
            return Ok(sector.to_vec());
        }

        let index = self.extents.position(address)?;
        let extent = self
            .extents
            .get_mut(index)
            .ok_or_else(|| VmdkError::out_of_range(address, 1, total))?;
        if extent.access == AccessMode::NoAccess {
            return Err(VmdkError::AccessDenied(address));
        }
        let relative = address - extent.start;

        let sector = match extent.kind {
            ExtentKind::Zero => vec![0u8; SECTOR_SIZE as usize],
            ExtentKind::Flat | ExtentKind::Vmfs => {
                let mut sector = vec![0u8; SECTOR_SIZE as usize];
                extent.read_flat(relative, &mut sector)?;
                sector
            }
            ExtentKind::Sparse => {
                let (grain_size, grain_offset) = match extent.sparse.as_ref() {
                    Some(sparse) => (
                        sparse.grains.grain_size(),
                        sparse.grains.grain_offset_for(relative),
                    ),
                    None => {
                        return Err(VmdkError::CorruptGrainIndex(
                            "sparse extent without grain index",
                        ))
                    }
                };
                if grain_offset == GRAIN_UNALLOCATED {
                    if let Some(parent) = self.parent.as_mut() {
                        return parent.read_sector(address);
                    }
                }
                if grain_offset == GRAIN_UNALLOCATED || grain_offset == GRAIN_ZEROED {
                    vec![0u8; SECTOR_SIZE as usize]
                } else {
                    let within = ((relative % grain_size) * SECTOR_SIZE) as usize;
                    let key = GrainKey {
                        extent: index,
                        offset: grain_offset,
                    };
                    match self.grain_cache.get(&key) {
                        Some(grain) => grain[within..within + SECTOR_SIZE as usize].to_vec(),
                        None => {
                            let grain = extent.read_grain(grain_offset)?;
                            let sector = grain[within..within + SECTOR_SIZE as usize].to_vec();
                            self.grain_cache.put(key, grain);
                            sector
                        }
                    }
                }
            }
        };

        self.sector_cache.put(address, sector.clone());
        Ok(sector)
    }

    /// Reads `count` consecutive sectors starting at `address`.
    ///
    /// # Errors
    ///
    /// [`VmdkError::OutOfRange`] if the range ends past the end of the disk,
    /// plus any error of [`VMDK::read_sector`].
    pub fn read_sectors(&mut self, address: u64, count: u32) -> Result<Vec<u8>> {
        let total = self.total_sectors();
        let end = address
            .checked_add(u64::from(count))
            .filter(|end| *end <= total)
            .ok_or_else(|| VmdkError::out_of_range(address, u64::from(count), total))?;
        let mut data = Vec::with_capacity(count as usize * SECTOR_SIZE as usize);
        for sector in address..end {
            data.extend_from_slice(&self.read_sector(sector)?);
        }
        Ok(data)
    }

    /// Returns a summary of the image and of its parent chain.
    pub fn info(&self) -> DiskInfo {
        let header = &self.descriptor.header;
        DiskInfo {
            path: self.path.clone(),
            create_type: header.create_type,
            cid: header.cid,
            parent_cid: (header.parent_cid != NO_PARENT_CID).then_some(header.parent_cid),
            total_sectors: self.total_sectors(),
            sector_size: SECTOR_SIZE,
            geometry: self.geometry,
            extents: self
                .extents
                .iter()
                .map(|e| ExtentInfo {
                    start: e.start,
                    sectors: e.sector_count,
                    kind: e.kind,
                    access: e.access,
                    file: e.file_name(),
                    allocated_grains: e.sparse.as_ref().map(|s| s.grains.allocated_grains()),
                })
                .collect(),
            change_track_path: self.descriptor.change_track_path.clone(),
            grain_cache_capacity: self.grain_cache.capacity(),
            sector_cache_capacity: self.sector_cache.capacity(),
            parent: self.parent.as_ref().map(|p| Box::new(p.info())),
        }
    }

    /// Logs the metadata of the image.
    pub fn print_info(&self) {
        info!("VMDK Disk Information:");
        info!("  Path: {}", self.path.display());
        info!("  Disk Type: {:?}", self.descriptor.header.create_type);
        info!("  Disk ID: {:08x}", self.descriptor.header.cid);
        info!(
            "  Capacity: {} sectors ({} bytes)",
            self.total_sectors(),
            self.total_sectors() * SECTOR_SIZE
        );
        info!(
            "  Geometry: {}/{}/{}",
            self.geometry.cylinders, self.geometry.heads, self.geometry.sectors
        );
        info!("  Extent list:");
        for extent in self.extents.iter() {
            info!(
                "    - {:?} {:?}, Extent file: {}, Number of sectors: {}, Start sector: {}",
                extent.access,
                extent.kind,
                extent.file_name().as_deref().unwrap_or("<none>"),
                extent.sector_count,
                extent.start
            );
            if let Some(ref sparse) = extent.sparse {
                info!(
                    "      Grain size: {} sectors, allocated grains: {}/{}",
                    sparse.grains.grain_size(),
                    sparse.grains.allocated_grains(),
                    sparse.grains.grain_count()
                );
                if sparse.header.unclean_shutdown {
                    warn!("      Extent was not closed cleanly");
                }
            }
        }
        let ddb = &self.descriptor.disk_database;
        if let Some(ref tools) = ddb.tools_version {
            info!("  Guest tools Version: {}", tools);
        }
        if let Some(thin_provisioned) = ddb.thin_provisioned {
            info!("  Thin Provisioned: {}", thin_provisioned);
        }
        if let Some(ref path) = self.descriptor.change_track_path {
            info!("  Change tracking file: {}", path);
        }
        info!(
            "  Caches: {} grains, {} sectors",
            self.grain_cache.capacity(),
            self.sector_cache.capacity()
        );
        if let Some(ref parent) = self.parent {
            info!("  Parent image (CID {:08x}):", self.descriptor.header.parent_cid);
            parent.print_info();
        }
    }

    /// Reads data from the VMDK disk into the given buffer, starting from the current position.
    /// Advances the current position by the number of bytes read and returns the number of bytes read.
    pub fn vmdk_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let disk_size = self.total_sectors() * SECTOR_SIZE;
        let mut total_read = 0;
        while total_read < buf.len() && self.position < disk_size {
            let sector = self.read_sector(self.position / SECTOR_SIZE)?;
            let within = (self.position % SECTOR_SIZE) as usize;
            let count = min(sector.len() - within, buf.len() - total_read);
            buf[total_read..total_read + count].copy_from_slice(&sector[within..within + count]);
            total_read += count;
            self.position += count as u64;
        }
        Ok(total_read)
    }

    /// Moves the byte position used by `vmdk_read`.
    ///
    /// # Errors
    ///
    /// Errors if the new position would be before the start or past the end of the disk.
    pub fn vmdk_seek(&mut self, offset: SeekFrom) -> io::Result<u64> {
        let disk_size = self.total_sectors() * SECTOR_SIZE;
        let new_position = match offset {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
            SeekFrom::End(offset) => disk_size.checked_add_signed(offset),
        };
        match new_position {
            Some(position) if position <= disk_size => {
                self.position = position;
                Ok(position)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset is out of bounds",
            )),
        }
    }
}

impl Read for VMDK {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.vmdk_read(buf)
    }
}

impl Seek for VMDK {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.vmdk_seek(pos)
    }
}
