//! Creation of `monolithicFlat` images.
//!
//! A [`VmdkWriter`] lays out a pre-sized flat extent next to the descriptor
//! path it was given, accepts sector writes, and writes the descriptor when
//! finished. The result can be opened with [`super::VMDK::open`].

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info};

use crate::{
    backing::Backing,
    error::{Result, VmdkError},
};

use super::{descriptor::NO_PARENT_CID, Geometry, SECTOR_SIZE};

pub struct VmdkWriter {
    descriptor_path: PathBuf,
    extent_name: String,
    extent: Backing,
    total_sectors: u64,
    cid: u32,
}

/// Content ID for a new image. Never equal to the "no parent" marker.
fn new_content_id() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
        .unwrap_or(1);
    if nanos == NO_PARENT_CID {
        nanos - 1
    } else {
        nanos
    }
}

impl VmdkWriter {
    /// Creates the flat extent of a new image of `total_sectors` sectors.
    ///
    /// For a descriptor path `disk.vmdk` the extent is `disk-flat.vmdk` in
    /// the same directory. The extent reads as zeros until written.
    pub fn create(path: impl AsRef<Path>, total_sectors: u64) -> Result<VmdkWriter> {
        let descriptor_path = path.as_ref().to_path_buf();
        if total_sectors == 0 {
            return Err(VmdkError::MalformedDescriptor(
                "an image needs at least one sector".to_string(),
            ));
        }
        let stem = descriptor_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| {
                VmdkError::MalformedDescriptor(format!(
                    "{} has no file name",
                    descriptor_path.display()
                ))
            })?;
        let extent_name = format!("{}-flat.vmdk", stem);
        let extent_path = descriptor_path.with_file_name(&extent_name);

        let size = total_sectors
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| VmdkError::out_of_range(0, total_sectors, u64::MAX / SECTOR_SIZE))?;
        let file = File::create(&extent_path)?;
        file.set_len(size)?;
        debug!(
            "Created flat extent {} of {} sectors",
            extent_path.display(),
            total_sectors
        );

        Ok(VmdkWriter {
            descriptor_path,
            extent_name,
            extent: Backing::writable(extent_path),
            total_sectors,
            cid: new_content_id(),
        })
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Writes one 512-byte sector at `address`.
    pub fn write_sector(&mut self, address: u64, data: &[u8]) -> Result<()> {
        if data.len() != SECTOR_SIZE as usize {
            return Err(VmdkError::UnalignedBuffer(data.len()));
        }
        self.write_sectors(address, data)
    }

    /// Writes `data`, a whole number of sectors, starting at `address`.
    pub fn write_sectors(&mut self, address: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() % SECTOR_SIZE as usize != 0 {
            return Err(VmdkError::UnalignedBuffer(data.len()));
        }
        let count = (data.len() / SECTOR_SIZE as usize) as u64;
        if address
            .checked_add(count)
            .map_or(true, |end| end > self.total_sectors)
        {
            return Err(VmdkError::out_of_range(address, count, self.total_sectors));
        }
        self.extent.write_all_at(address * SECTOR_SIZE, data)?;
        Ok(())
    }

    /// Descriptor text of the image being written.
    pub fn descriptor(&self) -> String {
        let geometry = Geometry::from_capacity(self.total_sectors);
        format!(
            "# Disk DescriptorFile\n\
             version=1\n\
             encoding=\"UTF-8\"\n\
             CID={:08x}\n\
             parentCID={:08x}\n\
             isNativeSnapshot=\"no\"\n\
             createType=\"monolithicFlat\"\n\
             \n\
             # Extent description\n\
             RW {} FLAT \"{}\" 0\n\
             \n\
             # The Disk Data Base\n\
             #DDB\n\
             \n\
             ddb.virtualHWVersion = \"4\"\n\
             ddb.geometry.cylinders = \"{}\"\n\
             ddb.geometry.heads = \"{}\"\n\
             ddb.geometry.sectors = \"{}\"\n\
             ddb.adapterType = \"ide\"\n",
            self.cid,
            NO_PARENT_CID,
            self.total_sectors,
            self.extent_name,
            geometry.cylinders,
            geometry.heads,
            geometry.sectors
        )
    }

    /// Flushes the extent and writes the descriptor. Returns the descriptor path.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.extent.flush()?;
        fs::write(&self.descriptor_path, self.descriptor())?;
        info!(
            "Wrote {} ({} sectors)",
            self.descriptor_path.display(),
            self.total_sectors
        );
        Ok(self.descriptor_path)
    }
}
