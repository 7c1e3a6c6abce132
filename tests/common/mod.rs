#![allow(dead_code)]

use std::{fs, path::Path};

pub const SECTOR: usize = 512;

pub fn write_le_u16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
}

pub fn write_le_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

pub fn write_le_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
}

/// Content of one grain of a synthetic sparse extent.
#[derive(Clone, Debug)]
pub enum Grain {
    Unallocated,
    Zeroed,
    Data(Vec<u8>),
}

/// Builder for hosted sparse (`KDMV`) extent files.
pub struct SparseImage {
    pub capacity: u64,
    pub grain_size: u64,
    pub entries_per_table: u32,
    pub compression: u16,
    pub grains: Vec<Grain>,
}

impl SparseImage {
    pub fn new(capacity: u64, grain_size: u64, entries_per_table: u32) -> Self {
        let count = capacity.div_ceil(grain_size) as usize;
        SparseImage {
            capacity,
            grain_size,
            entries_per_table,
            compression: 0,
            grains: vec![Grain::Unallocated; count],
        }
    }

    pub fn grain(mut self, index: usize, grain: Grain) -> Self {
        self.grains[index] = grain;
        self
    }

    /// Fills grain `index` with bytes where byte `i` is `(seed + i) % 251`.
    pub fn pattern_grain(self, index: usize, seed: u8) -> Self {
        let len = self.grain_size as usize * SECTOR;
        let data = grain_pattern(len, seed);
        self.grain(index, Grain::Data(data))
    }

    fn header(&self, descriptor_sectors: usize, directory: usize, overhead: usize) -> Vec<u8> {
        let mut header = vec![0u8; SECTOR];
        header[0..4].copy_from_slice(b"KDMV");
        write_le_u32(&mut header, 4, 1); // version
        write_le_u32(&mut header, 8, 1); // flags
        write_le_u64(&mut header, 12, self.capacity);
        write_le_u64(&mut header, 20, self.grain_size);
        if descriptor_sectors > 0 {
            write_le_u64(&mut header, 28, 1);
            write_le_u64(&mut header, 36, descriptor_sectors as u64);
        }
        write_le_u32(&mut header, 44, self.entries_per_table);
        write_le_u64(&mut header, 56, directory as u64);
        write_le_u64(&mut header, 64, overhead as u64);
        header[73..77].copy_from_slice(b"\n \r\n");
        write_le_u16(&mut header, 77, self.compression);
        header
    }

    /// Lays out header, optional embedded descriptor, grain directory, grain
    /// tables and grains, in that order.
    pub fn build(&self, descriptor: Option<&str>) -> Vec<u8> {
        let gte = self.entries_per_table as usize;
        let directory_entries = self.grains.len().div_ceil(gte);
        let descriptor_bytes = descriptor.map(str::as_bytes).unwrap_or_default();
        let descriptor_sectors = descriptor_bytes.len().div_ceil(SECTOR);
        let directory = 1 + descriptor_sectors;
        let directory_sectors = (directory_entries * 4).div_ceil(SECTOR);
        let table_sectors = (gte * 4).div_ceil(SECTOR);
        let first_table = directory + directory_sectors;
        let first_grain = first_table + directory_entries * table_sectors;

        let mut image = vec![0u8; first_grain * SECTOR];
        image[..SECTOR].copy_from_slice(&self.header(descriptor_sectors, directory, first_grain));
        image[SECTOR..SECTOR + descriptor_bytes.len()].copy_from_slice(descriptor_bytes);
        for table in 0..directory_entries {
            write_le_u32(
                &mut image,
                directory * SECTOR + table * 4,
                (first_table + table * table_sectors) as u32,
            );
        }

        let mut next_grain = first_grain;
        for (index, grain) in self.grains.iter().enumerate() {
            let entry = match grain {
                Grain::Unallocated => 0,
                Grain::Zeroed => 1,
                Grain::Data(data) => {
                    assert_eq!(data.len(), self.grain_size as usize * SECTOR);
                    image.extend_from_slice(data);
                    let offset = next_grain;
                    next_grain += self.grain_size as usize;
                    offset as u32
                }
            };
            let table = first_table + (index / gte) * table_sectors;
            write_le_u32(&mut image, table * SECTOR + (index % gte) * 4, entry);
        }
        image
    }
}

pub fn grain_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| ((seed as usize + i) % 251) as u8).collect()
}

/// Text of a descriptor with the given header lines and extent lines.
pub fn descriptor_text(create_type: &str, header_extra: &str, extents: &str) -> String {
    format!(
        "# Disk DescriptorFile\n\
         version=1\n\
         encoding=\"UTF-8\"\n\
         CID=fffffffe\n\
         parentCID=ffffffff\n\
         createType=\"{}\"\n\
         {}\n\
         # Extent description\n\
         {}\n\
         \n\
         # The Disk Data Base\n\
         #DDB\n\
         \n\
         ddb.virtualHWVersion = \"4\"\n",
        create_type, header_extra, extents
    )
}

/// Writes a monolithic sparse image embedding its own descriptor.
pub fn write_monolithic_sparse(path: &Path, image: &SparseImage, header_extra: &str) {
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    let descriptor = descriptor_text(
        "monolithicSparse",
        header_extra,
        &format!("RW {} SPARSE \"{}\"", image.capacity, name),
    );
    fs::write(path, image.build(Some(&descriptor))).unwrap();
}

/// Writes `disk.vmdk` and `disk-flat.vmdk` holding `data` in `dir`.
pub fn write_flat(dir: &Path, name: &str, data: &[u8], header_extra: &str) -> std::path::PathBuf {
    assert_eq!(data.len() % SECTOR, 0);
    let flat_name = format!("{}-flat.vmdk", name);
    fs::write(dir.join(&flat_name), data).unwrap();
    let path = dir.join(format!("{}.vmdk", name));
    fs::write(
        &path,
        descriptor_text(
            "monolithicFlat",
            header_extra,
            &format!("RW {} FLAT \"{}\" 0", data.len() / SECTOR, flat_name),
        ),
    )
    .unwrap();
    path
}
