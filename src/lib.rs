//! Reader for VMware VMDK virtual disks.
//!
//! [`VMDK`] resolves logical 512-byte sectors through the extent list of the
//! image descriptor, the grain index of sparse extents and, for delta images,
//! the parent image. [`VmdkWriter`] creates `monolithicFlat` images.

pub mod backing;
pub mod error;
pub mod vmdk;

pub use error::{Result, VmdkError};
pub use vmdk::{
    options::VmdkOptions, writer::VmdkWriter, DiskInfo, Geometry, SECTOR_SIZE, VMDK,
};
