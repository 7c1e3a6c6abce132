//! Error type shared by every part of the VMDK reader.

use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmdkError>;

/// Failures surfaced while opening or reading a VMDK container.
///
/// Open-time variants (descriptor, extent, grain index, header and parent
/// errors) abort [`crate::vmdk::VMDK::open`] entirely. Read-time variants
/// such as [`VmdkError::OutOfRange`] only concern the failing call and leave
/// the container usable.
#[derive(Debug, Error)]
pub enum VmdkError {
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("extent file not found: {}", .0.display())]
    ExtentNotFound(PathBuf),

    #[error("parent image not found: {}", .0.display())]
    ParentNotFound(PathBuf),

    #[error("unable to open parent image {}: {source}", .path.display())]
    ParentOpenFailed {
        path: PathBuf,
        #[source]
        source: Box<VmdkError>,
    },

    #[error("parent chain loops back to {}", .0.display())]
    ParentCycleDetected(PathBuf),

    #[error("corrupt grain index: {0}")]
    CorruptGrainIndex(&'static str),

    #[error("unsupported compression method {0}")]
    UnsupportedCompression(u16),

    #[error("unsupported extent kind: {0}")]
    UnsupportedExtentKind(String),

    #[error("invalid sparse header: {0}")]
    InvalidHeader(String),

    #[error("sector range out of bounds: sector={sector} count={count} total={total}")]
    OutOfRange { sector: u64, count: u64, total: u64 },

    #[error("extent holding sector {0} is not accessible")]
    AccessDenied(u64),

    #[error("buffer length {0} is not a multiple of the sector size")]
    UnalignedBuffer(usize),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl VmdkError {
    pub(crate) fn out_of_range(sector: u64, count: u64, total: u64) -> Self {
        VmdkError::OutOfRange {
            sector,
            count,
            total,
        }
    }
}

impl From<VmdkError> for io::Error {
    fn from(err: VmdkError) -> Self {
        match err {
            VmdkError::Io(e) => e,
            VmdkError::OutOfRange { .. } | VmdkError::UnalignedBuffer(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            VmdkError::AccessDenied(_) => io::Error::new(io::ErrorKind::PermissionDenied, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
