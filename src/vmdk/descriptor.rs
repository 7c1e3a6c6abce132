//! Text descriptor of a VMDK image.
//!
//! The descriptor is either a standalone file or a block of text embedded in a
//! hosted sparse extent. It names the disk type, the parent link and, most
//! importantly, the ordered list of extents making up the disk.
//!
//! # Known Limitations
//!
//! Descriptor files not written in UTF-8 encoding are decoded lossily.

use std::{collections::HashMap, str::FromStr, sync::LazyLock};

use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::VmdkError;

const DESCRIPTOR_FILE_SIGNATURE: &str = "# Disk DescriptorFile";
const DESCRIPTOR_FILE_EXTENT_SECTION_SIGNATURE: &str = "# Extent description";
const DESCRIPTOR_FILE_CHANGE_TRACKING_SECTION_SIGNATURE: &str = "# Change Tracking File";
const DESCRIPTOR_FILE_DISK_DATABASE_SECTION_SIGNATURE: &str = "# The Disk Data Base";

/// `parentCID` value meaning "no parent".
pub const NO_PARENT_CID: u32 = 0xffff_ffff;

/// Decodes a descriptor token through the serde names of `T`.
fn from_token<T: for<'de> Deserialize<'de>>(token: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(token.to_string())).ok()
}

/// Represents the character encoding used for the descriptor file.
///
/// See also: https://github.com/libyal/libvmdk/blame/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#211-encodings
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum Encoding {
    #[serde(rename = "UTF-8")]
    Utf8,
    /// Big5 assumed to be equivalent to Windows codepage 950
    #[serde(rename = "Big5")]
    Big5,
    /// GBK assumed to be equivalent to Windows codepage 936
    #[serde(rename = "GBK")]
    Gbk,
    /// Shift_JIS assumed to be equivalent to Windows codepage 932
    #[serde(rename = "Shift_JIS")]
    ShiftJis,
    #[serde(rename = "windows-1252")]
    Windows1252,
}

/// Represents a VMDK disk type (`createType`).
///
/// See also: https://github.com/libyal/libvmdk/blame/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#212-disk-type
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub enum DiskType {
    /// Split into RAW extent files of at most 2 GB.
    #[serde(rename = "twoGbMaxExtentFlat", alias = "2GbMaxExtentFlat")]
    TwoGbMaxExtentFlat,
    /// Split into hosted sparse extent files of at most 2 GB.
    #[serde(rename = "twoGbMaxExtentSparse", alias = "2GbMaxExtentSparse")]
    TwoGbMaxExtentSparse,
    /// Descriptor file with arbitrary extents.
    Custom,
    /// Full physical disk device.
    FullDevice,
    /// A single RAW extent file next to the descriptor.
    MonolithicFlat,
    /// A single hosted sparse extent file embedding its own descriptor.
    MonolithicSparse,
    /// Physical disk device accessed per partition.
    PartitionedDevice,
    /// A single compressed hosted sparse extent file.
    StreamOptimized,
    Vmfs,
    VmfsEagerZeroedThick,
    VmfsPreallocated,
    /// Raw disk pass-through on ESXi hosts.
    VmfsRaw,
    /// Raw Device Map.
    #[serde(rename = "vmfsRDM")]
    VmfsRawDeviceMap,
    /// Raw Device Map sending SCSI commands to the underlying hardware.
    #[serde(rename = "vmfsRDMP")]
    VmfsPassthroughRawDeviceMap,
    /// COWD sparse extents, often used as a redo-log.
    VmfsSparse,
    VmfsThin,
}

impl DiskType {
    /// Disk types backed by raw devices, which this reader refuses to open.
    pub fn is_device(&self) -> bool {
        matches!(
            self,
            DiskType::FullDevice
                | DiskType::PartitionedDevice
                | DiskType::VmfsRaw
                | DiskType::VmfsRawDeviceMap
                | DiskType::VmfsPassthroughRawDeviceMap
        )
    }

    /// Disk types whose single extent lives in the same file as the descriptor.
    pub fn is_self_contained(&self) -> bool {
        matches!(self, DiskType::MonolithicSparse | DiskType::StreamOptimized)
    }
}

/// Access mode for an extent.
///
/// See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#222-extent-access-mode
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessMode {
    NoAccess,
    RdOnly,
    Rw,
}

/// Extent type as written in the descriptor.
///
/// See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#223-extent-type
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtentType {
    /// RAW extent data file
    Flat,
    /// Hosted sparse (`KDMV`) extent data file
    Sparse,
    /// Extent that consists of 0-byte values
    Zero,
    /// RAW extent data file on VMFS
    Vmfs,
    /// COWD sparse extent data file
    VmfsSparse,
    VmfsRdm,
    VmfsRaw,
}

/// One line of the extent section.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExtentLine {
    pub access_mode: AccessMode,
    /// Number of sectors in the extent
    pub sector_count: u64,
    pub extent_type: ExtentType,
    /// Name of the extent file, absent for ZERO extents
    pub file_name: Option<String>,
    /// Offset of the extent data inside the file, in sectors
    pub file_offset: u64,
}

impl FromStr for ExtentLine {
    type Err = VmdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static EXTENT_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r#"^(\w+)\s+(\d+)\s+(\w+)(?:\s+"([^"]*)")?(?:\s+(\d+))?(?:\s+\S+)*\s*$"#)
                .unwrap()
        });
        let malformed = || VmdkError::MalformedDescriptor(format!("invalid extent line: {}", s));
        let captures = EXTENT_LINE_REGEX.captures(s).ok_or_else(malformed)?;
        // Groups 1 to 3 are mandatory in the pattern.
        let access_mode = from_token(&captures[1]).ok_or_else(malformed)?;
        let sector_count = captures[2].parse().map_err(|_| malformed())?;
        let extent_type = from_token(&captures[3]).ok_or_else(malformed)?;
        let file_offset = match captures.get(5) {
            Some(m) => m.as_str().parse().map_err(|_| malformed())?,
            None => 0,
        };
        Ok(ExtentLine {
            access_mode,
            sector_count,
            extent_type,
            file_name: captures.get(4).map(|m| m.as_str().to_string()),
            file_offset,
        })
    }
}

/// Header section of the descriptor.
///
/// See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#21-header
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Header {
    /// Descriptor version, 1, 2 or 3.
    pub version: u8,
    pub encoding: Encoding,
    /// Content identifier, updated the first time the disk content changes after open.
    pub cid: u32,
    /// Content identifier of the parent, [`NO_PARENT_CID`] when there is none.
    pub parent_cid: u32,
    pub is_native_snapshot: Option<bool>,
    pub create_type: DiskType,
    /// Path to the parent image of a delta link.
    pub parent_file_name_hint: Option<String>,
}

impl TryFrom<HashMap<String, String>> for Header {
    type Error = VmdkError;

    fn try_from(value: HashMap<String, String>) -> Result<Self, Self::Error> {
        let malformed = |what: &str| VmdkError::MalformedDescriptor(what.to_string());
        let version = value
            .get("version")
            .ok_or_else(|| malformed("version not found in header"))?
            .parse()
            .map_err(|_| malformed("invalid version in header"))?;
        let encoding = match value.get("encoding") {
            Some(s) => from_token(s).unwrap_or_else(|| {
                warn!("Unknown descriptor encoding {}, assuming UTF-8", s);
                Encoding::Utf8
            }),
            None => Encoding::Utf8,
        };
        let cid = u32::from_str_radix(
            value
                .get("CID")
                .ok_or_else(|| malformed("CID not found in header"))?,
            16,
        )
        .map_err(|_| malformed("invalid CID in header"))?;
        let parent_cid = u32::from_str_radix(
            value
                .get("parentCID")
                .ok_or_else(|| malformed("parentCID not found in header"))?,
            16,
        )
        .map_err(|_| malformed("invalid parent CID in header"))?;
        let is_native_snapshot = value.get("isNativeSnapshot").map(|s| s.as_str() == "yes");
        let create_type_str = value
            .get("createType")
            .ok_or_else(|| malformed("createType not found in header"))?;
        let create_type = from_token(create_type_str)
            .ok_or_else(|| malformed(&format!("invalid createType {}", create_type_str)))?;
        let parent_file_name_hint = value
            .get("parentFileNameHint")
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        Ok(Header {
            version,
            encoding,
            cid,
            parent_cid,
            is_native_snapshot,
            create_type,
            parent_file_name_hint,
        })
    }
}

/// The adapter type for a disk.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum AdapterType {
    #[serde(rename = "ide")]
    Ide,
    #[serde(rename = "buslogic")]
    BusLogic,
    #[serde(rename = "lsilogic")]
    LsiLogic,
    #[serde(rename = "legacyESX")]
    LegacyEsx,
}

/// The disk database section contains various information about the virtual disk.
///
/// See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#24-disk-database
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiskDatabase {
    pub virtual_hw_version: Option<String>,
    pub long_content_id: Option<String>,
    pub uuid: Option<String>,
    pub geometry_cylinders: Option<u64>,
    pub geometry_heads: Option<u64>,
    pub geometry_sectors: Option<u64>,
    pub adapter_type: Option<AdapterType>,
    pub tools_version: Option<String>,
    pub thin_provisioned: Option<bool>,
}

impl From<HashMap<String, String>> for DiskDatabase {
    fn from(value: HashMap<String, String>) -> Self {
        let number = |key: &str| {
            value.get(key).and_then(|s| match s.parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    warn!("Ignoring invalid {} value in disk database: {}", key, s);
                    None
                }
            })
        };
        let adapter_type = value.get("ddb.adapterType").and_then(|s| {
            let adapter = from_token(s);
            if adapter.is_none() {
                warn!("Unknown adapter type in disk database: {}", s);
            }
            adapter
        });
        DiskDatabase {
            virtual_hw_version: value.get("ddb.virtualHWVersion").cloned(),
            long_content_id: value.get("ddb.longContentId").cloned(),
            uuid: value.get("ddb.uuid").cloned(),
            geometry_cylinders: number("ddb.geometry.cylinders"),
            geometry_heads: number("ddb.geometry.heads"),
            geometry_sectors: number("ddb.geometry.sectors"),
            adapter_type,
            tools_version: value.get("ddb.toolsVersion").cloned(),
            thin_provisioned: value
                .get("ddb.thinProvisioned")
                .map(|s| s == "1" || s == "true"),
        }
    }
}

/// Represents a VMDK descriptor file.
///
/// As defined at: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#2-the-descriptor-file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Descriptor {
    pub header: Header,
    pub extents: Vec<ExtentLine>,
    /// Path of the change tracking file (descriptor version 3).
    pub change_track_path: Option<String>,
    pub disk_database: DiskDatabase,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Header,
    Extent,
    DiskDatabase,
    ChangeTracking,
}

/// Returns the section started by a comment line, if it is a known section marker.
fn descriptor_section(line: &str) -> Option<Section> {
    match line {
        DESCRIPTOR_FILE_SIGNATURE => Some(Section::Header),
        DESCRIPTOR_FILE_EXTENT_SECTION_SIGNATURE => Some(Section::Extent),
        DESCRIPTOR_FILE_DISK_DATABASE_SECTION_SIGNATURE => Some(Section::DiskDatabase),
        DESCRIPTOR_FILE_CHANGE_TRACKING_SECTION_SIGNATURE => Some(Section::ChangeTracking),
        _ => None,
    }
}

/// Parses a key-value pair from the given line.
///
/// Returns None if the line does not match the expected key-value format.
fn parse_key_value_pair(line: &str) -> Option<(&str, &str)> {
    static KEY_VALUE_REGEX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"^([\w\.]+)\s*=\s*"?([^"]*)"?$"#).unwrap());
    let captures = KEY_VALUE_REGEX.captures(line)?;
    Some((captures.get(1)?.as_str(), captures.get(2)?.as_str()))
}

impl FromStr for Descriptor {
    type Err = VmdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut current_section = Section::None;
        let mut header_values = HashMap::new();
        let mut extents = Vec::new();
        let mut ddb_values = HashMap::new();
        let mut change_track_path = None;

        // Embedded descriptors are padded with NUL bytes up to the sector boundary.
        for line in s.trim_end_matches('\0').lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') {
                current_section = descriptor_section(line).unwrap_or(current_section);
                continue;
            }
            match current_section {
                Section::Header => {
                    if let Some((key, value)) = parse_key_value_pair(line) {
                        header_values.insert(key.to_string(), value.to_string());
                    }
                }
                Section::Extent => extents.push(line.parse::<ExtentLine>()?),
                Section::DiskDatabase => {
                    if let Some((key, value)) = parse_key_value_pair(line) {
                        ddb_values.insert(key.to_string(), value.to_string());
                    }
                }
                Section::ChangeTracking => {
                    if let Some(("changeTrackPath", value)) = parse_key_value_pair(line) {
                        change_track_path = Some(value.to_string());
                    }
                }
                Section::None => {}
            }
        }

        if extents.is_empty() {
            return Err(VmdkError::MalformedDescriptor(
                "no extent description found".to_string(),
            ));
        }
        debug!("Descriptor lists {} extent(s)", extents.len());

        Ok(Descriptor {
            header: Header::try_from(header_values)?,
            extents,
            change_track_path,
            disk_database: DiskDatabase::from(ddb_values),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value_pair() {
        assert_eq!(
            parse_key_value_pair("key1 = value1"),
            Some(("key1", "value1"))
        );
        assert_eq!(
            parse_key_value_pair("key3 = \"with quotes\""),
            Some(("key3", "with quotes"))
        );
        assert_eq!(
            parse_key_value_pair("key3 = \"with non-ascii çàù\""),
            Some(("key3", "with non-ascii çàù"))
        );
        assert_eq!(parse_key_value_pair("key4"), None);
        assert_eq!(
            parse_key_value_pair("key.with.periods = aaa"),
            Some(("key.with.periods", "aaa"))
        );
    }

    #[test]
    fn test_parse_extent_lines() {
        let flat: ExtentLine = r#"RW 204800 FLAT "disk-flat.vmdk" 0"#.parse().unwrap();
        assert_eq!(flat.access_mode, AccessMode::Rw);
        assert_eq!(flat.sector_count, 204800);
        assert_eq!(flat.extent_type, ExtentType::Flat);
        assert_eq!(flat.file_name.as_deref(), Some("disk-flat.vmdk"));
        assert_eq!(flat.file_offset, 0);

        let sparse: ExtentLine = r#"RDONLY 4192256 SPARSE "my disk-s001.vmdk""#.parse().unwrap();
        assert_eq!(sparse.access_mode, AccessMode::RdOnly);
        assert_eq!(sparse.extent_type, ExtentType::Sparse);
        assert_eq!(sparse.file_name.as_deref(), Some("my disk-s001.vmdk"));

        let zero: ExtentLine = "NOACCESS 50 ZERO".parse().unwrap();
        assert_eq!(zero.extent_type, ExtentType::Zero);
        assert_eq!(zero.file_name, None);

        let offset: ExtentLine = r#"RW 100 VMFS "base.vmdk" 2048"#.parse().unwrap();
        assert_eq!(offset.extent_type, ExtentType::Vmfs);
        assert_eq!(offset.file_offset, 2048);
    }

    #[test]
    fn test_reject_malformed_extent_lines() {
        for line in [
            "RW FLAT \"a.vmdk\"",
            "READ 10 FLAT \"a.vmdk\"",
            "RW 10 TAPE \"a.vmdk\"",
            "RW -10 FLAT",
        ] {
            assert!(
                matches!(
                    line.parse::<ExtentLine>(),
                    Err(VmdkError::MalformedDescriptor(_))
                ),
                "{} should be rejected",
                line
            );
        }
    }

    #[test]
    fn test_parse_descriptor_data() {
        let descriptor_data = r#"
# Disk DescriptorFile
version=1
CID=123a5678
parentCID=ffffffff
createType="2GbMaxExtentSparse"
encoding="UTF-8"
isNativeSnapshot="no"

# Extent description
RW 4192256 ZERO

# The Disk Data Base
# DDB

ddb.virtualHWVersion = "4"
ddb.geometry.cylinders = "16383"
ddb.geometry.heads = "16"
ddb.geometry.sectors = "63"
ddb.adapterType = "ide"
ddb.toolsVersion = "0"
"#;

        let descriptor = descriptor_data.parse::<Descriptor>().unwrap();
        assert_eq!(descriptor.header.create_type, DiskType::TwoGbMaxExtentSparse);
        assert_eq!(descriptor.header.cid, 0x123a5678);
        assert_eq!(descriptor.header.parent_cid, NO_PARENT_CID);
        assert_eq!(descriptor.header.is_native_snapshot, Some(false));
        assert_eq!(descriptor.extents.len(), 1);
        assert_eq!(descriptor.extents[0].access_mode, AccessMode::Rw);
        assert_eq!(descriptor.extents[0].sector_count, 4192256);
        assert_eq!(descriptor.extents[0].extent_type, ExtentType::Zero);
        assert_eq!(descriptor.disk_database.geometry_cylinders, Some(16383));
        assert_eq!(descriptor.disk_database.adapter_type, Some(AdapterType::Ide));
    }

    #[test]
    fn test_parse_delta_descriptor() {
        let descriptor_data = "# Disk DescriptorFile\n\
            version=1\n\
            CID=fffffffe\n\
            parentCID=0000abcd\n\
            createType=\"monolithicSparse\"\n\
            parentFileNameHint=\"base.vmdk\"\n\
            # Extent description\n\
            RW 2048 SPARSE \"delta.vmdk\"\n\
            # Change Tracking File\n\
            changeTrackPath=\"delta-ctk.vmdk\"\n\0\0\0";

        let descriptor = descriptor_data.parse::<Descriptor>().unwrap();
        assert_eq!(descriptor.header.parent_cid, 0xabcd);
        assert_eq!(descriptor.header.create_type, DiskType::MonolithicSparse);
        assert_eq!(
            descriptor.header.parent_file_name_hint.as_deref(),
            Some("base.vmdk")
        );
        assert_eq!(descriptor.change_track_path.as_deref(), Some("delta-ctk.vmdk"));
    }

    #[test]
    fn test_descriptor_errors() {
        let missing_cid = "# Disk DescriptorFile\nversion=1\nparentCID=ffffffff\n\
            createType=\"monolithicFlat\"\n# Extent description\nRW 10 ZERO\n";
        assert!(matches!(
            missing_cid.parse::<Descriptor>(),
            Err(VmdkError::MalformedDescriptor(_))
        ));

        let no_extent = "# Disk DescriptorFile\nversion=1\nCID=1\nparentCID=ffffffff\n\
            createType=\"monolithicFlat\"\n";
        assert!(matches!(
            no_extent.parse::<Descriptor>(),
            Err(VmdkError::MalformedDescriptor(_))
        ));

        let bad_line = "# Disk DescriptorFile\nversion=1\nCID=1\nparentCID=ffffffff\n\
            createType=\"monolithicFlat\"\n# Extent description\nRW ten FLAT \"x\"\n";
        assert!(matches!(
            bad_line.parse::<Descriptor>(),
            Err(VmdkError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn test_disk_type_names() {
        assert_eq!(from_token::<DiskType>("twoGbMaxExtentFlat"), Some(DiskType::TwoGbMaxExtentFlat));
        assert_eq!(from_token::<DiskType>("2GbMaxExtentFlat"), Some(DiskType::TwoGbMaxExtentFlat));
        assert_eq!(from_token::<DiskType>("vmfsEagerZeroedThick"), Some(DiskType::VmfsEagerZeroedThick));
        assert_eq!(from_token::<DiskType>("vmfsRDM"), Some(DiskType::VmfsRawDeviceMap));
        assert!(DiskType::PartitionedDevice.is_device());
        assert!(!DiskType::VmfsThin.is_device());
        assert!(DiskType::StreamOptimized.is_self_contained());
    }
}
