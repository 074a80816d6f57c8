// Sources:
// - https://github.com/libyal/libbde/blob/main/documentation/BitLocker%20Drive%20Encryption%20(BDE)%20format.asciidoc

//! On-disk headers of a BitLocker volume: the volume header replacing the
//! boot sector, and the FVE metadata block and metadata headers found at each
//! of the three metadata copies.

use byteorder::{LittleEndian, ReadBytesExt};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{self, Cursor, Read};

use crate::metadata::{EncryptionType, filetime_to_datetime, format_guid};

pub const FVE_SIGNATURE: [u8; 8] = *b"-FVE-FS-";
pub const VOLUME_HEADER_SIZE: usize = 512;
pub const BLOCK_HEADER_SIZE: usize = 64;
pub const METADATA_HEADER_SIZE: usize = 48;
pub const MAX_METADATA_ENTRIES_SIZE: usize = 0x80000;

fn too_short(what: &str, needed: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{} must be at least {} bytes", what, needed),
    )
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VolumeHeader {
    /* -- 0x00-0x0A ------------------------------------------ */
    pub jump_instruction: [u8; 3],
    pub signature: [u8; 8], // "-FVE-FS-"

    /* -- BIOS Parameter Block ------------------------------- */
    pub bytes_per_sector: u16,   // 0x0B
    pub sectors_per_cluster: u8, // 0x0D
    pub reserved_sectors: u16,   // 0x0E

    /* -- BitLocker fields ----------------------------------- */
    pub volume_guid: [u8; 16],        // 0xA0
    pub metadata_offsets: [u64; 3],   // 0xB0, 0xB8, 0xC0 (volume relative)
    pub end_of_sector_marker: u16,    // 0x1FE
}

impl VolumeHeader {
    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < VOLUME_HEADER_SIZE {
            return Err(too_short("Volume header", VOLUME_HEADER_SIZE));
        }
        let mut c = Cursor::new(buf);

        macro_rules! read_array {
            ($len:expr) => {{
                let mut tmp = [0u8; $len];
                c.read_exact(&mut tmp)?;
                tmp
            }};
        }

        let jump_instruction = read_array!(3);
        let signature = read_array!(8);
        let bytes_per_sector = c.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = c.read_u8()?;
        let reserved_sectors = c.read_u16::<LittleEndian>()?;

        c.set_position(0xA0);
        let volume_guid = read_array!(16);
        let metadata_offsets = [
            c.read_u64::<LittleEndian>()?,
            c.read_u64::<LittleEndian>()?,
            c.read_u64::<LittleEndian>()?,
        ];

        c.set_position(0x1FE);
        let end_of_sector_marker = c.read_u16::<LittleEndian>()?;

        Ok(Self {
            jump_instruction,
            signature,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            volume_guid,
            metadata_offsets,
            end_of_sector_marker,
        })
    }

    pub fn signature_is_valid(&self) -> bool {
        self.signature == FVE_SIGNATURE
    }

    /// Sectors must hold a whole number of AES blocks.
    pub fn sector_size_is_valid(&self) -> bool {
        self.bytes_per_sector >= 16 && self.bytes_per_sector % 16 == 0
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(row!["BitLocker Volume Header"]);
        t.add_row(row![b -> "Signature", String::from_utf8_lossy(&self.signature)]);
        t.add_row(row![b -> "Bytes per sector", self.bytes_per_sector]);
        t.add_row(row![b -> "Sectors per cluster", self.sectors_per_cluster]);
        t.add_row(row![b -> "Volume identifier", format_guid(&self.volume_guid)]);
        for (i, offset) in self.metadata_offsets.iter().enumerate() {
            t.add_row(row![b -> format!("Metadata offset #{}", i + 1), format!("0x{:X}", offset)]);
        }
        t.to_string()
    }
}

/// FVE metadata block header, version 2 (Windows 7 and later).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FveBlockHeader {
    pub signature: [u8; 8],          // 0x00
    pub size: u16,                   // 0x08
    pub version: u16,                // 0x0A
    pub unknown1: [u8; 4],           // 0x0C
    pub encrypted_volume_size: u64,  // 0x10
    pub unknown2: u32,               // 0x18
    pub volume_header_sectors: u32,  // 0x1C
    pub metadata_offsets: [u64; 3],  // 0x20, 0x28, 0x30
    pub volume_header_offset: u64,   // 0x38
}

impl FveBlockHeader {
    pub const SUPPORTED_VERSION: u16 = 2;

    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(too_short("FVE metadata block header", BLOCK_HEADER_SIZE));
        }
        let mut c = Cursor::new(buf);

        let mut signature = [0u8; 8];
        c.read_exact(&mut signature)?;
        let size = c.read_u16::<LittleEndian>()?;
        let version = c.read_u16::<LittleEndian>()?;
        let mut unknown1 = [0u8; 4];
        c.read_exact(&mut unknown1)?;

        Ok(Self {
            signature,
            size,
            version,
            unknown1,
            encrypted_volume_size: c.read_u64::<LittleEndian>()?,
            unknown2: c.read_u32::<LittleEndian>()?,
            volume_header_sectors: c.read_u32::<LittleEndian>()?,
            metadata_offsets: [
                c.read_u64::<LittleEndian>()?,
                c.read_u64::<LittleEndian>()?,
                c.read_u64::<LittleEndian>()?,
            ],
            volume_header_offset: c.read_u64::<LittleEndian>()?,
        })
    }

    pub fn signature_is_valid(&self) -> bool {
        self.signature == FVE_SIGNATURE
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(row!["FVE Metadata Block Header"]);
        t.add_row(row![b -> "Version", self.version]);
        t.add_row(row![b -> "Encrypted volume size", format!("0x{:X}", self.encrypted_volume_size)]);
        t.add_row(row![b -> "Volume header sectors", self.volume_header_sectors]);
        t.add_row(row![b -> "Volume header offset", format!("0x{:X}", self.volume_header_offset)]);
        for (i, offset) in self.metadata_offsets.iter().enumerate() {
            t.add_row(row![b -> format!("Metadata offset #{}", i + 1), format!("0x{:X}", offset)]);
        }
        t.to_string()
    }
}

/// Header preceding the metadata entries of one copy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FveMetadataHeader {
    pub size: u32,               // 0x00 (header included)
    pub version: u32,            // 0x04
    pub header_size: u32,        // 0x08
    pub size_copy: u32,          // 0x0C
    pub volume_guid: [u8; 16],   // 0x10
    pub next_nonce_counter: u32, // 0x20
    pub encryption_method: u32,  // 0x24
    pub creation_time: u64,      // 0x28 FILETIME
}

impl FveMetadataHeader {
    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < METADATA_HEADER_SIZE {
            return Err(too_short("FVE metadata header", METADATA_HEADER_SIZE));
        }
        let mut c = Cursor::new(buf);

        let size = c.read_u32::<LittleEndian>()?;
        let version = c.read_u32::<LittleEndian>()?;
        let header_size = c.read_u32::<LittleEndian>()?;
        let size_copy = c.read_u32::<LittleEndian>()?;
        let mut volume_guid = [0u8; 16];
        c.read_exact(&mut volume_guid)?;

        Ok(Self {
            size,
            version,
            header_size,
            size_copy,
            volume_guid,
            next_nonce_counter: c.read_u32::<LittleEndian>()?,
            encryption_method: c.read_u32::<LittleEndian>()?,
            creation_time: c.read_u64::<LittleEndian>()?,
        })
    }

    pub fn encryption_type(&self) -> EncryptionType {
        EncryptionType::from_tag(self.encryption_method)
    }

    /// Length of the entry area following this header, if it is sane.
    pub fn entries_size(&self) -> Option<usize> {
        let entries = (self.size as usize).checked_sub(METADATA_HEADER_SIZE)?;
        if entries == 0 || entries > MAX_METADATA_ENTRIES_SIZE {
            return None;
        }
        Some(entries)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(row!["FVE Metadata Header"]);
        t.add_row(row![b -> "Size", self.size]);
        t.add_row(row![b -> "Version", self.version]);
        t.add_row(row![b -> "Volume identifier", format_guid(&self.volume_guid)]);
        t.add_row(row![b -> "Next nonce counter", self.next_nonce_counter]);
        t.add_row(row![b -> "Encryption method", self.encryption_type()]);
        t.add_row(row![b -> "Created", filetime_to_datetime(self.creation_time)]);
        t.to_string()
    }
}
