// Sources:
// - https://github.com/libyal/libbde/blob/main/documentation/BitLocker%20Drive%20Encryption%20(BDE)%20format.asciidoc
// - https://github.com/Aorimn/dislocker
//
// FVE metadata entries: a self-delimiting TLV format where some values
// (volume master keys, stretch keys) embed further entries.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{TimeZone, Utc};
use log::{debug, warn};
use prettytable::{Table, row};
use serde::{Serialize, Serializer};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Every entry starts with size, entry type, value type and version (4 x u16).
pub const ENTRY_HEADER_LEN: usize = 8;

const VMK_HEADER_LEN: usize = 28;
const STRETCH_KEY_HEADER_LEN: usize = 20;
const AES_CCM_HEADER_LEN: usize = 12;
const KEY_HEADER_LEN: usize = 4;
const OFFSET_AND_SIZE_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("{what} needs at least {needed} bytes but only {available} are available")]
    TooShort {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("entry size {size} is invalid for a buffer of {available} bytes")]
    InvalidEntrySize { size: u16, available: usize },

    #[error("zero sized entry at offset {offset}")]
    ZeroSizedEntry { offset: usize },
}

fn require(buf: &[u8], needed: usize, what: &'static str) -> Result<(), MetadataError> {
    if buf.len() < needed {
        warn!(
            "Buffer for {} is too short ({} < {} bytes)",
            what,
            buf.len(),
            needed
        );
        return Err(MetadataError::TooShort {
            what,
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/* Type tags */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryType {
    Property,
    VolumeMasterKey,
    FullVolumeEncryptionKey,
    Validation,
    StartupKey,
    Description,
    FvekBackup,
    VolumeHeaderBlock,
    Unknown(u16),
}

impl From<u16> for EntryType {
    fn from(value: u16) -> Self {
        use EntryType::*;
        match value {
            0x0000 => Property,
            0x0002 => VolumeMasterKey,
            0x0003 => FullVolumeEncryptionKey,
            0x0004 => Validation,
            0x0006 => StartupKey,
            0x0007 => Description,
            0x000B => FvekBackup,
            0x000F => VolumeHeaderBlock,
            other => Unknown(other),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Property => f.write_str("Property"),
            EntryType::VolumeMasterKey => f.write_str("Volume Master Key"),
            EntryType::FullVolumeEncryptionKey => f.write_str("Full Volume Encryption Key"),
            EntryType::Validation => f.write_str("Validation"),
            EntryType::StartupKey => f.write_str("Startup Key"),
            EntryType::Description => f.write_str("Description"),
            EntryType::FvekBackup => f.write_str("FVEK Backup"),
            EntryType::VolumeHeaderBlock => f.write_str("Volume Header Block"),
            EntryType::Unknown(code) => write!(f, "Unknown (0x{:04X})", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueType {
    Erased,
    Key,
    UnicodeString,
    StretchKey,
    UseKey,
    AesCcmEncryptedKey,
    TpmEncodedKey,
    Validation,
    VolumeMasterKey,
    ExternalKey,
    Update,
    Error,
    OffsetAndSize,
    Unknown(u16),
}

impl From<u16> for ValueType {
    fn from(value: u16) -> Self {
        use ValueType::*;
        match value {
            0x0000 => Erased,
            0x0001 => Key,
            0x0002 => UnicodeString,
            0x0003 => StretchKey,
            0x0004 => UseKey,
            0x0005 => AesCcmEncryptedKey,
            0x0006 => TpmEncodedKey,
            0x0007 => Validation,
            0x0008 => VolumeMasterKey,
            0x0009 => ExternalKey,
            0x000A => Update,
            0x000B => Error,
            0x000F => OffsetAndSize,
            other => Unknown(other),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Erased => f.write_str("Erased"),
            ValueType::Key => f.write_str("Key"),
            ValueType::UnicodeString => f.write_str("Unicode String"),
            ValueType::StretchKey => f.write_str("Stretch Key"),
            ValueType::UseKey => f.write_str("Use Key"),
            ValueType::AesCcmEncryptedKey => f.write_str("AES-CCM Encrypted Key"),
            ValueType::TpmEncodedKey => f.write_str("TPM Encoded Key"),
            ValueType::Validation => f.write_str("Validation"),
            ValueType::VolumeMasterKey => f.write_str("Volume Master Key"),
            ValueType::ExternalKey => f.write_str("External Key"),
            ValueType::Update => f.write_str("Update"),
            ValueType::Error => f.write_str("Error"),
            ValueType::OffsetAndSize => f.write_str("Offset and Size"),
            ValueType::Unknown(code) => write!(f, "Unknown (0x{:04X})", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyProtectionType {
    ClearKey,
    Tpm,
    StartupKey,
    TpmAndPin,
    RecoveryPassword,
    Password,
    Unknown(u16),
}

impl From<u16> for KeyProtectionType {
    fn from(value: u16) -> Self {
        use KeyProtectionType::*;
        match value {
            0x0000 => ClearKey,
            0x0100 => Tpm,
            0x0200 => StartupKey,
            0x0500 => TpmAndPin,
            0x0800 => RecoveryPassword,
            0x2000 => Password,
            other => Unknown(other),
        }
    }
}

impl fmt::Display for KeyProtectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyProtectionType::ClearKey => f.write_str("Clear Key"),
            KeyProtectionType::Tpm => f.write_str("TPM"),
            KeyProtectionType::StartupKey => f.write_str("Startup Key"),
            KeyProtectionType::TpmAndPin => f.write_str("TPM and PIN"),
            KeyProtectionType::RecoveryPassword => f.write_str("Recovery Password"),
            KeyProtectionType::Password => f.write_str("Password"),
            KeyProtectionType::Unknown(code) => write!(f, "Unknown (0x{:04X})", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EncryptionType {
    StretchKey,
    AesCcm256,
    ExternKey,
    Vmk,
    Hash256,
    AesCbc128Diffuser,
    AesCbc256Diffuser,
    AesCbc128,
    AesCbc256,
    AesXts128,
    AesXts256,
    Unknown(u16),
}

impl From<u16> for EncryptionType {
    fn from(value: u16) -> Self {
        use EncryptionType::*;
        match value {
            0x1000 => StretchKey,
            0x2000 | 0x2001 | 0x2004 => AesCcm256,
            0x2002 => ExternKey,
            0x2003 => Vmk,
            0x2005 => Hash256,
            0x8000 => AesCbc128Diffuser,
            0x8001 => AesCbc256Diffuser,
            0x8002 => AesCbc128,
            0x8003 => AesCbc256,
            0x8004 => AesXts128,
            0x8005 => AesXts256,
            other => Unknown(other),
        }
    }
}

impl EncryptionType {
    /// The on-disk tag is 32 bits wide; only the low half selects the method.
    pub fn from_tag(tag: u32) -> Self {
        Self::from((tag & 0xFFFF) as u16)
    }

    pub fn is_aes_cbc(&self) -> bool {
        matches!(
            self,
            EncryptionType::AesCbc128Diffuser
                | EncryptionType::AesCbc256Diffuser
                | EncryptionType::AesCbc128
                | EncryptionType::AesCbc256
        )
    }

    pub fn is_aes_xts(&self) -> bool {
        matches!(self, EncryptionType::AesXts128 | EncryptionType::AesXts256)
    }
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionType::StretchKey => f.write_str("Stretch Key"),
            EncryptionType::AesCcm256 => f.write_str("AES-CCM 256-bit"),
            EncryptionType::ExternKey => f.write_str("External Key"),
            EncryptionType::Vmk => f.write_str("VMK"),
            EncryptionType::Hash256 => f.write_str("Hash 256"),
            EncryptionType::AesCbc128Diffuser => f.write_str("AES-CBC 128-bit with diffuser"),
            EncryptionType::AesCbc256Diffuser => f.write_str("AES-CBC 256-bit with diffuser"),
            EncryptionType::AesCbc128 => f.write_str("AES-CBC 128-bit"),
            EncryptionType::AesCbc256 => f.write_str("AES-CBC 256-bit"),
            EncryptionType::AesXts128 => f.write_str("AES-XTS 128-bit"),
            EncryptionType::AesXts256 => f.write_str("AES-XTS 256-bit"),
            EncryptionType::Unknown(code) => write!(f, "Unknown (0x{:04X})", code),
        }
    }
}

/// Raw key material. Wiped on drop and never serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyBytes(Vec<u8>);

impl KeyBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyBytes(<{} bytes>)", self.0.len())
    }
}

impl Serialize for KeyBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("<{} bytes redacted>", self.0.len()))
    }
}

/* Values */

#[derive(Debug, Clone, Serialize)]
pub enum MetadataValue {
    Key {
        encryption_type: EncryptionType,
        key: KeyBytes,
    },
    VolumeMasterKey {
        guid: [u8; 16],
        last_modification_time: u64,
        protection_type: KeyProtectionType,
        properties: Vec<MetadataEntry>,
    },
    StretchKey {
        encryption_type: EncryptionType,
        salt: [u8; 16],
        encrypted_key: Option<Box<MetadataEntry>>,
    },
    AesCcmEncryptedKey {
        nonce_timestamp: u64,
        nonce_counter: u32,
        nonce: [u8; 12],
        encrypted_data: Vec<u8>,
    },
    OffsetAndSize {
        offset: u64,
        size: u64,
    },
    UnicodeString {
        text: String,
    },
    /// Known value type whose payload is not interpreted.
    Generic {
        value_type: ValueType,
        data: Vec<u8>,
    },
    Unknown {
        code: u16,
        data: Vec<u8>,
    },
}

impl MetadataValue {
    /// Decode the payload of an entry (the bytes following its 8-byte header).
    pub fn from_bytes(value_type: ValueType, buf: &[u8]) -> Result<Self, MetadataError> {
        match value_type {
            ValueType::Key => {
                require(buf, KEY_HEADER_LEN, "key")?;
                Ok(MetadataValue::Key {
                    encryption_type: EncryptionType::from_tag(LittleEndian::read_u32(buf)),
                    key: KeyBytes::new(buf[KEY_HEADER_LEN..].to_vec()),
                })
            }
            ValueType::VolumeMasterKey => {
                require(buf, VMK_HEADER_LEN, "volume master key")?;
                let mut guid = [0u8; 16];
                guid.copy_from_slice(&buf[0..16]);
                let last_modification_time = LittleEndian::read_u64(&buf[16..24]);
                // buf[24..26] is undocumented
                let protection_type = KeyProtectionType::from(LittleEndian::read_u16(&buf[26..28]));
                let properties = read_metadata_entries(&buf[VMK_HEADER_LEN..])?;
                Ok(MetadataValue::VolumeMasterKey {
                    guid,
                    last_modification_time,
                    protection_type,
                    properties,
                })
            }
            ValueType::StretchKey => {
                require(buf, STRETCH_KEY_HEADER_LEN, "stretch key")?;
                let encryption_type = EncryptionType::from_tag(LittleEndian::read_u32(buf));
                let mut salt = [0u8; 16];
                salt.copy_from_slice(&buf[4..20]);
                let rest = &buf[STRETCH_KEY_HEADER_LEN..];
                let encrypted_key = if rest.len() >= ENTRY_HEADER_LEN {
                    match MetadataEntry::from_bytes(rest) {
                        Ok(entry) => Some(Box::new(entry)),
                        Err(e) => {
                            warn!("Ignoring undecodable entry inside stretch key: {}", e);
                            None
                        }
                    }
                } else {
                    None
                };
                Ok(MetadataValue::StretchKey {
                    encryption_type,
                    salt,
                    encrypted_key,
                })
            }
            ValueType::AesCcmEncryptedKey => {
                require(buf, AES_CCM_HEADER_LEN, "AES-CCM encrypted key")?;
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&buf[..AES_CCM_HEADER_LEN]);
                Ok(MetadataValue::AesCcmEncryptedKey {
                    nonce_timestamp: LittleEndian::read_u64(&buf[0..8]),
                    nonce_counter: LittleEndian::read_u32(&buf[8..12]),
                    nonce,
                    encrypted_data: buf[AES_CCM_HEADER_LEN..].to_vec(),
                })
            }
            ValueType::OffsetAndSize => {
                require(buf, OFFSET_AND_SIZE_LEN, "offset and size")?;
                Ok(MetadataValue::OffsetAndSize {
                    offset: LittleEndian::read_u64(&buf[0..8]),
                    size: LittleEndian::read_u64(&buf[8..16]),
                })
            }
            ValueType::UnicodeString => Ok(MetadataValue::UnicodeString {
                text: utf16le_to_string(buf),
            }),
            ValueType::Unknown(code) => Ok(MetadataValue::Unknown {
                code,
                data: buf.to_vec(),
            }),
            other => Ok(MetadataValue::Generic {
                value_type: other,
                data: buf.to_vec(),
            }),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            MetadataValue::Key { .. } => ValueType::Key,
            MetadataValue::VolumeMasterKey { .. } => ValueType::VolumeMasterKey,
            MetadataValue::StretchKey { .. } => ValueType::StretchKey,
            MetadataValue::AesCcmEncryptedKey { .. } => ValueType::AesCcmEncryptedKey,
            MetadataValue::OffsetAndSize { .. } => ValueType::OffsetAndSize,
            MetadataValue::UnicodeString { .. } => ValueType::UnicodeString,
            MetadataValue::Generic { value_type, .. } => *value_type,
            MetadataValue::Unknown { code, .. } => ValueType::Unknown(*code),
        }
    }

    /// One-line human readable summary. Key bytes are never shown.
    pub fn describe(&self) -> String {
        match self {
            MetadataValue::Key {
                encryption_type,
                key,
            } => format!("{} key, {} bytes", encryption_type, key.len()),
            MetadataValue::VolumeMasterKey {
                guid,
                last_modification_time,
                protection_type,
                properties,
            } => format!(
                "{} protected, id {}, modified {}, {} properties",
                protection_type,
                format_guid(guid),
                filetime_to_datetime(*last_modification_time),
                properties.len()
            ),
            MetadataValue::StretchKey {
                encryption_type,
                salt,
                ..
            } => format!("{}, salt {}", encryption_type, to_hex(salt)),
            MetadataValue::AesCcmEncryptedKey {
                nonce_timestamp,
                nonce_counter,
                encrypted_data,
                ..
            } => format!(
                "nonce {} #{}, {} encrypted bytes",
                filetime_to_datetime(*nonce_timestamp),
                nonce_counter,
                encrypted_data.len()
            ),
            MetadataValue::OffsetAndSize { offset, size } => {
                format!("offset 0x{:X}, size 0x{:X}", offset, size)
            }
            MetadataValue::UnicodeString { text } => text.clone(),
            MetadataValue::Generic { data, .. } => format!("{} bytes", data.len()),
            MetadataValue::Unknown { data, .. } => format!("{} bytes", data.len()),
        }
    }
}

/* Entries */

#[derive(Debug, Clone, Serialize)]
pub struct MetadataEntry {
    pub size: u16,
    pub entry_type: EntryType,
    pub value_type: ValueType,
    pub version: u16,
    pub value: MetadataValue,
}

impl MetadataEntry {
    /// Decode one entry from the start of `buf`. Bytes past `size` are ignored.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetadataError> {
        require(buf, ENTRY_HEADER_LEN, "metadata entry header")?;

        let size = LittleEndian::read_u16(&buf[0..2]);
        if (size as usize) < ENTRY_HEADER_LEN || size as usize > buf.len() {
            warn!(
                "Metadata entry size {} is invalid (buffer holds {} bytes)",
                size,
                buf.len()
            );
            return Err(MetadataError::InvalidEntrySize {
                size,
                available: buf.len(),
            });
        }

        let raw_entry_type = LittleEndian::read_u16(&buf[2..4]);
        let entry_type = EntryType::from(raw_entry_type);
        if let EntryType::Unknown(code) = entry_type {
            warn!("Unknown metadata entry type 0x{:04X}", code);
        }

        let raw_value_type = LittleEndian::read_u16(&buf[4..6]);
        let value_type = ValueType::from(raw_value_type);
        if let ValueType::Unknown(code) = value_type {
            warn!("Unknown metadata value type 0x{:04X}", code);
        }

        let version = LittleEndian::read_u16(&buf[6..8]);
        let value = MetadataValue::from_bytes(value_type, &buf[ENTRY_HEADER_LEN..size as usize])?;

        Ok(Self {
            size,
            entry_type,
            value_type,
            version,
            value,
        })
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Decode a flat buffer of back-to-back entries.
pub fn read_metadata_entries(buf: &[u8]) -> Result<Vec<MetadataEntry>, MetadataError> {
    let mut entries = Vec::new();
    let mut cursor = 0usize;
    while cursor < buf.len() {
        let remaining = &buf[cursor..];
        if remaining.len() >= 2 && LittleEndian::read_u16(remaining) == 0 {
            warn!("Zero sized metadata entry at offset {}", cursor);
            return Err(MetadataError::ZeroSizedEntry { offset: cursor });
        }
        let entry = MetadataEntry::from_bytes(remaining)?;
        debug!(
            "Metadata entry at {}: {} - {} ({} bytes)",
            cursor, entry.entry_type, entry.value_type, entry.size
        );
        cursor += entry.size as usize;
        entries.push(entry);
    }
    Ok(entries)
}

/// Entries matching both types, in their original order.
pub fn get_metadata_entries(
    entries: &[MetadataEntry],
    entry_type: EntryType,
    value_type: ValueType,
) -> Vec<&MetadataEntry> {
    entries
        .iter()
        .filter(|e| e.entry_type == entry_type && e.value_type == value_type)
        .collect()
}

/// Values of the given type, whatever their entry type.
pub fn get_metadata_values(entries: &[MetadataEntry], value_type: ValueType) -> Vec<&MetadataValue> {
    entries
        .iter()
        .filter(|e| e.value_type == value_type)
        .map(|e| &e.value)
        .collect()
}

/// Render a list of entries (and nested VMK properties) as a table.
pub fn entries_to_string(entries: &[MetadataEntry]) -> String {
    let mut t = Table::new();
    t.add_row(row!["FVE Metadata Entries"]);
    t.add_row(row![b -> "Entry type", b -> "Value type", b -> "Size", b -> "Details"]);
    for entry in entries {
        add_entry_rows(&mut t, entry, 0);
    }
    t.to_string()
}

fn add_entry_rows(t: &mut Table, entry: &MetadataEntry, depth: usize) {
    let indent = "  ".repeat(depth);
    t.add_row(row![
        format!("{}{}", indent, entry.entry_type),
        entry.value_type,
        entry.size,
        entry.value.describe()
    ]);
    match &entry.value {
        MetadataValue::VolumeMasterKey { properties, .. } => {
            for p in properties {
                add_entry_rows(t, p, depth + 1);
            }
        }
        MetadataValue::StretchKey {
            encrypted_key: Some(inner),
            ..
        } => add_entry_rows(t, inner, depth + 1),
        _ => {}
    }
}

/* Helpers */

pub(crate) fn utf16le_to_string(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    String::from_utf16_lossy(&units)
        .trim_end_matches('\0')
        .to_string()
}

pub(crate) fn filetime_to_datetime(ft: u64) -> String {
    let micros_since_1601 = ft / 10;
    const DELTA_MICROS: i64 = 11_644_473_600_000_000;
    let unix_micros = micros_since_1601 as i64 - DELTA_MICROS;
    let secs = unix_micros.div_euclid(1_000_000);
    let nanos = unix_micros.rem_euclid(1_000_000) * 1_000;
    Utc.timestamp_opt(secs, nanos as u32)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// GUIDs are stored in the mixed-endian Windows layout.
pub fn format_guid(guid: &[u8; 16]) -> String {
    Uuid::from_bytes_le(*guid)
        .hyphenated()
        .to_string()
        .to_uppercase()
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
