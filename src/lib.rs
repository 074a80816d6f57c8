// Sources:
// - https://github.com/libyal/libbde/blob/main/documentation/BitLocker%20Drive%20Encryption%20(BDE)%20format.asciidoc
// - https://github.com/Aorimn/dislocker

use prettytable::{Table, row};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use zeroize::Zeroizing;

use log::{debug, error, info, warn};

pub mod crypto;
pub mod error;
pub mod fve;
pub mod metadata;
pub mod sector;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{BitlockerError, BitlockerStatus};

use crypto::{password_hash, recovery_password_hash, stretch_key, unwrap_key};
use fve::{
    BLOCK_HEADER_SIZE, FveBlockHeader, FveMetadataHeader, METADATA_HEADER_SIZE, VOLUME_HEADER_SIZE,
    VolumeHeader,
};
use metadata::{
    EncryptionType, EntryType, KeyBytes, KeyProtectionType, MetadataEntry, MetadataValue,
    ValueType, format_guid, get_metadata_entries, get_metadata_values, read_metadata_entries,
};
use sector::SectorDecryptor;

/// Anything bytes can be read from at an absolute offset.
pub trait ImageReader {
    /// Fill `buf` from `offset`. May return fewer bytes at the end of the image.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read + Seek + ?Sized> ImageReader for T {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

fn read_exact_at<R: ImageReader + ?Sized>(
    img: &mut R,
    offset: u64,
    buf: &mut [u8],
    what: &str,
) -> Result<(), BitlockerError> {
    let n = img.read_at(offset, buf)?;
    if n != buf.len() {
        return Err(BitlockerError::General(format!(
            "short read of {} at 0x{:X} ({} of {} bytes)",
            what,
            offset,
            n,
            buf.len()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParserState {
    NotProbed,
    SignatureChecked,
    MetadataLoaded,
    KeysRecovered,
    Ready,
    Failed(BitlockerStatus),
}

/// Protector that released the volume master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnlockMethod {
    ClearKey,
    Password,
    RecoveryPassword,
}

impl fmt::Display for UnlockMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockMethod::ClearKey => f.write_str("Clear Key"),
            UnlockMethod::Password => f.write_str("Password"),
            UnlockMethod::RecoveryPassword => f.write_str("Recovery Password"),
        }
    }
}

/// Password material for one `initialize` call. Everything is wiped on drop.
struct Credentials {
    supplied: bool,
    password_hash: Option<Zeroizing<[u8; 32]>>,
    recovery_password_hash: Option<Zeroizing<[u8; 32]>>,
    // the three metadata copies normally share salts
    stretched: HashMap<(UnlockMethod, [u8; 16]), Zeroizing<[u8; 32]>>,
}

impl Credentials {
    fn new(password: Option<&str>) -> Self {
        // an empty password is the same as none
        let password = password.filter(|p| !p.is_empty());
        let recovery_password_hash = password.and_then(recovery_password_hash);
        if recovery_password_hash.is_some() {
            debug!("Supplied password is a well formed recovery password");
        }
        Self {
            supplied: password.is_some(),
            password_hash: password.map(password_hash),
            recovery_password_hash,
            stretched: HashMap::new(),
        }
    }

    fn stretched_key(
        &mut self,
        method: UnlockMethod,
        salt: &[u8; 16],
    ) -> Result<Zeroizing<[u8; 32]>, BitlockerError> {
        let hash = match method {
            UnlockMethod::Password => self.password_hash.as_ref(),
            UnlockMethod::RecoveryPassword => self.recovery_password_hash.as_ref(),
            UnlockMethod::ClearKey => None,
        };
        let Some(hash) = hash else {
            return Err(
                if method == UnlockMethod::RecoveryPassword && self.supplied {
                    // a password was given, it just is not a recovery password
                    BitlockerError::WrongPassword
                } else {
                    BitlockerError::NeedPassword
                },
            );
        };

        if let Some(key) = self.stretched.get(&(method, *salt)) {
            return Ok(key.clone());
        }
        debug!("Stretching {} with salt {}", method, metadata::to_hex(salt));
        let key = stretch_key(hash, salt);
        self.stretched.insert((method, *salt), key.clone());
        Ok(key)
    }
}

/// Unlocks a BitLocker volume and decrypts its sectors.
///
/// `initialize` runs once and needs exclusive access; afterwards the parser
/// can be shared and `read_and_decrypt_sectors` called concurrently, each
/// caller bringing its own image handle.
pub struct BitlockerParser {
    state: ParserState,
    volume_offset: u64,
    volume_header: Option<VolumeHeader>,
    block_header: Option<FveBlockHeader>,
    metadata_header: Option<FveMetadataHeader>,
    sector_size: u16,
    encryption_type: EncryptionType,
    decryptor: Option<SectorDecryptor>,
    volume_header_offset: u64,
    volume_header_size: u64,
    encrypted_volume_size: u64,
    unlock_method: Option<UnlockMethod>,
    unsupported_protection_types: Vec<KeyProtectionType>,
    recovery_key_guid: Option<[u8; 16]>,
    volume_label: Option<String>,
    entries: Vec<MetadataEntry>,
}

impl Default for BitlockerParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BitlockerParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::NotProbed,
            volume_offset: 0,
            volume_header: None,
            block_header: None,
            metadata_header: None,
            sector_size: 0,
            encryption_type: EncryptionType::Unknown(0),
            decryptor: None,
            volume_header_offset: 0,
            volume_header_size: 0,
            encrypted_volume_size: 0,
            unlock_method: None,
            unsupported_protection_types: Vec::new(),
            recovery_key_guid: None,
            volume_label: None,
            entries: Vec::new(),
        }
    }

    /// Probe the volume starting at `volume_offset` and recover its keys.
    ///
    /// Returns `Err(BitlockerError::NotBitlocker)` if the signature is
    /// missing. Otherwise each metadata copy is tried in turn and, if all of
    /// them fail, the most specific failure is returned.
    pub fn initialize<R: ImageReader + ?Sized>(
        &mut self,
        img: &mut R,
        volume_offset: u64,
        password: Option<&str>,
    ) -> Result<(), BitlockerError> {
        *self = Self::new();
        self.volume_offset = volume_offset;

        let result = self.try_initialize(img, password);
        match &result {
            Ok(()) => {
                self.state = ParserState::Ready;
                info!(
                    "BitLocker volume at 0x{:X} unlocked ({}, {})",
                    volume_offset,
                    self.encryption_type,
                    self.unlock_method
                        .map(|m| m.to_string())
                        .unwrap_or_default()
                );
            }
            Err(BitlockerError::NotBitlocker) => {
                debug!("No BitLocker signature at 0x{:X}", volume_offset);
                self.state = ParserState::Failed(BitlockerStatus::NotBitlocker);
            }
            Err(e) => {
                error!("Could not unlock the BitLocker volume: {}", e);
                self.state = ParserState::Failed(e.status());
            }
        }
        result
    }

    fn try_initialize<R: ImageReader + ?Sized>(
        &mut self,
        img: &mut R,
        password: Option<&str>,
    ) -> Result<(), BitlockerError> {
        let mut raw = [0u8; VOLUME_HEADER_SIZE];
        let n = img.read_at(self.volume_offset, &mut raw)?;
        if n < 3 + fve::FVE_SIGNATURE.len() || raw[3..11] != fve::FVE_SIGNATURE {
            return Err(BitlockerError::NotBitlocker);
        }
        self.state = ParserState::SignatureChecked;
        if n < VOLUME_HEADER_SIZE {
            return Err(BitlockerError::General(format!(
                "volume header truncated to {} bytes",
                n
            )));
        }

        let header = VolumeHeader::from_bytes(&raw)?;
        if !header.sector_size_is_valid() {
            return Err(BitlockerError::General(format!(
                "invalid bytes per sector {}",
                header.bytes_per_sector
            )));
        }
        self.sector_size = header.bytes_per_sector;
        let offsets = header.metadata_offsets;
        debug!(
            "Volume header: {} byte sectors, metadata at {:X?}",
            self.sector_size, offsets
        );
        self.volume_header = Some(header);

        let mut credentials = Credentials::new(password);
        let mut failure: Option<BitlockerError> = None;

        for (copy, relative) in offsets.iter().enumerate() {
            match self.load_metadata_copy(img, *relative, &mut credentials) {
                Ok(()) => {
                    debug!("Metadata copy #{} unlocked the volume", copy + 1);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Metadata copy #{} at 0x{:X} failed: {}",
                        copy + 1,
                        relative,
                        e
                    );
                    failure = BitlockerError::most_specific(failure, e);
                }
            }
        }

        Err(match failure {
            Some(BitlockerError::UnsupportedKeyProtectionType(_)) => {
                BitlockerError::UnsupportedKeyProtectionType(self.unsupported_protection_types_string())
            }
            Some(e) => e,
            None => BitlockerError::General("no metadata copy available".to_string()),
        })
    }

    fn load_metadata_copy<R: ImageReader + ?Sized>(
        &mut self,
        img: &mut R,
        relative_offset: u64,
        credentials: &mut Credentials,
    ) -> Result<(), BitlockerError> {
        self.entries.clear();
        self.decryptor = None;

        let block_offset = self
            .volume_offset
            .checked_add(relative_offset)
            .ok_or_else(|| BitlockerError::General("metadata offset overflows".to_string()))?;

        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        read_exact_at(img, block_offset, &mut raw, "FVE metadata block header")?;
        let block_header = FveBlockHeader::from_bytes(&raw)?;
        if !block_header.signature_is_valid() {
            return Err(BitlockerError::General(
                "FVE metadata block signature mismatch".to_string(),
            ));
        }
        if block_header.version != FveBlockHeader::SUPPORTED_VERSION {
            return Err(BitlockerError::General(format!(
                "unsupported FVE metadata block version {}",
                block_header.version
            )));
        }

        let header_offset = block_offset + BLOCK_HEADER_SIZE as u64;
        let mut raw = [0u8; METADATA_HEADER_SIZE];
        read_exact_at(img, header_offset, &mut raw, "FVE metadata header")?;
        let metadata_header = FveMetadataHeader::from_bytes(&raw)?;
        let entries_size = metadata_header.entries_size().ok_or_else(|| {
            BitlockerError::General(format!("invalid metadata size {}", metadata_header.size))
        })?;
        let encryption_type = metadata_header.encryption_type();
        if let EncryptionType::Unknown(code) = encryption_type {
            return Err(BitlockerError::General(format!(
                "unknown encryption method 0x{:04X}",
                code
            )));
        }

        let mut raw = Zeroizing::new(vec![0u8; entries_size]);
        read_exact_at(
            img,
            header_offset + METADATA_HEADER_SIZE as u64,
            &mut raw,
            "FVE metadata entries",
        )?;
        let entries = read_metadata_entries(&raw)?;
        debug!("Decoded {} metadata entries", entries.len());

        self.volume_label =
            get_metadata_entries(&entries, EntryType::Description, ValueType::UnicodeString)
                .into_iter()
                .find_map(|e| match &e.value {
                    MetadataValue::UnicodeString { text } => Some(text.clone()),
                    _ => None,
                });
        self.block_header = Some(block_header);
        self.metadata_header = Some(metadata_header);
        self.state = ParserState::MetadataLoaded;

        let unlocked = self.unlock_with_entries(&entries, encryption_type, credentials);
        self.entries = entries;
        self.decryptor = Some(unlocked?);
        Ok(())
    }

    fn unlock_with_entries(
        &mut self,
        entries: &[MetadataEntry],
        encryption_type: EncryptionType,
        credentials: &mut Credentials,
    ) -> Result<SectorDecryptor, BitlockerError> {
        let vmk = self.recover_vmk(entries, credentials)?;
        let (fvek_type, fvek) = recover_fvek(entries, &vmk)?;
        self.state = ParserState::KeysRecovered;

        let block_header = self
            .block_header
            .as_ref()
            .ok_or_else(|| BitlockerError::General("block header not loaded".to_string()))?;
        let (offset, size) = volume_header_location(entries, block_header, self.sector_size)?;
        let encrypted_volume_size = block_header.encrypted_volume_size;

        let decryptor = SectorDecryptor::new(
            encryption_type,
            fvek.as_slice(),
            self.sector_size,
            encrypted_volume_size,
        )
        .or_else(|e| {
            if fvek_type != encryption_type {
                warn!(
                    "Cannot use {} from the metadata header ({}), trying the key's own {}",
                    encryption_type, e, fvek_type
                );
                SectorDecryptor::new(fvek_type, fvek.as_slice(), self.sector_size, encrypted_volume_size)
            } else {
                Err(e)
            }
        })?;

        self.encryption_type = decryptor.encryption_type();
        self.volume_header_offset = offset;
        self.volume_header_size = size;
        self.encrypted_volume_size = encrypted_volume_size;
        debug!(
            "Volume header relocated to 0x{:X} ({} bytes), {} bytes encrypted",
            offset, size, encrypted_volume_size
        );
        Ok(decryptor)
    }

    fn recover_vmk(
        &mut self,
        entries: &[MetadataEntry],
        credentials: &mut Credentials,
    ) -> Result<KeyBytes, BitlockerError> {
        let vmks = get_metadata_entries(entries, EntryType::VolumeMasterKey, ValueType::VolumeMasterKey);
        if vmks.is_empty() {
            return Err(BitlockerError::General(
                "no volume master key in metadata".to_string(),
            ));
        }

        let mut failure: Option<BitlockerError> = None;
        for entry in vmks {
            let MetadataValue::VolumeMasterKey {
                guid,
                protection_type,
                properties,
                ..
            } = &entry.value
            else {
                continue;
            };
            debug!(
                "Volume master key {} protected by {}",
                format_guid(guid),
                protection_type
            );

            let attempt = match protection_type {
                KeyProtectionType::ClearKey => {
                    clear_key_vmk(properties).map(|key| (key, UnlockMethod::ClearKey))
                }
                KeyProtectionType::Password => {
                    password_vmk(properties, credentials, UnlockMethod::Password)
                        .map(|key| (key, UnlockMethod::Password))
                }
                KeyProtectionType::RecoveryPassword => {
                    self.recovery_key_guid = Some(*guid);
                    password_vmk(properties, credentials, UnlockMethod::RecoveryPassword)
                        .map(|key| (key, UnlockMethod::RecoveryPassword))
                }
                other => {
                    if !self.unsupported_protection_types.contains(other) {
                        self.unsupported_protection_types.push(*other);
                    }
                    Err(BitlockerError::UnsupportedKeyProtectionType(other.to_string()))
                }
            };

            match attempt {
                Ok((key, method)) => {
                    info!(
                        "Volume master key {} unlocked with {}",
                        format_guid(guid),
                        method
                    );
                    self.unlock_method = Some(method);
                    return Ok(key);
                }
                Err(e) => {
                    debug!("Volume master key {}: {}", format_guid(guid), e);
                    failure = BitlockerError::most_specific(failure, e);
                }
            }
        }

        Err(failure.unwrap_or_else(|| {
            BitlockerError::General("no usable volume master key".to_string())
        }))
    }

    /// Unsupported protectors joined for display, e.g. "TPM, TPM and PIN".
    pub fn unsupported_protection_types_string(&self) -> String {
        self.unsupported_protection_types
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Read whole sectors at the volume relative `offset` and decrypt them.
    ///
    /// `offset` and `buf.len()` must be multiples of the sector size. Returns
    /// the number of bytes decrypted, which is short only at the end of the
    /// image and always a whole number of sectors.
    pub fn read_and_decrypt_sectors<R: ImageReader + ?Sized>(
        &self,
        img: &mut R,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, BitlockerError> {
        let decryptor = self
            .decryptor
            .as_ref()
            .ok_or_else(|| BitlockerError::General("the volume is not unlocked".to_string()))?;
        let sector_size = self.sector_size as u64;
        if offset % sector_size != 0 || buf.len() as u64 % sector_size != 0 {
            return Err(BitlockerError::General(format!(
                "read of {} bytes at 0x{:X} is not aligned to {} byte sectors",
                buf.len(),
                offset,
                sector_size
            )));
        }

        let mut done = 0usize;
        if offset < self.volume_header_size {
            let relocated = (self.volume_header_size - offset).min(buf.len() as u64) as usize;
            let physical = self.volume_header_offset.checked_add(offset).ok_or_else(|| {
                BitlockerError::General(format!("relocated offset of 0x{:X} overflows", offset))
            })?;
            done = self.read_region(img, decryptor, physical, &mut buf[..relocated])?;
            if done < relocated {
                return Ok(done);
            }
        }
        if done < buf.len() {
            done += self.read_region(img, decryptor, offset + done as u64, &mut buf[done..])?;
        }
        Ok(done)
    }

    fn read_region<R: ImageReader + ?Sized>(
        &self,
        img: &mut R,
        decryptor: &SectorDecryptor,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, BitlockerError> {
        let sector_size = self.sector_size as usize;
        let start = self
            .volume_offset
            .checked_add(offset)
            .filter(|start| start.checked_add(buf.len() as u64).is_some())
            .ok_or_else(|| {
                BitlockerError::General(format!(
                    "read of {} bytes at 0x{:X} overflows",
                    buf.len(),
                    offset
                ))
            })?;
        let n = img.read_at(start, buf)?;
        let whole = n - n % sector_size;
        if whole < buf.len() {
            debug!(
                "Short read at 0x{:X}: {} of {} bytes",
                offset,
                n,
                buf.len()
            );
        }
        for (i, sector) in buf[..whole].chunks_exact_mut(sector_size).enumerate() {
            decryptor.decrypt_sector(offset + (i * sector_size) as u64, sector)?;
        }
        Ok(whole)
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn is_unlocked(&self) -> bool {
        self.state == ParserState::Ready
    }

    pub fn volume_offset(&self) -> u64 {
        self.volume_offset
    }

    pub fn sector_size(&self) -> u16 {
        self.sector_size
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    pub fn unlock_method(&self) -> Option<UnlockMethod> {
        self.unlock_method
    }

    /// One line summary of the encryption and how the volume was unlocked.
    pub fn description(&self) -> String {
        let mut out = String::from("BitLocker");
        if self.encryption_type.is_aes_cbc() || self.encryption_type.is_aes_xts() {
            out.push_str(&format!(" {} encryption", self.encryption_type));
        }
        match self.unlock_method {
            Some(method) => {
                out.push_str(&format!(", unlocked using {}", method.to_string().to_lowercase()))
            }
            None => out.push_str(", locked"),
        }
        out
    }

    /// Text of the metadata description entry (computer name, drive and date).
    pub fn volume_label(&self) -> Option<&str> {
        self.volume_label.as_deref()
    }

    /// Protectors seen while unlocking that this crate cannot use.
    pub fn unsupported_protection_types(&self) -> &[KeyProtectionType] {
        &self.unsupported_protection_types
    }

    /// Identifier of the recovery password protector, as shown by Windows.
    pub fn recovery_key_id(&self) -> Option<String> {
        self.recovery_key_guid.as_ref().map(format_guid)
    }

    pub fn volume_header_offset(&self) -> u64 {
        self.volume_header_offset
    }

    pub fn volume_header_size(&self) -> u64 {
        self.volume_header_size
    }

    pub fn encrypted_volume_size(&self) -> u64 {
        self.encrypted_volume_size
    }

    pub fn volume_header(&self) -> Option<&VolumeHeader> {
        self.volume_header.as_ref()
    }

    pub fn block_header(&self) -> Option<&FveBlockHeader> {
        self.block_header.as_ref()
    }

    pub fn metadata_header(&self) -> Option<&FveMetadataHeader> {
        self.metadata_header.as_ref()
    }

    pub fn metadata_entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    pub fn to_json(&self) -> Value {
        json!({
            "state": self.state,
            "volume_offset": self.volume_offset,
            "sector_size": self.sector_size,
            "encryption_type": self.encryption_type.to_string(),
            "unlock_method": self.unlock_method,
            "description": self.description(),
            "volume_label": self.volume_label,
            "recovery_key_id": self.recovery_key_id(),
            "unsupported_protection_types": self
                .unsupported_protection_types
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>(),
            "volume_header_offset": self.volume_header_offset,
            "volume_header_size": self.volume_header_size,
            "encrypted_volume_size": self.encrypted_volume_size,
        })
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(row!["BitLocker Volume"]);
        t.add_row(row![b -> "State", format!("{:?}", self.state)]);
        t.add_row(row![b -> "Description", self.description()]);
        t.add_row(row![b -> "Volume label", self.volume_label().unwrap_or("N/A")]);
        t.add_row(row![b -> "Encryption method", self.encryption_type]);
        t.add_row(row![
            b -> "Unlocked with",
            self.unlock_method.map(|m| m.to_string()).unwrap_or_else(|| "N/A".to_string())
        ]);
        t.add_row(row![
            b -> "Recovery key identifier",
            self.recovery_key_id().unwrap_or_else(|| "N/A".to_string())
        ]);
        if !self.unsupported_protection_types.is_empty() {
            t.add_row(row![b -> "Unsupported protectors", self.unsupported_protection_types_string()]);
        }
        t.add_row(row![b -> "Sector size", self.sector_size]);
        t.add_row(row![
            b -> "Relocated volume header",
            format!("0x{:X} ({} bytes)", self.volume_header_offset, self.volume_header_size)
        ]);
        t.add_row(row![b -> "Encrypted volume size", format!("0x{:X}", self.encrypted_volume_size)]);
        t.to_string()
    }
}

fn unwrap_to_key(
    key: &[u8],
    nonce: &[u8; 12],
    encrypted: &[u8],
) -> Result<(EncryptionType, KeyBytes), BitlockerError> {
    let entry = unwrap_key(key, nonce, encrypted)?;
    match entry.value {
        MetadataValue::Key {
            encryption_type,
            key,
        } => Ok((encryption_type, key)),
        other => Err(BitlockerError::UnexpectedValueType {
            expected: ValueType::Key,
            found: other.value_type(),
        }),
    }
}

fn aes_ccm_key(properties: &[MetadataEntry]) -> Result<(&[u8; 12], &[u8]), BitlockerError> {
    match get_metadata_values(properties, ValueType::AesCcmEncryptedKey)
        .into_iter()
        .next()
    {
        Some(MetadataValue::AesCcmEncryptedKey {
            nonce,
            encrypted_data,
            ..
        }) => Ok((nonce, encrypted_data.as_slice())),
        _ => Err(BitlockerError::General(
            "volume master key has no AES-CCM encrypted key".to_string(),
        )),
    }
}

fn clear_key_vmk(properties: &[MetadataEntry]) -> Result<KeyBytes, BitlockerError> {
    let clear_key = match get_metadata_values(properties, ValueType::Key).into_iter().next() {
        Some(MetadataValue::Key { key, .. }) => key,
        _ => {
            return Err(BitlockerError::General(
                "clear key volume master key has no key".to_string(),
            ));
        }
    };
    let (nonce, encrypted) = aes_ccm_key(properties)?;
    unwrap_to_key(clear_key.as_slice(), nonce, encrypted).map(|(_, key)| key)
}

fn password_vmk(
    properties: &[MetadataEntry],
    credentials: &mut Credentials,
    method: UnlockMethod,
) -> Result<KeyBytes, BitlockerError> {
    let salt = match get_metadata_values(properties, ValueType::StretchKey)
        .into_iter()
        .next()
    {
        Some(MetadataValue::StretchKey { salt, .. }) => salt,
        _ => {
            return Err(BitlockerError::General(
                "volume master key has no stretch key".to_string(),
            ));
        }
    };
    let key = credentials.stretched_key(method, salt)?;
    let (nonce, encrypted) = aes_ccm_key(properties)?;
    unwrap_to_key(&key[..], nonce, encrypted).map(|(_, key)| key)
}

fn recover_fvek(
    entries: &[MetadataEntry],
    vmk: &KeyBytes,
) -> Result<(EncryptionType, KeyBytes), BitlockerError> {
    let fveks = get_metadata_entries(
        entries,
        EntryType::FullVolumeEncryptionKey,
        ValueType::AesCcmEncryptedKey,
    );
    if fveks.len() > 1 {
        warn!("{} FVEK entries found, using the first", fveks.len());
    }
    match fveks.first().map(|e| &e.value) {
        Some(MetadataValue::AesCcmEncryptedKey {
            nonce,
            encrypted_data,
            ..
        }) => {
            let (encryption_type, key) = unwrap_to_key(vmk.as_slice(), nonce, encrypted_data)?;
            debug!("FVEK recovered ({}, {} bytes)", encryption_type, key.len());
            Ok((encryption_type, key))
        }
        _ => Err(BitlockerError::General(
            "no full volume encryption key in metadata".to_string(),
        )),
    }
}

/// Where the original first sectors of the volume were moved to.
fn volume_header_location(
    entries: &[MetadataEntry],
    block_header: &FveBlockHeader,
    sector_size: u16,
) -> Result<(u64, u64), BitlockerError> {
    let from_entry =
        get_metadata_entries(entries, EntryType::VolumeHeaderBlock, ValueType::OffsetAndSize)
            .into_iter()
            .find_map(|e| match e.value {
                MetadataValue::OffsetAndSize { offset, size } => Some((offset, size)),
                _ => None,
            });
    let (offset, size) = from_entry.unwrap_or((
        block_header.volume_header_offset,
        block_header.volume_header_sectors as u64 * sector_size as u64,
    ));

    if offset == 0 || size == 0 {
        return Err(BitlockerError::General(
            "volume header location is missing".to_string(),
        ));
    }
    if offset.checked_add(size).is_none() {
        return Err(BitlockerError::General(format!(
            "volume header location 0x{:X} ({} bytes) overflows",
            offset, size
        )));
    }
    if size % sector_size as u64 != 0 {
        return Err(BitlockerError::General(format!(
            "volume header size {} is not a whole number of sectors",
            size
        )));
    }
    Ok((offset, size))
}

/// Plaintext view of a BitLocker volume.
///
/// Wraps the body holding the encrypted volume and serves decrypted bytes at
/// any offset and length, so it can be handed to a filesystem parser.
pub struct BitlockerVolume<T: Read + Seek> {
    body: T,
    parser: BitlockerParser,
    size: u64,
    position: u64,
    sector: Vec<u8>,
    cached_sector: Option<u64>,
}

impl<T: Read + Seek> BitlockerVolume<T> {
    /// Unlock the volume at `volume_offset` of `body`. Without an explicit
    /// `size` the volume extends to the end of the body.
    pub fn open(
        mut body: T,
        volume_offset: u64,
        size: Option<u64>,
        password: Option<&str>,
    ) -> Result<Self, BitlockerError> {
        let mut parser = BitlockerParser::new();
        parser.initialize(&mut body, volume_offset, password)?;
        Self::new(body, parser, size)
    }

    /// Wrap a parser that already unlocked the volume held by `body`.
    pub fn new(
        mut body: T,
        parser: BitlockerParser,
        size: Option<u64>,
    ) -> Result<Self, BitlockerError> {
        if !parser.is_unlocked() {
            return Err(BitlockerError::General(
                "the volume is not unlocked".to_string(),
            ));
        }
        let size = match size {
            Some(size) => size,
            None => body
                .seek(SeekFrom::End(0))?
                .saturating_sub(parser.volume_offset()),
        };
        let sector_size = parser.sector_size() as usize;

        Ok(Self {
            body,
            parser,
            size,
            position: 0,
            sector: vec![0u8; sector_size],
            cached_sector: None,
        })
    }

    pub fn parser(&self) -> &BitlockerParser {
        &self.parser
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn into_inner(self) -> T {
        self.body
    }

    fn load_sector(&mut self, index: u64) -> io::Result<usize> {
        if self.cached_sector == Some(index) {
            return Ok(self.sector.len());
        }
        self.cached_sector = None;
        let offset = index * self.sector.len() as u64;
        let n = self
            .parser
            .read_and_decrypt_sectors(&mut self.body, offset, &mut self.sector)
            .map_err(io::Error::other)?;
        if n == self.sector.len() {
            self.cached_sector = Some(index);
        }
        Ok(n)
    }
}

impl<T: Read + Seek> Read for BitlockerVolume<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let sector_size = self.sector.len() as u64;
        let wanted = (buf.len() as u64).min(self.size - self.position) as usize;

        let mut done = 0usize;
        while done < wanted {
            let index = self.position / sector_size;
            let within = (self.position % sector_size) as usize;
            if self.load_sector(index)? < self.sector.len() {
                break;
            }
            let n = (self.sector.len() - within).min(wanted - done);
            buf[done..done + n].copy_from_slice(&self.sector[within..within + n]);
            done += n;
            self.position += n as u64;
        }
        Ok(done)
    }
}

impl<T: Read + Seek> Seek for BitlockerVolume<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(o) => o as i128,
            SeekFrom::End(o) => self.size as i128 + o as i128,
            SeekFrom::Current(o) => self.position as i128 + o as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the volume",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}
