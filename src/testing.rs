//! Synthetic BitLocker images for the unit tests.
//!
//! Layout of a built volume (512 byte sectors, 128 KiB):
//!
//! | range              | content                                   |
//! |--------------------|-------------------------------------------|
//! | 0x00000..0x00200   | BitLocker volume header                   |
//! | 0x00200..0x02000   | zero (logically served from the relocation) |
//! | 0x02000..0x10000   | encrypted sectors                         |
//! | 0x10000..0x16000   | three metadata copies, 0x2000 apart       |
//! | 0x16000..0x18000   | relocated original volume header          |
//! | 0x18000..0x1C000   | encrypted sectors                         |
//! | 0x1C000..0x20000   | not yet encrypted, stored in the clear    |

use aes::cipher::consts::{U12, U16};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockCipher, BlockEncrypt, BlockSizeUser, KeyInit};
use aes::{Aes128, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockEncryptMut, InnerIvInit};
use ccm::Ccm;
use ccm::aead::Aead;
use sha2::{Digest, Sha256};
use xts_mode::{Xts128, get_tweak_default};

use crate::crypto::{password_hash, recovery_password_hash, stretch_key};
use crate::fve::{BLOCK_HEADER_SIZE, FVE_SIGNATURE, METADATA_HEADER_SIZE};
use crate::metadata::{EncryptionType, format_guid, to_hex};
use crate::sector::{diffuser_a_encrypt, diffuser_b_encrypt, elephant_key_for_tests};

pub(crate) const RECOVERY_PASSWORD: &str =
    "236808-089419-192665-495704-618299-073414-538373-542366";

const SECTOR_SIZE: usize = 512;
const IMAGE_SIZE: usize = 0x20000;
const METADATA_OFFSETS: [u64; 3] = [0x10000, 0x12000, 0x14000];
const METADATA_COPY_SIZE: usize = 0x2000;
const VOLUME_HEADER_OFFSET: u64 = 0x16000;
const VOLUME_HEADER_SIZE: u64 = 0x2000;
const ENCRYPTED_VOLUME_SIZE: u64 = 0x1C000;
const DESCRIPTION: &str = "WORKSTATION C: 16/10/2026";

/* Raw entry encoders */

pub(crate) fn entry_bytes(entry_type: u16, value_type: u16, payload: &[u8]) -> Vec<u8> {
    let size = (8 + payload.len()) as u16;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&entry_type.to_le_bytes());
    out.extend_from_slice(&value_type.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub(crate) fn key_payload(encryption_type: u32, key: &[u8]) -> Vec<u8> {
    let mut out = encryption_type.to_le_bytes().to_vec();
    out.extend_from_slice(key);
    out
}

pub(crate) fn vmk_payload(guid: &[u8; 16], protection_type: u16, properties: &[u8]) -> Vec<u8> {
    let mut out = guid.to_vec();
    out.extend_from_slice(&0x01D9_8A7B_1234_5678u64.to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&protection_type.to_le_bytes());
    out.extend_from_slice(properties);
    out
}

/// AES-CCM seal, reordered to the on-disk `MAC || ciphertext` layout.
pub(crate) fn wrap_key(key: &[u8], nonce: &[u8], plain: &[u8]) -> Vec<u8> {
    let cipher = Ccm::<Aes256, U16, U12>::new_from_slice(key).unwrap();
    let sealed = cipher.encrypt(GenericArray::from_slice(nonce), plain).unwrap();
    let (ciphertext, tag) = sealed.split_at(sealed.len() - 16);
    [tag, ciphertext].concat()
}

fn aes_ccm_entry(entry_type: u16, key: &[u8], nonce: &[u8; 12], plain: &[u8]) -> Vec<u8> {
    let mut payload = nonce.to_vec();
    payload.extend_from_slice(&wrap_key(key, nonce, plain));
    entry_bytes(entry_type, 0x0005, &payload)
}

pub(crate) fn from_hex(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

fn encryption_code(encryption_type: EncryptionType) -> u32 {
    match encryption_type {
        EncryptionType::AesCbc128Diffuser => 0x8000,
        EncryptionType::AesCbc256Diffuser => 0x8001,
        EncryptionType::AesCbc128 => 0x8002,
        EncryptionType::AesCbc256 => 0x8003,
        EncryptionType::AesXts128 => 0x8004,
        EncryptionType::AesXts256 => 0x8005,
        other => panic!("{} is not a sector encryption method", other),
    }
}

/* Sector encryption, the inverse of the decryption engine */

fn cbc_encrypt<C>(key: &[u8], offset: u64, buf: &mut [u8])
where
    C: BlockCipher + BlockEncrypt + KeyInit + BlockSizeUser<BlockSize = U16>,
{
    let cipher = C::new_from_slice(key).unwrap();
    let mut iv = GenericArray::<u8, U16>::default();
    iv[..8].copy_from_slice(&offset.to_le_bytes());
    cipher.encrypt_block(&mut iv);
    let len = buf.len();
    cbc::Encryptor::<C>::inner_iv_init(cipher, &iv)
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .unwrap();
}

fn diffuser_encrypt(tweak_key: &[u8], offset: u64, buf: &mut [u8]) {
    let sector_key = elephant_key_for_tests(tweak_key, offset);
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= sector_key[i % 32];
    }
    let mut words: Vec<u32> = buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    diffuser_a_encrypt(&mut words);
    diffuser_b_encrypt(&mut words);
    for (w, chunk) in words.iter().zip(buf.chunks_exact_mut(4)) {
        chunk.copy_from_slice(&w.to_le_bytes());
    }
}

pub(crate) fn encrypt_sector(
    encryption_type: EncryptionType,
    key: &[u8],
    offset: u64,
    plain: &[u8],
) -> Vec<u8> {
    let mut buf = plain.to_vec();
    let tweak = get_tweak_default((offset / plain.len() as u64) as u128);
    match encryption_type {
        EncryptionType::AesCbc128 => cbc_encrypt::<Aes128>(key, offset, &mut buf),
        EncryptionType::AesCbc256 => cbc_encrypt::<Aes256>(key, offset, &mut buf),
        EncryptionType::AesCbc128Diffuser => {
            diffuser_encrypt(&key[16..32], offset, &mut buf);
            cbc_encrypt::<Aes128>(&key[..16], offset, &mut buf);
        }
        EncryptionType::AesCbc256Diffuser => {
            diffuser_encrypt(&key[32..64], offset, &mut buf);
            cbc_encrypt::<Aes256>(&key[..32], offset, &mut buf);
        }
        EncryptionType::AesXts128 => Xts128::new(
            Aes128::new_from_slice(&key[..16]).unwrap(),
            Aes128::new_from_slice(&key[16..32]).unwrap(),
        )
        .encrypt_sector(&mut buf, tweak),
        EncryptionType::AesXts256 => Xts128::new(
            Aes256::new_from_slice(&key[..32]).unwrap(),
            Aes256::new_from_slice(&key[32..64]).unwrap(),
        )
        .encrypt_sector(&mut buf, tweak),
        other => panic!("{} is not a sector encryption method", other),
    }
    buf
}

/* Image builder */

#[derive(Debug, Clone)]
pub(crate) enum Protector {
    ClearKey,
    Password(String),
    RecoveryPassword,
    Tpm,
    TpmAndPin,
}

pub(crate) struct BuiltImage {
    pub bytes: Vec<u8>,
    /// What a correct reader returns at each volume offset. Meaningless
    /// inside the metadata copies.
    pub plaintext: Vec<u8>,
    pub metadata_offsets: [u64; 3],
    pub encrypted_volume_size: u64,
    pub volume_header_offset: u64,
    pub volume_header_size: u64,
    pub encryption_type: EncryptionType,
    pub description: String,
    pub recovery_key_id: String,
}

pub(crate) struct ImageBuilder {
    encryption_type: EncryptionType,
    key_len: usize,
    protectors: Vec<Protector>,
    corrupt_copies: usize,
    volume_header_entry: bool,
    header_encryption: Option<EncryptionType>,
    volume_header_location: Option<(u64, u64)>,
    block_header_relocation: Option<(u64, u32)>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            encryption_type: EncryptionType::AesXts128,
            key_len: 32,
            protectors: vec![Protector::ClearKey],
            corrupt_copies: 0,
            volume_header_entry: true,
            header_encryption: None,
            volume_header_location: None,
            block_header_relocation: None,
        }
    }

    pub fn encryption(mut self, encryption_type: EncryptionType, key_len: usize) -> Self {
        self.encryption_type = encryption_type;
        self.key_len = key_len;
        self
    }

    pub fn protectors(mut self, protectors: Vec<Protector>) -> Self {
        self.protectors = protectors;
        self
    }

    /// Break the block signature of the first `count` metadata copies.
    pub fn corrupt_copies(mut self, count: usize) -> Self {
        self.corrupt_copies = count;
        self
    }

    /// Without the entry, the relocation is taken from the block header.
    pub fn volume_header_entry(mut self, present: bool) -> Self {
        self.volume_header_entry = present;
        self
    }

    /// Encryption method advertised by the metadata header when it differs
    /// from the one stored with the FVEK.
    pub fn header_encryption(mut self, encryption_type: EncryptionType) -> Self {
        self.header_encryption = Some(encryption_type);
        self
    }

    /// Offset and size written to the volume header entry.
    pub fn volume_header_location(mut self, offset: u64, size: u64) -> Self {
        self.volume_header_location = Some((offset, size));
        self
    }

    /// Offset and sector count written to the block headers.
    pub fn block_header_relocation(mut self, offset: u64, sectors: u32) -> Self {
        self.block_header_relocation = Some((offset, sectors));
        self
    }

    pub fn build(&self) -> BuiltImage {
        let fvek: Vec<u8> = (0..self.key_len).map(|i| (i * 3 + 1) as u8).collect();
        let vmk: Vec<u8> = (0..32).map(|i| 0x80 + i as u8).collect();

        let mut plaintext: Vec<u8> = (0..IMAGE_SIZE)
            .map(|i| ((i / SECTOR_SIZE) as u8) ^ (i as u8).wrapping_mul(31))
            .collect();
        let (head, rest) = plaintext.split_at_mut(VOLUME_HEADER_OFFSET as usize);
        rest[..VOLUME_HEADER_SIZE as usize].copy_from_slice(&head[..VOLUME_HEADER_SIZE as usize]);

        let mut bytes = vec![0u8; IMAGE_SIZE];
        for offset in (VOLUME_HEADER_SIZE as usize..IMAGE_SIZE).step_by(SECTOR_SIZE) {
            let sector = &plaintext[offset..offset + SECTOR_SIZE];
            let stored = if offset as u64 >= ENCRYPTED_VOLUME_SIZE {
                sector.to_vec()
            } else {
                encrypt_sector(self.encryption_type, &fvek, offset as u64, sector)
            };
            bytes[offset..offset + SECTOR_SIZE].copy_from_slice(&stored);
        }
        bytes[..SECTOR_SIZE].copy_from_slice(&volume_header());

        let (entries, recovery_key_id) = self.entries(&vmk, &fvek);
        for (copy, offset) in METADATA_OFFSETS.iter().enumerate() {
            let mut block = self.metadata_copy(&entries);
            if copy < self.corrupt_copies {
                block[..8].copy_from_slice(&[0u8; 8]);
            }
            let at = *offset as usize;
            bytes[at..at + block.len()].copy_from_slice(&block);
        }

        BuiltImage {
            bytes,
            plaintext,
            metadata_offsets: METADATA_OFFSETS,
            encrypted_volume_size: ENCRYPTED_VOLUME_SIZE,
            volume_header_offset: VOLUME_HEADER_OFFSET,
            volume_header_size: VOLUME_HEADER_SIZE,
            encryption_type: self.encryption_type,
            description: DESCRIPTION.to_string(),
            recovery_key_id,
        }
    }

    fn entries(&self, vmk: &[u8], fvek: &[u8]) -> (Vec<u8>, String) {
        let vmk_key_entry = entry_bytes(0x0000, 0x0001, &key_payload(0x2003, vmk));
        let mut recovery_key_id = String::new();
        let mut out = Vec::new();

        for (i, protector) in self.protectors.iter().enumerate() {
            let mut guid = [0u8; 16];
            for (j, b) in guid.iter_mut().enumerate() {
                *b = (0x10 * (i as u8 + 1)).wrapping_add(j as u8);
            }
            let nonce = [0x40 + i as u8; 12];

            let (protection_type, properties) = match protector {
                Protector::ClearKey => {
                    let clear_key = [0x33u8; 32];
                    let mut p = entry_bytes(0x0000, 0x0001, &key_payload(0x2003, &clear_key));
                    p.extend(aes_ccm_entry(0x0000, &clear_key, &nonce, &vmk_key_entry));
                    (0x0000, p)
                }
                Protector::Password(password) => {
                    let salt = [0x5Au8; 16];
                    let key = stretch_key(&password_hash(password), &salt);
                    (0x2000, stretched_properties(&salt, &key[..], &nonce, &vmk_key_entry))
                }
                Protector::RecoveryPassword => {
                    recovery_key_id = format_guid(&guid);
                    let salt = [0xC3u8; 16];
                    let hash = recovery_password_hash(RECOVERY_PASSWORD).unwrap();
                    let key = stretch_key(&hash, &salt);
                    (0x0800, stretched_properties(&salt, &key[..], &nonce, &vmk_key_entry))
                }
                Protector::Tpm => (0x0100, entry_bytes(0x0000, 0x0006, &[0xEE; 48])),
                Protector::TpmAndPin => (0x0500, entry_bytes(0x0000, 0x0006, &[0xDD; 48])),
            };
            out.extend(entry_bytes(
                0x0002,
                0x0008,
                &vmk_payload(&guid, protection_type, &properties),
            ));
        }

        let fvek_entry = entry_bytes(
            0x0000,
            0x0001,
            &key_payload(encryption_code(self.encryption_type), fvek),
        );
        out.extend(aes_ccm_entry(0x0003, vmk, &[0x77; 12], &fvek_entry));

        if self.volume_header_entry {
            let (offset, size) = self
                .volume_header_location
                .unwrap_or((VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE));
            let mut payload = offset.to_le_bytes().to_vec();
            payload.extend_from_slice(&size.to_le_bytes());
            out.extend(entry_bytes(0x000F, 0x000F, &payload));
        }

        let description: Vec<u8> = DESCRIPTION
            .encode_utf16()
            .chain(Some(0))
            .flat_map(|u| u.to_le_bytes())
            .collect();
        out.extend(entry_bytes(0x0007, 0x0002, &description));

        (out, recovery_key_id)
    }

    fn metadata_copy(&self, entries: &[u8]) -> Vec<u8> {
        let mut block = Vec::with_capacity(METADATA_COPY_SIZE);
        let (relocation_offset, relocation_sectors) = self.block_header_relocation.unwrap_or((
            VOLUME_HEADER_OFFSET,
            (VOLUME_HEADER_SIZE as usize / SECTOR_SIZE) as u32,
        ));
        let header_encryption = self.header_encryption.unwrap_or(self.encryption_type);

        block.extend_from_slice(&FVE_SIGNATURE);
        block.extend_from_slice(&(BLOCK_HEADER_SIZE as u16).to_le_bytes());
        block.extend_from_slice(&2u16.to_le_bytes());
        block.extend_from_slice(&[0u8; 4]);
        block.extend_from_slice(&ENCRYPTED_VOLUME_SIZE.to_le_bytes());
        block.extend_from_slice(&0u32.to_le_bytes());
        block.extend_from_slice(&relocation_sectors.to_le_bytes());
        for offset in METADATA_OFFSETS {
            block.extend_from_slice(&offset.to_le_bytes());
        }
        block.extend_from_slice(&relocation_offset.to_le_bytes());

        let size = (METADATA_HEADER_SIZE + entries.len()) as u32;
        block.extend_from_slice(&size.to_le_bytes());
        block.extend_from_slice(&1u32.to_le_bytes());
        block.extend_from_slice(&(METADATA_HEADER_SIZE as u32).to_le_bytes());
        block.extend_from_slice(&size.to_le_bytes());
        block.extend_from_slice(&[0xABu8; 16]);
        block.extend_from_slice(&10u32.to_le_bytes());
        block.extend_from_slice(&encryption_code(header_encryption).to_le_bytes());
        block.extend_from_slice(&0x01D9_8A7B_1234_5678u64.to_le_bytes());

        block.extend_from_slice(entries);
        assert!(block.len() <= METADATA_COPY_SIZE, "metadata copy overflows");
        block
    }
}

fn stretched_properties(salt: &[u8; 16], key: &[u8], nonce: &[u8; 12], vmk_key_entry: &[u8]) -> Vec<u8> {
    let mut stretch = 0x1000u32.to_le_bytes().to_vec();
    stretch.extend_from_slice(salt);
    let mut p = entry_bytes(0x0000, 0x0003, &stretch);
    p.extend(aes_ccm_entry(0x0000, key, nonce, vmk_key_entry));
    p
}

fn volume_header() -> [u8; SECTOR_SIZE] {
    let mut h = [0u8; SECTOR_SIZE];
    h[..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
    h[3..11].copy_from_slice(&FVE_SIGNATURE);
    h[0x0B..0x0D].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
    h[0x0D] = 8;
    h[0xA0..0xB0].copy_from_slice(&[0x4Bu8; 16]);
    for (i, offset) in METADATA_OFFSETS.iter().enumerate() {
        h[0xB0 + i * 8..0xB8 + i * 8].copy_from_slice(&offset.to_le_bytes());
    }
    h[0x1FE..].copy_from_slice(&0xAA55u16.to_le_bytes());
    h
}
