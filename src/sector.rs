// Sources:
// - https://github.com/libyal/libbde/blob/main/documentation/BitLocker%20Drive%20Encryption%20(BDE)%20format.asciidoc
// - Niels Ferguson, "AES-CBC + Elephant diffuser: A Disk Encryption Algorithm for Windows Vista" (2006)
//
// Per-sector decryption with the FVEK: AES-CBC, AES-CBC + Elephant diffuser
// and AES-XTS.

use aes::cipher::consts::U16;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockCipher, BlockDecrypt, BlockEncrypt, BlockSizeUser, KeyInit};
use aes::{Aes128, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, InnerIvInit};
use log::debug;
use std::sync::Mutex;
use xts_mode::{Xts128, get_tweak_default};
use zeroize::Zeroize;

use crate::error::BitlockerError;
use crate::metadata::EncryptionType;

const DIFFUSER_A_CYCLES: usize = 5;
const DIFFUSER_B_CYCLES: usize = 3;
const DIFFUSER_A_ROTATIONS: [u32; 4] = [9, 0, 13, 0];
const DIFFUSER_B_ROTATIONS: [u32; 4] = [0, 10, 0, 25];

enum SectorCipher {
    Cbc128 {
        fvek: Aes128,
    },
    Cbc256 {
        fvek: Aes256,
    },
    Cbc128Diffuser {
        fvek: Aes128,
        tweak: Aes128,
    },
    Cbc256Diffuser {
        fvek: Aes256,
        tweak: Aes256,
    },
    Xts128(Xts128<Aes128>),
    Xts256(Xts128<Aes256>),
}

/// Cipher contexts plus the buffers reused by every sector.
struct SectorState {
    cipher: SectorCipher,
    encrypted: Vec<u8>,
    words: Vec<u32>,
}

impl Drop for SectorState {
    fn drop(&mut self) {
        self.encrypted.zeroize();
        self.words.zeroize();
    }
}

/// Decrypts whole sectors of a BitLocker volume.
///
/// Safe to share between threads: each call takes the internal lock for the
/// duration of one sector.
pub struct SectorDecryptor {
    encryption_type: EncryptionType,
    sector_size: usize,
    encrypted_volume_size: u64,
    state: Mutex<SectorState>,
}

fn aes_key<C: KeyInit>(key: &[u8]) -> Result<C, BitlockerError> {
    C::new_from_slice(key).map_err(|_| {
        BitlockerError::InvalidKey(format!("cannot key AES with {} bytes", key.len()))
    })
}

impl SectorDecryptor {
    /// Key the engine. `key` is the FVEK material as stored in the metadata:
    /// for the diffuser modes the tweak key follows the FVEK, for XTS the
    /// two halves are key1 and key2.
    pub fn new(
        encryption_type: EncryptionType,
        key: &[u8],
        sector_size: u16,
        encrypted_volume_size: u64,
    ) -> Result<Self, BitlockerError> {
        let sector_size = sector_size as usize;
        if sector_size < 16 || sector_size % 16 != 0 {
            return Err(BitlockerError::General(format!(
                "invalid sector size {}",
                sector_size
            )));
        }

        let cipher = match (encryption_type, key.len()) {
            (EncryptionType::AesCbc128, 16) => SectorCipher::Cbc128 {
                fvek: aes_key(key)?,
            },
            (EncryptionType::AesCbc256, 32) => SectorCipher::Cbc256 {
                fvek: aes_key(key)?,
            },
            (EncryptionType::AesCbc128Diffuser, 32) => SectorCipher::Cbc128Diffuser {
                fvek: aes_key(&key[..16])?,
                tweak: aes_key(&key[16..32])?,
            },
            // 128-bit keys padded to two 32-byte halves
            (EncryptionType::AesCbc128Diffuser, 64) => SectorCipher::Cbc128Diffuser {
                fvek: aes_key(&key[..16])?,
                tweak: aes_key(&key[32..48])?,
            },
            (EncryptionType::AesCbc256Diffuser, 64) => SectorCipher::Cbc256Diffuser {
                fvek: aes_key(&key[..32])?,
                tweak: aes_key(&key[32..64])?,
            },
            (EncryptionType::AesXts128, 32) => {
                SectorCipher::Xts128(Xts128::new(aes_key(&key[..16])?, aes_key(&key[16..32])?))
            }
            (EncryptionType::AesXts256, 64) => {
                SectorCipher::Xts256(Xts128::new(aes_key(&key[..32])?, aes_key(&key[32..64])?))
            }
            (t, len) if t.is_aes_cbc() || t.is_aes_xts() => {
                return Err(BitlockerError::InvalidKey(format!(
                    "{} does not take a {}-bit key",
                    t,
                    len * 8
                )));
            }
            (t, _) => {
                return Err(BitlockerError::General(format!(
                    "{} is not a sector encryption method",
                    t
                )));
            }
        };

        debug!(
            "Sector engine keyed for {} ({} byte sectors, {} encrypted bytes)",
            encryption_type, sector_size, encrypted_volume_size
        );

        Ok(Self {
            encryption_type,
            sector_size,
            encrypted_volume_size,
            state: Mutex::new(SectorState {
                cipher,
                encrypted: vec![0u8; sector_size],
                words: vec![0u32; sector_size / 4],
            }),
        })
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn encrypted_volume_size(&self) -> u64 {
        self.encrypted_volume_size
    }

    /// Decrypt one sector in place. `offset` is the byte offset of the sector
    /// within the volume; sectors at or past the encrypted volume size are
    /// stored in the clear and left untouched.
    pub fn decrypt_sector(&self, offset: u64, data: &mut [u8]) -> Result<(), BitlockerError> {
        if data.len() != self.sector_size {
            return Err(BitlockerError::General(format!(
                "sector buffer is {} bytes, expected {}",
                data.len(),
                self.sector_size
            )));
        }
        if offset >= self.encrypted_volume_size {
            return Ok(());
        }

        let mut guard = self
            .state
            .lock()
            .map_err(|_| BitlockerError::General("sector engine lock poisoned".to_string()))?;
        let SectorState {
            cipher,
            encrypted,
            words,
        } = &mut *guard;

        match cipher {
            SectorCipher::Cbc128 { fvek } => {
                encrypted.copy_from_slice(data);
                cbc_decrypt(fvek, offset, encrypted, data)?;
            }
            SectorCipher::Cbc256 { fvek } => {
                encrypted.copy_from_slice(data);
                cbc_decrypt(fvek, offset, encrypted, data)?;
            }
            SectorCipher::Cbc128Diffuser { fvek, tweak } => {
                encrypted.copy_from_slice(data);
                cbc_decrypt(fvek, offset, encrypted, data)?;
                let sector_key = elephant_sector_key(tweak, offset);
                diffuse(data, words, &sector_key);
            }
            SectorCipher::Cbc256Diffuser { fvek, tweak } => {
                encrypted.copy_from_slice(data);
                cbc_decrypt(fvek, offset, encrypted, data)?;
                let sector_key = elephant_sector_key(tweak, offset);
                diffuse(data, words, &sector_key);
            }
            SectorCipher::Xts128(xts) => {
                xts.decrypt_sector(data, self.xts_tweak(offset));
            }
            SectorCipher::Xts256(xts) => {
                xts.decrypt_sector(data, self.xts_tweak(offset));
            }
        }
        Ok(())
    }

    fn xts_tweak(&self, offset: u64) -> [u8; 16] {
        get_tweak_default((offset / self.sector_size as u64) as u128)
    }
}

/// The IV is the sector offset (LE, first 8 bytes) encrypted with the key.
fn sector_iv<C>(cipher: &C, offset: u64) -> GenericArray<u8, U16>
where
    C: BlockEncrypt + BlockSizeUser<BlockSize = U16>,
{
    let mut iv = GenericArray::<u8, U16>::default();
    iv[..8].copy_from_slice(&offset.to_le_bytes());
    cipher.encrypt_block(&mut iv);
    iv
}

fn cbc_decrypt<C>(
    fvek: &C,
    offset: u64,
    input: &[u8],
    output: &mut [u8],
) -> Result<(), BitlockerError>
where
    C: BlockCipher + BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U16> + Clone,
{
    let iv = sector_iv(fvek, offset);
    cbc::Decryptor::<C>::inner_iv_init(fvek.clone(), &iv)
        .decrypt_padded_b2b_mut::<NoPadding>(input, output)
        .map_err(|e| BitlockerError::General(format!("AES-CBC decryption failed: {}", e)))?;
    Ok(())
}

/// Two tweak-key encryptions of the offset, the second with byte 15 set to 0x80.
fn elephant_sector_key<C>(tweak: &C, offset: u64) -> [u8; 32]
where
    C: BlockEncrypt + BlockSizeUser<BlockSize = U16>,
{
    let mut key = [0u8; 32];
    let mut block = GenericArray::<u8, U16>::default();
    block[..8].copy_from_slice(&offset.to_le_bytes());
    tweak.encrypt_block(&mut block);
    key[..16].copy_from_slice(&block);

    let mut block = GenericArray::<u8, U16>::default();
    block[..8].copy_from_slice(&offset.to_le_bytes());
    block[15] = 0x80;
    tweak.encrypt_block(&mut block);
    key[16..].copy_from_slice(&block);
    key
}

/// Undo the Elephant diffuser on a CBC-decrypted sector.
fn diffuse(data: &mut [u8], words: &mut [u32], sector_key: &[u8; 32]) {
    load_words(data, words);
    diffuser_b_decrypt(words);
    diffuser_a_decrypt(words);
    store_words(words, data);

    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= sector_key[i % sector_key.len()];
    }
}

fn load_words(data: &[u8], words: &mut [u32]) {
    for (w, chunk) in words.iter_mut().zip(data.chunks_exact(4)) {
        *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

fn store_words(words: &[u32], data: &mut [u8]) {
    for (w, chunk) in words.iter().zip(data.chunks_exact_mut(4)) {
        chunk.copy_from_slice(&w.to_le_bytes());
    }
}

fn diffuser_a_decrypt(words: &mut [u32]) {
    let n = words.len();
    for _ in 0..DIFFUSER_A_CYCLES {
        for i in 0..n {
            let mixed = words[(i + n - 2) % n]
                ^ words[(i + n - 5) % n].rotate_left(DIFFUSER_A_ROTATIONS[i % 4]);
            words[i] = words[i].wrapping_add(mixed);
        }
    }
}

fn diffuser_b_decrypt(words: &mut [u32]) {
    let n = words.len();
    for _ in 0..DIFFUSER_B_CYCLES {
        for i in 0..n {
            let mixed =
                words[(i + 2) % n] ^ words[(i + 5) % n].rotate_left(DIFFUSER_B_ROTATIONS[i % 4]);
            words[i] = words[i].wrapping_add(mixed);
        }
    }
}

#[cfg(test)]
pub(crate) fn diffuser_a_encrypt(words: &mut [u32]) {
    let n = words.len();
    for _ in 0..DIFFUSER_A_CYCLES {
        for i in (0..n).rev() {
            let mixed = words[(i + n - 2) % n]
                ^ words[(i + n - 5) % n].rotate_left(DIFFUSER_A_ROTATIONS[i % 4]);
            words[i] = words[i].wrapping_sub(mixed);
        }
    }
}

#[cfg(test)]
pub(crate) fn diffuser_b_encrypt(words: &mut [u32]) {
    let n = words.len();
    for _ in 0..DIFFUSER_B_CYCLES {
        for i in (0..n).rev() {
            let mixed =
                words[(i + 2) % n] ^ words[(i + 5) % n].rotate_left(DIFFUSER_B_ROTATIONS[i % 4]);
            words[i] = words[i].wrapping_sub(mixed);
        }
    }
}

#[cfg(test)]
pub(crate) fn elephant_key_for_tests(tweak_key: &[u8], offset: u64) -> [u8; 32] {
    match tweak_key.len() {
        16 => elephant_sector_key(&Aes128::new_from_slice(tweak_key).unwrap(), offset),
        _ => elephant_sector_key(&Aes256::new_from_slice(tweak_key).unwrap(), offset),
    }
}
