// Sources:
// - https://github.com/libyal/libbde/blob/main/documentation/BitLocker%20Drive%20Encryption%20(BDE)%20format.asciidoc
// - RFC 3610 (Counter with CBC-MAC)
//
// Key derivation and AES-CCM key unwrap for VMK / FVEK recovery.

use aes::Aes256;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::BitlockerError;
use crate::metadata::MetadataEntry;

pub const STRETCH_KEY_ROUNDS: u64 = 0x10_0000;

pub const CCM_NONCE_LEN: usize = 12;
pub const CCM_MAC_LEN: usize = 16;

const RECOVERY_PASSWORD_GROUPS: usize = 8;
const RECOVERY_GROUP_DIGITS: usize = 6;

fn sha256_into(data: &[u8], out: &mut [u8; 32]) {
    Sha256::new_with_prefix(data).finalize_into(GenericArray::from_mut_slice(&mut out[..]));
}

/// SHA-256 applied twice over the UTF-16LE encoding of the password.
pub fn password_hash(password: &str) -> Zeroizing<[u8; 32]> {
    let utf16: Zeroizing<Vec<u8>> = Zeroizing::new(
        password
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect(),
    );
    let mut first = Zeroizing::new([0u8; 32]);
    sha256_into(&utf16, &mut first);
    let mut hash = Zeroizing::new([0u8; 32]);
    sha256_into(&first[..], &mut hash);
    hash
}

/// Hash of a 48-digit recovery password (`xxxxxx-xxxxxx-...`, eight groups).
///
/// Each group is a multiple of 11 whose quotient is one little-endian u16 of
/// the 128-bit recovery key. Returns `None` when the string does not have
/// that shape.
pub fn recovery_password_hash(password: &str) -> Option<Zeroizing<[u8; 32]>> {
    let groups: Vec<&str> = password.trim().split('-').collect();
    if groups.len() != RECOVERY_PASSWORD_GROUPS {
        return None;
    }

    let mut key = Zeroizing::new([0u8; 16]);
    for (i, group) in groups.iter().enumerate() {
        if group.len() != RECOVERY_GROUP_DIGITS || !group.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value: u32 = group.parse().ok()?;
        if value % 11 != 0 {
            debug!("Recovery password group {} is not divisible by 11", i + 1);
            return None;
        }
        let quotient = value / 11;
        if quotient > 0xFFFF {
            debug!("Recovery password group {} is out of range", i + 1);
            return None;
        }
        key[i * 2..i * 2 + 2].copy_from_slice(&(quotient as u16).to_le_bytes());
    }

    let mut hash = Zeroizing::new([0u8; 32]);
    sha256_into(&key[..], &mut hash);
    Some(hash)
}

/// Derive the key protecting a password or recovery password VMK.
///
/// The 88-byte state is `last hash (32) | input hash (32) | salt (16) | counter (u64 LE)`.
pub fn stretch_key(hash: &[u8; 32], salt: &[u8; 16]) -> Zeroizing<[u8; 32]> {
    let mut state = Zeroizing::new([0u8; 88]);
    state[32..64].copy_from_slice(hash);
    state[64..80].copy_from_slice(salt);

    for counter in 0..STRETCH_KEY_ROUNDS {
        state[80..88].copy_from_slice(&counter.to_le_bytes());
        let hasher = Sha256::new_with_prefix(&state[..]);
        hasher.finalize_into(GenericArray::from_mut_slice(&mut state[..32]));
    }

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&state[..32]);
    key
}

/// Decrypt and authenticate an AES-CCM wrapped key, then decode the
/// metadata entry it carries.
///
/// `encrypted` holds the encrypted 16-byte MAC followed by the encrypted
/// entry. A MAC mismatch means the unwrapping key was wrong.
pub fn unwrap_key(
    key: &[u8],
    nonce: &[u8; CCM_NONCE_LEN],
    encrypted: &[u8],
) -> Result<MetadataEntry, BitlockerError> {
    if key.len() != 32 {
        return Err(BitlockerError::InvalidKey(format!(
            "AES-CCM unwrap needs a 256-bit key, got {} bits",
            key.len() * 8
        )));
    }
    if encrypted.len() <= CCM_MAC_LEN {
        return Err(BitlockerError::General(format!(
            "AES-CCM encrypted key is too short ({} bytes)",
            encrypted.len()
        )));
    }

    let cipher = Aes256::new_from_slice(key)
        .map_err(|_| BitlockerError::InvalidKey("cannot key AES-256".to_string()))?;

    let mut plain = Zeroizing::new(encrypted.to_vec());
    ctr_apply(&cipher, nonce, &mut plain);

    let mac = Zeroizing::new(cbc_mac(&cipher, nonce, &plain[CCM_MAC_LEN..]));
    if mac[..] != plain[..CCM_MAC_LEN] {
        warn!("AES-CCM message authentication code mismatch");
        return Err(BitlockerError::WrongPassword);
    }

    Ok(MetadataEntry::from_bytes(&plain[CCM_MAC_LEN..])?)
}

/// Counter mode keystream. Block 0 covers the MAC, blocks 1.. the payload.
fn ctr_apply(cipher: &Aes256, nonce: &[u8; CCM_NONCE_LEN], data: &mut [u8]) {
    let mut counter = [0u8; 16];
    counter[0] = (15 - CCM_NONCE_LEN - 1) as u8;
    counter[1..1 + CCM_NONCE_LEN].copy_from_slice(nonce);

    for chunk in data.chunks_mut(16) {
        let mut block = GenericArray::clone_from_slice(&counter);
        cipher.encrypt_block(&mut block);
        for (byte, k) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= k;
        }
        increment_counter(&mut counter);
    }
}

fn increment_counter(counter: &mut [u8; 16]) {
    for byte in counter.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// CBC-MAC over the plaintext payload, last block zero padded.
fn cbc_mac(cipher: &Aes256, nonce: &[u8; CCM_NONCE_LEN], payload: &[u8]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0] = ((14 - CCM_NONCE_LEN) | (((CCM_MAC_LEN - 2) & 0xFE) << 2)) as u8;
    iv[1..1 + CCM_NONCE_LEN].copy_from_slice(nonce);
    let len = payload.len();
    iv[13] = (len >> 16) as u8;
    iv[14] = (len >> 8) as u8;
    iv[15] = len as u8;

    let mut mac = GenericArray::clone_from_slice(&iv);
    cipher.encrypt_block(&mut mac);
    for chunk in payload.chunks(16) {
        for (m, p) in mac.iter_mut().zip(chunk) {
            *m ^= p;
        }
        cipher.encrypt_block(&mut mac);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EncryptionType, EntryType, MetadataValue, ValueType};
    use crate::testing::{entry_bytes, from_hex, key_payload, wrap_key};

    fn seq<const N: usize>(start: u8) -> [u8; N] {
        let mut out = [0u8; N];
        for (i, b) in out.iter_mut().enumerate() {
            *b = start.wrapping_add(i as u8);
        }
        out
    }

    #[test]
    fn password_hash_known_answer() {
        assert_eq!(
            password_hash("password")[..],
            from_hex("752b13ff08bfd1b9ad822eadaeb0bdb056a468711f938323991bd6f2965ee3a0")[..]
        );
    }

    #[test]
    fn recovery_password_all_ones() {
        let hash = recovery_password_hash(
            "000011-000011-000011-000011-000011-000011-000011-000011",
        )
        .expect("valid recovery password");
        assert_eq!(
            hash[..],
            from_hex("278abfb53cf32e306305c34f6ad5469b82453fa58f29fd339bf1615e7ffb4331")[..]
        );
    }

    #[test]
    fn recovery_password_upper_bound() {
        let hash = recovery_password_hash(
            "000000-000011-000022-000033-000044-000055-000066-720885",
        )
        .expect("0xFFFF * 11 is the largest valid group");
        assert_eq!(
            hash[..],
            from_hex("06e525132aaa28b8170b2c146ca779fc74c4028690c1ee2ffd9326a32b933c48")[..]
        );
    }

    #[test]
    fn recovery_password_rejections() {
        // not divisible by 11
        assert!(
            recovery_password_hash("000012-000011-000011-000011-000011-000011-000011-000011")
                .is_none()
        );
        // 720896 / 11 = 0x10000
        assert!(
            recovery_password_hash("720896-000011-000011-000011-000011-000011-000011-000011")
                .is_none()
        );
        assert!(recovery_password_hash("000011-000011-000011").is_none());
        assert!(
            recovery_password_hash("00011-000011-000011-000011-000011-000011-000011-0000011")
                .is_none()
        );
        assert!(recovery_password_hash("password").is_none());
        assert!(recovery_password_hash("").is_none());
    }

    #[test]
    fn stretch_key_zero_inputs() {
        let key = stretch_key(&[0u8; 32], &[0u8; 16]);
        assert_eq!(
            key[..],
            from_hex("30ca596088a05e7efcd3aa65d9d7d54deb64bacfcc1f80a2bfeb92e1941fa49d")[..]
        );
    }

    #[test]
    fn stretch_key_password_with_salt() {
        let key = stretch_key(&password_hash("password"), &seq::<16>(0));
        assert_eq!(
            key[..],
            from_hex("2b629fb2fb7b37740a22aa62475a6c1e7106d6ce11cc3a0db33b56bc92f022c0")[..]
        );
    }

    fn sample_key_entry() -> Vec<u8> {
        entry_bytes(0x0000, 0x0001, &key_payload(0x2003, &[0x42; 32]))
    }

    #[test]
    fn unwrap_known_answer() {
        let stored = from_hex(
            "69801f6ade05b90a232a15e2962575d44394425091fce7644978282225cdf093\
             7686f107fcfc3a0abde087c4f895d849acfceba2cc2d8f5208ce41f8",
        );
        let entry = unwrap_key(&seq::<32>(0), &seq::<12>(0xA0), &stored).unwrap();
        assert_eq!(entry.entry_type, EntryType::Property);
        assert_eq!(entry.value_type, ValueType::Key);
        match entry.value {
            MetadataValue::Key {
                encryption_type,
                key,
            } => {
                assert_eq!(encryption_type, EncryptionType::Vmk);
                assert_eq!(key.as_slice(), &[0x42; 32]);
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn unwrap_matches_reference_ccm() {
        let key = seq::<32>(7);
        let nonce = seq::<12>(0x30);
        // 48-byte entry: payload ends on a block boundary
        let plain = entry_bytes(0x0000, 0x0001, &key_payload(0x8005, &[0x24; 36]));
        assert_eq!(plain.len() % 16, 0);
        let entry = unwrap_key(&key, &nonce, &wrap_key(&key, &nonce, &plain)).unwrap();
        assert_eq!(entry.size as usize, plain.len());
        assert!(matches!(
            entry.value,
            MetadataValue::Key { encryption_type: EncryptionType::AesXts256, .. }
        ));
    }

    #[test]
    fn any_flipped_bit_is_a_wrong_password() {
        let key = seq::<32>(0);
        let nonce = seq::<12>(0xA0);
        let stored = wrap_key(&key, &nonce, &sample_key_entry());
        for i in [0, 15, 16, 31, stored.len() - 1] {
            let mut tampered = stored.clone();
            tampered[i] ^= 0x01;
            assert!(matches!(
                unwrap_key(&key, &nonce, &tampered),
                Err(BitlockerError::WrongPassword)
            ));
        }

        let mut wrong_key = key;
        wrong_key[0] ^= 0x80;
        assert!(matches!(
            unwrap_key(&wrong_key, &nonce, &stored),
            Err(BitlockerError::WrongPassword)
        ));
    }

    #[test]
    fn unwrap_rejects_bad_inputs() {
        assert!(matches!(
            unwrap_key(&[0u8; 16], &[0u8; 12], &[0u8; 64]),
            Err(BitlockerError::InvalidKey(_))
        ));
        assert!(unwrap_key(&[0u8; 32], &[0u8; 12], &[0u8; 16]).is_err());
    }
}
