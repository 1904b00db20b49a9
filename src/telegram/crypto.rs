//! AES primitives for the telegram security layers: CTR for the extended
//! link layer, CBC (with and without IV) for the transport layer, CMAC for
//! message authentication and the mode 7 key derivation.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit, StreamCipher};
use aes::Aes128;
use cmac::{Cmac, Mac};
use log::debug;

use crate::utils::bin2hex;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const KEY_SIZE: usize = 16;

/// ELL AES-128-CTR keystream. IV is mfct(2) ‖ a-field(6) ‖ cc ‖ sn(4) ‖ 0 0 0
/// with the trailing bytes acting as the big endian block counter.
pub fn decrypt_ell_aes_ctr(
    buf: &mut [u8],
    key: &[u8; KEY_SIZE],
    mfct: [u8; 2],
    a_field: [u8; 6],
    cc: u8,
    sn: [u8; 4],
) {
    let mut iv = [0u8; 16];
    iv[0..2].copy_from_slice(&mfct);
    iv[2..8].copy_from_slice(&a_field);
    iv[8] = cc;
    iv[9..13].copy_from_slice(&sn);
    debug!("(ELL) IV {}", bin2hex(&iv));

    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(buf);
}

/// TPL AES-128-CBC decryption in place. `iv` is mfct ‖ a-field ‖ acc×8 for
/// security mode 5 and all zero for mode 7. The buffer length must be a
/// multiple of the block size; callers truncate to num_encr_blocks × 16.
pub fn decrypt_tpl_aes_cbc(buf: &mut [u8], key: &[u8; KEY_SIZE], iv: &[u8; 16]) -> bool {
    if buf.is_empty() || buf.len() % 16 != 0 {
        return false;
    }
    debug!("(TPL) IV {}", bin2hex(iv));
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(buf)
        .is_ok()
}

pub fn mode5_iv(mfct: [u8; 2], a_field: [u8; 6], acc: u8) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..2].copy_from_slice(&mfct);
    iv[2..8].copy_from_slice(&a_field);
    iv[8..16].fill(acc);
    iv
}

/// CMAC-AES128 over `input`, full 16 byte tag.
pub fn aes_cmac(key: &[u8; KEY_SIZE], input: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).expect("cmac accepts 16 byte keys");
    mac.update(input);
    let out = mac.finalize().into_bytes();
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&out);
    tag
}

/// Derivation constants for the mode 7 ephemeral keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationConstant {
    /// 0x00, encryption key from meter
    EncFromMeter,
    /// 0x01, mac key from meter
    MacFromMeter,
}

impl DerivationConstant {
    fn byte(&self) -> u8 {
        match self {
            DerivationConstant::EncFromMeter => 0x00,
            DerivationConstant::MacFromMeter => 0x01,
        }
    }
}

/// KDF variant 1: CMAC under the permanent key over
/// DC ‖ counter(4, LE as received) ‖ id(4) ‖ 0x07 × 7.
pub fn kdf_v1(
    key: &[u8; KEY_SIZE],
    dc: DerivationConstant,
    counter: [u8; 4],
    id: [u8; 4],
) -> [u8; 16] {
    let mut input = Vec::with_capacity(16);
    input.push(dc.byte());
    input.extend_from_slice(&counter);
    input.extend_from_slice(&id);
    input.extend_from_slice(&[0x07; 7]);
    aes_cmac(key, &input)
}

/// Compare a received (truncated) MAC against
/// CMAC(Kmac, MCL ‖ counter ‖ message).
pub fn check_mac(
    mac_key: &[u8; KEY_SIZE],
    mcl: u8,
    counter: [u8; 4],
    message: &[u8],
    received: &[u8],
) -> bool {
    if received.is_empty() {
        return false;
    }
    let mut input = Vec::with_capacity(5 + message.len());
    input.push(mcl);
    input.extend_from_slice(&counter);
    input.extend_from_slice(message);
    let calculated = aes_cmac(mac_key, &input);
    debug!("calculated mac {}", bin2hex(&calculated));
    debug!("received   mac {}", bin2hex(received));
    received.len() <= 16 && calculated[..received.len()] == *received
}

#[cfg(test)]
mod crypto_tests {
    use super::*;

    /* RFC 4493 test vectors pin down the CMAC subkey generation. */
    #[test]
    fn cmac_rfc4493_vectors() {
        let key: [u8; 16] = hex::decode("2b7e151628aed2a6abf7158809cf4f3c")
            .unwrap()
            .try_into()
            .unwrap();

        let tag = aes_cmac(&key, &[]);
        assert_eq!(bin2hex(&tag), "BB1D6929E95937287FA37D129B756746");

        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let tag = aes_cmac(&key, &msg);
        assert_eq!(bin2hex(&tag), "070A16B46B4D4144F79BDD9DD04A287C");
    }

    #[test]
    fn mode5_iv_layout() {
        let iv = mode5_iv([0x93, 0x15], [0x78, 0x56, 0x34, 0x12, 0x33, 0x03], 0x2A);
        assert_eq!(bin2hex(&iv), "93157856341233032A2A2A2A2A2A2A2A");
    }

    #[test]
    fn annex_n_mode5_payload_decrypts() {
        /* OMS Annex N.2.1: two AES blocks under the sample key. */
        let key: [u8; 16] = hex::decode("0102030405060708090A0B0C0D0E0F11")
            .unwrap()
            .try_into()
            .unwrap();
        let mut encrypted = hex::decode(
            "5923C95AAA26D1B2E7493B013EC4A6F6D3529B520EDFF0EA6DEFC99D6D69EBF3",
        )
        .unwrap();
        let iv = mode5_iv([0x93, 0x15], [0x78, 0x56, 0x34, 0x12, 0x33, 0x03], 0x2A);
        assert!(decrypt_tpl_aes_cbc(&mut encrypted, &key, &iv));
        assert_eq!(&encrypted[0..2], &[0x2F, 0x2F]);
    }

    #[test]
    fn truncated_mac_comparison() {
        let key = [0u8; 16];
        let msg = [0x7Au8, 0x01, 0x02];
        let mut input = vec![0x25u8, 0, 0, 0, 0];
        input.extend_from_slice(&msg);
        let full = aes_cmac(&key, &input);
        assert!(check_mac(&key, 0x25, [0, 0, 0, 0], &msg, &full[..8]));
        let mut bad = full;
        bad[0] ^= 1;
        assert!(!check_mac(&key, 0x25, [0, 0, 0, 0], &msg, &bad[..8]));
    }
}
