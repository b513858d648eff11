//! AES-128 / AES-CMAC primitives used by the LoRaWAN codec and session layer.
//!
//! Grounded in `utils.py` (`aes128_encrypt`/`decrypt`, `aes128_cmac`,
//! `encrypt_ieee802154`, `mic_rfc4493`) and in the crate choice already used
//! by `codyps-lorawan`'s `mac_frame.rs` (`aes` + `cmac`, CMAC via the `Mac`
//! trait). All functions here are total: they never fail on well-formed
//! fixed-size inputs, matching spec §4.1 ("all total, no error paths except
//! invariant violations").

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

/// AES-128 CMAC (RFC 4493) over an arbitrary-length message.
pub fn cmac(key: &[u8; 16], msg: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).expect("16-byte key");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Single-block AES-128 ECB encrypt. `block` must be exactly 16 bytes.
pub fn aes_encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut out = (*block).into();
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Single-block AES-128 ECB decrypt. `block` must be exactly 16 bytes.
pub fn aes_decrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut out = (*block).into();
    cipher.decrypt_block(&mut out);
    out.into()
}

/// ECB encrypt over a buffer that is a multiple of 16 bytes (Join-Accept key derivation).
pub fn aes128_encrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    assert_eq!(data.len() % 16, 0, "ECB input must be a multiple of 16 bytes");
    data.chunks_exact(16)
        .flat_map(|chunk| {
            let block: [u8; 16] = chunk.try_into().unwrap();
            aes_encrypt_block(key, &block)
        })
        .collect()
}

/// ECB decrypt over a buffer that is a multiple of 16 bytes. Used by
/// Join-Accept construction: the PHYPayload on air is the AES *decrypt* of
/// `macpayload||mic` under AppKey (the LoRaWAN spec's own idiom, not a typo).
pub fn aes128_decrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    assert_eq!(data.len() % 16, 0, "ECB input must be a multiple of 16 bytes");
    data.chunks_exact(16)
        .flat_map(|chunk| {
            let block: [u8; 16] = chunk.try_into().unwrap();
            aes_decrypt_block(key, &block)
        })
        .collect()
}

/// Uplink/downlink direction, as used in the S-block and B0 constructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up = 0,
    Down = 1,
}

impl Direction {
    fn byte(self) -> u8 {
        self as u8
    }
}

/// `devaddr` is given MSB-first (4 bytes); the wire/crypto construction wants
/// it reversed. Centralised here so every call site agrees on the reversal.
fn devaddr_reversed(devaddr: &[u8; 4]) -> [u8; 4] {
    [devaddr[3], devaddr[2], devaddr[1], devaddr[0]]
}

/// Build one IEEE 802.15.4-style counter-mode keystream block `A_i`.
fn a_block(direction: Direction, devaddr: &[u8; 4], fcnt: u32, block_index: u8) -> [u8; 16] {
    let mut a = [0u8; 16];
    a[0] = 0x01;
    // bytes 1..5 are 0x00 (frame counter upper bytes, unused for FCnt16)
    a[5] = direction.byte();
    a[6..10].copy_from_slice(&devaddr_reversed(devaddr));
    a[10..14].copy_from_slice(&fcnt.to_le_bytes());
    a[14] = 0x00;
    a[15] = block_index;
    a
}

/// Encrypt (or, identically, decrypt: this is a stream cipher) the FRMPayload
/// using the IEEE 802.15.4-style block counter construction (spec §4.1).
pub fn encrypt_frmpayload(
    key: &[u8; 16],
    data: &[u8],
    direction: Direction,
    devaddr: &[u8; 4],
    fcnt: u32,
) -> Vec<u8> {
    let num_blocks = (data.len() + 15) / 16;
    let mut keystream = Vec::with_capacity(num_blocks * 16);
    for i in 1..=num_blocks.max(0) {
        let a = a_block(direction, devaddr, fcnt, i as u8);
        keystream.extend_from_slice(&aes_encrypt_block(key, &a));
    }
    data.iter()
        .zip(keystream.iter())
        .map(|(p, s)| p ^ s)
        .collect()
}

/// Build the B0 block for the message-integrity CMAC (RFC 4493 construction
/// used by LoRaWAN).
fn b0_block(direction: Direction, devaddr: &[u8; 4], fcnt: u32, msg_len: u8) -> [u8; 16] {
    let mut b0 = [0u8; 16];
    b0[0] = 0x49;
    b0[5] = direction.byte();
    b0[6..10].copy_from_slice(&devaddr_reversed(devaddr));
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[14] = 0x00;
    b0[15] = msg_len;
    b0
}

/// Data-message MIC: CMAC(B0 || msg), truncated to the first 4 bytes.
pub fn mic_data(key: &[u8; 16], msg: &[u8], direction: Direction, devaddr: &[u8; 4], fcnt: u32) -> [u8; 4] {
    let b0 = b0_block(direction, devaddr, fcnt, msg.len() as u8);
    let mut full_msg = Vec::with_capacity(16 + msg.len());
    full_msg.extend_from_slice(&b0);
    full_msg.extend_from_slice(msg);
    let full_mac = cmac(key, &full_msg);
    [full_mac[0], full_mac[1], full_mac[2], full_mac[3]]
}

/// Join-Request / Join-Accept MIC: plain CMAC of `mhdr||macpayload` (or
/// `mhdr||macpayload` before the on-air decrypt, for Join-Accept), truncated
/// to 4 bytes.
pub fn mic_join(key: &[u8; 16], mhdr_macpayload: &[u8]) -> [u8; 4] {
    let full = cmac(key, mhdr_macpayload);
    [full[0], full[1], full[2], full[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 16] {
        hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap().try_into().unwrap()
    }

    fn devaddr() -> [u8; 4] {
        hex::decode("0128299f").unwrap().try_into().unwrap()
    }

    // S1: MIC of a known vector (spec §8).
    #[test]
    fn mic_known_vector() {
        let msg = hex::decode("06ae89845fee3bd65e7a84aae3164c15").unwrap();
        let mic = mic_data(&key(), &msg, Direction::Up, &devaddr(), 0);
        assert_eq!(hex::encode(mic), "96406e42");
    }

    // S2: FRMPayload encrypt known vector (spec §8).
    #[test]
    fn frmpayload_encrypt_known_vector() {
        let plaintext = hex::decode("06ae89845fee3bd65e7a84aae3164c15").unwrap();
        let cipher = encrypt_frmpayload(&key(), &plaintext, Direction::Up, &devaddr(), 10);
        assert_eq!(hex::encode(cipher), "6be7e0fe35d18c494eb6f43b546dce28");
    }

    // Testable property 3: cipher involution.
    #[test]
    fn frmpayload_cipher_is_involution() {
        let plaintext = b"hello lorawan conformance".to_vec();
        let cipher = encrypt_frmpayload(&key(), &plaintext, Direction::Up, &devaddr(), 42);
        let roundtrip = encrypt_frmpayload(&key(), &cipher, Direction::Up, &devaddr(), 42);
        assert_eq!(roundtrip, plaintext);
    }

    #[test]
    fn empty_frmpayload_is_empty() {
        let cipher = encrypt_frmpayload(&key(), &[], Direction::Up, &devaddr(), 0);
        assert!(cipher.is_empty());
    }

    #[test]
    fn multi_block_frmpayload() {
        let plaintext = vec![0xABu8; 40];
        let cipher = encrypt_frmpayload(&key(), &plaintext, Direction::Down, &devaddr(), 1000);
        let roundtrip = encrypt_frmpayload(&key(), &cipher, Direction::Down, &devaddr(), 1000);
        assert_eq!(roundtrip, plaintext);
    }

    #[test]
    fn ecb_roundtrip() {
        let plaintext = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let cipher = aes128_encrypt(&key(), &plaintext);
        let decrypted = aes128_decrypt(&key(), &cipher);
        assert_eq!(decrypted, plaintext);
    }
}
