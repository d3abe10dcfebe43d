// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! CCM* transformations (IEEE 802.15.4-2015, Appendix B.4).
//!
//! CCM* prepares two fields, AuthData and PlaintextData/CiphertextData, and
//! runs two AES passes over them with one block of overlap:
//!
//! ```text
//! [ ----- B0 | AuthData ----- | -------- PData/CData -------- ]
//!  cbc-mac: \________________/
//!  ctr:                 \ S0  | S1 S2 ... ____________________/
//! ```
//!
//! The authentication tag T is the final CBC-MAC block; encrypting it with
//! the S0 keystream block yields the MIC. Unlike plain CCM, CCM* also admits
//! an encryption-only mode (security level 4) with no tag at all.
//!
//! Everything here is synchronous and allocation-free; the block cipher is
//! the `aes` crate's AES-128.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use wpan_hal::ErrorCode;

use crate::frame::SecurityLevel;

pub const BLOCK_LEN: usize = 16;
pub const NONCE_LEN: usize = 13;

/// Builds the 13-octet CCM* nonce: extended source address, frame counter
/// and security level, all big endian per the security specification (the
/// wire header carries the counter little endian; the nonce does not).
pub fn ccm_nonce(ext_src: &[u8; 8], frame_counter: u32, level: SecurityLevel) -> [u8; NONCE_LEN] {
    let mut nonce = [0; NONCE_LEN];
    nonce[..8].copy_from_slice(ext_src);
    nonce[8..12].copy_from_slice(&frame_counter.to_be_bytes());
    nonce[12] = level.bits();
    nonce
}

struct CbcMac {
    cipher: Aes128,
    x: [u8; BLOCK_LEN],
    // Bytes buffered into the current block.
    fill: usize,
}

impl CbcMac {
    fn new(cipher: Aes128) -> CbcMac {
        CbcMac {
            cipher,
            x: [0; BLOCK_LEN],
            fill: 0,
        }
    }

    fn update(&mut self, data: &[u8]) {
        for byte in data {
            self.x[self.fill] ^= byte;
            self.fill += 1;
            if self.fill == BLOCK_LEN {
                self.flush();
            }
        }
    }

    /// Zero-pads the current block to a block boundary.
    fn pad(&mut self) {
        if self.fill != 0 {
            self.flush();
        }
    }

    fn flush(&mut self) {
        self.cipher
            .encrypt_block(GenericArray::from_mut_slice(&mut self.x));
        self.fill = 0;
    }

    fn tag(mut self) -> [u8; BLOCK_LEN] {
        self.pad();
        self.x
    }
}

fn keystream_block(cipher: &Aes128, nonce: &[u8; NONCE_LEN], counter: u16) -> [u8; BLOCK_LEN] {
    // A_i = flags | nonce | i, flags = L - 1 = 1.
    let mut block = [0; BLOCK_LEN];
    block[0] = 0x01;
    block[1..1 + NONCE_LEN].copy_from_slice(nonce);
    block[14..16].copy_from_slice(&counter.to_be_bytes());
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
    block
}

fn auth_tag(
    cipher: &Aes128,
    nonce: &[u8; NONCE_LEN],
    a_data: &[u8],
    m_data: &[u8],
    mic_len: usize,
) -> [u8; BLOCK_LEN] {
    // B0 = flags | nonce | l(m), flags = Adata | M' << 3 | (L - 1).
    let mut flags: u8 = 1;
    if !a_data.is_empty() {
        flags |= 1 << 6;
    }
    if mic_len != 0 {
        flags |= (((mic_len - 2) / 2) as u8) << 3;
    }

    let mut mac = CbcMac::new(cipher.clone());
    let mut b0 = [0; BLOCK_LEN];
    b0[0] = flags;
    b0[1..1 + NONCE_LEN].copy_from_slice(nonce);
    b0[14..16].copy_from_slice(&(m_data.len() as u16).to_be_bytes());
    mac.update(&b0);

    if !a_data.is_empty() {
        // L(a): two-octet big-endian length. Longer encodings exist in the
        // specification but can never be reached with a 127-octet MTU.
        mac.update(&(a_data.len() as u16).to_be_bytes());
        mac.update(a_data);
        mac.pad();
    }

    mac.update(m_data);
    mac.tag()
}

fn ctr_transform(cipher: &Aes128, nonce: &[u8; NONCE_LEN], m_data: &mut [u8]) {
    for (i, chunk) in m_data.chunks_mut(BLOCK_LEN).enumerate() {
        let stream = keystream_block(cipher, nonce, (i + 1) as u16);
        for (byte, key_byte) in chunk.iter_mut().zip(stream.iter()) {
            *byte ^= key_byte;
        }
    }
}

/// Secures an outgoing frame in place.
///
/// `buf` holds header (`a_len` octets), payload (`m_len`) and MIC slots
/// (`mic_len`) back to back. For authentication-only levels (`encrypt` is
/// false) the payload joins the authenticated data and is left in clear.
pub fn ccm_star_transmit(
    key: &[u8; 16],
    nonce: &[u8; NONCE_LEN],
    buf: &mut [u8],
    a_len: usize,
    m_len: usize,
    mic_len: usize,
    encrypt: bool,
) -> Result<(), ErrorCode> {
    if a_len + m_len + mic_len != buf.len() {
        return Err(ErrorCode::InvalidArgs);
    }

    let cipher = Aes128::new(GenericArray::from_slice(key));

    if mic_len != 0 {
        let (auth_region, m_region) = if encrypt {
            buf[..a_len + m_len].split_at(a_len)
        } else {
            (&buf[..a_len + m_len], &[][..])
        };
        let tag = auth_tag(&cipher, nonce, auth_region, m_region, mic_len);
        let s0 = keystream_block(&cipher, nonce, 0);
        let mic_start = a_len + m_len;
        for i in 0..mic_len {
            buf[mic_start + i] = tag[i] ^ s0[i];
        }
    }

    if encrypt {
        ctr_transform(&cipher, nonce, &mut buf[a_len..a_len + m_len]);
    }

    Ok(())
}

/// Unsecures a received frame in place and checks its MIC.
///
/// Returns `true` when the tag is valid (always for levels without a MIC).
pub fn ccm_star_receive(
    key: &[u8; 16],
    nonce: &[u8; NONCE_LEN],
    buf: &mut [u8],
    a_len: usize,
    m_len: usize,
    mic_len: usize,
    encrypted: bool,
) -> Result<bool, ErrorCode> {
    if a_len + m_len + mic_len != buf.len() {
        return Err(ErrorCode::InvalidArgs);
    }

    let cipher = Aes128::new(GenericArray::from_slice(key));

    if encrypted {
        ctr_transform(&cipher, nonce, &mut buf[a_len..a_len + m_len]);
    }

    if mic_len == 0 {
        return Ok(true);
    }

    let (auth_region, m_region) = if encrypted {
        buf[..a_len + m_len].split_at(a_len)
    } else {
        (&buf[..a_len + m_len], &[][..])
    };
    let tag = auth_tag(&cipher, nonce, auth_region, m_region, mic_len);
    let s0 = keystream_block(&cipher, nonce, 0);
    let mic_start = a_len + m_len;
    let mut diff = 0u8;
    for i in 0..mic_len {
        diff |= buf[mic_start + i] ^ tag[i] ^ s0[i];
    }
    Ok(diff == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0xc0, 0xc1, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xcb, 0xcc, 0xcd, 0xce,
        0xcf,
    ];
    const EXT_SRC: [u8; 8] = [0xac, 0xde, 0x48, 0x00, 0x00, 0x00, 0x00, 0x01];

    fn secured(level: SecurityLevel, header: &[u8], payload: &[u8]) -> Vec<u8> {
        let nonce = ccm_nonce(&EXT_SRC, 5, level);
        let mut buf = Vec::new();
        buf.extend_from_slice(header);
        buf.extend_from_slice(payload);
        buf.resize(buf.len() + level.mic_len(), 0);
        ccm_star_transmit(
            &KEY,
            &nonce,
            &mut buf,
            header.len(),
            payload.len(),
            level.mic_len(),
            level.encryption_needed(),
        )
        .unwrap();
        buf
    }

    #[test]
    fn round_trip_enc_mic() {
        let header = [0x69u8, 0x98, 0x33, 0x07, 0x22];
        let payload = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        for level in [
            SecurityLevel::EncMic32,
            SecurityLevel::EncMic64,
            SecurityLevel::EncMic128,
        ] {
            let mut buf = secured(level, &header, &payload);
            // Ciphertext differs from the plaintext.
            assert_ne!(&buf[header.len()..header.len() + payload.len()], &payload);

            let nonce = ccm_nonce(&EXT_SRC, 5, level);
            let valid = ccm_star_receive(
                &KEY,
                &nonce,
                &mut buf,
                header.len(),
                payload.len(),
                level.mic_len(),
                true,
            )
            .unwrap();
            assert!(valid);
            assert_eq!(&buf[header.len()..header.len() + payload.len()], &payload);
        }
    }

    #[test]
    fn auth_only_leaves_payload_in_clear() {
        let header = [0xaau8; 9];
        let payload = [0x55u8; 10];
        let buf = secured(SecurityLevel::Mic64, &header, &payload);
        assert_eq!(&buf[header.len()..header.len() + payload.len()], &payload);
        assert_eq!(buf.len(), header.len() + payload.len() + 8);
    }

    #[test]
    fn encryption_only_has_no_tag() {
        let header = [0x11u8; 4];
        let payload = [0x22u8; 4];
        let buf = secured(SecurityLevel::Enc, &header, &payload);
        assert_eq!(buf.len(), header.len() + payload.len());
        assert_ne!(&buf[header.len()..], &payload);
    }

    #[test]
    fn tampering_invalidates_the_mic() {
        let header = hex::decode("6988").unwrap();
        let payload = hex::decode("deadbeef").unwrap();
        let level = SecurityLevel::EncMic32;
        let mut buf = secured(level, &header, &payload);
        buf[1] ^= 0x01;

        let nonce = ccm_nonce(&EXT_SRC, 5, level);
        let valid = ccm_star_receive(
            &KEY,
            &nonce,
            &mut buf,
            header.len(),
            payload.len(),
            level.mic_len(),
            true,
        )
        .unwrap();
        assert!(!valid);
    }

    #[test]
    fn nonce_layout() {
        let nonce = ccm_nonce(&EXT_SRC, 0x0102_0304, SecurityLevel::EncMic32);
        assert_eq!(&nonce[..8], &EXT_SRC);
        assert_eq!(&nonce[8..12], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(nonce[12], 5);
    }

    #[test]
    fn different_counters_give_different_keystreams() {
        let n1 = ccm_nonce(&EXT_SRC, 1, SecurityLevel::Enc);
        let n2 = ccm_nonce(&EXT_SRC, 2, SecurityLevel::Enc);
        let payload = [0u8; 16];
        let mut c1 = payload;
        let mut c2 = payload;
        ccm_star_transmit(&KEY, &n1, &mut c1, 0, 16, 0, true).unwrap();
        ccm_star_transmit(&KEY, &n2, &mut c2, 0, 16, 0, true).unwrap();
        assert_ne!(c1, c2);
    }
}
