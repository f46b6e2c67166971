//! Hashes, AES-128-CBC framing, and raw RSA-1024 handshake primitives.
//!
//! Devices speak PKCS#1 v1.5 with a hand-rolled padding scheme, so this
//! module decrypts with a bare modular exponentiation and strips the padding
//! itself rather than trusting a padding-aware RSA API.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest as Md5Digest, Md5};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;
use sha2::Digest as Sha2Digest;

use crate::error::{CoreError, Result};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// RSA modulus size for the AES-transport handshake keypair.
const RSA_BITS: usize = 1024;

pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// AES-128-CBC encrypt with PKCS#7 padding.
pub fn aes128_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plain: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain)
}

/// AES-128-CBC decrypt with PKCS#7 padding. Fails with `Protocol` if the
/// ciphertext length isn't a multiple of the block size or the padding is
/// malformed.
pub fn aes128_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], cipher: &[u8]) -> Result<Vec<u8>> {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(cipher)
        .map_err(|e| CoreError::Protocol(format!("aes-cbc unpad failed: {e}")))
}

/// Generate an RSA-1024 keypair, returning (SPKI public PEM, PKCS8 private PEM).
pub fn rsa_generate_1024() -> Result<(String, String)> {
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, RSA_BITS)
        .map_err(|e| CoreError::Transport(format!("rsa key generation failed: {e}")))?;
    let public_key = RsaPublicKey::from(&private_key);

    let priv_pem = private_key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| CoreError::Transport(format!("rsa private key encoding failed: {e}")))?
        .to_string();
    let pub_pem = public_key
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| CoreError::Transport(format!("rsa public key encoding failed: {e}")))?;

    Ok((pub_pem, priv_pem))
}

/// Parse a PKCS8 PEM private key (as produced by [`rsa_generate_1024`]).
fn parse_private_key(priv_pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(priv_pem)
        .map_err(|e| CoreError::Transport(format!("invalid rsa private key: {e}")))
}

/// Decrypt `cipher` with no padding scheme (a bare modular exponentiation),
/// then manually strip PKCS#1 v1.5 type-2 padding, matching the exact
/// zero-separator search devices expect clients to perform themselves.
///
/// Returns the raw key material (expected to be >= 32 bytes: 16-byte AES
/// key followed by a 16-byte IV). Fails with `HandshakeInvalid` on any
/// deviation from the expected padding shape.
pub fn rsa_pkcs1_raw_decrypt(priv_pem: &str, cipher: &[u8]) -> Result<Vec<u8>> {
    let private_key = parse_private_key(priv_pem)?;

    let c = BigUint::from_bytes_be(cipher);
    let n = private_key.n();
    if &c >= n {
        return Err(CoreError::HandshakeInvalid(
            "ciphertext not reduced modulo n".into(),
        ));
    }

    let block = raw_modpow_decrypt(&private_key, &c, n);
    unpad_pkcs1_v15_type2(&block)
}

/// `m = c^d mod n`, re-padded to the modulus byte length.
fn raw_modpow_decrypt(private_key: &RsaPrivateKey, c: &BigUint, n: &BigUint) -> Vec<u8> {
    let d = private_key.d();
    let m = c.modpow(d, n);
    let modulus_len = n.to_bytes_be().len();
    let mut block = m.to_bytes_be();
    if block.len() < modulus_len {
        let mut padded = vec![0u8; modulus_len - block.len()];
        padded.append(&mut block);
        block = padded;
    }
    block
}

/// Verify `block[0] == 0x00 && block[1] == 0x02`, locate the first `0x00`
/// separator at index >= 10, and return the tail.
fn unpad_pkcs1_v15_type2(block: &[u8]) -> Result<Vec<u8>> {
    if block.len() < 11 || block[0] != 0x00 || block[1] != 0x02 {
        return Err(CoreError::HandshakeInvalid(
            "malformed pkcs#1 v1.5 type-2 header".into(),
        ));
    }

    let separator = block[2..]
        .iter()
        .position(|&b| b == 0x00)
        .map(|idx| idx + 2)
        .ok_or_else(|| CoreError::HandshakeInvalid("missing pkcs#1 padding separator".into()))?;

    if separator < 10 {
        return Err(CoreError::HandshakeInvalid(
            "pkcs#1 padding separator too close to header".into(),
        ));
    }

    let raw = block[separator + 1..].to_vec();
    if raw.len() < 32 {
        return Err(CoreError::HandshakeInvalid(format!(
            "raw key material too short: {} bytes",
            raw.len()
        )));
    }
    Ok(raw)
}

/// Parse a public key PEM, used only by tests that round-trip the keypair.
#[cfg(test)]
fn parse_public_key(pub_pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pub_pem)
        .map_err(|e| CoreError::Transport(format!("invalid rsa public key: {e}")))
}
