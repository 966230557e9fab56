//! Channel-secret derivation, event signing/encryption, and the RSA-OAEP
//! password-exchange primitives. Every operation here is pure (no I/O, no
//! shared state) except the single wall-clock read in [`encrypt`]; the
//! AES-CTR scheme and PBKDF2 parameters must stay byte-exact with the
//! reference implementation other agents on the channel also speak.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

const PBKDF2_SALT: &[u8] = b"messaging-platform";
const PBKDF2_ITERATIONS: u32 = 100_000;
const PBKDF2_KEY_LEN: usize = 32;

type Aes128Ctr64Be = ctr::Ctr64BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// `{cipher, hash}` envelope produced by [`encrypt_and_sign`].
#[derive(Debug, Serialize, Deserialize)]
struct SignedEnvelope {
    cipher: String,
    hash: String,
}

/// PBKDF2-HMAC-SHA256 over `channel_name || password`, `channel_`-prefixed
/// base64url (no padding). This string is both a channel-identifying value
/// and the symmetric key handed to [`encrypt`]/[`decrypt`].
pub fn derive_channel_secret(channel_name: &str, password: &str) -> String {
    let mut combined = String::with_capacity(channel_name.len() + password.len());
    combined.push_str(channel_name);
    combined.push_str(password);

    let mut out = [0u8; PBKDF2_KEY_LEN];
    pbkdf2_hmac::<Sha256>(combined.as_bytes(), PBKDF2_SALT, PBKDF2_ITERATIONS, &mut out);
    format!("channel_{}", URL_SAFE_NO_PAD.encode(out))
}

/// HMAC-SHA256(key, message), lowercase hex.
pub fn hash(message: &str, key: &str) -> String {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn ctr_key_schedule(password: &str) -> [u8; 16] {
    let mut pw_bytes = [0u8; 16];
    let pw_input = password.as_bytes();
    let n = pw_input.len().min(16);
    pw_bytes[..n].copy_from_slice(&pw_input[..n]);

    let cipher = aes::Aes128::new_from_slice(&pw_bytes).expect("16-byte key");
    let mut block = pw_bytes.into();
    cipher.encrypt_block(&mut block);
    block.into()
}

fn ctr_nonce(now_ms: u128, rand_bytes: [u8; 2]) -> [u8; 8] {
    let ms = (now_ms % 1000) as u16;
    let sec = (now_ms / 1000) as u32;
    let mut nonce = [0u8; 8];
    nonce[0..2].copy_from_slice(&ms.to_le_bytes());
    nonce[2..4].copy_from_slice(&rand_bytes);
    nonce[4..8].copy_from_slice(&sec.to_le_bytes());
    nonce
}

/// AES-128-CTR with the custom zero-padded/self-ECB key schedule and an
/// 8-byte public nonce (ms-in-second, 2 random bytes, epoch seconds). Output
/// is `base64(nonce ‖ ciphertext)`.
pub fn encrypt(plaintext: &str, key: &str) -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis();
    let mut rand_bytes = [0u8; 2];
    rand::thread_rng().fill_bytes(&mut rand_bytes);
    encrypt_with(plaintext, key, now_ms, rand_bytes)
}

fn encrypt_with(plaintext: &str, key: &str, now_ms: u128, rand_bytes: [u8; 2]) -> String {
    let aes_key = ctr_key_schedule(key);
    let nonce = ctr_nonce(now_ms, rand_bytes);

    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&nonce);

    let mut buf = plaintext.as_bytes().to_vec();
    let mut cipher = Aes128Ctr64Be::new((&aes_key).into(), (&iv).into());
    cipher.apply_keystream(&mut buf);

    let mut out = Vec::with_capacity(8 + buf.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&buf);
    B64.encode(out)
}

/// Decrypts output of [`encrypt`]. Returns `None` on any malformed input —
/// decryption failures must never be fatal to a caller polling events from
/// other, possibly malicious, agents.
pub fn decrypt(ciphertext_b64: &str, key: &str) -> Option<String> {
    let data = B64.decode(ciphertext_b64).ok()?;
    if data.len() < 8 {
        return None;
    }
    let aes_key = ctr_key_schedule(key);
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&data[..8]);

    let mut buf = data[8..].to_vec();
    let mut cipher = Aes128Ctr64Be::new((&aes_key).into(), (&iv).into());
    cipher.apply_keystream(&mut buf);

    String::from_utf8(buf).ok()
}

/// `{cipher: encrypt(message, key), hash: hash(message, key)}` as JSON.
pub fn encrypt_and_sign(message: &str, key: &str) -> String {
    let envelope = SignedEnvelope {
        cipher: encrypt(message, key),
        hash: hash(message, key),
    };
    serde_json::to_string(&envelope).expect("envelope is always serializable")
}

/// Reverses [`encrypt_and_sign`]; returns `None` on malformed JSON, failed
/// decryption, or a hash mismatch (soft failure per the crypto error
/// taxonomy — never panics on attacker-controlled input).
pub fn decrypt_and_verify(cipher_msg_str: &str, key: &str) -> Option<String> {
    let envelope: SignedEnvelope = serde_json::from_str(cipher_msg_str).ok()?;
    let message = decrypt(&envelope.cipher, key)?;
    if hash(&message, key).trim() != envelope.hash.trim() {
        return None;
    }
    Some(message)
}

/// Ephemeral RSA-2048 keypair used once per password-exchange request.
pub fn rsa_generate() -> Result<(RsaPrivateKey, String), rsa::Error> {
    let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)?;
    let public_pem = RsaPublicKey::from(&private)
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|_| rsa::Error::Internal)?;
    Ok((private, public_pem))
}

fn load_public_key(key_str: &str) -> Result<RsaPublicKey, rsa::Error> {
    let s = key_str.trim();
    if s.contains("-----BEGIN") {
        return RsaPublicKey::from_public_key_pem(s).map_err(|_| rsa::Error::Internal);
    }
    let der = URL_SAFE_NO_PAD
        .decode(s)
        .or_else(|_| B64.decode(s))
        .map_err(|_| rsa::Error::Internal)?;
    RsaPublicKey::from_public_key_der(&der).map_err(|_| rsa::Error::Internal)
}

/// OAEP-SHA256/MGF1-SHA256, no label. `public_key` is accepted as PEM or
/// base64 (url-safe or standard) DER, matching what a peer may have sent
/// over the wire as a plain string.
pub fn rsa_encrypt(public_key: &str, plaintext: &str) -> Result<String, rsa::Error> {
    let pub_key = load_public_key(public_key)?;
    let padding = Oaep::new::<Sha256>();
    let ciphertext = pub_key.encrypt(&mut rand::thread_rng(), padding, plaintext.as_bytes())?;
    Ok(B64.encode(ciphertext))
}

/// Decrypts ciphertext produced by [`rsa_encrypt`] for the matching keypair.
pub fn rsa_decrypt(private_key: &RsaPrivateKey, base64_cipher: &str) -> Result<String, rsa::Error> {
    let ciphertext = B64
        .decode(base64_cipher)
        .map_err(|_| rsa::Error::Decryption)?;
    let padding = Oaep::new::<Sha256>();
    let plain = private_key.decrypt(padding, &ciphertext)?;
    String::from_utf8(plain).map_err(|_| rsa::Error::Decryption)
}
