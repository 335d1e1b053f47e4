//! Expiring serve URLs.
//!
//! A token is the AES-256-CBC encryption of
//! `{bucket}|{filename}|{expires_in}|{issued_at}|{hash}` where `hash` is
//! `md5(issued_at + bucket + filename + expires_in + private_key)`. The
//! 16-byte IV is prepended to the ciphertext and the whole is encoded as
//! URL-safe base64 without padding.

use aes::Aes256;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::errors::TokenError;

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;

/// What a valid token grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedClaims {
    pub bucket: String,
    pub filename: String,
    pub expires_in: u64,
    pub issued_at: i64,
}

impl SignedClaims {
    pub fn expires_at(&self) -> i64 {
        self.issued_at.saturating_add(self.expires_in as i64)
    }
}

#[derive(Clone)]
pub struct UrlSigner {
    private_key: Arc<str>,
    cipher_key: [u8; 32],
}

impl UrlSigner {
    pub fn new(private_key: &str) -> Self {
        Self {
            private_key: Arc::from(private_key),
            cipher_key: Sha256::digest(private_key.as_bytes()).into(),
        }
    }

    pub fn issue_at(&self, bucket: &str, filename: &str, expires_in: u64, issued_at: i64) -> String {
        let hash = self.hash(issued_at, bucket, filename, expires_in);
        let payload = format!(
            "{}|{}|{}|{}|{}",
            bucket, filename, expires_in, issued_at, hash
        );

        let iv: [u8; IV_LEN] = rand::random();
        let ciphertext = Encryptor::new(&self.cipher_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(payload.as_bytes());

        let mut raw = Vec::with_capacity(IV_LEN + ciphertext.len());
        raw.extend_from_slice(&iv);
        raw.extend_from_slice(&ciphertext);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Check `token` grants access to `bucket`/`filename` right now.
    pub fn verify(&self, token: &str, bucket: &str, filename: &str) -> Result<SignedClaims, TokenError> {
        self.verify_at(token, bucket, filename, Utc::now().timestamp())
    }

    pub fn verify_at(
        &self,
        token: &str,
        bucket: &str,
        filename: &str,
        now: i64,
    ) -> Result<SignedClaims, TokenError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| TokenError::Encoding)?;
        if raw.len() <= IV_LEN || (raw.len() - IV_LEN) % IV_LEN != 0 {
            return Err(TokenError::Decrypt);
        }
        let (iv, ciphertext) = raw.split_at(IV_LEN);
        let plaintext = Decryptor::new_from_slices(&self.cipher_key, iv)
            .map_err(|_| TokenError::Decrypt)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| TokenError::Decrypt)?;
        let payload = String::from_utf8(plaintext).map_err(|_| TokenError::Format)?;

        let (claims, hash) = parse_payload(&payload)?;
        let expected = self.hash(claims.issued_at, &claims.bucket, &claims.filename, claims.expires_in);
        if hash != expected || claims.bucket != bucket || claims.filename != filename {
            return Err(TokenError::Hash);
        }
        if now > claims.expires_at() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    fn hash(&self, issued_at: i64, bucket: &str, filename: &str, expires_in: u64) -> String {
        let seed = format!(
            "{}{}{}{}{}",
            issued_at, bucket, filename, expires_in, self.private_key
        );
        format!("{:x}", md5::compute(seed))
    }
}

/// Fields are taken from the right so a `|` inside the filename survives.
fn parse_payload(payload: &str) -> Result<(SignedClaims, String), TokenError> {
    let mut parts = payload.rsplitn(4, '|');
    let hash = parts.next().ok_or(TokenError::Format)?;
    let issued_at = parts
        .next()
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or(TokenError::Format)?;
    let expires_in = parts
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or(TokenError::Format)?;
    let rest = parts.next().ok_or(TokenError::Format)?;
    let (bucket, filename) = rest.split_once('|').ok_or(TokenError::Format)?;
    if bucket.is_empty() || filename.is_empty() {
        return Err(TokenError::Format);
    }

    Ok((
        SignedClaims {
            bucket: bucket.to_string(),
            filename: filename.to_string(),
            expires_in,
            issued_at,
        },
        hash.to_string(),
    ))
}
