//! Opaque, authenticated file IDs.
//!
//! The server hands booting clients IDs that stand in for upstream URLs.
//! Sealing the URL under a per-process key means a client on the same L2
//! segment cannot coerce the file proxy into fetching arbitrary
//! locations: only IDs this process minted verify.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::Error;
use crate::types::Id;

const NONCE_LEN: usize = 24;

/// Generates a fresh signing key from the OS RNG. Done once per process
/// start; restarting intentionally invalidates every ID in flight.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Constructs an ID from `url`, sealed with `key`.
///
/// Secretbox is authenticated encryption; plain authentication would do,
/// but the sealed construction is hard to misuse and the overhead is
/// noise for URL-sized payloads. Every call draws a fresh nonce, so
/// signing the same URL twice yields distinct IDs.
pub fn sign_url(url: &str, key: &[u8; 32]) -> Result<Id, Error> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), url.as_bytes())
        .map_err(|_| Error::Signature)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(Id::new(URL_SAFE.encode(out)))
}

/// Returns the URL contained within `id`.
///
/// `id` must have been created by [`sign_url`] with the same key. All
/// failure modes collapse into one opaque error so nothing about the
/// sealed content leaks.
pub fn get_url(id: &Id, key: &[u8; 32]) -> Result<String, Error> {
    let signed = URL_SAFE
        .decode(id.as_str())
        .map_err(|_| Error::Signature)?;
    if signed.len() < NONCE_LEN {
        return Err(Error::Signature);
    }
    let (nonce, sealed) = signed.split_at(NONCE_LEN);
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let url = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::Signature)?;
    String::from_utf8(url).map_err(|_| Error::Signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = generate_key();
        let url = "http://test.example/foo/bar";
        let id = sign_url(url, &key).unwrap();
        assert_eq!(get_url(&id, &key).unwrap(), url);
    }

    #[test]
    fn ids_are_unique_per_call() {
        let key = generate_key();
        let a = sign_url("http://test.example", &key).unwrap();
        let b = sign_url("http://test.example", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_id_fails() {
        let key = generate_key();
        let id = sign_url("http://test.example/foo/bar", &key).unwrap();

        let mut s = id.as_str().to_string();
        // Flip the last character to something it is not.
        let last = s.pop().unwrap();
        s.push(if last == 'A' { 'B' } else { 'A' });
        assert!(get_url(&Id::new(s), &key).is_err());
    }

    #[test]
    fn appended_bytes_fail() {
        let key = generate_key();
        let id = sign_url("http://test.example", &key).unwrap();
        let grown = Id::new(format!("{}AAAA", id));
        assert!(get_url(&grown, &key).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let id = sign_url("http://test.example", &generate_key()).unwrap();
        assert!(get_url(&id, &generate_key()).is_err());
    }

    #[test]
    fn truncated_blob_fails() {
        let key = generate_key();
        assert!(get_url(&Id::new(URL_SAFE.encode([0u8; 10])), &key).is_err());
        assert!(get_url(&Id::new("not base64 !!!"), &key).is_err());
    }
}
