//! Signed media URLs
//!
//! `{base}/media/{id}?expires={unix secs}&signature={mac}` where `mac` is
//! HMAC-SHA256 over `"{id}:{expires}"`, URL-safe base64 without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ExcommsError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct UrlSigner {
    base: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").field("base", &self.base).finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(base: impl Into<String>, key: impl AsRef<[u8]>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            key: key.as_ref().to_vec(),
        }
    }

    fn mac(&self, media_id: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ExcommsError::config(format!("media signing key: {}", e)))?;
        mac.update(media_id.as_bytes());
        mac.update(b":");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// URL for `media_id` that stops verifying at `expires`.
    pub fn sign(&self, media_id: &str, expires: DateTime<Utc>) -> Result<String> {
        let expires = expires.timestamp();
        let signature = URL_SAFE_NO_PAD.encode(self.mac(media_id, expires)?.finalize().into_bytes());
        Ok(format!(
            "{}/media/{}?expires={}&signature={}",
            self.base, media_id, expires, signature
        ))
    }

    /// Check a signature presented for `media_id` at `now`.
    pub fn verify(&self, media_id: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> Result<()> {
        if now.timestamp() >= expires {
            return Err(ExcommsError::invalid_argument("media url expired"));
        }
        let raw = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| ExcommsError::invalid_argument("malformed media url signature"))?;
        self.mac(media_id, expires)?
            .verify_slice(&raw)
            .map_err(|_| ExcommsError::invalid_argument("bad media url signature"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn parts(url: &str) -> (i64, String) {
        let query = url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut signature = String::new();
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", v) => expires = v.parse().unwrap(),
                ("signature", v) => signature = v.to_string(),
                _ => {}
            }
        }
        (expires, signature)
    }

    #[test]
    fn signed_url_verifies_until_expiry() {
        let signer = UrlSigner::new("https://api.example.com/", "secret");
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let url = signer.sign("123", now + Duration::hours(1)).unwrap();
        assert!(url.starts_with("https://api.example.com/media/123?expires=1700003600&signature="));

        let (expires, signature) = parts(&url);
        signer.verify("123", expires, &signature, now).unwrap();
        assert!(signer.verify("124", expires, &signature, now).is_err());
        assert!(signer.verify("123", expires, &signature, now + Duration::hours(2)).is_err());
        assert!(UrlSigner::new("x", "other").verify("123", expires, &signature, now).is_err());
    }
}
