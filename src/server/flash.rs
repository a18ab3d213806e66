//! One-shot flash messages carried in a signed cookie.
//!
//! After a failed submission the browser is redirected back to the form,
//! and the form needs to say what went wrong. The message rides along in a
//! short-lived cookie: a JSON payload plus a keyed BLAKE3 MAC, both in
//! URL-safe base64. A cookie that fails verification is ignored, never an
//! error. The MAC only stops casual forgery of banner text; nothing
//! security relevant depends on it.

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cookie name.
pub const FLASH_COOKIE: &str = "certpress_flash";

/// Seconds a flash cookie stays valid in the browser.
const FLASH_MAX_AGE_SECS: u32 = 300;

const KEY_CONTEXT: &str = "certpress 2024-06 flash cookie signing key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashMessage {
    pub kind: FlashKind,
    pub text: String,
}

impl FlashMessage {
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: FlashKind::Error,
            text: text.into(),
        }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self {
            kind: FlashKind::Success,
            text: text.into(),
        }
    }
}

/// Signs and verifies flash cookies.
#[derive(Clone)]
pub struct FlashSigner {
    key: [u8; 32],
}

impl fmt::Debug for FlashSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashSigner").field("key", &"<redacted>").finish()
    }
}

impl FlashSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
        }
    }

    /// `base64(payload).base64(mac)`
    pub fn sign(&self, message: &FlashMessage) -> String {
        let payload = serde_json::to_vec(message).unwrap_or_default();
        let mac = blake3::keyed_hash(&self.key, &payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(mac.as_bytes())
        )
    }

    /// The message inside `value`, if the value is well formed and the MAC
    /// matches.
    pub fn verify(&self, value: &str) -> Option<FlashMessage> {
        let (payload_b64, mac_b64) = value.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let mac: [u8; 32] = URL_SAFE_NO_PAD.decode(mac_b64).ok()?.try_into().ok()?;
        // `Hash` equality is constant-time.
        if blake3::keyed_hash(&self.key, &payload) != blake3::Hash::from(mac) {
            return None;
        }
        serde_json::from_slice(&payload).ok()
    }

    /// `Set-Cookie` value carrying `message`.
    pub fn set_cookie(&self, message: &FlashMessage) -> String {
        format!(
            "{FLASH_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={FLASH_MAX_AGE_SECS}",
            self.sign(message)
        )
    }

    /// `Set-Cookie` value that deletes the flash cookie.
    pub fn clear_cookie() -> String {
        format!("{FLASH_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
    }

    /// Verified flash message from the request's `Cookie` headers.
    pub fn read(&self, headers: &HeaderMap) -> Option<FlashMessage> {
        cookie_value(headers, FLASH_COOKIE).and_then(|v| self.verify(&v))
    }
}

/// Value of cookie `name` across all `Cookie` headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}
