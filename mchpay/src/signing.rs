//! Request and response signatures.
//!
//! The signature is computed over a canonical string built from the payload:
//! - drop the `sign` field and every field whose value is empty
//! - sort the remaining keys by byte value
//! - join as `k1=v1&k2=v2&...` and append `&key={api_key}`
//! - digest with MD5 or SHA1 (unkeyed) or HMAC-SHA256 keyed with the API key
//! - render as uppercase hex
//!
//! There is no timestamp binding; replay protection comes from the `nonce_str` field the caller
//! includes in the payload.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::errors::Error;
use crate::fields::{FieldMap, SIGN};

type HmacSha256 = Hmac<Sha256>;

/// Length of generated `nonce_str` values (the provider accepts up to 32)
pub const NONCE_LEN: usize = 32;

/// Digest used to sign a payload. MD5 unless the caller says otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SignType {
    #[default]
    Md5,
    Sha1,
    HmacSha256,
}

impl SignType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA1",
            Self::HmacSha256 => "HMAC-SHA256",
        }
    }

    /// Resolve the algorithm named by a payload's `sign_type` field. Absent or empty means MD5.
    pub fn from_field(value: Option<&str>) -> Result<Self, Error> {
        match value {
            None | Some("") => Ok(Self::default()),
            Some(name) => name.parse(),
        }
    }
}

impl fmt::Display for SignType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MD5" => Ok(Self::Md5),
            "SHA1" => Ok(Self::Sha1),
            "HMAC-SHA256" => Ok(Self::HmacSha256),
            _ => Err(Error::UnsupportedSignType(s.to_string())),
        }
    }
}

/// Build the string that gets digested.
fn canonical_string(fields: &FieldMap, api_key: &str) -> String {
    let mut canonical = String::new();
    for (key, value) in fields.iter().filter(|(k, v)| *k != SIGN && !v.is_empty()) {
        canonical.push_str(key);
        canonical.push('=');
        canonical.push_str(value);
        canonical.push('&');
    }
    canonical.push_str("key=");
    canonical.push_str(api_key);
    canonical
}

/// Sign a payload.
///
/// Iteration order of the map does not matter: keys are always canonicalized in byte order.
pub fn sign(fields: &FieldMap, api_key: &str, sign_type: SignType) -> String {
    let canonical = canonical_string(fields, api_key);

    match sign_type {
        SignType::Md5 => hex::encode_upper(md5::compute(canonical.as_bytes()).0),
        SignType::Sha1 => hex::encode_upper(Sha1::digest(canonical.as_bytes())),
        SignType::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(api_key.as_bytes()).expect("HMAC accepts keys of any length");
            mac.update(canonical.as_bytes());
            hex::encode_upper(mac.finalize().into_bytes())
        }
    }
}

/// Check `candidate` against the signature computed over `fields`.
///
/// Comparison is case-sensitive. An empty candidate never verifies.
pub fn verify(fields: &FieldMap, api_key: &str, sign_type: SignType, candidate: &str) -> bool {
    if candidate.is_empty() {
        return false;
    }
    let expected = sign(fields, api_key, sign_type);
    constant_time_eq(candidate.as_bytes(), expected.as_bytes())
}

/// Verify the `sign` field carried inside `fields` itself.
pub fn verify_embedded(fields: &FieldMap, api_key: &str, sign_type: SignType) -> bool {
    verify(fields, api_key, sign_type, fields.get_or_empty(SIGN))
}

/// Generate a random alphanumeric `nonce_str`.
pub fn nonce_str() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(NONCE_LEN).map(char::from).collect()
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
