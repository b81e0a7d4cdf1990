//! Request signing for the broker (SAS tokens) and blob storage (Shared Key).

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use sonarq_core::error::ScanError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("account key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),

    #[error("signing key was rejected")]
    KeyLength,
}

impl From<SigningError> for ScanError {
    fn from(err: SigningError) -> Self {
        ScanError::Internal(format!("request signing failed: {err}"))
    }
}

/// Base64 HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256_base64(key: &[u8], message: &str) -> Result<String, SigningError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SigningError::KeyLength)?;
    mac.update(message.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Shared access signature for `resource_uri`, valid until `expiry` (unix
/// seconds). The broker signs with the raw key text, not its decoded bytes.
pub fn sas_token(
    resource_uri: &str,
    key_name: &str,
    key: &str,
    expiry: i64,
) -> Result<String, SigningError> {
    let encoded_uri = urlencoding::encode(resource_uri);
    let string_to_sign = format!("{encoded_uri}\n{expiry}");
    let signature = hmac_sha256_base64(key.as_bytes(), &string_to_sign)?;
    Ok(format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}&skn={key_name}",
        urlencoding::encode(&signature)
    ))
}

/// Shared Key string-to-sign for a body-less request: the verb, eleven empty
/// standard header slots, the sorted `x-ms-*` headers, then the canonical
/// resource path.
pub fn shared_key_string_to_sign(
    verb: &str,
    ms_headers: &[(&str, &str)],
    account: &str,
    path: &str,
) -> String {
    let mut headers: Vec<(String, &str)> = ms_headers
        .iter()
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim()))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = String::with_capacity(128);
    out.push_str(verb);
    out.push('\n');
    for _ in 0..11 {
        out.push('\n');
    }
    for (name, value) in headers {
        out.push_str(&name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }
    out.push('/');
    out.push_str(account);
    if !path.starts_with('/') {
        out.push('/');
    }
    out.push_str(path);
    out
}

/// `Authorization` header value for a Shared Key request.
pub fn shared_key_authorization(
    account: &str,
    account_key_b64: &str,
    string_to_sign: &str,
) -> Result<String, SigningError> {
    let key = STANDARD.decode(account_key_b64.trim())?;
    let signature = hmac_sha256_base64(&key, string_to_sign)?;
    Ok(format!("SharedKey {account}:{signature}"))
}
