//! AWS Signature Version 4 request signing.
//!
//! `sign` is a pure function of the credential and the canonical request:
//! identical inputs (including the timestamp) always produce byte-identical
//! headers, regardless of the in-memory ordering of headers or query
//! parameters before canonicalization.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::auth::Credential;
use crate::models::ProxyError;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "execute-api";

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded SHA-256 digest, as used for the payload hash.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Normalized description of one outbound HTTP request, derived fresh per
/// call. `headers` must contain `host`; `x-amz-date` and the security token
/// header are added during signing.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub payload_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// The header set authenticating one request.
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub security_token: Option<String>,
}

/// Sign a canonical request for the `execute-api` service.
///
/// # Errors
///
/// Returns `ProxyError::Credential` when the access key, secret key, or
/// region is empty.
pub fn sign(
    credential: &Credential,
    request: &CanonicalRequest,
) -> Result<SignatureHeaders, ProxyError> {
    sign_scoped(credential, request, SERVICE)
}

fn sign_scoped(
    credential: &Credential,
    request: &CanonicalRequest,
    service: &str,
) -> Result<SignatureHeaders, ProxyError> {
    if credential.access_key.is_empty() {
        return Err(ProxyError::Credential("access key is empty".to_string()));
    }
    if credential.secret_key.is_empty() {
        return Err(ProxyError::Credential("secret key is empty".to_string()));
    }
    if credential.region.is_empty() {
        return Err(ProxyError::Credential("region is empty".to_string()));
    }

    let amz_date = request.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date = request.timestamp.format("%Y%m%d").to_string();

    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    headers.push(("x-amz-date".to_string(), amz_date.clone()));
    if let Some(token) = &credential.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let mut query: Vec<(String, String)> = request
        .query
        .iter()
        .map(|(key, value)| {
            (
                urlencoding::encode(key).into_owned(),
                urlencoding::encode(value).into_owned(),
            )
        })
        .collect();
    query.sort();
    let canonical_query = query
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "{}\n{}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{}",
        request.method, request.path, request.payload_hash
    );

    let scope = format!("{date}/{}/{service}/aws4_request", credential.region);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let key = derive_key(&credential.secret_key, &date, &credential.region, service)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credential.access_key
    );

    Ok(SignatureHeaders {
        authorization,
        amz_date,
        security_token: credential.session_token.clone(),
    })
}

fn derive_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, ProxyError> {
    let mut key = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    for part in [region, service, "aws4_request"] {
        key = hmac_sha256(&key, part.as_bytes())?;
    }
    Ok(key)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| ProxyError::Credential(format!("hmac key: {err}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
