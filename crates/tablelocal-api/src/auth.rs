//! Request authorization.
//!
//! Supports the SharedKey and SharedKeyLite schemes of the table service.
//! For SharedKey the string to sign is
//!
//! ```text
//! VERB\nContent-MD5\nContent-Type\nDate\nCanonicalizedResource
//! ```
//!
//! and for SharedKeyLite it is `Date\nCanonicalizedResource`, where `Date` is
//! `x-ms-date` when present. The canonicalized resource is `/account` followed
//! by the request path and, if present, `?comp=<value>`.

use axum::http::{HeaderMap, Method, Uri};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::Sha256;
use std::sync::LazyLock;
use tablelocal_common::config::AuthMode;
use tablelocal_common::{Error, Result};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

static AUTH_HEADER: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(SharedKey|SharedKeyLite)\s+([^:\s]+):(\S+)$"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    SharedKey,
    SharedKeyLite,
}

struct Credentials<'a> {
    scheme: Scheme,
    account: &'a str,
    signature: &'a str,
}

fn parse_authorization(header: &str) -> Result<Credentials<'_>> {
    let re = AUTH_HEADER
        .as_ref()
        .map_err(|e| Error::internal(format!("authorization pattern: {e}")))?;
    let captures = re
        .captures(header.trim())
        .ok_or_else(|| Error::AuthenticationFailed("malformed Authorization header".into()))?;

    let scheme = match captures.get(1).map(|m| m.as_str()) {
        Some("SharedKey") => Scheme::SharedKey,
        _ => Scheme::SharedKeyLite,
    };
    match (captures.get(2), captures.get(3)) {
        (Some(account), Some(signature)) => Ok(Credentials {
            scheme,
            account: account.as_str(),
            signature: signature.as_str(),
        }),
        _ => Err(Error::AuthenticationFailed(
            "malformed Authorization header".into(),
        )),
    }
}

/// Checks requests against the configured account
pub struct Authenticator {
    mode: AuthMode,
    account: String,
    key: Vec<u8>,
}

impl Authenticator {
    /// Create an authenticator. The key is the base64 account key.
    pub fn new(mode: AuthMode, account: impl Into<String>, key_b64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_b64.trim())
            .map_err(|e| Error::Configuration(format!("account key is not valid base64: {e}")))?;
        Ok(Self {
            mode,
            account: account.into(),
            key,
        })
    }

    #[must_use]
    pub const fn mode(&self) -> AuthMode {
        self.mode
    }

    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Authorize one request
    pub fn authorize(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> Result<()> {
        if self.mode == AuthMode::Open {
            return Ok(());
        }
        let result = self.check(method, uri, headers);
        if let Err(e) = &result {
            warn!("Rejected {} {}: {}", method, uri.path(), e);
        }
        result
    }

    fn check(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> Result<()> {
        let header = headers
            .get("authorization")
            .map(|v| {
                v.to_str()
                    .map_err(|_| Error::AuthenticationFailed("invalid Authorization header".into()))
            })
            .transpose()?;

        match self.mode {
            AuthMode::Open => Ok(()),
            AuthMode::Dev => match header {
                Some(header) => parse_authorization(header).map(|_| ()),
                None if has_sas_signature(uri) => Ok(()),
                None => Err(Error::AuthenticationFailed(
                    "request carries neither an Authorization header nor a SAS signature".into(),
                )),
            },
            AuthMode::SharedKey => match header {
                Some(header) => self.verify(method, uri, headers, header),
                None if has_sas_signature(uri) => Err(Error::AuthenticationFailed(
                    "SAS tokens are not accepted in shared-key mode".into(),
                )),
                None => Err(Error::AuthenticationFailed(
                    "missing Authorization header".into(),
                )),
            },
        }
    }

    fn verify(&self, method: &Method, uri: &Uri, headers: &HeaderMap, header: &str) -> Result<()> {
        let credentials = parse_authorization(header)?;
        if credentials.account != self.account {
            return Err(Error::AuthenticationFailed(format!(
                "unknown account: {}",
                credentials.account
            )));
        }

        for resource in self.canonical_resources(uri) {
            let string_to_sign = string_to_sign(credentials.scheme, method, headers, &resource);
            let calculated = self.sign(&string_to_sign)?;
            if constant_time_eq(&calculated, credentials.signature) {
                debug!("Authenticated {:?} request for {}", credentials.scheme, self.account);
                return Ok(());
            }
            debug!(
                "Signature mismatch:\n  String to Sign:\n{}\n  Calculated: {}\n  Provided: {}",
                string_to_sign, calculated, credentials.signature
            );
        }
        Err(Error::AuthenticationFailed(
            "signature does not match".into(),
        ))
    }

    /// Candidate canonicalized resources. Path-style URLs carry the account
    /// as their first segment; clients sign the path either with or without it.
    fn canonical_resources(&self, uri: &Uri) -> Vec<String> {
        let path = uri.path();
        let comp = uri.query().and_then(|query| {
            query.split('&').find_map(|pair| {
                pair.strip_prefix("comp=")
                    .map(|value| format!("?comp={value}"))
            })
        });
        let comp = comp.as_deref().unwrap_or_default();

        let mut resources = vec![format!("/{}{path}{comp}", self.account)];
        let prefix = format!("/{}", self.account);
        if let Some(stripped) = path.strip_prefix(&prefix)
            && (stripped.is_empty() || stripped.starts_with('/'))
        {
            resources.push(format!("/{}{stripped}{comp}", self.account));
        }
        resources
    }

    fn sign(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::internal(format!("HMAC key: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}

fn has_sas_signature(uri: &Uri) -> bool {
    uri.query()
        .is_some_and(|q| q.split('&').any(|pair| pair.starts_with("sig=")))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn string_to_sign(scheme: Scheme, method: &Method, headers: &HeaderMap, resource: &str) -> String {
    let date = match header_str(headers, "x-ms-date") {
        "" => header_str(headers, "date"),
        ms_date => ms_date,
    };
    match scheme {
        Scheme::SharedKey => format!(
            "{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            header_str(headers, "content-md5"),
            header_str(headers, "content-type"),
            date,
            resource
        ),
        Scheme::SharedKeyLite => format!("{date}\n{resource}"),
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tablelocal_common::config::{DEFAULT_ACCOUNT, DEFAULT_ACCOUNT_KEY};

    const DATE: &str = "Mon, 01 Jan 2024 00:00:00 GMT";

    fn authenticator(mode: AuthMode) -> Authenticator {
        Authenticator::new(mode, DEFAULT_ACCOUNT, DEFAULT_ACCOUNT_KEY).unwrap()
    }

    fn signed_headers(auth: &Authenticator, scheme: Scheme, method: &Method, resource: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-date", HeaderValue::from_static(DATE));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let signature = auth
            .sign(&string_to_sign(scheme, method, &headers, resource))
            .unwrap();
        let name = match scheme {
            Scheme::SharedKey => "SharedKey",
            Scheme::SharedKeyLite => "SharedKeyLite",
        };
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("{name} {DEFAULT_ACCOUNT}:{signature}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_open_mode_accepts_anything() {
        let auth = authenticator(AuthMode::Open);
        let uri: Uri = "/devstoreaccount1/Tables".parse().unwrap();
        assert!(auth.authorize(&Method::GET, &uri, &HeaderMap::new()).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap());
        assert!(auth.authorize(&Method::GET, &uri, &headers).is_ok());
        assert!(matches!(
            authenticator(AuthMode::Dev).authorize(&Method::GET, &uri, &headers),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_dev_mode_checks_presence() {
        let auth = authenticator(AuthMode::Dev);
        let uri: Uri = "/devstoreaccount1/Tables".parse().unwrap();
        assert!(matches!(
            auth.authorize(&Method::GET, &uri, &HeaderMap::new()),
            Err(Error::AuthenticationFailed(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("SharedKey devstoreaccount1:bm90LWEtcmVhbC1zaWc="),
        );
        assert!(auth.authorize(&Method::GET, &uri, &headers).is_ok());

        headers.insert("authorization", HeaderValue::from_static("Bearer token"));
        assert!(auth.authorize(&Method::GET, &uri, &headers).is_err());

        let sas: Uri = "/devstoreaccount1/test?sv=2019-02-02&sig=abc".parse().unwrap();
        assert!(auth.authorize(&Method::GET, &sas, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn test_shared_key_verification() {
        let auth = authenticator(AuthMode::SharedKey);
        let method = Method::POST;
        let uri: Uri = "/devstoreaccount1/Tables".parse().unwrap();

        // Signed over the path including the account segment
        let headers = signed_headers(&auth, Scheme::SharedKey, &method, "/devstoreaccount1/devstoreaccount1/Tables");
        assert!(auth.authorize(&method, &uri, &headers).is_ok());

        // Signed over the path without it
        let headers = signed_headers(&auth, Scheme::SharedKey, &method, "/devstoreaccount1/Tables");
        assert!(auth.authorize(&method, &uri, &headers).is_ok());

        // Signature for a different verb
        let headers = signed_headers(&auth, Scheme::SharedKey, &Method::GET, "/devstoreaccount1/Tables");
        assert!(auth.authorize(&method, &uri, &headers).is_err());
    }

    #[test]
    fn test_shared_key_lite_with_comp() {
        let auth = authenticator(AuthMode::SharedKey);
        let uri: Uri = "/devstoreaccount1/test?comp=acl&timeout=5".parse().unwrap();
        let headers = signed_headers(
            &auth,
            Scheme::SharedKeyLite,
            &Method::GET,
            "/devstoreaccount1/test?comp=acl",
        );
        assert!(auth.authorize(&Method::GET, &uri, &headers).is_ok());
    }

    #[test]
    fn test_shared_key_rejections() {
        let auth = authenticator(AuthMode::SharedKey);
        let uri: Uri = "/devstoreaccount1/Tables".parse().unwrap();

        let sas: Uri = "/devstoreaccount1/Tables?sig=abc".parse().unwrap();
        assert!(auth.authorize(&Method::GET, &sas, &HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("SharedKey otheraccount:c2ln"),
        );
        assert!(auth.authorize(&Method::GET, &uri, &headers).is_err());
    }

    #[test]
    fn test_invalid_key_is_configuration_error() {
        assert!(matches!(
            Authenticator::new(AuthMode::SharedKey, DEFAULT_ACCOUNT, "not base64!"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
