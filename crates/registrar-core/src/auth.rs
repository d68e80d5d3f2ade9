//! SIP digest authentication for REGISTER
//!
//! Implements the server side of RFC 2617 digest as used by SIP (RFC 3261 §22):
//! the registrar issues a nonce in a `WWW-Authenticate` challenge, the endpoint
//! answers with an `Authorization` header, and the response hash is recomputed
//! from the extension's stored secret.
//!
//! ```text
//! response = MD5(HA1 ":" nonce ":" nc ":" cnonce ":" qop ":" HA2)   (qop=auth)
//! response = MD5(HA1 ":" nonce ":" HA2)                             (no qop)
//!     HA1 = MD5(username ":" realm ":" password)
//!     HA2 = MD5(method ":" digest-uri)
//! ```
//!
//! Nonces are single-realm, expire after a TTL and carry the last seen
//! nonce-count. Only `qop=auth` answers are accepted, so every answer has a
//! nonce-count and a replayed `nc` is refused.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{RegistrarError, Result};

const NONCE_LEN: usize = 32;
const MAX_NONCE_TTL_SECS: u64 = 86_400;

/// A `WWW-Authenticate: Digest ...` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    /// Set when re-challenging after a stale nonce so the client retries silently
    pub stale: bool,
}

impl fmt::Display for DigestChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest realm=\"{}\", nonce=\"{}\", algorithm={}",
            self.realm, self.nonce, self.algorithm
        )?;
        if let Some(qop) = &self.qop {
            write!(f, ", qop=\"{}\"", qop)?;
        }
        if self.stale {
            f.write_str(", stale=true")?;
        }
        Ok(())
    }
}

/// Parsed `Authorization: Digest ...` header
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl DigestCredentials {
    /// Parse the value of an Authorization header
    pub fn parse(header: &str) -> Result<Self> {
        let rest = header.trim();
        let rest = rest
            .strip_prefix("Digest")
            .or_else(|| rest.strip_prefix("digest"))
            .ok_or_else(|| RegistrarError::malformed("not a Digest authorization"))?;

        let params = split_params(rest)?;
        let take = |name: &str| params.get(name).cloned();
        let require = |name: &str| {
            take(name).ok_or_else(|| RegistrarError::malformed(format!("missing '{}' parameter", name)))
        };

        let creds = DigestCredentials {
            username: require("username")?,
            realm: require("realm")?,
            nonce: require("nonce")?,
            uri: require("uri")?,
            response: require("response")?,
            algorithm: take("algorithm"),
            qop: take("qop"),
            nc: take("nc"),
            cnonce: take("cnonce"),
        };

        if creds.qop.is_some() && (creds.nc.is_none() || creds.cnonce.is_none()) {
            return Err(RegistrarError::malformed("qop present without nc/cnonce"));
        }
        if let Some(alg) = &creds.algorithm {
            if !alg.eq_ignore_ascii_case("MD5") {
                return Err(RegistrarError::malformed(format!("unsupported algorithm {}", alg)));
            }
        }
        Ok(creds)
    }
}

/// Split `k1="v1", k2=v2` into a map, honoring quoted commas
fn split_params(input: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(RegistrarError::malformed(format!("parameter '{}' has no value", key.trim())));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => value.push(other),
                }
            }
            if !closed {
                return Err(RegistrarError::malformed("unterminated quoted value"));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok(params)
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// Compute the expected digest response
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    match (qop, cnonce) {
        (Some(qop), Some(cnonce)) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1,
            nonce,
            nc.unwrap_or(""),
            cnonce,
            qop,
            ha2
        )),
        _ => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

#[derive(Debug, Clone)]
struct NonceState {
    issued_at: DateTime<Utc>,
    last_nc: u32,
}

/// Issues nonces and verifies digest responses
pub struct DigestAuthenticator {
    realm: String,
    nonce_ttl: Duration,
    nonces: DashMap<String, NonceState>,
    clock: Arc<dyn Clock>,
}

impl DigestAuthenticator {
    pub fn new(realm: impl Into<String>, nonce_ttl_secs: u64) -> Self {
        Self::with_clock(realm, nonce_ttl_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(realm: impl Into<String>, nonce_ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            realm: realm.into(),
            nonce_ttl: Duration::seconds(nonce_ttl_secs.min(MAX_NONCE_TTL_SECS) as i64),
            nonces: DashMap::new(),
            clock,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Issue a fresh challenge
    pub fn challenge(&self, stale: bool) -> DigestChallenge {
        let nonce: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();

        self.nonces.insert(
            nonce.clone(),
            NonceState {
                issued_at: self.clock.now(),
                last_nc: 0,
            },
        );
        debug!("Issued digest nonce for realm {}", self.realm);

        DigestChallenge {
            realm: self.realm.clone(),
            nonce,
            algorithm: "MD5".to_string(),
            qop: Some("auth".to_string()),
            stale,
        }
    }

    /// Verify a REGISTER's credentials against the extension's secret.
    ///
    /// Every challenge offers `qop=auth`, so answers without a nonce-count
    /// are refused as malformed and the client is challenged again. The
    /// nonce-count only advances once the response hash matched.
    pub fn verify(&self, creds: &DigestCredentials, method: &str, password: &str) -> Result<()> {
        if creds.realm != self.realm {
            warn!("Digest realm mismatch for {}: {}", creds.username, creds.realm);
            return Err(RegistrarError::AuthenticationFailed(creds.username.clone()));
        }

        let now = self.clock.now();
        let issued_at = self
            .nonces
            .get(&creds.nonce)
            .map(|state| state.issued_at)
            .ok_or_else(|| RegistrarError::StaleNonce(creds.nonce.clone()))?;
        if now - issued_at > self.nonce_ttl {
            self.nonces.remove(&creds.nonce);
            return Err(RegistrarError::StaleNonce(creds.nonce.clone()));
        }

        let (nc, cnonce) = match (creds.qop.as_deref(), creds.nc.as_deref(), creds.cnonce.as_deref()) {
            (Some(qop), Some(nc), Some(cnonce)) if qop.eq_ignore_ascii_case("auth") => (nc, cnonce),
            _ => {
                warn!("Digest answer from {} without qop=auth", creds.username);
                return Err(RegistrarError::malformed("qop=auth with nc and cnonce is required"));
            }
        };
        let count = u32::from_str_radix(nc, 16)
            .map_err(|_| RegistrarError::malformed(format!("bad nonce count {}", nc)))?;

        let expected = digest_response(
            &creds.username,
            password,
            &creds.realm,
            method,
            &creds.uri,
            &creds.nonce,
            Some("auth"),
            Some(nc),
            Some(cnonce),
        );
        if !expected.eq_ignore_ascii_case(&creds.response) {
            warn!("Digest mismatch for {}", creds.username);
            return Err(RegistrarError::AuthenticationFailed(creds.username.clone()));
        }

        // purged between the lookup and here
        let mut state = self
            .nonces
            .get_mut(&creds.nonce)
            .ok_or_else(|| RegistrarError::StaleNonce(creds.nonce.clone()))?;
        if count <= state.last_nc {
            warn!("Replayed nonce count {} for {}", nc, creds.username);
            return Err(RegistrarError::AuthenticationFailed(creds.username.clone()));
        }
        state.last_nc = count;
        debug!("Digest verified for {}", creds.username);
        Ok(())
    }

    /// Drop nonces older than the TTL; returns how many were purged
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.nonces.len();
        self.nonces.retain(|_, state| now - state.issued_at <= self.nonce_ttl);
        before.saturating_sub(self.nonces.len())
    }

    pub fn outstanding_nonces(&self) -> usize {
        self.nonces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn answer(challenge: &DigestChallenge, password: &str, nc: &str) -> DigestCredentials {
        let uri = "sip:pbx.local";
        let cnonce = "0a4f113b";
        DigestCredentials {
            username: "100".to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response: digest_response(
                "100", password, &challenge.realm, "REGISTER", uri, &challenge.nonce,
                Some("auth"), Some(nc), Some(cnonce),
            ),
            algorithm: Some("MD5".to_string()),
            qop: Some("auth".to_string()),
            nc: Some(nc.to_string()),
            cnonce: Some(cnonce.to_string()),
        }
    }

    #[test]
    fn test_rfc2617_reference_vector() {
        // RFC 2617 §3.5
        let response = digest_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some("auth"),
            Some("00000001"),
            Some("0a4f113b"),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_parse_authorization_header() {
        let header = r#"Digest username="100", realm="pbx.local", nonce="abc,def", uri="sip:pbx.local", response="deadbeef", algorithm=MD5, qop=auth, nc=00000001, cnonce="xyz""#;
        let creds = DigestCredentials::parse(header).unwrap();
        assert_eq!(creds.username, "100");
        assert_eq!(creds.nonce, "abc,def");
        assert_eq!(creds.qop.as_deref(), Some("auth"));
        assert_eq!(creds.nc.as_deref(), Some("00000001"));
    }

    #[test]
    fn test_parse_rejects_incomplete_header() {
        assert!(DigestCredentials::parse("Basic dXNlcjpwYXNz").is_err());
        assert!(DigestCredentials::parse(r#"Digest username="100", realm="r""#).is_err());
        assert!(DigestCredentials::parse(
            r#"Digest username="1", realm="r", nonce="n", uri="u", response="x", qop=auth"#
        )
        .is_err());
    }

    #[test]
    fn test_challenge_header_format() {
        let auth = DigestAuthenticator::new("pbx.local", 300);
        let challenge = auth.challenge(true);
        let header = challenge.to_string();
        assert!(header.starts_with("Digest realm=\"pbx.local\", nonce=\""));
        assert!(header.ends_with("qop=\"auth\", stale=true"));
        assert_eq!(challenge.nonce.len(), NONCE_LEN);
    }

    #[test]
    fn test_verify_accepts_correct_password() {
        let auth = DigestAuthenticator::new("pbx.local", 300);
        let challenge = auth.challenge(false);
        let creds = answer(&challenge, "s3cret", "00000001");
        assert!(auth.verify(&creds, "REGISTER", "s3cret").is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_password() {
        let auth = DigestAuthenticator::new("pbx.local", 300);
        let challenge = auth.challenge(false);
        let creds = answer(&challenge, "guess", "00000001");
        assert_eq!(
            auth.verify(&creds, "REGISTER", "s3cret"),
            Err(RegistrarError::AuthenticationFailed("100".to_string()))
        );
    }

    #[test]
    fn test_unknown_or_expired_nonce_is_stale() {
        let clock = ManualClock::default();
        let auth = DigestAuthenticator::with_clock("pbx.local", 30, Arc::new(clock.clone()));
        let challenge = auth.challenge(false);
        let mut creds = answer(&challenge, "pw", "00000001");

        clock.advance(Duration::seconds(31));
        assert!(matches!(auth.verify(&creds, "REGISTER", "pw"), Err(RegistrarError::StaleNonce(_))));

        creds.nonce = "never-issued".to_string();
        let err = auth.verify(&creds, "REGISTER", "pw").unwrap_err();
        assert!(err.is_challengeable());
    }

    #[test]
    fn test_replayed_nonce_count_rejected() {
        let auth = DigestAuthenticator::new("pbx.local", 300);
        let challenge = auth.challenge(false);
        let creds = answer(&challenge, "pw", "00000001");
        assert!(auth.verify(&creds, "REGISTER", "pw").is_ok());
        assert!(auth.verify(&creds, "REGISTER", "pw").is_err());

        let next = answer(&challenge, "pw", "00000002");
        assert!(auth.verify(&next, "REGISTER", "pw").is_ok());
    }

    #[test]
    fn test_failed_answer_does_not_burn_nonce_count() {
        let auth = DigestAuthenticator::new("pbx.local", 300);
        let challenge = auth.challenge(false);

        let mut forged = answer(&challenge, "pw", "ffffffff");
        forged.response = "00000000000000000000000000000000".to_string();
        assert_eq!(
            auth.verify(&forged, "REGISTER", "pw"),
            Err(RegistrarError::AuthenticationFailed("100".to_string()))
        );

        let genuine = answer(&challenge, "pw", "00000001");
        assert!(auth.verify(&genuine, "REGISTER", "pw").is_ok());
    }

    #[test]
    fn test_answer_without_qop_is_refused() {
        let auth = DigestAuthenticator::new("pbx.local", 300);
        let challenge = auth.challenge(false);
        let uri = "sip:pbx.local";
        let creds = DigestCredentials {
            username: "100".to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response: digest_response("100", "pw", &challenge.realm, "REGISTER", uri, &challenge.nonce, None, None, None),
            ..Default::default()
        };

        for _ in 0..3 {
            let err = auth.verify(&creds, "REGISTER", "pw").unwrap_err();
            assert!(matches!(err, RegistrarError::MalformedCredentials(_)));
        }
    }

    #[test]
    fn test_purge_expired_nonces() {
        let clock = ManualClock::default();
        let auth = DigestAuthenticator::with_clock("pbx.local", 60, Arc::new(clock.clone()));
        auth.challenge(false);
        clock.advance(Duration::seconds(30));
        auth.challenge(false);
        clock.advance(Duration::seconds(40));

        assert_eq!(auth.purge_expired(), 1);
        assert_eq!(auth.outstanding_nonces(), 1);
    }
}
