//! Per-client session keys kept in cookies.
//!
//! `sid` holds the obfuscated signing and box public keys and doubles as
//! the session id sent with every request; `cid` holds the matching private
//! keys. Both are created lazily and regenerated whenever they fail to
//! decode or disagree with each other.

use ed25519_dalek::SigningKey;
use niu_common::crypto::{self, BoxKeyPair};
use niu_common::secure_string::{decode_secure_string, encode_secure_string};
use niu_common::types::cookie;
use tracing::{debug, info};

use crate::cookies::{Cookie, CookieJar};
use crate::error::SessionError;

/// Lifetime of the `cli` client-id cookie.
pub const CLIENT_ID_MAX_AGE_S: i64 = 60 * 60 * 24 * 60;

/// Key material for one session.
#[derive(Clone)]
pub struct SessionSecrets {
    /// Ed25519 key signing requests.
    pub sign: SigningKey,
    /// X25519 key sealing bodies.
    pub boxed: BoxKeyPair,
    /// Value of the `sid` cookie, sent as `x-session`.
    pub session_id: String,
}

impl std::fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSecrets")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SessionSecrets {
    /// Fresh random keys.
    #[must_use]
    pub fn generate() -> Self {
        let sign = crypto::generate_sign_keypair();
        let boxed = crypto::generate_box_keypair();
        let session_id =
            encode_secure_string(&sign.verifying_key().to_bytes(), &boxed.public_bytes());
        Self {
            sign,
            boxed,
            session_id,
        }
    }

    /// `cid` cookie value for these keys.
    #[must_use]
    pub fn client_key(&self) -> String {
        encode_secure_string(&self.sign.to_bytes(), &self.boxed.secret_bytes())
    }
}

/// Reads and maintains session cookies.
#[derive(Debug, Clone)]
pub struct SessionStore {
    max_age_s: i64,
}

impl SessionStore {
    /// Store writing cookies that live `max_age_s` seconds.
    #[must_use]
    pub fn new(max_age_s: u64) -> Self {
        Self {
            max_age_s: i64::try_from(max_age_s).unwrap_or(i64::MAX),
        }
    }

    /// Decodes the session from `jar` without modifying it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if either cookie is absent, does not decode
    /// to 88 bytes, or the public keys do not derive from the private keys.
    pub fn load(&self, jar: &CookieJar) -> Result<SessionSecrets, SessionError> {
        let session_id = jar
            .get(cookie::SESSION_ID)
            .ok_or(SessionError::Missing(cookie::SESSION_ID))?;
        let client_key = jar
            .get(cookie::CLIENT_KEY)
            .ok_or(SessionError::Missing(cookie::CLIENT_KEY))?;
        let (sign_pub, box_pub) = decode_secure_string(&session_id)
            .ok_or(SessionError::Malformed(cookie::SESSION_ID))?;
        let (sign_priv, box_priv) = decode_secure_string(&client_key)
            .ok_or(SessionError::Malformed(cookie::CLIENT_KEY))?;

        let sign = SigningKey::from_bytes(&sign_priv);
        let boxed = BoxKeyPair::from_secret_bytes(box_priv);
        if sign.verifying_key().to_bytes() != sign_pub || boxed.public_bytes() != box_pub {
            return Err(SessionError::Mismatch);
        }
        Ok(SessionSecrets {
            sign,
            boxed,
            session_id,
        })
    }

    /// Returns the session in `jar`, generating and storing a new one when
    /// it is absent or invalid.
    pub fn ensure(&self, jar: &CookieJar) -> SessionSecrets {
        match self.load(jar) {
            Ok(secrets) => secrets,
            Err(reason) => {
                debug!(%reason, "generating new session keys");
                let secrets = SessionSecrets::generate();
                self.store(jar, &secrets);
                info!(session = %short(&secrets.session_id), "session keys created");
                secrets
            }
        }
    }

    /// Writes both session cookies.
    pub fn store(&self, jar: &CookieJar, secrets: &SessionSecrets) {
        jar.set(
            Cookie::new(cookie::SESSION_ID, secrets.session_id.clone())
                .with_max_age(self.max_age_s)
                .same_site("lax"),
        );
        jar.set(
            Cookie::new(cookie::CLIENT_KEY, secrets.client_key())
                .with_max_age(self.max_age_s)
                .same_site("lax"),
        );
    }

    /// Drops both session cookies.
    pub fn clear(jar: &CookieJar) {
        jar.remove(cookie::SESSION_ID);
        jar.remove(cookie::CLIENT_KEY);
    }
}

/// Sets the `pla` cookie and makes sure a 32-hex `cli` client id exists.
/// Returns the client id.
pub fn ensure_client_id(jar: &CookieJar, platform: &str) -> String {
    jar.set(
        Cookie::new(cookie::PLATFORM, platform)
            .http_only()
            .same_site("strict"),
    );
    match jar.get(cookie::CLIENT_ID) {
        Some(id) if id.len() == 32 => id,
        _ => {
            let id = crypto::generate_nonce();
            jar.set(
                Cookie::new(cookie::CLIENT_ID, id.clone())
                    .with_max_age(CLIENT_ID_MAX_AGE_S)
                    .http_only()
                    .same_site("strict"),
            );
            id
        }
    }
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(3600)
    }

    #[test]
    fn test_ensure_creates_and_persists() {
        let jar = CookieJar::new();
        let first = store().ensure(&jar);
        assert!(jar.get(cookie::SESSION_ID).is_some());
        assert!(jar.get(cookie::CLIENT_KEY).is_some());

        let second = store().ensure(&jar);
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.sign.to_bytes(), second.sign.to_bytes());
        assert_eq!(first.boxed.public_bytes(), second.boxed.public_bytes());
    }

    #[test]
    fn test_load_reports_missing() {
        assert_eq!(
            store().load(&CookieJar::new()).unwrap_err(),
            SessionError::Missing("sid")
        );
    }

    #[test]
    fn test_malformed_cookie_regenerates() {
        let jar = CookieJar::from_header("sid=short; cid=short");
        assert_eq!(
            store().load(&jar).unwrap_err(),
            SessionError::Malformed("sid")
        );
        let secrets = store().ensure(&jar);
        assert_ne!(secrets.session_id, "short");
        assert!(store().load(&jar).is_ok());
    }

    #[test]
    fn test_mismatched_halves_are_rejected() {
        let a = SessionSecrets::generate();
        let b = SessionSecrets::generate();
        let jar = CookieJar::new();
        jar.set(Cookie::new(cookie::SESSION_ID, a.session_id.clone()));
        jar.set(Cookie::new(cookie::CLIENT_KEY, b.client_key()));
        assert_eq!(store().load(&jar).unwrap_err(), SessionError::Mismatch);
    }

    #[test]
    fn test_session_id_decodes_to_public_keys() {
        let s = SessionSecrets::generate();
        let (sign_pub, box_pub) = decode_secure_string(&s.session_id).unwrap();
        assert_eq!(sign_pub, s.sign.verifying_key().to_bytes());
        assert_eq!(box_pub, s.boxed.public_bytes());
    }

    #[test]
    fn test_clear_removes_both() {
        let jar = CookieJar::new();
        store().ensure(&jar);
        SessionStore::clear(&jar);
        assert!(jar.get(cookie::SESSION_ID).is_none());
        assert!(jar.get(cookie::CLIENT_KEY).is_none());
    }

    #[test]
    fn test_client_id_is_kept_when_valid() {
        let jar = CookieJar::new();
        let id = ensure_client_id(&jar, "8");
        assert_eq!(id.len(), 32);
        assert_eq!(ensure_client_id(&jar, "8"), id);
        assert_eq!(jar.get(cookie::PLATFORM).as_deref(), Some("8"));
    }

    #[test]
    fn test_client_id_replaced_when_wrong_length() {
        let jar = CookieJar::from_header("cli=abc");
        let id = ensure_client_id(&jar, "8");
        assert_ne!(id, "abc");
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn test_debug_hides_keys() {
        let s = SessionSecrets::generate();
        let shown = format!("{s:?}");
        assert!(shown.contains(&s.session_id));
        assert!(!shown.contains("sign:"));
    }
}
