use serde::{Deserialize, Serialize};

use crate::config::CookieConfig;
use crate::cookies::{Cookie, CookieJar};

/// Access and refresh tokens as issued by login and refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Short-lived bearer token.
    pub access_token: String,
    /// Long-lived token used to renew the access token.
    pub refresh_token: String,
}

/// Reads token cookies by their configured names.
#[derive(Debug, Clone)]
pub struct Tokens {
    access: String,
    refresh: String,
    max_age_s: i64,
}

impl Tokens {
    /// Token helper for the configured cookie names.
    #[must_use]
    pub fn new(config: &CookieConfig) -> Self {
        Self {
            access: config.access_token.clone(),
            refresh: config.refresh_token.clone(),
            max_age_s: i64::try_from(config.max_age_s).unwrap_or(i64::MAX),
        }
    }

    /// Access token cookie name.
    #[must_use]
    pub fn access_name(&self) -> &str {
        &self.access
    }

    /// Current non-empty access token.
    #[must_use]
    pub fn access_token(&self, jar: &CookieJar) -> Option<String> {
        jar.get(&self.access).filter(|t| !t.is_empty())
    }

    /// Current non-empty refresh token.
    #[must_use]
    pub fn refresh_token(&self, jar: &CookieJar) -> Option<String> {
        jar.get(&self.refresh).filter(|t| !t.is_empty())
    }

    /// Access cookie for `token`.
    #[must_use]
    pub fn access_cookie(&self, token: &str) -> Cookie {
        Cookie::new(self.access.clone(), token)
            .with_max_age(self.max_age_s)
            .same_site("lax")
    }

    /// Writes any token of `pair` the jar does not already hold with the
    /// same value. Returns the cookies written.
    pub fn store(&self, jar: &CookieJar, pair: &TokenPair) -> Vec<Cookie> {
        let refresh = Cookie::new(self.refresh.clone(), pair.refresh_token.as_str())
            .with_max_age(self.max_age_s)
            .http_only()
            .same_site("lax");
        let mut written = Vec::new();
        for cookie in [self.access_cookie(&pair.access_token), refresh] {
            if cookie.value.is_empty() || jar.get(&cookie.name).as_deref() == Some(&cookie.value) {
                continue;
            }
            jar.set(cookie.clone());
            written.push(cookie);
        }
        written
    }

    /// Removes both token cookies.
    pub fn clear(&self, jar: &CookieJar) {
        jar.remove(&self.access);
        jar.remove(&self.refresh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_configured_names() {
        let config = CookieConfig {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            max_age_s: 60,
        };
        let tokens = Tokens::new(&config);
        let jar = CookieJar::from_header("at=a1; rt=r1; access_token=ignored");
        assert_eq!(tokens.access_token(&jar).as_deref(), Some("a1"));
        assert_eq!(tokens.refresh_token(&jar).as_deref(), Some("r1"));
    }

    #[test]
    fn test_empty_token_counts_as_absent() {
        let tokens = Tokens::new(&CookieConfig::default());
        let jar = CookieJar::from_header("access_token=; refresh_token=r");
        assert_eq!(tokens.access_token(&jar), None);
        assert!(tokens.refresh_token(&jar).is_some());
    }

    #[test]
    fn test_store_skips_unchanged_tokens() {
        let tokens = Tokens::new(&CookieConfig::default());
        let jar = CookieJar::from_header("access_token=a");
        let pair = TokenPair {
            access_token: "a".into(),
            refresh_token: "r".into(),
        };
        let written = tokens.store(&jar, &pair);
        assert_eq!(written.len(), 1);
        assert!(written[0].http_only);
        assert_eq!(tokens.refresh_token(&jar).as_deref(), Some("r"));
    }

    #[test]
    fn test_clear_removes_both() {
        let tokens = Tokens::new(&CookieConfig::default());
        let jar = CookieJar::from_header("access_token=a; refresh_token=r");
        tokens.clear(&jar);
        assert_eq!(tokens.access_token(&jar), None);
        assert_eq!(tokens.refresh_token(&jar), None);
        assert_eq!(jar.take_outgoing().len(), 2);
    }
}
