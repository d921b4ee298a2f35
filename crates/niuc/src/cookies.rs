//! Cookie jar shared by the request pipeline and session store.
//!
//! A jar plays the role of one execution context's cookie view: the
//! interactive client keeps a single jar persisted as TOML, while a server
//! handling many inbound requests builds one jar per request from its
//! `Cookie` header. Cookies set during a request are also queued as
//! outgoing `Set-Cookie` lines so an enclosing server response can forward
//! them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// A single cookie with the attributes the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Absolute expiry, Unix seconds. `None` for session cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Path attribute.
    #[serde(default = "default_path")]
    pub path: String,
    /// `HttpOnly` attribute.
    #[serde(default)]
    pub http_only: bool,
    /// `Secure` attribute.
    #[serde(default)]
    pub secure: bool,
    /// `SameSite` attribute, lower-case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

impl Cookie {
    /// A root-path cookie with no expiry.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires_at: None,
            path: default_path(),
            http_only: false,
            secure: false,
            same_site: None,
        }
    }

    /// Sets the expiry to `seconds` from now.
    #[must_use]
    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.expires_at = Some(Utc::now().timestamp().saturating_add(seconds));
        self
    }

    /// Marks the cookie `HttpOnly`.
    #[must_use]
    pub const fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    /// Sets the `SameSite` attribute.
    #[must_use]
    pub fn same_site(mut self, mode: &str) -> Self {
        self.same_site = Some(mode.to_ascii_lowercase());
        self
    }

    /// True once the expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at <= Utc::now().timestamp())
    }

    /// Parses one `Set-Cookie` header value.
    ///
    /// Attribute names are matched case-insensitively. `Max-Age` wins over
    /// `Expires`. Returns `None` when the leading `name=value` is missing.
    ///
    /// # Examples
    ///
    /// ```
    /// use niuc::cookies::Cookie;
    ///
    /// let c = Cookie::parse_set_cookie("access_token=abc; Path=/; HttpOnly; Max-Age=60").unwrap();
    /// assert_eq!((c.name.as_str(), c.value.as_str()), ("access_token", "abc"));
    /// assert!(c.http_only);
    /// assert!(c.expires_at.is_some());
    /// ```
    #[must_use]
    pub fn parse_set_cookie(line: &str) -> Option<Self> {
        let mut parts = line.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let mut cookie = Self::new(name, value.trim().trim_matches('"'));
        let mut max_age: Option<i64> = None;
        let mut expires: Option<i64> = None;

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim())),
                None => (attr.trim().to_ascii_lowercase(), None),
            };
            match (key.as_str(), val) {
                ("max-age", Some(v)) => max_age = v.parse().ok(),
                ("expires", Some(v)) => {
                    expires = DateTime::parse_from_rfc2822(v)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc).timestamp());
                }
                ("path", Some(v)) if !v.is_empty() => cookie.path = v.to_string(),
                ("httponly", _) => cookie.http_only = true,
                ("secure", _) => cookie.secure = true,
                ("samesite", Some(v)) => cookie.same_site = Some(v.to_ascii_lowercase()),
                _ => {}
            }
        }

        cookie.expires_at = match (max_age, expires) {
            (Some(age), _) => Some(Utc::now().timestamp().saturating_add(age)),
            (None, at) => at,
        };
        Some(cookie)
    }

    /// Renders the cookie as a `Set-Cookie` header value.
    #[must_use]
    pub fn to_set_cookie(&self) -> String {
        let mut out = format!("{}={}; Path={}", self.name, self.value, self.path);
        if let Some(at) = self.expires_at {
            let remaining = (at - Utc::now().timestamp()).max(0);
            out.push_str(&format!("; Max-Age={remaining}"));
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if let Some(mode) = &self.same_site {
            out.push_str(&format!("; SameSite={mode}"));
        }
        out
    }
}

/// On-disk format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JarFile {
    #[serde(default)]
    cookies: Vec<Cookie>,
}

#[derive(Debug, Default)]
struct Inner {
    cookies: BTreeMap<String, Cookie>,
    outgoing: Vec<Cookie>,
}

/// Thread-safe cookie store, optionally backed by a TOML file.
#[derive(Debug, Default)]
pub struct CookieJar {
    inner: RwLock<Inner>,
    path: Option<PathBuf>,
}

impl CookieJar {
    /// An empty in-memory jar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a jar from an inbound `Cookie` request header.
    ///
    /// # Examples
    ///
    /// ```
    /// use niuc::cookies::CookieJar;
    ///
    /// let jar = CookieJar::from_header("sid=abc; refresh_token=r1");
    /// assert_eq!(jar.get("refresh_token").as_deref(), Some("r1"));
    /// ```
    #[must_use]
    pub fn from_header(header: &str) -> Self {
        let cookies = parse_cookie_header(header)
            .into_iter()
            .map(|(name, value)| (name.clone(), Cookie::new(name, value)))
            .collect();
        Self {
            inner: RwLock::new(Inner {
                cookies,
                outgoing: Vec::new(),
            }),
            path: None,
        }
    }

    /// Loads a jar from a TOML file, starting empty when it does not exist.
    /// Expired cookies are dropped on load.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let file = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            toml::from_str::<JarFile>(&contents)?
        } else {
            JarFile::default()
        };
        let cookies = file
            .cookies
            .into_iter()
            .filter(|c| !c.is_expired())
            .map(|c| (c.name.clone(), c))
            .collect();
        Ok(Self {
            inner: RwLock::new(Inner {
                cookies,
                outgoing: Vec::new(),
            }),
            path: Some(path),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("cookie jar lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("cookie jar lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }

    /// Current value of a non-expired cookie.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.read()
            .cookies
            .get(name)
            .filter(|c| !c.is_expired())
            .map(|c| c.value.clone())
    }

    /// Stores a cookie and queues it for the outgoing response. An expired
    /// cookie removes any stored cookie of the same name.
    pub fn set(&self, cookie: Cookie) {
        let mut inner = self.write();
        if cookie.is_expired() {
            inner.cookies.remove(&cookie.name);
        } else {
            inner.cookies.insert(cookie.name.clone(), cookie.clone());
        }
        inner.outgoing.retain(|c| c.name != cookie.name);
        inner.outgoing.push(cookie);
        self.save_locked(&inner);
    }

    /// Deletes a cookie, queueing an expiring `Set-Cookie` for it.
    pub fn remove(&self, name: &str) {
        let mut expired = Cookie::new(name, "");
        expired.expires_at = Some(0);
        self.set(expired);
    }

    /// Applies every `Set-Cookie` line from a response. Returns how many
    /// lines parsed.
    pub fn apply_set_cookies<'a, I>(&self, lines: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut applied = 0;
        for line in lines {
            match Cookie::parse_set_cookie(line) {
                Some(cookie) => {
                    debug!(name = %cookie.name, "applying set-cookie");
                    self.set(cookie);
                    applied += 1;
                }
                None => warn!("ignoring malformed set-cookie line"),
            }
        }
        applied
    }

    /// Renders the jar as a `Cookie` request header value.
    #[must_use]
    pub fn header_value(&self) -> String {
        self.read()
            .cookies
            .values()
            .filter(|c| !c.is_expired())
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Drains cookies set since the last call, for forwarding as
    /// `Set-Cookie` lines.
    pub fn take_outgoing(&self) -> Vec<Cookie> {
        std::mem::take(&mut self.write().outgoing)
    }

    fn save_locked(&self, inner: &Inner) {
        let Some(path) = &self.path else {
            return;
        };
        let file = JarFile {
            cookies: inner.cookies.values().cloned().collect(),
        };
        let result = toml::to_string_pretty(&file)
            .map_err(anyhow::Error::from)
            .and_then(|contents| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, contents)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "failed to persist cookie jar");
        }
    }
}

/// Splits a `Cookie` request header into name/value pairs.
#[must_use]
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn set_cookie_parsing_never_panics(line in ".{0,200}") {
            let _ = Cookie::parse_set_cookie(&line);
        }

        #[test]
        fn jar_header_keeps_every_pair(
            pairs in prop::collection::btree_map("[a-z_]{1,12}", "[A-Za-z0-9]{0,16}", 0..8),
        ) {
            let header = pairs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            let jar = CookieJar::from_header(&header);
            for (name, value) in &pairs {
                let got = jar.get(name);
                prop_assert_eq!(got.as_deref(), Some(value.as_str()));
            }
            prop_assert_eq!(parse_cookie_header(&jar.header_value()).len(), pairs.len());
        }
    }
}
