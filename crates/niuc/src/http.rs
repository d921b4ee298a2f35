//! Signed and sealed HTTP request pipeline.
//!
//! Every request is signed with the session's Ed25519 key over a canonical
//! string of `{session, nonce, timestamp, platform, method, path, query}`
//! plus the exact wire `body` for POST/PUT. Bodies are sealed when
//! encryption is on. Responses must carry a valid server signature over
//! the same fields and their raw body before anything is decrypted or
//! parsed.
//!
//! A 401 triggers one shared token refresh (see [`crate::refresh`]) and a
//! single retry with the refreshed cookies passed explicitly. 5xx responses
//! are retried with a linear backoff.

use ed25519_dalek::VerifyingKey;
use futures_util::FutureExt;
use niu_common::canonical::{canonicalize, SignPayload};
use niu_common::crypto::{self, BoxCrypter};
use niu_common::types::{content_type, header};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey as X25519Public;

use crate::config::{ClientConfig, RetryConfig};
use crate::cookies::{parse_cookie_header, Cookie, CookieJar};
use crate::error::HttpError;
use crate::refresh::{RefreshOutcome, RefreshSlot};
use crate::retry::{LinearRetryStrategy, RetryStrategy};
use crate::session::{SessionSecrets, SessionStore};
use crate::tokens::Tokens;

/// Receives the login location when authorization cannot be recovered.
pub trait LoginRedirect: Send + Sync {
    /// Called with `"{login_path}?redirect={encoded current path}"`.
    fn redirect(&self, login_url: &str);
}

/// Logs the redirect target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRedirect;

impl LoginRedirect for LogRedirect {
    fn redirect(&self, login_url: &str) {
        warn!(login_url, "login required");
    }
}

/// How the response body is handed back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseType {
    /// Parse as JSON.
    #[default]
    Json,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Bytes,
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Key for [`crate::async_data::AsyncDataCache`].
    pub cache_key: Option<String>,
    /// Aborts the call when cancelled.
    pub cancel: Option<CancellationToken>,
    /// Body decoding mode.
    pub response_type: ResponseType,
    /// `Cookie` header to send instead of the context jar's.
    pub cookie_override: Option<String>,
    /// Per-attempt timeout; the configured one when `None`.
    pub timeout: Option<Duration>,
    /// Attempt token refresh on 401.
    pub auto_handle_401: bool,
    /// Path to return to after login; the request path when `None`.
    pub current_path: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            cache_key: None,
            cancel: None,
            response_type: ResponseType::Json,
            cookie_override: None,
            timeout: None,
            auto_handle_401: true,
            current_path: None,
        }
    }
}

impl RequestOptions {
    /// Options with a cancellation token.
    #[must_use]
    pub fn cancellable(token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..Self::default()
        }
    }
}

/// One execution context: the cookie view a request reads and writes.
///
/// An interactive client shares one context; a server builds one per
/// inbound request so sessions never leak between requests.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    jar: Arc<CookieJar>,
}

impl RequestContext {
    /// Context over an existing jar.
    #[must_use]
    pub const fn new(jar: Arc<CookieJar>) -> Self {
        Self { jar }
    }

    /// Context for an inbound request's `Cookie` header.
    #[must_use]
    pub fn from_cookie_header(header: &str) -> Self {
        Self::new(Arc::new(CookieJar::from_header(header)))
    }

    /// The context's cookie jar.
    #[must_use]
    pub fn jar(&self) -> &CookieJar {
        &self.jar
    }

    /// `Set-Cookie` lines to forward on the enclosing response.
    #[must_use]
    pub fn outgoing_set_cookies(&self) -> Vec<String> {
        self.jar
            .take_outgoing()
            .iter()
            .map(Cookie::to_set_cookie)
            .collect()
    }
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Parsed JSON.
    Json(Value),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// A verified, decrypted response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status (always 200).
    pub status: u16,
    /// Content type after decryption.
    pub content_type: String,
    /// Decoded body.
    pub body: Body,
    /// Cookies the response set on the context.
    pub set_cookies: Vec<Cookie>,
}

impl HttpResponse {
    /// Deserializes the body into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::MalformedResponse`] if the body is not a `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        let parsed = match &self.body {
            Body::Json(v) => serde_json::from_value(v.clone()),
            Body::Text(s) => serde_json::from_str(s),
            Body::Bytes(b) => serde_json::from_slice(b),
        };
        parsed.map_err(|e| HttpError::MalformedResponse(e.to_string()))
    }
}

/// Signed HTTP client. Cheap to clone.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    base_url: String,
    platform: String,
    encryption: bool,
    timeout: Duration,
    refresh_path: String,
    login_path: String,
    retry: RetryConfig,
    server_sign: VerifyingKey,
    server_box: Option<X25519Public>,
    sessions: SessionStore,
    tokens: Tokens,
    create_sessions: bool,
    refresh: Arc<RefreshSlot>,
    redirect: Arc<dyn LoginRedirect>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.inner.base_url)
            .field("encryption", &self.inner.encryption)
            .finish_non_exhaustive()
    }
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
    config: ClientConfig,
    redirect: Arc<dyn LoginRedirect>,
    create_sessions: bool,
}

impl HttpClientBuilder {
    /// Sets the login redirect handler.
    #[must_use]
    pub fn redirect(mut self, redirect: Arc<dyn LoginRedirect>) -> Self {
        self.redirect = redirect;
        self
    }

    /// When false, requests fail with `SecretsUnavailable` instead of
    /// creating session keys in a context that has none.
    #[must_use]
    pub const fn create_sessions(mut self, create: bool) -> Self {
        self.create_sessions = create;
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidRequest`] if the server keys are missing
    /// or malformed, or [`HttpError::Transport`] if the HTTP client cannot
    /// be created.
    pub fn build(self) -> Result<HttpClient, HttpError> {
        let api = &self.config.api;
        if api.server_sign_key.is_empty() {
            return Err(HttpError::InvalidRequest(
                "api.server_sign_key is not set".to_string(),
            ));
        }
        let server_sign = crypto::verifying_key_from_base64(&api.server_sign_key)
            .map_err(|e| HttpError::InvalidRequest(format!("api.server_sign_key: {e}")))?;
        let server_box = if api.server_box_key.is_empty() {
            None
        } else {
            Some(
                crypto::box_public_from_base64(&api.server_box_key)
                    .map_err(|e| HttpError::InvalidRequest(format!("api.server_box_key: {e}")))?,
            )
        };
        let http = reqwest::Client::builder().build()?;

        Ok(HttpClient {
            inner: Arc::new(Inner {
                http,
                base_url: api.base_url.trim_end_matches('/').to_string(),
                platform: api.platform.clone(),
                encryption: api.encryption,
                timeout: api.timeout(),
                refresh_path: api.refresh_path.clone(),
                login_path: api.login_path.clone(),
                retry: self.config.retry.clone(),
                server_sign,
                server_box,
                sessions: SessionStore::new(self.config.cookies.max_age_s),
                tokens: Tokens::new(&self.config.cookies),
                create_sessions: self.create_sessions,
                refresh: RefreshSlot::new(api.refresh_hold()),
                redirect: self.redirect,
            }),
        })
    }
}

/// Per-attempt inputs that stay fixed across 5xx retries.
struct Prepared<'a> {
    method: &'a Method,
    path: &'a str,
    query: String,
    query_pairs: Vec<(String, String)>,
    wire_body: Option<String>,
    encrypted: bool,
    bearer: Option<String>,
}

impl HttpClient {
    /// Starts a builder from the loaded configuration.
    #[must_use]
    pub fn builder(config: &ClientConfig) -> HttpClientBuilder {
        HttpClientBuilder {
            config: config.clone(),
            redirect: Arc::new(LogRedirect),
            create_sessions: true,
        }
    }

    /// Client with default options.
    ///
    /// # Errors
    ///
    /// See [`HttpClientBuilder::build`].
    pub fn new(config: &ClientConfig) -> Result<Self, HttpError> {
        Self::builder(config).build()
    }

    /// Token cookie helper.
    #[must_use]
    pub fn tokens(&self) -> &Tokens {
        &self.inner.tokens
    }

    /// Session store.
    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    /// Number of token refreshes started by this client.
    #[must_use]
    pub fn refreshes_started(&self) -> u64 {
        self.inner.refresh.started()
    }

    /// Issues a signed request.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError`]; see the variants for when each occurs.
    /// [`HttpError::Cancelled`] is returned if `options.cancel` fires.
    pub async fn request(
        &self,
        ctx: &RequestContext,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: Option<&Value>,
        options: RequestOptions,
    ) -> Result<HttpResponse, HttpError> {
        let result = self
            .send_with_retry(ctx, &method, path, body, query, &options, None)
            .await;
        match result {
            Err(HttpError::Status { status: 401, body: unauthorized_body })
                if options.auto_handle_401 =>
            {
                self.recover_unauthorized(ctx, method, path, body, query, options, unauthorized_body)
                    .await
            }
            Err(HttpError::Cancelled) => {
                debug!(%method, path, "request cancelled");
                Err(HttpError::Cancelled)
            }
            Err(HttpError::Status { status: 401, .. }) => Err(HttpError::Unauthorized {
                login_url: self.login_url(options.current_path.as_deref().unwrap_or(path)),
            }),
            other => other,
        }
    }

    /// Signed GET returning a typed body.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::request`].
    pub async fn get<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        path: &str,
        query: Option<&Value>,
        options: RequestOptions,
    ) -> Result<T, HttpError> {
        self.request(ctx, Method::GET, path, None, query, options)
            .await?
            .json()
    }

    /// Signed POST with a sealed body.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::request`].
    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: Option<&B>,
        query: Option<&Value>,
        options: RequestOptions,
    ) -> Result<T, HttpError> {
        let body = to_value(body)?;
        self.request(ctx, Method::POST, path, body.as_ref(), query, options)
            .await?
            .json()
    }

    /// Signed PUT with a sealed body.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::request`].
    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: Option<&B>,
        query: Option<&Value>,
        options: RequestOptions,
    ) -> Result<T, HttpError> {
        let body = to_value(body)?;
        self.request(ctx, Method::PUT, path, body.as_ref(), query, options)
            .await?
            .json()
    }

    /// Signed DELETE.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::request`].
    pub async fn delete<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        path: &str,
        query: Option<&Value>,
        options: RequestOptions,
    ) -> Result<T, HttpError> {
        self.request(ctx, Method::DELETE, path, None, query, options)
            .await?
            .json()
    }

    fn login_url(&self, current_path: &str) -> String {
        format!(
            "{}?redirect={}",
            self.inner.login_path,
            urlencoding::encode(current_path)
        )
    }

    fn unauthorized(&self, current_path: &str) -> HttpError {
        let login_url = self.login_url(current_path);
        self.inner.redirect.redirect(&login_url);
        HttpError::Unauthorized { login_url }
    }

    fn secrets(&self, jar: &CookieJar) -> Result<SessionSecrets, HttpError> {
        if self.inner.create_sessions {
            Ok(self.inner.sessions.ensure(jar))
        } else {
            Ok(self.inner.sessions.load(jar)?)
        }
    }

    fn crypter(&self, secrets: &SessionSecrets) -> BoxCrypter {
        let peer = self.inner.server_box.unwrap_or(secrets.boxed.public);
        BoxCrypter::new(&secrets.boxed.secret, &peer)
    }

    #[allow(clippy::too_many_arguments)]
    async fn recover_unauthorized(
        &self,
        ctx: &RequestContext,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: Option<&Value>,
        options: RequestOptions,
        unauthorized_body: String,
    ) -> Result<HttpResponse, HttpError> {
        let current_path = options.current_path.clone().unwrap_or_else(|| path.to_string());
        let Some(refresh_token) = self.inner.tokens.refresh_token(ctx.jar()) else {
            info!(path, "401 without refresh token");
            return Err(self.unauthorized(&current_path));
        };

        let key = refresh_token.clone();
        let task = self.inner.refresh.join_or_start(&key, || {
            let client = self.clone();
            let ctx = ctx.clone();
            async move { client.run_refresh(&ctx, refresh_token).await }.boxed()
        });
        let cancel = options.cancel.clone().unwrap_or_default();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(HttpError::Cancelled),
            outcome = task => outcome,
        };

        match outcome {
            RefreshOutcome::Refreshed(cookies) => {
                for cookie in cookies {
                    ctx.jar().set(cookie);
                }
                let retry_options = RequestOptions {
                    cookie_override: Some(ctx.jar().header_value()),
                    auto_handle_401: false,
                    ..options
                };
                debug!(%method, path, "retrying after token refresh");
                match self
                    .send_with_retry(ctx, &method, path, body, query, &retry_options, None)
                    .await
                {
                    Err(HttpError::Status { status: 401, .. }) => {
                        Err(self.unauthorized(&current_path))
                    }
                    other => other,
                }
            }
            RefreshOutcome::Rejected => Err(self.unauthorized(&current_path)),
            RefreshOutcome::Failed(reason) => {
                warn!(%reason, "token refresh failed");
                Err(HttpError::Status {
                    status: 401,
                    body: unauthorized_body,
                })
            }
        }
    }

    async fn run_refresh(&self, ctx: &RequestContext, refresh_token: String) -> RefreshOutcome {
        info!(path = %self.inner.refresh_path, "refreshing access token");
        let options = RequestOptions {
            auto_handle_401: false,
            ..RequestOptions::default()
        };
        let result = self
            .send_with_retry(
                ctx,
                &Method::POST,
                &self.inner.refresh_path,
                None,
                None,
                &options,
                Some(refresh_token),
            )
            .await;
        match result {
            Ok(resp) => {
                let mut cookies = resp.set_cookies.clone();
                if let Some(tokens) = tokens_in_body(&resp) {
                    let access = self.inner.tokens.access_name();
                    if !cookies.iter().any(|c| c.name == access) {
                        let cookie = self.inner.tokens.access_cookie(&tokens.access_token);
                        ctx.jar().set(cookie.clone());
                        cookies.push(cookie);
                    }
                }
                info!(cookies = cookies.len(), "access token refreshed");
                RefreshOutcome::Refreshed(cookies)
            }
            Err(HttpError::Status { status: 401, .. }) => RefreshOutcome::Rejected,
            Err(e) => RefreshOutcome::Failed(e.to_string()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_with_retry(
        &self,
        ctx: &RequestContext,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        query: Option<&Value>,
        options: &RequestOptions,
        bearer: Option<String>,
    ) -> Result<HttpResponse, HttpError> {
        let secrets = self.secrets(ctx.jar())?;
        let cookie_header = options
            .cookie_override
            .clone()
            .unwrap_or_else(|| ctx.jar().header_value());
        let bearer = bearer.or_else(|| {
            parse_cookie_header(&cookie_header)
                .into_iter()
                .find(|(name, value)| name == self.inner.tokens.access_name() && !value.is_empty())
                .map(|(_, value)| value)
        });
        let (wire_body, encrypted) = self.prepare_body(method, body, &secrets)?;
        let prepared = Prepared {
            method,
            path,
            query: query.map(canonicalize).unwrap_or_default(),
            query_pairs: query.map(query_pairs).unwrap_or_default(),
            wire_body,
            encrypted,
            bearer,
        };
        let cancel = options.cancel.clone().unwrap_or_default();

        let mut retry = LinearRetryStrategy::new(
            Duration::from_millis(self.inner.retry.base_delay_ms),
            self.inner.retry.max_retries,
        );
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = self
                .attempt(ctx, &secrets, &prepared, &cookie_header, options, &cancel)
                .await;
            match result {
                Err(HttpError::Status { status, .. }) if (500..600).contains(&status) => {
                    let Some(delay) = retry.next() else {
                        warn!(%method, path, status, attempts, "server error, retries exhausted");
                        return Err(HttpError::TransientServerError { status, attempts });
                    };
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    warn!(%method, path, status, attempt = attempts, delay_ms, "server error, retrying");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(HttpError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Serializes and optionally seals the body. POST and PUT always carry
    /// a body field in the signature, empty when there is none.
    fn prepare_body(
        &self,
        method: &Method,
        body: Option<&Value>,
        secrets: &SessionSecrets,
    ) -> Result<(Option<String>, bool), HttpError> {
        if !(method == Method::POST || method == Method::PUT) {
            return Ok((None, false));
        }
        let Some(value) = body else {
            return Ok((Some(String::new()), false));
        };
        let json = serde_json::to_string(value)
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
        if !self.inner.encryption {
            return Ok((Some(json), false));
        }
        let sealed = self
            .crypter(secrets)
            .encrypt_to_base64(json.as_bytes())
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
        Ok((Some(sealed), true))
    }

    async fn attempt(
        &self,
        ctx: &RequestContext,
        secrets: &SessionSecrets,
        req: &Prepared<'_>,
        cookie_header: &str,
        options: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, HttpError> {
        let inner = &self.inner;
        let nonce = crypto::generate_nonce();
        let timestamp = crypto::unix_now().to_string();
        let signed = SignPayload {
            session: &secrets.session_id,
            nonce: &nonce,
            timestamp: &timestamp,
            platform: &inner.platform,
            method: req.method.as_str(),
            path: req.path,
            query: &req.query,
            body: req.wire_body.as_deref(),
        };
        let signature = crypto::sign_base64(&secrets.sign, &signed.canonical());

        let url = format!("{}{}", inner.base_url, req.path);
        let mut builder = inner
            .http
            .request(req.method.clone(), &url)
            .timeout(options.timeout.unwrap_or(inner.timeout))
            .header(header::PLATFORM, &inner.platform)
            .header(header::SESSION, &secrets.session_id)
            .header(header::TIMESTAMP, &timestamp)
            .header(header::NONCE, &nonce)
            .header(header::SIGNATURE, signature);
        if !req.query_pairs.is_empty() {
            builder = builder.query(&req.query_pairs);
        }
        if !cookie_header.is_empty() {
            builder = builder.header(COOKIE, cookie_header);
        }
        if let Some(token) = &req.bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(wire) = &req.wire_body {
            if req.encrypted {
                builder = builder
                    .header(CONTENT_TYPE, content_type::ENCRYPTED)
                    .header(header::ORIGIN_CONTENT_TYPE, content_type::JSON);
            } else {
                builder = builder.header(CONTENT_TYPE, content_type::JSON);
            }
            builder = builder.body(wire.clone());
        }

        debug!(method = %req.method, path = req.path, %nonce, "sending signed request");
        let resp = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(HttpError::Cancelled),
            resp = builder.send() => resp?,
        };

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let raw = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(HttpError::Cancelled),
            text = resp.text() => text?,
        };
        if status != 200 {
            debug!(status, path = req.path, "non-200 response");
            return Err(HttpError::Status { status, body: raw });
        }

        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let resp_nonce = header_str(header::NONCE);
        let resp_timestamp = header_str(header::TIMESTAMP);
        let resp_signature = header_str(header::SIGNATURE);
        let expected = SignPayload {
            session: &secrets.session_id,
            nonce: &resp_nonce,
            timestamp: &resp_timestamp,
            platform: &inner.platform,
            method: req.method.as_str(),
            path: req.path,
            query: &req.query,
            body: Some(&raw),
        };
        if !crypto::verify_base64(&inner.server_sign, &expected.canonical(), &resp_signature) {
            warn!(path = req.path, nonce = %resp_nonce, "response signature invalid, discarding");
            return Err(HttpError::SignatureVerificationFailed);
        }

        let mut content = header_str(CONTENT_TYPE.as_str());
        let bytes = if is_encrypted(&content) {
            let plain = self.crypter(secrets).decrypt_base64(&raw)?;
            let original = header_str(header::ORIGIN_CONTENT_TYPE);
            content = if original.is_empty() {
                content_type::JSON.to_string()
            } else {
                original
            };
            plain
        } else {
            raw.into_bytes()
        };

        let set_cookie_lines: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let set_cookies: Vec<Cookie> = set_cookie_lines
            .iter()
            .filter_map(|line| Cookie::parse_set_cookie(line))
            .collect();
        ctx.jar().apply_set_cookies(set_cookie_lines);

        let body = match options.response_type {
            ResponseType::Json if bytes.iter().all(u8::is_ascii_whitespace) => Body::Json(Value::Null),
            ResponseType::Json => Body::Json(serde_json::from_slice(&bytes).map_err(|e| {
                warn!(path = req.path, error = %e, "response is not JSON");
                HttpError::MalformedResponse(e.to_string())
            })?),
            ResponseType::Text => Body::Text(
                String::from_utf8(bytes).map_err(|e| HttpError::MalformedResponse(e.to_string()))?,
            ),
            ResponseType::Bytes => Body::Bytes(bytes),
        };

        Ok(HttpResponse {
            status,
            content_type: content,
            body,
            set_cookies,
        })
    }
}

fn is_encrypted(content: &str) -> bool {
    let normalize = |s: &str| s.replace(' ', "").to_ascii_lowercase();
    normalize(content) == normalize(content_type::ENCRYPTED)
}

fn to_value<B: Serialize + ?Sized>(body: Option<&B>) -> Result<Option<Value>, HttpError> {
    body.map(serde_json::to_value)
        .transpose()
        .map_err(|e| HttpError::InvalidRequest(e.to_string()))
}

/// Flattens a query object into URL pairs using the same scalar rendering
/// as the canonical string.
fn query_pairs(query: &Value) -> Vec<(String, String)> {
    match query {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), canonicalize(v)))
            .collect(),
        _ => Vec::new(),
    }
}

fn tokens_in_body(resp: &HttpResponse) -> Option<crate::tokens::TokenPair> {
    let Body::Json(value) = &resp.body else {
        return None;
    };
    let data = value.get("data").unwrap_or(value);
    serde_json::from_value(data.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encrypted_content_type_matching_is_lenient() {
        assert!(is_encrypted("application/x-encrypted;charset=utf-8"));
        assert!(is_encrypted("application/x-encrypted; charset=UTF-8"));
        assert!(!is_encrypted("application/json"));
        assert!(!is_encrypted(""));
    }

    #[test]
    fn test_query_pairs_match_canonical_rendering() {
        let q = json!({"page": 2, "q": "rust", "none": null});
        let mut pairs = query_pairs(&q);
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("none".to_string(), String::new()),
                ("page".to_string(), "2".to_string()),
                ("q".to_string(), "rust".to_string()),
            ]
        );
    }

    #[test]
    fn test_tokens_in_envelope_or_bare() {
        let wrap = |v: Value| HttpResponse {
            status: 200,
            content_type: content_type::JSON.to_string(),
            body: Body::Json(v),
            set_cookies: Vec::new(),
        };
        let enveloped = wrap(json!({"code": "succeed", "data": {"access_token": "a", "refresh_token": "r"}}));
        assert_eq!(tokens_in_body(&enveloped).unwrap().access_token, "a");
        let bare = wrap(json!({"access_token": "a2", "refresh_token": "r2"}));
        assert_eq!(tokens_in_body(&bare).unwrap().refresh_token, "r2");
        assert!(tokens_in_body(&wrap(json!({"code": "fail"}))).is_none());
    }

    #[test]
    fn test_response_json_accepts_every_body_kind() {
        let mut resp = HttpResponse {
            status: 200,
            content_type: String::new(),
            body: Body::Text("{\"n\":1}".into()),
            set_cookies: Vec::new(),
        };
        assert_eq!(resp.json::<Value>().unwrap()["n"], 1);
        resp.body = Body::Bytes(b"nope".to_vec());
        assert!(matches!(
            resp.json::<Value>(),
            Err(HttpError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_default_options_handle_401() {
        let options = RequestOptions::default();
        assert!(options.auto_handle_401);
        assert_eq!(options.response_type, ResponseType::Json);
    }

    #[test]
    fn test_builder_requires_server_key() {
        let config = ClientConfig::default();
        assert!(matches!(
            HttpClient::new(&config),
            Err(HttpError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_login_url_encodes_path() {
        let mut config = ClientConfig::default();
        config.api.server_sign_key = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            crypto::generate_sign_keypair().verifying_key().as_bytes(),
        );
        let client = HttpClient::new(&config).unwrap();
        assert_eq!(
            client.login_url("/orders?id=1"),
            "/login?redirect=%2Forders%3Fid%3D1"
        );
    }
}
