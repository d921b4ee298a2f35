//! Typed wrappers for the account endpoints.

use niu_common::types::resp_code;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::async_data::{AsyncData, AsyncDataCache};
use crate::error::HttpError;
use crate::http::{HttpClient, RequestContext, RequestOptions};
use crate::tokens::TokenPair;

/// Login endpoint.
pub const LOGIN_PATH: &str = "/v1/auth/login";
/// Logout endpoint.
pub const LOGOUT_PATH: &str = "/v1/auth/logout";
/// Current user endpoint.
pub const USER_INFO_PATH: &str = "/v1/user/info";
/// Cache key shared by every user-info view.
pub const USER_INFO_CACHE_KEY: &str = "userInfo";

/// Envelope every API body arrives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseDto<T> {
    /// Business code, one of [`resp_code`].
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub msg: String,
    /// Payload, absent on most failures.
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> ResponseDto<T> {
    /// True when `code` is [`resp_code::SUCCEED`].
    #[must_use]
    pub fn is_succeed(&self) -> bool {
        self.code == resp_code::SUCCEED
    }
}

/// Phone login request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginParam {
    /// Phone number.
    pub phone: String,
    /// SMS verification code.
    pub code: String,
    /// Secure code issued with the SMS.
    #[serde(default)]
    pub secure_code: String,
}

/// Logs in. Tokens from the body are stored in the context jar unless the
/// response already set them as cookies.
///
/// # Errors
///
/// See [`HttpClient::request`].
pub async fn login(
    client: &HttpClient,
    ctx: &RequestContext,
    param: &LoginParam,
) -> Result<ResponseDto<TokenPair>, HttpError> {
    let options = RequestOptions {
        auto_handle_401: false,
        ..RequestOptions::default()
    };
    let dto: ResponseDto<TokenPair> = client
        .post(ctx, LOGIN_PATH, Some(param), None, options)
        .await?;
    match (&dto.data, dto.is_succeed()) {
        (Some(pair), true) => {
            let written = client.tokens().store(ctx.jar(), pair);
            info!(stored = written.len(), "logged in");
        }
        _ => warn!(code = %dto.code, msg = %dto.msg, "login rejected"),
    }
    Ok(dto)
}

/// Logs out, then forgets both tokens.
///
/// # Errors
///
/// See [`HttpClient::request`]. Tokens are kept when the call fails.
pub async fn logout(
    client: &HttpClient,
    ctx: &RequestContext,
) -> Result<ResponseDto<Value>, HttpError> {
    let dto = client
        .post::<(), _>(ctx, LOGOUT_PATH, None, None, RequestOptions::default())
        .await?;
    client.tokens().clear(ctx.jar());
    info!("logged out");
    Ok(dto)
}

/// Fetches the current user once.
///
/// # Errors
///
/// See [`HttpClient::request`].
pub async fn user_info(
    client: &HttpClient,
    ctx: &RequestContext,
) -> Result<ResponseDto<Value>, HttpError> {
    client
        .get(ctx, USER_INFO_PATH, None, user_info_options())
        .await
}

/// Shared async-data view of the current user.
#[must_use]
pub fn user_info_data(
    client: &HttpClient,
    cache: &AsyncDataCache,
    ctx: &RequestContext,
) -> Arc<AsyncData<ResponseDto<Value>>> {
    client.async_get(cache, ctx, USER_INFO_PATH, None, user_info_options())
}

fn user_info_options() -> RequestOptions {
    RequestOptions {
        cache_key: Some(USER_INFO_CACHE_KEY.to_string()),
        ..RequestOptions::default()
    }
}
