//! Bearer Token 认证
//!
//! 用户标识来自已验证的 token `sub` 声明，请求体或路径里的用户字段一概不采信。

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use coupon_shared::config::AuthConfig;

use super::error::ApiError;
use super::state::AppState;
use crate::models::UserKey;
use crate::repository::IssuanceStore;

/// Token 载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// 用户标识
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// HS256 Token 校验器
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => ApiError::Unauthorized("Token 已过期".to_string()),
                ErrorKind::InvalidIssuer => ApiError::Unauthorized("Token 签发者无效".to_string()),
                _ => ApiError::Unauthorized("Token 无效".to_string()),
            },
        )?;

        if data.claims.sub.trim().is_empty() {
            return Err(ApiError::Unauthorized("Token 缺少用户标识".to_string()));
        }
        Ok(data.claims)
    }
}

/// 认证中间件
///
/// 校验通过后把 [`UserKey`] 注入请求扩展，处理器通过 `Extension<UserKey>` 取用。
pub async fn require_user<S>(
    State(state): State<AppState<S>>,
    mut request: Request<Body>,
    next: Next,
) -> Response
where
    S: IssuanceStore + 'static,
{
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(token) = token else {
        return ApiError::Unauthorized("缺少认证 Token".to_string()).into_response();
    };

    match state.verifier.verify(token) {
        Ok(claims) => {
            request.extensions_mut().insert(UserKey::new(claims.sub));
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}
