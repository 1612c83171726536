//! 访问控制：共享密钥、Basic 凭据校验与上传限流，按路由组合成有序守卫列表。

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};
use rand_core::OsRng;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::http::connect_ip;
use crate::rate_limit::RateLimiter;

/// 请求头中的共享密钥。
pub const API_KEY_HEADER: &str = "x-api-key";

/// 单个访问守卫。每条路由声明一个按顺序执行的守卫列表。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Guard {
    /// `X-API-Key` 必须与共享密钥一致。
    ApiKey,
    /// HTTP Basic 凭据必须通过校验。
    Credentials,
    /// 上传尝试计入限流窗口。
    UploadRateLimit,
}

pub const UPLOAD_GUARDS: &[Guard] = &[Guard::UploadRateLimit, Guard::ApiKey];
pub const BROWSER_GUARDS: &[Guard] = &[Guard::Credentials];

#[derive(Debug)]
pub struct CredentialError(pub String);

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "credential setup failed: {}", self.0)
    }
}

/// 用户名到 Argon2 PHC 哈希的只读映射。
#[derive(Debug)]
pub struct Credentials {
    users: HashMap<String, String>,
    // 未知用户也执行一次校验，避免通过耗时区分用户名是否存在
    dummy_hash: String,
}

impl Credentials {
    /// 使用默认 Argon2id 参数哈希明文口令。
    pub fn hash_plain<I>(users: I) -> Result<Self, CredentialError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self::hash_with_params(users, Params::default())
    }

    pub fn hash_with_params<I>(users: I, params: Params) -> Result<Self, CredentialError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let hash = |password: &str| -> Result<String, CredentialError> {
            let salt = SaltString::generate(&mut OsRng);
            argon2
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|err| CredentialError(err.to_string()))
        };

        let mut hashed = HashMap::new();
        for (username, password) in users {
            hashed.insert(username, hash(&password)?);
        }
        let dummy_hash = hash("filegate-dummy-password")?;
        Ok(Self {
            users: hashed,
            dummy_hash,
        })
    }

    /// 校验用户名与口令（加盐慢哈希比较）。
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let (stored, known) = match self.users.get(username) {
            Some(hash) => (hash.as_str(), true),
            None => (self.dummy_hash.as_str(), false),
        };
        let Ok(parsed) = PasswordHash::new(stored) else {
            return false;
        };
        let matches = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();
        known && matches
    }
}

/// 进程内唯一的访问控制入口，启动时构建后只读共享（限流计数除外）。
#[derive(Debug)]
pub struct AccessGate {
    credentials: Arc<Credentials>,
    api_key: String,
    upload_limiter: RateLimiter,
}

impl AccessGate {
    pub fn new(credentials: Credentials, api_key: String, upload_limiter: RateLimiter) -> Self {
        Self {
            credentials: Arc::new(credentials),
            api_key,
            upload_limiter,
        }
    }

    pub fn upload_limiter(&self) -> &RateLimiter {
        &self.upload_limiter
    }

    /// 依次执行守卫，遇到第一个失败立即返回。
    pub async fn check(
        &self,
        guards: &[Guard],
        headers: &HeaderMap,
        client: Option<IpAddr>,
    ) -> Result<(), ApiError> {
        for guard in guards {
            match guard {
                Guard::ApiKey => self.check_api_key(headers)?,
                Guard::Credentials => self.check_credentials(headers).await?,
                Guard::UploadRateLimit => self
                    .upload_limiter
                    .try_acquire(client)
                    .await
                    .map_err(ApiError::TooManyRequests)?,
            }
        }
        Ok(())
    }

    fn check_api_key(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let supplied = headers.get(API_KEY_HEADER).map(|value| value.as_bytes());
        match supplied {
            Some(value) if constant_time_eq(value, self.api_key.as_bytes()) => Ok(()),
            _ => {
                warn!(key_present = supplied.is_some(), "api key check failed");
                Err(ApiError::Forbidden)
            }
        }
    }

    async fn check_credentials(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(auth) = headers.typed_get::<Authorization<Basic>>() else {
            debug!("missing basic credentials");
            return Err(ApiError::Unauthorized);
        };
        let username = auth.username().to_string();
        let password = auth.password().to_string();
        let credentials = self.credentials.clone();
        let user = username.clone();
        let verified = tokio::task::spawn_blocking(move || credentials.verify(&user, &password))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        if !verified {
            warn!(username, "credential check failed");
            return Err(ApiError::Unauthorized);
        }
        Ok(())
    }
}

/// 路由级中间件：执行该路由声明的守卫后再进入处理器。
pub async fn enforce(
    guards: &'static [Guard],
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let gate = req
        .extensions()
        .get::<Arc<AccessGate>>()
        .cloned()
        .ok_or_else(|| ApiError::Internal("access gate not configured".into()))?;
    let client = connect_ip(&req);
    // 请求体不是 Sync，跨 await 只借用头部
    let (parts, body) = req.into_parts();
    gate.check(guards, &parts.headers, client).await?;
    Ok(next.run(Request::from_parts(parts, body)).await)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
