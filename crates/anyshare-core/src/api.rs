//! 会话 REST 接口客户端
//!
//! - `POST /sessions` 创建会话（创建者随后也要 join 才能拿到 token）
//! - `GET /sessions/{roomCode}` 查询会话
//! - `POST /sessions/{roomCode}/join` 加入会话，返回 peerId 和信令 token
//! - `DELETE /sessions/{sessionId}` 关闭会话（Bearer token）
//!
//! 服务端错误体带 `errorMessage` 字段。每个请求都附带 `_t` 时间戳参数。

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{AppSettings, DeviceType};
use crate::room_code::{InvalidRoomCode, RoomCode};
use crate::session::Session;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error(transparent)]
    InvalidRoomCode(#[from] InvalidRoomCode),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRequest<'a> {
    device_type: DeviceType,
    user_agent: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

/// `POST /sessions` 的响应
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
    pub room_code: RoomCode,
    #[serde(default)]
    pub qr_code: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
    pub expires_at: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// `GET /sessions/{roomCode}` 的响应
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub status: String,
    pub peers_connected: u32,
    pub max_peers: u32,
    pub can_join: bool,
    pub expires_at: String,
}

/// `POST /sessions/{roomCode}/join` 的响应
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedSession {
    pub session_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub ws_url: Option<String>,
    pub token: String,
    pub expires_at: String,
}

impl JoinedSession {
    pub fn into_session(self, room_code: RoomCode) -> Session {
        Session {
            expires_at: parse_timestamp(&self.expires_at),
            session_id: self.session_id,
            room_code,
            local_peer_id: self.peer_id,
            token: self.token,
        }
    }
}

/// 解析服务端时间戳
///
/// 服务端可能返回带时区的 RFC 3339，也可能是不带时区的本地时间
/// （按 UTC 处理）。无法解析时按 5 分钟有效期估算。
pub fn parse_timestamp(text: &str) -> DateTime<Utc> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return ts.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc();
    }
    warn!("Unrecognized timestamp {:?}, assuming 5 minutes from now", text);
    Utc::now() + TimeDelta::minutes(5)
}

pub struct SessionApi {
    client: reqwest::Client,
    base_url: String,
    device_type: DeviceType,
    user_agent: String,
}

impl SessionApi {
    pub fn new(
        base_url: &str,
        device_type: DeviceType,
        user_agent: &str,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            device_type,
            user_agent: user_agent.to_string(),
        })
    }

    pub fn from_settings(settings: &AppSettings) -> Result<Self, ApiError> {
        Self::new(
            &settings.api_base_url,
            settings.device_type,
            &format!("anyshare/{} ({})", env!("CARGO_PKG_VERSION"), settings.device_name),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 防缓存时间戳参数
    fn cache_buster() -> [(&'static str, i64); 1] {
        [("_t", Utc::now().timestamp_millis())]
    }

    fn device_request(&self) -> DeviceRequest<'_> {
        DeviceRequest {
            device_type: self.device_type,
            user_agent: &self.user_agent,
        }
    }

    /// 检查状态码，错误时取出 `errorMessage`
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|b| b.error_message)
            .unwrap_or_else(|| {
                if text.is_empty() {
                    status.to_string()
                } else {
                    text
                }
            });
        Err(ApiError::Server {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn create_session(&self) -> Result<CreatedSession, ApiError> {
        debug!("POST /sessions");
        let response = self
            .client
            .post(self.url("/sessions"))
            .query(&Self::cache_buster())
            .json(&self.device_request())
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn session_info(&self, room_code: &str) -> Result<SessionInfo, ApiError> {
        let code = RoomCode::parse(room_code)?;
        debug!("GET /sessions/{}", code);
        let response = self
            .client
            .get(self.url(&format!("/sessions/{code}")))
            .query(&Self::cache_buster())
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// 加入会话，返回可直接交给会话 actor 的 [`Session`]
    pub async fn join_session(&self, room_code: &str) -> Result<(Session, JoinedSession), ApiError> {
        let code = RoomCode::parse(room_code)?;
        debug!("POST /sessions/{}/join", code);
        let response = self
            .client
            .post(self.url(&format!("/sessions/{code}/join")))
            .query(&Self::cache_buster())
            .json(&self.device_request())
            .send()
            .await?;
        let joined: JoinedSession = Self::check(response).await?.json().await?;
        Ok((joined.clone().into_session(code), joined))
    }

    /// 创建者流程: 创建后立即加入自己的会话
    pub async fn create_and_join(&self) -> Result<(CreatedSession, Session), ApiError> {
        let created = self.create_session().await?;
        let (session, _) = self.join_session(created.room_code.as_str()).await?;
        Ok((created, session))
    }

    pub async fn close_session(&self, session_id: &str, token: &str) -> Result<(), ApiError> {
        debug!("DELETE /sessions/{}", session_id);
        let response = self
            .client
            .delete(self.url(&format!("/sessions/{session_id}")))
            .query(&Self::cache_buster())
            .bearer_auth(token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
