//! 会话模型
//!
//! 一个节点在一次会话里的全部状态: 会话信息、协商状态机（含远端节点和
//! Transport）、传输引擎和事件日志。由 [`SessionActor`] 独占持有。

pub mod actor;

pub use actor::{SessionActor, SessionHandle, SessionSnapshot};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{NegotiationConfig, TransferConfig};
use crate::logging::{EventLog, LogLevel};
use crate::negotiation::Negotiator;
use crate::room_code::RoomCode;
use crate::signaling::SignalingLink;
use crate::transfer::TransferEngine;
use crate::transport::{TaggedEvent, TransportFactory};

/// 已创建或已加入的会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub room_code: RoomCode,
    pub local_peer_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// 刷新凭据；其它字段在会话期间不变
    pub fn refresh(&mut self, token: String, expires_at: DateTime<Utc>) {
        self.token = token;
        self.expires_at = expires_at;
    }
}

/// 对端节点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePeer {
    pub peer_id: String,
    pub device_type: String,
}

/// 会话状态的唯一持有者
pub struct SessionModel {
    pub session: Option<Session>,
    pub negotiator: Negotiator,
    pub transfer: TransferEngine,
    pub log: EventLog,
}

impl SessionModel {
    pub fn new(
        session: Session,
        negotiation: NegotiationConfig,
        transfer: TransferConfig,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingLink>,
        events: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        Self {
            session: Some(session),
            negotiator: Negotiator::new(negotiation, factory, signaling, events),
            transfer: TransferEngine::new(transfer),
            log: EventLog::default(),
        }
    }

    /// 记录一条面向用户的事件
    pub fn record(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Error => log::error!("{}", message),
            LogLevel::Warn => log::warn!("{}", message),
            LogLevel::Success | LogLevel::Info => log::info!("{}", message),
            LogLevel::Debug => log::debug!("{}", message),
        }
        self.log.push(level, message);
    }

    /// 拆除连接并清空全部状态（会话、远端、协商、传输、日志）
    pub async fn reset(&mut self) {
        self.transfer.reset();
        self.negotiator.teardown().await;
        self.negotiator.clear_remote_peer();
        self.session = None;
        self.log.clear();
    }
}
