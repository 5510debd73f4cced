//! 点对点传输抽象
//!
//! 底层连接（NAT 穿透、加密、拥塞控制）由外部提供，核心只通过这里的
//! 窄接口使用它:
//! - [`Transport`]: offer/answer/候选交换，连接状态
//! - [`DataChannel`]: 有序消息通道，可观测 `buffered_amount`
//! - [`TransportFactory`]: 每次协商创建一个新的 Transport
//!
//! 回调通过 [`EventSink`] 以带代次的 [`TransportEvent`] 送回会话 actor。

pub mod memory;

pub use memory::{MemoryNetwork, MemoryTransportFactory};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// SDP 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// 会话描述，作为 OFFER/ANSWER 的 payload 原样转发
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }
}

/// 传输候选
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub sdp_m_line_index: Option<u16>,
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// 连接已经丢失（断开/失败/关闭）
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 候选收集状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

/// 数据通道参数
///
/// 传输协议没有序号，完全依赖通道的有序可靠投递，所以默认有序且可靠。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    pub ordered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

impl ChannelOptions {
    /// 有序且完全可靠
    pub fn is_reliable_ordered(&self) -> bool {
        self.ordered && self.max_retransmits.is_none()
    }
}

/// 数据通道上的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    /// 文本控制帧
    Text(String),
    /// 二进制数据块
    Binary(Bytes),
}

impl DataFrame {
    pub fn len(&self) -> usize {
        match self {
            DataFrame::Text(t) => t.len(),
            DataFrame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 有序的双工消息通道
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// 已提交但尚未发出的字节数
    async fn buffered_amount(&self) -> usize;

    async fn send(&self, frame: DataFrame) -> Result<(), TransportError>;

    async fn close(&self);
}

/// 对端连接
#[async_trait]
pub trait Transport: Send + Sync {
    /// 创建本地数据通道（发起方）
    async fn create_data_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// 当前本地描述（候选收集完成后包含全部候选）
    async fn local_description(&self) -> Option<SessionDescription>;

    /// 候选收集完成时返回，调用方负责加超时
    async fn gathering_complete(&self);

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self);
}

/// 每次协商创建一个新的 Transport
pub trait TransportFactory: Send + Sync {
    fn create(&self, events: EventSink) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Transport 回调事件
#[derive(Clone)]
pub enum TransportEvent {
    ConnectionStateChanged(ConnectionState),
    GatheringStateChanged(GatheringState),
    /// 本地收集到的候选，需要转发给对端
    LocalCandidate(IceCandidate),
    /// 对端创建的数据通道（应答方）
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelClosed,
    ChannelError(String),
    Message(DataFrame),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::ConnectionStateChanged(s) => write!(f, "ConnectionStateChanged({s})"),
            TransportEvent::GatheringStateChanged(s) => write!(f, "GatheringStateChanged({s:?})"),
            TransportEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            TransportEvent::DataChannel(dc) => write!(f, "DataChannel({})", dc.label()),
            TransportEvent::ChannelOpen => f.write_str("ChannelOpen"),
            TransportEvent::ChannelClosed => f.write_str("ChannelClosed"),
            TransportEvent::ChannelError(e) => write!(f, "ChannelError({e})"),
            TransportEvent::Message(frame) => write!(f, "Message({} bytes)", frame.len()),
        }
    }
}

/// 带代次的事件，代次用来丢弃已拆除 Transport 的迟到事件
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Transport 向会话 actor 回送事件的出口
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 接收端已关闭时返回 `false`
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_wire_format() {
        let desc = SessionDescription::new(SdpType::Answer, "v=0\r\n");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "v=0\r\n");
    }

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:0 1 UDP 1 192.168.1.2 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_channel_options_reliability() {
        assert!(ChannelOptions::default().is_reliable_ordered());
        let lossy = ChannelOptions {
            ordered: true,
            max_retransmits: Some(0),
        };
        assert!(!lossy.is_reliable_ordered());
    }

    #[test]
    fn test_event_sink_tags_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert!(sink.emit(TransportEvent::ChannelOpen));

        let tagged = rx.try_recv().unwrap();
        assert_eq!(tagged.generation, 7);
        assert!(matches!(tagged.event, TransportEvent::ChannelOpen));

        drop(rx);
        assert!(!sink.emit(TransportEvent::ChannelClosed));
    }
}
