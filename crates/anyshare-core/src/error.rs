//! 错误类型
//!
//! 每个组件一个错误枚举。所有错误都在操作边界被转换为这些结构化类型，
//! 并挂到对应的状态字段（`TransferState::error` 或会话事件日志）上。

use std::fmt;

/// Transport 协作方返回的错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Rejected by transport: {0}")]
    Rejected(String),

    #[error("Transport internal error: {0}")]
    Internal(String),
}

/// 信令链路错误
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("Signaling link closed")]
    LinkClosed,

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid envelope: {0}")]
    Decode(String),

    #[error("Failed to connect signaling link: {0}")]
    Connect(String),
}

/// 连接协商错误
///
/// 都不会让进程崩溃，只终止当前这一次协商，状态机回到可重试状态。
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("No remote peer to negotiate with")]
    NoRemotePeer,

    #[error("No active offer for this answer")]
    NoActiveOffer,

    #[error("Failed to apply session description: {0}")]
    ApplyDescriptionFailed(String),

    #[error("Candidate rejected: {0}")]
    CandidateRejected(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// 通道未就绪的具体原因，便于观察者区分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyCause {
    /// 数据通道从未打开
    NeverOpened,
    /// 对端已断开
    PeerDisconnected,
    /// 通道曾经打开，后被关闭
    ChannelClosed,
}

impl fmt::Display for NotReadyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NotReadyCause::NeverOpened => "data channel never opened",
            NotReadyCause::PeerDisconnected => "peer disconnected",
            NotReadyCause::ChannelClosed => "data channel closed",
        };
        f.write_str(text)
    }
}

/// 传输参数不合法
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk_size must be greater than zero")]
    ZeroChunkSize,

    #[error("low_water_mark must be greater than zero")]
    ZeroLowWaterMark,

    #[error("low_water_mark ({low}) must be below high_water_mark ({high})")]
    InvertedWatermarks { low: usize, high: usize },
}

/// 文件传输错误
///
/// 任何一种都会中止当前传输并把状态置为 `Error`，但不会拆掉会话。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("Channel not ready: {0}")]
    ChannelNotReady(NotReadyCause),

    #[error("Peer disconnected during transfer")]
    PeerDisconnected,

    #[error("Failed to read source: {0}")]
    SourceReadFailed(String),

    #[error("Nothing to materialize")]
    NothingToMaterialize,

    #[error("A transfer is already in progress")]
    AlreadyInProgress,

    #[error("Transfer truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("Invalid transfer settings: {0}")]
    InvalidConfig(ConfigError),
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::SourceReadFailed(e.to_string())
    }
}

/// 通过 `SessionHandle` 调用会话 actor 时的错误
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session actor has stopped")]
    Stopped,

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
