//! AnyShare Core Library
//!
//! 基于房间码的点对点文件传输核心库: 两个节点通过中继服务交换信令，
//! 建立直连数据通道后按块发送文件。
//!
//! # 模块
//!
//! - **api**: 会话 REST 接口（创建、查询、加入、关闭）
//! - **room_code**: 房间码格式校验与生成
//! - **signaling**: 信令信封、WebSocket 链路、内存中继
//! - **transport**: 点对点传输抽象和内存实现
//! - **negotiation**: offer/answer/候选交换状态机
//! - **transfer**: 分块发送、背压、接收重组、进度统计
//! - **session**: 会话模型和会话 actor
//! - **logging**: 面向用户的会话事件日志
//! - **config**: 设置文件
//!
//! # 使用示例
//!
//! ```ignore
//! use anyshare_core::{AppSettings, SessionActor, SessionApi, WsSignalingLink};
//!
//! let settings = AppSettings::load();
//! let api = SessionApi::from_settings(&settings)?;
//!
//! // 1. 创建会话（创建者同样要加入）
//! let (created, session) = api.create_and_join().await?;
//! println!("Room code: {}", created.room_code);
//!
//! // 2. 连接信令
//! let (link, signals) = WsSignalingLink::connect(&settings.ws_url, &session.token).await?;
//!
//! // 3. 启动会话 actor，对端加入后自动协商
//! let (handle, _task) = SessionActor::spawn(session, Arc::new(link), signals, factory, &settings)?;
//!
//! // 4. 连接建立后发送文件
//! handle.send_file(FileSource::open(path).await?).await?;
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod negotiation;
pub mod room_code;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::{ApiError, CreatedSession, JoinedSession, SessionApi, SessionInfo};
pub use config::{AppSettings, DeviceType, NegotiationConfig, TransferConfig};
pub use error::{
    ConfigError, NegotiationError, SessionError, SignalingError, TransferError, TransportError,
};
pub use logging::{EventLog, LogEntry, LogLevel};
pub use negotiation::{NegotiationState, Negotiator};
pub use room_code::{InvalidRoomCode, RoomCode, is_valid_room_code};
pub use session::{RemotePeer, Session, SessionActor, SessionHandle, SessionSnapshot};
pub use signaling::{
    MemoryRelay, SignalMessage, SignalType, SignalingLink, WsSignalingLink,
};
pub use transfer::{
    ControlFrame, FileSource, ReceivedFile, TransferState, TransferStatus,
    utils::{format_bytes, format_speed, format_time_remaining},
};
pub use transport::{
    ConnectionState, DataChannel, DataFrame, MemoryNetwork, Transport, TransportFactory,
};
