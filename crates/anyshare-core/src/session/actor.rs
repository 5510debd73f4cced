//! 会话 actor
//!
//! 每个节点一个 tokio 任务，独占 [`SessionModel`]，在一个 `select!` 循环里
//! 处理三类输入:
//! - 来自 [`SessionHandle`] 的命令
//! - 信令链路的入站信封
//! - 带代次的 Transport 事件（旧代次直接丢弃）
//!
//! 观察者通过 `watch` 通道读取协商、连接和传输状态。

use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{RemotePeer, Session, SessionModel};
use crate::config::AppSettings;
use crate::error::{SessionError, TransferError};
use crate::logging::{LogEntry, LogLevel};
use crate::negotiation::NegotiationState;
use crate::signaling::{SignalEvent, SignalMessage, SignalReceiver, SignalingLink};
use crate::transfer::{FileSource, ReceivedFile, TransferState, TransferStatus};
use crate::transport::{ConnectionState, TaggedEvent, TransportEvent, TransportFactory};

/// 某一时刻的会话全貌
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session: Option<Session>,
    pub remote_peer: Option<RemotePeer>,
    pub negotiation: NegotiationState,
    pub connection: ConnectionState,
    pub transfer: TransferState,
    pub log: Vec<LogEntry>,
}

enum Command {
    Initiate(oneshot::Sender<Result<(), SessionError>>),
    SendFile(FileSource, oneshot::Sender<Result<(), TransferError>>),
    Materialize(oneshot::Sender<Result<ReceivedFile, TransferError>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Reset(oneshot::Sender<()>),
    Leave,
}

/// 会话 actor 的句柄，可克隆
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    negotiation: watch::Receiver<NegotiationState>,
    connection: watch::Receiver<ConnectionState>,
    transfer: watch::Receiver<TransferState>,
    cancel: CancellationToken,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// 手动发起协商（`auto_initiate` 关闭时使用）
    pub async fn initiate(&self) -> Result<(), SessionError> {
        self.request(Command::Initiate).await?
    }

    /// 发送文件，传输结束后返回
    pub async fn send_file(&self, source: FileSource) -> Result<(), SessionError> {
        Ok(self
            .request(|tx| Command::SendFile(source, tx))
            .await??)
    }

    pub async fn materialize(&self) -> Result<ReceivedFile, SessionError> {
        Ok(self.request(Command::Materialize).await??)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(Command::Snapshot).await
    }

    /// 拆除连接并清空会话状态，actor 继续运行
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(Command::Reset).await
    }

    /// 离开会话，actor 退出
    pub async fn leave(&self) {
        if self.commands.send(Command::Leave).await.is_err() {
            self.cancel.cancel();
        }
    }

    pub fn negotiation_state(&self) -> watch::Receiver<NegotiationState> {
        self.negotiation.clone()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn transfer_state(&self) -> watch::Receiver<TransferState> {
        self.transfer.clone()
    }

    /// 等到传输进入终态（`Complete` 或 `Error`），返回当时的状态
    ///
    /// 接收端在元数据到达前仍是 `Idle`，所以不能只等"不再是 `InProgress`"。
    pub async fn wait_transfer_settled(&self) -> Result<TransferState, SessionError> {
        let mut transfer = self.transfer.clone();
        let state = transfer
            .wait_for(|s| matches!(s.status, TransferStatus::Complete | TransferStatus::Error))
            .await
            .map_err(|_| SessionError::Stopped)?;
        Ok(state.clone())
    }

    /// 取消令牌，取消后 actor 拆除连接并退出
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

pub struct SessionActor {
    model: SessionModel,
    commands: mpsc::Receiver<Command>,
    signals: SignalReceiver,
    events: mpsc::UnboundedReceiver<TaggedEvent>,
    cancel: CancellationToken,
    auto_initiate: bool,
}

impl SessionActor {
    /// 创建 actor 并在后台运行
    ///
    /// 传输参数不合法时不启动任务，直接返回 [`SessionError::Config`]。
    pub fn spawn(
        session: Session,
        signaling: Arc<dyn SignalingLink>,
        signals: SignalReceiver,
        factory: Arc<dyn TransportFactory>,
        settings: &AppSettings,
    ) -> Result<(SessionHandle, JoinHandle<()>), SessionError> {
        settings.transfer.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        let mut model = SessionModel::new(
            session,
            settings.negotiation.clone(),
            settings.transfer.clone(),
            factory,
            signaling,
            events_tx,
        );
        if let Some(session) = &model.session {
            let message = format!("Joined room {} as {}", session.room_code, session.local_peer_id);
            model.record(LogLevel::Info, message);
        }

        let handle = SessionHandle {
            commands: commands_tx,
            negotiation: model.negotiator.subscribe_state(),
            connection: model.negotiator.subscribe_connection(),
            transfer: model.transfer.subscribe(),
            cancel: cancel.clone(),
        };

        let actor = Self {
            model,
            commands: commands_rx,
            signals,
            events: events_rx,
            cancel,
            auto_initiate: settings.auto_initiate,
        };
        let task = tokio::spawn(actor.run());
        Ok((handle, task))
    }

    async fn run(mut self) {
        let mut signaling_open = true;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Leave) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                message = self.signals.recv(), if signaling_open => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => {
                        signaling_open = false;
                        self.model.record(LogLevel::Warn, "Signaling connection closed");
                        self.model.negotiator.on_signaling_closed().await;
                    }
                },
                Some(event) = self.events.recv() => self.handle_transport_event(event).await,
            }
        }

        debug!("Session actor stopping");
        self.model.reset().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate(reply) => {
                let result = self.model.negotiator.initiate().await;
                if let Err(e) = &result {
                    self.model
                        .record(LogLevel::Error, format!("Failed to initiate connection: {e}"));
                }
                let _ = reply.send(result.map_err(SessionError::from));
            }
            Command::SendFile(source, reply) => {
                self.model.record(
                    LogLevel::Info,
                    format!("Sending {} ({} bytes)", source.name(), source.size()),
                );
                let channel = self.model.negotiator.channel();
                let connection = self.model.negotiator.subscribe_connection();
                self.model
                    .transfer
                    .start_send(source, channel, connection, reply);
            }
            Command::Materialize(reply) => {
                let _ = reply.send(self.model.transfer.materialize());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Reset(reply) => {
                self.model.reset().await;
                let _ = reply.send(());
            }
            Command::Leave => {}
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let negotiator = &self.model.negotiator;
        SessionSnapshot {
            session: self.model.session.clone(),
            remote_peer: negotiator.remote_peer().cloned(),
            negotiation: negotiator.state(),
            connection: negotiator.connection_state(),
            transfer: self.model.transfer.state(),
            log: self.model.log.entries().cloned().collect(),
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        let kind = message.kind;
        let event = match message.into_event() {
            Ok(event) => event,
            Err(e) => {
                self.model
                    .record(LogLevel::Warn, format!("Ignoring {kind:?} message: {e}"));
                return;
            }
        };

        match event {
            SignalEvent::PeerJoined(peer) => {
                self.model.record(
                    LogLevel::Success,
                    format!("Peer joined: {} ({})", peer.peer_id, peer.device_type),
                );
                self.model.negotiator.set_remote_peer(peer);
                if self.auto_initiate
                    && let Err(e) = self.model.negotiator.initiate().await
                {
                    self.model
                        .record(LogLevel::Error, format!("Failed to initiate connection: {e}"));
                }
            }
            SignalEvent::Offer {
                sender_id,
                description,
            } => {
                self.model
                    .record(LogLevel::Info, format!("Received offer from {sender_id}"));
                if let Err(e) = self.model.negotiator.on_offer(&sender_id, description).await {
                    self.model
                        .record(LogLevel::Error, format!("Failed to answer offer: {e}"));
                }
            }
            SignalEvent::Answer { description, .. } => {
                self.model.record(LogLevel::Info, "Received answer");
                if let Err(e) = self.model.negotiator.on_answer(description).await {
                    self.model
                        .record(LogLevel::Error, format!("Failed to apply answer: {e}"));
                }
            }
            SignalEvent::IceCandidate { candidate, .. } => {
                if let Err(e) = self.model.negotiator.on_candidate(candidate).await {
                    self.model.record(LogLevel::Warn, e.to_string());
                }
            }
            SignalEvent::PeerDisconnected { peer_id, reason } => {
                let known = self.model.negotiator.remote_peer().map(|p| p.peer_id.clone());
                if peer_id.is_some() && known.is_some() && peer_id != known {
                    debug!("PEER_DISCONNECTED for unrelated peer {:?}", peer_id);
                    return;
                }
                self.model.record(
                    LogLevel::Warn,
                    format!(
                        "Peer disconnected: {}",
                        reason.as_deref().unwrap_or("Connection closed")
                    ),
                );
                self.model.transfer.on_connection_lost();
                self.model.negotiator.on_peer_left().await;
            }
            SignalEvent::Error { code, message } => {
                let text = match code {
                    Some(code) => format!("Server error {code}: {message}"),
                    None => format!("Server error: {message}"),
                };
                self.model.record(LogLevel::Error, text);
            }
        }
    }

    async fn handle_transport_event(&mut self, tagged: TaggedEvent) {
        if !self.model.negotiator.is_current(tagged.generation) {
            debug!(
                "Dropping stale transport event {:?} (generation {})",
                tagged.event, tagged.generation
            );
            return;
        }

        match tagged.event {
            TransportEvent::ConnectionStateChanged(state) => {
                match state {
                    ConnectionState::Connected => {
                        self.model.record(LogLevel::Success, "Peer connection established");
                    }
                    ConnectionState::Disconnected | ConnectionState::Closed => {
                        self.model.record(LogLevel::Warn, "Peer connection lost");
                        self.model.transfer.on_connection_lost();
                    }
                    ConnectionState::Failed => {
                        self.model.record(LogLevel::Error, "Peer connection failed");
                        self.model.transfer.on_connection_lost();
                    }
                    ConnectionState::New | ConnectionState::Connecting => {
                        debug!("Connection state: {}", state);
                    }
                }
                self.model.negotiator.on_connection_state(state).await;
            }
            TransportEvent::GatheringStateChanged(state) => {
                debug!("Gathering state: {:?}", state);
            }
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.model.negotiator.send_local_candidate(&candidate) {
                    warn!("Failed to send local candidate: {}", e);
                }
            }
            TransportEvent::DataChannel(channel) => {
                self.model.negotiator.on_data_channel(channel);
            }
            TransportEvent::ChannelOpen => {
                self.model.record(LogLevel::Success, "Data channel open");
            }
            TransportEvent::ChannelClosed => {
                self.model.record(LogLevel::Warn, "Data channel closed");
            }
            TransportEvent::ChannelError(e) => {
                self.model
                    .record(LogLevel::Error, format!("Data channel error: {e}"));
            }
            TransportEvent::Message(frame) => self.model.transfer.on_frame(frame),
        }
    }
}
