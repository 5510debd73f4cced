//! 连接协商状态机
//!
//! 把已加入的会话变成一条打开的双向数据通道:
//!
//! ```text
//! Idle ──initiate──▶ CreatingOffer ──▶ OfferSent ──(远端候选)──▶ AwaitingAnswer
//!   │                                      │                        │
//!   └──on_offer──▶ AnsweringOffer ──▶ AnswerSent        on_answer + connected
//!                                          │                        │
//!                                          └──── connected ────▶ Connected
//! ```
//!
//! 任意阶段的 `failed` 进入 `Failed`（清除远端），`disconnected` 进入
//! `Disconnected`（保留远端），两者都可以重新协商。
//!
//! 同一时刻最多一个活动的 Transport。每创建一个新 Transport 代次加一，
//! 旧 Transport 的迟到事件由调用方按代次丢弃。

use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::NegotiationConfig;
use crate::error::{NegotiationError, SignalingError, TransportError};
use crate::session::RemotePeer;
use crate::signaling::{SignalMessage, SignalingLink};
use crate::transport::{
    ConnectionState, DataChannel, EventSink, IceCandidate, SessionDescription, TaggedEvent,
    Transport, TransportFactory,
};

/// 协商状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    CreatingOffer,
    OfferSent,
    AwaitingAnswer,
    AnsweringOffer,
    AnswerSent,
    Connected,
    Disconnected,
    Failed,
}

impl NegotiationState {
    /// 可以开始新一轮协商
    pub fn can_start(self) -> bool {
        matches!(
            self,
            NegotiationState::Idle | NegotiationState::Failed | NegotiationState::Disconnected
        )
    }

    /// 发起方正在等待应答
    pub fn awaits_answer(self) -> bool {
        matches!(
            self,
            NegotiationState::OfferSent | NegotiationState::AwaitingAnswer
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::CreatingOffer => "creating-offer",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::AnsweringOffer => "answering-offer",
            NegotiationState::AnswerSent => "answer-sent",
            NegotiationState::Connected => "connected",
            NegotiationState::Disconnected => "disconnected",
            NegotiationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 协商状态机
///
/// 拥有远端节点、当前 Transport 和数据通道。所有方法都需要 `&mut self`，
/// 由会话 actor 串行调用。
pub struct Negotiator {
    config: NegotiationConfig,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingLink>,
    events: mpsc::UnboundedSender<TaggedEvent>,
    state: watch::Sender<NegotiationState>,
    connection: watch::Sender<ConnectionState>,
    remote: Option<RemotePeer>,
    transport: Option<Arc<dyn Transport>>,
    channel: Option<Arc<dyn DataChannel>>,
    generation: u64,
}

impl Negotiator {
    pub fn new(
        config: NegotiationConfig,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingLink>,
        events: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        let (connection, _) = watch::channel(ConnectionState::New);
        Self {
            config,
            factory,
            signaling,
            events,
            state,
            connection,
            remote: None,
            transport: None,
            channel: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// 连接状态订阅，发送循环用它感知断线
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 事件是否来自当前的 Transport
    pub fn is_current(&self, generation: u64) -> bool {
        self.transport.is_some() && generation == self.generation
    }

    pub fn remote_peer(&self) -> Option<&RemotePeer> {
        self.remote.as_ref()
    }

    pub fn set_remote_peer(&mut self, peer: RemotePeer) {
        if let Some(old) = &self.remote
            && old.peer_id != peer.peer_id
        {
            info!("Remote peer replaced: {} -> {}", old.peer_id, peer.peer_id);
        }
        self.remote = Some(peer);
    }

    pub fn clear_remote_peer(&mut self) {
        self.remote = None;
    }

    /// 当前数据通道（可能尚未打开或已关闭）
    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.clone()
    }

    fn set_state(&self, state: NegotiationState) {
        let old = self.state.send_replace(state);
        if old != state {
            debug!("Negotiation: {} -> {}", old, state);
        }
    }

    fn send_signal(&self, message: SignalMessage) -> Result<(), NegotiationError> {
        if self.signaling.send(message) {
            Ok(())
        } else {
            Err(SignalingError::LinkClosed.into())
        }
    }

    /// 拆掉旧 Transport 并创建新的，代次加一
    async fn new_transport(&mut self) -> Result<Arc<dyn Transport>, NegotiationError> {
        self.close_transport().await;
        self.generation += 1;
        self.connection.send_replace(ConnectionState::New);

        let sink = EventSink::new(self.generation, self.events.clone());
        let transport = self.factory.create(sink)?;
        self.transport = Some(transport.clone());
        Ok(transport)
    }

    async fn close_transport(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }

    /// 等待候选收集完成，超时后继续使用已有的候选
    async fn gathered_description(
        &self,
        transport: &Arc<dyn Transport>,
        fallback: SessionDescription,
    ) -> SessionDescription {
        let timeout = self.config.ice_gather_timeout();
        if tokio::time::timeout(timeout, transport.gathering_complete())
            .await
            .is_err()
        {
            warn!(
                "Candidate gathering did not complete within {:?}, proceeding with what we have",
                timeout
            );
        }
        transport.local_description().await.unwrap_or(fallback)
    }

    /// 作为发起方开始协商
    ///
    /// 协商已在进行时是空操作（只会发出一个 OFFER）。
    pub async fn initiate(&mut self) -> Result<(), NegotiationError> {
        let state = self.state();
        if !state.can_start() {
            warn!("initiate() ignored: negotiation already {}", state);
            return Ok(());
        }
        let remote = self.remote.clone().ok_or(NegotiationError::NoRemotePeer)?;

        info!("Initiating connection with {}", remote.peer_id);
        self.set_state(NegotiationState::CreatingOffer);

        match self.create_and_send_offer(&remote).await {
            Ok(()) => {
                self.set_state(NegotiationState::OfferSent);
                Ok(())
            }
            Err(e) => {
                warn!("Offer failed: {}", e);
                self.close_transport().await;
                self.set_state(NegotiationState::Failed);
                Err(e)
            }
        }
    }

    async fn create_and_send_offer(&mut self, remote: &RemotePeer) -> Result<(), NegotiationError> {
        let transport = self.new_transport().await?;

        let options = &self.config.channel;
        if !options.is_reliable_ordered() {
            warn!(
                "Data channel requested without ordered reliable delivery ({:?}); \
                 transfers rely on in-order arrival",
                options
            );
        }
        let channel = transport
            .create_data_channel(&self.config.channel_label, options)
            .await?;
        self.channel = Some(channel);

        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        let offer = self.gathered_description(&transport, offer).await;

        self.send_signal(SignalMessage::offer(&remote.peer_id, &offer)?)?;
        debug!("OFFER sent to {}", remote.peer_id);
        Ok(())
    }

    /// 作为应答方处理 OFFER
    pub async fn on_offer(
        &mut self,
        sender_id: &str,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let state = self.state();
        if !state.can_start() {
            warn!("OFFER from {} ignored in state {}", sender_id, state);
            return Ok(());
        }

        // 应答方不会收到 PEER_JOINED，远端由 OFFER 的发送者确定
        let known = self
            .remote
            .as_ref()
            .is_some_and(|peer| peer.peer_id == sender_id);
        if !known {
            self.set_remote_peer(RemotePeer {
                peer_id: sender_id.to_string(),
                device_type: "UNKNOWN".to_string(),
            });
        }

        info!("Answering offer from {}", sender_id);
        self.set_state(NegotiationState::AnsweringOffer);

        match self.create_and_send_answer(sender_id, offer).await {
            Ok(()) => {
                self.set_state(NegotiationState::AnswerSent);
                Ok(())
            }
            Err(e) => {
                warn!("Answer failed: {}", e);
                self.close_transport().await;
                self.set_state(NegotiationState::Failed);
                Err(e)
            }
        }
    }

    async fn create_and_send_answer(
        &mut self,
        sender_id: &str,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let transport = self.new_transport().await?;

        transport
            .set_remote_description(offer)
            .await
            .map_err(|e| NegotiationError::ApplyDescriptionFailed(e.to_string()))?;

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        let answer = self.gathered_description(&transport, answer).await;

        self.send_signal(SignalMessage::answer(sender_id, &answer)?)?;
        debug!("ANSWER sent to {}", sender_id);
        Ok(())
    }

    /// 发起方处理 ANSWER
    pub async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        let Some(transport) = self.transport.clone() else {
            return Err(NegotiationError::NoActiveOffer);
        };
        let state = self.state();
        if !state.awaits_answer() {
            warn!("ANSWER ignored in state {}", state);
            return Ok(());
        }

        if let Err(e) = transport.set_remote_description(answer).await {
            warn!("Failed to apply answer: {}", e);
            self.close_transport().await;
            self.set_state(NegotiationState::Failed);
            return Err(NegotiationError::ApplyDescriptionFailed(e.to_string()));
        }
        debug!("Answer applied, waiting for connection");
        Ok(())
    }

    /// 应用远端候选；没有 Transport 时丢弃
    pub async fn on_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let Some(transport) = self.transport.clone() else {
            warn!("Remote candidate dropped: no active transport");
            return Ok(());
        };

        if self.state() == NegotiationState::OfferSent {
            self.set_state(NegotiationState::AwaitingAnswer);
        }

        transport
            .add_candidate(candidate)
            .await
            .map_err(|e: TransportError| {
                warn!("Remote candidate rejected: {}", e);
                NegotiationError::CandidateRejected(e.to_string())
            })
    }

    /// 把本地候选转发给远端
    pub fn send_local_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let Some(remote) = &self.remote else {
            debug!("Local candidate not sent: no remote peer");
            return Ok(());
        };
        self.send_signal(SignalMessage::ice_candidate(&remote.peer_id, candidate)?)
    }

    /// 应答方收到对端创建的数据通道
    pub fn on_data_channel(&mut self, channel: Arc<dyn DataChannel>) {
        if channel.label() != self.config.channel_label {
            warn!(
                "Unexpected data channel '{}' (expected '{}')",
                channel.label(),
                self.config.channel_label
            );
        }
        debug!("Inbound data channel '{}'", channel.label());
        self.channel = Some(channel);
    }

    /// Transport 报告的连接状态变化
    pub async fn on_connection_state(&mut self, state: ConnectionState) {
        self.connection.send_replace(state);
        match state {
            ConnectionState::Connected => {
                info!("Peer connection established");
                self.set_state(NegotiationState::Connected);
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {
                if self.state() != NegotiationState::Idle {
                    info!("Peer connection {}", state);
                    self.close_transport().await;
                    self.set_state(NegotiationState::Disconnected);
                }
            }
            ConnectionState::Failed => {
                warn!("Peer connection failed");
                self.close_transport().await;
                self.remote = None;
                self.set_state(NegotiationState::Failed);
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    /// 远端经信令通知离开
    pub async fn on_peer_left(&mut self) {
        self.close_transport().await;
        self.connection.send_replace(ConnectionState::Disconnected);
        self.remote = None;
        self.set_state(NegotiationState::Disconnected);
    }

    /// 信令链路关闭: 清除远端；尚未连通的协商被拆除，已打开的通道保留
    pub async fn on_signaling_closed(&mut self) {
        self.remote = None;
        let state = self.state();
        if state != NegotiationState::Connected && state != NegotiationState::Idle {
            self.close_transport().await;
            self.connection.send_replace(ConnectionState::Closed);
            self.set_state(NegotiationState::Disconnected);
        }
    }

    /// 关闭通道和 Transport，回到 `Idle`；可重复调用
    pub async fn teardown(&mut self) {
        self.close_transport().await;
        self.generation += 1;
        self.connection.send_replace(ConnectionState::New);
        self.set_state(NegotiationState::Idle);
    }
}
