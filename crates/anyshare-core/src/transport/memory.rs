//! 进程内回环 Transport
//!
//! 用于测试和 CLI 本地回环演示。两个 [`MemoryTransport`] 通过
//! [`MemoryNetwork`] 用描述里携带的 id 互相找到对方；应答被应用后两端
//! 进入 `Connected`，发起方的数据通道和应答方收到的通道被连接起来。
//!
//! `buffered_amount` 按字节统计: 发送时增加，帧被投递到对端事件队列时减少。

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};

use super::{
    ChannelOptions, ConnectionState, DataChannel, DataFrame, EventSink, GatheringState,
    IceCandidate, SdpType, SessionDescription, Transport, TransportEvent, TransportFactory,
};
use crate::error::TransportError;

const OFFER_PREFIX: &str = "memory-offer ";
const ANSWER_PREFIX: &str = "memory-answer ";

/// 回环网络，负责让两个 Transport 互相发现
#[derive(Default)]
pub struct MemoryNetwork {
    transports: Mutex<HashMap<String, Weak<MemoryTransport>>>,
    stall_gathering: AtomicBool,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 让之后的候选收集永远不完成，用来验证协商的超时路径
    pub fn stall_gathering(&self, stall: bool) {
        self.stall_gathering.store(stall, Ordering::SeqCst);
    }

    pub fn factory(self: &Arc<Self>) -> MemoryTransportFactory {
        MemoryTransportFactory {
            network: self.clone(),
        }
    }

    /// 当前仍存活的 Transport 数量
    pub fn live_transports(&self) -> usize {
        self.lock()
            .values()
            .filter(|t| t.upgrade().is_some_and(|t| !t.is_closed()))
            .count()
    }

    /// 模拟网络中断: 所有存活的连接进入 `Disconnected`，数据通道关闭
    pub async fn sever(&self) {
        let live: Vec<_> = self.lock().values().filter_map(Weak::upgrade).collect();
        for transport in live {
            transport.lose_connection(ConnectionState::Disconnected).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Weak<MemoryTransport>>> {
        self.transports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn register(&self, transport: &Arc<MemoryTransport>) {
        self.lock()
            .insert(transport.id.clone(), Arc::downgrade(transport));
    }

    fn unregister(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lookup(&self, id: &str) -> Option<Arc<MemoryTransport>> {
        self.lock().get(id).and_then(Weak::upgrade)
    }
}

pub struct MemoryTransportFactory {
    network: Arc<MemoryNetwork>,
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, events: EventSink) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = MemoryTransport::new(self.network.clone(), events);
        Ok(transport)
    }
}

#[derive(Default)]
struct LinkState {
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_id: Option<String>,
    local_channel: Option<Arc<MemoryChannel>>,
    linked_channel: Option<Arc<MemoryChannel>>,
    closed: bool,
}

pub struct MemoryTransport {
    id: String,
    me: Weak<MemoryTransport>,
    network: Arc<MemoryNetwork>,
    events: EventSink,
    state: Mutex<LinkState>,
    gathering: watch::Sender<GatheringState>,
}

impl MemoryTransport {
    fn new(network: Arc<MemoryNetwork>, events: EventSink) -> Arc<Self> {
        let (gathering, _) = watch::channel(GatheringState::New);
        Arc::new_cyclic(|me| Self {
            id: uuid::Uuid::new_v4().to_string(),
            me: me.clone(),
            network,
            events,
            state: Mutex::new(LinkState::default()),
            gathering,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn set_connection(&self, state: ConnectionState) {
        {
            let mut s = self.lock();
            if s.connection == state {
                return;
            }
            s.connection = state;
        }
        self.events
            .emit(TransportEvent::ConnectionStateChanged(state));
    }

    fn set_gathering(&self, state: GatheringState) {
        self.gathering.send_replace(state);
        self.events
            .emit(TransportEvent::GatheringStateChanged(state));
    }

    fn start_gathering(&self) {
        if *self.gathering.borrow() != GatheringState::New {
            return;
        }
        self.set_gathering(GatheringState::Gathering);
        self.events.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:memory 1 udp 1 127.0.0.1 9 typ host generation 0 ufrag {}", self.id),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }));
        if self.network.stall_gathering.load(Ordering::SeqCst) {
            debug!("Memory transport {} stalls candidate gathering", self.id);
            return;
        }
        self.set_gathering(GatheringState::Complete);
    }

    /// 发起方应用应答后，把两端连接起来
    fn link_with(&self, answerer: &Arc<MemoryTransport>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };

        self.set_connection(ConnectionState::Connecting);
        answerer.set_connection(ConnectionState::Connecting);

        let local_channel = self.lock().local_channel.clone();
        self.set_connection(ConnectionState::Connected);
        answerer.set_connection(ConnectionState::Connected);

        if let Some(offer_end) = local_channel {
            let answer_end = MemoryChannel::new(offer_end.label(), answerer.events.clone());
            MemoryChannel::connect(&offer_end, &answer_end);

            self.lock().linked_channel = Some(offer_end.clone());
            answerer.lock().linked_channel = Some(answer_end.clone());

            answerer
                .events
                .emit(TransportEvent::DataChannel(answer_end.clone()));
            self.events.emit(TransportEvent::ChannelOpen);
            answerer.events.emit(TransportEvent::ChannelOpen);
        }

        debug!("Memory transports {} <-> {} linked", me.id, answerer.id);
    }

    /// 连接丢失: 关闭通道并上报状态
    async fn lose_connection(&self, state: ConnectionState) {
        let channel = {
            let s = self.lock();
            if s.closed {
                return;
            }
            s.linked_channel.clone().or_else(|| s.local_channel.clone())
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.set_connection(state);
    }

    fn parse_peer_id(desc: &SessionDescription) -> Result<&str, TransportError> {
        let prefix = match desc.sdp_type {
            SdpType::Offer => OFFER_PREFIX,
            SdpType::Answer => ANSWER_PREFIX,
        };
        desc.sdp
            .strip_prefix(prefix)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransportError::Rejected(format!("malformed description: {}", desc.sdp)))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_data_channel(
        &self,
        label: &str,
        _options: &ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let mut s = self.lock();
        if s.closed {
            return Err(TransportError::Closed);
        }
        let channel = MemoryChannel::new(label, self.events.clone());
        s.local_channel = Some(channel.clone());
        let channel: Arc<dyn DataChannel> = channel;
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(SessionDescription::new(
            SdpType::Offer,
            format!("{OFFER_PREFIX}{}", self.id),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let s = self.lock();
        if s.closed {
            return Err(TransportError::Closed);
        }
        match &s.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => Ok(SessionDescription::new(
                SdpType::Answer,
                format!("{ANSWER_PREFIX}{}", self.id),
            )),
            _ => Err(TransportError::Rejected(
                "cannot answer without a remote offer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        {
            let mut s = self.lock();
            if s.closed {
                return Err(TransportError::Closed);
            }
            s.local = Some(desc);
        }
        if let Some(me) = self.me.upgrade() {
            self.network.register(&me);
        }
        self.start_gathering();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let peer_id = Self::parse_peer_id(&desc)?.to_string();
        let peer = self
            .network
            .lookup(&peer_id)
            .ok_or_else(|| TransportError::Rejected(format!("unknown remote {peer_id}")))?;

        let is_answer = desc.sdp_type == SdpType::Answer;
        {
            let mut s = self.lock();
            if is_answer && s.local.as_ref().map(|d| d.sdp_type) != Some(SdpType::Offer) {
                return Err(TransportError::Rejected(
                    "answer received without a local offer".to_string(),
                ));
            }
            s.remote = Some(desc);
            s.remote_id = Some(peer_id);
        }

        if is_answer {
            self.link_with(&peer);
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let s = self.lock();
        if s.closed {
            return Err(TransportError::Closed);
        }
        if s.remote.is_none() {
            return Err(TransportError::Rejected(
                "remote description not set".to_string(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::Rejected(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.lock().local.clone()
    }

    async fn gathering_complete(&self) {
        let mut rx = self.gathering.subscribe();
        let _ = rx.wait_for(|s| *s == GatheringState::Complete).await;
    }

    fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    async fn close(&self) {
        let (channels, remote_id) = {
            let mut s = self.lock();
            if s.closed {
                return;
            }
            s.closed = true;
            s.connection = ConnectionState::Closed;
            let channels: Vec<_> = s
                .linked_channel
                .take()
                .into_iter()
                .chain(s.local_channel.take())
                .collect();
            (channels, s.remote_id.take())
        };
        for channel in channels {
            channel.close().await;
        }
        self.network.unregister(&self.id);

        // 对端感知为断开
        if let Some(remote) = remote_id.and_then(|id| self.network.lookup(&id)) {
            remote.lose_connection(ConnectionState::Disconnected).await;
        }
    }
}

/// 回环数据通道的一端
pub struct MemoryChannel {
    label: String,
    open: AtomicBool,
    buffered: AtomicUsize,
    outbound: Mutex<Option<mpsc::UnboundedSender<DataFrame>>>,
    events: EventSink,
}

impl MemoryChannel {
    fn new(label: &str, events: EventSink) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            outbound: Mutex::new(None),
            events,
        })
    }

    /// 连接两端，各起一个转发任务
    fn connect(a: &Arc<Self>, b: &Arc<Self>) {
        Self::pipe(a, b);
        Self::pipe(b, a);
        a.open.store(true, Ordering::SeqCst);
        b.open.store(true, Ordering::SeqCst);
    }

    fn pipe(from: &Arc<Self>, to: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<DataFrame>();
        *from
            .outbound
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);

        let from = from.clone();
        let to = to.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                from.buffered.fetch_sub(frame.len(), Ordering::SeqCst);
                if !to.events.emit(TransportEvent::Message(frame)) {
                    warn!("Memory channel '{}': receiver gone", to.label);
                    break;
                }
            }
            to.shutdown();
        });
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.outbound
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            self.events.emit(TransportEvent::ChannelClosed);
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: DataFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let guard = self
            .outbound
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        tx.send(frame).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            TransportError::Closed
        })
    }

    async fn close(&self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TaggedEvent;
    use bytes::Bytes;

    fn sink(generation: u64) -> (EventSink, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(generation, tx), rx)
    }

    async fn connected_pair(
        network: &Arc<MemoryNetwork>,
    ) -> (
        Arc<dyn Transport>,
        Arc<dyn DataChannel>,
        mpsc::UnboundedReceiver<TaggedEvent>,
        Arc<dyn Transport>,
        mpsc::UnboundedReceiver<TaggedEvent>,
    ) {
        let factory = network.factory();
        let (sink_a, rx_a) = sink(1);
        let (sink_b, rx_b) = sink(1);
        let a = factory.create(sink_a).unwrap();
        let b = factory.create(sink_b).unwrap();

        let channel = a
            .create_data_channel("fileTransfer", &ChannelOptions::default())
            .await
            .unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        (a, channel, rx_a, b, rx_b)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TaggedEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(tagged) = rx.try_recv() {
            events.push(tagged.event);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_ends() {
        let network = MemoryNetwork::new();
        let (a, channel, mut rx_a, b, mut rx_b) = connected_pair(&network).await;

        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
        assert!(channel.is_open());

        let events_a = drain(&mut rx_a);
        assert!(events_a.iter().any(|e| matches!(e, TransportEvent::ChannelOpen)));
        assert!(events_a.iter().any(|e| matches!(e, TransportEvent::LocalCandidate(_))));

        let events_b = drain(&mut rx_b);
        assert!(events_b.iter().any(|e| matches!(e, TransportEvent::DataChannel(dc) if dc.label() == "fileTransfer")));
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_and_drain_buffer() {
        let network = MemoryNetwork::new();
        let (_a, channel, _rx_a, _b, mut rx_b) = connected_pair(&network).await;
        drain(&mut rx_b);

        channel.send(DataFrame::Text("hello".to_string())).await.unwrap();
        channel.send(DataFrame::Binary(Bytes::from_static(b"abc"))).await.unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            if let Some(TaggedEvent {
                event: TransportEvent::Message(frame),
                ..
            }) = rx_b.recv().await
            {
                received.push(frame);
            }
        }
        assert_eq!(received[0], DataFrame::Text("hello".to_string()));
        assert_eq!(received[1], DataFrame::Binary(Bytes::from_static(b"abc")));
        assert_eq!(channel.buffered_amount().await, 0);
    }

    #[tokio::test]
    async fn test_close_is_seen_as_disconnect_by_remote() {
        let network = MemoryNetwork::new();
        let (a, channel, _rx_a, b, mut rx_b) = connected_pair(&network).await;
        drain(&mut rx_b);

        a.close().await;
        assert!(!channel.is_open());
        assert_eq!(b.connection_state(), ConnectionState::Disconnected);

        let events = drain(&mut rx_b);
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::ConnectionStateChanged(ConnectionState::Disconnected)
        )));
        assert!(channel.send(DataFrame::Text("late".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let network = MemoryNetwork::new();
        let (sink_a, _rx) = sink(1);
        let a = network.factory().create(sink_a).unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        assert!(matches!(
            a.add_candidate(candidate).await,
            Err(TransportError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_remote_is_rejected() {
        let network = MemoryNetwork::new();
        let (sink_a, _rx) = sink(1);
        let a = network.factory().create(sink_a).unwrap();
        let bogus = SessionDescription::new(SdpType::Offer, "memory-offer nobody");
        assert!(a.set_remote_description(bogus).await.is_err());
        let garbage = SessionDescription::new(SdpType::Offer, "v=0");
        assert!(a.set_remote_description(garbage).await.is_err());
    }
}
