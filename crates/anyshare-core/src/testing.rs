//! 单元测试用的假协作方

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::TransportError;
use crate::signaling::{SignalMessage, SignalingLink};
use crate::transport::{
    ChannelOptions, ConnectionState, DataChannel, DataFrame, EventSink, IceCandidate, SdpType,
    SessionDescription, Transport, TransportFactory,
};

/// 记录所有发出信封的信令链路
#[derive(Default)]
pub struct RecordingLink {
    sent: Mutex<Vec<SignalMessage>>,
    closed: AtomicBool,
}

impl RecordingLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl SignalingLink for RecordingLink {
    fn send(&self, message: SignalMessage) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push(message);
        true
    }
}

/// `buffered_amount` 按脚本返回的数据通道
///
/// 脚本读完后返回 `fallback`。每次发送时记录当时已读取缓冲量的次数，
/// 用来断言背压等待发生在哪一块之前。
pub struct ScriptedChannel {
    label: String,
    open: AtomicBool,
    script: Mutex<VecDeque<usize>>,
    fallback: AtomicUsize,
    reads: AtomicUsize,
    sent: Mutex<Vec<(usize, DataFrame)>>,
}

impl ScriptedChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Self::with_script(label, &[])
    }

    pub fn with_script(label: &str, amounts: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(true),
            script: Mutex::new(amounts.iter().copied().collect()),
            fallback: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fallback(&self, amount: usize) {
        self.fallback.store(amount, Ordering::SeqCst);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<DataFrame> {
        self.sent.lock().unwrap().iter().map(|(_, f)| f.clone()).collect()
    }

    pub fn binary_frames(&self) -> Vec<Bytes> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, f)| match f {
                DataFrame::Binary(b) => Some(b.clone()),
                DataFrame::Text(_) => None,
            })
            .collect()
    }

    pub fn reads_at_binary_sends(&self) -> Vec<usize> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, f)| matches!(f, DataFrame::Binary(_)))
            .map(|(reads, _)| *reads)
            .collect()
    }
}

#[async_trait]
impl DataChannel for ScriptedChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.load(Ordering::SeqCst))
    }

    async fn send(&self, frame: DataFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let reads = self.reads.load(Ordering::SeqCst);
        self.sent.lock().unwrap().push((reads, frame));
        Ok(())
    }

    async fn close(&self) {
        self.set_open(false);
    }
}

/// 可控的假 Transport 工厂
#[derive(Default)]
pub struct FakeTransportFactory {
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
    stall_gathering: AtomicBool,
    reject_remote: Arc<AtomicBool>,
}

impl FakeTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stall_gathering(&self) {
        self.stall_gathering.store(true, Ordering::SeqCst);
    }

    pub fn reject_remote_descriptions(&self) {
        self.reject_remote.store(true, Ordering::SeqCst);
    }

    pub fn accept_remote_descriptions(&self) {
        self.reject_remote.store(false, Ordering::SeqCst);
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(&self, _events: EventSink) -> Result<Arc<dyn Transport>, TransportError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport {
            closed: self.closed.clone(),
            stall_gathering: self.stall_gathering.load(Ordering::SeqCst),
            reject_remote: self.reject_remote.clone(),
            local: Mutex::new(None),
        });
        Ok(transport)
    }
}

struct FakeTransport {
    closed: Arc<AtomicUsize>,
    stall_gathering: bool,
    reject_remote: Arc<AtomicBool>,
    local: Mutex<Option<SessionDescription>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn create_data_channel(
        &self,
        label: &str,
        _options: &ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel: Arc<dyn DataChannel> = ScriptedChannel::new(label);
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::new(SdpType::Offer, "fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::new(SdpType::Answer, "fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _desc: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.reject_remote.load(Ordering::SeqCst) {
            Err(TransportError::Rejected("fake rejection".to_string()))
        } else {
            Ok(())
        }
    }

    async fn add_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn gathering_complete(&self) {
        if self.stall_gathering {
            std::future::pending::<()>().await;
        }
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::New
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
