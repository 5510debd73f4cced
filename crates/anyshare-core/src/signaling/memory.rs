//! 进程内信令中继
//!
//! 行为与线上中继服务一致: 每个房间最多 2 个成员；新成员加入时向已有
//! 成员发送 `PEER_JOINED`；带 `targetId` 的信封只转发给目标，否则广播给
//! 其他成员；转发前由中继填写 `senderId`/`sessionId`/`timestamp`；成员
//! 断开时向剩余成员发送 `PEER_DISCONNECTED`。

use chrono::{TimeDelta, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{SignalMessage, SignalReceiver, SignalType, SignalingLink};
use crate::config::DeviceType;
use crate::room_code::RoomCode;
use crate::session::Session;

/// 每个房间的成员上限
pub const MAX_PEERS: usize = 2;

/// 房间有效期（分钟）
pub const SESSION_TTL_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Room {0} not found")]
    NotFound(String),

    #[error("Room {0} is full")]
    Full(String),

    #[error("Room {0} has expired")]
    Expired(String),
}

struct Member {
    peer_id: String,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

struct Room {
    room_code: RoomCode,
    expires_at: chrono::DateTime<Utc>,
    members: Vec<Member>,
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<String, Room>,
}

impl RelayState {
    fn room_by_code(&mut self, code: &RoomCode) -> Option<(&String, &mut Room)> {
        self.rooms.iter_mut().find(|(_, r)| &r.room_code == code)
    }
}

/// 内存中继
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

/// 中继成员: 会话信息、出站链路和入站信封流
pub struct RelayMember {
    pub session: Session,
    pub link: Arc<RelayLink>,
    pub inbound: SignalReceiver,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 创建房间，创建者成为第一个成员
    pub fn create_session(&self, device_type: DeviceType) -> RelayMember {
        let mut state = self.lock();

        let room_code = loop {
            let code = RoomCode::generate();
            if state.room_by_code(&code).is_none() {
                break code;
            }
        };
        let session_id = uuid::Uuid::new_v4().to_string();
        let expires_at = Utc::now() + TimeDelta::minutes(SESSION_TTL_MINUTES);

        let (member, session) = self.new_member(&session_id, &room_code, expires_at);
        state.rooms.insert(
            session_id.clone(),
            Room {
                room_code: room_code.clone(),
                expires_at,
                members: vec![member.0],
            },
        );

        info!(
            "Relay: created room {} ({}) for {} device",
            room_code,
            session_id,
            device_type.name()
        );
        RelayMember {
            session,
            link: member.1,
            inbound: member.2,
        }
    }

    /// 加入房间，已有成员会收到 `PEER_JOINED`
    pub fn join(
        &self,
        room_code: &RoomCode,
        device_type: DeviceType,
    ) -> Result<RelayMember, RelayError> {
        let mut state = self.lock();
        let (session_id, room) = state
            .room_by_code(room_code)
            .ok_or_else(|| RelayError::NotFound(room_code.to_string()))?;

        if Utc::now() > room.expires_at {
            return Err(RelayError::Expired(room_code.to_string()));
        }
        if room.members.len() >= MAX_PEERS {
            return Err(RelayError::Full(room_code.to_string()));
        }

        let session_id = session_id.clone();
        let (member, session) = self.new_member(&session_id, room_code, room.expires_at);

        let joined = SignalMessage {
            timestamp: Some(Utc::now().to_rfc3339()),
            ..SignalMessage::peer_joined(&session_id, &member.0.peer_id, device_type.name())
        };
        for other in &room.members {
            let _ = other.tx.send(joined.clone());
        }
        room.members.push(member.0);

        info!("Relay: peer {} joined room {}", session.local_peer_id, room_code);
        Ok(RelayMember {
            session,
            link: member.1,
            inbound: member.2,
        })
    }

    /// 房间当前成员数，房间不存在时为 `None`
    pub fn peers_in(&self, room_code: &RoomCode) -> Option<usize> {
        self.lock()
            .room_by_code(room_code)
            .map(|(_, room)| room.members.len())
    }

    fn new_member(
        &self,
        session_id: &str,
        room_code: &RoomCode,
        expires_at: chrono::DateTime<Utc>,
    ) -> ((Member, Arc<RelayLink>, SignalReceiver), Session) {
        let peer_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(RelayLink {
            relay: self.clone(),
            session_id: session_id.to_string(),
            peer_id: peer_id.clone(),
        });
        let session = Session {
            session_id: session_id.to_string(),
            room_code: room_code.clone(),
            local_peer_id: peer_id.clone(),
            token: uuid::Uuid::new_v4().to_string(),
            expires_at,
        };
        ((Member { peer_id, tx }, link, rx), session)
    }

    fn forward(&self, session_id: &str, sender_id: &str, mut message: SignalMessage) -> bool {
        let mut state = self.lock();
        let Some(room) = state.rooms.get_mut(session_id) else {
            return false;
        };
        let Some(sender) = room.members.iter().find(|m| m.peer_id == sender_id) else {
            return false;
        };

        message.sender_id = Some(sender_id.to_string());
        message.session_id = Some(session_id.to_string());
        message.timestamp = Some(Utc::now().to_rfc3339());

        match message.target_id.as_deref() {
            Some(target_id) => match room.members.iter().find(|m| m.peer_id == target_id) {
                Some(target) => {
                    debug!("Relay: {:?} {} -> {}", message.kind, sender_id, target_id);
                    let _ = target.tx.send(message);
                }
                None => {
                    warn!("Relay: target peer {} not found", target_id);
                    let _ = sender.tx.send(SignalMessage::error(
                        "PEER_NOT_FOUND",
                        &format!("Target peer {target_id} not found or not connected"),
                    ));
                }
            },
            None => {
                for other in room.members.iter().filter(|m| m.peer_id != sender_id) {
                    let _ = other.tx.send(message.clone());
                }
            }
        }
        true
    }

    fn leave(&self, session_id: &str, peer_id: &str) {
        let mut state = self.lock();
        let Some(room) = state.rooms.get_mut(session_id) else {
            return;
        };
        let before = room.members.len();
        room.members.retain(|m| m.peer_id != peer_id);
        if room.members.len() == before {
            return;
        }

        info!("Relay: peer {} left room {}", peer_id, room.room_code);
        let notice = SignalMessage {
            timestamp: Some(Utc::now().to_rfc3339()),
            ..SignalMessage::peer_disconnected(session_id, peer_id, "Connection closed")
        };
        for other in &room.members {
            let _ = other.tx.send(notice.clone());
        }
        if room.members.is_empty() {
            state.rooms.remove(session_id);
        }
    }
}

/// 某个成员到中继的出站链路，丢弃时自动离开房间
pub struct RelayLink {
    relay: MemoryRelay,
    session_id: String,
    peer_id: String,
}

impl RelayLink {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// 主动断开，自己的入站流随之结束
    pub fn disconnect(&self) {
        self.relay.leave(&self.session_id, &self.peer_id);
    }
}

impl SignalingLink for RelayLink {
    fn send(&self, message: SignalMessage) -> bool {
        if message.kind == SignalType::PeerJoined || message.kind == SignalType::PeerDisconnected {
            warn!("Relay: clients may not send {:?}", message.kind);
            return false;
        }
        self.relay.forward(&self.session_id, &self.peer_id, message)
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.relay.leave(&self.session_id, &self.peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalEvent;
    use crate::transport::{SdpType, SessionDescription};

    #[test]
    fn test_join_notifies_existing_member() {
        let relay = MemoryRelay::new();
        let mut host = relay.create_session(DeviceType::Desktop);
        let guest = relay
            .join(&host.session.room_code, DeviceType::Mobile)
            .unwrap();

        assert_eq!(guest.session.session_id, host.session.session_id);
        assert_eq!(relay.peers_in(&host.session.room_code), Some(2));

        let event = host.inbound.try_recv().unwrap().into_event().unwrap();
        match event {
            SignalEvent::PeerJoined(peer) => {
                assert_eq!(peer.peer_id, guest.session.local_peer_id);
                assert_eq!(peer.device_type, "MOBILE");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_room_is_capped_at_two_peers() {
        let relay = MemoryRelay::new();
        let host = relay.create_session(DeviceType::Desktop);
        let _guest = relay.join(&host.session.room_code, DeviceType::Mobile).unwrap();

        let third = relay.join(&host.session.room_code, DeviceType::Tablet);
        assert!(matches!(third, Err(RelayError::Full(_))));

        let missing = relay.join(&RoomCode::parse("NOPE-0000").unwrap(), DeviceType::Mobile);
        assert!(matches!(missing, Err(RelayError::NotFound(_))));
    }

    #[test]
    fn test_forward_stamps_sender_and_session() {
        let relay = MemoryRelay::new();
        let host = relay.create_session(DeviceType::Desktop);
        let mut guest = relay.join(&host.session.room_code, DeviceType::Mobile).unwrap();

        let offer = SignalMessage::offer(
            &guest.session.local_peer_id,
            &SessionDescription::new(SdpType::Offer, "v=0"),
        )
        .unwrap();
        assert!(host.link.send(offer));

        let received = guest.inbound.try_recv().unwrap();
        assert_eq!(received.kind, SignalType::Offer);
        assert_eq!(received.sender_id.as_deref(), Some(host.session.local_peer_id.as_str()));
        assert_eq!(received.session_id.as_deref(), Some(host.session.session_id.as_str()));
        assert!(received.timestamp.is_some());
    }

    #[test]
    fn test_unknown_target_gets_error_back() {
        let relay = MemoryRelay::new();
        let mut host = relay.create_session(DeviceType::Desktop);

        let offer = SignalMessage::offer("ghost", &SessionDescription::new(SdpType::Offer, "v=0"))
            .unwrap();
        assert!(host.link.send(offer));

        let reply = host.inbound.try_recv().unwrap();
        assert_eq!(reply.kind, SignalType::Error);
        assert_eq!(reply.code.as_deref(), Some("PEER_NOT_FOUND"));
    }

    #[test]
    fn test_dropping_link_notifies_remaining_member() {
        let relay = MemoryRelay::new();
        let mut host = relay.create_session(DeviceType::Desktop);
        let guest = relay.join(&host.session.room_code, DeviceType::Mobile).unwrap();
        let guest_id = guest.session.local_peer_id.clone();
        let _ = host.inbound.try_recv();

        drop(guest);

        let notice = host.inbound.try_recv().unwrap();
        assert_eq!(notice.kind, SignalType::PeerDisconnected);
        assert_eq!(notice.sender_id.as_deref(), Some(guest_id.as_str()));
        assert_eq!(notice.message.as_deref(), Some("Connection closed"));
        assert_eq!(relay.peers_in(&host.session.room_code), Some(1));
    }

    #[tokio::test]
    async fn test_disconnect_closes_own_inbound() {
        let relay = MemoryRelay::new();
        let mut host = relay.create_session(DeviceType::Desktop);
        host.link.disconnect();
        assert!(host.inbound.recv().await.is_none());
        assert!(!host.link.send(SignalMessage::error("X", "y")));
    }
}
