//! 信令模块
//!
//! 包含:
//! - 信令信封格式（与中继服务兼容的 JSON）
//! - `SignalingLink` 抽象
//! - WebSocket 实现（生产）和内存中继实现（测试/本地回环）

pub mod memory;
pub mod ws_link;

pub use memory::{MemoryRelay, RelayError, RelayLink, RelayMember};
pub use ws_link::WsSignalingLink;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::session::RemotePeer;
use crate::transport::{IceCandidate, SessionDescription};

/// 入站信封流
pub type SignalReceiver = mpsc::UnboundedReceiver<SignalMessage>;

/// 信封类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    PeerJoined,
    PeerDisconnected,
    Error,
}

/// 信令信封
///
/// `{ type, targetId?, senderId?, sessionId?, payload?, message? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<String>,
}

impl SignalMessage {
    pub fn new(kind: SignalType) -> Self {
        Self {
            kind,
            target_id: None,
            sender_id: None,
            session_id: None,
            payload: None,
            message: None,
            code: None,
            timestamp: None,
        }
    }

    pub fn offer(target_id: &str, description: &SessionDescription) -> Result<Self, SignalingError> {
        Ok(Self {
            target_id: Some(target_id.to_string()),
            payload: Some(serde_json::to_value(description)?),
            ..Self::new(SignalType::Offer)
        })
    }

    pub fn answer(target_id: &str, description: &SessionDescription) -> Result<Self, SignalingError> {
        Ok(Self {
            target_id: Some(target_id.to_string()),
            payload: Some(serde_json::to_value(description)?),
            ..Self::new(SignalType::Answer)
        })
    }

    pub fn ice_candidate(target_id: &str, candidate: &IceCandidate) -> Result<Self, SignalingError> {
        Ok(Self {
            target_id: Some(target_id.to_string()),
            payload: Some(serde_json::to_value(candidate)?),
            ..Self::new(SignalType::IceCandidate)
        })
    }

    /// 服务端通知: 有新成员加入，payload 为对方设备类型
    pub fn peer_joined(session_id: &str, peer_id: &str, device_type: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            sender_id: Some(peer_id.to_string()),
            payload: Some(Value::String(device_type.to_string())),
            ..Self::new(SignalType::PeerJoined)
        }
    }

    pub fn peer_disconnected(session_id: &str, peer_id: &str, reason: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            sender_id: Some(peer_id.to_string()),
            message: Some(reason.to_string()),
            ..Self::new(SignalType::PeerDisconnected)
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            code: Some(code.to_string()),
            message: Some(message.to_string()),
            ..Self::new(SignalType::Error)
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Decode(e.to_string()))
    }

    /// 解码为强类型事件
    pub fn into_event(self) -> Result<SignalEvent, SignalingError> {
        match self.kind {
            SignalType::Offer => {
                let sender_id = self
                    .sender_id
                    .ok_or_else(|| SignalingError::Decode("OFFER without senderId".to_string()))?;
                let description = decode_payload(self.payload, "OFFER")?;
                Ok(SignalEvent::Offer {
                    sender_id,
                    description,
                })
            }
            SignalType::Answer => Ok(SignalEvent::Answer {
                sender_id: self.sender_id,
                description: decode_payload(self.payload, "ANSWER")?,
            }),
            SignalType::IceCandidate => Ok(SignalEvent::IceCandidate {
                sender_id: self.sender_id,
                candidate: decode_payload(self.payload, "ICE_CANDIDATE")?,
            }),
            SignalType::PeerJoined => {
                let peer_id = self.sender_id.ok_or_else(|| {
                    SignalingError::Decode("PEER_JOINED without senderId".to_string())
                })?;
                let device_type = match self.payload {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => "UNKNOWN".to_string(),
                };
                Ok(SignalEvent::PeerJoined(RemotePeer {
                    peer_id,
                    device_type,
                }))
            }
            SignalType::PeerDisconnected => Ok(SignalEvent::PeerDisconnected {
                peer_id: self.sender_id,
                reason: self.message,
            }),
            SignalType::Error => Ok(SignalEvent::Error {
                code: self.code,
                message: self.message.unwrap_or_else(|| "unknown error".to_string()),
            }),
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    payload: Option<Value>,
    kind: &str,
) -> Result<T, SignalingError> {
    let payload =
        payload.ok_or_else(|| SignalingError::Decode(format!("{kind} without payload")))?;
    serde_json::from_value(payload).map_err(|e| SignalingError::Decode(format!("{kind}: {e}")))
}

/// 强类型的入站信令事件
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Offer {
        sender_id: String,
        description: SessionDescription,
    },
    Answer {
        sender_id: Option<String>,
        description: SessionDescription,
    },
    IceCandidate {
        sender_id: Option<String>,
        candidate: IceCandidate,
    },
    PeerJoined(RemotePeer),
    PeerDisconnected {
        peer_id: Option<String>,
        reason: Option<String>,
    },
    Error {
        code: Option<String>,
        message: String,
    },
}

/// 到中继服务的有序消息链路
///
/// 链路内保证有序，跨重连不保证送达。入站方向由创建链路时返回的
/// [`SignalReceiver`] 提供。
pub trait SignalingLink: Send + Sync {
    /// 发送信封，链路不可用时返回 `false`
    fn send(&self, message: SignalMessage) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SdpType;

    #[test]
    fn test_offer_wire_format() {
        let desc = SessionDescription::new(SdpType::Offer, "v=0");
        let msg = SignalMessage::offer("peer-b", &desc).unwrap();
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "OFFER");
        assert_eq!(json["targetId"], "peer-b");
        assert_eq!(json["payload"]["type"], "offer");
        assert_eq!(json["payload"]["sdp"], "v=0");
        assert!(json.get("senderId").is_none());
    }

    #[test]
    fn test_parse_peer_joined_from_server() {
        let text = r#"{
            "type": "PEER_JOINED",
            "sessionId": "s-1",
            "senderId": "peer-b",
            "payload": "MOBILE",
            "timestamp": "2025-11-19T15:30:00"
        }"#;
        let event = SignalMessage::from_json(text).unwrap().into_event().unwrap();
        assert_eq!(
            event,
            SignalEvent::PeerJoined(RemotePeer {
                peer_id: "peer-b".to_string(),
                device_type: "MOBILE".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_candidate_and_error() {
        let text = r#"{"type":"ICE_CANDIDATE","senderId":"a","payload":{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let event = SignalMessage::from_json(text).unwrap().into_event().unwrap();
        match event {
            SignalEvent::IceCandidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let text = r#"{"type":"ERROR","code":"INVALID_TOKEN","message":"Invalid or expired token"}"#;
        let event = SignalMessage::from_json(text).unwrap().into_event().unwrap();
        assert_eq!(
            event,
            SignalEvent::Error {
                code: Some("INVALID_TOKEN".to_string()),
                message: "Invalid or expired token".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_type_and_missing_payload_are_rejected() {
        assert!(SignalMessage::from_json(r#"{"type":"HELLO"}"#).is_err());
        assert!(SignalMessage::from_json("not json").is_err());

        let msg = SignalMessage::from_json(r#"{"type":"ANSWER"}"#).unwrap();
        assert!(matches!(msg.into_event(), Err(SignalingError::Decode(_))));
    }
}
