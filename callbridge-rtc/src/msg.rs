//! Message envelope exchanged with the embedder
//!
//! A single inbound channel carries ICE candidates, SDP descriptions and
//! screen/mute state changes addressed to a session; the outbound channel
//! carries SDP, trickle ICE and voice-activity events back.

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ice,
    Sdp,
    ScreenOn,
    ScreenOff,
    Mute,
    Unmute,
    VoiceOn,
    VoiceOff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "groupID")]
    pub group_id: String,
    #[serde(rename = "callID")]
    pub call_id: String,
    #[serde(rename = "type")]
    pub mtype: MessageType,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(cfg: &SessionConfig, mtype: MessageType, data: Vec<u8>) -> Self {
        Self {
            session_id: cfg.session_id.to_string(),
            group_id: cfg.group_id.to_string(),
            call_id: cfg.call_id.to_string(),
            mtype,
            data,
        }
    }

    pub fn is_valid(&self) -> Result<()> {
        if self.session_id.is_empty() {
            return Err(Error::InvalidMessage("missing sessionID".to_string()));
        }
        if self.group_id.is_empty() {
            return Err(Error::InvalidMessage("missing groupID".to_string()));
        }
        if self.call_id.is_empty() {
            return Err(Error::InvalidMessage("missing callID".to_string()));
        }
        Ok(())
    }
}

/// Payload of a `ScreenOn` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenOnPayload {
    #[serde(rename = "screenStreamID")]
    pub screen_stream_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SessionConfig {
        SessionConfig {
            group_id: "g1".into(),
            call_id: "c1".into(),
            user_id: "u1".into(),
            session_id: "s1".into(),
        }
    }

    #[test]
    fn test_message_valid() {
        let msg = Message::new(&cfg(), MessageType::Mute, Vec::new());
        assert!(msg.is_valid().is_ok());
    }

    #[test]
    fn test_message_missing_ids() {
        let mut msg = Message::new(&cfg(), MessageType::Ice, Vec::new());
        msg.session_id.clear();
        assert!(msg.is_valid().is_err());

        let mut msg = Message::new(&cfg(), MessageType::Ice, Vec::new());
        msg.group_id.clear();
        assert!(msg.is_valid().is_err());

        let mut msg = Message::new(&cfg(), MessageType::Ice, Vec::new());
        msg.call_id.clear();
        assert!(msg.is_valid().is_err());
    }

    #[test]
    fn test_screen_on_payload() {
        let payload: ScreenOnPayload =
            serde_json::from_str(r#"{"screenStreamID": "streamX"}"#).unwrap();
        assert_eq!(payload.screen_stream_id, "streamX");
    }
}
