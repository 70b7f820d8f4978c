//! Server and session configuration

use crate::error::{Error, Result};
use crate::types::{CallId, GroupId, SessionId, UserId};
use serde::{Deserialize, Serialize};

/// Network configuration for the RTC server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP listen address. Empty or "0.0.0.0" means all IPv4 interfaces.
    pub ice_address_udp: String,
    /// UDP listen port shared by every session (single-port operation).
    pub ice_port_udp: u16,
    /// Explicit advertised address. When set, STUN discovery is skipped.
    pub ice_host_override: String,
    /// ICE servers handed to peers; `stun:` entries are also used for
    /// public address discovery at startup.
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ice_address_udp: String::new(),
            ice_port_udp: 8443,
            ice_host_override: String::new(),
            ice_servers: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.ice_port_udp == 0 {
            return Err(Error::Config("invalid ICEPortUDP value: 0".to_string()));
        }
        for srv in &self.ice_servers {
            srv.is_valid()?;
        }
        Ok(())
    }

    /// STUN server URLs usable for public address discovery.
    #[must_use]
    pub fn stun_urls(&self) -> Vec<String> {
        self.ice_servers
            .iter()
            .flat_map(|s| s.urls.iter())
            .filter(|u| u.starts_with("stun:"))
            .cloned()
            .collect()
    }
}

/// A single ICE server entry (STUN or TURN)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServerConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(Error::Config("invalid empty ICE server URLs".to_string()));
        }
        for url in &self.urls {
            if !url.starts_with("stun:") && !url.starts_with("turn:") && !url.starts_with("turns:")
            {
                return Err(Error::Config(format!("invalid ICE server URL: {url}")));
            }
        }
        Ok(())
    }
}

/// Identity of a session joining a call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(rename = "groupID")]
    pub group_id: GroupId,
    #[serde(rename = "callID")]
    pub call_id: CallId,
    #[serde(rename = "userID")]
    pub user_id: UserId,
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
}

impl SessionConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.group_id.is_empty() {
            return Err(Error::Config("invalid GroupID value: should not be empty".to_string()));
        }
        if self.call_id.is_empty() {
            return Err(Error::Config("invalid CallID value: should not be empty".to_string()));
        }
        if self.user_id.is_empty() {
            return Err(Error::Config("invalid UserID value: should not be empty".to_string()));
        }
        if self.session_id.is_empty() {
            return Err(Error::Config(
                "invalid SessionID value: should not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default_valid() {
        assert!(ServerConfig::default().is_valid().is_ok());
    }

    #[test]
    fn test_server_config_zero_port() {
        let cfg = ServerConfig {
            ice_port_udp: 0,
            ..Default::default()
        };
        assert!(cfg.is_valid().is_err());
    }

    #[test]
    fn test_server_config_bad_ice_url() {
        let cfg = ServerConfig {
            ice_servers: vec![IceServerConfig {
                urls: vec!["http://stun.example.com".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(cfg.is_valid().is_err());
    }

    #[test]
    fn test_stun_urls_filter() {
        let cfg = ServerConfig {
            ice_servers: vec![
                IceServerConfig {
                    urls: vec!["stun:stun.example.com:3478".to_string()],
                    ..Default::default()
                },
                IceServerConfig {
                    urls: vec!["turn:turn.example.com:3478".to_string()],
                    username: "u".to_string(),
                    credential: "p".to_string(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(cfg.stun_urls(), vec!["stun:stun.example.com:3478".to_string()]);
    }

    #[test]
    fn test_session_config_validation() {
        let mut cfg = SessionConfig {
            group_id: "g1".into(),
            call_id: "c1".into(),
            user_id: "u1".into(),
            session_id: "s1".into(),
        };
        assert!(cfg.is_valid().is_ok());

        cfg.session_id = SessionId::default();
        assert!(cfg.is_valid().is_err());
    }
}
