//! RTC server: UDP mux owner, message pump and session lifecycle
//!
//! The server terminates every peer connection on a single UDP port,
//! demultiplexes inbound embedder messages to the addressed session and
//! owns the group/call/session index.

use crate::bwe::BandwidthEstimator;
use crate::call::Group;
use crate::config::{ServerConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::msg::{Message, MessageType, ScreenOnPayload};
use crate::net::{create_udp_mux, create_udp_socket, system_ips, UDP_SOCKET_BUFFER_SIZE};
use crate::session::{CloseCallback, Session, AUDIO_LEVEL_EXTENSION_URI};
use crate::stun::discover_public_ip;
use crate::types::{GroupId, SessionId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_mux::UDPMux;
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

pub(crate) const MSG_CH_SIZE: usize = 256;

pub struct Server {
    cfg: ServerConfig,
    metrics: Arc<dyn Metrics>,

    api: RwLock<Option<Arc<API>>>,
    groups: RwLock<HashMap<GroupId, Arc<Group>>>,
    sessions: RwLock<HashMap<SessionId, SessionConfig>>,

    send_tx: mpsc::Sender<Message>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    receive_tx: mpsc::Sender<Message>,
    receive_rx: Mutex<Option<mpsc::Receiver<Message>>>,

    local_ips: RwLock<Vec<Ipv4Addr>>,
    public_addrs: RwLock<HashMap<Ipv4Addr, IpAddr>>,
    udp_mux: RwLock<Option<Arc<dyn UDPMux + Send + Sync>>>,

    shutdown: CancellationToken,
    drain_notify: Notify,
}

impl Server {
    pub fn new(cfg: ServerConfig, metrics: Arc<dyn Metrics>) -> Result<Arc<Self>> {
        cfg.is_valid()?;

        let (send_tx, send_rx) = mpsc::channel(MSG_CH_SIZE);
        let (receive_tx, receive_rx) = mpsc::channel(MSG_CH_SIZE);

        Ok(Arc::new(Self {
            cfg,
            metrics,
            api: RwLock::new(None),
            groups: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            receive_tx,
            receive_rx: Mutex::new(Some(receive_rx)),
            local_ips: RwLock::new(Vec::new()),
            public_addrs: RwLock::new(HashMap::new()),
            udp_mux: RwLock::new(None),
            shutdown: CancellationToken::new(),
            drain_notify: Notify::new(),
        }))
    }

    /// Queues an inbound message for the addressed session. Never blocks.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.send_tx.try_send(msg).map_err(|_| Error::ChannelFull)
    }

    /// Outbound messages (SDP, trickle ICE, VAD events). Can be taken once.
    pub fn receiver(&self) -> Option<mpsc::Receiver<Message>> {
        self.receive_rx.lock().take()
    }

    /// Binds the shared media socket, discovers public addresses and starts
    /// the message pump.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let ips = if self.cfg.ice_address_udp.is_empty() || self.cfg.ice_address_udp == "0.0.0.0" {
            debug!("going to listen on all supported interfaces");
            system_ips()?
        } else {
            let ip: Ipv4Addr = self
                .cfg
                .ice_address_udp
                .parse()
                .map_err(|_| Error::Config(format!("invalid address: {}", self.cfg.ice_address_udp)))?;
            vec![ip]
        };

        let stun_urls = self.cfg.stun_urls();
        if self.cfg.ice_host_override.is_empty() && !stun_urls.is_empty() {
            for ip in &ips {
                let local = SocketAddr::new(IpAddr::V4(*ip), self.cfg.ice_port_udp);
                match discover_public_ip(local, &stun_urls).await {
                    Ok(addr) => {
                        info!(local = %ip, public = %addr, "got public IP address for local interface");
                        self.public_addrs.write().insert(*ip, addr);
                    }
                    Err(err) => {
                        warn!(%err, local = %ip, "failed to get public IP address for local interface");
                    }
                }
            }
        }

        let listen_addr = if ips.len() == 1 {
            SocketAddr::new(IpAddr::V4(ips[0]), self.cfg.ice_port_udp)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.cfg.ice_port_udp)
        };

        let socket = create_udp_socket(listen_addr, UDP_SOCKET_BUFFER_SIZE)?;
        let mux = create_udp_mux(socket);
        *self.udp_mux.write() = Some(Arc::clone(&mux));
        *self.local_ips.write() = ips;

        let nat_ips = self.advertised_ips();
        let api = self.build_api(mux, nat_ips)?;
        *self.api.write() = Some(Arc::new(api));

        let rx = self
            .send_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Config("server already started".to_string()))?;
        tokio::spawn(Arc::clone(self).msg_reader(rx));

        info!(addr = %listen_addr, "rtc: server started");

        Ok(())
    }

    /// Waits for the last session to drain, then releases the socket.
    pub async fn stop(&self) -> Result<()> {
        loop {
            if self.sessions.read().is_empty() {
                debug!("rtc: no sessions ongoing, exiting");
                break;
            }
            info!("rtc: sessions ongoing, draining before exiting");
            self.drain_notify.notified().await;
        }

        self.shutdown.cancel();

        let mux = self.udp_mux.write().take();
        if let Some(mux) = mux {
            mux.close()
                .await
                .map_err(|err| Error::Webrtc(err.into()))?;
        }

        info!("rtc: server was shutdown");

        Ok(())
    }

    fn advertised_ips(&self) -> Vec<String> {
        if !self.cfg.ice_host_override.is_empty() {
            return vec![self.cfg.ice_host_override.clone()];
        }
        self.public_addrs
            .read()
            .values()
            .map(ToString::to_string)
            .collect()
    }

    fn build_api(
        &self,
        mux: Arc<dyn UDPMux + Send + Sync>,
        nat_ips: Vec<String>,
    ) -> Result<API> {
        let mut media_engine = MediaEngine::default();

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let video_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".to_owned(),
                parameter: String::new(),
            },
            RTCPFeedback {
                typ: "ccm".to_owned(),
                parameter: "fir".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: String::new(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "pli".to_owned(),
            },
        ];

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: video_feedback,
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: AUDIO_LEVEL_EXTENSION_URI.to_owned(),
            },
            RTPCodecType::Audio,
            None,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_udp_network(UDPNetwork::Muxed(mux));
        if !nat_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(nat_ips, RTCIceCandidateType::Host);
        }

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }

    // ---- message pump ---------------------------------------------------

    async fn msg_reader(self: Arc<Self>, mut rx: mpsc::Receiver<Message>) {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { return };
                    msg
                }
                _ = self.shutdown.cancelled() => return,
            };

            if let Err(err) = msg.is_valid() {
                error!(%err, mtype = ?msg.mtype, "invalid message");
                continue;
            }

            let session_id = SessionId::from(msg.session_id.as_str());
            let Some(cfg) = self.sessions.read().get(&session_id).cloned() else {
                error!(
                    session_id = %msg.session_id,
                    group_id = %msg.group_id,
                    mtype = ?msg.mtype,
                    "session not found"
                );
                continue;
            };

            let Some(group) = self.groups.read().get(&cfg.group_id).cloned() else {
                error!(group_id = %cfg.group_id, "group not found");
                continue;
            };
            let Some(call) = group.get_call(&cfg.call_id) else {
                error!(call_id = %cfg.call_id, "call not found");
                continue;
            };
            let Some(session) = call.get_session(&cfg.session_id) else {
                error!(session_id = %cfg.session_id, "session not found");
                continue;
            };

            match msg.mtype {
                MessageType::Ice => {
                    if session.enqueue_ice(msg.data).is_err() {
                        error!(session_id = %cfg.session_id, "failed to send ice message: channel is full");
                    }
                }
                MessageType::Sdp => {
                    let sdp: RTCSessionDescription = match serde_json::from_slice(&msg.data) {
                        Ok(sdp) => sdp,
                        Err(err) => {
                            error!(%err, session_id = %cfg.session_id, "failed to unmarshal sdp");
                            continue;
                        }
                    };

                    debug!(sdp_type = %sdp.sdp_type, session_id = %cfg.session_id, "signaling");

                    if let Err(err) = session.route_sdp(sdp) {
                        error!(%err, session_id = %cfg.session_id, "failed to route sdp message");
                    }
                }
                MessageType::ScreenOn => {
                    let payload: ScreenOnPayload = match serde_json::from_slice(&msg.data) {
                        Ok(p) => p,
                        Err(err) => {
                            error!(%err, "failed to unmarshal screen msg data");
                            continue;
                        }
                    };

                    debug!(
                        screen_stream_id = %payload.screen_stream_id,
                        "received screen sharing stream ID"
                    );

                    // First writer wins: a contested attempt is rejected
                    // and leaves the caller's stream ID untouched.
                    if call.set_screen_session(&session) {
                        session.set_screen_stream_id(payload.screen_stream_id);
                    } else {
                        error!(session_id = %cfg.session_id, "screen session is already set");
                    }
                }
                MessageType::ScreenOff => {
                    call.clear_screen_state(&session);
                }
                MessageType::Mute | MessageType::Unmute => {
                    let enabled = msg.mtype == MessageType::Unmute;
                    if !enabled {
                        debug!(session_id = %cfg.session_id, "resetting vad monitor for session");
                        session.reset_vad();
                    }

                    debug!(enabled, session_id = %cfg.session_id, "setting voice track state");
                    session.set_voice_enabled(enabled);
                }
                MessageType::VoiceOn | MessageType::VoiceOff => {
                    error!("received unexpected message type");
                }
            }
        }
    }

    // ---- session lifecycle ---------------------------------------------

    /// Creates the peer connection for a participant and registers the
    /// session in its group and call. `close_cb` runs exactly once on
    /// teardown.
    pub async fn add_session(
        self: &Arc<Self>,
        cfg: SessionConfig,
        bwe: Option<Arc<dyn BandwidthEstimator>>,
        close_cb: Option<CloseCallback>,
    ) -> Result<()> {
        cfg.is_valid()?;

        if self.sessions.read().contains_key(&cfg.session_id) {
            return Err(Error::SessionExists);
        }

        let api = self
            .api
            .read()
            .clone()
            .ok_or_else(|| Error::Config("server is not started".to_string()))?;

        let group = {
            let mut groups = self.groups.write();
            groups
                .entry(cfg.group_id.clone())
                .or_insert_with(|| Group::new(cfg.group_id.clone()))
                .clone()
        };
        let call = group.get_or_create_call(&cfg.call_id);

        let rtc_cfg = RTCConfiguration {
            ice_servers: self
                .cfg
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_cfg).await?);

        let out_voice_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            format!("voice-{}", cfg.session_id),
            format!("stream-{}", cfg.session_id),
        ));

        let internal_cb: CloseCallback = {
            let server = Arc::clone(self);
            let cfg = cfg.clone();
            Box::new(move || {
                server.remove_session_internal(&cfg);
                match close_cb {
                    Some(cb) => cb(),
                    None => Ok(()),
                }
            })
        };

        let session = Session::new(
            cfg.clone(),
            Arc::clone(&pc),
            out_voice_track,
            Arc::downgrade(&call),
            bwe,
            Arc::clone(&self.metrics),
            self.receive_tx.clone(),
            internal_cb,
        )?;

        if !call.add_session(Arc::clone(&session)) {
            return Err(Error::SessionExists);
        }
        self.sessions.write().insert(cfg.session_id.clone(), cfg.clone());

        // Trickle ICE back to the embedder.
        {
            let out_tx = self.receive_tx.clone();
            let ice_cfg = cfg.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let out_tx = out_tx.clone();
                let ice_cfg = ice_cfg.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate
                        .to_json()
                        .map_err(Error::from)
                        .and_then(|init| serde_json::to_vec(&init).map_err(Error::from))
                    {
                        Ok(data) => {
                            if out_tx
                                .try_send(Message::new(&ice_cfg, MessageType::Ice, data))
                                .is_err()
                            {
                                error!("failed to send ice message: channel is full");
                            }
                        }
                        Err(err) => {
                            error!(%err, "failed to encode ice candidate");
                        }
                    }
                })
            }));
        }

        // Media published by the participant.
        {
            let weak = Arc::downgrade(&session);
            pc.on_track(Box::new(move |track, receiver, _transceiver| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(session) = weak.upgrade() {
                        session.handle_remote_track(track, receiver).await;
                    }
                })
            }));
        }

        // Transport failure tears the session down.
        {
            let weak = Arc::downgrade(&session);
            let state_cfg = cfg.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let weak = weak.clone();
                let state_cfg = state_cfg.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            debug!(session_id = %state_cfg.session_id, %state, "peer connection state change");
                            if let Some(session) = weak.upgrade() {
                                // Off the event dispatch path: closing awaits
                                // the peer connection itself.
                                tokio::spawn(async move { session.close().await });
                            }
                        }
                        _ => {
                            debug!(session_id = %state_cfg.session_id, %state, "peer connection state change");
                        }
                    }
                })
            }));
        }

        // Media already flowing in the call reaches the newcomer.
        call.wire_new_session(&session);

        session.start();

        info!(
            session_id = %cfg.session_id,
            user_id = %cfg.user_id,
            call_id = %cfg.call_id,
            group_id = %cfg.group_id,
            "added session to call"
        );

        Ok(())
    }

    /// Embedder-initiated session teardown.
    pub async fn close_session(&self, session_id: &SessionId) -> Result<()> {
        let cfg = self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let session = self
            .groups
            .read()
            .get(&cfg.group_id)
            .and_then(|g| g.get_call(&cfg.call_id))
            .and_then(|c| c.get_session(&cfg.session_id))
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        session.close().await;

        Ok(())
    }

    /// Number of currently registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn remove_session_internal(&self, cfg: &SessionConfig) {
        self.sessions.write().remove(&cfg.session_id);

        let group = self.groups.read().get(&cfg.group_id).cloned();
        if let Some(group) = group {
            if let Some(call) = group.get_call(&cfg.call_id) {
                if let Some(session) = call.get_session(&cfg.session_id) {
                    // Releases the screen slot if the leaver held it.
                    call.clear_screen_state(&session);
                }
                call.remove_session(&cfg.session_id);
                if call.is_empty() {
                    debug!(call_id = %call.id, "removing empty call");
                    group.remove_call(&cfg.call_id);
                }
            }
            if group.is_empty() {
                debug!(group_id = %group.id, "removing empty group");
                self.groups.write().remove(&cfg.group_id);
            }
        }

        info!(session_id = %cfg.session_id, "removed session from call");

        if self.sessions.read().is_empty() {
            self.drain_notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullMetrics;

    fn test_server() -> Arc<Server> {
        Server::new(ServerConfig::default(), Arc::new(NullMetrics)).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let cfg = ServerConfig {
            ice_port_udp: 0,
            ..Default::default()
        };
        assert!(Server::new(cfg, Arc::new(NullMetrics)).is_err());
    }

    #[tokio::test]
    async fn test_stop_without_sessions_returns_immediately() {
        let server = test_server();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_session_requires_start() {
        let server = test_server();
        let cfg = SessionConfig {
            group_id: "g1".into(),
            call_id: "c1".into(),
            user_id: "u1".into(),
            session_id: "s1".into(),
        };
        assert!(server.add_session(cfg, None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_send_rejects_when_full() {
        let server = test_server();
        let cfg = SessionConfig {
            group_id: "g1".into(),
            call_id: "c1".into(),
            user_id: "u1".into(),
            session_id: "s1".into(),
        };
        // Without a running pump the channel eventually fills; every write
        // beyond the capacity is rejected instead of blocking.
        let mut saw_full = false;
        for _ in 0..=MSG_CH_SIZE {
            if server
                .send(Message::new(&cfg, MessageType::Mute, Vec::new()))
                .is_err()
            {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);
    }

    #[tokio::test]
    async fn test_receiver_taken_once() {
        let server = test_server();
        assert!(server.receiver().is_some());
        assert!(server.receiver().is_none());
    }
}
