//! Per-participant WebRTC endpoint
//!
//! A session owns the peer connection for one call participant together
//! with the signaling state around it: inbound ICE and SDP channels, the
//! outbound voice track, the per-layer screen tracks while someone shares,
//! and the serialized add/remove track negotiation.

use crate::bwe::BandwidthEstimator;
use crate::call::Call;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::msg::{Message, MessageType};
use crate::rate::RateMonitor;
use crate::simulcast::{new_out_screen_track, normalize_rid, SIMULCAST_LEVEL_DEFAULT};
use crate::vad::{VadConfig, VadMonitor};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp::extension::audio_level_extension::AudioLevelExtension;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::{MarshalSize, Unmarshal};

pub(crate) const SIGNAL_CH_SIZE: usize = 20;
pub(crate) const TRACKS_CH_SIZE: usize = 100;
pub(crate) const SIGNALING_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const AUDIO_LEVEL_EXTENSION_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

/// Sampling window for the per-layer screen rate monitors.
const SCREEN_RATE_WINDOW: Duration = Duration::from_secs(2);
/// How often subscribers re-evaluate their simulcast level.
const LAYER_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Invoked exactly once when the session is torn down.
pub type CloseCallback = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Negotiation work serialized through the per-session track channel.
pub(crate) enum TrackAction {
    Add {
        track: Arc<dyn TrackLocal + Send + Sync>,
        rid: Option<String>,
    },
    Remove {
        track: Arc<dyn TrackLocal + Send + Sync>,
    },
    /// Remove whatever screen video track this session currently receives.
    RemoveScreen,
}

pub struct Session {
    pub(crate) cfg: SessionConfig,
    pub(crate) pc: Arc<RTCPeerConnection>,

    ice_tx: mpsc::Sender<Vec<u8>>,
    ice_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    sdp_offer_tx: mpsc::Sender<RTCSessionDescription>,
    sdp_offer_rx: Mutex<Option<mpsc::Receiver<RTCSessionDescription>>>,
    sdp_answer_tx: mpsc::Sender<RTCSessionDescription>,
    sdp_answer_rx: AsyncMutex<mpsc::Receiver<RTCSessionDescription>>,
    track_tx: mpsc::Sender<TrackAction>,
    track_rx: Mutex<Option<mpsc::Receiver<TrackAction>>>,

    out_voice_track: Arc<TrackLocalStaticRTP>,
    state: RwLock<SessionState>,

    bwe: Option<Arc<dyn BandwidthEstimator>>,
    vad: Arc<VadMonitor>,

    close_token: CancellationToken,
    closed: AtomicBool,
    close_cb: Mutex<Option<CloseCallback>>,

    call: Weak<Call>,
    metrics: Arc<dyn Metrics>,
    out_tx: mpsc::Sender<Message>,
}

#[derive(Default)]
struct SessionState {
    out_voice_enabled: bool,
    voice_published: bool,
    screen_stream_id: String,
    out_screen_tracks: HashMap<String, Arc<TrackLocalStaticRTP>>,
    out_screen_audio_track: Option<Arc<TrackLocalStaticRTP>>,
    remote_screen_tracks: HashMap<String, Arc<TrackRemote>>,
    screen_rate_monitors: HashMap<String, Arc<RateMonitor>>,
    screen_track_sender: Option<Arc<RTCRtpSender>>,
    /// RID of the layer this session currently receives.
    screen_rid: String,
    making_offer: bool,
}

fn kind_str(kind: RTPCodecType) -> &'static str {
    match kind {
        RTPCodecType::Audio => "audio",
        _ => "video",
    }
}

fn is_closed_err(err: &webrtc::Error) -> bool {
    err.to_string().contains("closed")
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cfg: SessionConfig,
        pc: Arc<RTCPeerConnection>,
        out_voice_track: Arc<TrackLocalStaticRTP>,
        call: Weak<Call>,
        bwe: Option<Arc<dyn BandwidthEstimator>>,
        metrics: Arc<dyn Metrics>,
        out_tx: mpsc::Sender<Message>,
        close_cb: CloseCallback,
    ) -> Result<Arc<Self>> {
        let (ice_tx, ice_rx) = mpsc::channel(SIGNAL_CH_SIZE);
        let (sdp_offer_tx, sdp_offer_rx) = mpsc::channel(SIGNAL_CH_SIZE);
        let (sdp_answer_tx, sdp_answer_rx) = mpsc::channel(SIGNAL_CH_SIZE);
        let (track_tx, track_rx) = mpsc::channel(TRACKS_CH_SIZE);

        let vad = {
            let out_tx = out_tx.clone();
            let vad_cfg = cfg.clone();
            Arc::new(VadMonitor::new(
                VadConfig::default(),
                move |voice| {
                    debug!(session_id = %vad_cfg.session_id, voice, "vad");
                    let mtype = if voice {
                        MessageType::VoiceOn
                    } else {
                        MessageType::VoiceOff
                    };
                    if out_tx
                        .try_send(Message::new(&vad_cfg, mtype, Vec::new()))
                        .is_err()
                    {
                        error!("failed to send VAD message: channel is full");
                    }
                },
                None,
            )?)
        };

        Ok(Arc::new(Self {
            cfg,
            pc,
            ice_tx,
            ice_rx: Mutex::new(Some(ice_rx)),
            sdp_offer_tx,
            sdp_offer_rx: Mutex::new(Some(sdp_offer_rx)),
            sdp_answer_tx,
            sdp_answer_rx: AsyncMutex::new(sdp_answer_rx),
            track_tx,
            track_rx: Mutex::new(Some(track_rx)),
            out_voice_track,
            state: RwLock::new(SessionState::default()),
            bwe,
            vad,
            close_token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_cb: Mutex::new(Some(close_cb)),
            call,
            metrics,
            out_tx,
        }))
    }

    /// Spawns the long-running session tasks.
    pub(crate) fn start(self: &Arc<Self>) {
        if let Some(rx) = self.ice_rx.lock().take() {
            tokio::spawn(Arc::clone(self).handle_ice(rx));
        }
        if let Some(rx) = self.sdp_offer_rx.lock().take() {
            tokio::spawn(Arc::clone(self).handle_offers(rx));
        }
        if let Some(rx) = self.track_rx.lock().take() {
            tokio::spawn(Arc::clone(self).handle_track_actions(rx));
        }
        tokio::spawn(Arc::clone(self).monitor_simulcast_layer());
    }

    // ---- accessors ----------------------------------------------------

    pub(crate) fn session_id(&self) -> &crate::types::SessionId {
        &self.cfg.session_id
    }

    pub(crate) fn out_voice_track(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.out_voice_track)
    }

    pub(crate) fn voice_published(&self) -> bool {
        self.state.read().voice_published
    }

    pub(crate) fn has_screen_sender(&self) -> bool {
        self.state.read().screen_track_sender.is_some()
    }

    pub(crate) fn screen_stream_id(&self) -> String {
        self.state.read().screen_stream_id.clone()
    }

    pub(crate) fn set_screen_stream_id(&self, id: String) {
        self.state.write().screen_stream_id = id;
    }

    pub(crate) fn out_screen_track(&self, rid: &str) -> Option<Arc<TrackLocalStaticRTP>> {
        self.state
            .read()
            .out_screen_tracks
            .get(normalize_rid(rid))
            .cloned()
    }

    /// Best outbound screen track for a desired level, falling back to the
    /// default layer when the level is not published.
    pub(crate) fn screen_track_for_level(
        &self,
        level: &str,
    ) -> Option<(String, Arc<TrackLocalStaticRTP>)> {
        let state = self.state.read();
        if let Some(track) = state.out_screen_tracks.get(level) {
            return Some((level.to_string(), Arc::clone(track)));
        }
        state
            .out_screen_tracks
            .get(SIMULCAST_LEVEL_DEFAULT)
            .map(|track| (SIMULCAST_LEVEL_DEFAULT.to_string(), Arc::clone(track)))
    }

    pub(crate) fn out_screen_audio_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.state.read().out_screen_audio_track.clone()
    }

    pub(crate) fn remote_screen_track(&self, rid: &str) -> Option<Arc<TrackRemote>> {
        self.state
            .read()
            .remote_screen_tracks
            .get(normalize_rid(rid))
            .cloned()
    }

    /// Bitrate currently observed on one of the presenter's layers.
    pub fn source_rate(&self, rid: &str) -> i64 {
        let state = self.state.read();
        match state.screen_rate_monitors.get(normalize_rid(rid)) {
            Some(monitor) => monitor.rate().0,
            None => {
                warn!(session_id = %self.cfg.session_id, rid, "rate monitor should not be nil");
                -1
            }
        }
    }

    /// Simulcast level this session should consume given its current
    /// bandwidth estimate.
    pub fn expected_simulcast_level(&self) -> &'static str {
        match &self.bwe {
            Some(bwe) => crate::simulcast::level_for_rate(bwe.target_bitrate()),
            None => SIMULCAST_LEVEL_DEFAULT,
        }
    }

    pub(crate) fn set_voice_enabled(&self, enabled: bool) {
        self.state.write().out_voice_enabled = enabled;
    }

    pub(crate) fn voice_enabled(&self) -> bool {
        self.state.read().out_voice_enabled
    }

    pub(crate) fn reset_vad(&self) {
        self.vad.reset();
    }

    pub(crate) fn clear_screen_local_state(&self) {
        let mut state = self.state.write();
        state.screen_stream_id.clear();
        state.out_screen_tracks.clear();
        state.out_screen_audio_track = None;
        state.remote_screen_tracks.clear();
        state.screen_rate_monitors.clear();
    }

    // ---- inbound dispatch ----------------------------------------------

    pub(crate) fn enqueue_ice(&self, data: Vec<u8>) -> Result<()> {
        self.ice_tx.try_send(data).map_err(|_| Error::ChannelFull)
    }

    /// Routes an SDP description coming from the remote. Offers colliding
    /// with our own pending offer are dropped; the remote retries.
    pub(crate) fn route_sdp(&self, sdp: RTCSessionDescription) -> Result<()> {
        match sdp.sdp_type {
            RTCSdpType::Offer => {
                if self.has_signaling_conflict() {
                    debug!(
                        session_id = %self.cfg.session_id,
                        "signaling conflict detected, ignoring offer"
                    );
                    return Ok(());
                }
                self.sdp_offer_tx
                    .try_send(sdp)
                    .map_err(|_| Error::ChannelFull)
            }
            RTCSdpType::Answer => self
                .sdp_answer_tx
                .try_send(sdp)
                .map_err(|_| Error::ChannelFull),
            other => Err(Error::InvalidMessage(format!(
                "unexpected sdp type: {other}"
            ))),
        }
    }

    pub(crate) fn enqueue_track_action(&self, action: TrackAction) -> Result<()> {
        self.track_tx
            .try_send(action)
            .map_err(|_| Error::ChannelFull)
    }

    pub(crate) fn has_signaling_conflict(&self) -> bool {
        self.state.read().making_offer
            || self.pc.signaling_state() != RTCSignalingState::Stable
    }

    // ---- signaling ------------------------------------------------------

    async fn handle_ice(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        loop {
            tokio::select! {
                data = rx.recv() => {
                    let Some(data) = data else { return };

                    let candidate: RTCIceCandidateInit = match serde_json::from_slice(&data) {
                        Ok(c) => c,
                        Err(err) => {
                            error!(%err, session_id = %self.cfg.session_id, "failed to decode ice candidate");
                            continue;
                        }
                    };

                    if candidate.candidate.is_empty() {
                        continue;
                    }

                    debug!(session_id = %self.cfg.session_id, "setting ICE candidate for remote");

                    if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                        error!(%err, session_id = %self.cfg.session_id, "failed to add ice candidate");
                        self.metrics.inc_rtc_errors(self.cfg.group_id.as_str(), "ice");
                    }
                }
                _ = self.close_token.cancelled() => return,
            }
        }
    }

    async fn handle_offers(self: Arc<Self>, mut rx: mpsc::Receiver<RTCSessionDescription>) {
        loop {
            tokio::select! {
                offer = rx.recv() => {
                    let Some(offer) = offer else { return };
                    if let Err(err) = self.signaling(offer).await {
                        error!(%err, session_id = %self.cfg.session_id, "failed to handle offer");
                        self.metrics.inc_rtc_errors(self.cfg.group_id.as_str(), "signaling");
                    }
                }
                _ = self.close_token.cancelled() => return,
            }
        }
    }

    /// Applies a remote offer and answers it.
    async fn signaling(&self, offer: RTCSessionDescription) -> Result<()> {
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::InvalidMessage("missing local description".to_string()))?;

        self.send_out(MessageType::Sdp, serde_json::to_vec(&local)?)
    }

    fn send_out(&self, mtype: MessageType, data: Vec<u8>) -> Result<()> {
        self.out_tx
            .try_send(Message::new(&self.cfg, mtype, data))
            .map_err(|_| Error::ChannelFull)
    }

    async fn send_offer(&self) -> Result<()> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::InvalidMessage("missing local description".to_string()))?;

        self.send_out(MessageType::Sdp, serde_json::to_vec(&local)?)
    }

    /// Waits for the remote answer to a locally initiated renegotiation.
    /// `Ok(None)` means the session closed while waiting.
    async fn await_answer(&self) -> Result<Option<RTCSessionDescription>> {
        let mut rx = self.sdp_answer_rx.lock().await;
        tokio::select! {
            answer = rx.recv() => Ok(answer),
            _ = tokio::time::sleep(SIGNALING_TIMEOUT) => Err(Error::SignalingTimeout),
            _ = self.close_token.cancelled() => {
                debug!(session_id = %self.cfg.session_id, "session closed during signaling");
                Ok(None)
            }
        }
    }

    // ---- track negotiation ---------------------------------------------

    async fn handle_track_actions(self: Arc<Self>, mut rx: mpsc::Receiver<TrackAction>) {
        loop {
            let action = tokio::select! {
                action = rx.recv() => {
                    let Some(action) = action else { return };
                    action
                }
                _ = self.close_token.cancelled() => return,
            };

            let res = match action {
                TrackAction::Add { track, rid } => self.add_track(track, rid).await,
                TrackAction::Remove { track } => self.remove_track(track).await,
                TrackAction::RemoveScreen => {
                    let sender = self.state.read().screen_track_sender.clone();
                    match sender {
                        Some(sender) => match sender.track().await {
                            Some(track) => self.remove_track(track).await,
                            None => Ok(()),
                        },
                        None => Ok(()),
                    }
                }
            };

            if let Err(err) = res {
                error!(%err, session_id = %self.cfg.session_id, "track negotiation failed");
                self.metrics
                    .inc_rtc_errors(self.cfg.group_id.as_str(), "signaling");
            }
        }
    }

    /// Adds the given track to the peer connection and renegotiates. The
    /// `making_offer` window spans from before the offer is emitted until
    /// the answer is applied or the wait gives up.
    pub(crate) async fn add_track(
        self: &Arc<Self>,
        track: Arc<dyn TrackLocal + Send + Sync>,
        rid: Option<String>,
    ) -> Result<()> {
        debug!(
            session_id = %self.cfg.session_id,
            track_id = track.id(),
            "addTrack"
        );

        self.state.write().making_offer = true;
        let res = self.add_track_inner(track, rid).await;
        self.state.write().making_offer = false;
        res
    }

    async fn add_track_inner(
        self: &Arc<Self>,
        track: Arc<dyn TrackLocal + Send + Sync>,
        rid: Option<String>,
    ) -> Result<()> {
        for sender in self.pc.get_senders().await {
            if let Some(existing) = sender.track().await {
                if existing.id() == track.id() && existing.stream_id() == track.stream_id() {
                    return Err(Error::SenderExists);
                }
            }
        }

        let kind = track.kind();
        if kind == RTPCodecType::Video && self.state.read().screen_track_sender.is_some() {
            return Err(Error::ScreenBusy);
        }

        let sender = self.pc.add_track(Arc::clone(&track)).await?;
        self.metrics
            .inc_rtp_tracks(self.cfg.group_id.as_str(), "out", kind_str(kind));

        tokio::spawn(Arc::clone(self).handle_sender_rtcp(Arc::clone(&sender)));

        let res: Result<Option<RTCSessionDescription>> = async {
            self.send_offer().await?;
            self.await_answer().await
        }
        .await;

        match res {
            Ok(Some(answer)) => {
                if let Err(err) = self.pc.set_remote_description(answer).await {
                    self.detach_sender(&sender, kind).await;
                    return Err(err.into());
                }
                if kind == RTPCodecType::Video {
                    let mut state = self.state.write();
                    state.screen_track_sender = Some(sender);
                    state.screen_rid = rid.unwrap_or_else(|| SIMULCAST_LEVEL_DEFAULT.to_string());
                }
                Ok(())
            }
            // Closed while waiting; teardown takes it from here.
            Ok(None) => Ok(()),
            Err(err) => {
                self.detach_sender(&sender, kind).await;
                Err(err)
            }
        }
    }

    async fn detach_sender(&self, sender: &Arc<RTCRtpSender>, kind: RTPCodecType) {
        if let Err(err) = sender.replace_track(None).await {
            error!(%err, session_id = %self.cfg.session_id, "failed to replace track");
        } else {
            self.metrics
                .dec_rtp_tracks(self.cfg.group_id.as_str(), "out", kind_str(kind));
        }
    }

    /// Removes the given track from the peer connection and renegotiates.
    pub(crate) async fn remove_track(
        self: &Arc<Self>,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<()> {
        debug!(
            session_id = %self.cfg.session_id,
            track_id = track.id(),
            "removeTrack"
        );

        let mut found = None;
        for sender in self.pc.get_senders().await {
            if let Some(existing) = sender.track().await {
                if existing.id() == track.id() && existing.stream_id() == track.stream_id() {
                    found = Some(sender);
                    break;
                }
            }
        }

        let sender =
            found.ok_or_else(|| Error::InvalidTrack("failed to find sender for track".to_string()))?;

        self.pc.remove_track(&sender).await?;
        self.metrics
            .dec_rtp_tracks(self.cfg.group_id.as_str(), "out", kind_str(track.kind()));

        {
            let mut state = self.state.write();
            if state
                .screen_track_sender
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, &sender))
            {
                state.screen_track_sender = None;
                state.screen_rid.clear();
            }
        }

        self.send_offer().await?;

        match self.await_answer().await? {
            Some(answer) => {
                self.pc.set_remote_description(answer).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    // ---- RTCP ----------------------------------------------------------

    async fn handle_receiver_rtcp(self: Arc<Self>, receiver: Arc<RTCRtpReceiver>) {
        loop {
            tokio::select! {
                res = receiver.read_rtcp() => {
                    if let Err(err) = res {
                        if !is_closed_err(&err) {
                            error!(%err, session_id = %self.cfg.session_id, "failed to read RTCP packet");
                            self.metrics.inc_rtc_errors(self.cfg.group_id.as_str(), "rtp");
                        }
                        return;
                    }
                }
                _ = self.close_token.cancelled() => return,
            }
        }
    }

    /// Listens for RTCP from a peer receiving one of our outbound tracks.
    /// A PLI is forwarded to the presenter so it generates a keyframe.
    async fn handle_sender_rtcp(self: Arc<Self>, sender: Arc<RTCRtpSender>) {
        loop {
            let pkts = tokio::select! {
                res = sender.read_rtcp() => {
                    match res {
                        Ok((pkts, _)) => pkts,
                        Err(err) => {
                            if !is_closed_err(&err) {
                                error!(%err, session_id = %self.cfg.session_id, "failed to read RTCP packet");
                                self.metrics.inc_rtc_errors(self.cfg.group_id.as_str(), "rtp");
                            }
                            return;
                        }
                    }
                }
                _ = self.close_token.cancelled() => return,
            };

            for pkt in pkts {
                if pkt
                    .as_any()
                    .downcast_ref::<PictureLossIndication>()
                    .is_some()
                {
                    if let Err(err) = self.forward_pli().await {
                        error!(%err, session_id = %self.cfg.session_id, "failed to forward PLI");
                        return;
                    }
                }
            }
        }
    }

    async fn forward_pli(&self) -> Result<()> {
        let call = self
            .call
            .upgrade()
            .ok_or_else(|| Error::CallNotFound(self.cfg.call_id.to_string()))?;

        let screen_session = call
            .screen_session()
            .ok_or_else(|| Error::SessionNotFound("screen session should not be nil".to_string()))?;

        let rid = {
            let state = self.state.read();
            normalize_rid(&state.screen_rid).to_string()
        };

        let remote = screen_session
            .remote_screen_track(&rid)
            .ok_or_else(|| Error::InvalidTrack("screen track should not be nil".to_string()))?;

        screen_session
            .pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: remote.ssrc(),
            })])
            .await?;

        Ok(())
    }

    // ---- media ingest and forwarding -------------------------------------

    /// Entry point for tracks published by the remote peer.
    pub(crate) async fn handle_remote_track(
        self: &Arc<Self>,
        track: Arc<TrackRemote>,
        receiver: Arc<RTCRtpReceiver>,
    ) {
        tokio::spawn(Arc::clone(self).handle_receiver_rtcp(Arc::clone(&receiver)));

        let screen_stream_id = self.screen_stream_id();

        match track.kind() {
            RTPCodecType::Audio
                if !screen_stream_id.is_empty() && track.stream_id() == screen_stream_id =>
            {
                self.start_screen_audio(track).await;
            }
            RTPCodecType::Audio => self.start_voice(track, receiver).await,
            RTPCodecType::Video => {
                if screen_stream_id.is_empty() || track.stream_id() != screen_stream_id {
                    warn!(
                        session_id = %self.cfg.session_id,
                        stream_id = %track.stream_id(),
                        "video track does not match the announced screen stream"
                    );
                    return;
                }
                self.start_screen_video(track).await;
            }
            _ => warn!(session_id = %self.cfg.session_id, "unsupported track kind"),
        }
    }

    async fn start_voice(self: &Arc<Self>, track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>) {
        self.metrics
            .inc_rtp_tracks(self.cfg.group_id.as_str(), "in", "audio");
        self.state.write().voice_published = true;

        let ext_id = receiver
            .get_parameters()
            .await
            .header_extensions
            .iter()
            .find(|ext| ext.uri == AUDIO_LEVEL_EXTENSION_URI)
            .map(|ext| ext.id as u8);

        // Everyone else in the call subscribes to our voice.
        if let Some(call) = self.call.upgrade() {
            for other in call.sessions_snapshot() {
                if other.session_id() == self.session_id() {
                    continue;
                }
                if other
                    .enqueue_track_action(TrackAction::Add {
                        track: self.out_voice_track() as Arc<dyn TrackLocal + Send + Sync>,
                        rid: None,
                    })
                    .is_err()
                {
                    error!(
                        session_id = %other.session_id(),
                        "failed to enqueue track action: channel is full"
                    );
                }
            }
        }

        tokio::spawn(Arc::clone(self).forward_voice(track, ext_id));
    }

    async fn forward_voice(self: Arc<Self>, track: Arc<TrackRemote>, ext_id: Option<u8>) {
        loop {
            let pkt = tokio::select! {
                res = track.read_rtp() => {
                    match res {
                        Ok((pkt, _)) => pkt,
                        Err(err) => {
                            if !is_closed_err(&err) {
                                error!(%err, session_id = %self.cfg.session_id, "failed to read RTP packet");
                                self.metrics.inc_rtc_errors(self.cfg.group_id.as_str(), "rtp");
                            }
                            break;
                        }
                    }
                }
                _ = self.close_token.cancelled() => break,
            };

            if let Some(id) = ext_id {
                if let Some(payload) = pkt.header.get_extension(id) {
                    let mut buf = payload;
                    if let Ok(ext) = AudioLevelExtension::unmarshal(&mut buf) {
                        self.vad.push_audio_level(ext.level);
                    }
                }
            }

            if !self.voice_enabled() {
                continue;
            }

            if let Err(err) = self.out_voice_track.write_rtp(&pkt).await {
                if !is_closed_err(&err) {
                    error!(%err, session_id = %self.cfg.session_id, "failed to write voice RTP packet");
                    self.metrics.inc_rtc_errors(self.cfg.group_id.as_str(), "rtp");
                }
            }
        }

        self.metrics
            .dec_rtp_tracks(self.cfg.group_id.as_str(), "in", "audio");
    }

    async fn start_screen_video(self: &Arc<Self>, track: Arc<TrackRemote>) {
        let rid = normalize_rid(track.rid()).to_string();
        let stream_id = self.screen_stream_id();

        self.metrics
            .inc_rtp_tracks(self.cfg.group_id.as_str(), "in", "video");

        let monitor = match RateMonitor::new(SCREEN_RATE_WINDOW, None) {
            Ok(m) => Arc::new(m),
            Err(err) => {
                error!(%err, session_id = %self.cfg.session_id, "failed to create rate monitor");
                return;
            }
        };

        let out = new_out_screen_track(track.codec().capability, &rid, &stream_id);

        {
            let mut state = self.state.write();
            state.remote_screen_tracks.insert(rid.clone(), Arc::clone(&track));
            state.screen_rate_monitors.insert(rid.clone(), Arc::clone(&monitor));
            state.out_screen_tracks.insert(rid.clone(), Arc::clone(&out));
        }

        debug!(
            session_id = %self.cfg.session_id,
            rid = %rid,
            ssrc = track.ssrc(),
            "screen layer published"
        );

        if let Some(call) = self.call.upgrade() {
            call.fan_out_screen_layer(self, &rid);
        }

        tokio::spawn(Arc::clone(self).forward_screen(track, out, monitor));
    }

    async fn forward_screen(
        self: Arc<Self>,
        track: Arc<TrackRemote>,
        out: Arc<TrackLocalStaticRTP>,
        monitor: Arc<RateMonitor>,
    ) {
        loop {
            let pkt = tokio::select! {
                res = track.read_rtp() => {
                    match res {
                        Ok((pkt, _)) => pkt,
                        Err(err) => {
                            if !is_closed_err(&err) {
                                error!(%err, session_id = %self.cfg.session_id, "failed to read RTP packet");
                                self.metrics.inc_rtc_errors(self.cfg.group_id.as_str(), "rtp");
                            }
                            break;
                        }
                    }
                }
                _ = self.close_token.cancelled() => break,
            };

            monitor.push_sample(pkt.marshal_size());

            if let Err(err) = out.write_rtp(&pkt).await {
                if !is_closed_err(&err) {
                    error!(%err, session_id = %self.cfg.session_id, "failed to write screen RTP packet");
                    self.metrics.inc_rtc_errors(self.cfg.group_id.as_str(), "rtp");
                }
            }
        }

        self.metrics
            .dec_rtp_tracks(self.cfg.group_id.as_str(), "in", "video");
    }

    async fn start_screen_audio(self: &Arc<Self>, track: Arc<TrackRemote>) {
        let stream_id = self.screen_stream_id();

        self.metrics
            .inc_rtp_tracks(self.cfg.group_id.as_str(), "in", "audio");

        let out = crate::simulcast::new_out_screen_audio_track(track.codec().capability, &stream_id);
        self.state.write().out_screen_audio_track = Some(Arc::clone(&out));

        if let Some(call) = self.call.upgrade() {
            call.fan_out_screen_audio(self, &out);
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let pkt = tokio::select! {
                    res = track.read_rtp() => {
                        match res {
                            Ok((pkt, _)) => pkt,
                            Err(err) => {
                                if !is_closed_err(&err) {
                                    error!(%err, session_id = %session.cfg.session_id, "failed to read RTP packet");
                                    session.metrics.inc_rtc_errors(session.cfg.group_id.as_str(), "rtp");
                                }
                                break;
                            }
                        }
                    }
                    _ = session.close_token.cancelled() => break,
                };

                if let Err(err) = out.write_rtp(&pkt).await {
                    if !is_closed_err(&err) {
                        error!(%err, session_id = %session.cfg.session_id, "failed to write screen audio RTP packet");
                        session.metrics.inc_rtc_errors(session.cfg.group_id.as_str(), "rtp");
                    }
                }
            }

            session
                .metrics
                .dec_rtp_tracks(session.cfg.group_id.as_str(), "in", "audio");
        });
    }

    /// Keeps the received screen layer in line with the bandwidth estimate.
    async fn monitor_simulcast_layer(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(LAYER_MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.close_token.cancelled() => return,
            }

            let Some(call) = self.call.upgrade() else { continue };
            let Some(presenter) = call.screen_session() else { continue };
            if presenter.session_id() == self.session_id() {
                continue;
            }

            let (sender, current) = {
                let state = self.state.read();
                (state.screen_track_sender.clone(), state.screen_rid.clone())
            };
            let Some(sender) = sender else { continue };

            let expected = self.expected_simulcast_level();
            if expected == current {
                continue;
            }

            let Some(track) = presenter.out_screen_track(expected) else { continue };

            match sender
                .replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>))
                .await
            {
                Ok(()) => {
                    debug!(
                        session_id = %self.cfg.session_id,
                        from = %current,
                        to = expected,
                        "switched simulcast level"
                    );
                    self.state.write().screen_rid = expected.to_string();
                }
                Err(err) => {
                    error!(%err, session_id = %self.cfg.session_id, "failed to switch simulcast level");
                }
            }
        }
    }

    // ---- teardown --------------------------------------------------------

    /// Tears the session down. Safe to call more than once; the close
    /// callback runs exactly once.
    pub(crate) async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.close_token.cancel();

        if let Err(err) = self.pc.close().await {
            error!(%err, session_id = %self.cfg.session_id, "failed to close peer connection");
        }

        let cb = self.close_cb.lock().take();
        if let Some(cb) = cb {
            if let Err(err) = cb() {
                error!(%err, session_id = %self.cfg.session_id, "close callback failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_making_offer(&self, making: bool) {
        self.state.write().making_offer = making;
    }

    #[cfg(test)]
    pub(crate) fn take_offer_rx(&self) -> Option<mpsc::Receiver<RTCSessionDescription>> {
        self.sdp_offer_rx.lock().take()
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::new_test_session;
    use super::*;

    #[tokio::test]
    async fn test_offer_ignored_while_making_offer() {
        let ts = new_test_session("s1", Weak::new()).await;
        let session = ts.session;
        let mut offer_rx = session.take_offer_rx().unwrap();

        session.set_making_offer(true);
        assert!(session.has_signaling_conflict());

        let offer = RTCSessionDescription::offer(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string(),
        )
        .unwrap();

        // Routed without error, but dropped: nothing reaches the offer
        // handler and the peer connection is untouched.
        session.route_sdp(offer).unwrap();
        assert!(offer_rx.try_recv().is_err());
        assert_eq!(session.pc.signaling_state(), RTCSignalingState::Stable);
        assert!(session.pc.local_description().await.is_none());
    }

    #[tokio::test]
    async fn test_offer_routed_when_stable() {
        let ts = new_test_session("s1", Weak::new()).await;
        let session = ts.session;
        let mut offer_rx = session.take_offer_rx().unwrap();

        assert!(!session.has_signaling_conflict());

        let offer = RTCSessionDescription::offer(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string(),
        )
        .unwrap();

        session.route_sdp(offer).unwrap();
        assert!(offer_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_mute_is_idempotent() {
        let mut ts = new_test_session("s1", Weak::new()).await;
        let session = ts.session;

        session.set_voice_enabled(true);
        assert!(session.voice_enabled());

        session.set_voice_enabled(false);
        session.reset_vad();
        session.set_voice_enabled(false);
        session.reset_vad();

        assert!(!session.voice_enabled());
        // Muting never renegotiates: no SDP left the session.
        assert!(ts.out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_source_rate_without_monitor() {
        let ts = new_test_session("s1", Weak::new()).await;
        assert_eq!(ts.session.source_rate(""), -1);
        assert_eq!(ts.session.source_rate("high"), -1);
    }

    #[tokio::test]
    async fn test_expected_level_defaults_without_estimator() {
        let ts = new_test_session("s1", Weak::new()).await;
        assert_eq!(ts.session.expected_simulcast_level(), SIMULCAST_LEVEL_DEFAULT);
    }

    #[tokio::test]
    async fn test_screen_state_roundtrip() {
        let ts = new_test_session("s1", Weak::new()).await;
        let session = ts.session;

        session.set_screen_stream_id("streamX".to_string());
        assert_eq!(session.screen_stream_id(), "streamX");

        session.clear_screen_local_state();
        assert_eq!(session.screen_stream_id(), "");
        assert!(session.out_screen_track("default").is_none());
    }
}
