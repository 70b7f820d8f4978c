//! WebRTC SFU core
//!
//! This crate implements a selective forwarding unit for real-time calls:
//! it terminates WebRTC peer connections for call participants and
//! forwards voice and screen-share RTP between them without transcoding.
//!
//! ## Architecture
//!
//! - **`Server`**: owns the shared UDP mux, the message pump and the
//!   group/call/session index
//! - **`Session`**: one participant endpoint with its signaling state
//! - **`Call`** / **`Group`**: passive containers; a call elects at most
//!   one screen-share presenter
//! - **`RateMonitor`**: sliding-window bitrate estimation per simulcast
//!   layer
//!
//! The embedder drives the server through a pair of message channels
//! ([`Server::send`] / [`Server::receiver`]) and the session lifecycle
//! calls ([`Server::add_session`] / [`Server::close_session`]).

mod bwe;
mod call;
mod config;
mod error;
mod metrics;
mod msg;
mod net;
mod rate;
mod server;
mod session;
mod simulcast;
mod stun;
mod types;
mod vad;

pub use bwe::{BandwidthEstimator, FixedRateEstimator};
pub use config::{IceServerConfig, ServerConfig, SessionConfig};
pub use error::{Error, Result};
pub use metrics::{Metrics, NullMetrics, PrometheusMetrics};
pub use msg::{Message, MessageType, ScreenOnPayload};
pub use rate::{Clock, RateMonitor};
pub use server::Server;
pub use session::{CloseCallback, Session};
pub use simulcast::{
    level_for_rate, SIMULCAST_LEVEL_DEFAULT, SIMULCAST_LEVEL_HIGH, SIMULCAST_LEVEL_LOW,
};
pub use types::{CallId, GroupId, SessionId, UserId};
pub use vad::{VadConfig, VadMonitor};
