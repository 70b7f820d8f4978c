use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid config: {0}")]
    Config(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid track: {0}")]
    InvalidTrack(String),

    #[error("session already exists")]
    SessionExists,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("call not found: {0}")]
    CallNotFound(String),

    #[error("sender for track already exists")]
    SenderExists,

    #[error("screen track sender is already set")]
    ScreenBusy,

    #[error("timed out signaling")]
    SignalingTimeout,

    #[error("channel is full")]
    ChannelFull,

    #[error("no valid address to listen on was found")]
    NoListenAddress,

    #[error("webrtc error: {0}")]
    Webrtc(#[from] webrtc::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
