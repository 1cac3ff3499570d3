use fieldmq_codec::error::{DecodeError, EncodeError};

/// Engine-level error type.
///
/// Most of these are recovered locally by the connection manager (state
/// fallback plus a cooldown); they become fatal only during one-time setup.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error, {0}")]
    Config(String),
    #[error("broker refused connection, {0}")]
    ConnectRefused(&'static str),
    #[error("no CONNACK from broker")]
    NoConnAck,
    #[error("unexpected packet from broker")]
    UnexpectedPacket,
    #[error("subscribe round failed")]
    SubscribeFailed,
    #[error("read timeout")]
    ReadTimeout,
    #[error("write timeout")]
    WriteTimeout,
    #[error("close timeout")]
    CloseTimeout,
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
