pub use wire::{Bytes, DataType, Frame, Value};

mod buffer;
mod codec;
mod config;
mod handler;
mod invoke;
pub mod loopback;
mod multi;
mod package;
mod resolver;
mod socket;
mod stream;
mod transport;

pub use {
    buffer::{BatchOptions, PackageBuffer, QueueBuffer},
    config::Config,
    handler::{Handler, InvokeRequest, Responder},
    multi::{MultiPackage, prepare_multi_transmit},
    package::{Package, PackageId, ResponseHandle},
    socket::Socket,
    stream::{ReadStream, StreamItem, StreamKind, WriteStream, close_code},
    transport::{Builder, InvokeOptions, Transport, TransmitOptions},
};

/// Outbound payload tree, embedding write streams.
pub type Payload = Value<WriteStream>;

/// Decoded inbound payload tree, embedding read streams.
pub type Resolved = Value<ReadStream>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Protocol framing/parse error or type mismatch on an inbound frame.
    #[error("Invalid message: {0}")]
    InvalidMessage(BoxError),

    /// A caller misused the API (double response, reused stream, complex
    /// payload where forbidden).
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("{0} timed out")]
    Timeout(TimeoutKind),

    /// The connection dropped; carries the disconnect reason.
    #[error("Bad connection ({reason}): {}", msg.as_deref().unwrap_or("connection lost"))]
    BadConnection {
        reason: String,
        msg: Option<String>,
    },

    /// Error response hydrated from the peer.
    #[error("Remote error ({name}): {message}")]
    Remote { name: String, message: String },

    #[error("Stream closed with code {0}")]
    StreamClosed(u64),

    #[error("Binary exceeds the maximum supported size")]
    MaxSupportedBinarySizeExceeded,

    #[error("Socket error: {0}")]
    Socket(BoxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    BinaryResolve,
    InvokeResponse,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BinaryResolve => write!(f, "Binary content resolve"),
            Self::InvokeResponse => write!(f, "Invoke response"),
        }
    }
}

impl Error {
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into().into())
    }

    pub fn invalid_action(msg: impl Into<String>) -> Self {
        Self::InvalidAction(msg.into())
    }

    pub fn bad_connection(reason: impl Into<String>, msg: Option<String>) -> Self {
        Self::BadConnection {
            reason: reason.into(),
            msg,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_bad_connection(&self) -> bool {
        matches!(self, Self::BadConnection { .. })
    }
}

impl From<wire::Error> for Error {
    fn from(err: wire::Error) -> Self {
        match err {
            wire::Error::MaxSupportedBinarySizeExceeded => Self::MaxSupportedBinarySizeExceeded,
            other => Self::InvalidMessage(Box::new(other)),
        }
    }
}
