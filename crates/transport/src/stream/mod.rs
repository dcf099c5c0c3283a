use crate::Error;

mod read;
mod write;

pub use {
    read::{ReadStream, StreamItem},
    write::WriteStream,
};

/// Stream close codes with protocol meaning.
pub mod close_code {
    /// Regular end of interest, the default when a reader closes.
    pub const END: u64 = 200;
}

/// Whether a stream carries structured values or raw byte chunks.
///
/// The sign of the stream id encodes the kind on the wire: object streams are
/// positive, binary streams negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Object,
    Binary,
}

impl StreamKind {
    pub(crate) fn of_id(stream_id: i64) -> Self {
        if stream_id < 0 {
            Self::Binary
        } else {
            Self::Object
        }
    }
}

/// Why a stream stopped, kept for surfacing to late callers.
#[derive(Debug, Clone)]
pub(crate) enum CloseReason {
    Code(u64),
    BadConnection { reason: String },
}

impl CloseReason {
    pub(crate) fn to_error(&self) -> Error {
        match self {
            Self::Code(code) => Error::StreamClosed(*code),
            Self::BadConnection { reason } => Error::bad_connection(reason.clone(), None),
        }
    }
}
