pub use bytes::Bytes;

pub mod frame;
pub mod mixed;
pub mod packet;
pub mod value;

pub use {
    frame::{BinaryFrame, Frame, MAX_SUPPORTED_BINARY_SIZE, NEXT_BINARIES_PACKET_TOKEN, PING, PONG},
    packet::{Action, DataType, PacketType},
    value::Value,
};

/// Largest integer exactly representable as an IEEE-754 float64. Identifier
/// counters wrap at this ceiling (or its negation for negative id spaces)
/// because every id crosses the wire as a float64.
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;
pub const MIN_SAFE_INTEGER: i64 = -MAX_SAFE_INTEGER;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Malformed binary frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u64),

    #[error("Unknown data type: {0}")]
    UnknownDataType(u64),

    #[error("Json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary exceeds the maximum supported size")]
    MaxSupportedBinarySizeExceeded,
}

impl Error {
    pub fn malformed_packet(msg: impl Into<String>) -> Self {
        Self::MalformedPacket(msg.into())
    }

    pub fn malformed_frame(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}

/// Converts a float64 read off the wire into the integral identifier it
/// carries. Ids are always written as float64, so anything fractional or
/// outside the safe-integer range never names a real resource.
pub fn id_from_f64(raw: f64) -> Result<i64, Error> {
    if !raw.is_finite() || raw.fract() != 0.0 {
        return Err(Error::malformed_packet(format!("non-integral id: {raw}")));
    }

    let id = raw as i64;
    if !(MIN_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&id) {
        return Err(Error::malformed_packet(format!("id out of range: {raw}")));
    }

    Ok(id)
}
