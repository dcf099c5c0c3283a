use {
    crate::{Error, PacketType, id_from_f64},
    bytes::{BufMut, Bytes, BytesMut},
    enum_as_inner::EnumAsInner,
};

/// Control bytes exchanged as single-byte binary frames.
pub const PING: u8 = 57;
pub const PONG: u8 = 65;

/// Sentinel length marking a binary-content frame that is continued by a
/// follow-up frame carrying the same id.
pub const NEXT_BINARIES_PACKET_TOKEN: u32 = u32::MAX;

/// Hard cap for a single blob. The length prefix is a u32 and the sentinel
/// value is reserved.
pub const MAX_SUPPORTED_BINARY_SIZE: usize = (u32::MAX - 1) as usize;

const HEADER_LEN: usize = 9;

/// A raw frame exchanged with the socket.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(data) => data.len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A classified inbound binary frame.
#[derive(Debug, PartialEq)]
pub enum BinaryFrame {
    Ping,
    Pong,
    BinaryContent {
        id: i64,
        blobs: Vec<Bytes>,
        /// A follow-up frame with the same id continues the blob list.
        continued: bool,
    },
    StreamChunk {
        stream_id: i64,
        payload: Bytes,
    },
    StreamEnd {
        stream_id: i64,
        payload: Bytes,
    },
}

/// Classifies an inbound binary frame by its leading byte.
pub fn classify(frame: &Bytes) -> Result<BinaryFrame, Error> {
    if frame.len() == 1 {
        return match frame[0] {
            PING => Ok(BinaryFrame::Ping),
            PONG => Ok(BinaryFrame::Pong),
            byte => Err(Error::malformed_frame(format!(
                "unexpected control byte {byte}"
            ))),
        };
    }

    if frame.len() < HEADER_LEN {
        return Err(Error::malformed_frame("truncated header"));
    }

    let header: [u8; 8] = frame[1..HEADER_LEN]
        .try_into()
        .map_err(|_| Error::malformed_frame("truncated header"))?;

    match frame[0] {
        byte if byte == PacketType::BinaryContent as u8 => {
            // Binary-content ids are written with DataView defaults.
            let id = id_from_f64(f64::from_be_bytes(header))?;
            let (blobs, continued) = parse_blobs(frame)?;

            Ok(BinaryFrame::BinaryContent {
                id,
                blobs,
                continued,
            })
        }

        // Stream ids are written through a float64 array view.
        byte if byte == PacketType::StreamChunk as u8 => Ok(BinaryFrame::StreamChunk {
            stream_id: id_from_f64(f64::from_le_bytes(header))?,
            payload: frame.slice(HEADER_LEN..),
        }),

        byte if byte == PacketType::StreamEnd as u8 => Ok(BinaryFrame::StreamEnd {
            stream_id: id_from_f64(f64::from_le_bytes(header))?,
            payload: frame.slice(HEADER_LEN..),
        }),

        byte => Err(Error::malformed_frame(format!(
            "unexpected binary packet type {byte}"
        ))),
    }
}

fn parse_blobs(frame: &Bytes) -> Result<(Vec<Bytes>, bool), Error> {
    let mut blobs = Vec::new();
    let mut offset = HEADER_LEN;

    while offset < frame.len() {
        let len_bytes: [u8; 4] = frame[offset..]
            .get(..4)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| Error::malformed_frame("truncated blob length"))?;
        let len = u32::from_be_bytes(len_bytes);
        offset += 4;

        if len == NEXT_BINARIES_PACKET_TOKEN {
            if offset != frame.len() {
                return Err(Error::malformed_frame("data after continuation token"));
            }

            return Ok((blobs, true));
        }

        let end = offset
            .checked_add(len as usize)
            .filter(|end| *end <= frame.len())
            .ok_or_else(|| Error::malformed_frame("truncated blob"))?;

        blobs.push(frame.slice(offset..end));
        offset = end;
    }

    Ok((blobs, false))
}

/// Builds a binary-content frame carrying `blobs` in order.
pub fn binary_content(id: i64, blobs: &[Bytes]) -> Result<Bytes, Error> {
    let payload: usize = blobs.iter().map(Bytes::len).sum();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + blobs.len() * 4 + payload);

    buf.put_u8(PacketType::BinaryContent as u8);
    buf.put_f64(id as f64);

    for blob in blobs {
        if blob.len() > MAX_SUPPORTED_BINARY_SIZE {
            return Err(Error::MaxSupportedBinarySizeExceeded);
        }

        buf.put_u32(blob.len() as u32);
        buf.put_slice(blob);
    }

    Ok(buf.freeze())
}

/// Builds a binary stream chunk or end frame.
pub fn stream_chunk(stream_id: i64, payload: &[u8], end: bool) -> Bytes {
    let packet_type = if end {
        PacketType::StreamEnd
    } else {
        PacketType::StreamChunk
    };

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(packet_type as u8);
    buf.put_f64_le(stream_id as f64);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn ping() -> Bytes {
    Bytes::from_static(&[PING])
}

pub fn pong() -> Bytes {
    Bytes::from_static(&[PONG])
}
