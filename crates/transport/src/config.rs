use std::time::Duration;

/// Configuration options for a [`Transport`](crate::Transport).
///
/// This should not be used directly. Instead, use the
/// [`Builder`](crate::Builder) to configure and create a transport.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deadline for an invoke reply, counted from the moment the package (and
    /// any embedded streams) finished transmitting.
    pub response_timeout: Duration,

    /// Deadline for the binary-content frame referenced by a text packet.
    pub binary_content_packet_timeout: Duration,

    /// Caps the streams resolved out of a single inbound packet.
    pub streams_per_package_limit: usize,

    /// When false, inbound stream references error and outbound live streams
    /// are inlined into the JSON body.
    pub streams_enabled: bool,

    /// Gates stream decoding inside stream chunks.
    pub chunks_can_contain_streams: bool,

    /// Accept window granted when a read stream is created: bytes for binary
    /// streams, items for object streams.
    pub initial_stream_credit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            binary_content_packet_timeout: Duration::from_secs(10),
            streams_per_package_limit: 20,
            streams_enabled: true,
            chunks_can_contain_streams: false,
            initial_stream_credit: 4096,
        }
    }
}
