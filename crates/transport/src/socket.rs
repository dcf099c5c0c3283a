use {crate::BoxError, wire::Frame};

/// The underlying connection a transport writes to.
///
/// Implementations must be safe to call synchronously from within inbound
/// handlers.
pub trait Socket: Send + Sync + 'static {
    /// Best-effort write of a single frame.
    fn send(&self, frame: Frame) -> Result<(), BoxError>;

    /// Runs `f` with all sends inside flushed as one socket write boundary.
    fn cork(&self, f: &mut dyn FnMut()) {
        f()
    }

    /// Whether the socket currently accepts stream traffic without queueing.
    fn has_low_send_backpressure(&self) -> bool {
        true
    }
}
