use {
    crate::{DataType, Error, Resolved, stream::WriteStream},
    bytes::Bytes,
    std::sync::atomic::{AtomicU64, Ordering},
    tokio::sync::oneshot,
};

static NEXT_PACKAGE_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a prepared package, usable to cancel it while it still sits in
/// the batch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageId(u64);

pub(crate) type AfterSend = Box<dyn FnOnce() + Send>;

/// An outbound unit: text head plus optional binary-content frame, post-send
/// hooks, and (for invokes) the response handle.
pub struct Package {
    id: PackageId,
    pub(crate) head: String,
    pub(crate) binary: Option<Bytes>,
    pub(crate) streams: Vec<WriteStream>,
    pub(crate) after_send: Vec<AfterSend>,
    pub(crate) response: Option<ResponseHandle>,
}

impl Package {
    pub(crate) fn new(head: String, binary: Option<Bytes>, streams: Vec<WriteStream>) -> Self {
        Self {
            id: PackageId(NEXT_PACKAGE_ID.fetch_add(1, Ordering::Relaxed)),
            head,
            binary,
            streams,
            after_send: Vec::new(),
            response: None,
        }
    }

    pub fn id(&self) -> PackageId {
        self.id
    }

    /// Takes the response handle of an invoke package. Returns `None` for
    /// transmit packages or when already taken.
    pub fn take_response(&mut self) -> Option<ResponseHandle> {
        self.response.take()
    }

    pub(crate) fn on_sent(&mut self, hook: AfterSend) {
        self.after_send.push(hook);
    }

    /// Runs once the frames actually left for the socket: embedded streams
    /// start awaiting accept, invoke timers arm, send promises resolve.
    pub(crate) fn fire_after_send(self) {
        for stream in &self.streams {
            stream.mark_sent();
        }

        for hook in self.after_send {
            hook();
        }
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("id", &self.id)
            .field("head", &self.head)
            .field("binary", &self.binary.as_ref().map(Bytes::len))
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

/// Pending result of an invoke package.
pub struct ResponseHandle(pub(crate) oneshot::Receiver<Result<(Resolved, DataType), Error>>);

impl ResponseHandle {
    /// Resolves once the peer responds, the response times out, or the
    /// connection drops.
    pub async fn wait(self) -> Result<(Resolved, DataType), Error> {
        self.0
            .await
            .map_err(|_| Error::bad_connection("abandoned", None))?
    }
}
