use {
    super::{CloseReason, StreamKind},
    crate::{Error, Resolved, transport::Core},
    bytes::Bytes,
    enum_as_inner::EnumAsInner,
    std::{
        collections::VecDeque,
        sync::{Arc, Mutex, Weak},
    },
    tokio::sync::{Notify, oneshot},
    wire::packet::Action,
};

/// One consumed element of a read stream.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum StreamItem {
    Value(Resolved),
    Bytes(Bytes),
}

impl StreamItem {
    /// Credit consumed by this item: one per value, one per byte.
    fn credit(&self) -> u64 {
        match self {
            Self::Value(_) => 1,
            Self::Bytes(bytes) => bytes.len() as u64,
        }
    }
}

/// A chunk slot in arrival order. Chunks whose decode awaits out-of-band
/// binary content stay pending in place, so consumption order always matches
/// sent order.
pub(crate) enum Slot {
    Ready(StreamItem),
    Pending(oneshot::Receiver<Result<StreamItem, Error>>),
}

/// The reader half of a stream, materialized while decoding an inbound
/// payload. Accepts the peer's stream on creation and grants further credit
/// as the consumer drains it.
#[derive(Clone)]
pub struct ReadStream {
    inner: Arc<ReadInner>,
}

struct ReadInner {
    kind: StreamKind,
    id: i64,
    stamp: u64,
    core: Weak<Core>,
    state: Mutex<ReadState>,
    readable: Notify,
}

struct ReadState {
    queue: VecDeque<Slot>,
    ended: bool,
    close: Option<CloseReason>,
    close_delivered: bool,
}

impl ReadStream {
    pub(crate) fn new(kind: StreamKind, id: i64, stamp: u64, core: Weak<Core>) -> Self {
        Self {
            inner: Arc::new(ReadInner {
                kind,
                id,
                stamp,
                core,
                state: Mutex::new(ReadState {
                    queue: VecDeque::new(),
                    ended: false,
                    close: None,
                    close_delivered: false,
                }),
                readable: Notify::new(),
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// The next chunk in sent order.
    ///
    /// `None` once the stream ended (or was locally closed) and the queue is
    /// drained. A writer-side abort surfaces once as
    /// [`Error::StreamClosed`](crate::Error::StreamClosed) before the stream
    /// yields `None`.
    pub async fn next(&self) -> Option<Result<StreamItem, Error>> {
        loop {
            let notified = self.inner.readable.notified();
            tokio::pin!(notified);
            // Register before the state check so no wakeup slips between.
            notified.as_mut().enable();

            let slot = {
                let mut state = self.lock();

                match state.queue.pop_front() {
                    Some(slot) => Some(slot),
                    None => {
                        if let Some(reason) = state.close.clone() {
                            if state.close_delivered {
                                return None;
                            }

                            state.close_delivered = true;
                            return Some(Err(reason.to_error()));
                        }

                        if state.ended {
                            return None;
                        }

                        None
                    }
                }
            };

            match slot {
                Some(Slot::Ready(item)) => {
                    self.grant(item.credit());
                    return Some(Ok(item));
                }

                Some(Slot::Pending(rx)) => {
                    return Some(match rx.await {
                        Ok(Ok(item)) => {
                            self.grant(item.credit());
                            Ok(item)
                        }
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(Error::bad_connection("abandoned", None)),
                    });
                }

                None => notified.await,
            }
        }
    }

    /// Collects the remaining items, erroring out on the first failed chunk.
    pub async fn collect(&self) -> Result<Vec<StreamItem>, Error> {
        let mut items = Vec::new();

        while let Some(item) = self.next().await {
            items.push(item?);
        }

        Ok(items)
    }

    /// Aborts the stream from the reader side. `None` leaves the peer to its
    /// default close code.
    pub fn close(&self, code: Option<u64>) -> Result<(), Error> {
        {
            let mut state = self.lock();
            if state.ended || state.close.is_some() {
                return Ok(());
            }

            state.ended = true;
            state.queue.clear();
        }

        self.inner.readable.notify_waiters();

        let Some(core) = self.inner.core.upgrade() else {
            return Ok(());
        };

        if core.stamp() != self.inner.stamp {
            return Ok(());
        }

        core.remove_read_stream(self.inner.id);
        core.send_head(&Action::ReadStreamClose {
            stream_id: self.inner.id,
            code,
        })
    }

    /// Replenishes the writer for a consumed item.
    fn grant(&self, credit: u64) {
        if credit == 0 {
            return;
        }

        {
            let state = self.lock();
            if state.ended || state.close.is_some() {
                return;
            }
        }

        let Some(core) = self.inner.core.upgrade() else {
            return;
        };

        if core.stamp() != self.inner.stamp {
            return;
        }

        let _ = core.send_head(&Action::StreamDataPermission {
            stream_id: self.inner.id,
            credit,
        });
    }

    pub(crate) fn push_ready(&self, item: StreamItem) {
        self.push(Slot::Ready(item));
    }

    pub(crate) fn push_pending(&self, rx: oneshot::Receiver<Result<StreamItem, Error>>) {
        self.push(Slot::Pending(rx));
    }

    fn push(&self, slot: Slot) {
        {
            let mut state = self.lock();
            if state.ended || state.close.is_some() {
                return;
            }
            state.queue.push_back(slot);
        }

        self.inner.readable.notify_waiters();
    }

    /// Regular end of the stream; queued chunks still drain.
    pub(crate) fn finish(&self) {
        self.lock().ended = true;
        self.inner.readable.notify_waiters();
    }

    /// Writer-side abort.
    pub(crate) fn surface_close(&self, code: u64) {
        self.lock().close.get_or_insert(CloseReason::Code(code));
        self.inner.readable.notify_waiters();
    }

    pub(crate) fn fail_connection(&self, reason: &str) {
        self.lock().close.get_or_insert(CloseReason::BadConnection {
            reason: reason.to_owned(),
        });
        self.inner.readable.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReadState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PartialEq for ReadStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ReadStream")
            .field("kind", &self.inner.kind)
            .field("id", &self.inner.id)
            .field("queued", &state.queue.len())
            .field("ended", &state.ended)
            .finish()
    }
}
