use {
    super::{CloseReason, StreamKind, close_code},
    crate::{Error, Payload, transport::Core},
    bytes::Bytes,
    std::sync::{Arc, Mutex, Weak},
    tokio::sync::{Notify, watch},
};

/// The writer half of a stream, embeddable into outbound payloads.
///
/// A fresh stream is inert until it travels inside a package; once that
/// package is sent the stream awaits the peer's accept, after which writes
/// flow under credit-based flow control.
#[derive(Clone)]
pub struct WriteStream {
    inner: Arc<WriteInner>,
}

struct WriteInner {
    kind: StreamKind,
    state: Mutex<WriteState>,
    /// Signalled on every credit or phase change.
    readable: Notify,
    closed_tx: watch::Sender<bool>,
}

struct WriteState {
    phase: WritePhase,
    credit: u64,
    close: Option<CloseReason>,
    binding: Option<Binding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    /// Not yet part of any package.
    Created,
    /// Bound to a transport, package not sent yet.
    Registered,
    AwaitingAccept,
    Open,
    Closed,
}

struct Binding {
    core: Weak<Core>,
    id: i64,
    stamp: u64,
}

impl WriteStream {
    /// Creates a stream carrying structured values.
    pub fn object() -> Self {
        Self::new(StreamKind::Object)
    }

    /// Creates a stream carrying raw byte chunks.
    pub fn binary() -> Self {
        Self::new(StreamKind::Binary)
    }

    fn new(kind: StreamKind) -> Self {
        Self {
            inner: Arc::new(WriteInner {
                kind,
                state: Mutex::new(WriteState {
                    phase: WritePhase::Created,
                    credit: 0,
                    close: None,
                    binding: None,
                }),
                readable: Notify::new(),
                closed_tx: watch::channel(false).0,
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    pub fn is_closed(&self) -> bool {
        self.lock().phase == WritePhase::Closed
    }

    /// Resolves once the stream reached its terminal state, whatever the
    /// path: ended, aborted by either side, or lost with the connection.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Writes one value to an object stream, consuming one credit. Suspends
    /// while the peer has not accepted, no credit is left, or the socket
    /// reports send backpressure.
    pub async fn write(&self, value: Payload) -> Result<(), Error> {
        if self.inner.kind != StreamKind::Object {
            return Err(Error::invalid_action("value write on a binary stream"));
        }

        let (_, core, id) = self.reserve(1).await?;
        core.wait_low_send_backpressure().await;

        let result = Core::send_object_chunk(&core, id, value, false);
        if result.is_err() {
            self.restore(1);
        }

        result
    }

    /// Writes bytes to a binary stream, splitting into chunks as credit
    /// allows.
    pub async fn write_bytes(&self, bytes: impl Into<Bytes>) -> Result<(), Error> {
        if self.inner.kind != StreamKind::Binary {
            return Err(Error::invalid_action("byte write on an object stream"));
        }

        let mut bytes = bytes.into();

        while !bytes.is_empty() {
            let (taken, core, id) = self.reserve(bytes.len() as u64).await?;
            core.wait_low_send_backpressure().await;

            let chunk = bytes.split_to(taken as usize);
            if let Err(err) = core.send_binary_chunk(id, &chunk, false) {
                self.restore(taken);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Ends an object stream, optionally carrying a final value. The final
    /// chunk is terminal and not charged against credit.
    pub async fn end(&self, last: Option<Payload>) -> Result<(), Error> {
        if self.inner.kind != StreamKind::Object {
            return Err(Error::invalid_action("value end on a binary stream"));
        }

        match self.take_for_finish()? {
            None => Ok(()),
            Some((core, id)) => {
                core.wait_low_send_backpressure().await;

                let result = match last {
                    Some(value) => Core::send_object_chunk(&core, id, value, true),
                    None => core.send_stream_end(id),
                };

                core.remove_write_stream(id);
                self.finish(CloseReason::Code(close_code::END));
                result
            }
        }
    }

    /// Ends a binary stream, optionally carrying final bytes.
    pub async fn end_bytes(&self, last: Option<Bytes>) -> Result<(), Error> {
        if self.inner.kind != StreamKind::Binary {
            return Err(Error::invalid_action("byte end on an object stream"));
        }

        match self.take_for_finish()? {
            None => Ok(()),
            Some((core, id)) => {
                core.wait_low_send_backpressure().await;

                let result = core.send_binary_chunk(id, last.as_deref().unwrap_or(&[]), true);
                core.remove_write_stream(id);
                self.finish(CloseReason::Code(close_code::END));
                result
            }
        }
    }

    /// Aborts the stream from the writer side.
    pub fn close(&self, code: u64) -> Result<(), Error> {
        let target = {
            let mut state = self.lock();
            match state.phase {
                WritePhase::Closed => return Ok(()),
                phase => state.binding.take().map(|binding| (binding, phase)),
            }
        };

        self.finish(CloseReason::Code(code));

        let Some((binding, phase)) = target else {
            return Ok(());
        };

        let Some(core) = binding.core.upgrade() else {
            return Ok(());
        };

        core.remove_write_stream(binding.id);

        // The peer only learns about the stream once the package is out.
        if phase == WritePhase::Registered {
            return Ok(());
        }

        core.send_write_stream_close(binding.id, code)
    }

    /// Claims up to `want` credit, waiting for accept and permissions.
    async fn reserve(&self, want: u64) -> Result<(u64, Arc<Core>, i64), Error> {
        loop {
            let notified = self.inner.readable.notified();
            tokio::pin!(notified);
            // Register before the state check so no wakeup slips between.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                match state.phase {
                    WritePhase::Closed => return Err(state.close_error()),
                    WritePhase::Open if state.credit > 0 => {
                        let taken = want.min(state.credit);
                        state.credit -= taken;

                        let Some(binding) = state.binding.as_ref() else {
                            return Err(Error::invalid_action("open stream without a binding"));
                        };
                        let Some(core) = binding.core.upgrade() else {
                            return Err(Error::bad_connection("abandoned", None));
                        };

                        return Ok((taken, core, binding.id));
                    }
                    _ => {}
                }
            }

            notified.await;
        }
    }

    fn restore(&self, credit: u64) {
        let mut state = self.lock();
        if state.phase == WritePhase::Open {
            state.credit = state.credit.saturating_add(credit);
            self.inner.readable.notify_waiters();
        }
    }

    /// Detaches the binding for the end paths. `None` means the stream never
    /// left this process and closing it locally is enough.
    fn take_for_finish(&self) -> Result<Option<(Arc<Core>, i64)>, Error> {
        let binding = {
            let mut state = self.lock();
            match state.phase {
                WritePhase::Closed => return Err(state.close_error()),
                WritePhase::Created => None,
                _ => state.binding.take(),
            }
        };

        match binding {
            None => {
                self.finish(CloseReason::Code(close_code::END));
                Ok(None)
            }
            Some(binding) => match binding.core.upgrade() {
                Some(core) => Ok(Some((core, binding.id))),
                None => {
                    self.finish(CloseReason::Code(close_code::END));
                    Ok(None)
                }
            },
        }
    }

    fn finish(&self, reason: CloseReason) {
        {
            let mut state = self.lock();
            if state.phase == WritePhase::Closed {
                return;
            }

            state.phase = WritePhase::Closed;
            state.close.get_or_insert(reason);
            state.binding = None;
        }

        self.inner.readable.notify_waiters();
        let _ = self.inner.closed_tx.send(true);
    }

    /// Attaches the stream to a transport while its package is prepared.
    pub(crate) fn bind(&self, core: Weak<Core>, id: i64, stamp: u64) -> Result<(), Error> {
        let mut state = self.lock();

        if state.phase != WritePhase::Created {
            return Err(Error::invalid_action(
                "write stream already used in another package",
            ));
        }

        state.phase = WritePhase::Registered;
        state.binding = Some(Binding { core, id, stamp });
        Ok(())
    }

    /// The bearing package left for the socket.
    pub(crate) fn mark_sent(&self) {
        let mut state = self.lock();
        if state.phase == WritePhase::Registered {
            state.phase = WritePhase::AwaitingAccept;
        }
    }

    /// Peer accepted the stream with an initial credit window.
    pub(crate) fn accept(&self, credit: u64) {
        {
            let mut state = self.lock();
            match state.phase {
                WritePhase::Registered | WritePhase::AwaitingAccept => {
                    state.phase = WritePhase::Open;
                    state.credit = credit;
                }
                _ => return,
            }
        }

        self.inner.readable.notify_waiters();
    }

    pub(crate) fn add_credit(&self, credit: u64) {
        {
            let mut state = self.lock();
            if state.phase != WritePhase::Open {
                return;
            }
            state.credit = state.credit.saturating_add(credit);
        }

        self.inner.readable.notify_waiters();
    }

    /// Peer's reader aborted the stream.
    pub(crate) fn read_closed(&self, code: u64) {
        self.finish(CloseReason::Code(code));
    }

    pub(crate) fn fail_connection(&self, reason: &str) {
        self.finish(CloseReason::BadConnection {
            reason: reason.to_owned(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WriteState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl WriteState {
    fn close_error(&self) -> Error {
        self.close
            .as_ref()
            .map(CloseReason::to_error)
            .unwrap_or(Error::StreamClosed(close_code::END))
    }
}

impl PartialEq for WriteStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for WriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("WriteStream")
            .field("kind", &self.inner.kind)
            .field("phase", &state.phase)
            .field("credit", &state.credit)
            .finish()
    }
}
