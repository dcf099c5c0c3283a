use {
    crate::{
        Error, Resolved, TimeoutKind,
        stream::WriteStream,
        transport::{Core, Inner},
    },
    std::{sync::Weak, time::Duration},
    tokio::{sync::oneshot, task::AbortHandle},
    wire::{DataType, MAX_SAFE_INTEGER},
};

/// One outstanding invocation awaiting its response.
pub(crate) struct PendingInvoke {
    pub tx: oneshot::Sender<Result<(Resolved, DataType), Error>>,
    pub timer: Option<AbortHandle>,
    pub stamp: u64,
}

impl Inner {
    /// Call ids wrap at the safe-integer ceiling, skipping ids still pending.
    pub(crate) fn alloc_call_id(&mut self) -> u64 {
        loop {
            let id = self.call_id_seq;
            self.call_id_seq = if id >= MAX_SAFE_INTEGER as u64 { 0 } else { id + 1 };

            if !self.invokes.contains_key(&id) {
                return id;
            }
        }
    }
}

impl Core {
    /// Post-send arming of the response timer: waits for every embedded
    /// stream to close first, so the deadline never runs while outgoing data
    /// is still in flight.
    pub(crate) fn arm_invoke_timer(
        weak: Weak<Self>,
        call_id: u64,
        stamp: u64,
        timeout: Duration,
        streams: Vec<WriteStream>,
    ) {
        let handle = tokio::spawn({
            let weak = weak.clone();

            async move {
                futures_util::future::join_all(streams.iter().map(WriteStream::closed)).await;
                tokio::time::sleep(timeout).await;

                if let Some(core) = weak.upgrade() {
                    core.invoke_timeout(call_id, stamp);
                }
            }
        });

        let Some(core) = weak.upgrade() else {
            handle.abort();
            return;
        };

        let mut inner = core.lock();
        match inner.invokes.get_mut(&call_id) {
            Some(entry) if entry.stamp == stamp => entry.timer = Some(handle.abort_handle()),
            _ => handle.abort(),
        }
    }

    fn invoke_timeout(&self, call_id: u64, stamp: u64) {
        let entry = {
            let mut inner = self.lock();
            match inner.invokes.get(&call_id) {
                Some(entry) if entry.stamp == stamp => inner.invokes.remove(&call_id),
                _ => None,
            }
        };

        if let Some(entry) = entry {
            let _ = entry
                .tx
                .send(Err(Error::Timeout(TimeoutKind::InvokeResponse)));
        }
    }

    /// Removes a pending invoke for its arriving response, disarming the
    /// timer.
    pub(crate) fn take_invoke(&self, call_id: u64) -> Result<PendingInvoke, Error> {
        let entry = self
            .lock()
            .invokes
            .remove(&call_id)
            .ok_or_else(|| Error::invalid_message(format!("unknown call id {call_id}")))?;

        if let Some(timer) = &entry.timer {
            timer.abort();
        }

        Ok(entry)
    }
}
