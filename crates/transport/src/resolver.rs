use {
    crate::{
        Error, TimeoutKind,
        transport::{Core, Inner},
    },
    bytes::Bytes,
    std::sync::Arc,
    tokio::{sync::oneshot, task::AbortHandle},
    wire::MAX_SAFE_INTEGER,
};

/// A registered callback awaiting the binary-content frame for one inbound
/// id, accumulating blobs across chained frames.
pub(crate) struct Resolver {
    pub tx: oneshot::Sender<Result<Vec<Bytes>, Error>>,
    pub blobs: Vec<Bytes>,
    pub timer: AbortHandle,
}

impl Inner {
    /// Local binary-content ids wrap at the ceiling back to 0 and may reuse:
    /// the sender keeps no outstanding-id set, and inbound resolvers are
    /// keyed by peer-allocated ids.
    pub(crate) fn alloc_content_id(&mut self) -> i64 {
        let id = self.content_id_seq;
        self.content_id_seq = if id >= MAX_SAFE_INTEGER { 0 } else { id + 1 };
        id
    }
}

impl Core {
    pub(crate) fn alloc_content_id(&self) -> i64 {
        self.lock().alloc_content_id()
    }

    /// Registers a resolver for an inbound binary-content id. A duplicate id
    /// is a protocol fault.
    pub(crate) fn register_resolver(
        core: &Arc<Self>,
        id: i64,
    ) -> Result<oneshot::Receiver<Result<Vec<Bytes>, Error>>, Error> {
        let (tx, rx) = oneshot::channel();
        let mut inner = core.lock();

        if inner.resolvers.contains_key(&id) {
            return Err(Error::invalid_message(format!(
                "binary content {id} already awaited"
            )));
        }

        let timer = tokio::spawn({
            let weak = Arc::downgrade(core);
            let timeout = core.config.binary_content_packet_timeout;
            let stamp = inner.stamp;

            async move {
                tokio::time::sleep(timeout).await;
                if let Some(core) = weak.upgrade() {
                    core.resolver_timeout(id, stamp);
                }
            }
        })
        .abort_handle();

        inner.resolvers.insert(
            id,
            Resolver {
                tx,
                blobs: Vec::new(),
                timer,
            },
        );

        Ok(rx)
    }

    fn resolver_timeout(&self, id: i64, stamp: u64) {
        let resolver = {
            let mut inner = self.lock();
            if inner.stamp != stamp {
                return;
            }
            inner.resolvers.remove(&id)
        };

        if let Some(resolver) = resolver {
            tracing::debug!(id, "binary content frame never arrived");
            let _ = resolver
                .tx
                .send(Err(Error::Timeout(TimeoutKind::BinaryResolve)));
        }
    }

    /// Feeds an inbound binary-content frame into its resolver, firing it
    /// unless a continuation frame is announced.
    pub(crate) fn feed_binary_content(
        &self,
        id: i64,
        blobs: Vec<Bytes>,
        continued: bool,
    ) -> Result<(), Error> {
        let resolver = {
            let mut inner = self.lock();

            let Some(resolver) = inner.resolvers.get_mut(&id) else {
                return Err(Error::invalid_message(format!(
                    "no resolver for binary content {id}"
                )));
            };

            resolver.blobs.extend(blobs);

            if continued {
                return Ok(());
            }

            inner.resolvers.remove(&id)
        };

        if let Some(Resolver { tx, blobs, timer }) = resolver {
            timer.abort();
            let _ = tx.send(Ok(blobs));
        }

        Ok(())
    }
}
