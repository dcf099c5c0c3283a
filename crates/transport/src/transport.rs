use {
    crate::{
        BatchOptions, Config, Error, Handler, Package, PackageBuffer, PackageId, Payload,
        QueueBuffer, Resolved, Socket,
        codec,
        handler::{InvokeRequest, Responder},
        invoke::PendingInvoke,
        package::ResponseHandle,
        resolver::Resolver,
        stream::{ReadStream, StreamItem, StreamKind, WriteStream, close_code},
    },
    bytes::Bytes,
    serde_json::Value as Json,
    std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        time::Duration,
    },
    tokio::sync::oneshot,
    wire::{
        DataType, Frame, MAX_SAFE_INTEGER, MIN_SAFE_INTEGER,
        frame::{self, BinaryFrame},
        id_from_f64,
        packet::{self, Action},
    },
};

/// Options for [`Transport::transmit`] and [`Transport::prepare_transmit`].
#[derive(Debug, Clone, Copy)]
pub struct TransmitOptions {
    /// Hand the package to the batch buffer instead of sending immediately.
    pub batch: Option<BatchOptions>,

    /// When false, the payload is treated as pure JSON; embedded blobs and
    /// streams are rejected.
    pub process_complex_types: bool,
}

impl Default for TransmitOptions {
    fn default() -> Self {
        Self {
            batch: None,
            process_complex_types: true,
        }
    }
}

/// Options for [`Transport::invoke`] and friends.
#[derive(Debug, Clone, Copy)]
pub struct InvokeOptions {
    pub batch: Option<BatchOptions>,
    pub process_complex_types: bool,

    /// Per-call override of the configured response timeout.
    pub response_timeout: Option<Duration>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            batch: None,
            process_complex_types: true,
            response_timeout: None,
        }
    }
}

/// Bidirectional message transport multiplexing transmits, invocations, and
/// object/binary streams over a single socket.
///
/// Cheap to clone; clones share the connection state.
#[derive(Clone)]
pub struct Transport {
    core: Arc<Core>,
}

impl Transport {
    /// Creates a transport with default configuration.
    pub fn new(socket: impl Socket, handler: impl Handler) -> Self {
        Self::builder().socket(socket).handler(handler).build()
    }

    /// Creates a new [`Builder`] for configuring and constructing a
    /// [`Transport`] instance.
    pub fn builder() -> Builder<(), ()> {
        Builder::new()
    }

    /// Whether the connection is currently usable.
    pub fn is_open(&self) -> bool {
        self.core.lock().open
    }

    /// Token fencing deferred work against reconnects; changes on every
    /// [`Transport::emit_bad_connection`].
    pub fn bad_connection_stamp(&self) -> u64 {
        self.core.stamp()
    }

    /// Fire-and-forget send to the peer.
    pub fn transmit(
        &self,
        receiver: &str,
        data: Payload,
        options: TransmitOptions,
    ) -> Result<(), Error> {
        let package = self.prepare_transmit(receiver, data, options)?;
        self.send_package(package, options.batch)
    }

    /// Invokes a remote procedure and resolves with its response data.
    pub async fn invoke(
        &self,
        procedure: &str,
        data: Payload,
        options: InvokeOptions,
    ) -> Result<Resolved, Error> {
        self.invoke_detailed(procedure, data, options)
            .await
            .map(|(data, _)| data)
    }

    /// Like [`Transport::invoke`], additionally exposing the response's
    /// [`DataType`].
    pub async fn invoke_detailed(
        &self,
        procedure: &str,
        data: Payload,
        options: InvokeOptions,
    ) -> Result<(Resolved, DataType), Error> {
        let mut package = self.prepare_invoke(procedure, data, options)?;
        let response = package
            .take_response()
            .ok_or_else(|| Error::invalid_action("invoke package without a response slot"))?;

        self.send_package(package, options.batch)?;
        response.wait().await
    }

    /// Builds a transmit package for deferred sending.
    pub fn prepare_transmit(
        &self,
        receiver: &str,
        data: Payload,
        options: TransmitOptions,
    ) -> Result<Package, Error> {
        let encoded = codec::encode(&self.core, data, options.process_complex_types)?;

        let head = Action::Transmit {
            receiver: receiver.to_owned(),
            data_type: encoded.data_type,
            data: encoded.data,
            meta: encoded.meta,
        }
        .head();

        Ok(Package::new(head, encoded.binary, encoded.streams))
    }

    /// Builds an invoke package. The response handle rides on the package;
    /// the response timer arms only after the package is sent AND every
    /// embedded stream has closed.
    pub fn prepare_invoke(
        &self,
        procedure: &str,
        data: Payload,
        options: InvokeOptions,
    ) -> Result<Package, Error> {
        let encoded = codec::encode(&self.core, data, options.process_complex_types)?;

        let (tx, rx) = oneshot::channel();
        let (call_id, stamp) = {
            let mut inner = self.core.lock();
            let call_id = inner.alloc_call_id();
            let stamp = inner.stamp;
            inner.invokes.insert(
                call_id,
                PendingInvoke {
                    tx,
                    timer: None,
                    stamp,
                },
            );
            (call_id, stamp)
        };

        let head = Action::Invoke {
            procedure: procedure.to_owned(),
            call_id,
            data_type: encoded.data_type,
            data: encoded.data,
            meta: encoded.meta,
        }
        .head();

        let timeout = options
            .response_timeout
            .unwrap_or(self.core.config.response_timeout);

        let mut package = Package::new(head, encoded.binary, encoded.streams.clone());
        package.response = Some(ResponseHandle(rx));

        let weak = Arc::downgrade(&self.core);
        let streams = encoded.streams;
        package.on_sent(Box::new(move || {
            Core::arm_invoke_timer(weak, call_id, stamp, timeout, streams);
        }));

        Ok(package)
    }

    /// Sends a package: buffered while the connection is down or when batch
    /// options are given, immediate otherwise.
    pub fn send_package(&self, package: Package, batch: Option<BatchOptions>) -> Result<(), Error> {
        {
            let mut inner = self.core.lock();
            if !inner.open || batch.is_some() {
                inner.buffer.add(package, batch);
                return Ok(());
            }
        }

        self.core.send_now(package)
    }

    /// Like [`Transport::send_package`], resolving once the package actually
    /// left for the socket (possibly after a buffer flush).
    pub async fn send_package_with_promise(
        &self,
        mut package: Package,
        batch: Option<BatchOptions>,
    ) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        package.on_sent(Box::new(move || {
            let _ = tx.send(());
        }));

        self.send_package(package, batch)?;
        rx.await.map_err(|_| Error::bad_connection("abandoned", None))
    }

    /// Removes a package that still sits in the batch buffer.
    pub fn try_cancel_package(&self, id: PackageId) -> bool {
        self.core.lock().buffer.try_remove(id).is_some()
    }

    /// Flushes the batch buffer; multiple packages leave as one bundle.
    pub fn flush_buffer(&self) -> Result<(), Error> {
        let packages = self.core.lock().buffer.flush();
        self.core.send_bundled(packages)
    }

    pub fn send_ping(&self) {
        let _ = self.core.socket.send(Frame::Binary(frame::ping()));
    }

    pub fn send_pong(&self) {
        let _ = self.core.socket.send(Frame::Binary(frame::pong()));
    }

    /// Inbound dispatch entry point. Processing errors never propagate; they
    /// surface through [`Handler::on_invalid_message`].
    pub fn emit_message(&self, frame: Frame) {
        if let Err(err) = Core::process_frame(&self.core, frame) {
            tracing::debug!(%err, "dropping invalid inbound message");
            self.core.handler.on_invalid_message(err);
        }
    }

    /// Marks the connection usable and flushes the batch buffer.
    pub fn emit_connection(&self) -> Result<(), Error> {
        self.core.lock().open = true;
        tracing::debug!("connection established");
        self.flush_buffer()
    }

    /// Marks the connection lost: bumps the fencing stamp, then rejects every
    /// pending invoke and resolver and fails every live stream. Identifier
    /// counters are left alone, packets for old ids may still arrive after a
    /// reconnect.
    pub fn emit_bad_connection(&self, reason: impl Into<String>, msg: Option<String>) {
        let reason = reason.into();

        let (invokes, resolvers, writers, readers) = {
            let mut inner = self.core.lock();
            inner.open = false;
            inner.stamp = inner.stamp.wrapping_add(1);
            inner.buffer.clear_batch_time();
            inner.backpressure_waiters.clear();

            (
                std::mem::take(&mut inner.invokes),
                std::mem::take(&mut inner.resolvers),
                std::mem::take(&mut inner.write_streams),
                std::mem::take(&mut inner.read_streams),
            )
        };

        tracing::warn!(%reason, "connection marked bad");

        for entry in invokes.into_values() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry
                .tx
                .send(Err(Error::bad_connection(reason.clone(), msg.clone())));
        }

        for resolver in resolvers.into_values() {
            resolver.timer.abort();
            let _ = resolver
                .tx
                .send(Err(Error::bad_connection(reason.clone(), msg.clone())));
        }

        for writer in writers.into_values() {
            writer.fail_connection(&reason);
        }

        for reader in readers.into_values() {
            reader.fail_connection(&reason);
        }
    }

    /// Replays stream writers blocked on socket backpressure, FIFO, for as
    /// long as the predicate stays low.
    pub fn emit_send_backpressure_drain(&self) {
        loop {
            if !self.core.socket.has_low_send_backpressure() {
                return;
            }

            let Some(waiter) = self.core.lock().backpressure_waiters.pop_front() else {
                return;
            };

            let _ = waiter.send(());
        }
    }

    #[cfg(test)]
    pub(crate) fn core_for_tests(&self) -> &Arc<Core> {
        &self.core
    }
}

/// Shared connection state behind every [`Transport`] clone and stream
/// handle.
pub(crate) struct Core {
    pub(crate) socket: Arc<dyn Socket>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) config: Config,
    state: Mutex<Inner>,
}

pub(crate) struct Inner {
    pub(crate) open: bool,
    pub(crate) stamp: u64,
    pub(crate) call_id_seq: u64,
    pub(crate) content_id_seq: i64,
    pub(crate) object_stream_seq: i64,
    pub(crate) binary_stream_seq: i64,
    pub(crate) invokes: HashMap<u64, PendingInvoke>,
    pub(crate) resolvers: HashMap<i64, Resolver>,
    pub(crate) write_streams: HashMap<i64, WriteStream>,
    pub(crate) read_streams: HashMap<i64, ReadStream>,
    pub(crate) backpressure_waiters: VecDeque<oneshot::Sender<()>>,
    pub(crate) buffer: Box<dyn PackageBuffer>,
}

enum Delivery {
    Transmit {
        receiver: String,
    },
    Invoke {
        procedure: String,
        call_id: u64,
    },
    Response {
        tx: oneshot::Sender<Result<(Resolved, DataType), Error>>,
    },
}

impl Core {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stamp(&self) -> u64 {
        self.lock().stamp
    }

    // ---- outbound plumbing -------------------------------------------------

    /// Sends a text head plus its optional companion binary-content frame as
    /// one corked unit.
    pub(crate) fn send_frames(&self, head: String, binary: Option<Bytes>) -> Result<(), Error> {
        let Some(binary) = binary else {
            return self.socket.send(Frame::Text(head)).map_err(Error::Socket);
        };

        let mut frames = vec![Frame::Text(head), Frame::Binary(binary)].into_iter();
        let mut result = Ok(());

        self.socket.cork(&mut || {
            result = frames
                .by_ref()
                .try_for_each(|frame| self.socket.send(frame))
                .map_err(Error::Socket);
        });

        result
    }

    pub(crate) fn send_head(&self, action: &Action) -> Result<(), Error> {
        self.send_frames(action.head(), None)
    }

    pub(crate) fn send_now(&self, package: Package) -> Result<(), Error> {
        self.send_frames(package.head.clone(), package.binary.clone())?;
        package.fire_after_send();
        Ok(())
    }

    /// Sends a batch of flushed packages, as a bundle when there are several.
    pub(crate) fn send_bundled(&self, mut packages: Vec<Package>) -> Result<(), Error> {
        if packages.len() < 2 {
            return match packages.pop() {
                Some(package) => self.send_now(package),
                None => Ok(()),
            };
        }

        let heads: Vec<_> = packages.iter().map(|package| package.head.clone()).collect();
        let mut text = Some(Frame::Text(packet::bundle_head(&heads)));
        let mut result = Ok(());

        self.socket.cork(&mut || {
            result = (|| {
                if let Some(frame) = text.take() {
                    self.socket.send(frame)?;
                }

                packages
                    .iter()
                    .filter_map(|package| package.binary.clone())
                    .try_for_each(|binary| self.socket.send(Frame::Binary(binary)))
            })()
            .map_err(Error::Socket);
        });

        result?;

        for package in packages {
            package.fire_after_send();
        }

        Ok(())
    }

    pub(crate) async fn wait_low_send_backpressure(&self) {
        loop {
            if self.socket.has_low_send_backpressure() {
                return;
            }

            let (tx, rx) = oneshot::channel();
            self.lock().backpressure_waiters.push_back(tx);

            // A cleared waiter queue means the connection went away; the
            // following send will surface the failure.
            if rx.await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn send_object_chunk(
        core: &Arc<Self>,
        stream_id: i64,
        value: Payload,
        end: bool,
    ) -> Result<(), Error> {
        let encoded = codec::encode_chunk(core, value)?;

        let action = if end {
            Action::StreamEnd {
                stream_id,
                data_type: Some(encoded.data_type),
                data: encoded.data,
                meta: encoded.meta,
            }
        } else {
            Action::StreamChunk {
                stream_id,
                data_type: encoded.data_type,
                data: encoded.data,
                meta: encoded.meta,
            }
        };

        let package = Package::new(action.head(), encoded.binary, encoded.streams);
        core.send_now(package)
    }

    pub(crate) fn send_stream_end(&self, stream_id: i64) -> Result<(), Error> {
        self.send_head(&Action::StreamEnd {
            stream_id,
            data_type: None,
            data: None,
            meta: None,
        })
    }

    pub(crate) fn send_binary_chunk(
        &self,
        stream_id: i64,
        payload: &[u8],
        end: bool,
    ) -> Result<(), Error> {
        self.socket
            .send(Frame::Binary(frame::stream_chunk(stream_id, payload, end)))
            .map_err(Error::Socket)
    }

    pub(crate) fn send_write_stream_close(&self, stream_id: i64, code: u64) -> Result<(), Error> {
        self.send_head(&Action::WriteStreamClose { stream_id, code })
    }

    // ---- invoke responses --------------------------------------------------

    pub(crate) fn respond_data(core: &Arc<Self>, call_id: u64, data: Payload) -> Result<(), Error> {
        let encoded = codec::encode(core, data, true)?;

        let head = Action::InvokeDataResp {
            call_id,
            data_type: encoded.data_type,
            data: encoded.data,
            meta: encoded.meta,
        }
        .head();

        let package = Package::new(head, encoded.binary, encoded.streams);
        core.send_now(package)
    }

    pub(crate) fn respond_err(&self, call_id: u64, name: &str, message: &str) -> Result<(), Error> {
        let err = DehydratedError {
            name: name.to_owned(),
            message: message.to_owned(),
        };

        self.send_head(&Action::InvokeErrResp {
            call_id,
            err: serde_json::to_value(&err).unwrap_or(Json::Null),
        })
    }

    // ---- identifier spaces -------------------------------------------------

    pub(crate) fn alloc_stream_id(&self, kind: StreamKind) -> (i64, u64) {
        let mut inner = self.lock();
        (inner.alloc_stream_id(kind), inner.stamp)
    }

    pub(crate) fn insert_write_stream(&self, id: i64, stream: WriteStream) {
        self.lock().write_streams.insert(id, stream);
    }

    pub(crate) fn remove_write_stream(&self, id: i64) {
        self.lock().write_streams.remove(&id);
    }

    pub(crate) fn remove_read_stream(&self, id: i64) {
        self.lock().read_streams.remove(&id);
    }

    /// Registers a read stream for a peer-allocated id and accepts it with
    /// the configured initial window.
    pub(crate) fn create_read_stream(core: &Arc<Self>, stream_id: i64) -> Result<ReadStream, Error> {
        if stream_id == 0 {
            return Err(Error::invalid_message("stream id zero"));
        }

        let stream = {
            let mut inner = core.lock();

            if inner.read_streams.contains_key(&stream_id) {
                return Err(Error::invalid_message(format!(
                    "stream {stream_id} already exists"
                )));
            }

            let stream = ReadStream::new(
                StreamKind::of_id(stream_id),
                stream_id,
                inner.stamp,
                Arc::downgrade(core),
            );
            inner.read_streams.insert(stream_id, stream.clone());
            stream
        };

        core.send_head(&Action::StreamAccept {
            stream_id,
            credit: core.config.initial_stream_credit,
        })?;

        Ok(stream)
    }

    // ---- inbound dispatch --------------------------------------------------

    pub(crate) fn process_frame(core: &Arc<Self>, frame: Frame) -> Result<(), Error> {
        match frame {
            Frame::Binary(bytes) => match frame::classify(&bytes)? {
                BinaryFrame::Ping => {
                    core.handler.on_ping();
                    Ok(())
                }

                BinaryFrame::Pong => {
                    core.handler.on_pong();
                    Ok(())
                }

                BinaryFrame::BinaryContent {
                    id,
                    blobs,
                    continued,
                } => core.feed_binary_content(id, blobs, continued),

                BinaryFrame::StreamChunk { stream_id, payload } => {
                    core.binary_chunk(stream_id, payload, false)
                }

                BinaryFrame::StreamEnd { stream_id, payload } => {
                    core.binary_chunk(stream_id, payload, true)
                }
            },

            Frame::Text(raw) => {
                for action in packet::parse_text(&raw)? {
                    Self::process_action(core, action)?;
                }
                Ok(())
            }
        }
    }

    fn process_action(core: &Arc<Self>, action: Action) -> Result<(), Error> {
        match action {
            Action::Transmit {
                receiver,
                data_type,
                data,
                meta,
            } => Self::deliver(core, Delivery::Transmit { receiver }, data_type, data, meta),

            Action::Invoke {
                procedure,
                call_id,
                data_type,
                data,
                meta,
            } => Self::deliver(
                core,
                Delivery::Invoke { procedure, call_id },
                data_type,
                data,
                meta,
            ),

            Action::InvokeDataResp {
                call_id,
                data_type,
                data,
                meta,
            } => {
                let entry = core.take_invoke(call_id)?;
                Self::deliver(core, Delivery::Response { tx: entry.tx }, data_type, data, meta)
            }

            Action::InvokeErrResp { call_id, err } => {
                let entry = core.take_invoke(call_id)?;
                let _ = entry.tx.send(Err(hydrate_error(&err)));
                Ok(())
            }

            Action::StreamAccept { stream_id, credit } => {
                core.writer(stream_id)?.accept(credit);
                Ok(())
            }

            Action::StreamDataPermission { stream_id, credit } => {
                core.writer(stream_id)?.add_credit(credit);
                Ok(())
            }

            Action::ReadStreamClose { stream_id, code } => {
                let writer = core
                    .lock()
                    .write_streams
                    .remove(&stream_id)
                    .ok_or_else(|| unknown_stream(stream_id))?;
                writer.read_closed(code.unwrap_or(close_code::END));
                Ok(())
            }

            Action::StreamChunk {
                stream_id,
                data_type,
                data,
                meta,
            } => Self::object_chunk(core, stream_id, data_type, data, meta, false),

            Action::StreamEnd {
                stream_id,
                data_type,
                data,
                meta,
            } => match data_type {
                Some(data_type) => Self::object_chunk(core, stream_id, data_type, data, meta, true),
                None => {
                    let reader = core
                        .lock()
                        .read_streams
                        .remove(&stream_id)
                        .ok_or_else(|| unknown_stream(stream_id))?;
                    reader.finish();
                    Ok(())
                }
            },

            Action::WriteStreamClose { stream_id, code } => {
                let reader = core
                    .lock()
                    .read_streams
                    .remove(&stream_id)
                    .ok_or_else(|| unknown_stream(stream_id))?;
                reader.surface_close(code);
                Ok(())
            }
        }
    }

    /// Decodes a payload slot and hands it to its destination, detouring
    /// through a binary-content resolver when referenced blobs are still in
    /// flight.
    fn deliver(
        core: &Arc<Self>,
        delivery: Delivery,
        data_type: DataType,
        data: Option<Json>,
        meta: Option<Json>,
    ) -> Result<(), Error> {
        let allow_streams = core.config.streams_enabled;

        if !data_type.has_binaries() {
            return match codec::decode(core, data_type, data, None, allow_streams) {
                Ok(resolved) => {
                    Self::dispatch(core, delivery, resolved, data_type);
                    Ok(())
                }
                Err(err) => fail_delivery(delivery, err),
            };
        }

        let content_id = content_id_of(data_type, &data, &meta)?;
        let rx = match Self::register_resolver(core, content_id) {
            Ok(rx) => rx,
            Err(err) => return fail_delivery(delivery, err),
        };

        let core = core.clone();
        let stamp = core.stamp();

        tokio::spawn(async move {
            let result = match rx.await {
                Ok(Ok(blobs)) => codec::decode(&core, data_type, data, Some(&blobs), allow_streams),
                Ok(Err(err)) => Err(err),
                Err(_) => return,
            };

            // Deferred work is fenced against reconnects.
            if core.stamp() != stamp {
                return;
            }

            match result {
                Ok(resolved) => Self::dispatch(&core, delivery, resolved, data_type),
                Err(err) => match delivery {
                    Delivery::Response { tx } => {
                        let _ = tx.send(Err(err));
                    }
                    _ => core.handler.on_invalid_message(err),
                },
            }
        });

        Ok(())
    }

    fn dispatch(core: &Arc<Self>, delivery: Delivery, data: Resolved, data_type: DataType) {
        match delivery {
            Delivery::Transmit { receiver } => core.handler.on_transmit(&receiver, data),

            Delivery::Invoke { procedure, call_id } => {
                let responder = Responder::new(Arc::downgrade(core), call_id, core.stamp());
                core.handler
                    .on_invoke(InvokeRequest::new(procedure, data, responder));
            }

            Delivery::Response { tx } => {
                let _ = tx.send(Ok((data, data_type)));
            }
        }
    }

    fn object_chunk(
        core: &Arc<Self>,
        stream_id: i64,
        data_type: DataType,
        data: Option<Json>,
        meta: Option<Json>,
        end: bool,
    ) -> Result<(), Error> {
        let reader = {
            let inner = core.lock();
            inner
                .read_streams
                .get(&stream_id)
                .cloned()
                .ok_or_else(|| unknown_stream(stream_id))?
        };

        if reader.kind() != StreamKind::Object {
            return Err(Error::invalid_message("object chunk on a binary stream"));
        }

        if data_type.has_streams() && !core.config.chunks_can_contain_streams {
            return Err(Error::invalid_message("stream embedded in a chunk"));
        }

        let allow_streams = core.config.streams_enabled && core.config.chunks_can_contain_streams;

        if data_type.has_binaries() {
            let content_id = content_id_of(data_type, &data, &meta)?;
            let rx = Self::register_resolver(core, content_id)?;

            // The pending slot keeps its place in the queue, preserving
            // arrival order across resolution delays.
            let (slot_tx, slot_rx) = oneshot::channel();
            reader.push_pending(slot_rx);

            let task_core = core.clone();
            tokio::spawn(async move {
                let result = match rx.await {
                    Ok(Ok(blobs)) => {
                        codec::decode(&task_core, data_type, data, Some(&blobs), allow_streams)
                            .map(StreamItem::Value)
                    }
                    Ok(Err(err)) => Err(err),
                    Err(_) => return,
                };

                let _ = slot_tx.send(result);
            });
        } else {
            let item = codec::decode(core, data_type, data, None, allow_streams)?;
            reader.push_ready(StreamItem::Value(item));
        }

        if end {
            reader.finish();
            core.remove_read_stream(stream_id);
        }

        Ok(())
    }

    fn binary_chunk(&self, stream_id: i64, payload: Bytes, end: bool) -> Result<(), Error> {
        let reader = {
            let inner = self.lock();
            inner
                .read_streams
                .get(&stream_id)
                .cloned()
                .ok_or_else(|| unknown_stream(stream_id))?
        };

        if reader.kind() != StreamKind::Binary {
            return Err(Error::invalid_message("binary chunk on an object stream"));
        }

        if !payload.is_empty() {
            reader.push_ready(StreamItem::Bytes(payload));
        }

        if end {
            reader.finish();
            self.remove_read_stream(stream_id);
        }

        Ok(())
    }

    fn writer(&self, stream_id: i64) -> Result<WriteStream, Error> {
        self.lock()
            .write_streams
            .get(&stream_id)
            .cloned()
            .ok_or_else(|| unknown_stream(stream_id))
    }
}

impl Inner {
    pub(crate) fn new(buffer: Box<dyn PackageBuffer>) -> Self {
        Self {
            open: false,
            stamp: 0,
            call_id_seq: 0,
            content_id_seq: 0,
            object_stream_seq: 1,
            binary_stream_seq: -1,
            invokes: HashMap::new(),
            resolvers: HashMap::new(),
            write_streams: HashMap::new(),
            read_streams: HashMap::new(),
            backpressure_waiters: VecDeque::new(),
            buffer,
        }
    }

    /// Stream ids carry their kind in the sign; both spaces wrap at the safe
    /// bound, skipping ids still live on this side.
    fn alloc_stream_id(&mut self, kind: StreamKind) -> i64 {
        loop {
            let id = match kind {
                StreamKind::Object => {
                    let id = self.object_stream_seq;
                    self.object_stream_seq = if id >= MAX_SAFE_INTEGER { 1 } else { id + 1 };
                    id
                }
                StreamKind::Binary => {
                    let id = self.binary_stream_seq;
                    self.binary_stream_seq = if id <= MIN_SAFE_INTEGER { -1 } else { id - 1 };
                    id
                }
            };

            if !self.write_streams.contains_key(&id) {
                return id;
            }
        }
    }
}

fn content_id_of(
    data_type: DataType,
    data: &Option<Json>,
    meta: &Option<Json>,
) -> Result<i64, Error> {
    let slot = match data_type {
        DataType::Binary => data,
        _ => meta,
    };

    slot.as_ref()
        .and_then(Json::as_f64)
        .ok_or_else(|| Error::invalid_message("missing binary content id"))
        .and_then(|raw| id_from_f64(raw).map_err(Error::from))
}

fn fail_delivery(delivery: Delivery, err: Error) -> Result<(), Error> {
    match delivery {
        // Response errors belong to the waiting caller, not the message
        // stream.
        Delivery::Response { tx } => {
            let _ = tx.send(Err(err));
            Ok(())
        }
        _ => Err(err),
    }
}

/// Wire form of an invoke error response.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
struct DehydratedError {
    name: String,
    message: String,
}

impl Default for DehydratedError {
    fn default() -> Self {
        Self {
            name: "Error".to_owned(),
            message: String::new(),
        }
    }
}

fn hydrate_error(raw: &Json) -> Error {
    let err: DehydratedError = serde_json::from_value(raw.clone()).unwrap_or_default();

    Error::Remote {
        name: err.name,
        message: err.message,
    }
}

fn unknown_stream(stream_id: i64) -> Error {
    Error::invalid_message(format!("unknown stream {stream_id}"))
}

/// Builder for configuring and constructing a [`Transport`] instance.
pub struct Builder<S, H> {
    socket: S,
    handler: H,
    config: Config,
    buffer: Box<dyn PackageBuffer>,
}

impl Builder<(), ()> {
    pub fn new() -> Self {
        Self {
            socket: (),
            handler: (),
            config: Config::default(),
            buffer: Box::new(QueueBuffer::default()),
        }
    }
}

impl Default for Builder<(), ()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, H> Builder<S, H> {
    /// Set the [`Socket`] backing the transport.
    pub fn socket<T>(self, socket: T) -> Builder<T, H>
    where
        T: Socket,
    {
        Builder {
            socket,
            handler: self.handler,
            config: self.config,
            buffer: self.buffer,
        }
    }

    /// Set the [`Handler`] receiving transport events.
    pub fn handler<T>(self, handler: T) -> Builder<S, T>
    where
        T: Handler,
    {
        Builder {
            socket: self.socket,
            handler,
            config: self.config,
            buffer: self.buffer,
        }
    }

    /// Replace the [`PackageBuffer`] collaborator.
    pub fn package_buffer(mut self, buffer: impl PackageBuffer) -> Self {
        self.buffer = Box::new(buffer);
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn binary_content_packet_timeout(mut self, timeout: Duration) -> Self {
        self.config.binary_content_packet_timeout = timeout;
        self
    }

    pub fn streams_per_package_limit(mut self, limit: usize) -> Self {
        self.config.streams_per_package_limit = limit;
        self
    }

    pub fn streams_enabled(mut self, enabled: bool) -> Self {
        self.config.streams_enabled = enabled;
        self
    }

    pub fn chunks_can_contain_streams(mut self, enabled: bool) -> Self {
        self.config.chunks_can_contain_streams = enabled;
        self
    }

    pub fn initial_stream_credit(mut self, credit: u64) -> Self {
        self.config.initial_stream_credit = credit;
        self
    }

    /// Build the configured [`Transport`] instance.
    pub fn build(self) -> Transport
    where
        S: Socket,
        H: Handler,
    {
        Transport {
            core: Arc::new(Core {
                socket: Arc::new(self.socket),
                handler: Arc::new(self.handler),
                config: self.config,
                state: Mutex::new(Inner::new(self.buffer)),
            }),
        }
    }
}
