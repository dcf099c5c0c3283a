use {
    bytes::Bytes,
    futures_concurrency::future::Race,
    std::{
        pin::pin,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    },
    tokio::sync::mpsc,
    transport::{
        Config, Error, Frame, Handler, InvokeOptions, InvokeRequest, Payload, Resolved, StreamItem,
        TimeoutKind, TransmitOptions, WriteStream,
        loopback::{self, Peer},
        prepare_multi_transmit,
    },
    wire::{
        DataType,
        frame::{self, BinaryFrame},
        packet::{self, Action},
    },
};

struct Recorder {
    transmits: mpsc::UnboundedSender<(String, Resolved)>,
    invokes: mpsc::UnboundedSender<InvokeRequest>,
    invalid: mpsc::UnboundedSender<Error>,
    listener_errors: mpsc::UnboundedSender<Error>,
    pings: Arc<AtomicUsize>,
    pongs: Arc<AtomicUsize>,
}

struct Events {
    transmits: mpsc::UnboundedReceiver<(String, Resolved)>,
    invokes: mpsc::UnboundedReceiver<InvokeRequest>,
    invalid: mpsc::UnboundedReceiver<Error>,
    listener_errors: mpsc::UnboundedReceiver<Error>,
    pings: Arc<AtomicUsize>,
    pongs: Arc<AtomicUsize>,
}

fn recorder() -> (Recorder, Events) {
    let (transmit_tx, transmit_rx) = mpsc::unbounded_channel();
    let (invoke_tx, invoke_rx) = mpsc::unbounded_channel();
    let (invalid_tx, invalid_rx) = mpsc::unbounded_channel();
    let (listener_tx, listener_rx) = mpsc::unbounded_channel();
    let pings = Arc::new(AtomicUsize::new(0));
    let pongs = Arc::new(AtomicUsize::new(0));

    (
        Recorder {
            transmits: transmit_tx,
            invokes: invoke_tx,
            invalid: invalid_tx,
            listener_errors: listener_tx,
            pings: pings.clone(),
            pongs: pongs.clone(),
        },
        Events {
            transmits: transmit_rx,
            invokes: invoke_rx,
            invalid: invalid_rx,
            listener_errors: listener_rx,
            pings,
            pongs,
        },
    )
}

impl Handler for Recorder {
    fn on_transmit(&self, receiver: &str, data: Resolved) {
        let _ = self.transmits.send((receiver.to_owned(), data));
    }

    fn on_invoke(&self, invoke: InvokeRequest) {
        let _ = self.invokes.send(invoke);
    }

    fn on_invalid_message(&self, err: Error) {
        let _ = self.invalid.send(err);
    }

    fn on_listener_error(&self, err: Error) {
        let _ = self.listener_errors.send(err);
    }

    fn on_ping(&self) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }

    fn on_pong(&self) {
        self.pongs.fetch_add(1, Ordering::SeqCst);
    }
}

fn pair_default() -> (Peer, Events, Peer, Events) {
    pair_with(Config::default(), Config::default())
}

fn pair_with(config_a: Config, config_b: Config) -> (Peer, Events, Peer, Events) {
    let (handler_a, events_a) = recorder();
    let (handler_b, events_b) = recorder();
    let (a, b) = loopback::pair(config_a, handler_a, config_b, handler_b);

    (a, events_a, b, events_b)
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn sleep(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await
}

fn text_heads(peer: &Peer) -> Vec<String> {
    peer.sent_frames()
        .iter()
        .filter_map(|frame| frame.as_text().cloned())
        .collect()
}

fn sent_actions(peer: &Peer) -> Vec<Action> {
    text_heads(peer)
        .iter()
        .flat_map(|head| packet::parse_text(head).unwrap())
        .collect()
}

fn sent_stream_payload_bytes(peer: &Peer) -> usize {
    peer.sent_frames()
        .iter()
        .filter_map(|frame| frame.as_binary())
        .filter_map(|bytes| match frame::classify(bytes).ok()? {
            BinaryFrame::StreamChunk { payload, .. } | BinaryFrame::StreamEnd { payload, .. } => {
                Some(payload.len())
            }
            _ => None,
        })
        .sum()
}

#[tokio::test]
async fn plain_invoke() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    let respond = async {
        let invoke = recv(&mut events_b.invokes).await;
        assert_eq!(invoke.procedure(), "add");

        let lhs = invoke.data().get("a").and_then(Resolved::as_i64).unwrap();
        let rhs = invoke.data().get("b").and_then(Resolved::as_i64).unwrap();
        invoke.responder().send_data(Payload::int(lhs + rhs));
    };

    let call = a.invoke(
        "add",
        Payload::object([("a", Payload::int(2)), ("b", Payload::int(3))]),
        InvokeOptions::default(),
    );

    let (result, ()) = tokio::join!(call, respond);
    assert_eq!(result.unwrap(), Resolved::int(5));
}

#[tokio::test]
async fn invoke_with_blob() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    let respond = async {
        let invoke = recv(&mut events_b.invokes).await;
        assert_eq!(invoke.data(), &Resolved::bytes(vec![1, 2, 3]));
        invoke.responder().send_data(Payload::Null);
    };

    let call = a.invoke(
        "upload",
        Payload::bytes(vec![1, 2, 3]),
        InvokeOptions::default(),
    );

    let (result, ()) = tokio::join!(call, respond);
    assert_eq!(result.unwrap(), Resolved::Null);

    // The wire shape: a text head with the binary data type plus one
    // companion binary-content frame.
    assert!(matches!(
        sent_actions(&a).first(),
        Some(Action::Invoke {
            data_type: DataType::Binary,
            ..
        })
    ));
    assert_eq!(
        a.sent_frames()
            .iter()
            .filter_map(|frame| frame.as_binary())
            .filter(|bytes| matches!(
                frame::classify(bytes),
                Ok(BinaryFrame::BinaryContent { .. })
            ))
            .count(),
        1
    );
}

#[tokio::test]
async fn mixed_payload_with_blob_and_stream() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    let stream = WriteStream::object();
    let file = Bytes::from(vec![9u8; 16]);

    a.transmit(
        "docs",
        Payload::object([
            ("file", Payload::Blob(file.clone())),
            ("meta", Payload::object([("label", "x".into())])),
            ("s", Payload::Stream(stream.clone())),
        ]),
        TransmitOptions::default(),
    )
    .unwrap();

    let (receiver, data) = recv(&mut events_b.transmits).await;
    assert_eq!(receiver, "docs");
    assert_eq!(data.get("file").unwrap().as_blob(), Some(&file));
    assert_eq!(
        data.get("meta").unwrap().get("label").unwrap().as_str(),
        Some("x")
    );

    let reader = data.get("s").unwrap().as_stream().unwrap().clone();

    // One text head, one binary-content frame.
    let heads = text_heads(&a);
    assert_eq!(heads.len(), 1);
    assert!(matches!(
        packet::parse_text(&heads[0]).unwrap().first(),
        Some(Action::Transmit {
            data_type: DataType::JsonWithStreamsAndBinaries,
            ..
        })
    ));
    assert_eq!(
        a.sent_frames()
            .iter()
            .filter(|frame| frame.as_binary().is_some())
            .count(),
        1
    );

    stream.write(Payload::str("chunk-1")).await.unwrap();
    stream.end(Some(Payload::str("chunk-2"))).await.unwrap();

    assert_eq!(
        reader.next().await.unwrap().unwrap(),
        StreamItem::Value(Resolved::str("chunk-1"))
    );
    assert_eq!(
        reader.next().await.unwrap().unwrap(),
        StreamItem::Value(Resolved::str("chunk-2"))
    );
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn stream_credit_is_respected() {
    let (a, _events_a, _b, mut events_b) = pair_with(
        Config::default(),
        Config {
            initial_stream_credit: 1024,
            ..Default::default()
        },
    );

    let stream = WriteStream::binary();
    a.transmit(
        "file",
        Payload::object([("s", Payload::Stream(stream.clone()))]),
        TransmitOptions::default(),
    )
    .unwrap();

    let (_, data) = recv(&mut events_b.transmits).await;
    let reader = data.get("s").unwrap().as_stream().unwrap().clone();

    let writer = tokio::spawn({
        let stream = stream.clone();
        async move {
            stream.write_bytes(vec![7u8; 2048]).await.unwrap();
            stream.end_bytes(None).await.unwrap();
        }
    });

    // Only the initial window may leave before the reader consumes anything.
    sleep(200).await;
    assert_eq!(sent_stream_payload_bytes(&a), 1024);
    assert!(!writer.is_finished());

    let first = reader.next().await.unwrap().unwrap();
    assert_eq!(first.as_bytes().unwrap().len(), 1024);

    let second = reader.next().await.unwrap().unwrap();
    assert_eq!(second.as_bytes().unwrap().len(), 1024);

    assert!(reader.next().await.is_none());
    writer.await.unwrap();
    assert_eq!(sent_stream_payload_bytes(&a), 2048);
}

#[tokio::test]
async fn binary_content_resolver_times_out() {
    let (_a, _events_a, b, mut events_b) = pair_with(
        Config::default(),
        Config {
            binary_content_packet_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    );

    // A transmit referencing binary content 42 that never arrives.
    b.emit_message(Frame::Text(r#"1,"ch",3,{"_b":0},42"#.to_owned()));

    let err = recv(&mut events_b.invalid).await;
    assert!(matches!(err, Error::Timeout(TimeoutKind::BinaryResolve)));
}

#[tokio::test]
async fn disconnect_rejects_pending_invokes() {
    let (a, _events_a, _b, _events_b) = pair_default();

    let stamp = a.bad_connection_stamp();
    let mut call = pin!(a.invoke("slow", Payload::Null, InvokeOptions::default()));

    assert!(
        tokio::time::timeout(Duration::from_millis(100), call.as_mut())
            .await
            .is_err()
    );

    a.emit_bad_connection("lost", None);

    let err = call.await.unwrap_err();
    assert!(err.is_bad_connection());
    assert_ne!(a.bad_connection_stamp(), stamp);
    assert!(!a.is_open());
}

#[tokio::test]
async fn invoke_timer_arms_after_embedded_streams_close() {
    let (a, _events_a, _b, _events_b) = pair_with(
        Config {
            response_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        Config::default(),
    );

    let stream = WriteStream::object();
    let mut call = pin!(a.invoke(
        "job",
        Payload::object([("s", Payload::Stream(stream.clone()))]),
        InvokeOptions::default(),
    ));

    // Well past the response timeout, but the embedded stream is still open,
    // so the timer has not started.
    let outcome = (
        async {
            let _ = call.as_mut().await;
            "finished"
        },
        async {
            sleep(500).await;
            "pending"
        },
    )
        .race()
        .await;
    assert_eq!(outcome, "pending");

    stream.end(None).await.unwrap();

    let err = call.await.unwrap_err();
    assert!(matches!(err, Error::Timeout(TimeoutKind::InvokeResponse)));
}

#[tokio::test]
async fn backpressure_gates_stream_writes() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    let stream = WriteStream::object();
    a.transmit(
        "ch",
        Payload::object([("s", Payload::Stream(stream.clone()))]),
        TransmitOptions::default(),
    )
    .unwrap();

    let (_, data) = recv(&mut events_b.transmits).await;
    let reader = data.get("s").unwrap().as_stream().unwrap().clone();

    a.set_low_send_backpressure(false);

    let write = tokio::spawn({
        let stream = stream.clone();
        async move { stream.write(Payload::str("x")).await.unwrap() }
    });

    sleep(150).await;
    assert!(!write.is_finished());
    assert!(
        !sent_actions(&a)
            .iter()
            .any(|action| matches!(action, Action::StreamChunk { .. }))
    );

    a.set_low_send_backpressure(true);
    write.await.unwrap();

    assert_eq!(
        reader.next().await.unwrap().unwrap(),
        StreamItem::Value(Resolved::str("x"))
    );
}

#[tokio::test]
async fn chunk_order_survives_decode_latency() {
    let (a, _events_a, b, mut events_b) = pair_default();

    let stream = WriteStream::object();
    a.transmit(
        "ch",
        Payload::object([("s", Payload::Stream(stream.clone()))]),
        TransmitOptions::default(),
    )
    .unwrap();

    let (_, data) = recv(&mut events_b.transmits).await;
    let reader = data.get("s").unwrap().as_stream().unwrap().clone();

    // A chunk whose decode awaits binary content, then a plain chunk, then
    // the end. The consumer must still observe sent order.
    b.emit_message(Frame::Text(r#"7,1,3,{"_b":0},7"#.to_owned()));
    b.emit_message(Frame::Text(r#"7,1,0,"second""#.to_owned()));
    b.emit_message(Frame::Text("8,1".to_owned()));

    let collect = tokio::spawn({
        let reader = reader.clone();
        async move { reader.collect().await }
    });

    sleep(100).await;
    assert!(!collect.is_finished());

    b.emit_message(Frame::Binary(
        frame::binary_content(7, &[Bytes::from_static(b"first")]).unwrap(),
    ));

    let items = collect.await.unwrap().unwrap();
    assert_eq!(
        items,
        vec![
            StreamItem::Value(Resolved::bytes(&b"first"[..])),
            StreamItem::Value(Resolved::str("second")),
        ]
    );
}

#[tokio::test]
async fn writer_abort_surfaces_the_close_code() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    let stream = WriteStream::object();
    a.transmit(
        "ch",
        Payload::object([("s", Payload::Stream(stream.clone()))]),
        TransmitOptions::default(),
    )
    .unwrap();

    let (_, data) = recv(&mut events_b.transmits).await;
    let reader = data.get("s").unwrap().as_stream().unwrap().clone();

    stream.close(4001).unwrap();

    assert!(matches!(
        reader.next().await,
        Some(Err(Error::StreamClosed(4001)))
    ));
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn reader_abort_stops_the_writer() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    let stream = WriteStream::object();
    a.transmit(
        "ch",
        Payload::object([("s", Payload::Stream(stream.clone()))]),
        TransmitOptions::default(),
    )
    .unwrap();

    let (_, data) = recv(&mut events_b.transmits).await;
    let reader = data.get("s").unwrap().as_stream().unwrap().clone();

    reader.close(None).unwrap();
    stream.closed().await;

    let err = stream.write(Payload::str("late")).await.unwrap_err();
    assert!(matches!(err, Error::StreamClosed(code) if code == 200));
}

#[tokio::test]
async fn double_response_is_a_listener_error() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    let respond = async {
        let invoke = recv(&mut events_b.invokes).await;
        let responder = invoke.responder();
        responder.send_data(Payload::int(1));
        responder.send_data(Payload::int(2));
    };

    let call = a.invoke("once", Payload::Null, InvokeOptions::default());
    let (result, ()) = tokio::join!(call, respond);

    assert_eq!(result.unwrap(), Resolved::int(1));
    assert!(matches!(
        recv(&mut events_b.listener_errors).await,
        Error::InvalidAction(_)
    ));
}

#[tokio::test]
async fn responders_are_fenced_after_bad_connection() {
    let (a, _events_a, b, mut events_b) = pair_default();

    let caller = tokio::spawn({
        let a = a.transport().clone();
        async move { a.invoke("job", Payload::Null, InvokeOptions::default()).await }
    });

    let invoke = recv(&mut events_b.invokes).await;
    let responder = invoke.responder();

    let heads_before = text_heads(&b).len();
    b.emit_bad_connection("lost", None);
    responder.send_data(Payload::int(1));

    assert_eq!(text_heads(&b).len(), heads_before);
    assert!(events_b.listener_errors.try_recv().is_err());

    caller.abort();
}

#[tokio::test]
async fn remote_errors_reject_the_invoke() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    let respond = async {
        let invoke = recv(&mut events_b.invokes).await;
        invoke.responder().send_err("NoProc", "unknown procedure");
    };

    let call = a.invoke("missing", Payload::Null, InvokeOptions::default());
    let (result, ()) = tokio::join!(call, respond);

    assert!(matches!(
        result.unwrap_err(),
        Error::Remote { name, message } if name == "NoProc" && message == "unknown procedure"
    ));
}

#[tokio::test]
async fn batched_packages_flush_as_one_bundle() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    let batch = TransmitOptions {
        batch: Some(Default::default()),
        ..Default::default()
    };

    a.transmit("x", Payload::int(1), batch).unwrap();
    a.transmit("y", Payload::int(2), batch).unwrap();
    assert!(a.sent_frames().is_empty());

    a.flush_buffer().unwrap();

    let (receiver, data) = recv(&mut events_b.transmits).await;
    assert_eq!((receiver.as_str(), data), ("x", Resolved::int(1)));
    let (receiver, data) = recv(&mut events_b.transmits).await;
    assert_eq!((receiver.as_str(), data), ("y", Resolved::int(2)));

    let heads = text_heads(&a);
    assert_eq!(heads.len(), 1);
    assert!(heads[0].starts_with("0,"));
}

#[tokio::test]
async fn canceled_packages_never_leave() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    let package = a
        .prepare_transmit("x", Payload::int(1), TransmitOptions::default())
        .unwrap();
    let id = package.id();

    a.send_package(package, Some(Default::default())).unwrap();
    assert!(a.try_cancel_package(id));
    assert!(!a.try_cancel_package(id));

    a.flush_buffer().unwrap();
    sleep(50).await;
    assert!(events_b.transmits.try_recv().is_err());
}

#[tokio::test]
async fn disconnect_buffers_until_reconnect() {
    let (a, _events_a, _b, mut events_b) = pair_default();

    a.emit_bad_connection("lost", None);
    a.transmit("x", Payload::int(1), TransmitOptions::default())
        .unwrap();

    sleep(50).await;
    assert!(events_b.transmits.try_recv().is_err());

    a.emit_connection().unwrap();

    let (receiver, data) = recv(&mut events_b.transmits).await;
    assert_eq!((receiver.as_str(), data), ("x", Resolved::int(1)));
}

#[tokio::test]
async fn send_promise_resolves_once_flushed() {
    let (a, _events_a, _b, _events_b) = pair_default();

    let package = a
        .prepare_transmit("x", Payload::int(1), TransmitOptions::default())
        .unwrap();

    let mut promise = pin!(a.send_package_with_promise(package, Some(Default::default())));
    assert!(
        tokio::time::timeout(Duration::from_millis(50), promise.as_mut())
            .await
            .is_err()
    );

    a.flush_buffer().unwrap();
    promise.await.unwrap();
}

#[tokio::test]
async fn ping_pong_round_trip() {
    let (a, events_a, b, events_b) = pair_default();

    a.send_ping();
    b.send_pong();
    sleep(50).await;

    assert_eq!(events_b.pings.load(Ordering::SeqCst), 1);
    assert_eq!(events_a.pongs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn multi_transmit_broadcasts_to_many_peers() {
    let package = prepare_multi_transmit(
        "broadcast",
        Payload::object([("blob", Payload::bytes(vec![4, 5]))]),
    )
    .unwrap();

    let (first_a, _events, _first_b, mut first_events) = pair_default();
    let (second_a, _events2, _second_b, mut second_events) = pair_default();

    first_a.send_multi_package(&package, None).unwrap();
    second_a.send_multi_package(&package, None).unwrap();

    for events in [&mut first_events, &mut second_events] {
        let (receiver, data) = recv(&mut events.transmits).await;
        assert_eq!(receiver, "broadcast");
        assert_eq!(data.get("blob").unwrap().as_blob().unwrap().as_ref(), &[4, 5]);
    }
}

#[tokio::test]
async fn malformed_frames_surface_as_invalid_messages() {
    let (_a, _events_a, b, mut events_b) = pair_default();

    b.emit_message(Frame::Text("99,1".to_owned()));
    assert!(matches!(
        recv(&mut events_b.invalid).await,
        Error::InvalidMessage(_)
    ));

    // A response for a call id that was never issued.
    b.emit_message(Frame::Text("3,5,0,1".to_owned()));
    assert!(matches!(
        recv(&mut events_b.invalid).await,
        Error::InvalidMessage(_)
    ));
}

#[tokio::test]
async fn inbound_streams_error_when_disabled() {
    let (a, _events_a, _b, mut events_b) = pair_with(
        Config::default(),
        Config {
            streams_enabled: false,
            ..Default::default()
        },
    );

    let stream = WriteStream::object();
    a.transmit("ch", Payload::Stream(stream), TransmitOptions::default())
        .unwrap();

    assert!(matches!(
        recv(&mut events_b.invalid).await,
        Error::InvalidMessage(_)
    ));
}

#[tokio::test]
async fn chunks_cannot_contain_streams_by_default() {
    let (a, _events_a, b, mut events_b) = pair_default();

    let stream = WriteStream::object();
    a.transmit(
        "ch",
        Payload::object([("s", Payload::Stream(stream.clone()))]),
        TransmitOptions::default(),
    )
    .unwrap();
    recv(&mut events_b.transmits).await;

    // Writer side refuses to encode a stream into a chunk.
    let err = stream
        .write(Payload::object([(
            "inner",
            Payload::Stream(WriteStream::object()),
        )]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAction(_)));

    // Receiver side rejects a crafted chunk with a stream placeholder.
    b.emit_message(Frame::Text(r#"7,1,4,{"_s":5}"#.to_owned()));
    assert!(matches!(
        recv(&mut events_b.invalid).await,
        Error::InvalidMessage(_)
    ));
}
