//! In-process pairing of two transports, used by the test suites.
//!
//! Each side's socket forwards frames over a channel; a pump task replays
//! them into the peer's [`Transport::emit_message`] serially, so delivery
//! order matches send order per direction.

use {
    crate::{BoxError, Config, Handler, Socket, Transport},
    std::sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    tokio::sync::mpsc,
    tokio_util::sync::{CancellationToken, DropGuard},
    wire::Frame,
};

struct LoopbackSocket {
    tx: mpsc::UnboundedSender<Frame>,
    low_backpressure: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<Frame>>>,
}

impl Socket for LoopbackSocket {
    fn send(&self, frame: Frame) -> Result<(), BoxError> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(frame.clone());

        self.tx.send(frame).map_err(|_| "peer is gone".into())
    }

    fn has_low_send_backpressure(&self) -> bool {
        self.low_backpressure.load(Ordering::SeqCst)
    }
}

/// One side of a loopback pair. Dropping it stops the pump feeding its
/// transport.
pub struct Peer {
    transport: Transport,
    low_backpressure: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<Frame>>>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl Peer {
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Every frame this side has pushed to its socket, in send order.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Flips the socket backpressure predicate; raising it low replays the
    /// blocked stream writers.
    pub fn set_low_send_backpressure(&self, low: bool) {
        self.low_backpressure.store(low, Ordering::SeqCst);

        if low {
            self.transport.emit_send_backpressure_drain();
        }
    }
}

impl std::ops::Deref for Peer {
    type Target = Transport;

    fn deref(&self) -> &Transport {
        &self.transport
    }
}

/// Wires two transports together and opens both connections.
pub fn pair<A, B>(config_a: Config, handler_a: A, config_b: Config, handler_b: B) -> (Peer, Peer)
where
    A: Handler,
    B: Handler,
{
    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();

    let a = build(config_a, handler_a, a_to_b_tx);
    let b = build(config_b, handler_b, b_to_a_tx);

    pump(a_to_b_rx, b.transport.clone(), b.token.clone());
    pump(b_to_a_rx, a.transport.clone(), a.token.clone());

    let _ = a.transport.emit_connection();
    let _ = b.transport.emit_connection();

    (a, b)
}

fn build<H: Handler>(config: Config, handler: H, tx: mpsc::UnboundedSender<Frame>) -> Peer {
    let low_backpressure = Arc::new(AtomicBool::new(true));
    let sent = Arc::new(Mutex::new(Vec::new()));

    let transport = Transport::builder()
        .socket(LoopbackSocket {
            tx,
            low_backpressure: low_backpressure.clone(),
            sent: sent.clone(),
        })
        .handler(handler)
        .response_timeout(config.response_timeout)
        .binary_content_packet_timeout(config.binary_content_packet_timeout)
        .streams_per_package_limit(config.streams_per_package_limit)
        .streams_enabled(config.streams_enabled)
        .chunks_can_contain_streams(config.chunks_can_contain_streams)
        .initial_stream_credit(config.initial_stream_credit)
        .build();

    let token = CancellationToken::new();

    Peer {
        transport,
        low_backpressure,
        sent,
        token: token.clone(),
        _guard: token.drop_guard(),
    }
}

fn pump(mut rx: mpsc::UnboundedReceiver<Frame>, target: Transport, token: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => target.emit_message(frame),
                    None => break,
                },
            }
        }
    });
}
