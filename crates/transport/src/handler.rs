use {
    crate::{Error, Payload, Resolved, transport::Core},
    std::sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

/// Embeddable listener for transport events.
///
/// Errors raised while servicing a hook never propagate into inbound
/// processing; they surface through [`Handler::on_listener_error`].
pub trait Handler: Send + Sync + 'static {
    /// Called for every inbound fire-and-forget transmit.
    fn on_transmit(&self, _receiver: &str, _data: Resolved) {}

    /// Called for every inbound invocation. Dropping the request without
    /// responding leaves the peer to its response timeout.
    fn on_invoke(&self, _invoke: InvokeRequest) {}

    fn on_ping(&self) {}

    fn on_pong(&self) {}

    /// Called when an inbound frame could not be processed.
    fn on_invalid_message(&self, _err: Error) {}

    /// Called when a listener misused the API, e.g. responded twice.
    fn on_listener_error(&self, _err: Error) {}
}

impl Handler for () {}

/// An inbound invocation delivered to [`Handler::on_invoke`].
pub struct InvokeRequest {
    procedure: String,
    data: Resolved,
    responder: Responder,
}

impl InvokeRequest {
    pub(crate) fn new(procedure: String, data: Resolved, responder: Responder) -> Self {
        Self {
            procedure,
            data,
            responder,
        }
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn data(&self) -> &Resolved {
        &self.data
    }

    pub fn into_parts(self) -> (String, Resolved, Responder) {
        (self.procedure, self.data, self.responder)
    }

    pub fn responder(&self) -> Responder {
        self.responder.clone()
    }
}

impl std::fmt::Debug for InvokeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeRequest")
            .field("procedure", &self.procedure)
            .finish_non_exhaustive()
    }
}

/// Single-shot reply channel for an inbound invocation.
///
/// Both callbacks are no-ops once the connection that delivered the
/// invocation is gone; a second call is a programmer error reported through
/// [`Handler::on_listener_error`].
#[derive(Clone)]
pub struct Responder {
    core: Weak<Core>,
    call_id: u64,
    stamp: u64,
    used: Arc<AtomicBool>,
}

impl Responder {
    pub(crate) fn new(core: Weak<Core>, call_id: u64, stamp: u64) -> Self {
        Self {
            core,
            call_id,
            stamp,
            used: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sends the success response. The payload may embed blobs and streams.
    pub fn send_data(&self, data: Payload) {
        let Some(core) = self.arm() else { return };

        if let Err(err) = Core::respond_data(&core, self.call_id, data) {
            core.handler.on_listener_error(err);
        }
    }

    /// Sends the error response, dehydrated as `{name, message}`.
    pub fn send_err(&self, name: &str, message: &str) {
        let Some(core) = self.arm() else { return };

        if let Err(err) = core.respond_err(self.call_id, name, message) {
            core.handler.on_listener_error(err);
        }
    }

    /// Fences against stale connections and enforces the single shot.
    fn arm(&self) -> Option<Arc<Core>> {
        let core = self.core.upgrade()?;

        if core.stamp() != self.stamp {
            return None;
        }

        if self.used.swap(true, Ordering::SeqCst) {
            core.handler
                .on_listener_error(Error::invalid_action("invoke response already sent"));
            return None;
        }

        Some(core)
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}
