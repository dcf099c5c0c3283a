use {
    crate::{BatchOptions, Error, Package, Payload, Transport, codec},
    bytes::Bytes,
    std::sync::atomic::{AtomicI64, Ordering},
    wire::{MIN_SAFE_INTEGER, packet::Action},
};

/// Binary-content ids of multi-transmit packages come from their own
/// process-wide negative space, so a prepared package can be broadcast to any
/// number of peers without touching per-connection counters.
static MULTI_CONTENT_ID: AtomicI64 = AtomicI64::new(-1);

fn alloc_multi_content_id() -> i64 {
    MULTI_CONTENT_ID
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
            Some(if id <= MIN_SAFE_INTEGER { -1 } else { id - 1 })
        })
        .unwrap_or(-1)
}

/// A transmit package prepared once and reusable across many transports.
#[derive(Debug, Clone)]
pub struct MultiPackage {
    head: String,
    binary: Option<Bytes>,
}

/// Prepares a transmit for broadcast. Binaries are permitted; live streams
/// are not, they are coupled to a single connection.
pub fn prepare_multi_transmit(receiver: &str, data: Payload) -> Result<MultiPackage, Error> {
    let (data_type, data, meta, binary) = codec::encode_detached(data, alloc_multi_content_id)?;

    let head = Action::Transmit {
        receiver: receiver.to_owned(),
        data_type,
        data,
        meta,
    }
    .head();

    Ok(MultiPackage { head, binary })
}

impl Transport {
    /// Sends a prepared multi-transmit package over this connection.
    pub fn send_multi_package(
        &self,
        package: &MultiPackage,
        batch: Option<BatchOptions>,
    ) -> Result<(), Error> {
        self.send_package(
            Package::new(package.head.clone(), package.binary.clone(), Vec::new()),
            batch,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_stay_negative_and_distinct() {
        let first = alloc_multi_content_id();
        let second = alloc_multi_content_id();

        assert!(first < 0);
        assert!(second < first);
    }

    #[test]
    fn streams_are_rejected() {
        let payload = Payload::object([("s", Payload::Stream(crate::WriteStream::object()))]);

        assert!(matches!(
            prepare_multi_transmit("ch", payload),
            Err(Error::InvalidAction(_))
        ));
    }
}
