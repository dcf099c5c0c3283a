use {
    crate::{
        Error, Payload, Resolved,
        stream::{StreamKind, WriteStream},
        transport::Core,
    },
    bytes::Bytes,
    chrono::SecondsFormat,
    serde_json::{Map, Value as Json},
    std::{collections::BTreeMap, sync::Arc},
    wire::{
        DataType, Value,
        frame::{self, MAX_SUPPORTED_BINARY_SIZE},
        id_from_f64,
        mixed::{self, Placeholder},
    },
};

/// Everything produced by encoding one payload slot: the head fields, the
/// companion binary-content frame, and the streams the package initiates.
pub(crate) struct Encoded {
    pub data_type: DataType,
    pub data: Option<Json>,
    pub meta: Option<Json>,
    pub binary: Option<Bytes>,
    pub streams: Vec<WriteStream>,
}

impl Encoded {
    fn plain(data: Json) -> Self {
        Self {
            data_type: DataType::Json,
            data: Some(data),
            meta: None,
            binary: None,
            streams: Vec::new(),
        }
    }
}

/// Encodes a payload for a transmit, invoke, or response slot.
pub(crate) fn encode(
    core: &Arc<Core>,
    value: Payload,
    process_complex_types: bool,
) -> Result<Encoded, Error> {
    encode_inner(core, value, process_complex_types, core.config.streams_enabled)
}

/// Encodes a stream chunk payload; embedded streams additionally require
/// `chunks_can_contain_streams`.
pub(crate) fn encode_chunk(core: &Arc<Core>, value: Payload) -> Result<Encoded, Error> {
    let streams_allowed = core.config.streams_enabled && core.config.chunks_can_contain_streams;

    if !streams_allowed && contains_stream(&value) {
        return Err(Error::invalid_action("streams are not allowed in chunks"));
    }

    encode_inner(core, value, true, core.config.streams_enabled)
}

fn encode_inner(
    core: &Arc<Core>,
    value: Payload,
    process_complex_types: bool,
    streams_enabled: bool,
) -> Result<Encoded, Error> {
    if !process_complex_types {
        return Ok(Encoded::plain(plain_json(&value)?));
    }

    let value = match value {
        // A lone blob travels as a bare binary reference.
        Value::Blob(blob) => {
            let id = core.alloc_content_id();
            let binary = frame::binary_content(id, &[blob])?;

            return Ok(Encoded {
                data_type: DataType::Binary,
                data: Some(Json::from(id)),
                meta: None,
                binary: Some(binary),
                streams: Vec::new(),
            });
        }

        // A lone stream travels as a bare stream reference.
        Value::Stream(stream) if streams_enabled => {
            let id = register_write_stream(core, &stream)?;

            return Ok(Encoded {
                data_type: DataType::Stream,
                data: Some(Json::from(id)),
                meta: None,
                binary: None,
                streams: vec![stream],
            });
        }

        Value::Stream(_) => return Ok(Encoded::plain(Json::Null)),

        other => other,
    };

    if !contains_complex(&value) {
        return Ok(Encoded::plain(plain_json(&value)?));
    }

    let mut blobs = Vec::new();
    let mut streams = Vec::new();
    let tree = walk_encode(core, value, &mut blobs, &mut streams, streams_enabled)?;

    let (meta, binary) = if blobs.is_empty() {
        (None, None)
    } else {
        let id = core.alloc_content_id();
        (Some(Json::from(id)), Some(frame::binary_content(id, &blobs)?))
    };

    Ok(Encoded {
        data_type: DataType::mixed(!streams.is_empty(), !blobs.is_empty()),
        data: Some(tree),
        meta,
        binary,
        streams,
    })
}

fn walk_encode(
    core: &Arc<Core>,
    value: Payload,
    blobs: &mut Vec<Bytes>,
    streams: &mut Vec<WriteStream>,
    streams_enabled: bool,
) -> Result<Json, Error> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(value) => Json::Bool(value),
        Value::Num(value) => Json::Number(value),
        Value::Str(value) => Json::String(value),

        // Dates pass through as their rendered form.
        Value::Date(value) => Json::String(value.to_rfc3339_opts(SecondsFormat::Millis, true)),

        Value::Blob(blob) => {
            if blob.len() > MAX_SUPPORTED_BINARY_SIZE {
                return Err(Error::MaxSupportedBinarySizeExceeded);
            }

            let index = blobs.len();
            blobs.push(blob);
            mixed::blob_placeholder(index)
        }

        Value::Stream(stream) => {
            if !streams_enabled {
                Json::Null
            } else {
                let id = register_write_stream(core, &stream)?;
                streams.push(stream);
                mixed::stream_placeholder(id)
            }
        }

        Value::Array(items) => Json::Array(
            items
                .into_iter()
                .map(|item| walk_encode(core, item, blobs, streams, streams_enabled))
                .collect::<Result<_, _>>()?,
        ),

        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(
                    mixed::escape_key(&key).into_owned(),
                    walk_encode(core, value, blobs, streams, streams_enabled)?,
                );
            }
            Json::Object(out)
        }
    })
}

fn register_write_stream(core: &Arc<Core>, stream: &WriteStream) -> Result<i64, Error> {
    let (id, stamp) = core.alloc_stream_id(stream.kind());
    stream.bind(Arc::downgrade(core), id, stamp)?;
    core.insert_write_stream(id, stream.clone());
    Ok(id)
}

/// Serializes a payload that must stay pure JSON.
fn plain_json(value: &Payload) -> Result<Json, Error> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(value) => Json::Bool(*value),
        Value::Num(value) => Json::Number(value.clone()),
        Value::Str(value) => Json::String(value.clone()),
        Value::Date(value) => Json::String(value.to_rfc3339_opts(SecondsFormat::Millis, true)),

        Value::Blob(_) | Value::Stream(_) => {
            return Err(Error::invalid_action(
                "complex types are disabled for this package",
            ));
        }

        Value::Array(items) => Json::Array(items.iter().map(plain_json).collect::<Result<_, _>>()?),

        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(key.clone(), plain_json(value)?);
            }
            Json::Object(out)
        }
    })
}

pub(crate) fn contains_complex(value: &Payload) -> bool {
    match value {
        Value::Blob(_) | Value::Stream(_) => true,
        Value::Array(items) => items.iter().any(contains_complex),
        Value::Object(map) => map.values().any(contains_complex),
        _ => false,
    }
}

pub(crate) fn contains_stream(value: &Payload) -> bool {
    match value {
        Value::Stream(_) => true,
        Value::Array(items) => items.iter().any(contains_stream),
        Value::Object(map) => map.values().any(contains_stream),
        _ => false,
    }
}

/// Decodes one inbound payload slot. `binaries` carries the resolved
/// binary-content blobs when the data type references them.
pub(crate) fn decode(
    core: &Arc<Core>,
    data_type: DataType,
    data: Option<Json>,
    binaries: Option<&[Bytes]>,
    allow_streams: bool,
) -> Result<Resolved, Error> {
    match data_type {
        DataType::Json => Ok(json_to_value(data.unwrap_or(Json::Null))),

        DataType::Binary => binaries
            .and_then(<[Bytes]>::first)
            .cloned()
            .map(Value::Blob)
            .ok_or_else(|| Error::invalid_message("missing referenced blob")),

        DataType::Stream => {
            if !allow_streams {
                return Err(Error::invalid_message("streams are disabled"));
            }

            let id = data
                .as_ref()
                .and_then(Json::as_f64)
                .ok_or_else(|| Error::invalid_message("missing stream id"))
                .and_then(|raw| id_from_f64(raw).map_err(Error::from))?;

            Ok(Value::Stream(Core::create_read_stream(core, id)?))
        }

        DataType::JsonWithBinaries
        | DataType::JsonWithStreams
        | DataType::JsonWithStreamsAndBinaries => {
            let tree = data.unwrap_or(Json::Null);

            if count_stream_placeholders(&tree) > core.config.streams_per_package_limit {
                return Err(Error::invalid_message("too many streams in one package"));
            }

            walk_decode(core, tree, binaries, allow_streams)
        }
    }
}

fn walk_decode(
    core: &Arc<Core>,
    json: Json,
    binaries: Option<&[Bytes]>,
    allow_streams: bool,
) -> Result<Resolved, Error> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(value) => Value::Bool(value),
        Json::Number(value) => Value::Num(value),
        Json::String(value) => Value::Str(value),

        Json::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| walk_decode(core, item, binaries, allow_streams))
                .collect::<Result<_, _>>()?,
        ),

        Json::Object(map) => match mixed::as_placeholder(&map) {
            Some(Placeholder::Blob(index)) => binaries
                .and_then(|blobs| blobs.get(index))
                .cloned()
                .map(Value::Blob)
                .ok_or_else(|| Error::invalid_message("blob index out of range"))?,

            Some(Placeholder::Stream(id)) => {
                if !allow_streams {
                    return Err(Error::invalid_message("streams are disabled"));
                }

                Value::Stream(Core::create_read_stream(core, id)?)
            }

            None => {
                let mut out = BTreeMap::new();
                for (key, value) in map {
                    out.insert(
                        mixed::unescape_key(&key).to_owned(),
                        walk_decode(core, value, binaries, allow_streams)?,
                    );
                }
                Value::Object(out)
            }
        },
    })
}

/// Decodes a plain JSON tree: no placeholder interpretation, no key
/// unescaping.
fn json_to_value(json: Json) -> Resolved {
    match json {
        Json::Null => Value::Null,
        Json::Bool(value) => Value::Bool(value),
        Json::Number(value) => Value::Num(value),
        Json::String(value) => Value::Str(value),
        Json::Array(items) => Value::Array(items.into_iter().map(json_to_value).collect()),
        Json::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, json_to_value(value)))
                .collect(),
        ),
    }
}

fn count_stream_placeholders(json: &Json) -> usize {
    match json {
        Json::Array(items) => items.iter().map(count_stream_placeholders).sum(),
        Json::Object(map) => match mixed::as_placeholder(map) {
            Some(Placeholder::Stream(_)) => 1,
            Some(Placeholder::Blob(_)) => 0,
            None => map.values().map(count_stream_placeholders).sum(),
        },
        _ => 0,
    }
}

/// Encodes a payload with no transport attached: used by multi-transmit
/// packages, which draw binary-content ids from `next_content_id` and cannot
/// carry live streams.
pub(crate) fn encode_detached(
    value: Payload,
    next_content_id: impl FnOnce() -> i64,
) -> Result<(DataType, Option<Json>, Option<Json>, Option<Bytes>), Error> {
    if contains_stream(&value) {
        return Err(Error::invalid_action(
            "live streams cannot be part of a multi-transmit package",
        ));
    }

    if let Value::Blob(blob) = value {
        let id = next_content_id();
        let binary = frame::binary_content(id, &[blob])?;
        return Ok((DataType::Binary, Some(Json::from(id)), None, Some(binary)));
    }

    if !contains_complex(&value) {
        return Ok((DataType::Json, Some(plain_json(&value)?), None, None));
    }

    let mut blobs = Vec::new();
    let tree = walk_encode_detached(value, &mut blobs)?;
    let id = next_content_id();
    let binary = frame::binary_content(id, &blobs)?;

    Ok((
        DataType::JsonWithBinaries,
        Some(tree),
        Some(Json::from(id)),
        Some(binary),
    ))
}

fn walk_encode_detached(value: Payload, blobs: &mut Vec<Bytes>) -> Result<Json, Error> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(value) => Json::Bool(value),
        Value::Num(value) => Json::Number(value),
        Value::Str(value) => Json::String(value),
        Value::Date(value) => Json::String(value.to_rfc3339_opts(SecondsFormat::Millis, true)),

        Value::Blob(blob) => {
            if blob.len() > MAX_SUPPORTED_BINARY_SIZE {
                return Err(Error::MaxSupportedBinarySizeExceeded);
            }

            let index = blobs.len();
            blobs.push(blob);
            mixed::blob_placeholder(index)
        }

        // Checked before the walk starts.
        Value::Stream(_) => Json::Null,

        Value::Array(items) => Json::Array(
            items
                .into_iter()
                .map(|item| walk_encode_detached(item, blobs))
                .collect::<Result<_, _>>()?,
        ),

        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(
                    mixed::escape_key(&key).into_owned(),
                    walk_encode_detached(value, blobs)?,
                );
            }
            Json::Object(out)
        }
    })
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{Transport, loopback},
        chrono::{TimeZone, Utc},
        wire::frame::BinaryFrame,
    };

    struct NullSocket;

    impl crate::Socket for NullSocket {
        fn send(&self, _frame: wire::Frame) -> Result<(), crate::BoxError> {
            Ok(())
        }
    }

    fn core() -> Arc<Core> {
        Transport::new(NullSocket, ()).core_for_tests().clone()
    }

    fn blobs_of(binary: &Bytes) -> Vec<Bytes> {
        match wire::frame::classify(binary).unwrap() {
            BinaryFrame::BinaryContent { blobs, .. } => blobs,
            other => panic!("expected a binary content frame, got {other:?}"),
        }
    }

    #[test]
    fn plain_values_stay_plain() {
        let core = core();

        let encoded = encode(&core, Payload::object([("a", 1i64.into())]), true).unwrap();
        assert_eq!(encoded.data_type, DataType::Json);
        assert!(encoded.binary.is_none());
        assert!(encoded.streams.is_empty());

        let decoded = decode(&core, encoded.data_type, encoded.data, None, true).unwrap();
        assert_eq!(decoded, Resolved::object([("a", 1i64.into())]));
    }

    #[test]
    fn mixed_round_trip_preserves_adversarial_keys() {
        let core = core();
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let payload = Payload::object([
            ("_b", Payload::str("evil")),
            ("_s", Payload::int(9)),
            ("blob", Payload::bytes(vec![1, 2, 3])),
            ("stamp", Payload::Date(date)),
            ("list", Payload::array([Payload::Null, false.into()])),
        ]);

        let encoded = encode(&core, payload, true).unwrap();
        assert_eq!(encoded.data_type, DataType::JsonWithBinaries);
        assert!(encoded.meta.is_some());

        let blobs = blobs_of(encoded.binary.as_ref().unwrap());
        let decoded = decode(&core, encoded.data_type, encoded.data, Some(&blobs), true).unwrap();

        assert_eq!(
            decoded,
            Resolved::object([
                ("_b", Resolved::str("evil")),
                ("_s", Resolved::int(9)),
                ("blob", Resolved::bytes(vec![1, 2, 3])),
                ("stamp", Resolved::str("2024-05-01T12:00:00.000Z")),
                ("list", Resolved::array([Resolved::Null, false.into()])),
            ])
        );
    }

    #[test]
    fn lone_blob_uses_the_binary_data_type() {
        let core = core();

        let encoded = encode(&core, Payload::bytes(vec![7, 7]), true).unwrap();
        assert_eq!(encoded.data_type, DataType::Binary);

        let blobs = blobs_of(encoded.binary.as_ref().unwrap());
        let decoded = decode(&core, encoded.data_type, encoded.data, Some(&blobs), true).unwrap();
        assert_eq!(decoded, Resolved::bytes(vec![7, 7]));
    }

    #[test]
    fn complex_types_can_be_forbidden() {
        let core = core();

        assert!(matches!(
            encode(&core, Payload::bytes(vec![1]), false),
            Err(Error::InvalidAction(_))
        ));
    }

    #[test]
    fn stream_limit_bounds_the_decode() {
        let core = core();

        let tree = Json::Array((0..21).map(|id| mixed::stream_placeholder(id + 1)).collect());
        assert!(matches!(
            decode(&core, DataType::JsonWithStreams, Some(tree), None, true),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn disabled_streams_encode_to_null() {
        let (a, b) = loopback::pair(
            crate::Config {
                streams_enabled: false,
                ..Default::default()
            },
            (),
            crate::Config::default(),
            (),
        );
        drop(b);

        let encoded = encode(
            a.transport().core_for_tests(),
            Payload::object([("s", Payload::Stream(crate::WriteStream::object()))]),
            true,
        )
        .unwrap();

        assert_eq!(encoded.data_type, DataType::Json);
        assert_eq!(
            encoded.data,
            Some(serde_json::json!({ "s": null }))
        );
    }
}
