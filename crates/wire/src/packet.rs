use {
    crate::{Error, id_from_f64},
    serde_json::Value as Json,
    tap::Pipe as _,
};

/// Stable numeric tags of the protocol packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Bundle = 0,
    Transmit = 1,
    Invoke = 2,
    InvokeDataResp = 3,
    InvokeErrResp = 4,
    BinaryContent = 5,
    StreamAccept = 6,
    StreamChunk = 7,
    StreamEnd = 8,
    StreamDataPermission = 9,
    WriteStreamClose = 10,
    ReadStreamClose = 11,
}

impl TryFrom<u64> for PacketType {
    type Error = Error;

    fn try_from(raw: u64) -> Result<Self, Error> {
        Ok(match raw {
            0 => Self::Bundle,
            1 => Self::Transmit,
            2 => Self::Invoke,
            3 => Self::InvokeDataResp,
            4 => Self::InvokeErrResp,
            5 => Self::BinaryContent,
            6 => Self::StreamAccept,
            7 => Self::StreamChunk,
            8 => Self::StreamEnd,
            9 => Self::StreamDataPermission,
            10 => Self::WriteStreamClose,
            11 => Self::ReadStreamClose,
            other => return Err(Error::UnknownPacketType(other)),
        })
    }
}

/// How the `data` slot of an action packet is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Json = 0,
    /// The data slot holds a binary-content packet id.
    Binary = 1,
    /// The data slot holds a stream id.
    Stream = 2,
    JsonWithBinaries = 3,
    JsonWithStreams = 4,
    JsonWithStreamsAndBinaries = 5,
}

impl DataType {
    /// Whether payloads of this type reference an out-of-band binary-content
    /// frame.
    pub fn has_binaries(self) -> bool {
        matches!(
            self,
            Self::Binary | Self::JsonWithBinaries | Self::JsonWithStreamsAndBinaries
        )
    }

    /// Whether payloads of this type embed live streams.
    pub fn has_streams(self) -> bool {
        matches!(
            self,
            Self::Stream | Self::JsonWithStreams | Self::JsonWithStreamsAndBinaries
        )
    }

    /// Data type of a mixed JSON tree given what the encode walk collected.
    pub fn mixed(streams: bool, binaries: bool) -> Self {
        match (streams, binaries) {
            (true, true) => Self::JsonWithStreamsAndBinaries,
            (true, false) => Self::JsonWithStreams,
            (false, true) => Self::JsonWithBinaries,
            (false, false) => Self::Json,
        }
    }
}

impl TryFrom<u64> for DataType {
    type Error = Error;

    fn try_from(raw: u64) -> Result<Self, Error> {
        Ok(match raw {
            0 => Self::Json,
            1 => Self::Binary,
            2 => Self::Stream,
            3 => Self::JsonWithBinaries,
            4 => Self::JsonWithStreams,
            5 => Self::JsonWithStreamsAndBinaries,
            other => return Err(Error::UnknownDataType(other)),
        })
    }
}

/// A parsed non-bundle text packet.
///
/// Fields mirror the wire tuples; trailing `None`s are omitted on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Transmit {
        receiver: String,
        data_type: DataType,
        data: Option<Json>,
        meta: Option<Json>,
    },
    Invoke {
        procedure: String,
        call_id: u64,
        data_type: DataType,
        data: Option<Json>,
        meta: Option<Json>,
    },
    InvokeDataResp {
        call_id: u64,
        data_type: DataType,
        data: Option<Json>,
        meta: Option<Json>,
    },
    InvokeErrResp {
        call_id: u64,
        err: Json,
    },
    StreamAccept {
        stream_id: i64,
        credit: u64,
    },
    StreamChunk {
        stream_id: i64,
        data_type: DataType,
        data: Option<Json>,
        meta: Option<Json>,
    },
    StreamEnd {
        stream_id: i64,
        data_type: Option<DataType>,
        data: Option<Json>,
        meta: Option<Json>,
    },
    StreamDataPermission {
        stream_id: i64,
        credit: u64,
    },
    WriteStreamClose {
        stream_id: i64,
        code: u64,
    },
    ReadStreamClose {
        stream_id: i64,
        code: Option<u64>,
    },
}

impl Action {
    /// Serializes the action into its bracketless comma-joined wire head.
    pub fn head(&self) -> String {
        let mut fields = Vec::with_capacity(6);

        match self {
            Self::Transmit {
                receiver,
                data_type,
                data,
                meta,
            } => {
                fields.push(Json::from(PacketType::Transmit as u8));
                fields.push(Json::from(receiver.clone()));
                push_body(&mut fields, *data_type, data, meta);
            }

            Self::Invoke {
                procedure,
                call_id,
                data_type,
                data,
                meta,
            } => {
                fields.push(Json::from(PacketType::Invoke as u8));
                fields.push(Json::from(procedure.clone()));
                fields.push(Json::from(*call_id));
                push_body(&mut fields, *data_type, data, meta);
            }

            Self::InvokeDataResp {
                call_id,
                data_type,
                data,
                meta,
            } => {
                fields.push(Json::from(PacketType::InvokeDataResp as u8));
                fields.push(Json::from(*call_id));
                push_body(&mut fields, *data_type, data, meta);
            }

            Self::InvokeErrResp { call_id, err } => {
                fields.push(Json::from(PacketType::InvokeErrResp as u8));
                fields.push(Json::from(*call_id));
                fields.push(err.clone());
            }

            Self::StreamAccept { stream_id, credit } => {
                fields.push(Json::from(PacketType::StreamAccept as u8));
                fields.push(Json::from(*stream_id));
                fields.push(Json::from(*credit));
            }

            Self::StreamChunk {
                stream_id,
                data_type,
                data,
                meta,
            } => {
                fields.push(Json::from(PacketType::StreamChunk as u8));
                fields.push(Json::from(*stream_id));
                push_body(&mut fields, *data_type, data, meta);
            }

            Self::StreamEnd {
                stream_id,
                data_type,
                data,
                meta,
            } => {
                fields.push(Json::from(PacketType::StreamEnd as u8));
                fields.push(Json::from(*stream_id));
                if let Some(data_type) = data_type {
                    push_body(&mut fields, *data_type, data, meta);
                }
            }

            Self::StreamDataPermission { stream_id, credit } => {
                fields.push(Json::from(PacketType::StreamDataPermission as u8));
                fields.push(Json::from(*stream_id));
                fields.push(Json::from(*credit));
            }

            Self::WriteStreamClose { stream_id, code } => {
                fields.push(Json::from(PacketType::WriteStreamClose as u8));
                fields.push(Json::from(*stream_id));
                fields.push(Json::from(*code));
            }

            Self::ReadStreamClose { stream_id, code } => {
                fields.push(Json::from(PacketType::ReadStreamClose as u8));
                fields.push(Json::from(*stream_id));
                if let Some(code) = code {
                    fields.push(Json::from(*code));
                }
            }
        }

        head_of(fields)
    }
}

fn push_body(fields: &mut Vec<Json>, data_type: DataType, data: &Option<Json>, meta: &Option<Json>) {
    fields.push(Json::from(data_type as u8));

    if meta.is_some() {
        fields.push(data.clone().unwrap_or(Json::Null));
        fields.push(meta.clone().unwrap_or(Json::Null));
    } else if let Some(data) = data {
        fields.push(data.clone());
    }
}

/// Renders a field list as the bracketless head form sent on the wire.
pub fn head_of(fields: Vec<Json>) -> String {
    let rendered = Json::Array(fields).to_string();
    rendered[1..rendered.len() - 1].to_owned()
}

/// Builds a bundle head out of already rendered action heads.
pub fn bundle_head(heads: &[String]) -> String {
    let inner = heads
        .iter()
        .map(|head| format!("[{head}]"))
        .collect::<Vec<_>>()
        .join(",");

    format!("{},[{inner}]", PacketType::Bundle as u8)
}

/// Parses a raw text frame into its action packets, flattening bundles in
/// index order.
pub fn parse_text(raw: &str) -> Result<Vec<Action>, Error> {
    let fields: Vec<Json> = serde_json::from_str(&format!("[{raw}]"))?;
    let packet_type = field_u64(&fields, 0)?.pipe(PacketType::try_from)?;

    if packet_type != PacketType::Bundle {
        return Ok(vec![parse_action(packet_type, &fields)?]);
    }

    let actions = fields
        .get(1)
        .and_then(Json::as_array)
        .ok_or_else(|| Error::malformed_packet("bundle without action list"))?;

    actions
        .iter()
        .map(|action| {
            let fields = action
                .as_array()
                .ok_or_else(|| Error::malformed_packet("bundle action is not a tuple"))?;
            let packet_type = field_u64(fields, 0)?.pipe(PacketType::try_from)?;

            if packet_type == PacketType::Bundle {
                return Err(Error::malformed_packet("nested bundle"));
            }

            parse_action(packet_type, fields)
        })
        .collect()
}

fn parse_action(packet_type: PacketType, fields: &[Json]) -> Result<Action, Error> {
    Ok(match packet_type {
        PacketType::Bundle | PacketType::BinaryContent => {
            return Err(Error::malformed_packet(format!(
                "{packet_type:?} is not a text action packet"
            )));
        }

        PacketType::Transmit => Action::Transmit {
            receiver: field_str(fields, 1)?,
            data_type: field_u64(fields, 2)?.pipe(DataType::try_from)?,
            data: fields.get(3).cloned(),
            meta: fields.get(4).cloned(),
        },

        PacketType::Invoke => Action::Invoke {
            procedure: field_str(fields, 1)?,
            call_id: field_u64(fields, 2)?,
            data_type: field_u64(fields, 3)?.pipe(DataType::try_from)?,
            data: fields.get(4).cloned(),
            meta: fields.get(5).cloned(),
        },

        PacketType::InvokeDataResp => Action::InvokeDataResp {
            call_id: field_u64(fields, 1)?,
            data_type: field_u64(fields, 2)?.pipe(DataType::try_from)?,
            data: fields.get(3).cloned(),
            meta: fields.get(4).cloned(),
        },

        PacketType::InvokeErrResp => Action::InvokeErrResp {
            call_id: field_u64(fields, 1)?,
            err: fields
                .get(2)
                .cloned()
                .ok_or_else(|| Error::malformed_packet("error response without error"))?,
        },

        PacketType::StreamAccept => Action::StreamAccept {
            stream_id: field_id(fields, 1)?,
            credit: field_u64(fields, 2)?,
        },

        PacketType::StreamChunk => Action::StreamChunk {
            stream_id: field_id(fields, 1)?,
            data_type: field_u64(fields, 2)?.pipe(DataType::try_from)?,
            data: fields.get(3).cloned(),
            meta: fields.get(4).cloned(),
        },

        PacketType::StreamEnd => Action::StreamEnd {
            stream_id: field_id(fields, 1)?,
            data_type: match fields.get(2) {
                Some(raw) => Some(
                    raw.as_u64()
                        .ok_or_else(|| Error::malformed_packet("non-numeric data type"))?
                        .pipe(DataType::try_from)?,
                ),
                None => None,
            },
            data: fields.get(3).cloned(),
            meta: fields.get(4).cloned(),
        },

        PacketType::StreamDataPermission => Action::StreamDataPermission {
            stream_id: field_id(fields, 1)?,
            credit: field_u64(fields, 2)?,
        },

        PacketType::WriteStreamClose => Action::WriteStreamClose {
            stream_id: field_id(fields, 1)?,
            code: field_u64(fields, 2)?,
        },

        PacketType::ReadStreamClose => Action::ReadStreamClose {
            stream_id: field_id(fields, 1)?,
            code: match fields.get(2) {
                Some(raw) => Some(
                    raw.as_u64()
                        .ok_or_else(|| Error::malformed_packet("non-numeric close code"))?,
                ),
                None => None,
            },
        },
    })
}

fn field_u64(fields: &[Json], index: usize) -> Result<u64, Error> {
    fields
        .get(index)
        .and_then(Json::as_u64)
        .ok_or_else(|| Error::malformed_packet(format!("missing numeric field {index}")))
}

fn field_id(fields: &[Json], index: usize) -> Result<i64, Error> {
    fields
        .get(index)
        .and_then(Json::as_f64)
        .ok_or_else(|| Error::malformed_packet(format!("missing id field {index}")))
        .and_then(id_from_f64)
}

fn field_str(fields: &[Json], index: usize) -> Result<String, Error> {
    fields
        .get(index)
        .and_then(Json::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::malformed_packet(format!("missing string field {index}")))
}

#[cfg(test)]
mod test {
    use {super::*, serde_json::json};

    #[test]
    fn head_round_trip() {
        let action = Action::Invoke {
            procedure: "add".to_owned(),
            call_id: 7,
            data_type: DataType::Json,
            data: Some(json!({"a": 1, "b": 2})),
            meta: None,
        };

        let head = action.head();
        assert_eq!(head, r#"2,"add",7,0,{"a":1,"b":2}"#);
        assert_eq!(parse_text(&head).unwrap(), vec![action]);
    }

    #[test]
    fn trailing_fields_are_omitted() {
        let head = Action::Transmit {
            receiver: "ch".to_owned(),
            data_type: DataType::Json,
            data: None,
            meta: None,
        }
        .head();

        assert_eq!(head, r#"1,"ch",0"#);
    }

    #[test]
    fn meta_forces_the_data_slot() {
        let head = Action::Transmit {
            receiver: "ch".to_owned(),
            data_type: DataType::JsonWithBinaries,
            data: None,
            meta: Some(json!(4)),
        }
        .head();

        assert_eq!(head, r#"1,"ch",3,null,4"#);
    }

    #[test]
    fn bundles_flatten_in_order() {
        let first = Action::Transmit {
            receiver: "a".to_owned(),
            data_type: DataType::Json,
            data: Some(json!(1)),
            meta: None,
        };
        let second = Action::ReadStreamClose {
            stream_id: -3,
            code: None,
        };

        let head = bundle_head(&[first.head(), second.head()]);
        assert_eq!(parse_text(&head).unwrap(), vec![first, second]);
    }

    #[test]
    fn rejects_unknown_packet_types() {
        assert!(matches!(
            parse_text("99,1"),
            Err(Error::UnknownPacketType(99))
        ));
    }

    #[test]
    fn rejects_nested_bundles() {
        assert!(matches!(
            parse_text("0,[[0,[]]]"),
            Err(Error::MalformedPacket(_))
        ));
    }
}
