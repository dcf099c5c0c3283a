use {
    crate::id_from_f64,
    serde_json::{Map, Value as Json, json},
    std::borrow::Cow,
};

/// Marker key referencing a blob by its index within the companion
/// binary-content frame.
pub const BLOB_KEY: &str = "_b";

/// Marker key referencing a live stream by id.
pub const STREAM_KEY: &str = "_s";

/// A placeholder object found inside a mixed JSON tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Blob(usize),
    Stream(i64),
}

pub fn blob_placeholder(index: usize) -> Json {
    json!({ BLOB_KEY: index })
}

pub fn stream_placeholder(stream_id: i64) -> Json {
    json!({ STREAM_KEY: stream_id })
}

/// Returns the placeholder carried by `obj`, if it is one.
///
/// Detection requires the lone marker key and a numeric value; anything else
/// is an ordinary object.
pub fn as_placeholder(obj: &Map<String, Json>) -> Option<Placeholder> {
    if obj.len() != 1 {
        return None;
    }

    if let Some(index) = obj.get(BLOB_KEY).and_then(Json::as_u64) {
        return Some(Placeholder::Blob(index as usize));
    }

    obj.get(STREAM_KEY)
        .and_then(Json::as_f64)
        .and_then(|raw| id_from_f64(raw).ok())
        .map(Placeholder::Stream)
}

/// Escapes a user-supplied object key so it can never read as a marker key.
///
/// Keys beginning with `_` gain one extra leading `_`; [`unescape_key`]
/// strips it back off.
pub fn escape_key(key: &str) -> Cow<'_, str> {
    if key.starts_with('_') {
        Cow::Owned(format!("_{key}"))
    } else {
        Cow::Borrowed(key)
    }
}

pub fn unescape_key(key: &str) -> &str {
    key.strip_prefix('_').unwrap_or(key)
}
