use {
    bytes::Bytes,
    chrono::{DateTime, Utc},
    serde_json::Number,
    std::collections::BTreeMap,
};

/// Payload tree carried by action packets.
///
/// Generic over the live stream handle `S` so the same shape serves both
/// directions: outbound payloads embed write streams, decoded inbound
/// payloads embed read streams. Ownership of children makes the tree
/// acyclic by construction.
#[derive(Debug, Clone, PartialEq, derive_more::From)]
pub enum Value<S> {
    Null,
    #[from]
    Bool(bool),
    #[from]
    Num(Number),
    #[from]
    Str(String),
    #[from]
    Date(DateTime<Utc>),
    #[from]
    Blob(Bytes),
    Stream(S),
    #[from]
    Array(Vec<Value<S>>),
    #[from]
    Object(BTreeMap<String, Value<S>>),
}

impl<S> Value<S> {
    pub fn int(v: i64) -> Self {
        Self::Num(v.into())
    }

    pub fn float(v: f64) -> Self {
        Number::from_f64(v).map(Self::Num).unwrap_or(Self::Null)
    }

    pub fn str(v: impl Into<String>) -> Self {
        Self::Str(v.into())
    }

    pub fn bytes(v: impl Into<Bytes>) -> Self {
        Self::Blob(v.into())
    }

    pub fn stream(v: impl Into<S>) -> Self {
        Self::Stream(v.into())
    }

    pub fn array(items: impl IntoIterator<Item = Value<S>>) -> Self {
        Self::Array(items.into_iter().collect())
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value<S>)>) -> Self {
        Self::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<&Number> {
        match self {
            Self::Num(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_num().and_then(Number::as_i64)
    }

    pub fn as_blob(&self) -> Option<&Bytes> {
        match self {
            Self::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&S> {
        match self {
            Self::Stream(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value<S>]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value<S>>> {
        match self {
            Self::Object(v) => Some(v),
            _ => None,
        }
    }

    /// Member lookup on object values.
    pub fn get(&self, key: &str) -> Option<&Value<S>> {
        self.as_object().and_then(|map| map.get(key))
    }
}

impl<S> From<&str> for Value<S> {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl<S> From<i64> for Value<S> {
    fn from(v: i64) -> Self {
        Self::int(v)
    }
}

impl<S> From<u32> for Value<S> {
    fn from(v: u32) -> Self {
        Self::Num(v.into())
    }
}

impl<S> From<f64> for Value<S> {
    fn from(v: f64) -> Self {
        Self::float(v)
    }
}

impl<S> From<Vec<u8>> for Value<S> {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v.into())
    }
}

impl<S, T: Into<Value<S>>> From<Option<T>> for Value<S> {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}
