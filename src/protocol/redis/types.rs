use bytes::Bytes;

/// A RESP2 value as exchanged with clients and backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    NullBulk,
    Array(Vec<RespValue>),
    NullArray,
}

impl RespValue {
    pub fn simple<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::SimpleString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn error<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::Error(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn bulk<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::BulkString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Error payload, when this value is a RESP error frame.
    pub fn as_error(&self) -> Option<&Bytes> {
        match self {
            RespValue::Error(payload) => Some(payload),
            _ => None,
        }
    }
}
