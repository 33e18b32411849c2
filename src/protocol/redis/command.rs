use std::collections::HashSet;
use std::fmt;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use once_cell::sync::Lazy;

use super::types::RespValue;

pub const SLOT_COUNT: u16 = 16384;

/// A parsed client command: a non-empty argv of byte strings.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisCommand {
    parts: Vec<Bytes>,
}

impl fmt::Debug for RedisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCommand")
            .field(
                "parts",
                &self
                    .parts
                    .iter()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl RedisCommand {
    pub fn new(parts: Vec<Bytes>) -> Result<Self> {
        if parts.is_empty() {
            bail!("redis command must contain at least one element");
        }
        Ok(Self { parts })
    }

    pub fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Array(values) => {
                let mut parts = Vec::with_capacity(values.len());
                for value in values {
                    match value {
                        RespValue::BulkString(data) | RespValue::SimpleString(data) => {
                            parts.push(data)
                        }
                        RespValue::Integer(int) => {
                            parts.push(Bytes::copy_from_slice(int.to_string().as_bytes()))
                        }
                        RespValue::NullBulk | RespValue::NullArray => {
                            bail!("command argument cannot be null");
                        }
                        RespValue::Error(err) => {
                            bail!(
                                "client sent RESP error frame as command argument: {}",
                                String::from_utf8_lossy(&err)
                            );
                        }
                        RespValue::Array(_) => {
                            bail!("nested array arguments are not supported");
                        }
                    }
                }
                Self::new(parts)
            }
            other => Err(anyhow!(
                "redis command must be an array frame, received {:?}",
                other
            )),
        }
    }

    /// Canonical multi-bulk encoding, suitable for sending to a backend.
    pub fn to_resp(&self) -> RespValue {
        RespValue::Array(
            self.parts
                .iter()
                .cloned()
                .map(RespValue::BulkString)
                .collect(),
        )
    }

    pub fn command_name(&self) -> &[u8] {
        self.parts.first().map(|b| b.as_ref()).unwrap_or(&[])
    }

    /// Command name folded to upper case, for classification.
    pub fn upper_name(&self) -> Vec<u8> {
        self.command_name()
            .iter()
            .map(|b| b.to_ascii_uppercase())
            .collect()
    }

    pub fn args(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn primary_key(&self) -> Option<&[u8]> {
        self.parts.get(1).map(|b| b.as_ref())
    }

    /// Number of keys named by a multi-key command, when this is one.
    ///
    /// An `MSET` with a dangling value (even argv length) does not qualify
    /// and falls through to ordinary single-key dispatch, where the backend
    /// reports the arity error.
    pub fn multi_op_keys(&self) -> Option<usize> {
        let name = self.upper_name();
        match name.as_slice() {
            b"MGET" | b"DEL" | b"UNLINK" | b"EXISTS" if self.parts.len() > 1 => {
                Some(self.parts.len() - 1)
            }
            b"MSET" if self.parts.len() >= 3 && self.parts.len() % 2 == 1 => {
                Some((self.parts.len() - 1) / 2)
            }
            _ => None,
        }
    }
}

impl fmt::Display for RedisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .parts
            .iter()
            .map(|p| String::from_utf8_lossy(p).to_string())
            .collect();
        write!(f, "{}", args.join(" "))
    }
}

/// Commands a slot-routing proxy cannot serve: pubsub needs a long-lived
/// subscriber connection, transactions and scans span slots, and the admin
/// surface belongs to the nodes themselves.
static DEFAULT_BLACKLIST: Lazy<HashSet<Vec<u8>>> = Lazy::new(|| {
    [
        "KEYS", "SCAN", "RANDOMKEY", "MOVE", "RENAME", "RENAMENX", "MIGRATE", "BITOP", "MSETNX",
        "SUBSCRIBE", "UNSUBSCRIBE", "PSUBSCRIBE", "PUNSUBSCRIBE", "PUBLISH", "PUBSUB", "MULTI",
        "EXEC", "DISCARD", "WATCH", "UNWATCH", "SELECT", "CLUSTER", "CONFIG", "SHUTDOWN", "SLAVEOF",
        "REPLICAOF", "DEBUG", "SCRIPT", "WAIT",
    ]
    .iter()
    .map(|name| name.as_bytes().to_vec())
    .collect()
});

/// The deny-set consulted by the session before dispatch. Which names are
/// rejected is policy decided outside the session core; this type is the
/// interface the session consumes.
#[derive(Debug, Clone)]
pub struct Blacklist {
    names: HashSet<Vec<u8>>,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self {
            names: DEFAULT_BLACKLIST.clone(),
        }
    }
}

impl Blacklist {
    /// Default deny-set extended with additional command names.
    pub fn with_extensions<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut blacklist = Self::default();
        for name in extra {
            blacklist
                .names
                .insert(name.as_ref().to_ascii_uppercase().into_bytes());
        }
        blacklist
    }

    /// `name` must already be upper case, as produced by
    /// [`RedisCommand::upper_name`].
    pub fn is_blacklisted(&self, name: &[u8]) -> bool {
        self.names.contains(name)
    }
}
