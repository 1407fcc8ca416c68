//! Framed message model.
//!
//! A frame carries a short ASCII type tag, a sequence number, a transaction
//! id correlating responses to requests (0 means unsolicited), and an ordered
//! list of keyed values. A keyed value is a short ASCII key plus an opaque
//! byte payload; the encoding of the payload is fixed by the key.
//!
//! Scalar payloads are big-endian. String payloads are UTF-8 without
//! terminator. String lists are a `u32` count followed by `u16`-length-
//! prefixed UTF-8 items.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Resync sentinel at the start of every frame.
pub const FRAME_MAGIC: u32 = 0xDECA_FBAD;

/// Practical cap on the frame type tag.
pub const MAX_TYPE_LEN: usize = 64;
/// Practical cap on a keyed-value key.
pub const MAX_KEY_LEN: usize = 64;
/// Practical cap on the frame body (everything after the length word).
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Frame type tags used by the capture worker protocol.
pub mod msg {
    pub const HELLO: &str = "HELLO";
    pub const PROBE: &str = "PROBE";
    pub const PROBERESP: &str = "PROBERESP";
    pub const OPEN: &str = "OPEN";
    pub const OPENRESP: &str = "OPENRESP";
    pub const LIST: &str = "LIST";
    pub const LISTRESP: &str = "LISTRESP";
    pub const DATA: &str = "DATA";
    pub const MESSAGE: &str = "MESSAGE";
    pub const ERROR: &str = "ERROR";
    pub const CONFIG: &str = "CONFIG";
}

/// Keyed-value keys with a fixed payload interpretation.
pub mod key {
    /// Protocol version announced by the worker in `HELLO`.
    pub const VERSION: &str = "KISMET";
    /// Worker capture-engine name announced in `HELLO`.
    pub const CAPNAME: &str = "CAPNAME";
    pub const DEFINITION: &str = "DEFINITION";
    /// `u8`: 1 on success, 0 on failure.
    pub const SUCCESS: &str = "SUCCESS";
    pub const MESSAGE: &str = "MESSAGE";
    /// `u8` severity for `MESSAGE` frames.
    pub const LEVEL: &str = "LEVEL";
    pub const UUID: &str = "UUID";
    /// String list of channels the interface supports.
    pub const CHANSET: &str = "CHANSET";
    /// String list of channels to hop across.
    pub const CHANHOP: &str = "CHANHOP";
    /// Single channel to lock to.
    pub const CHANNEL: &str = "CHANNEL";
    /// String list of interface names from `LISTRESP`.
    pub const INTERFACES: &str = "INTERFACES";
    /// Raw captured packet bytes.
    pub const PACKET: &str = "PACKET";
    /// `i32` signal level in dBm.
    pub const SIGNAL: &str = "SIGNAL";
    /// Opaque GPS blob, forwarded untouched.
    pub const GPS: &str = "GPS";
    /// `u32` data link type of the packet payload.
    pub const DLT: &str = "DLT";
    /// `u64` capture timestamp, nanoseconds since the epoch.
    pub const TS: &str = "TS";
}

/// Errors extracting a typed value out of a keyed-value payload.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KvError {
    #[error("key '{0}' not present")]
    Missing(String),
    #[error("key '{key}' payload is {got} bytes, expected {want}")]
    WrongWidth {
        key: String,
        want: usize,
        got: usize,
    },
    #[error("key '{0}' payload is not valid UTF-8")]
    NotUtf8(String),
    #[error("key '{0}' list payload is truncated")]
    TruncatedList(String),
}

/// One keyed value inside a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyedValue {
    pub key: String,
    pub value: Bytes,
}

impl KeyedValue {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A wire-level message.
///
/// `seqno` is assigned by the sending endpoint when left at 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: String,
    pub seqno: u32,
    pub transaction_id: u32,
    pub kvs: Vec<KeyedValue>,
}

impl Frame {
    pub fn new(frame_type: impl Into<String>) -> Self {
        Self {
            frame_type: frame_type.into(),
            seqno: 0,
            transaction_id: 0,
            kvs: Vec::new(),
        }
    }

    pub fn with_transaction(mut self, transaction_id: u32) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    pub fn push_kv(mut self, key: &str, value: impl Into<Bytes>) -> Self {
        self.kvs.push(KeyedValue::new(key, value));
        self
    }

    pub fn push_str(self, key: &str, value: &str) -> Self {
        self.push_kv(key, Bytes::copy_from_slice(value.as_bytes()))
    }

    pub fn push_u8(self, key: &str, value: u8) -> Self {
        self.push_kv(key, Bytes::copy_from_slice(&[value]))
    }

    pub fn push_u32(self, key: &str, value: u32) -> Self {
        self.push_kv(key, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn push_u64(self, key: &str, value: u64) -> Self {
        self.push_kv(key, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn push_i32(self, key: &str, value: i32) -> Self {
        self.push_kv(key, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn push_str_list<S: AsRef<str>>(self, key: &str, items: &[S]) -> Self {
        let mut buf = BytesMut::new();
        buf.put_u32(items.len() as u32);
        for item in items {
            let b = item.as_ref().as_bytes();
            buf.put_u16(b.len() as u16);
            buf.put_slice(b);
        }
        self.push_kv(key, buf.freeze())
    }

    /// First keyed value for `key`, if present.
    pub fn kv(&self, key: &str) -> Option<&KeyedValue> {
        self.kvs.iter().find(|kv| kv.key == key)
    }

    pub fn has_kv(&self, key: &str) -> bool {
        self.kv(key).is_some()
    }

    pub fn kv_bytes(&self, key: &str) -> Result<&Bytes, KvError> {
        self.kv(key)
            .map(|kv| &kv.value)
            .ok_or_else(|| KvError::Missing(key.into()))
    }

    pub fn kv_u8(&self, key: &str) -> Result<u8, KvError> {
        let v = self.kv_bytes(key)?;
        if v.len() != 1 {
            return Err(KvError::WrongWidth {
                key: key.into(),
                want: 1,
                got: v.len(),
            });
        }
        Ok(v[0])
    }

    pub fn kv_u32(&self, key: &str) -> Result<u32, KvError> {
        let v = self.kv_bytes(key)?;
        let arr: [u8; 4] = v.as_ref().try_into().map_err(|_| KvError::WrongWidth {
            key: key.into(),
            want: 4,
            got: v.len(),
        })?;
        Ok(u32::from_be_bytes(arr))
    }

    pub fn kv_u64(&self, key: &str) -> Result<u64, KvError> {
        let v = self.kv_bytes(key)?;
        let arr: [u8; 8] = v.as_ref().try_into().map_err(|_| KvError::WrongWidth {
            key: key.into(),
            want: 8,
            got: v.len(),
        })?;
        Ok(u64::from_be_bytes(arr))
    }

    pub fn kv_i32(&self, key: &str) -> Result<i32, KvError> {
        let v = self.kv_bytes(key)?;
        let arr: [u8; 4] = v.as_ref().try_into().map_err(|_| KvError::WrongWidth {
            key: key.into(),
            want: 4,
            got: v.len(),
        })?;
        Ok(i32::from_be_bytes(arr))
    }

    pub fn kv_str(&self, key: &str) -> Result<&str, KvError> {
        let v = self.kv_bytes(key)?;
        std::str::from_utf8(v).map_err(|_| KvError::NotUtf8(key.into()))
    }

    pub fn kv_str_list(&self, key: &str) -> Result<Vec<String>, KvError> {
        fn take<'a>(
            v: &'a [u8],
            pos: &mut usize,
            n: usize,
            key: &str,
        ) -> Result<&'a [u8], KvError> {
            if v.len() - *pos < n {
                return Err(KvError::TruncatedList(key.into()));
            }
            let s = &v[*pos..*pos + n];
            *pos += n;
            Ok(s)
        }

        let v = self.kv_bytes(key)?;
        let mut pos = 0usize;
        let count = u32::from_be_bytes(take(v, &mut pos, 4, key)?.try_into().unwrap());
        let mut items = Vec::new();
        for _ in 0..count {
            let len = u16::from_be_bytes(take(v, &mut pos, 2, key)?.try_into().unwrap()) as usize;
            let raw = take(v, &mut pos, len, key)?;
            let s = std::str::from_utf8(raw).map_err(|_| KvError::NotUtf8(key.into()))?;
            items.push(s.to_string());
        }
        Ok(items)
    }
}
