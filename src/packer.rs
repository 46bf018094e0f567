//! Msgpack codec with an extension-type translation table.
//!
//! Payloads are self-describing [`Value`] trees. Extension types bind a
//! small integer code to an encoder/decoder pair; the default table ships
//! datetime and date handlers that preserve the original timezone offset.
//! Unknown extension codes decode to an opaque [`Value::Ext`] so foreign
//! data survives a round trip untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate};
use thiserror::Error;

/// Extension code for timezone-aware datetimes.
pub const DATETIME_EXT_CODE: i8 = 125;
/// Extension code for calendar dates.
pub const DATE_EXT_CODE: i8 = 126;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A self-describing payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer outside the signed range.
    UInt(u64),
    /// Double-precision float.
    F64(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bin(Vec<u8>),
    /// Ordered sequence.
    Array(Vec<Value>),
    /// Key/value pairs in insertion order.
    Map(Vec<(Value, Value)>),
    /// Timezone-aware datetime, carried as an extension type.
    Time(DateTime<FixedOffset>),
    /// Calendar date, carried as an extension type.
    Date(NaiveDate),
    /// Extension payload with no registered handler.
    Ext {
        /// Extension type code.
        code: i8,
        /// Opaque encoded bytes.
        data: Vec<u8>,
    },
}

impl Value {
    /// Borrow the string contents, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The signed integer contents, if representable.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// The boolean contents, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow the element sequence, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the raw bytes, if this is a binary value.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bin(b) => Some(b),
            _ => None,
        }
    }

    /// The datetime contents, if this is a time value.
    #[must_use]
    pub fn as_time(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        i64::try_from(v).map_or(Self::UInt(v), Self::Int)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bin(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Self::Time(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

/// Errors raised while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No handler in the translation table covers the value.
    #[error("no encoder for {0}")]
    UnknownType(String),
    /// The extension code is already bound.
    #[error("extension code {0} already registered")]
    DuplicateExtension(i8),
    /// Serialization failure from the msgpack writer.
    #[error("encode failed: {0}")]
    Encode(String),
    /// Deserialization failure from the msgpack reader.
    #[error("decode failed: {0}")]
    Decode(String),
    /// Payload decoded fine but did not have the expected shape.
    #[error("unexpected payload shape: expected {0}")]
    Shape(&'static str),
}

/// Encoder/decoder pair for one extension code.
pub trait ExtensionHandler: Send + Sync {
    /// Encode the value if this handler covers it, `None` otherwise.
    fn encode(&self, value: &Value) -> Option<Vec<u8>>;

    /// Decode extension bytes back into a value.
    ///
    /// # Errors
    /// Returns a [`CodecError`] when the bytes are not in the handler's
    /// format.
    fn decode(&self, data: &[u8]) -> Result<Value, CodecError>;
}

struct DatetimeHandler;

impl ExtensionHandler for DatetimeHandler {
    fn encode(&self, value: &Value) -> Option<Vec<u8>> {
        match value {
            Value::Time(t) => Some(t.to_rfc3339().into_bytes()),
            _ => None,
        }
    }

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| CodecError::Decode(format!("datetime is not utf-8: {e}")))?;
        let parsed = DateTime::parse_from_rfc3339(text)
            .map_err(|e| CodecError::Decode(format!("bad datetime {text:?}: {e}")))?;
        Ok(Value::Time(parsed))
    }
}

struct DateHandler;

impl ExtensionHandler for DateHandler {
    fn encode(&self, value: &Value) -> Option<Vec<u8>> {
        match value {
            Value::Date(d) => Some(d.format(DATE_FORMAT).to_string().into_bytes()),
            _ => None,
        }
    }

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| CodecError::Decode(format!("date is not utf-8: {e}")))?;
        let parsed = NaiveDate::parse_from_str(text, DATE_FORMAT)
            .map_err(|e| CodecError::Decode(format!("bad date {text:?}: {e}")))?;
        Ok(Value::Date(parsed))
    }
}

/// Extension code to handler bindings, consulted in ascending code order.
#[derive(Clone)]
pub struct TranslationTable {
    handlers: BTreeMap<i8, Arc<dyn ExtensionHandler>>,
}

impl TranslationTable {
    /// An empty table with no extension handlers at all.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Bind a handler to an extension code.
    ///
    /// # Errors
    /// Returns [`CodecError::DuplicateExtension`] when the code is taken.
    pub fn register(
        &mut self,
        code: i8,
        handler: Arc<dyn ExtensionHandler>,
    ) -> Result<(), CodecError> {
        if self.handlers.contains_key(&code) {
            return Err(CodecError::DuplicateExtension(code));
        }
        self.handlers.insert(code, handler);
        Ok(())
    }

    fn get(&self, code: i8) -> Option<&Arc<dyn ExtensionHandler>> {
        self.handlers.get(&code)
    }

    fn encode(&self, value: &Value) -> Option<(i8, Vec<u8>)> {
        self.handlers
            .iter()
            .find_map(|(code, handler)| handler.encode(value).map(|data| (*code, data)))
    }
}

impl Default for TranslationTable {
    /// The built-in table: datetimes at code 125, dates at code 126.
    fn default() -> Self {
        let mut table = Self::empty();
        // a fresh table has neither code bound
        let _ = table.register(DATETIME_EXT_CODE, Arc::new(DatetimeHandler));
        let _ = table.register(DATE_EXT_CODE, Arc::new(DateHandler));
        table
    }
}

/// Payload codec parameterised by a [`TranslationTable`].
#[derive(Clone)]
pub struct Packer {
    table: Arc<TranslationTable>,
}

impl Default for Packer {
    fn default() -> Self {
        Self::new(TranslationTable::default())
    }
}

impl Packer {
    /// A codec using the given translation table.
    #[must_use]
    pub fn new(table: TranslationTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    /// Encode a value to msgpack bytes.
    ///
    /// # Errors
    /// Fails with [`CodecError::UnknownType`] when an extension value has
    /// no registered handler, or with an encoder error.
    #[must_use = "handle the result"]
    pub fn pack(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let wire = self.to_wire(value)?;
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &wire)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode msgpack bytes into a value.
    ///
    /// # Errors
    /// Fails with a decoder error for truncated or invalid input.
    #[must_use = "handle the result"]
    pub fn unpack(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let mut cursor = bytes;
        let wire = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        self.from_wire(wire)
    }

    /// Encode a WORK payload: `(name, positional_args, keyword_args)`.
    ///
    /// # Errors
    /// Propagates encoding failures from [`Packer::pack`].
    pub fn pack_work(
        &self,
        name: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> Result<Vec<u8>, CodecError> {
        let kw = kwargs
            .iter()
            .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
            .collect();
        self.pack(&Value::Array(vec![
            Value::Str(name.to_owned()),
            Value::Array(args.to_vec()),
            Value::Map(kw),
        ]))
    }

    /// Decode a WORK payload.
    ///
    /// # Errors
    /// Fails when the payload is not a `(name, args, kwargs)` triple.
    pub fn unpack_work(
        &self,
        bytes: &[u8],
    ) -> Result<(String, Vec<Value>, Vec<(String, Value)>), CodecError> {
        let value = self.unpack(bytes)?;
        let Value::Array(mut items) = value else {
            return Err(CodecError::Shape("(name, args, kwargs) triple"));
        };
        if items.len() != 3 {
            return Err(CodecError::Shape("(name, args, kwargs) triple"));
        }
        let kwargs = items.pop().unwrap_or(Value::Nil);
        let args = items.pop().unwrap_or(Value::Nil);
        let name = items.pop().unwrap_or(Value::Nil);

        let Value::Str(name) = name else {
            return Err(CodecError::Shape("string call name"));
        };
        let Value::Array(args) = args else {
            return Err(CodecError::Shape("positional argument array"));
        };
        let kwargs = match kwargs {
            Value::Map(pairs) => pairs
                .into_iter()
                .map(|(k, v)| match k {
                    Value::Str(k) => Ok((k, v)),
                    _ => Err(CodecError::Shape("string keyword names")),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Value::Nil => Vec::new(),
            _ => return Err(CodecError::Shape("keyword argument map")),
        };
        Ok((name, args, kwargs))
    }

    /// Encode an ERROR payload: `(kind, message, trace)`.
    ///
    /// # Errors
    /// Propagates encoding failures from [`Packer::pack`].
    pub fn pack_triple(
        &self,
        kind: &str,
        message: &str,
        trace: &str,
    ) -> Result<Vec<u8>, CodecError> {
        self.pack(&Value::Array(vec![
            Value::Str(kind.to_owned()),
            Value::Str(message.to_owned()),
            Value::Str(trace.to_owned()),
        ]))
    }

    /// Decode an ERROR payload.
    ///
    /// # Errors
    /// Fails when the payload is not a `(kind, message, trace)` triple of
    /// strings.
    pub fn unpack_triple(&self, bytes: &[u8]) -> Result<(String, String, String), CodecError> {
        let Value::Array(items) = self.unpack(bytes)? else {
            return Err(CodecError::Shape("(kind, message, trace) triple"));
        };
        let mut strings = items.into_iter().map(|item| match item {
            Value::Str(s) => Ok(s),
            _ => Err(CodecError::Shape("string triple members")),
        });
        match (strings.next(), strings.next(), strings.next(), strings.next()) {
            (Some(kind), Some(message), Some(trace), None) => Ok((kind?, message?, trace?)),
            _ => Err(CodecError::Shape("(kind, message, trace) triple")),
        }
    }

    /// Encode a HELLO payload: `(user_id, password)`.
    ///
    /// # Errors
    /// Propagates encoding failures from [`Packer::pack`].
    pub fn pack_hello(&self, user_id: &[u8], password: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.pack(&Value::Array(vec![
            Value::Bin(user_id.to_vec()),
            Value::Bin(password.to_vec()),
        ]))
    }

    /// Decode a HELLO payload.
    ///
    /// # Errors
    /// Fails when the payload is not a `(user_id, password)` pair.
    pub fn unpack_hello(&self, bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CodecError> {
        let Value::Array(items) = self.unpack(bytes)? else {
            return Err(CodecError::Shape("(user_id, password) pair"));
        };
        let mut fields = items.into_iter().map(|item| match item {
            Value::Bin(b) => Ok(b),
            Value::Str(s) => Ok(s.into_bytes()),
            _ => Err(CodecError::Shape("byte pair members")),
        });
        match (fields.next(), fields.next(), fields.next()) {
            (Some(user_id), Some(password), None) => Ok((user_id?, password?)),
            _ => Err(CodecError::Shape("(user_id, password) pair")),
        }
    }

    fn to_wire(&self, value: &Value) -> Result<rmpv::Value, CodecError> {
        Ok(match value {
            Value::Nil => rmpv::Value::Nil,
            Value::Bool(b) => rmpv::Value::Boolean(*b),
            Value::Int(i) => rmpv::Value::Integer((*i).into()),
            Value::UInt(u) => rmpv::Value::Integer((*u).into()),
            Value::F64(f) => rmpv::Value::F64(*f),
            Value::Str(s) => rmpv::Value::String(s.clone().into()),
            Value::Bin(b) => rmpv::Value::Binary(b.clone()),
            Value::Array(items) => rmpv::Value::Array(
                items
                    .iter()
                    .map(|item| self.to_wire(item))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Value::Map(pairs) => rmpv::Value::Map(
                pairs
                    .iter()
                    .map(|(k, v)| Ok((self.to_wire(k)?, self.to_wire(v)?)))
                    .collect::<Result<Vec<_>, CodecError>>()?,
            ),
            Value::Ext { code, data } => rmpv::Value::Ext(*code, data.clone()),
            extension => {
                let (code, data) = self
                    .table
                    .encode(extension)
                    .ok_or_else(|| CodecError::UnknownType(format!("{extension:?}")))?;
                rmpv::Value::Ext(code, data)
            }
        })
    }

    fn from_wire(&self, wire: rmpv::Value) -> Result<Value, CodecError> {
        Ok(match wire {
            rmpv::Value::Nil => Value::Nil,
            rmpv::Value::Boolean(b) => Value::Bool(b),
            rmpv::Value::Integer(i) => i.as_i64().map(Value::Int).or_else(|| {
                i.as_u64().map(Value::UInt)
            })
            .ok_or_else(|| CodecError::Decode(format!("unrepresentable integer {i}")))?,
            rmpv::Value::F32(f) => Value::F64(f64::from(f)),
            rmpv::Value::F64(f) => Value::F64(f),
            rmpv::Value::String(s) => Value::Str(
                s.into_str()
                    .ok_or_else(|| CodecError::Decode("string is not utf-8".to_owned()))?,
            ),
            rmpv::Value::Binary(b) => Value::Bin(b),
            rmpv::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.from_wire(item))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            rmpv::Value::Map(pairs) => Value::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| Ok((self.from_wire(k)?, self.from_wire(v)?)))
                    .collect::<Result<Vec<_>, CodecError>>()?,
            ),
            rmpv::Value::Ext(code, data) => match self.table.get(code) {
                Some(handler) => handler.decode(&data)?,
                None => Value::Ext { code, data },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn round_trip(packer: &Packer, value: Value) -> Value {
        let bytes = packer.pack(&value).unwrap();
        packer.unpack(&bytes).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        let packer = Packer::default();
        for value in [
            Value::Nil,
            Value::Bool(true),
            Value::Int(-42),
            Value::Int(7),
            Value::UInt(u64::MAX),
            Value::F64(2.5),
            Value::Str("héllo".to_owned()),
            Value::Bin(vec![0, 1, 2, 255]),
        ] {
            assert_eq!(round_trip(&packer, value.clone()), value);
        }
    }

    #[test]
    fn containers_round_trip() {
        let packer = Packer::default();
        let value = Value::Array(vec![
            Value::Int(1),
            Value::Map(vec![(Value::Str("k".to_owned()), Value::Bool(false))]),
        ]);
        assert_eq!(round_trip(&packer, value.clone()), value);
    }

    #[test]
    fn datetime_preserves_timezone() {
        let packer = Packer::default();
        let offset = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let dt = offset.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        let back = round_trip(&packer, Value::Time(dt));
        let restored = back.as_time().unwrap();
        assert_eq!(restored, dt);
        assert_eq!(restored.offset(), dt.offset());
    }

    #[test]
    fn date_round_trips() {
        let packer = Packer::default();
        let d = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();
        assert_eq!(round_trip(&packer, Value::Date(d)), Value::Date(d));
    }

    #[test]
    fn unknown_extension_codes_pass_through() {
        let packer = Packer::default();
        let value = Value::Ext {
            code: 9,
            data: vec![1, 2, 3],
        };
        assert_eq!(round_trip(&packer, value.clone()), value);
    }

    #[test]
    fn datetime_without_handler_is_a_typed_error() {
        let packer = Packer::new(TranslationTable::empty());
        let offset = FixedOffset::east_opt(0).unwrap();
        let dt = offset.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = packer.pack(&Value::Time(dt)).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(_)));
    }

    #[test]
    fn duplicate_extension_code_is_rejected() {
        let mut table = TranslationTable::default();
        let err = table
            .register(DATETIME_EXT_CODE, Arc::new(DatetimeHandler))
            .unwrap_err();
        assert!(matches!(
            err,
            CodecError::DuplicateExtension(DATETIME_EXT_CODE)
        ));
    }

    #[test]
    fn work_payload_round_trips() {
        let packer = Packer::default();
        let bytes = packer
            .pack_work(
                "string.upper",
                &[Value::from("hello")],
                &[("retries".to_owned(), Value::Int(3))],
            )
            .unwrap();
        let (name, args, kwargs) = packer.unpack_work(&bytes).unwrap();
        assert_eq!(name, "string.upper");
        assert_eq!(args, vec![Value::from("hello")]);
        assert_eq!(kwargs, vec![("retries".to_owned(), Value::Int(3))]);
    }

    #[test]
    fn malformed_work_payload_is_a_shape_error() {
        let packer = Packer::default();
        let bytes = packer.pack(&Value::Int(5)).unwrap();
        assert!(matches!(
            packer.unpack_work(&bytes),
            Err(CodecError::Shape(_))
        ));
    }

    #[test]
    fn hello_payload_round_trips() {
        let packer = Packer::default();
        let bytes = packer.pack_hello(b"john", b"s3cret!").unwrap();
        let (user, password) = packer.unpack_hello(&bytes).unwrap();
        assert_eq!(user, b"john");
        assert_eq!(password, b"s3cret!");
    }

    #[test]
    fn error_triple_round_trips() {
        let packer = Packer::default();
        let bytes = packer
            .pack_triple("ValueError", "too bad", "trace text")
            .unwrap();
        assert_eq!(
            packer.unpack_triple(&bytes).unwrap(),
            (
                "ValueError".to_owned(),
                "too bad".to_owned(),
                "trace text".to_owned()
            )
        );
    }
}
