//! Content-type aware payload encoding.
//!
//! Every message body travels with a content-type tag and receivers dispatch
//! decoding strictly on that tag:
//!
//! | tag | payloads |
//! |---|---|
//! | `application/json` | objects and arrays |
//! | `application/msgpack` | scalars and raw bytes |
//! | `application/cloudpickle` | opaque pre-serialized objects (base64 on the wire) |
//! | `text/plain` | strings |
//!
//! Unknown tags decode to the raw body with a warning.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::error::ErrorKind;

/// Wire content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/msgpack")]
    MsgPack,
    #[serde(rename = "application/cloudpickle")]
    Opaque,
    #[serde(rename = "text/plain")]
    Text,
}

impl ContentType {
    pub const ALL: [ContentType; 4] = [
        ContentType::Json,
        ContentType::MsgPack,
        ContentType::Opaque,
        ContentType::Text,
    ];

    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::MsgPack => "application/msgpack",
            ContentType::Opaque => "application/cloudpickle",
            ContentType::Text => "text/plain",
        }
    }

    /// Parse a MIME tag, ignoring case and parameters (`; charset=utf-8`).
    pub fn from_mime(raw: &str) -> Option<Self> {
        let essence = raw.split(';').next().unwrap_or_default().trim();
        Self::ALL
            .into_iter()
            .find(|ct| ct.mime().eq_ignore_ascii_case(essence))
    }
}

impl core::fmt::Display for ContentType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.mime())
    }
}

/// A message body before encoding / after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Objects and arrays.
    Json(Value),
    /// Null, booleans and numbers.
    Scalar(Value),
    /// Raw bytes.
    Bytes(Vec<u8>),
    Text(String),
    /// An object serialized by the sender; receivers reconstruct it themselves.
    Opaque(Vec<u8>),
}

impl Payload {
    /// Classify an arbitrary JSON value.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(s) => Payload::Text(s),
            v @ (Value::Object(_) | Value::Array(_)) => Payload::Json(v),
            scalar => Payload::Scalar(scalar),
        }
    }

    /// Build a payload from any serializable record.
    pub fn record<T: Serialize>(value: &T) -> Result<Self, SerializationError> {
        Ok(Self::from_json(serde_json::to_value(value)?))
    }

    /// The content type this payload is published with by default.
    pub fn content_type(&self) -> ContentType {
        match self {
            Payload::Json(_) => ContentType::Json,
            Payload::Scalar(_) | Payload::Bytes(_) => ContentType::MsgPack,
            Payload::Text(_) => ContentType::Text,
            Payload::Opaque(_) => ContentType::Opaque,
        }
    }

    /// Null, empty strings and empty collections count as "no body".
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Json(Value::Object(map)) => map.is_empty(),
            Payload::Json(Value::Array(items)) => items.is_empty(),
            Payload::Json(_) => false,
            Payload::Scalar(v) => v.is_null(),
            Payload::Bytes(b) | Payload::Opaque(b) => b.is_empty(),
            Payload::Text(s) => s.is_empty(),
        }
    }

    /// JSON view of the payload, when one exists.
    pub fn as_json(&self) -> Option<Value> {
        match self {
            Payload::Json(v) | Payload::Scalar(v) => Some(v.clone()),
            Payload::Text(s) => Some(Value::String(s.clone())),
            Payload::Bytes(_) | Payload::Opaque(_) => None,
        }
    }

    /// Deserialize a JSON-representable payload into a typed record.
    pub fn decode_into<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        let value = self.as_json().ok_or(SerializationError::Unsupported {
            payload: self.variant_name(),
            content_type: ContentType::Json.mime(),
        })?;
        Ok(serde_json::from_value(value)?)
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Payload::Json(_) => "json",
            Payload::Scalar(_) => "scalar",
            Payload::Bytes(_) => "bytes",
            Payload::Text(_) => "text",
            Payload::Opaque(_) => "opaque",
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::from_json(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("msgpack: {0}")]
    MsgPack(String),

    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("text body is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("{payload} payload cannot be encoded as {content_type}")]
    Unsupported {
        payload: &'static str,
        content_type: &'static str,
    },
}

impl SerializationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SerializationFailure
    }
}

/// An encoded body and its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub content_type: ContentType,
    pub body: Vec<u8>,
}

/// Stateless encoder/decoder shared by producers and consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Serializer;

impl Serializer {
    pub fn new() -> Self {
        Self
    }

    /// Encode with the payload's natural content type.
    pub fn encode(&self, payload: &Payload) -> Result<Encoded, SerializationError> {
        let content_type = payload.content_type();
        let body = self.encode_as(payload, content_type)?;
        Ok(Encoded { content_type, body })
    }

    /// Encode with an explicit content type.
    pub fn encode_as(
        &self,
        payload: &Payload,
        content_type: ContentType,
    ) -> Result<Vec<u8>, SerializationError> {
        let unsupported = || SerializationError::Unsupported {
            payload: payload.variant_name(),
            content_type: content_type.mime(),
        };

        match (content_type, payload) {
            (ContentType::Json, Payload::Json(v) | Payload::Scalar(v)) => Ok(serde_json::to_vec(v)?),
            (ContentType::Json, Payload::Text(s)) => Ok(serde_json::to_vec(s)?),
            (ContentType::MsgPack, Payload::Json(v) | Payload::Scalar(v)) => {
                Ok(rmp_serde::to_vec_named(v)?)
            }
            (ContentType::MsgPack, Payload::Text(s)) => Ok(rmp_serde::to_vec(s)?),
            (ContentType::MsgPack, Payload::Bytes(b)) => {
                let mut buf = Vec::with_capacity(b.len() + 5);
                rmp::encode::write_bin(&mut buf, b)
                    .map_err(|e| SerializationError::MsgPack(e.to_string()))?;
                Ok(buf)
            }
            (ContentType::Opaque, Payload::Opaque(b) | Payload::Bytes(b)) => {
                Ok(BASE64.encode(b).into_bytes())
            }
            (ContentType::Text, Payload::Text(s)) => Ok(s.as_bytes().to_vec()),
            (ContentType::Text, Payload::Json(v) | Payload::Scalar(v)) => {
                Ok(v.to_string().into_bytes())
            }
            _ => Err(unsupported()),
        }
    }

    /// Decode a body by its content-type tag.
    pub fn decode(
        &self,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<Payload, SerializationError> {
        match content_type.and_then(ContentType::from_mime) {
            Some(ContentType::Json) => {
                let value: Value = serde_json::from_slice(body)?;
                Ok(Payload::from_json(value))
            }
            Some(ContentType::MsgPack) => decode_msgpack(body),
            Some(ContentType::Opaque) => Ok(Payload::Opaque(BASE64.decode(body)?)),
            Some(ContentType::Text) => Ok(Payload::Text(String::from_utf8(body.to_vec())?)),
            None => {
                warn!(
                    content_type = content_type.unwrap_or("<missing>"),
                    "unsupported content type, returning raw body"
                );
                Ok(Payload::Bytes(body.to_vec()))
            }
        }
    }

    /// Msgpack-encode a typed record.
    pub fn pack<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Msgpack-decode a typed record.
    pub fn unpack<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, SerializationError> {
        Ok(rmp_serde::from_slice(body)?)
    }
}

fn decode_msgpack(body: &[u8]) -> Result<Payload, SerializationError> {
    // bin8 / bin16 / bin32 markers
    if matches!(body.first(), Some(0xc4..=0xc6)) {
        let mut rd = body;
        let len = rmp::decode::read_bin_len(&mut rd)
            .map_err(|e| SerializationError::MsgPack(e.to_string()))? as usize;
        let data = rd
            .get(..len)
            .ok_or_else(|| SerializationError::MsgPack("truncated bin payload".to_string()))?;
        return Ok(Payload::Bytes(data.to_vec()));
    }

    let value: Value = rmp_serde::from_slice(body)?;
    Ok(Payload::from_json(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn natural_content_types() {
        assert_eq!(Payload::from(json!({"x": 1})).content_type(), ContentType::Json);
        assert_eq!(Payload::from(json!(3)).content_type(), ContentType::MsgPack);
        assert_eq!(Payload::from("hi").content_type(), ContentType::Text);
        assert_eq!(Payload::Bytes(vec![1]).content_type(), ContentType::MsgPack);
        assert_eq!(Payload::Opaque(vec![1]).content_type(), ContentType::Opaque);
    }

    #[test]
    fn mime_parsing_ignores_case_and_params() {
        assert_eq!(
            ContentType::from_mime("Application/JSON; charset=utf-8"),
            Some(ContentType::Json)
        );
        assert_eq!(ContentType::from_mime("application/xml"), None);
    }

    #[test]
    fn json_body_decodes_to_object() {
        let payload = Serializer.decode(br#"{"x":1}"#, Some("application/json")).unwrap();
        assert_eq!(payload, Payload::Json(json!({"x": 1})));
    }

    #[test]
    fn unknown_content_type_returns_raw_body() {
        let payload = Serializer.decode(b"<a/>", Some("application/xml")).unwrap();
        assert_eq!(payload, Payload::Bytes(b"<a/>".to_vec()));

        let payload = Serializer.decode(b"raw", None).unwrap();
        assert_eq!(payload, Payload::Bytes(b"raw".to_vec()));
    }

    #[test]
    fn malformed_json_is_a_serialization_failure() {
        let err = Serializer.decode(b"{nope", Some("application/json")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SerializationFailure);
    }

    #[test]
    fn bytes_round_trip_through_msgpack_bin() {
        let payload = Payload::Bytes(vec![0, 1, 2, 255]);
        let encoded = Serializer.encode(&payload).unwrap();
        assert_eq!(encoded.content_type, ContentType::MsgPack);
        assert_eq!(
            Serializer.decode(&encoded.body, Some(encoded.content_type.mime())).unwrap(),
            payload
        );
    }

    #[test]
    fn opaque_objects_travel_as_base64() {
        let payload = Payload::Opaque(b"\x80\x04pickled".to_vec());
        let encoded = Serializer.encode(&payload).unwrap();
        assert!(encoded.body.is_ascii());
        assert_eq!(
            Serializer.decode(&encoded.body, Some("application/cloudpickle")).unwrap(),
            payload
        );
    }

    #[test]
    fn bytes_cannot_be_sent_as_json() {
        let err = Serializer
            .encode_as(&Payload::Bytes(vec![1]), ContentType::Json)
            .unwrap_err();
        assert!(matches!(err, SerializationError::Unsupported { .. }));
    }

    #[test]
    fn typed_records_pack_and_decode() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Order {
            id: u32,
            sku: String,
        }

        let order = Order { id: 7, sku: "A-1".into() };
        let packed = Serializer.pack(&order).unwrap();
        assert_eq!(Serializer.unpack::<Order>(&packed).unwrap(), order);

        let payload = Payload::record(&order).unwrap();
        assert_eq!(payload.decode_into::<Order>().unwrap(), order);
    }

    #[test]
    fn empty_bodies_are_detected() {
        assert!(Payload::from(json!(null)).is_empty());
        assert!(Payload::from(json!({})).is_empty());
        assert!(Payload::from("").is_empty());
        assert!(!Payload::from(json!(0)).is_empty());
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z0-9 ]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::hash_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        /// Property: JSON-representable values survive encode/decode under
        /// both the json and msgpack tags.
        #[test]
        fn json_and_msgpack_round_trip(value in arb_json()) {
            let payload = Payload::from_json(value);
            for ct in [ContentType::Json, ContentType::MsgPack] {
                let body = Serializer.encode_as(&payload, ct).unwrap();
                let decoded = Serializer.decode(&body, Some(ct.mime())).unwrap();
                prop_assert_eq!(&decoded, &payload);
            }
        }
    }
}
