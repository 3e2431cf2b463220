//! Decoders for everything a device puts on the wire: BSON value payloads,
//! zlib-compressed control payloads, the device-properties path list, and
//! the introspection string.

use std::io::Read;
use std::sync::LazyLock;

use bson::{Bson, Document};
use flate2::read::ZlibDecoder;
use regex::Regex;
use thiserror::Error;

use dup_types::SAFE_INFLATE_MAX;

#[derive(Error, Debug, PartialEq)]
pub enum PayloadError {
    #[error("undecodable bson payload")]
    UndecodableBson,
    #[error("inflated payload exceeds the {SAFE_INFLATE_MAX} byte cap")]
    InflatedTooBig,
    #[error("corrupted zlib stream: {0}")]
    CorruptedZlib(String),
    #[error("invalid introspection string")]
    InvalidIntrospection,
    #[error("properties payload is too short")]
    TruncatedProperties,
    #[error("payload is not valid utf-8")]
    NotUtf8,
}

/// A decoded data payload: the published value, the optional explicit
/// timestamp, and the optional metadata map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedPayload {
    pub value: Option<Bson>,
    pub timestamp_ms: Option<i64>,
    pub metadata: Option<Document>,
}

/// Decodes a device data payload. Accepted shapes are `{v, t, m}` with `t`
/// and `m` optional, and a bare document (legacy aggregated objects). An
/// empty payload means unset, and so does `{v: <empty subtype-0 binary>}`.
pub fn decode_bson_payload(payload: &[u8]) -> Result<DecodedPayload, PayloadError> {
    if payload.is_empty() {
        return Ok(DecodedPayload::default());
    }

    let mut reader = payload;
    let doc = Document::from_reader(&mut reader).map_err(|_| PayloadError::UndecodableBson)?;

    let timestamp_ms = match doc.get("t") {
        None => None,
        Some(Bson::DateTime(dt)) => Some(dt.timestamp_millis()),
        Some(_) => return Err(PayloadError::UndecodableBson),
    };

    let metadata = match doc.get("m") {
        None => None,
        Some(Bson::Document(m)) => Some(m.clone()),
        Some(_) => return Err(PayloadError::UndecodableBson),
    };

    match doc.get("v") {
        Some(Bson::Binary(bin))
            if bin.bytes.is_empty() && bin.subtype == bson::spec::BinarySubtype::Generic =>
        {
            // explicit unset
            Ok(DecodedPayload {
                value: None,
                timestamp_ms,
                metadata,
            })
        }
        Some(value) => Ok(DecodedPayload {
            value: Some(value.clone()),
            timestamp_ms,
            metadata,
        }),
        // legacy aggregated object: the document itself is the value
        None => Ok(DecodedPayload {
            value: Some(Bson::Document(doc)),
            timestamp_ms: None,
            metadata: None,
        }),
    }
}

/// Inflates a zlib stream, refusing anything that would decompress past
/// [`SAFE_INFLATE_MAX`]. The cap is enforced while reading, so a
/// compression bomb never materializes in memory.
pub fn safe_inflate(compressed: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let mut decoder = ZlibDecoder::new(compressed).take(SAFE_INFLATE_MAX as u64 + 1);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| PayloadError::CorruptedZlib(e.to_string()))?;
    if inflated.len() > SAFE_INFLATE_MAX {
        return Err(PayloadError::InflatedTooBig);
    }
    Ok(inflated)
}

/// Parses a `/producer/properties` payload: a 4-byte big-endian
/// uncompressed-size prefix followed by a zlib stream of
/// `iface1/path1;iface2/path2;…`. The literal four zero bytes mean the
/// empty set. Returns `(interface, "/path")` pairs; entries without a
/// slash are skipped.
pub fn parse_producer_properties(payload: &[u8]) -> Result<Vec<(String, String)>, PayloadError> {
    if payload == [0, 0, 0, 0] {
        return Ok(Vec::new());
    }
    if payload.len() < 4 {
        return Err(PayloadError::TruncatedProperties);
    }

    let inflated = safe_inflate(&payload[4..])?;
    let text = std::str::from_utf8(&inflated).map_err(|_| PayloadError::NotUtf8)?;
    Ok(parse_device_properties(text))
}

/// The inverse framing, used for the server → device consumer-properties
/// control message: 4-byte big-endian size prefix plus a zlib stream of
/// the `;`-joined absolute paths. An empty list is the four zero bytes.
pub fn encode_properties_payload(paths: &[String]) -> Vec<u8> {
    let joined = paths.join(";");
    if joined.is_empty() {
        return vec![0, 0, 0, 0];
    }

    let mut framed = (joined.len() as u32).to_be_bytes().to_vec();
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    let _ = std::io::Write::write_all(&mut encoder, joined.as_bytes());
    framed.extend(encoder.finish().unwrap_or_default());
    framed
}

pub fn parse_device_properties(text: &str) -> Vec<(String, String)> {
    text.split(';')
        .filter_map(|entry| {
            let (interface, path) = entry.split_once('/')?;
            Some((interface.to_string(), format!("/{}", path)))
        })
        .collect()
}

static INTERFACE_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z]+(\.[a-zA-Z0-9]+)*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrospectionEntry {
    pub name: String,
    pub major: i32,
    pub minor: i32,
}

/// Parses an introspection payload: `;`-separated `name:major:minor`
/// triples. Any malformed token fails the whole parse.
pub fn parse_introspection(payload: &[u8]) -> Result<Vec<IntrospectionEntry>, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::InvalidIntrospection)?;
    if text.is_empty() {
        return Ok(Vec::new());
    }

    text.split(';')
        .map(|token| {
            let mut parts = token.split(':');
            let name = parts.next().unwrap_or_default();
            let major = parts.next().ok_or(PayloadError::InvalidIntrospection)?;
            let minor = parts.next().ok_or(PayloadError::InvalidIntrospection)?;
            if parts.next().is_some() || !INTERFACE_NAME_REGEX.is_match(name) {
                return Err(PayloadError::InvalidIntrospection);
            }
            let major: i32 = major
                .parse()
                .map_err(|_| PayloadError::InvalidIntrospection)?;
            let minor: i32 = minor
                .parse()
                .map_err(|_| PayloadError::InvalidIntrospection)?;
            if major < 0 || minor < 0 {
                return Err(PayloadError::InvalidIntrospection);
            }
            Ok(IntrospectionEntry {
                name: name.to_string(),
                major,
                minor,
            })
        })
        .collect()
}
