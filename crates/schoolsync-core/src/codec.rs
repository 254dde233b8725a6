//! Reversible payload compression
//!
//! Every codec maps a JSON value to a tagged string and back. The tag prefix
//! (`t1:` for [`TokenCodec`], `z1:` for [`ZstdCodec`]) lets any record be
//! decoded even after the configured codec changes.
//!
//! Compression is never allowed to lose data: [`compress_verified`] decodes
//! the output again and compares it with the input, and callers store the
//! payload uncompressed whenever that check fails.

use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::types::payload_size;

/// Codec output as stored in a record's payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPayload(String);

impl CompressedPayload {
    pub fn new(encoded: String) -> Self {
        Self(encoded)
    }

    /// Recover the codec output from a stored payload value
    pub fn from_value(value: &Value) -> SyncResult<Self> {
        match value {
            Value::String(encoded) => Ok(Self(encoded.clone())),
            other => Err(SyncError::Codec(format!(
                "compressed payload must be a string, found {}",
                json_kind(other)
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::String(self.0)
    }
}

/// A lossless JSON payload transform
pub trait Codec: Send + Sync {
    /// Short stable name, used in logs and configuration
    fn name(&self) -> &'static str;

    fn compress(&self, payload: &Value) -> SyncResult<CompressedPayload>;

    fn decompress(&self, payload: &CompressedPayload) -> SyncResult<Value>;
}

/// Selectable codec implementations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Token,
    Zstd,
}

impl CodecKind {
    pub fn build(self) -> Arc<dyn Codec> {
        match self {
            CodecKind::Token => Arc::new(TokenCodec),
            CodecKind::Zstd => Arc::new(ZstdCodec::default()),
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token" => Ok(CodecKind::Token),
            "zstd" => Ok(CodecKind::Zstd),
            other => Err(SyncError::Configuration(format!("unknown codec '{other}'"))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Token substitution codec
// ═══════════════════════════════════════════════════════════════════════

const TOKEN_TAG: &str = "t1:";
const ESCAPE: char = '~';

/// Dictionary of frequent fragments in school records, keyed by token code.
///
/// Codes must be unique and must not be the escape character.
const TOKENS: &[(char, &str)] = &[
    ('a', "\"studentId\":"),
    ('b', "\"timestamp\":"),
    ('c', "\"present\":"),
    ('d', "\"attendance\""),
    ('e', "\"grades\""),
    ('f', "\"student_data\""),
    ('g', "\"name\":"),
    ('h', "\"grade\":"),
    ('i', "\"subject\":"),
    ('j', "\"score\":"),
    ('k', "\"date\":"),
    ('l', "\"teacherId\":"),
    ('m', "\"classId\":"),
    ('n', "\"status\":"),
    ('o', "\"id\":"),
    ('p', "\"schoolId\":"),
    ('q', "\"term\":"),
    ('r', "\"type\":"),
    ('s', "\"data\":"),
    ('u', "\"amount\":"),
    ('v', "\"phone\":"),
    ('T', "true"),
    ('F', "false"),
    ('N', "null"),
];

/// Dictionary substitution over the compact JSON text
///
/// A single left-to-right pass replaces the longest dictionary fragment at
/// each position with `~<code>` and doubles any literal `~`. Decoding is the
/// exact inverse, so any JSON value round-trips.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCodec;

impl TokenCodec {
    fn encode_text(json: &str) -> String {
        let mut out = String::with_capacity(json.len());
        let mut rest = json;
        while !rest.is_empty() {
            let longest = TOKENS
                .iter()
                .filter(|(_, fragment)| rest.starts_with(fragment))
                .max_by_key(|(_, fragment)| fragment.len());

            if let Some((code, fragment)) = longest {
                out.push(ESCAPE);
                out.push(*code);
                rest = &rest[fragment.len()..];
                continue;
            }

            let mut chars = rest.chars();
            if let Some(ch) = chars.next() {
                if ch == ESCAPE {
                    out.push(ESCAPE);
                }
                out.push(ch);
            }
            rest = chars.as_str();
        }
        out
    }

    fn decode_text(encoded: &str) -> SyncResult<String> {
        let mut out = String::with_capacity(encoded.len() * 2);
        let mut chars = encoded.chars();
        while let Some(ch) = chars.next() {
            if ch != ESCAPE {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some(ESCAPE) => out.push(ESCAPE),
                Some(code) => {
                    let fragment = TOKENS
                        .iter()
                        .find(|(c, _)| *c == code)
                        .map(|(_, fragment)| *fragment)
                        .ok_or_else(|| SyncError::Codec(format!("unknown token '~{code}'")))?;
                    out.push_str(fragment);
                }
                None => return Err(SyncError::Codec("dangling escape at end of input".into())),
            }
        }
        Ok(out)
    }
}

impl Codec for TokenCodec {
    fn name(&self) -> &'static str {
        "token"
    }

    fn compress(&self, payload: &Value) -> SyncResult<CompressedPayload> {
        let json = serde_json::to_string(payload)?;
        Ok(CompressedPayload(format!(
            "{TOKEN_TAG}{}",
            Self::encode_text(&json)
        )))
    }

    fn decompress(&self, payload: &CompressedPayload) -> SyncResult<Value> {
        let body = payload
            .as_str()
            .strip_prefix(TOKEN_TAG)
            .ok_or_else(|| SyncError::Codec("missing token codec tag".into()))?;
        let json = Self::decode_text(body)?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// zstd codec
// ═══════════════════════════════════════════════════════════════════════

const ZSTD_TAG: &str = "z1:";

/// JSON bytes through zstd, then base64url without padding
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        // Level 3 = fast with good compression
        Self { level: 3 }
    }
}

impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, payload: &Value) -> SyncResult<CompressedPayload> {
        let serialized = serde_json::to_vec(payload)?;
        let compressed = zstd::encode_all(&serialized[..], self.level)
            .map_err(|e| SyncError::Codec(format!("Compression failed: {}", e)))?;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&compressed);
        Ok(CompressedPayload(format!("{ZSTD_TAG}{encoded}")))
    }

    fn decompress(&self, payload: &CompressedPayload) -> SyncResult<Value> {
        let encoded = payload
            .as_str()
            .strip_prefix(ZSTD_TAG)
            .ok_or_else(|| SyncError::Codec("missing zstd codec tag".into()))?;
        let compressed = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| SyncError::Codec(format!("Invalid encoding: {}", e)))?;
        let bytes = zstd::decode_all(&compressed[..])
            .map_err(|e| SyncError::Codec(format!("Decompression failed: {}", e)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Decode a payload produced by any built-in codec, chosen by its tag
pub fn decompress_any(payload: &CompressedPayload) -> SyncResult<Value> {
    let text = payload.as_str();
    if text.starts_with(TOKEN_TAG) {
        TokenCodec.decompress(payload)
    } else if text.starts_with(ZSTD_TAG) {
        ZstdCodec::default().decompress(payload)
    } else {
        Err(SyncError::Codec("unrecognized codec tag".into()))
    }
}

/// Compress and prove the result decodes back to the input.
///
/// Returns `None` on any codec error or mismatch, and when the encoded
/// string would not take less room in a record than the plain JSON. The
/// caller then keeps the payload uncompressed.
pub fn compress_verified(codec: &dyn Codec, payload: &Value) -> Option<CompressedPayload> {
    let compressed = match codec.compress(payload) {
        Ok(compressed) => compressed,
        Err(e) => {
            warn!(codec = codec.name(), error = %e, "Compression failed, storing uncompressed");
            return None;
        }
    };

    let plain_size = payload_size(payload);
    let stored_size = payload_size(&Value::String(compressed.as_str().to_owned()));
    if stored_size >= plain_size {
        debug!(
            codec = codec.name(),
            plain_size, stored_size, "Compression does not pay off, storing uncompressed"
        );
        return None;
    }

    match codec.decompress(&compressed) {
        Ok(restored) if &restored == payload => {
            debug!(
                codec = codec.name(),
                compressed_size = compressed.len(),
                "Payload compressed"
            );
            Some(compressed)
        }
        Ok(_) => {
            warn!(
                codec = codec.name(),
                "Compression round trip mismatch, storing uncompressed"
            );
            None
        }
        Err(e) => {
            warn!(codec = codec.name(), error = %e, "Compression round trip failed, storing uncompressed");
            None
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
