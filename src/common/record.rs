//! Schema handles and records
//!
//! The pipeline treats a record as an opaque payload plus the schema it was
//! encoded against. The only checks applied on the write path are the ones
//! that decide whether the payload belongs in the current file at all.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

/// Upper bound on a single encoded record (64 MiB)
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Shared schema handle
pub type SchemaRef = Arc<Schema>;

/// Record encoding errors
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Schema mismatch: writer expects '{expected}', record carries '{actual}'")]
    SchemaMismatch { expected: String, actual: String },

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Record too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("Compression error: {0}")]
    Compression(String),
}

/// Schema describing the records of one writer
///
/// The definition is kept as JSON; only `name` is interpreted. The
/// fingerprint is derived from the canonical JSON text so two schemas parsed
/// from differently formatted sources compare equal.
#[derive(Clone, PartialEq, Eq)]
pub struct Schema {
    name: String,
    definition: Value,
    fingerprint: u64,
}

impl Schema {
    /// Parse a schema from its JSON text
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        let definition: Value = serde_json::from_str(json)?;
        Self::from_value(definition)
    }

    /// Build a schema from an already parsed JSON value
    pub fn from_value(definition: Value) -> Result<Self, serde_json::Error> {
        let name = match definition.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(serde::de::Error::custom(
                    "schema must be an object with a non-empty string 'name'",
                ))
            }
        };
        let canonical = serde_json::to_string(&definition)?;
        Ok(Self {
            name,
            fingerprint: xxh64(canonical.as_bytes(), 0),
            definition,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &Value {
        &self.definition
    }

    /// Canonical JSON text (stored in file headers)
    pub fn to_json(&self) -> String {
        self.definition.to_string()
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn into_ref(self) -> SchemaRef {
        Arc::new(self)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("fingerprint", &format_args!("{:016x}", self.fingerprint))
            .finish()
    }
}

/// One record handed to the writer by a producer
#[derive(Clone)]
pub struct Record {
    schema: SchemaRef,
    payload: Bytes,
}

impl Record {
    /// Wrap an already encoded payload
    pub fn new(schema: SchemaRef, payload: impl Into<Bytes>) -> Self {
        Self {
            schema,
            payload: payload.into(),
        }
    }

    /// Encode a serde value as MessagePack (named fields)
    pub fn encode<T: Serialize>(schema: SchemaRef, value: &T) -> Result<Self, EncodingError> {
        let payload = rmp_serde::to_vec_named(value)?;
        Ok(Self::new(schema, payload))
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Check the record may be written by a writer of `schema`
    pub fn validate_for(&self, schema: &Schema) -> Result<(), EncodingError> {
        if self.schema.fingerprint() != schema.fingerprint() {
            return Err(EncodingError::SchemaMismatch {
                expected: schema.name().to_string(),
                actual: self.schema.name().to_string(),
            });
        }
        if self.payload.is_empty() {
            return Err(EncodingError::EmptyPayload);
        }
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(EncodingError::TooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }
        Ok(())
    }
}

// Payloads can be large; logs only need to identify the record.
impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("schema", &self.schema.name())
            .field("payload_bytes", &self.payload.len())
            .finish()
    }
}
