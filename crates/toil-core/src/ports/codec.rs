//! Payload codec port: job records to and from the backend's string form.

use thiserror::Error;

use crate::domain::Job;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("corrupt job record: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serializes and reconstructs job records.
///
/// The contract is lossless round-tripping: id, payload (with arbitrary
/// nesting), source, and timestamps must survive encode/decode unchanged.
pub trait PayloadCodec: Send + Sync {
    fn encode(&self, job: &Job) -> Result<String, CodecError>;

    fn decode(&self, raw: &str) -> Result<Job, CodecError>;
}

/// Default codec: the job record as a JSON document. Dates travel as RFC 3339
/// strings via chrono's serde impls, which keeps records readable in the
/// backend and diffable in logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, job: &Job) -> Result<String, CodecError> {
        serde_json::to_string(job).map_err(CodecError::Encode)
    }

    fn decode(&self, raw: &str) -> Result<Job, CodecError> {
        serde_json::from_str(raw).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_records_are_decode_errors() {
        let err = JsonCodec.decode("{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));

        // Valid JSON that is not a job record fails the same way.
        let err = JsonCodec.decode(r#"{"id": "seven"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
