//! Parsing of the kernel `fde-setup` hook "features" reply.

use serde::Deserialize;
use thiserror::Error;

/// Feature reported by hooks that manage sealing themselves.
pub const DEVICE_SETUP_FEATURE: &str = "device-setup";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FdeFeaturesError {
    #[error("fde-setup hook returned empty output")]
    Empty,
    #[error("fde-setup hook output must be a single line of JSON")]
    MultiLine,
    #[error("cannot parse fde-setup hook output: {0}")]
    Malformed(String),
    #[error("fde-setup hook reported an error: {0}")]
    Reported(String),
    #[error("fde-setup hook output has neither features nor error")]
    Unrecognized,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FeaturesReply {
    #[serde(default)]
    features: Option<Vec<String>>,
    #[serde(default)]
    error: Option<String>,
}

/// Parses the reply of the "features" query.
///
/// The reply is exactly one line of JSON, either `{"features":[...]}` or
/// `{"error":"..."}`. Everything else is rejected.
pub fn parse_features(output: &[u8]) -> Result<Vec<String>, FdeFeaturesError> {
    let text = String::from_utf8_lossy(output);
    let trimmed = text.trim_end_matches(['\n', '\r']);
    if trimmed.trim().is_empty() {
        return Err(FdeFeaturesError::Empty);
    }
    if trimmed.contains('\n') {
        return Err(FdeFeaturesError::MultiLine);
    }

    let reply: FeaturesReply = serde_json::from_str(trimmed)
        .map_err(|e| FdeFeaturesError::Malformed(e.to_string()))?;

    match (reply.features, reply.error) {
        (_, Some(error)) => Err(FdeFeaturesError::Reported(error)),
        (Some(features), None) => Ok(features),
        (None, None) => Err(FdeFeaturesError::Unrecognized),
    }
}
