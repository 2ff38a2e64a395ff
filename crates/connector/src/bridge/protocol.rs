//! Wire protocol for helper communication.
//!
//! One JSON value per line in each direction. Requests are caller-defined;
//! every reply is an object of one of two shapes:
//! - `{"response": <any>}`: success, `response` may be any JSON value incl. `null`
//! - `{"error": "<string>"}`: helper-reported failure
//!
//! Replies carry no identifier. The n-th reply answers the n-th request.

use serde_json::Value;

/// A well-formed reply from a helper.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response(Value),
    Error(String),
}

impl Message {
    /// Parse one inbound line.
    ///
    /// A string `error` field wins over `response`; a non-string `error` is
    /// ignored.
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| RequestError::MalformedResponse {
                diagnostic: e.to_string(),
                line: line.to_string(),
            })?;

        let Value::Object(mut fields) = value else {
            return Err(RequestError::InvalidResponseShape {
                line: line.to_string(),
            });
        };

        if let Some(Value::String(error)) = fields.remove("error") {
            return Ok(Self::Error(error));
        }
        match fields.remove("response") {
            Some(response) => Ok(Self::Response(response)),
            None => Err(RequestError::InvalidResponseShape {
                line: line.to_string(),
            }),
        }
    }

    pub fn into_result(self) -> Result<Value, RequestError> {
        match self {
            Self::Response(value) => Ok(value),
            Self::Error(message) => Err(RequestError::HelperReportedError(message)),
        }
    }
}

/// Why a single request did not produce a response value.
///
/// All variants except `ChannelClosed` are local to one request; the bridge
/// stays usable afterwards.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("helper channel closed")]
    ChannelClosed,
    #[error("invalid response type from helper: {diagnostic} (line: {line:?})")]
    MalformedResponse { diagnostic: String, line: String },
    #[error("invalid response structure from helper (line: {line:?})")]
    InvalidResponseShape { line: String },
    #[error("{0}")]
    HelperReportedError(String),
    #[error("failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RequestError {
    /// True if the bridge can no longer answer any request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }
}
