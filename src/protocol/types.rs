//! Message types for the agent-to-agent protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Envelope type classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Free text or structured sub-query addressed to an agent
    Query,
    /// Tool name plus arguments
    DataRequest,
    /// Tool result
    DataResponse,
    /// Normal agent answer
    Response,
    /// Agent-local failure with a structured cause
    Error,
    /// Flagged support outcome; a response variant, not a failure
    Escalation,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::Query,
        MessageType::DataRequest,
        MessageType::DataResponse,
        MessageType::Response,
        MessageType::Error,
        MessageType::Escalation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Query => "query",
            MessageType::DataRequest => "data_request",
            MessageType::DataResponse => "data_response",
            MessageType::Response => "response",
            MessageType::Error => "error",
            MessageType::Escalation => "escalation",
        }
    }

    /// Whether this type answers an earlier request.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            MessageType::DataResponse
                | MessageType::Response
                | MessageType::Error
                | MessageType::Escalation
        )
    }

    /// Whether this type carries a successful outcome.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            MessageType::DataResponse | MessageType::Response | MessageType::Escalation
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Protocol(format!("unknown message type '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_types() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = "broadcast".parse::<MessageType>().unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn test_reply_classification() {
        assert!(!MessageType::Query.is_reply());
        assert!(!MessageType::DataRequest.is_reply());
        assert!(MessageType::Escalation.is_reply());
        assert!(MessageType::Escalation.is_success());
        assert!(!MessageType::Error.is_success());
    }
}
