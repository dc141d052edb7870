use thiserror::Error;

/// Errors that can occur when talking to a language model backend.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller-supplied input is invalid or unsupported by the target.
    #[error("Invalid request: {0}")]
    Request(String),

    /// Network, timeout or connection failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend returned data this adapter cannot parse, or an explicit error payload.
    #[error("Protocol error: {provider} - {message}")]
    Protocol { provider: String, message: String },

    /// A stream violated an ordering or type-consistency invariant.
    #[error("Accumulation error: {0}")]
    Accumulation(String),

    /// The final argument buffer of a tool call is not a JSON object.
    #[error("Malformed arguments for tool call {tool_call_id}: {source}")]
    MalformedToolArgs {
        tool_call_id: String,
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn request(message: impl Into<String>) -> Self {
        Error::Request(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }

    pub fn protocol(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Protocol {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn accumulation(message: impl Into<String>) -> Self {
        Error::Accumulation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Whether the failure happened below the protocol layer, so a retry may succeed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Transport(format!("request timed out: {err}"))
        } else if err.is_decode() {
            Error::Protocol {
                provider: "http".to_string(),
                message: format!("failed to decode response body: {err}"),
            }
        } else {
            Error::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::protocol("Google", "bad chunk");
        assert_eq!(err.to_string(), "Protocol error: Google - bad chunk");

        let err = Error::request("no credentials");
        assert!(err.to_string().contains("Invalid request"));
        assert!(!err.is_transport());
        assert!(Error::transport("reset").is_transport());
    }

    #[test]
    fn test_malformed_tool_args_names_call() {
        let source = serde_json::from_str::<serde_json::Value>("{\"a\":").unwrap_err();
        let err = Error::MalformedToolArgs {
            tool_call_id: "call_1".to_string(),
            raw: "{\"a\":".to_string(),
            source,
        };
        assert!(err.to_string().contains("call_1"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
