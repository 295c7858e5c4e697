//! Closed outcome taxonomy attached to every response, real or synthesized

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// Business layer succeeded
    Ok,
    /// Peer reported an unspecified error
    GenericError,
    /// Payload or frame did not parse
    Format,
    /// Signature missing or invalid
    SignatureError,
    /// A forwarding policy dropped or rejected the request
    Filtered,
    /// Peer-side internal failure
    Server,
    /// No correlated reply within the deadline (or the caller gave up)
    Timeout,
    /// Local failure while preparing or sending
    Exception,
}

impl ResultCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "Ok",
            ResultCode::GenericError => "GenericError",
            ResultCode::Format => "Format",
            ResultCode::SignatureError => "SignatureError",
            ResultCode::Filtered => "Filtered",
            ResultCode::Server => "Server",
            ResultCode::Timeout => "Timeout",
            ResultCode::Exception => "Exception",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_match_display() {
        for code in [
            ResultCode::Ok,
            ResultCode::GenericError,
            ResultCode::Format,
            ResultCode::SignatureError,
            ResultCode::Filtered,
            ResultCode::Server,
            ResultCode::Timeout,
            ResultCode::Exception,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code));
        }
    }
}
