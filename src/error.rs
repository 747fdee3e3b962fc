use serde::Serialize;
use std::fmt;

/// Bucket for a failed upstream exchange — surfaced on log entries as
/// `upstreamErrorCategory` and counted as a distinct dashboard bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Timeout,
    Aborted,
    Connection,
    Protocol,
    Upstream,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Aborted => "aborted",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Upstream => "upstream",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an upstream error by walking its source chain.
///
/// Typed checks (hyper, hyper-util, io) run first; the message fallback
/// catches errors that only carry context in their Display output.
pub fn categorize_error(err: &(dyn std::error::Error + 'static)) -> ErrorCategory {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);

    while let Some(e) = current {
        if let Some(h) = e.downcast_ref::<hyper::Error>() {
            if h.is_timeout() {
                return ErrorCategory::Timeout;
            }
            if h.is_canceled() {
                return ErrorCategory::Aborted;
            }
            if h.is_parse() || h.is_parse_status() || h.is_incomplete_message() {
                return ErrorCategory::Protocol;
            }
        }
        if let Some(le) = e.downcast_ref::<hyper_util::client::legacy::Error>() {
            if le.is_connect() {
                return ErrorCategory::Connection;
            }
        }
        if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return ErrorCategory::Timeout;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            match io.kind() {
                ErrorKind::TimedOut => return ErrorCategory::Timeout,
                ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected => return ErrorCategory::Connection,
                ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
                    return ErrorCategory::Aborted
                }
                _ => {}
            }
        }
        current = e.source();
    }

    categorize_message(&err.to_string())
}

/// Message-level fallback for errors whose chain carries no typed cause.
pub fn categorize_message(msg: &str) -> ErrorCategory {
    let msg = msg.to_ascii_lowercase();
    if msg.contains("timed out") || msg.contains("timeout") {
        ErrorCategory::Timeout
    } else if msg.contains("abort") || msg.contains("cancel") {
        ErrorCategory::Aborted
    } else if msg.contains("refused")
        || msg.contains("reset")
        || msg.contains("unreachable")
        || msg.contains("dns error")
        || msg.contains("connect")
    {
        ErrorCategory::Connection
    } else if msg.contains("parse") || msg.contains("invalid") || msg.contains("malformed") {
        ErrorCategory::Protocol
    } else if msg.contains("upstream") {
        ErrorCategory::Upstream
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_io_kinds() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(categorize_error(&refused), ErrorCategory::Connection);

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(categorize_error(&timeout), ErrorCategory::Timeout);

        let pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(categorize_error(&pipe), ErrorCategory::Aborted);
    }

    #[test]
    fn test_categorize_message_fallback() {
        assert_eq!(categorize_message("request timed out"), ErrorCategory::Timeout);
        assert_eq!(
            categorize_message("connection refused by peer"),
            ErrorCategory::Connection
        );
        assert_eq!(
            categorize_message("malformed chunked encoding"),
            ErrorCategory::Protocol
        );
        assert_eq!(categorize_message("something odd"), ErrorCategory::Unknown);
    }
}
