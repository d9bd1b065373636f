// Consistent exit codes for the courier CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument/config error
//   11 = authentication error
//   13 = network error
//   14 = action rejected or failed

use std::fmt;
use std::process;

use courier_client::{ClientError, Notice};

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Auth = 11,
    Network = 13,
    Action = 14,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(failure) = cause.downcast_ref::<SessionFailure>() {
                return match failure {
                    SessionFailure::AuthRejected(_) => Self::Auth,
                    SessionFailure::ReconnectExhausted(_) => Self::Network,
                    SessionFailure::ActionNotDelivered(_) => Self::Action,
                };
            }
            if let Some(client_err) = cause.downcast_ref::<ClientError>() {
                return match client_err {
                    ClientError::InvalidAction(_)
                    | ClientError::MissingEndpoint
                    | ClientError::Config(_) => Self::Usage,
                    ClientError::DuplicateAction(_) => Self::Action,
                    ClientError::AlreadyConnected(_) | ClientError::Shutdown => Self::Error,
                };
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut => {
                        Self::Network
                    }
                    _ => Self::Error,
                };
            }
        }

        let msg = format!("{err:#}");
        if msg.contains("timed out") {
            return Self::Network;
        }
        if msg.contains("invalid client configuration") || msg.contains("failed to load config") {
            return Self::Usage;
        }

        Self::Error
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

/// Terminal session or action failure, embedded in an `anyhow::Error` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    AuthRejected(String),
    ReconnectExhausted(u32),
    ActionNotDelivered(String),
}

impl SessionFailure {
    /// The failure a notice announces, if it ends the session.
    pub fn from_notice(notice: &Notice) -> Option<Self> {
        match notice {
            Notice::AuthFailed { reason } => Some(Self::AuthRejected(reason.clone())),
            Notice::ReconnectExhausted { attempts } => Some(Self::ReconnectExhausted(*attempts)),
            _ => None,
        }
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthRejected(reason) => write!(f, "authentication rejected: {reason}"),
            Self::ReconnectExhausted(attempts) => {
                write!(f, "gave up reconnecting after {attempts} attempts")
            }
            Self::ActionNotDelivered(detail) => write!(f, "action not delivered: {detail}"),
        }
    }
}

impl std::error::Error for SessionFailure {}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::validation::ValidationError;

    #[test]
    fn exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Error.code(), 1);
        assert_eq!(ExitCode::Usage.code(), 2);
        assert_eq!(ExitCode::Auth.code(), 11);
        assert_eq!(ExitCode::Network.code(), 13);
        assert_eq!(ExitCode::Action.code(), 14);
    }

    #[test]
    fn session_failures_in_chain() {
        let auth = anyhow::Error::new(SessionFailure::AuthRejected("bad token".into()));
        assert_eq!(ExitCode::from_error(&auth), ExitCode::Auth);

        let exhausted =
            anyhow::Error::new(SessionFailure::ReconnectExhausted(5)).context("listen failed");
        assert_eq!(ExitCode::from_error(&exhausted), ExitCode::Network);

        let action = anyhow::Error::new(SessionFailure::ActionNotDelivered("rejected".into()));
        assert_eq!(ExitCode::from_error(&action), ExitCode::Action);
    }

    #[test]
    fn client_errors_map_to_usage() {
        let missing = anyhow::Error::new(ClientError::MissingEndpoint);
        assert_eq!(ExitCode::from_error(&missing), ExitCode::Usage);

        let invalid = anyhow::Error::new(ClientError::InvalidAction(ValidationError::EmptyContent));
        assert_eq!(ExitCode::from_error(&invalid), ExitCode::Usage);
    }

    #[test]
    fn from_error_connection_refused_is_network() {
        let err = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
    }

    #[test]
    fn from_error_timeout_message_is_network() {
        let err = anyhow::anyhow!("timed out after 10s waiting for the session");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
    }

    #[test]
    fn from_error_generic_is_error() {
        let err = anyhow::anyhow!("something went wrong");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Error);
    }

    #[test]
    fn notices_that_end_the_session() {
        assert_eq!(
            SessionFailure::from_notice(&Notice::AuthFailed { reason: "nope".into() }),
            Some(SessionFailure::AuthRejected("nope".into()))
        );
        assert_eq!(
            SessionFailure::from_notice(&Notice::ReconnectExhausted { attempts: 3 }),
            Some(SessionFailure::ReconnectExhausted(3))
        );
        assert_eq!(
            SessionFailure::from_notice(&Notice::ReconnectScheduled { attempt: 1, delay_ms: 10 }),
            None
        );
    }
}
