use thiserror_no_std::Error;

use super::stack::ResponseCode;

/// Errors produced by the networking core.
///
/// Bring-up failures are only ever logged and retried; the request path
/// returns them to the caller, which decides whether to try again.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    #[error("WiFi device unavailable")]
    DeviceUnavailable,
    #[error("WiFi device initialization failed")]
    DeviceInitFailed,
    #[error("joining the WiFi network failed")]
    JoinFailed,
    #[error("network stack creation failed")]
    StackCreateFailed,
    #[error("address lease failed")]
    LeaseFailed,
    #[error("no name server in the address lease")]
    NoNameServer,
    #[error("network not ready")]
    NotReady,
    #[error("invalid address")]
    InvalidAddress,
    #[error("resolution timed out")]
    ResolutionTimeout,
    #[error("resolution failed: {0}")]
    ResolutionFailed(ResponseCode),
    #[error("no answers to name query")]
    NoAnswers,
    #[error("no IPv4 answers to name query")]
    NoIPv4Answers,
    #[error("invalid URL")]
    InvalidUrl,
    #[error("URL scheme not supported")]
    SchemeNotSupported,
    #[error("opening TCP connection failed")]
    ConnectFailed,
    #[error("retry limit exceeded opening TCP connection")]
    ConnectTimeout,
    #[error("writing request failed")]
    WriteFailed,
    #[error("reading response failed")]
    ReadFailed,
    #[error("malformed response")]
    MalformedResponse,
    #[error("response body short: expected {expected} bytes, got {received}")]
    ShortBody { expected: usize, received: usize },
}
