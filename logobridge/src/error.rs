use crate::types::VariableKind;

/// Errors that occur while talking to the controller
///
/// Every variant is recoverable: the poller skips the current cycle and the
/// bridge drops the current write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HardwareError {
    /// I/O error on the underlying stream
    Io(std::io::ErrorKind),
    /// The controller did not respond within the configured timeout
    ResponseTimeout,
    /// Received a frame that could not be parsed at the TPKT/COTP layer
    BadFrame(FrameError),
    /// Received an S7 response that could not be interpreted
    BadResponse(ResponseError),
    /// The controller answered the request with an error return code
    Rejected(u8),
    /// The request could not be encoded into a single frame
    BadRequest,
    /// The requested block lies outside of the addressable memory
    OutOfRange {
        /// first address of the request
        start: u16,
        /// number of bytes requested
        count: usize,
    },
    /// No connection to the controller could be established
    NoConnection,
    /// The session task has shut down
    Shutdown,
}

impl HardwareError {
    /// true if the connection must be closed and re-opened on the next request
    pub(crate) fn is_connection_fatal(&self) -> bool {
        match self {
            HardwareError::Io(_) => true,
            HardwareError::ResponseTimeout => true,
            HardwareError::BadFrame(_) => true,
            HardwareError::BadResponse(_) => true,
            HardwareError::NoConnection => true,
            HardwareError::Rejected(_) => false,
            HardwareError::BadRequest => false,
            HardwareError::OutOfRange { .. } => false,
            HardwareError::Shutdown => false,
        }
    }
}

impl std::error::Error for HardwareError {}

impl std::fmt::Display for HardwareError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HardwareError::Io(kind) => write!(f, "I/O error: {kind}"),
            HardwareError::ResponseTimeout => {
                f.write_str("timeout occurred before receiving a response from the controller")
            }
            HardwareError::BadFrame(err) => write!(f, "bad frame: {err}"),
            HardwareError::BadResponse(err) => write!(f, "bad response: {err}"),
            HardwareError::Rejected(code) => {
                write!(f, "controller rejected the request with return code {code:#04X}")
            }
            HardwareError::BadRequest => f.write_str("request does not fit into a single frame"),
            HardwareError::OutOfRange { start, count } => write!(
                f,
                "block of {count} byte(s) at address {start} exceeds the controller memory"
            ),
            HardwareError::NoConnection => f.write_str("no connection exists to the controller"),
            HardwareError::Shutdown => f.write_str("the hardware session has shut down"),
        }
    }
}

impl From<std::io::Error> for HardwareError {
    fn from(err: std::io::Error) -> Self {
        HardwareError::Io(err.kind())
    }
}

impl From<FrameError> for HardwareError {
    fn from(err: FrameError) -> Self {
        HardwareError::BadFrame(err)
    }
}

impl From<ResponseError> for HardwareError {
    fn from(err: ResponseError) -> Self {
        HardwareError::BadResponse(err)
    }
}

impl From<scursor::ReadError> for HardwareError {
    fn from(_: scursor::ReadError) -> Self {
        HardwareError::BadResponse(ResponseError::InsufficientBytes)
    }
}

impl From<scursor::TrailingBytes> for HardwareError {
    fn from(err: scursor::TrailingBytes) -> Self {
        HardwareError::BadResponse(ResponseError::TrailingBytes(err.count.into()))
    }
}

impl From<scursor::WriteError> for HardwareError {
    fn from(_: scursor::WriteError) -> Self {
        HardwareError::BadRequest
    }
}

impl From<tokio::time::error::Elapsed> for HardwareError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        HardwareError::ResponseTimeout
    }
}

/// Errors that occur while parsing a TPKT/COTP frame off the stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// TPKT header with a version other than 3
    UnknownTpktVersion(u8),
    /// TPKT length that is smaller than the header or larger than the buffer
    BadTpktLength(usize),
    /// COTP PDU type that was not expected at this point
    UnexpectedCotpType(u8),
    /// COTP header length that exceeds the frame
    BadCotpLength(u8),
}

impl std::error::Error for FrameError {}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FrameError::UnknownTpktVersion(version) => {
                write!(f, "received TPKT frame with unknown version: {version}")
            }
            FrameError::BadTpktLength(length) => {
                write!(f, "received TPKT frame with invalid length: {length}")
            }
            FrameError::UnexpectedCotpType(kind) => {
                write!(f, "received unexpected COTP PDU type: {kind:#04X}")
            }
            FrameError::BadCotpLength(length) => {
                write!(f, "COTP header length {length} exceeds the frame")
            }
        }
    }
}

/// Errors that occur while interpreting an S7 response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseError {
    /// response is too short to be valid
    InsufficientBytes,
    /// response contains extra trailing bytes
    TrailingBytes(usize),
    /// S7 protocol id other than 0x32
    UnknownProtocolId(u8),
    /// message type other than ack-data
    UnexpectedMessageType(u8),
    /// PDU reference does not match the request
    PduReferenceMismatch(u16, u16),
    /// error class and code reported in the header
    HeaderError(u8, u8),
    /// parameter function does not match the request
    UnexpectedFunction(u8),
    /// response does not contain exactly one item
    ItemCount(u8),
    /// number of data bytes does not match the request
    LengthMismatch(usize, usize),
}

impl std::error::Error for ResponseError {}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResponseError::InsufficientBytes => f.write_str("response is too short to be valid"),
            ResponseError::TrailingBytes(count) => {
                write!(f, "response contains {count} extra trailing bytes")
            }
            ResponseError::UnknownProtocolId(id) => {
                write!(f, "unknown S7 protocol id: {id:#04X}")
            }
            ResponseError::UnexpectedMessageType(kind) => {
                write!(f, "unexpected S7 message type: {kind:#04X}")
            }
            ResponseError::PduReferenceMismatch(expected, actual) => write!(
                f,
                "received PDU reference {actual} while expecting {expected}"
            ),
            ResponseError::HeaderError(class, code) => {
                write!(f, "error class {class:#04X} with code {code:#04X}")
            }
            ResponseError::UnexpectedFunction(function) => {
                write!(f, "unexpected S7 function: {function:#04X}")
            }
            ResponseError::ItemCount(count) => {
                write!(f, "expected a single item but received {count}")
            }
            ResponseError::LengthMismatch(expected, actual) => write!(
                f,
                "expected {expected} data byte(s) but received {actual}"
            ),
        }
    }
}

/// Error returned when a textual or binary payload cannot be converted to a value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FormatError {
    /// payload is not valid UTF-8
    NotUtf8,
    /// text does not parse as the expected kind
    NotANumber {
        /// expected kind
        kind: VariableKind,
        /// offending text
        text: String,
    },
    /// value does not fit the width of the kind
    OutOfRange {
        /// expected kind
        kind: VariableKind,
        /// offending text
        text: String,
    },
    /// binary slice has the wrong number of bytes for the kind
    WrongWidth {
        /// expected number of bytes
        expected: usize,
        /// actual number of bytes
        actual: usize,
    },
}

impl std::error::Error for FormatError {}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FormatError::NotUtf8 => f.write_str("payload is not valid UTF-8"),
            FormatError::NotANumber { kind, text } => {
                write!(f, "cannot parse '{text}' as {kind}")
            }
            FormatError::OutOfRange { kind, text } => {
                write!(f, "'{text}' is out of range for {kind}")
            }
            FormatError::WrongWidth { expected, actual } => {
                write!(f, "expected {expected} byte(s) but got {actual}")
            }
        }
    }
}

/// Error returned when a typed variable cannot be constructed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidVariable {
    /// bit offset outside of 0..=7
    BitOffset(u8),
    /// a bit variable was specified without a bit offset
    MissingBitOffset,
    /// a bit offset was specified for a non-bit variable
    UnexpectedBitOffset,
    /// the variable extends past the last addressable byte
    AddressOverflow(u16),
}

impl std::error::Error for InvalidVariable {}

impl std::fmt::Display for InvalidVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InvalidVariable::BitOffset(bit) => write!(f, "bit offset {bit} should be 0..7"),
            InvalidVariable::MissingBitOffset => f.write_str("bit variable requires a bit offset"),
            InvalidVariable::UnexpectedBitOffset => {
                f.write_str("only bit variables may specify a bit offset")
            }
            InvalidVariable::AddressOverflow(address) => write!(
                f,
                "variable at {address} extends past the end of the controller memory"
            ),
        }
    }
}

/// Error returned when a memory range cannot be constructed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidRange {
    /// end is not after start
    EndNotAfterStart(u16, u16),
    /// end is past the last addressable byte
    EndOutOfBounds(u16),
}

impl std::error::Error for InvalidRange {}

impl std::fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InvalidRange::EndNotAfterStart(start, end) => {
                write!(f, "range end ({end}) should be after its start ({start})")
            }
            InvalidRange::EndOutOfBounds(end) => write!(
                f,
                "range end ({end}) should be 0..{}",
                crate::types::MAX_ADDRESS
            ),
        }
    }
}

/// Errors returned by the variable registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// the variable does not lie fully inside any registered memory range
    OutsideOfRanges(u16),
    /// the handle does not refer to a registered variable
    UnknownHandle,
}

impl std::error::Error for RegistryError {}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RegistryError::OutsideOfRanges(address) => write!(
                f,
                "variable at {address} is not covered by any polled memory range"
            ),
            RegistryError::UnknownHandle => f.write_str("unknown variable handle"),
        }
    }
}

/// Errors returned by the messaging transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// the client has been disconnected
    Disconnected,
    /// any other error reported by the client
    Client(String),
}

impl std::error::Error for TransportError {}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransportError::Disconnected => f.write_str("transport is disconnected"),
            TransportError::Client(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

/// Error a change listener may return; it is logged by the registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerError {
    /// publishing the new value failed
    Publish {
        /// topic of the publication
        topic: String,
        /// error reported by the transport
        error: TransportError,
    },
    /// any other failure
    Other(String),
}

impl std::error::Error for ListenerError {}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ListenerError::Publish { topic, error } => {
                write!(f, "unable to publish on '{topic}': {error}")
            }
            ListenerError::Other(msg) => f.write_str(msg),
        }
    }
}

/// Errors in the configuration document
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// the file could not be read
    Io(std::io::ErrorKind),
    /// the document is not valid JSON for the configuration schema
    Parse(String),
    /// a field holds an invalid value
    Invalid {
        /// name of the offending field
        field: &'static str,
        /// offending value as text
        value: String,
        /// what is expected instead
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        field: &'static str,
        value: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        ConfigError::Invalid {
            field,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::error::Error for ConfigError {}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConfigError::Io(kind) => write!(f, "unable to read configuration: {kind}"),
            ConfigError::Parse(msg) => write!(f, "unable to parse configuration: {msg}"),
            ConfigError::Invalid {
                field,
                value,
                reason,
            } => write!(f, "{field}: '{value}' {reason}"),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err.kind())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// Errors that prevent the engine from starting
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartError {
    /// configuration is invalid
    Config(ConfigError),
    /// a binding could not be registered
    Registry(RegistryError),
    /// the transport could not be set up
    Transport(TransportError),
}

impl std::error::Error for StartError {}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StartError::Config(err) => write!(f, "{err}"),
            StartError::Registry(err) => write!(f, "{err}"),
            StartError::Transport(err) => write!(f, "{err}"),
        }
    }
}

impl From<ConfigError> for StartError {
    fn from(err: ConfigError) -> Self {
        StartError::Config(err)
    }
}

impl From<RegistryError> for StartError {
    fn from(err: RegistryError) -> Self {
        StartError::Registry(err)
    }
}

impl From<TransportError> for StartError {
    fn from(err: TransportError) -> Self {
        StartError::Transport(err)
    }
}
