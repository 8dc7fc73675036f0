use std::io;
use std::net;
use std::num::ParseIntError;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [Error], mirroring the engine's public
/// error codes. Synchronous misuse maps to [ErrorKind::Invalid] or
/// [ErrorKind::BufferTooSmall]; runtime/protocol failures map to
/// [ErrorKind::Failure]; lookups of valid-looking but absent resources map
/// to [ErrorKind::Unavailable].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-range input, unknown identifier
    Invalid,
    /// Resource not found for a valid-looking identifier
    Unavailable,
    /// Runtime or protocol error
    Failure,
    /// Output would not fit caller-provided storage; retry with a larger
    /// buffer (the required size is discoverable via the size queries)
    BufferTooSmall,
}

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    // Wire codec
    #[error("unexpected end of buffer: (expected: {expected}, actual: {actual})")]
    UnexpectedEndOfBuffer { expected: usize, actual: usize },
    #[error("short packet")]
    ErrShortPacket,
    #[error("packet too big")]
    ErrPacketTooBig,
    #[error("invalid message type {0}")]
    InvalidMessageType(u8),
    #[error("invalid chunk type {0}")]
    InvalidChunkType(u8),
    #[error("invalid payload kind {0}")]
    InvalidPayloadKind(u8),
    #[error("invalid packet version {0}")]
    InvalidPacketVersion(u8),
    #[error("invalid secure record")]
    ErrInvalidSecureRecord,

    // Connection
    #[error("connection closed")]
    ErrConnectionClosed,
    #[error("connection not closed")]
    ErrConnectionNotClosed,
    #[error("no remote description")]
    ErrNoRemoteDescription,
    #[error("incorrect signaling state")]
    ErrIncorrectSignalingState,
    #[error("invalid session description kind")]
    ErrInvalidDescriptionKind,
    #[error("invalid remote candidate")]
    ErrInvalidRemoteCandidate,

    // Secure transport
    #[error("secure transport not started")]
    ErrSecureTransportNotStarted,
    #[error("secure transport closed")]
    ErrSecureTransportClosed,
    #[error("handshake timed out")]
    ErrHandshakeTimeout,
    #[error("handshake failed: {0}")]
    ErrHandshakeFailed(String),
    #[error("keying material unavailable before handshake completion")]
    ErrKeyingMaterialUnavailable,

    // Association / streams
    #[error("association not established")]
    ErrAssociationNotEstablished,
    #[error("association closed")]
    ErrAssociationClosed,
    #[error("association init collision")]
    ErrAssociationInitCollision,
    #[error("association retransmit attempts exhausted")]
    ErrRetransmitsExhausted,
    #[error("stream {0} not found")]
    ErrStreamNotFound(u16),
    #[error("stream {0} already exists")]
    ErrStreamAlreadyExists(u16),
    #[error("stream identifiers exhausted")]
    ErrStreamIdsExhausted,
    #[error("outbound packet larger than maximum message size")]
    ErrOutboundPacketTooLarge,
    #[error("send buffer ceiling exceeded")]
    ErrSendBufferFull,
    #[error("ordered receive queue limit exceeded")]
    ErrReceiveQueueFull,

    // Channels
    #[error("channel closed")]
    ErrChannelClosed,
    #[error("channel {0} not found")]
    ErrChannelNotFound(u16),
    #[error("channel protocol string too large")]
    ErrProtocolTooLarge,
    #[error("both max retransmits and max lifetime were set")]
    ErrRetransmitsOrLifetime,

    // Tracks
    #[error("track {0} not found")]
    ErrTrackNotFound(u32),
    #[error("track has no packetizer")]
    ErrNoPacketizer,
    #[error("track has no reporting session")]
    ErrNoReportingSession,
    #[error("clock rate must not be zero")]
    ErrZeroClockRate,
    #[error("sample does not contain a valid unit")]
    ErrInvalidSampleFraming,

    // Caller-provided storage
    #[error("buffer too small: (required: {required}, provided: {provided})")]
    ErrBufferTooSmall { required: usize, provided: usize },

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse ip: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("utf8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ErrBufferTooSmall { .. } => ErrorKind::BufferTooSmall,

            Error::ErrChannelNotFound(_)
            | Error::ErrTrackNotFound(_)
            | Error::ErrStreamNotFound(_)
            | Error::ErrNoPacketizer
            | Error::ErrNoReportingSession => ErrorKind::Unavailable,

            Error::UnexpectedEndOfBuffer { .. }
            | Error::ErrShortPacket
            | Error::InvalidMessageType(_)
            | Error::InvalidChunkType(_)
            | Error::InvalidPayloadKind(_)
            | Error::InvalidPacketVersion(_)
            | Error::ErrNoRemoteDescription
            | Error::ErrIncorrectSignalingState
            | Error::ErrInvalidDescriptionKind
            | Error::ErrInvalidRemoteCandidate
            | Error::ErrConnectionNotClosed
            | Error::ErrChannelClosed
            | Error::ErrStreamAlreadyExists(_)
            | Error::ErrProtocolTooLarge
            | Error::ErrRetransmitsOrLifetime
            | Error::ErrZeroClockRate
            | Error::ErrInvalidSampleFraming
            | Error::ParseInt(_)
            | Error::ParseIp(_)
            | Error::Utf8(_) => ErrorKind::Invalid,

            _ => ErrorKind::Failure,
        }
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(
            Error::ErrBufferTooSmall {
                required: 8,
                provided: 4
            }
            .kind(),
            ErrorKind::BufferTooSmall
        );
        assert_eq!(Error::ErrChannelNotFound(5).kind(), ErrorKind::Unavailable);
        assert_eq!(Error::ErrShortPacket.kind(), ErrorKind::Invalid);
        assert_eq!(
            Error::ErrHandshakeFailed("bad verify".into()).kind(),
            ErrorKind::Failure
        );
        assert_eq!(Error::ErrSendBufferFull.kind(), ErrorKind::Failure);
    }
}
