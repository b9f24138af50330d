use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTCError(#[from] webrtc::error::Error),
    #[error("transport error: {0}, {1}")]
    TransportError(String, TransportErrorKind),
    #[error("viewer error: {0}, {1}")]
    ViewerError(String, ViewerErrorKind),
    #[error("transcoder error: {0}, {1}")]
    TranscoderError(String, TranscoderErrorKind),
    #[error("signaling error: {0}, {1}")]
    SignalingError(String, SignalingErrorKind),
    #[error("config error: {0}, {1}")]
    ConfigError(String, ConfigErrorKind),
}

#[derive(Debug)]
pub enum TransportErrorKind {
    LocalDescriptionError,
    RemoteDescriptionError,
    CandidateError,
    SignalingStateInvalidError,
}

#[derive(Debug)]
pub enum ViewerErrorKind {
    NotFoundError,
    ClosedError,
    TrackError,
}

#[derive(Debug)]
pub enum TranscoderErrorKind {
    BinaryMissingError,
    SpawnFailedError,
    StreamClosedError,
}

#[derive(Debug)]
pub enum SignalingErrorKind {
    ConnectionError,
    SendError,
    MessageParseError,
}

#[derive(Debug)]
pub enum ConfigErrorKind {
    MissingValueError,
    InvalidValueError,
}

impl Error {
    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(message, kind)
    }

    pub fn new_viewer(message: String, kind: ViewerErrorKind) -> Error {
        Error::ViewerError(message, kind)
    }

    pub fn new_transcoder(message: String, kind: TranscoderErrorKind) -> Error {
        Error::TranscoderError(message, kind)
    }

    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Error {
        Error::SignalingError(message, kind)
    }

    pub fn new_config(message: String, kind: ConfigErrorKind) -> Error {
        Error::ConfigError(message, kind)
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for ViewerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for TranscoderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for SignalingErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
