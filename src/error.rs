use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Combiner,
    UpdateObserver,
    Exporter,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginKind::Combiner => write!(f, "combiner"),
            PluginKind::UpdateObserver => write!(f, "update observer"),
            PluginKind::Exporter => write!(f, "exporter"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfmErrorCode {
    Io,
    Encode,
    Decode,
    InvalidConfig,
    CombinerNotFound,
    UpdateObserverNotFound,
    ExporterNotFound,
    UnknownCodec,
    CodecMismatch,
    Corrupt,
    Combiner,
    Observer,
    Exporter,
    Conflict,
    Unavailable,
}

impl CfmErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            CfmErrorCode::Io => "io",
            CfmErrorCode::Encode => "encode",
            CfmErrorCode::Decode => "decode",
            CfmErrorCode::InvalidConfig => "invalid_config",
            CfmErrorCode::CombinerNotFound => "combiner_not_found",
            CfmErrorCode::UpdateObserverNotFound => "update_observer_not_found",
            CfmErrorCode::ExporterNotFound => "exporter_not_found",
            CfmErrorCode::UnknownCodec => "unknown_codec",
            CfmErrorCode::CodecMismatch => "codec_mismatch",
            CfmErrorCode::Corrupt => "corrupt",
            CfmErrorCode::Combiner => "combiner",
            CfmErrorCode::Observer => "observer",
            CfmErrorCode::Exporter => "exporter",
            CfmErrorCode::Conflict => "conflict",
            CfmErrorCode::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum CfmError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("{kind} '{name}' is not registered")]
    MissingPlugin { kind: PluginKind, name: String },
    #[error("unknown codec '{0}'")]
    UnknownCodec(String),
    #[error("codec mismatch: configured for {expected}, instantiated with {actual}")]
    CodecMismatch { expected: String, actual: String },
    #[error("corrupt entry: {message}")]
    Corrupt { message: String },
    #[error("combiner failed: {0}")]
    Combiner(String),
    #[error("update observer failed: {0}")]
    Observer(String),
    #[error("exporter failed: {0}")]
    Exporter(String),
    #[error("conflict error: {0}")]
    Conflict(String),
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
}

impl CfmError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        CfmError::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        CfmError::Corrupt {
            message: message.into(),
        }
    }

    pub fn code(&self) -> CfmErrorCode {
        match self {
            CfmError::Io(_) => CfmErrorCode::Io,
            CfmError::Encode(_) => CfmErrorCode::Encode,
            CfmError::Decode(_) => CfmErrorCode::Decode,
            CfmError::InvalidConfig { .. } => CfmErrorCode::InvalidConfig,
            CfmError::MissingPlugin { kind, .. } => match kind {
                PluginKind::Combiner => CfmErrorCode::CombinerNotFound,
                PluginKind::UpdateObserver => CfmErrorCode::UpdateObserverNotFound,
                PluginKind::Exporter => CfmErrorCode::ExporterNotFound,
            },
            CfmError::UnknownCodec(_) => CfmErrorCode::UnknownCodec,
            CfmError::CodecMismatch { .. } => CfmErrorCode::CodecMismatch,
            CfmError::Corrupt { .. } => CfmErrorCode::Corrupt,
            CfmError::Combiner(_) => CfmErrorCode::Combiner,
            CfmError::Observer(_) => CfmErrorCode::Observer,
            CfmError::Exporter(_) => CfmErrorCode::Exporter,
            CfmError::Conflict(_) => CfmErrorCode::Conflict,
            CfmError::Unavailable { .. } => CfmErrorCode::Unavailable,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True for errors the store resolves by re-running the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CfmError::Conflict(_))
    }
}
