//! Error types for the web-seed engine
//!
//! This module defines the error values produced by metainfo parsing,
//! the storage backend and the HTTP mirror paths.

use std::fmt;

/// Error type for storage and web-seed operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Metainfo or wire-format parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Local file I/O and external storage provider errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// HTTP mirror errors (connection, status, malformed response)
    MirrorError {
        message: String,
        url: Option<String>,
        status: Option<u16>,
        retryable: bool,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new retryable MirrorError
    pub fn mirror_error(message: impl Into<String>, url: impl Into<String>) -> Self {
        TorrentError::MirrorError {
            message: message.into(),
            url: Some(url.into()),
            status: None,
            retryable: true,
        }
    }

    /// Create a MirrorError from an unexpected HTTP status.
    ///
    /// 403 and 404 look permanent, everything else is reported as retryable.
    /// The engine quarantines both kinds the same way.
    pub fn mirror_error_with_status(message: impl Into<String>, url: impl Into<String>, status: u16) -> Self {
        TorrentError::MirrorError {
            message: message.into(),
            url: Some(url.into()),
            status: Some(status),
            retryable: !matches!(status, 403 | 404),
        }
    }

    /// Create a MirrorError for a response the decoder could not make sense of
    pub fn malformed_response(message: impl Into<String>, url: impl Into<String>) -> Self {
        TorrentError::MirrorError {
            message: message.into(),
            url: Some(url.into()),
            status: None,
            retryable: false,
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// True for errors raised by a mirror rather than by local storage
    pub fn is_mirror_error(&self) -> bool {
        matches!(self, TorrentError::MirrorError { .. })
    }

    /// True for errors raised by the storage backend
    pub fn is_storage_error(&self) -> bool {
        matches!(self, TorrentError::StorageError { .. })
    }

    /// Attach a URL to a MirrorError that was created without one
    pub fn with_url(mut self, new_url: impl Into<String>) -> Self {
        if let TorrentError::MirrorError { url, .. } = &mut self {
            if url.is_none() {
                *url = Some(new_url.into());
            }
        }
        self
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::ParseError { source, .. } | TorrentError::StorageError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            TorrentError::MirrorError { message, .. } => {
                *message = format!("{}: {}", message, ctx);
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            TorrentError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            TorrentError::MirrorError { message, url, status, .. } => {
                match (url, status) {
                    (Some(u), Some(s)) => write!(f, "Mirror error: {} (url: {}, status: {})", message, u, s),
                    (Some(u), None) => write!(f, "Mirror error: {} (url: {})", message, u),
                    (None, Some(s)) => write!(f, "Mirror error: {} (status: {})", message, s),
                    (None, None) => write!(f, "Mirror error: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to parse bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::config_error(format!("Failed to parse JSON data: {}", err))
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::validation_error_with_field(format!("Invalid mirror URL: {}", err), "url")
    }
}

#[cfg(feature = "download")]
impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string());
        match err.status() {
            Some(status) => TorrentError::MirrorError {
                message: err.to_string(),
                url,
                status: Some(status.as_u16()),
                retryable: !matches!(status.as_u16(), 403 | 404),
            },
            None => TorrentError::MirrorError {
                message: err.to_string(),
                url,
                status: None,
                retryable: true,
            },
        }
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::MirrorError {
            message: "Read timed out".to_string(),
            url: None,
            status: None,
            retryable: true,
        }
    }
}
