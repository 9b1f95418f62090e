use statrpc_protocol::ErrorCode;
use std::fmt;
use std::io;

/// Error kinds understood by file-system consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemProviderErrorCode {
    FileNotFound,
    FileExists,
    FileIsADirectory,
    FileNotADirectory,
    NoPermissions,
    /// The bridge or sandbox could not be reached.
    Unavailable,
    Unknown,
}

impl FileSystemProviderErrorCode {
    pub fn from_native(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::NotFound => Self::FileNotFound,
            ErrorCode::AlreadyExists => Self::FileExists,
            ErrorCode::IsADirectory => Self::FileIsADirectory,
            ErrorCode::NotADirectory => Self::FileNotADirectory,
            ErrorCode::PermissionDenied => Self::NoPermissions,
            ErrorCode::Other(_) => Self::Unknown,
        }
    }
}

impl fmt::Display for FileSystemProviderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FileNotFound => "FileNotFound",
            Self::FileExists => "FileExists",
            Self::FileIsADirectory => "FileIsADirectory",
            Self::FileNotADirectory => "FileNotADirectory",
            Self::NoPermissions => "NoPermissions",
            Self::Unavailable => "Unavailable",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Failure of a [`FileSystemProvider`](crate::FileSystemProvider) operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({code})")]
pub struct FileSystemProviderError {
    pub code: FileSystemProviderErrorCode,
    pub message: String,
}

impl FileSystemProviderError {
    pub fn new(code: FileSystemProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FileSystemProviderErrorCode::FileNotFound, message)
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(FileSystemProviderErrorCode::FileExists, message)
    }

    pub fn is_a_directory(message: impl Into<String>) -> Self {
        Self::new(FileSystemProviderErrorCode::FileIsADirectory, message)
    }

    pub fn no_permissions(message: impl Into<String>) -> Self {
        Self::new(FileSystemProviderErrorCode::NoPermissions, message)
    }
}

impl From<statrpc_core::Error> for FileSystemProviderError {
    fn from(err: statrpc_core::Error) -> Self {
        use statrpc_core::Error;

        let code = match &err {
            Error::Remote(payload) => FileSystemProviderErrorCode::from_native(&payload.code),
            Error::Disposed | Error::Timeout(_) | Error::Io(_) => {
                FileSystemProviderErrorCode::Unavailable
            }
            _ => FileSystemProviderErrorCode::Unknown,
        };
        Self::new(code, err.to_string())
    }
}

impl From<io::Error> for FileSystemProviderError {
    fn from(err: io::Error) -> Self {
        let code = FileSystemProviderErrorCode::from_native(&ErrorCode::from_io(&err));
        Self::new(code, err.to_string())
    }
}
