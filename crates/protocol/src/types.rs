use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io;

/// Kind of a filesystem object, as seen by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    /// Anything else, including the target of a dangling symbolic link.
    Unknown,
}

/// Permission restriction reported for an object.
///
/// Absence means no restriction is signaled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// The owner-write bit is clear.
    Locked,
}

/// Metadata for a single path, returned by the `stat` method.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatRecord {
    /// Creation time in milliseconds since the Unix epoch.
    pub ctime: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permission>,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub is_symlink: bool,
}

impl StatRecord {
    pub fn is_locked(&self) -> bool {
        self.permissions == Some(Permission::Locked)
    }
}

/// A directory entry returned by the `readdir` method.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub is_symlink: bool,
}

/// Parameters shared by every backend method.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PathParams {
    pub path: String,
}

impl PathParams {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExistsResult {
    pub exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReaddirResult {
    pub result: Vec<DirEntry>,
}

/// Error kinds carried in error responses, keyed by native errno name.
#[derive(Debug, Clone, Serialize, Deserialize, Hash, Eq, PartialEq)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    NotFound,
    NotADirectory,
    IsADirectory,
    AlreadyExists,
    PermissionDenied,
    /// Any other native error, by errno name (e.g. `ELOOP`).
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NotFound => "ENOENT",
            Self::NotADirectory => "ENOTDIR",
            Self::IsADirectory => "EISDIR",
            Self::AlreadyExists => "EEXIST",
            Self::PermissionDenied => "EACCES",
            Self::Other(name) => name,
        }
    }

    pub fn from_errno_name(name: &str) -> Self {
        match name {
            "ENOENT" => Self::NotFound,
            "ENOTDIR" => Self::NotADirectory,
            "EISDIR" => Self::IsADirectory,
            "EEXIST" => Self::AlreadyExists,
            "EACCES" | "EPERM" => Self::PermissionDenied,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn from_errno(errno: Errno) -> Self {
        Self::from_errno_name(&format!("{:?}", errno))
    }

    /// Classifies an I/O error, preferring the raw OS error when present.
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(raw) = err.raw_os_error() {
            return Self::from_errno(Errno::from_raw(raw));
        }
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::NotADirectory => Self::NotADirectory,
            io::ErrorKind::IsADirectory => Self::IsADirectory,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Other("UNKNOWN".to_string()),
        }
    }
}

impl From<String> for ErrorCode {
    fn from(name: String) -> Self {
        Self::from_errno_name(&name)
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured value placed in a response's `error` field.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn from_io(err: &io::Error) -> Self {
        Self::new(ErrorCode::from_io(err), err.to_string())
    }

    /// Interprets whatever the peer put in an `error` field.
    ///
    /// A bare string is taken as an errno name; an object is expected to carry
    /// a `code`. Anything else is kept verbatim as the message.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(code) => Self {
                code: ErrorCode::from(code),
                message: None,
            },
            Value::Object(_) => match serde_json::from_value::<ErrorPayload>(value.clone()) {
                Ok(payload) => payload,
                Err(_) => Self::new(ErrorCode::Other("UNKNOWN".to_string()), value.to_string()),
            },
            other => Self::new(ErrorCode::Other("UNKNOWN".to_string()), other.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.code.to_string()))
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod stat_record {
        use super::*;

        #[test]
        fn uses_wire_field_names() {
            let record = StatRecord {
                ctime: 1,
                mtime: 2,
                size: 10,
                permissions: None,
                kind: FileKind::File,
                is_symlink: false,
            };
            let value = serde_json::to_value(&record).unwrap();
            assert_eq!(
                value,
                json!({"ctime": 1, "mtime": 2, "size": 10, "type": "file", "isSymlink": false})
            );
        }

        #[test]
        fn locked_permission_serializes() {
            let record = StatRecord {
                ctime: 0,
                mtime: 0,
                size: 0,
                permissions: Some(Permission::Locked),
                kind: FileKind::Directory,
                is_symlink: true,
            };
            let value = serde_json::to_value(&record).unwrap();
            assert_eq!(value["permissions"], "locked");
            assert_eq!(value["type"], "directory");
            assert!(record.is_locked());
        }
    }

    mod dir_entry {
        use super::*;

        #[test]
        fn deserializes_unknown_kind() {
            let entry: DirEntry =
                serde_json::from_value(json!({"name": "link", "type": "unknown", "isSymlink": true}))
                    .unwrap();
            assert_eq!(entry.kind, FileKind::Unknown);
            assert!(entry.is_symlink);
        }
    }

    mod error_code {
        use super::*;

        #[test]
        fn maps_known_errno_names() {
            assert_eq!(ErrorCode::from_errno_name("ENOENT"), ErrorCode::NotFound);
            assert_eq!(ErrorCode::from_errno_name("ENOTDIR"), ErrorCode::NotADirectory);
            assert_eq!(ErrorCode::from_errno_name("EPERM"), ErrorCode::PermissionDenied);
            assert_eq!(
                ErrorCode::from_errno_name("ELOOP"),
                ErrorCode::Other("ELOOP".to_string())
            );
        }

        #[test]
        fn from_raw_os_error() {
            let err = io::Error::from_raw_os_error(Errno::ENOTDIR as i32);
            assert_eq!(ErrorCode::from_io(&err), ErrorCode::NotADirectory);
        }

        #[test]
        fn from_error_kind() {
            let err = io::Error::new(io::ErrorKind::AlreadyExists, "exists");
            assert_eq!(ErrorCode::from_io(&err), ErrorCode::AlreadyExists);
        }

        #[test]
        fn serializes_as_string() {
            assert_eq!(serde_json::to_value(ErrorCode::IsADirectory).unwrap(), json!("EISDIR"));
        }
    }

    mod error_payload {
        use super::*;

        #[test]
        fn from_string_value() {
            let payload = ErrorPayload::from_value(json!("ENOENT"));
            assert_eq!(payload.code, ErrorCode::NotFound);
            assert_eq!(payload.message, None);
        }

        #[test]
        fn from_object_value_ignores_extra_fields() {
            let payload = ErrorPayload::from_value(
                json!({"code": "ENOTDIR", "errno": -20, "syscall": "scandir"}),
            );
            assert_eq!(payload.code, ErrorCode::NotADirectory);
        }

        #[test]
        fn from_unstructured_value() {
            let payload = ErrorPayload::from_value(json!(42));
            assert_eq!(payload.code, ErrorCode::Other("UNKNOWN".to_string()));
            assert_eq!(payload.message.as_deref(), Some("42"));
        }

        #[test]
        fn display_includes_message() {
            let payload = ErrorPayload::new(ErrorCode::NotFound, "no such file");
            assert_eq!(payload.to_string(), "ENOENT: no such file");
        }
    }
}
