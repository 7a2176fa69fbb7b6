//! Error types for SlotStore operations
//!
//! Every failure surfaces as a `SlotError` variant carrying enough context
//! (file, offset, key, index field) to diagnose a shared store from any of
//! the processes attached to it.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Which hash index a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// The mandatory primary key index
    Primary,
    /// The optional secondary key index
    Secondary,
}

impl TryFrom<usize> for Field {
    type Error = SlotError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Field::Primary),
            1 => Ok(Field::Secondary),
            other => Err(SlotError::InvalidParameter {
                reason: format!("field index {} out of range, expected 0 or 1", other),
            }),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Primary => write!(f, "primary"),
            Field::Secondary => write!(f, "secondary"),
        }
    }
}

/// SlotStore error types with detailed context
#[derive(Debug, Clone)]
pub enum SlotError {
    /// A caller-supplied argument was rejected before any mutation began
    InvalidParameter {
        /// Which bound was violated
        reason: String,
    },

    /// The key is already bound in the given index
    KeyExists {
        /// Index that refused the binding
        field: Field,
        /// The duplicate key
        key: Vec<u8>,
    },

    /// The key is not bound in the given index
    KeyNotFound {
        /// Index that was searched
        field: Field,
        /// The missing key
        key: Vec<u8>,
    },

    /// The free list is exhausted
    NoSpace {
        /// Fixed slot capacity of the arena
        capacity: u32,
    },

    /// An operation was attempted before `initialize()` succeeded
    NotInitialized,

    /// I/O operation on a backing file failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Mapping a backing file into memory failed
    Mapping {
        /// File that could not be mapped
        path: PathBuf,
        /// Description of the failure
        message: String,
    },

    /// Acquiring or releasing the process-shared lock failed
    Lock {
        /// Lock file involved
        path: PathBuf,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A persisted header or structure failed validation
    Corrupted {
        /// File holding the damaged structure
        path: PathBuf,
        /// Byte offset of the damaged field
        offset: u64,
        /// Description of the damage
        reason: String,
    },

    /// Persisted geometry differs from the configured geometry
    HeaderMismatch {
        /// File whose header disagrees
        path: PathBuf,
        /// Name of the disagreeing field
        field: &'static str,
        /// Value stored in the file
        persisted: u64,
        /// Value requested by the configuration
        configured: u64,
    },
}

impl SlotError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        SlotError::InvalidParameter { reason: reason.into() }
    }

    pub(crate) fn io(path: &std::path::Path, err: std::io::Error, what: &str) -> Self {
        SlotError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotError::InvalidParameter { reason } => {
                write!(f, "Invalid parameter: {}", reason)
            }

            SlotError::KeyExists { field, key } => {
                write!(f, "Key {:?} already exists in {} index", String::from_utf8_lossy(key), field)
            }

            SlotError::KeyNotFound { field, key } => {
                write!(f, "Key {:?} not found in {} index", String::from_utf8_lossy(key), field)
            }

            SlotError::NoSpace { capacity } => {
                write!(f, "No free record slot (capacity {})", capacity)
            }

            SlotError::NotInitialized => write!(f, "Store is not initialized"),

            SlotError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            SlotError::Mapping { path, message } => {
                write!(f, "Failed to map {}: {}", path.display(), message)
            }

            SlotError::Lock { path, kind, message } => {
                write!(f, "Lock error on {}: {} ({})", path.display(), message, kind)
            }

            SlotError::Corrupted { path, offset, reason } => {
                write!(f, "Corrupted structure in {} at offset {}: {}", path.display(), offset, reason)
            }

            SlotError::HeaderMismatch { path, field, persisted, configured } => {
                write!(f, "Header mismatch in {}: {} is {} on disk but configured as {}",
                       path.display(), field, persisted, configured)
            }
        }
    }
}

impl Error for SlotError {}

/// Convert std::io::Error to SlotError::Io
impl From<std::io::Error> for SlotError {
    fn from(err: std::io::Error) -> Self {
        SlotError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for SlotStore operations
pub type SlotResult<T> = Result<T, SlotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SlotError::HeaderMismatch {
            path: PathBuf::from("/tmp/quotes_records.dat"),
            field: "max_record_size",
            persisted: 256,
            configured: 128,
        };

        let display = format!("{}", err);
        assert!(display.contains("max_record_size"));
        assert!(display.contains("256"));
        assert!(display.contains("128"));
    }

    #[test]
    fn test_key_exists_names_index() {
        let err = SlotError::KeyExists { field: Field::Secondary, key: b"X".to_vec() };
        assert!(err.to_string().contains("secondary"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let slot_err: SlotError = io_err.into();

        match slot_err {
            SlotError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_field_from_index() {
        assert_eq!(Field::try_from(0).unwrap(), Field::Primary);
        assert_eq!(Field::try_from(1).unwrap(), Field::Secondary);
        assert!(matches!(Field::try_from(2), Err(SlotError::InvalidParameter { .. })));
    }
}
