use core::fmt::Display;

use thiserror::Error;

/// Failure while encoding or decoding aggregate state.
///
/// `path` is the dotted field path inside the state map (`dims.width`,
/// `tags[2]`), empty for the root.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The value at the root did not encode to (or was not) a map.
    #[error("state must be a map, found {found}")]
    NotAMap { found: &'static str },

    /// A non-optional field was absent or null.
    #[error("missing value for required field `{path}`")]
    MissingField { path: String },

    #[error("type mismatch at `{path}`: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    /// A stored enum name no longer matches any declared variant.
    #[error("unknown variant `{variant}` at `{path}`")]
    UnknownVariant { path: String, variant: String },

    #[error("number out of range at `{path}`: {value}")]
    NumberOutOfRange { path: String, value: String },

    /// Map keys must be strings, integers, booleans, chars or unit enum variants.
    #[error("invalid map key at `{path}`: {message}")]
    InvalidKey { path: String, message: String },

    /// A value had the right kind but could not be parsed (timestamp, duration, ...).
    #[error("malformed value at `{path}`: {message}")]
    Malformed { path: String, message: String },
}

impl CodecError {
    pub(crate) fn type_mismatch(expected: impl Display, found: impl Display) -> Self {
        CodecError::TypeMismatch {
            path: String::new(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub(crate) fn invalid_key(message: impl Display) -> Self {
        CodecError::InvalidKey {
            path: String::new(),
            message: message.to_string(),
        }
    }

    pub(crate) fn missing() -> Self {
        CodecError::MissingField {
            path: String::new(),
        }
    }

    /// Field path the error refers to, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            CodecError::NotAMap { .. } => None,
            CodecError::MissingField { path }
            | CodecError::TypeMismatch { path, .. }
            | CodecError::UnknownVariant { path, .. }
            | CodecError::NumberOutOfRange { path, .. }
            | CodecError::InvalidKey { path, .. }
            | CodecError::Malformed { path, .. } => Some(path),
        }
    }

    /// Prefix the path with a struct field or map key.
    pub(crate) fn at_field(self, field: &str) -> Self {
        self.prefix_path(|path| {
            if path.is_empty() {
                field.to_string()
            } else if path.starts_with('[') {
                format!("{field}{path}")
            } else {
                format!("{field}.{path}")
            }
        })
    }

    /// Prefix the path with a sequence index.
    pub(crate) fn at_index(self, index: usize) -> Self {
        self.prefix_path(|path| {
            if path.is_empty() || path.starts_with('[') {
                format!("[{index}]{path}")
            } else {
                format!("[{index}].{path}")
            }
        })
    }

    fn prefix_path(mut self, f: impl FnOnce(&str) -> String) -> Self {
        match &mut self {
            CodecError::NotAMap { .. } => {}
            CodecError::MissingField { path }
            | CodecError::TypeMismatch { path, .. }
            | CodecError::UnknownVariant { path, .. }
            | CodecError::NumberOutOfRange { path, .. }
            | CodecError::InvalidKey { path, .. }
            | CodecError::Malformed { path, .. } => {
                *path = f(path);
            }
        }
        self
    }
}

impl serde::ser::Error for CodecError {
    fn custom<T: Display>(msg: T) -> Self {
        CodecError::Malformed {
            path: String::new(),
            message: msg.to_string(),
        }
    }
}

impl serde::de::Error for CodecError {
    fn custom<T: Display>(msg: T) -> Self {
        CodecError::Malformed {
            path: String::new(),
            message: msg.to_string(),
        }
    }

    fn invalid_type(unexp: serde::de::Unexpected<'_>, exp: &dyn serde::de::Expected) -> Self {
        CodecError::type_mismatch(exp, unexp)
    }

    fn invalid_value(unexp: serde::de::Unexpected<'_>, exp: &dyn serde::de::Expected) -> Self {
        use serde::de::Unexpected;
        match unexp {
            Unexpected::Signed(_) | Unexpected::Unsigned(_) | Unexpected::Float(_) => {
                CodecError::NumberOutOfRange {
                    path: String::new(),
                    value: format!("{unexp}, expected {exp}"),
                }
            }
            _ => CodecError::Malformed {
                path: String::new(),
                message: format!("invalid value: {unexp}, expected {exp}"),
            },
        }
    }

    fn unknown_variant(variant: &str, _expected: &'static [&'static str]) -> Self {
        CodecError::UnknownVariant {
            path: String::new(),
            variant: variant.to_string(),
        }
    }

    fn missing_field(field: &'static str) -> Self {
        CodecError::MissingField {
            path: field.to_string(),
        }
    }
}
