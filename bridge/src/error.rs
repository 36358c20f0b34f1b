use bson::{doc, Document};
use thiserror::Error;

/// Error codes shared with the document database protocol, with their
/// `codeName` strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    FailedToParse,
    Unauthorized,
    TypeMismatch,
    IllegalOperation,
    UserNotFound,
    ImmutableField,
    InvalidNamespace,
    ConflictingUpdateOperators,
    DollarPrefixedFieldName,
    EmptyFieldName,
    CommandNotFound,
    CommandFailed,
    NoSuchKey,
    Location15974,
    Location15975,
    Location17419,
    Location17420,
    Location40352,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::FailedToParse => 9,
            ErrorCode::Unauthorized => 13,
            ErrorCode::TypeMismatch => 14,
            ErrorCode::IllegalOperation => 20,
            ErrorCode::UserNotFound => 11,
            ErrorCode::ImmutableField => 66,
            ErrorCode::InvalidNamespace => 73,
            ErrorCode::ConflictingUpdateOperators => 40,
            ErrorCode::DollarPrefixedFieldName => 52,
            ErrorCode::EmptyFieldName => 56,
            ErrorCode::CommandNotFound => 59,
            ErrorCode::CommandFailed => 125,
            ErrorCode::NoSuchKey => 4,
            ErrorCode::Location15974 => 15974,
            ErrorCode::Location15975 => 15975,
            ErrorCode::Location17419 => 17419,
            ErrorCode::Location17420 => 17420,
            ErrorCode::Location40352 => 40352,
        }
    }

    pub fn code_name(&self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::FailedToParse => "FailedToParse",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::IllegalOperation => "IllegalOperation",
            ErrorCode::UserNotFound => "UserNotFound",
            ErrorCode::ImmutableField => "ImmutableField",
            ErrorCode::InvalidNamespace => "InvalidNamespace",
            ErrorCode::ConflictingUpdateOperators => "ConflictingUpdateOperators",
            ErrorCode::DollarPrefixedFieldName => "DollarPrefixedFieldName",
            ErrorCode::EmptyFieldName => "EmptyFieldName",
            ErrorCode::CommandNotFound => "CommandNotFound",
            ErrorCode::CommandFailed => "CommandFailed",
            ErrorCode::NoSuchKey => "NoSuchKey",
            ErrorCode::Location15974 => "Location15974",
            ErrorCode::Location15975 => "Location15975",
            ErrorCode::Location17419 => "Location17419",
            ErrorCode::Location17420 => "Location17420",
            ErrorCode::Location40352 => "Location40352",
        }
    }
}

/// Errors raised while translating and executing client commands.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// An error reply is returned and the session continues.
    #[error("{message}")]
    Soft { message: String, code: ErrorCode },

    /// An error reply is returned and the last-error slot is populated.
    #[error("{message}")]
    Hard { message: String, code: ErrorCode },

    /// A wrapped relational engine error, code and message preserved.
    #[error("{message}")]
    Mariadb {
        code: i32,
        sql_state: String,
        message: String,
    },

    /// Fatal to the connection: malformed packets, bad checksums,
    /// unsupported opcodes.
    #[error("{0}")]
    Protocol(String),
}

impl BridgeError {
    pub fn soft(message: impl Into<String>, code: ErrorCode) -> BridgeError {
        BridgeError::Soft {
            message: message.into(),
            code,
        }
    }

    pub fn hard(message: impl Into<String>, code: ErrorCode) -> BridgeError {
        BridgeError::Hard {
            message: message.into(),
            code,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Protocol(_))
    }

    /// Render the `{ok: 0, errmsg, code, codeName}` reply document.
    pub fn to_document(&self) -> Document {
        match self {
            BridgeError::Soft { message, code } | BridgeError::Hard { message, code } => {
                doc! {
                    "ok": 0,
                    "errmsg": message.clone(),
                    "code": code.code(),
                    "codeName": code.code_name(),
                }
            }
            BridgeError::Mariadb {
                code,
                sql_state,
                message,
            } => {
                doc! {
                    "ok": 0,
                    "errmsg": format!("{} ({}): {}", code, sql_state, message),
                    "code": ErrorCode::CommandFailed.code(),
                    "codeName": ErrorCode::CommandFailed.code_name(),
                }
            }
            BridgeError::Protocol(message) => {
                doc! {
                    "ok": 0,
                    "errmsg": message.clone(),
                    "code": ErrorCode::InternalError.code(),
                    "codeName": ErrorCode::InternalError.code_name(),
                }
            }
        }
    }

    /// The document stored for a later `getLastError`.
    pub fn to_last_error(&self) -> Document {
        match self {
            BridgeError::Mariadb {
                code,
                sql_state,
                message,
            } => doc! {
                "ok": 1,
                "err": format!("{} ({}): {}", code, sql_state, message),
                "code": *code,
                "n": 0,
            },
            other => {
                let mut last = other.to_document();
                last.insert("ok", 1);
                last.insert("n", 0);
                last
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn soft_error_document() {
        let err = BridgeError::soft("unknown operator: $frob", ErrorCode::BadValue);
        let doc = err.to_document();

        assert_eq!(doc.get_i32("ok").unwrap(), 0);
        assert_eq!(doc.get_i32("code").unwrap(), 2);
        assert_eq!(doc.get_str("codeName").unwrap(), "BadValue");
        assert_eq!(doc.get_str("errmsg").unwrap(), "unknown operator: $frob");
    }

    #[test]
    fn mariadb_error_preserves_code() {
        let err = BridgeError::Mariadb {
            code: 1146,
            sql_state: "42S02".to_string(),
            message: "Table 'd.t' doesn't exist".to_string(),
        };

        let doc = err.to_document();
        assert!(doc.get_str("errmsg").unwrap().contains("1146"));

        let last = err.to_last_error();
        assert_eq!(last.get_i32("code").unwrap(), 1146);
    }

    #[test]
    fn only_protocol_errors_are_fatal() {
        assert!(BridgeError::Protocol("bad checksum".into()).is_fatal());
        assert!(!BridgeError::soft("x", ErrorCode::BadValue).is_fatal());
    }
}
