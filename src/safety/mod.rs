//! SQL validation.
//!
//! Classifies statements as safe, mutating or destructive and decides
//! whether a statement may run given where it came from and whether the
//! connection is read-only.

mod parser;

pub use parser::classify_sql;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::ReadOnlyStatus;
use crate::error::ErrorCode;

/// Safety level of a statement. Ordered from least to most dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SafetyLevel {
    /// SELECT, EXPLAIN, SHOW.
    Safe,
    /// INSERT, UPDATE.
    Mutating,
    /// DELETE, DROP, TRUNCATE, ALTER and anything unrecognised.
    Destructive,
}

impl SafetyLevel {
    /// Anything other than `Safe`.
    pub fn modifies_data(&self) -> bool {
        !matches!(self, Self::Safe)
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "Safe"),
            Self::Mutating => write!(f, "Mutating"),
            Self::Destructive => write!(f, "Destructive"),
        }
    }
}

/// Where a statement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    /// Generated from a fixed template.
    Trusted,
    /// Produced by a model or typed by a user.
    Untrusted,
}

impl TrustLevel {
    pub fn from_trusted(trusted: bool) -> Self {
        if trusted {
            Self::Trusted
        } else {
            Self::Untrusted
        }
    }
}

/// Outcome of validating one statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
            error_code: None,
        }
    }

    /// Invalid statement with the reason shown to the user.
    pub fn reject(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
            error_code: Some(code),
        }
    }
}

/// Validates statements before execution.
#[derive(Debug, Clone, Default)]
pub struct SqlValidator;

impl SqlValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validates SQL with no connection context, as untrusted input.
    pub fn validate(&self, sql: &str) -> Validation {
        self.check(sql, TrustLevel::Untrusted, ReadOnlyStatus::Unknown)
    }

    /// Validates SQL for execution on a connection.
    ///
    /// Untrusted SQL must parse and be read-only. Trusted SQL skips the
    /// classification requirement, but a read-only connection still rejects
    /// any statement that parses as a write.
    pub fn check(&self, sql: &str, trust: TrustLevel, read_only: ReadOnlyStatus) -> Validation {
        if sql.trim().is_empty() {
            return Validation::reject(ErrorCode::InvalidSql, "Empty SQL statement");
        }

        let level = match classify_sql(sql) {
            Ok(level) => Some(level),
            Err(e) if trust == TrustLevel::Untrusted => {
                return Validation::reject(ErrorCode::InvalidSql, e.to_string());
            }
            Err(_) => None,
        };

        match (level, trust) {
            (Some(level), _) if level.modifies_data() && read_only.is_read_only() => {
                Validation::reject(
                    ErrorCode::ReadOnlyViolation,
                    format!("{level} statement rejected: connection is read-only"),
                )
            }
            (Some(level), TrustLevel::Untrusted) if level.modifies_data() => Validation::reject(
                ErrorCode::UnsafeSql,
                format!("{level} statement rejected: only read queries are allowed"),
            ),
            _ => Validation::ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_level_ordering() {
        assert!(SafetyLevel::Safe < SafetyLevel::Mutating);
        assert!(SafetyLevel::Mutating < SafetyLevel::Destructive);
        assert!(!SafetyLevel::Safe.modifies_data());
    }

    #[test]
    fn test_untrusted_select_is_valid() {
        let v = SqlValidator::new().validate("SELECT * FROM users");
        assert_eq!(v, Validation::ok());
    }

    #[test]
    fn test_untrusted_write_is_unsafe() {
        let v = SqlValidator::new().validate("DELETE FROM users");
        assert!(!v.valid);
        assert_eq!(v.error_code, Some(ErrorCode::UnsafeSql));
    }

    #[test]
    fn test_untrusted_garbage_is_invalid() {
        let v = SqlValidator::new().validate("this is not sql");
        assert_eq!(v.error_code, Some(ErrorCode::InvalidSql));
    }

    #[test]
    fn test_empty_is_invalid_even_when_trusted() {
        let v = SqlValidator::new().check("  ", TrustLevel::Trusted, ReadOnlyStatus::Unknown);
        assert_eq!(v.error_code, Some(ErrorCode::InvalidSql));
    }

    #[test]
    fn test_trusted_skips_strict_checks() {
        let validator = SqlValidator::new();
        let v = validator.check(
            "UPDATE users SET seen = true",
            TrustLevel::Trusted,
            ReadOnlyStatus::ReadWrite,
        );
        assert!(v.valid);

        // Unparseable template output is left to the database.
        let v = validator.check(
            "SELEKT 1",
            TrustLevel::Trusted,
            ReadOnlyStatus::Unknown,
        );
        assert!(v.valid);
    }

    #[test]
    fn test_read_only_connection_rejects_writes() {
        let validator = SqlValidator::new();
        for trust in [TrustLevel::Trusted, TrustLevel::Untrusted] {
            let v = validator.check("INSERT INTO t VALUES (1)", trust, ReadOnlyStatus::ReadOnly);
            assert_eq!(v.error_code, Some(ErrorCode::ReadOnlyViolation));
        }
        let v = validator.check("SELECT 1", TrustLevel::Untrusted, ReadOnlyStatus::ReadOnly);
        assert!(v.valid);
    }

    #[test]
    fn test_validation_serializes_camel_case() {
        let json = serde_json::to_value(Validation::reject(ErrorCode::UnsafeSql, "no")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"valid": false, "error": "no", "errorCode": "UNSAFE_SQL"})
        );
        let json = serde_json::to_value(Validation::ok()).unwrap();
        assert_eq!(json, serde_json::json!({"valid": true}));
    }
}
