use serde::Serialize;
use thiserror::Error;

use crate::models::usermodel::UserId;

/// Coarse classification of every engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    PreconditionFailed,
    StorageFailure,
}

impl ErrorKind {
    pub fn to_str(&self) -> &str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::StorageFailure => "storage_failure",
        }
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("User {0} is not registered")]
    NotRegistered(UserId),

    #[error("Referral code {0} does not belong to any user")]
    UnknownReferralCode(String),

    #[error("User {user_id} was already referred by {referrer_id}")]
    AlreadyReferred {
        user_id: UserId,
        referrer_id: UserId,
    },

    #[error("User {0} cannot refer themselves")]
    SelfReferral(UserId),

    #[error("Referral edge {referrer_id} -> {referred_id} already exists")]
    DuplicateEdge {
        referrer_id: UserId,
        referred_id: UserId,
    },

    #[error("Referral target not reached: {active}/{target} active referrals")]
    TargetNotReached { active: i64, target: i64 },

    #[error("Reward already claimed by user {0}")]
    AlreadyClaimed(UserId),

    #[error("Could not allocate a unique referral code after {attempts} attempts")]
    CodeSpaceExhausted { attempts: u32 },

    #[error("Membership source unavailable: {0}")]
    MembershipSource(#[from] ExternalError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidInput(_) => ErrorKind::InvalidInput,

            ServiceError::NotRegistered(_) | ServiceError::UnknownReferralCode(_) => {
                ErrorKind::NotFound
            }

            ServiceError::AlreadyReferred { .. }
            | ServiceError::SelfReferral(_)
            | ServiceError::DuplicateEdge { .. } => ErrorKind::Conflict,

            ServiceError::TargetNotReached { .. } | ServiceError::AlreadyClaimed(_) => {
                ErrorKind::PreconditionFailed
            }

            ServiceError::CodeSpaceExhausted { .. }
            | ServiceError::MembershipSource(_)
            | ServiceError::Database(_) => ErrorKind::StorageFailure,
        }
    }

    /// Business outcomes the caller should report rather than treat as faults.
    pub fn is_expected(&self) -> bool {
        !matches!(self.kind(), ErrorKind::StorageFailure)
    }

    /// Stable machine-readable name of the failure.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput(_) => "invalid_input",
            ServiceError::NotRegistered(_) => "not_registered",
            ServiceError::UnknownReferralCode(_) => "unknown_referral_code",
            ServiceError::AlreadyReferred { .. } => "already_referred",
            ServiceError::SelfReferral(_) => "self_referral",
            ServiceError::DuplicateEdge { .. } => "duplicate_edge",
            ServiceError::TargetNotReached { .. } => "target_not_reached",
            ServiceError::AlreadyClaimed(_) => "already_claimed",
            ServiceError::CodeSpaceExhausted { .. } => "code_space_exhausted",
            ServiceError::MembershipSource(_) => "membership_source_unavailable",
            ServiceError::Database(_) => "storage_failure",
        }
    }
}

/// Failure reported by a collaborator the engine calls out to (membership
/// source, notification sink).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ExternalError(pub String);

impl ExternalError {
    pub fn new(message: impl Into<String>) -> Self {
        ExternalError(message.into())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    InvalidValue {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_failures_are_expected() {
        let conflict = ServiceError::AlreadyReferred {
            user_id: 2,
            referrer_id: 1,
        };
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert!(conflict.is_expected());

        let claim = ServiceError::TargetNotReached {
            active: 1,
            target: 2,
        };
        assert_eq!(claim.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(claim.code(), "target_not_reached");
        assert_eq!(claim.to_string(), "Referral target not reached: 1/2 active referrals");
    }

    #[test]
    fn storage_failures_are_not_expected() {
        let err = ServiceError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        assert!(!err.is_expected());
        assert!(!ServiceError::CodeSpaceExhausted { attempts: 5 }.is_expected());
    }
}
