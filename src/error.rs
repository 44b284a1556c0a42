use thiserror::Error;
use uuid::Uuid;

use crate::models::CareStatus;

const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Error, Debug)]
pub enum CareError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Doctor {doctor_id} is already assigned to patient {patient_id}")]
    AlreadyAssigned { doctor_id: Uuid, patient_id: Uuid },

    #[error("Cannot change status from {from} to {to}: discharged is terminal")]
    InvalidStateTransition { from: CareStatus, to: CareStatus },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CareError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// Stable code used in structured error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::AlreadyAssigned { .. } => "already_assigned",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::Database(_) => "database",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) => 2,
            Self::NotFound { .. } => 3,
            Self::Forbidden(_) => 4,
            Self::AlreadyAssigned { .. } | Self::InvalidStateTransition { .. } => 5,
            Self::Database(_) => 1,
        }
    }

    /// Serialization failures and deadlocks are safe to retry as a whole transaction.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => matches!(
                sqlstate(err).as_deref(),
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
            ),
            _ => false,
        }
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(UNIQUE_VIOLATION)
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub type CareResult<T> = Result<T, CareError>;
