//! Error types shared by every component.
//!
//! Callers match on [`RxError::kind`] to decide on user facing messaging. Only
//! [`ErrorKind::DependencyFailure`] represents something outside the caller's
//! control.

/// Coarse classification of an [`RxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    OwnershipMismatch,
    StateConflict,
    CategoryMismatch,
    DependencyFailure,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No files were submitted")]
    NoFiles,
    #[error("Too many files submitted, at most {limit} are allowed")]
    TooManyFiles { limit: usize },
    #[error("A submitted file has an empty name")]
    EmptyFileName,
    #[error("File '{file_name}' is empty")]
    EmptyFile { file_name: String },
    #[error("File '{file_name}' exceeds the size limit of {limit} bytes")]
    FileTooLarge { file_name: String, limit: u64 },
    #[error("File '{file_name}' has unsupported type '{content_type}'")]
    UnsupportedType {
        file_name: String,
        content_type: String,
    },
    #[error("A rejection reason is required")]
    MissingReason,
    #[error("Admin notes are required to reject a request")]
    MissingAdminNotes,
    #[error("Requested days must be a positive integer, got {0}")]
    InvalidDays(u32),
    #[error("At least one prescription must be referenced")]
    InvalidPrescription,
}

#[derive(thiserror::Error, Debug)]
pub enum RxError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Prescription {0} not found")]
    PrescriptionNotFound(u64),
    #[error("Order request {0} not found")]
    RequestNotFound(u64),
    #[error("User {actor} does not own {entity}")]
    OwnershipMismatch { actor: u64, entity: String },
    #[error("State conflict: {0}")]
    StateConflict(String),
    #[error("Prescription {id} is a {category} prescription, medicine is required")]
    CategoryMismatch { id: u64, category: String },
    #[error("Order {0} does not contain a prescription-required item")]
    OrderNotEligible(u64),
    #[error("{service} call failed: {message}")]
    Dependency {
        service: &'static str,
        message: String,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl RxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RxError::Validation(_) | RxError::OrderNotEligible(_) => ErrorKind::Validation,
            RxError::PrescriptionNotFound(_) | RxError::RequestNotFound(_) => ErrorKind::NotFound,
            RxError::OwnershipMismatch { .. } => ErrorKind::OwnershipMismatch,
            RxError::StateConflict(_) => ErrorKind::StateConflict,
            RxError::CategoryMismatch { .. } => ErrorKind::CategoryMismatch,
            RxError::Dependency { .. } | RxError::Storage(_) | RxError::Encoding(_) => {
                ErrorKind::DependencyFailure
            }
        }
    }

    pub(crate) fn dependency(service: &'static str, err: anyhow::Error) -> Self {
        RxError::Dependency {
            service,
            message: format!("{err:#}"),
        }
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for RxError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        RxError::Encoding(value.to_string())
    }
}

impl From<minicbor::decode::Error> for RxError {
    fn from(value: minicbor::decode::Error) -> Self {
        RxError::Encoding(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RxError>;
