//! Prescription review and order binding for an online pharmacy.
//!
//! Patients upload prescriptions, staff approve or reject them, and approved
//! medicine prescriptions back commerce orders. [`service::PharmacyService`]
//! is the entry point; the remaining modules are usable on their own.

pub mod binding;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod formatter;
pub mod logger;
pub mod order_request;
pub mod prescription;
pub mod service;
pub mod state;
pub mod store;
pub mod upload;
pub mod utils;

pub use error::{ErrorKind, Result, RxError, ValidationError};
