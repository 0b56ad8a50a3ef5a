//! Review state machine for prescriptions.
//!
//! `pending` is the only state with outgoing transitions. A rejected
//! prescription is never reopened; the patient uploads a new one instead.
//!
//! Transitions are pure: they hand back the updated record and leave
//! persistence, order resync and notification to the caller.
use crate::error::{Result, RxError, ValidationError};
use crate::prescription::{Prescription, PrescriptionStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewAction {
    Approve,
    Reject { reason: String },
}

impl ReviewAction {
    pub fn target(&self) -> PrescriptionStatus {
        match self {
            ReviewAction::Approve => PrescriptionStatus::Approved,
            ReviewAction::Reject { .. } => PrescriptionStatus::Rejected,
        }
    }
}

pub struct PrescriptionStateMachine;

impl PrescriptionStateMachine {
    pub fn transition(prescription: &Prescription, action: &ReviewAction) -> Result<Prescription> {
        if prescription.status != PrescriptionStatus::Pending {
            return Err(RxError::StateConflict(format!(
                "prescription {} is {}, cannot move to {}",
                prescription.id,
                prescription.status,
                action.target()
            )));
        }

        let mut next = prescription.clone();
        match action {
            ReviewAction::Approve => {
                next.status = PrescriptionStatus::Approved;
            }
            ReviewAction::Reject { reason } => {
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(ValidationError::MissingReason.into());
                }
                next.status = PrescriptionStatus::Rejected;
                next.rejection_reason = Some(reason.to_string());
            }
        }

        Ok(next)
    }

    /// Rejected prescriptions can always go. Pending ones only while they
    /// back no order. Approved ones never.
    pub fn can_delete(prescription: &Prescription) -> bool {
        match prescription.status {
            PrescriptionStatus::Rejected => true,
            PrescriptionStatus::Pending => prescription.bound_order_id.is_none(),
            PrescriptionStatus::Approved => false,
        }
    }
}
