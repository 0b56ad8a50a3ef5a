//! Order requests: "fulfil these prescriptions for N days".
//!
//! A request is reviewed by staff like a prescription is. Approving one
//! creates the commerce order and approves and binds every prescription it
//! names. Each prescription still goes through
//! [`PrescriptionStateMachine::transition`], so the review rules live in one
//! place.
use crate::binding::OrderAttachmentSync;
use crate::collaborators::{
    Commerce, EventKind, LineItem, NewOrder, Notification, Notifier, Recipient,
};
use crate::error::{Result, RxError, ValidationError};
use crate::prescription::{Category, PrescriptionStatus, TimeStamp};
use crate::state::{PrescriptionStateMachine, ReviewAction};
use crate::store::PrescriptionStore;
use crate::utils::id_key;
use chrono::Utc;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub const REQUESTS_TREE: &str = "order_requests";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub owner_id: u64,
    #[n(2)]
    pub prescription_ids: Vec<u64>, // sorted, no duplicates
    #[n(3)]
    pub requested_days: u32,
    #[n(4)]
    pub notes: String,
    #[n(5)]
    pub status: RequestStatus,
    #[n(6)]
    pub bound_order_id: Option<u64>, // set once the commerce order exists
    #[n(7)]
    pub admin_notes: Option<String>, // set on rejection
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrderRequest {
    pub owner_id: u64,
    pub prescription_ids: Vec<u64>,
    pub requested_days: u32,
    pub notes: String,
    pub verify_ownership: bool,
}

pub struct OrderRequestManager {
    instance: Arc<sled::Db>,
    tree: sled::Tree,
    store: Arc<PrescriptionStore>,
    sync: Arc<OrderAttachmentSync>,
    commerce: Arc<dyn Commerce>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        })
    }
}

impl NewOrderRequest {
    pub fn new(owner_id: u64, prescription_ids: Vec<u64>, requested_days: u32) -> Self {
        Self {
            owner_id,
            prescription_ids,
            requested_days,
            notes: String::new(),
            verify_ownership: true,
        }
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = notes.to_string();
        self
    }

    pub fn verify_ownership(mut self, verify: bool) -> Self {
        self.verify_ownership = verify;
        self
    }
}

impl OrderRequest {
    pub fn can_delete(&self) -> bool {
        self.status != RequestStatus::Approved
    }
}

pub(crate) fn notify_quietly(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.notify(&notification) {
        tracing::warn!(
            event = notification.kind.name(),
            entity_id = notification.entity_id,
            error = %e,
            "notification delivery failed"
        );
    }
}

impl OrderRequestManager {
    pub fn new(
        instance: Arc<sled::Db>,
        store: Arc<PrescriptionStore>,
        sync: Arc<OrderAttachmentSync>,
        commerce: Arc<dyn Commerce>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let tree = instance.open_tree(REQUESTS_TREE)?;
        Ok(Self {
            instance,
            tree,
            store,
            sync,
            commerce,
            notifier,
        })
    }

    /// Stores a pending request. With ownership verification on, every
    /// referenced prescription must exist and belong to the owner, or nothing
    /// is stored.
    pub fn create_request(&self, request: NewOrderRequest) -> Result<OrderRequest> {
        let ids: BTreeSet<u64> = request.prescription_ids.iter().copied().collect();
        if ids.is_empty() {
            return Err(ValidationError::InvalidPrescription.into());
        }
        if request.requested_days == 0 {
            return Err(ValidationError::InvalidDays(request.requested_days).into());
        }

        if request.verify_ownership {
            for id in &ids {
                let prescription = self.store.get(*id)?;
                if prescription.owner_id != request.owner_id {
                    return Err(RxError::OwnershipMismatch {
                        actor: request.owner_id,
                        entity: prescription.display_id(),
                    });
                }
            }
        }

        let now = TimeStamp::new();
        let order_request = OrderRequest {
            id: self.instance.generate_id()? + 1,
            owner_id: request.owner_id,
            prescription_ids: ids.into_iter().collect(),
            requested_days: request.requested_days,
            notes: request.notes.trim().to_string(),
            status: RequestStatus::Pending,
            bound_order_id: None,
            admin_notes: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.tree
            .insert(id_key(order_request.id), minicbor::to_vec(&order_request)?)?;

        tracing::info!(
            id = order_request.id,
            owner_id = order_request.owner_id,
            prescriptions = order_request.prescription_ids.len(),
            days = order_request.requested_days,
            "order request created"
        );

        notify_quietly(
            self.notifier.as_ref(),
            Notification {
                kind: EventKind::OrderRequestCreated,
                entity_id: order_request.id,
                recipient: Recipient::Staff,
                detail: None,
            },
        );

        Ok(order_request)
    }

    pub fn get_request(&self, id: u64) -> Result<OrderRequest> {
        match self.tree.get(id_key(id))? {
            Some(bytes) => Ok(minicbor::decode(&bytes)?),
            None => Err(RxError::RequestNotFound(id)),
        }
    }

    /// Newest first.
    pub fn list_requests(
        &self,
        owner_id: Option<u64>,
        status: Option<RequestStatus>,
    ) -> Result<Vec<OrderRequest>> {
        let mut requests = Vec::new();
        for entry in self.tree.iter().rev() {
            let (_, value) = entry?;
            let request: OrderRequest = minicbor::decode(&value)?;
            if owner_id.is_some_and(|owner| owner != request.owner_id) {
                continue;
            }
            if status.is_some_and(|s| s != request.status) {
                continue;
            }
            requests.push(request);
        }
        Ok(requests)
    }

    /// Creates the commerce order, approves and binds the request's
    /// prescriptions, and returns the new order id.
    ///
    /// Every prescription is checked before the order is created: it must
    /// exist, be a medicine prescription and not be rejected. The order id is
    /// stored on the request before any prescription changes, so retrying a
    /// failed approval finishes it against the same order.
    pub fn approve_request(&self, request_id: u64) -> Result<u64> {
        let mut current = self.get_request(request_id)?;
        ensure_pending(&current)?;

        let mut prescriptions = Vec::with_capacity(current.prescription_ids.len());
        for id in &current.prescription_ids {
            let prescription = self.store.get(*id)?;
            if prescription.category != Category::Medicine {
                return Err(RxError::CategoryMismatch {
                    id: prescription.id,
                    category: prescription.category.to_string(),
                });
            }
            if prescription.status == PrescriptionStatus::Rejected {
                return Err(RxError::StateConflict(format!(
                    "prescription {} was rejected and cannot back request {}",
                    prescription.id, request_id
                )));
            }
            prescriptions.push(prescription);
        }

        let order_id = match current.bound_order_id {
            Some(order_id) => {
                tracing::info!(request_id, order_id, "resuming order request approval");
                order_id
            }
            None => {
                let order_id = self
                    .commerce
                    .create_order(NewOrder {
                        customer_id: current.owner_id,
                        line_items: vec![LineItem {
                            label: format!(
                                "Prescription supply ({} days)",
                                current.requested_days
                            ),
                            requested_days: current.requested_days,
                            prescription_ids: current.prescription_ids.clone(),
                            requires_prescription: true,
                        }],
                        note: current.notes.clone(),
                    })
                    .map_err(|e| RxError::dependency("commerce", e))?;

                let mut claimed = current.clone();
                claimed.bound_order_id = Some(order_id);
                claimed.updated_at = TimeStamp::new();
                self.replace(&current, &claimed)?;
                current = claimed;
                order_id
            }
        };

        for prescription in prescriptions {
            let prescription = if prescription.status == PrescriptionStatus::Pending {
                let approved =
                    PrescriptionStateMachine::transition(&prescription, &ReviewAction::Approve)?;
                self.store.replace(&prescription, &approved)?;
                notify_quietly(
                    self.notifier.as_ref(),
                    Notification {
                        kind: EventKind::PrescriptionApproved,
                        entity_id: approved.id,
                        recipient: Recipient::User(approved.owner_id),
                        detail: Some(format!("order request {request_id}")),
                    },
                );
                approved
            } else {
                prescription
            };
            // the order was built with a prescription-only line, no need to ask commerce
            self.sync.bind(prescription, order_id)?;
        }

        let mut next = current.clone();
        next.status = RequestStatus::Approved;
        next.updated_at = TimeStamp::new();
        self.replace(&current, &next)?;

        tracing::info!(request_id, order_id, "order request approved");
        Ok(order_id)
    }

    /// Rejects a pending request. The prescriptions it names are untouched.
    pub fn reject_request(&self, request_id: u64, admin_notes: &str) -> Result<OrderRequest> {
        let current = self.get_request(request_id)?;
        ensure_pending(&current)?;

        let admin_notes = admin_notes.trim();
        if admin_notes.is_empty() {
            return Err(ValidationError::MissingAdminNotes.into());
        }

        let mut next = current.clone();
        next.status = RequestStatus::Rejected;
        next.admin_notes = Some(admin_notes.to_string());
        next.updated_at = TimeStamp::new();
        self.replace(&current, &next)?;

        tracing::info!(request_id, "order request rejected");
        Ok(next)
    }

    pub fn delete_request(&self, request_id: u64) -> Result<()> {
        let current = self.get_request(request_id)?;
        if !current.can_delete() {
            return Err(RxError::StateConflict(format!(
                "order request {request_id} is approved and cannot be deleted"
            )));
        }

        let old = minicbor::to_vec(&current)?;
        if let Err(cas) =
            self.tree
                .compare_and_swap(id_key(request_id), Some(old), None as Option<&[u8]>)?
        {
            return Err(lost_race(request_id, cas.current.is_some()));
        }

        tracing::info!(request_id, "order request deleted");
        Ok(())
    }

    fn replace(&self, current: &OrderRequest, next: &OrderRequest) -> Result<()> {
        let old = minicbor::to_vec(current)?;
        let new = minicbor::to_vec(next)?;
        match self
            .tree
            .compare_and_swap(id_key(current.id), Some(old), Some(new))?
        {
            Ok(()) => Ok(()),
            Err(cas) => Err(lost_race(current.id, cas.current.is_some())),
        }
    }
}

// a failed compare-and-swap either lost to a writer or to a delete
fn lost_race(request_id: u64, still_stored: bool) -> RxError {
    if still_stored {
        RxError::StateConflict(format!(
            "order request {request_id} was modified concurrently"
        ))
    } else {
        RxError::RequestNotFound(request_id)
    }
}

fn ensure_pending(request: &OrderRequest) -> Result<()> {
    if request.status != RequestStatus::Pending {
        return Err(RxError::StateConflict(format!(
            "order request {} is already {}",
            request.id, request.status
        )));
    }
    Ok(())
}
