//! Service layer API for prescription workflow operations.
//!
//! Every caller-facing flow runs its steps in a fixed order here: validate,
//! persist, resync the order cache, notify. Notification failures are logged
//! and never fail the operation that produced them.
use crate::binding::{BindingHistoryEntry, OrderAttachmentSync};
use crate::collaborators::{
    BlobStore, Commerce, EventKind, FsBlobStore, IdentityProvider, Notification, Notifier,
    Recipient, TracingNotifier,
};
use crate::config::Config;
use crate::error::{Result, RxError};
use crate::order_request::{
    NewOrderRequest, OrderRequest, OrderRequestManager, RequestStatus, notify_quietly,
};
use crate::prescription::{Category, FileRef, Origin, Prescription, PrescriptionStatus};
use crate::state::{PrescriptionStateMachine, ReviewAction};
use crate::store::{DeleteOutcome, Page, PageRequest, PrescriptionFilter, PrescriptionStore};
use crate::upload::{UploadFile, UploadPolicy};
use std::sync::Arc;
use tracing::instrument;

/// The external systems a [`PharmacyService`] is assembled from.
#[derive(Clone)]
pub struct Collaborators {
    pub commerce: Arc<dyn Commerce>,
    pub blobs: Arc<dyn BlobStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Files under `config.blob_root` and log-only notifications.
    pub fn with_defaults(
        config: &Config,
        commerce: Arc<dyn Commerce>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let blobs = FsBlobStore::new(&config.blob_root)
            .map_err(|e| RxError::dependency("blob store", e))?;
        Ok(Self {
            commerce,
            blobs: Arc::new(blobs),
            identity,
            notifier: Arc::new(TracingNotifier),
        })
    }
}

pub struct PharmacyService {
    upload_policy: UploadPolicy,
    verify_ownership: bool,
    page_size: usize,
    store: Arc<PrescriptionStore>,
    sync: Arc<OrderAttachmentSync>,
    requests: OrderRequestManager,
    blobs: Arc<dyn BlobStore>,
    notifier: Arc<dyn Notifier>,
}

impl PharmacyService {
    pub fn new(instance: Arc<sled::Db>, config: &Config, collaborators: Collaborators) -> Result<Self> {
        let store = Arc::new(PrescriptionStore::new(
            instance.clone(),
            collaborators.blobs.clone(),
            collaborators.identity.clone(),
        )?);
        let sync = Arc::new(OrderAttachmentSync::new(
            instance.clone(),
            store.clone(),
            collaborators.commerce.clone(),
        )?);
        let requests = OrderRequestManager::new(
            instance,
            store.clone(),
            sync.clone(),
            collaborators.commerce,
            collaborators.notifier.clone(),
        )?;

        Ok(Self {
            upload_policy: config.upload.clone(),
            verify_ownership: config.verify_ownership,
            page_size: config.page_size,
            store,
            sync,
            requests,
            blobs: collaborators.blobs,
            notifier: collaborators.notifier,
        })
    }

    /// Opens the database at `config.db_path`.
    pub fn open(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let db = sled::open(&config.db_path)?;
        Self::new(Arc::new(db), config, collaborators)
    }

    pub fn store(&self) -> &PrescriptionStore {
        &self.store
    }

    pub fn attachments(&self) -> &OrderAttachmentSync {
        &self.sync
    }

    pub fn requests(&self) -> &OrderRequestManager {
        &self.requests
    }

    /// Validates the batch, stores the files, then inserts the record.
    ///
    /// Files written before a failure are removed again, so a failed upload
    /// leaves neither a record nor orphaned blobs behind.
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub fn upload_prescription(
        &self,
        owner_id: u64,
        category: Category,
        files: Vec<UploadFile>,
        origin: Origin,
    ) -> Result<Prescription> {
        self.upload_policy.validate(&files)?;

        let mut saved: Vec<FileRef> = Vec::with_capacity(files.len());
        for file in &files {
            match self.blobs.save(owner_id, file) {
                Ok(reference) => saved.push(reference),
                Err(e) => {
                    self.store.remove_blobs(&saved);
                    return Err(RxError::dependency("blob store", e));
                }
            }
        }

        let prescription = match self.store.create(owner_id, category, saved.clone(), origin) {
            Ok(p) => p,
            Err(e) => {
                self.store.remove_blobs(&saved);
                return Err(e);
            }
        };

        notify_quietly(
            self.notifier.as_ref(),
            Notification {
                kind: EventKind::PrescriptionUploaded,
                entity_id: prescription.id,
                recipient: Recipient::Staff,
                detail: Some(prescription.display_id()),
            },
        );

        Ok(prescription)
    }

    pub fn prescription(&self, id: u64) -> Result<Prescription> {
        self.store.get(id)
    }

    pub fn formatted_id(&self, id: u64) -> Result<String> {
        Ok(self.store.get(id)?.display_id())
    }

    pub fn list_prescriptions(
        &self,
        filter: &PrescriptionFilter,
        page: usize,
    ) -> Result<Page<Prescription>> {
        self.store.list(
            filter,
            PageRequest {
                page,
                per_page: self.page_size,
            },
        )
    }

    /// Staff review. On success the bound order, if any, is resynced before
    /// the patient is notified.
    #[instrument(skip(self))]
    pub fn review_prescription(&self, id: u64, action: ReviewAction) -> Result<Prescription> {
        let current = self.store.get(id)?;
        let next = PrescriptionStateMachine::transition(&current, &action)?;
        self.store.replace(&current, &next)?;
        tracing::info!(id, status = %next.status, "prescription reviewed");

        if let Some(order_id) = next.bound_order_id {
            // a failed resync only leaves the cache stale, the next read rebuilds it
            if let Err(e) = self.sync.resync(order_id) {
                tracing::warn!(id, order_id, error = %e, "order resync after review failed");
            }
        }

        let kind = match next.status {
            PrescriptionStatus::Rejected => EventKind::PrescriptionRejected,
            _ => EventKind::PrescriptionApproved,
        };
        notify_quietly(
            self.notifier.as_ref(),
            Notification {
                kind,
                entity_id: next.id,
                recipient: Recipient::User(next.owner_id),
                detail: next.rejection_reason.clone(),
            },
        );

        Ok(next)
    }

    pub fn approve_prescription(&self, id: u64) -> Result<Prescription> {
        self.review_prescription(id, ReviewAction::Approve)
    }

    pub fn reject_prescription(&self, id: u64, reason: &str) -> Result<Prescription> {
        self.review_prescription(
            id,
            ReviewAction::Reject {
                reason: reason.to_string(),
            },
        )
    }

    #[instrument(skip(self))]
    pub fn attach_prescription(&self, prescription_id: u64, order_id: u64) -> Result<Prescription> {
        self.sync.attach(prescription_id, order_id)
    }

    /// Current prescription status of an order, always rebuilt from the
    /// prescription records.
    pub fn order_prescription_status(&self, order_id: u64) -> Result<Option<PrescriptionStatus>> {
        self.sync.resync(order_id)
    }

    pub fn detach_order(&self, order_id: u64) -> Result<bool> {
        self.sync.detach(order_id)
    }

    pub fn binding_history(&self, prescription_id: u64) -> Result<Vec<BindingHistoryEntry>> {
        self.sync.history(prescription_id)
    }

    #[instrument(skip(self))]
    pub fn delete_prescription(&self, id: u64, owner_id: Option<u64>) -> Result<DeleteOutcome> {
        self.store.delete(id, owner_id)
    }

    /// Uses the configured ownership verification.
    #[instrument(skip(self, notes))]
    pub fn create_order_request(
        &self,
        owner_id: u64,
        prescription_ids: Vec<u64>,
        requested_days: u32,
        notes: &str,
    ) -> Result<OrderRequest> {
        self.requests.create_request(
            NewOrderRequest::new(owner_id, prescription_ids, requested_days)
                .with_notes(notes)
                .verify_ownership(self.verify_ownership),
        )
    }

    #[instrument(skip(self))]
    pub fn approve_order_request(&self, request_id: u64) -> Result<u64> {
        self.requests.approve_request(request_id)
    }

    #[instrument(skip(self, admin_notes))]
    pub fn reject_order_request(&self, request_id: u64, admin_notes: &str) -> Result<OrderRequest> {
        self.requests.reject_request(request_id, admin_notes)
    }

    pub fn delete_order_request(&self, request_id: u64) -> Result<()> {
        self.requests.delete_request(request_id)
    }

    pub fn order_requests(
        &self,
        owner_id: Option<u64>,
        status: Option<RequestStatus>,
    ) -> Result<Vec<OrderRequest>> {
        self.requests.list_requests(owner_id, status)
    }
}
