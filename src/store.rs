//! sled backed persistence for prescriptions
use crate::collaborators::{BlobStore, IdentityProvider, UserProfile};
use crate::error::{Result, RxError, ValidationError};
use crate::prescription::{
    Category, FileRef, Origin, Prescription, PrescriptionStatus, TimeStamp,
};
use crate::state::PrescriptionStateMachine;
use crate::utils::{id_key, key_id};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

pub const PRESCRIPTIONS_TREE: &str = "prescriptions";
pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct PrescriptionFilter {
    pub owner_id: Option<u64>,
    pub status: Option<PrescriptionStatus>,
    pub category: Option<Category>,
    pub created_from: Option<TimeStamp<Utc>>,
    pub created_to: Option<TimeStamp<Utc>>,
    pub text: Option<String>,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub per_page: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobCleanupWarning {
    pub reference: String,
    pub message: String,
}

/// Result of a successful delete. The record is gone even when
/// `blob_warnings` is not empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub id: u64,
    pub blob_warnings: Vec<BlobCleanupWarning>,
}

pub struct PrescriptionStore {
    instance: Arc<sled::Db>,
    tree: sled::Tree,
    blobs: Arc<dyn BlobStore>,
    identity: Arc<dyn IdentityProvider>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PAGE_SIZE,
        }
    }
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> usize {
        if self.per_page == 0 {
            return 0;
        }
        self.total.div_ceil(self.per_page)
    }
}

impl PrescriptionStore {
    pub fn new(
        instance: Arc<sled::Db>,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let tree = instance.open_tree(PRESCRIPTIONS_TREE)?;
        Ok(Self {
            instance,
            tree,
            blobs,
            identity,
        })
    }

    /// Inserts a new pending, unbound prescription.
    pub fn create(
        &self,
        owner_id: u64,
        category: Category,
        files: Vec<FileRef>,
        origin: Origin,
    ) -> Result<Prescription> {
        if files.is_empty() {
            return Err(ValidationError::NoFiles.into());
        }

        let prescription = Prescription {
            id: self.instance.generate_id()? + 1,
            owner_id,
            bound_order_id: None,
            files,
            category,
            status: PrescriptionStatus::Pending,
            rejection_reason: None,
            origin,
            created_at: TimeStamp::new(),
        };

        self.tree
            .insert(id_key(prescription.id), minicbor::to_vec(&prescription)?)?;
        tracing::info!(
            id = prescription.id,
            owner_id,
            category = %category,
            "prescription created"
        );

        Ok(prescription)
    }

    pub fn get(&self, id: u64) -> Result<Prescription> {
        match self.tree.get(id_key(id))? {
            Some(bytes) => Ok(minicbor::decode(&bytes)?),
            None => Err(RxError::PrescriptionNotFound(id)),
        }
    }

    /// Writes `next` only if the stored record still equals `current`.
    ///
    /// A concurrent writer that got in first turns this into a state
    /// conflict instead of silently overwriting its change.
    pub fn replace(&self, current: &Prescription, next: &Prescription) -> Result<()> {
        let key = id_key(current.id);
        let old = minicbor::to_vec(current)?;
        let new = minicbor::to_vec(next)?;

        match self.tree.compare_and_swap(key, Some(old), Some(new))? {
            Ok(()) => Ok(()),
            Err(cas) if cas.current.is_none() => Err(RxError::PrescriptionNotFound(current.id)),
            Err(_) => Err(RxError::StateConflict(format!(
                "prescription {} was modified concurrently",
                current.id
            ))),
        }
    }

    pub fn list(&self, filter: &PrescriptionFilter, page: PageRequest) -> Result<Page<Prescription>> {
        let per_page = page.per_page.max(1);
        let page_no = page.page.max(1);
        let search = filter.text.as_deref().map(str::trim).filter(|t| !t.is_empty());
        let mut profiles: HashMap<u64, Option<UserProfile>> = HashMap::new();

        let mut matches = Vec::new();
        // newest first
        for entry in self.tree.iter().rev() {
            let (_, value) = entry?;
            let prescription: Prescription = minicbor::decode(&value)?;

            if !matches_fields(filter, &prescription) {
                continue;
            }
            if let Some(term) = search {
                if !self.matches_text(term, &prescription, &mut profiles)? {
                    continue;
                }
            }
            matches.push(prescription);
        }

        let total = matches.len();
        let items = matches
            .into_iter()
            .skip(page_no.saturating_sub(1).saturating_mul(per_page))
            .take(per_page)
            .collect();

        tracing::debug!(total, page = page_no, "listed prescriptions");

        Ok(Page {
            items,
            total,
            page: page_no,
            per_page,
        })
    }

    fn matches_text(
        &self,
        term: &str,
        prescription: &Prescription,
        profiles: &mut HashMap<u64, Option<UserProfile>>,
    ) -> Result<bool> {
        let needle = term.to_lowercase();

        if let Ok(number) = needle.parse::<u64>() {
            let exact = prescription.id == number
                || prescription.bound_order_id == Some(number)
                || prescription.owner_id == number;
            if exact {
                return Ok(true);
            }
        }

        if prescription.id.to_string().contains(&needle)
            || prescription.display_id().to_lowercase().contains(&needle)
            || prescription
                .bound_order_id
                .is_some_and(|order| order.to_string().contains(&needle))
        {
            return Ok(true);
        }

        let owner = prescription.owner_id;
        if !profiles.contains_key(&owner) {
            let profile = self
                .identity
                .profile(owner)
                .map_err(|e| RxError::dependency("identity provider", e))?;
            profiles.insert(owner, profile);
        }

        Ok(match profiles.get(&owner) {
            Some(Some(profile)) => [&profile.display_name, &profile.email, &profile.login]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle)),
            _ => false,
        })
    }

    /// Removes a prescription if the state machine allows it, then asks the
    /// blob store to drop its files. Blob failures are reported, not raised.
    pub fn delete(&self, id: u64, owner_id: Option<u64>) -> Result<DeleteOutcome> {
        let prescription = self.get(id)?;

        if let Some(actor) = owner_id {
            if actor != prescription.owner_id {
                return Err(RxError::OwnershipMismatch {
                    actor,
                    entity: prescription.display_id(),
                });
            }
        }

        if !PrescriptionStateMachine::can_delete(&prescription) {
            return Err(RxError::StateConflict(format!(
                "prescription {} is {} and {} and cannot be deleted",
                id,
                prescription.status,
                if prescription.is_bound() { "bound" } else { "unbound" }
            )));
        }

        let old = minicbor::to_vec(&prescription)?;
        if let Err(cas) = self
            .tree
            .compare_and_swap(id_key(id), Some(old), None as Option<&[u8]>)?
        {
            return Err(match cas.current {
                None => RxError::PrescriptionNotFound(id),
                Some(_) => RxError::StateConflict(format!(
                    "prescription {id} was modified concurrently"
                )),
            });
        }
        tracing::info!(id, "prescription deleted");

        let blob_warnings = self.remove_blobs(&prescription.files);
        Ok(DeleteOutcome { id, blob_warnings })
    }

    /// Best effort removal of stored files.
    pub fn remove_blobs(&self, files: &[FileRef]) -> Vec<BlobCleanupWarning> {
        let mut warnings = Vec::new();
        for file in files {
            if let Err(e) = self.blobs.delete(&file.reference) {
                tracing::warn!(reference = %file.reference, error = %e, "blob cleanup failed");
                warnings.push(BlobCleanupWarning {
                    reference: file.reference.clone(),
                    message: format!("{e:#}"),
                });
            }
        }
        warnings
    }

    pub fn ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for key in self.tree.iter().keys() {
            if let Some(id) = key_id(&key?) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

fn matches_fields(filter: &PrescriptionFilter, prescription: &Prescription) -> bool {
    if filter.owner_id.is_some_and(|owner| owner != prescription.owner_id) {
        return false;
    }
    if filter.status.is_some_and(|status| status != prescription.status) {
        return false;
    }
    if filter
        .category
        .is_some_and(|category| category != prescription.category)
    {
        return false;
    }
    if let Some(from) = &filter.created_from {
        if prescription.created_at < *from {
            return false;
        }
    }
    if let Some(to) = &filter.created_to {
        if prescription.created_at > *to {
            return false;
        }
    }
    true
}
