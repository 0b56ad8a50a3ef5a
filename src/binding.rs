//! Prescription to order bindings and the order-side status cache.
//!
//! The prescription record is authoritative for both its status and the order
//! it backs. The `order_bindings` tree holds a denormalized copy keyed by
//! order id which is allowed to go stale; every read of an order's
//! prescription status goes through [`OrderAttachmentSync::resync`], which
//! rebuilds the entry from the prescription records.
//!
//! Detaching an order only drops its cache entry. The prescription keeps
//! pointing at the order until it is explicitly attached somewhere else.
use crate::collaborators::Commerce;
use crate::error::{Result, RxError};
use crate::prescription::{Category, Prescription, PrescriptionStatus, TimeStamp};
use crate::store::PrescriptionStore;
use crate::utils::id_key;
use chrono::Utc;
use std::sync::Arc;

pub const BINDINGS_TREE: &str = "order_bindings";
pub const HISTORY_TREE: &str = "binding_history";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BindingEntry {
    #[n(0)]
    pub prescription_id: u64,
    #[n(1)]
    pub cached_status: PrescriptionStatus,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OrderPrescriptionBinding {
    #[n(0)]
    pub order_id: u64,
    #[n(1)]
    pub entries: Vec<BindingEntry>,
    #[n(2)]
    pub synced_at: TimeStamp<Utc>, // when the cached statuses were last rebuilt
}

/// Append-only record of every attach.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BindingHistoryEntry {
    #[n(0)]
    pub prescription_id: u64,
    #[n(1)]
    pub order_id: u64,
    #[n(2)]
    pub previous_order_id: Option<u64>,
    #[n(3)]
    pub bound_at: TimeStamp<Utc>,
}

pub struct OrderAttachmentSync {
    instance: Arc<sled::Db>,
    bindings: sled::Tree,
    history: sled::Tree,
    store: Arc<PrescriptionStore>,
    commerce: Arc<dyn Commerce>,
}

/// Order level view of several prescriptions: any rejection wins, then any
/// pending review, otherwise everything is approved.
pub fn aggregate_status<I>(statuses: I) -> Option<PrescriptionStatus>
where
    I: IntoIterator<Item = PrescriptionStatus>,
{
    let mut result = None;
    for status in statuses {
        result = Some(match (result, status) {
            (_, PrescriptionStatus::Rejected) | (Some(PrescriptionStatus::Rejected), _) => {
                PrescriptionStatus::Rejected
            }
            (_, PrescriptionStatus::Pending) | (Some(PrescriptionStatus::Pending), _) => {
                PrescriptionStatus::Pending
            }
            _ => PrescriptionStatus::Approved,
        });
    }
    result
}

fn ensure_medicine(prescription: &Prescription) -> Result<()> {
    if prescription.category != Category::Medicine {
        return Err(RxError::CategoryMismatch {
            id: prescription.id,
            category: prescription.category.to_string(),
        });
    }
    Ok(())
}

impl OrderPrescriptionBinding {
    pub fn cached_status(&self) -> Option<PrescriptionStatus> {
        aggregate_status(self.entries.iter().map(|e| e.cached_status))
    }

    pub fn prescription_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.prescription_id).collect()
    }

    fn upsert(&mut self, prescription: &Prescription) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.prescription_id == prescription.id)
        {
            Some(entry) => entry.cached_status = prescription.status,
            None => self.entries.push(BindingEntry {
                prescription_id: prescription.id,
                cached_status: prescription.status,
            }),
        }
    }
}

impl OrderAttachmentSync {
    pub fn new(
        instance: Arc<sled::Db>,
        store: Arc<PrescriptionStore>,
        commerce: Arc<dyn Commerce>,
    ) -> Result<Self> {
        let bindings = instance.open_tree(BINDINGS_TREE)?;
        let history = instance.open_tree(HISTORY_TREE)?;
        Ok(Self {
            instance,
            bindings,
            history,
            store,
            commerce,
        })
    }

    /// Points a medicine prescription at `order_id`, replacing any earlier
    /// binding, and caches its current status on the order.
    pub fn attach(&self, prescription_id: u64, order_id: u64) -> Result<Prescription> {
        let current = self.store.get(prescription_id)?;
        ensure_medicine(&current)?;

        let eligible = self
            .commerce
            .order_requires_prescription(order_id)
            .map_err(|e| RxError::dependency("commerce", e))?;
        if !eligible {
            return Err(RxError::OrderNotEligible(order_id));
        }

        self.bind(current, order_id)
    }

    /// Attach without asking commerce about the order. Only for orders
    /// created here with a prescription-only line item.
    pub(crate) fn bind(&self, current: Prescription, order_id: u64) -> Result<Prescription> {
        ensure_medicine(&current)?;

        let prescription_id = current.id;
        let previous = current.bound_order_id;
        let mut next = current.clone();
        next.bound_order_id = Some(order_id);
        if previous != Some(order_id) {
            self.store.replace(&current, &next)?;
        }

        if let Some(old_order) = previous.filter(|old| *old != order_id) {
            self.modify_binding(old_order, |binding| {
                if let Some(b) = binding.as_mut() {
                    b.entries.retain(|e| e.prescription_id != prescription_id);
                    if b.entries.is_empty() {
                        *binding = None;
                    }
                }
            })?;
        }

        self.modify_binding(order_id, |binding| {
            let b = binding.get_or_insert_with(|| OrderPrescriptionBinding {
                order_id,
                entries: Vec::new(),
                synced_at: TimeStamp::new(),
            });
            b.upsert(&next);
            b.synced_at = TimeStamp::new();
        })?;

        if previous != Some(order_id) {
            self.record_history(&BindingHistoryEntry {
                prescription_id,
                order_id,
                previous_order_id: previous,
                bound_at: TimeStamp::new(),
            })?;
        }

        tracing::info!(prescription_id, order_id, ?previous, "prescription attached");
        Ok(next)
    }

    /// Rebuilds the order's cache entry from the prescription records and
    /// returns the fresh status. `None` when nothing is bound to the order.
    pub fn resync(&self, order_id: u64) -> Result<Option<PrescriptionStatus>> {
        let key = id_key(order_id);

        loop {
            let raw = self.bindings.get(key)?;
            let Some(bytes) = raw.as_ref() else {
                tracing::debug!(order_id, "resync on unbound order");
                return Ok(None);
            };
            let cached: OrderPrescriptionBinding = minicbor::decode(bytes)?;

            let mut entries = Vec::with_capacity(cached.entries.len());
            for entry in &cached.entries {
                match self.store.get(entry.prescription_id) {
                    // the record may have been rebound or deleted out of band
                    Ok(p) if p.bound_order_id == Some(order_id) => entries.push(BindingEntry {
                        prescription_id: p.id,
                        cached_status: p.status,
                    }),
                    Ok(_) | Err(RxError::PrescriptionNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            let status = aggregate_status(entries.iter().map(|e| e.cached_status));
            let fresh = if entries.is_empty() {
                None
            } else {
                Some(minicbor::to_vec(&OrderPrescriptionBinding {
                    order_id,
                    entries,
                    synced_at: TimeStamp::new(),
                })?)
            };

            match self.bindings.compare_and_swap(key, raw, fresh)? {
                Ok(()) => {
                    tracing::debug!(order_id, ?status, "order binding resynced");
                    return Ok(status);
                }
                Err(_) => continue,
            }
        }
    }

    /// Drops the order's cache entry. Prescription records are untouched.
    pub fn detach(&self, order_id: u64) -> Result<bool> {
        let removed = self.bindings.remove(id_key(order_id))?.is_some();
        tracing::info!(order_id, removed, "order binding detached");
        Ok(removed)
    }

    /// The cache entry as stored, possibly stale.
    pub fn binding(&self, order_id: u64) -> Result<Option<OrderPrescriptionBinding>> {
        match self.bindings.get(id_key(order_id))? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every order the prescription was ever attached to, oldest first.
    pub fn history(&self, prescription_id: u64) -> Result<Vec<BindingHistoryEntry>> {
        let mut entries = Vec::new();
        for item in self.history.scan_prefix(id_key(prescription_id)) {
            let (_, value) = item?;
            entries.push(minicbor::decode(&value)?);
        }
        Ok(entries)
    }

    fn record_history(&self, entry: &BindingHistoryEntry) -> Result<()> {
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&id_key(entry.prescription_id));
        key.extend_from_slice(&id_key(self.instance.generate_id()?));
        self.history.insert(key, minicbor::to_vec(entry)?)?;
        Ok(())
    }

    // read-modify-write of one cache entry, retried until no one raced us
    fn modify_binding<F>(&self, order_id: u64, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Option<OrderPrescriptionBinding>),
    {
        let key = id_key(order_id);
        loop {
            let raw = self.bindings.get(key)?;
            let mut binding = match raw.as_ref() {
                Some(bytes) => Some(minicbor::decode::<OrderPrescriptionBinding>(bytes)?),
                None => None,
            };
            f(&mut binding);

            let updated = match &binding {
                Some(b) => Some(minicbor::to_vec(b)?),
                None => None,
            };
            if self.bindings.compare_and_swap(key, raw, updated)?.is_ok() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prescription::PrescriptionStatus::*;

    #[test]
    fn aggregate_prefers_rejection_then_pending() {
        assert_eq!(aggregate_status(std::iter::empty()), None);
        assert_eq!(aggregate_status([Approved]), Some(Approved));
        assert_eq!(aggregate_status([Approved, Pending]), Some(Pending));
        assert_eq!(aggregate_status([Pending, Rejected, Approved]), Some(Rejected));
        assert_eq!(aggregate_status([Approved, Approved]), Some(Approved));
    }

    #[test]
    fn upsert_replaces_cached_status() {
        let mut binding = OrderPrescriptionBinding {
            order_id: 100,
            entries: vec![BindingEntry {
                prescription_id: 4,
                cached_status: Pending,
            }],
            synced_at: TimeStamp::new(),
        };
        let p = Prescription {
            id: 4,
            owner_id: 1,
            bound_order_id: Some(100),
            files: vec![],
            category: Category::Medicine,
            status: Approved,
            rejection_reason: None,
            origin: crate::prescription::Origin::Admin,
            created_at: TimeStamp::new(),
        };
        binding.upsert(&p);
        assert_eq!(binding.entries.len(), 1);
        assert_eq!(binding.cached_status(), Some(Approved));
        assert_eq!(binding.prescription_ids(), vec![4]);
    }
}
