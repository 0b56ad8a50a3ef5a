//! Systems the prescription core talks to but does not own.
//!
//! Each collaborator is a trait so the service can be assembled with real
//! implementations in production and fakes in tests. Implementations report
//! failures as `anyhow::Error`; the core wraps them as dependency failures.
use crate::prescription::FileRef;
use crate::upload::UploadFile;
use crate::utils;
use anyhow::Context;
use std::fmt;
use std::fs;
use std::path::PathBuf;

const BLOB_HRP: &str = "rxblob";

/// A line of a commerce order created from an approved order request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub label: String,
    pub requested_days: u32,
    pub prescription_ids: Vec<u64>,
    pub requires_prescription: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub customer_id: u64,
    pub line_items: Vec<LineItem>,
    pub note: String,
}

pub trait Commerce: Send + Sync {
    /// Whether the order holds at least one item flagged as prescription-only.
    /// Unknown orders are not eligible.
    fn order_requires_prescription(&self, order_id: u64) -> anyhow::Result<bool>;

    fn create_order(&self, order: NewOrder) -> anyhow::Result<u64>;
}

pub trait BlobStore: Send + Sync {
    fn save(&self, owner_id: u64, file: &UploadFile) -> anyhow::Result<FileRef>;

    fn delete(&self, reference: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserProfile {
    pub display_name: String,
    pub email: String,
    pub login: String,
}

pub trait IdentityProvider: Send + Sync {
    fn profile(&self, user_id: u64) -> anyhow::Result<Option<UserProfile>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PrescriptionUploaded,
    PrescriptionApproved,
    PrescriptionRejected,
    OrderRequestCreated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    User(u64),
    Staff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: EventKind,
    pub entity_id: u64,
    pub recipient: Recipient,
    pub detail: Option<String>,
}

/// Fire and forget. Errors are logged by the caller and never undo the
/// operation that produced the event.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PrescriptionUploaded => "prescription.uploaded",
            EventKind::PrescriptionApproved => "prescription.approved",
            EventKind::PrescriptionRejected => "prescription.rejected",
            EventKind::OrderRequestCreated => "order_request.created",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stores uploads as flat files under `root`, one file per reference.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create blob root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path_of(&self, reference: &str) -> anyhow::Result<PathBuf> {
        // references are bech32, anything else could escape the root
        let (hrp, _) = bech32::decode(reference)
            .with_context(|| format!("malformed blob reference '{reference}'"))?;
        if hrp.as_str() != BLOB_HRP {
            anyhow::bail!("foreign blob reference '{reference}'");
        }
        Ok(self.root.join(reference))
    }
}

impl BlobStore for FsBlobStore {
    fn save(&self, owner_id: u64, file: &UploadFile) -> anyhow::Result<FileRef> {
        let reference = utils::new_uuid_to_bech32(BLOB_HRP)?;
        let path = self.root.join(&reference);
        fs::write(&path, &file.bytes)
            .with_context(|| format!("failed to write blob for owner {owner_id}"))?;

        tracing::debug!(owner_id, %reference, size = file.size(), "stored upload");

        Ok(FileRef {
            reference,
            file_name: file.file_name.clone(),
            content_type: file.content_type.clone(),
            size: file.size(),
            sha256: sha256::digest(&file.bytes),
        })
    }

    fn delete(&self, reference: &str) -> anyhow::Result<()> {
        let path = self.path_of(reference)?;
        fs::remove_file(&path).with_context(|| format!("failed to remove blob {reference}"))?;
        Ok(())
    }
}

/// Default notifier: writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        tracing::info!(
            event = notification.kind.name(),
            entity_id = notification.entity_id,
            recipient = ?notification.recipient,
            detail = notification.detail.as_deref().unwrap_or(""),
            "notification"
        );
        Ok(())
    }
}
