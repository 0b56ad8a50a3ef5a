//! Fake collaborators shared by the integration tests.
#![allow(dead_code)]

use rx_approval::collaborators::{
    BlobStore, Commerce, IdentityProvider, NewOrder, Notification, Notifier, UserProfile,
};
use rx_approval::config::Config;
use rx_approval::prescription::FileRef;
use rx_approval::service::{Collaborators, PharmacyService};
use rx_approval::upload::UploadFile;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const RX_ORDER: u64 = 100;
pub const OTHER_RX_ORDER: u64 = 200;
pub const PLAIN_ORDER: u64 = 300;

#[derive(Default)]
pub struct FakeCommerce {
    rx_orders: Mutex<HashSet<u64>>,
    next_order: AtomicU64,
    pub created: Mutex<Vec<NewOrder>>,
    pub fail_create: AtomicBool,
    pub unreachable: AtomicBool,
    /// Runs once, right after the next order is created.
    pub after_create: Mutex<Option<Box<dyn FnOnce(u64) + Send>>>,
}

impl FakeCommerce {
    pub fn with_rx_orders(orders: &[u64]) -> Self {
        let commerce = Self::default();
        commerce.next_order.store(5000, Ordering::SeqCst);
        commerce.rx_orders.lock().unwrap().extend(orders);
        commerce
    }
}

impl Commerce for FakeCommerce {
    fn order_requires_prescription(&self, order_id: u64) -> anyhow::Result<bool> {
        if self.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("commerce api timed out");
        }
        Ok(self.rx_orders.lock().unwrap().contains(&order_id))
    }

    fn create_order(&self, order: NewOrder) -> anyhow::Result<u64> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("order creation refused");
        }
        let id = self.next_order.fetch_add(1, Ordering::SeqCst);
        if order.line_items.iter().any(|l| l.requires_prescription) {
            self.rx_orders.lock().unwrap().insert(id);
        }
        self.created.lock().unwrap().push(order);
        if let Some(hook) = self.after_create.lock().unwrap().take() {
            hook(id);
        }
        Ok(id)
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    counter: AtomicU64,
    /// Fail every save once this many blobs have been written.
    pub fail_after: Mutex<Option<usize>>,
    pub fail_delete: AtomicBool,
}

impl MemoryBlobStore {
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

impl BlobStore for MemoryBlobStore {
    fn save(&self, owner_id: u64, file: &UploadFile) -> anyhow::Result<FileRef> {
        let mut blobs = self.blobs.lock().unwrap();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if blobs.len() >= limit {
                anyhow::bail!("disk full");
            }
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let reference = format!("mem-{owner_id}-{n}");
        blobs.insert(reference.clone(), file.bytes.clone());
        Ok(FileRef {
            reference,
            file_name: file.file_name.clone(),
            content_type: file.content_type.clone(),
            size: file.size(),
            sha256: String::new(),
        })
    }

    fn delete(&self, reference: &str) -> anyhow::Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            anyhow::bail!("permission denied");
        }
        self.blobs.lock().unwrap().remove(reference);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeIdentity {
    pub profiles: HashMap<u64, UserProfile>,
}

impl IdentityProvider for FakeIdentity {
    fn profile(&self, user_id: u64) -> anyhow::Result<Option<UserProfile>> {
        Ok(self.profiles.get(&user_id).cloned())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
    pub broken: AtomicBool,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.kind.name())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            anyhow::bail!("smtp relay unavailable");
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct Harness {
    // keeps the database directory alive for the test
    pub dir: TempDir,
    pub db: Arc<sled::Db>,
    pub service: PharmacyService,
    pub commerce: Arc<FakeCommerce>,
    pub blobs: Arc<MemoryBlobStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub const ALICE: u64 = 7;
pub const BOB: u64 = 9;

fn profile(name: &str, email: &str, login: &str) -> UserProfile {
    UserProfile {
        display_name: name.to_string(),
        email: email.to_string(),
        login: login.to_string(),
    }
}

pub fn harness() -> anyhow::Result<Harness> {
    harness_with(Config::default())
}

pub fn harness_with(config: Config) -> anyhow::Result<Harness> {
    rx_approval::logger::init_logger(&config.log_level);

    // Sled locks its directory, so every test gets its own database.
    let dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(dir.path().join("rx.db"))?);

    let commerce = Arc::new(FakeCommerce::with_rx_orders(&[RX_ORDER, OTHER_RX_ORDER]));
    let blobs = Arc::new(MemoryBlobStore::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let identity = Arc::new(FakeIdentity {
        profiles: HashMap::from([
            (ALICE, profile("Alice Moreau", "alice@example.org", "amoreau")),
            (BOB, profile("Bob Tanaka", "bob.t@example.net", "btanaka")),
        ]),
    });

    let service = PharmacyService::new(
        db.clone(),
        &config,
        Collaborators {
            commerce: commerce.clone(),
            blobs: blobs.clone(),
            identity,
            notifier: notifier.clone(),
        },
    )?;

    Ok(Harness {
        dir,
        db,
        service,
        commerce,
        blobs,
        notifier,
    })
}

pub fn scan(name: &str) -> UploadFile {
    UploadFile::new(name, "application/pdf", b"%PDF-1.7 prescription".to_vec())
}
