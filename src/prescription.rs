//! Prescription records and the value types they are built from
use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Ordering;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    #[n(0)]
    Medicine,
    #[n(1)]
    LabTest,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrescriptionStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

// informational only
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    #[n(0)]
    Web,
    #[n(1)]
    Admin,
    #[n(2)]
    Api,
}

/// A stored upload, as handed back by the blob store.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    #[n(0)]
    pub reference: String, // opaque, only the blob store can resolve it
    #[n(1)]
    pub file_name: String,
    #[n(2)]
    pub content_type: String,
    #[n(3)]
    pub size: u64,
    #[n(4)]
    pub sha256: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Prescription {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub owner_id: u64,
    #[n(2)]
    pub bound_order_id: Option<u64>,
    #[n(3)]
    pub files: Vec<FileRef>,
    #[n(4)]
    pub category: Category,
    #[n(5)]
    pub status: PrescriptionStatus,
    #[n(6)]
    pub rejection_reason: Option<String>,
    #[n(7)]
    pub origin: Origin,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    /// `None` for a date or time that does not exist.
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

// Utc itself is not ordered, so the derive would never apply
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Medicine => "medicine",
            Category::LabTest => "lab_test",
        }
    }
}

impl PrescriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrescriptionStatus::Pending => "pending",
            PrescriptionStatus::Approved => "approved",
            PrescriptionStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for PrescriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Prescription {
    /// Human readable identifier, see [`crate::formatter::format`].
    pub fn display_id(&self) -> String {
        crate::formatter::format(self.category, &self.created_at, self.id)
    }

    pub fn is_bound(&self) -> bool {
        self.bound_order_id.is_some()
    }
}
