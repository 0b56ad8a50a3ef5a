//! Human readable prescription identifiers.
//!
//! The formatted id is shown to patients and staff and is also accepted as a
//! search key, so it has to be a pure function of the stored record.
use crate::prescription::{Category, TimeStamp};
use chrono::Utc;

const LAB_PREFIX: &str = "Lab";
const MED_PREFIX: &str = "Med";

pub fn prefix(category: Category) -> &'static str {
    match category {
        Category::LabTest => LAB_PREFIX,
        Category::Medicine => MED_PREFIX,
    }
}

/// `<Prefix>-<dd-mm-yy>-<id>`, e.g. `Med-09-03-24-12`.
///
/// The numeric id is the last segment, so two records can only share a
/// formatted id if they share an id.
pub fn format(category: Category, created_at: &TimeStamp<Utc>, id: u64) -> String {
    format!(
        "{}-{}-{}",
        prefix(category),
        created_at.to_datetime_utc().format("%d-%m-%y"),
        id
    )
}
