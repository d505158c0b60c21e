use orderflow_core::{CleanedRecord, EtlResult};
use serde::Serialize;
use tracing::info;

use crate::store::DestinationStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub attempted: usize,
    pub inserted: u64,
    pub skipped: u64,
}

/// Insert-or-skip every record; existing Order_Numbers are left untouched.
pub async fn upsert_records<D>(records: &[CleanedRecord], store: &mut D) -> EtlResult<UpsertReport>
where
    D: DestinationStore + ?Sized,
{
    let attempted = records.len();
    let inserted = if records.is_empty() {
        0
    } else {
        store.insert_or_skip(records).await?
    };
    let report = UpsertReport {
        attempted,
        inserted,
        skipped: (attempted as u64).saturating_sub(inserted),
    };
    info!(attempted, inserted, skipped = report.skipped, "upserted cleaned records");
    Ok(report)
}
