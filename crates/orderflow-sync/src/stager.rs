//! Stage step: append only the rows whose Order_Number the staging table has never seen.

use orderflow_core::{fields, order_key, EtlError, EtlResult, RecordSet};
use tracing::{debug, info};

use crate::store::StagingStore;

#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    /// New rows, in input order. This is what the transform stage consumes.
    pub batch: RecordSet,
    pub incoming: usize,
    pub already_staged: usize,
    pub appended: u64,
}

pub async fn stage_records<S>(records: RecordSet, store: &mut S) -> EtlResult<StageOutcome>
where
    S: StagingStore + ?Sized,
{
    if !records.has_column(fields::ORDER_NUMBER) {
        return Err(EtlError::schema(fields::ORDER_NUMBER, "column is absent from the extracted header"));
    }

    // Keys are resolved up front so a bad row fails before the store is touched.
    let mut keys = Vec::with_capacity(records.len());
    for (idx, record) in records.records().iter().enumerate() {
        let key = record
            .get(fields::ORDER_NUMBER)
            .and_then(order_key)
            .ok_or_else(|| EtlError::schema(fields::ORDER_NUMBER, format!("is missing on row {}", idx + 1)))?;
        keys.push(key);
    }

    let existing = store.existing_order_numbers().await?;
    debug!(existing = existing.len(), "loaded staged order numbers");

    let incoming = records.len();
    let mut batch = records.empty_like();
    for (record, key) in records.into_records().into_iter().zip(keys) {
        if !existing.contains(&key) {
            batch.push(record);
        }
    }
    let already_staged = incoming - batch.len();

    if batch.is_empty() {
        info!(incoming, "no new rows to stage");
        return Ok(StageOutcome {
            batch,
            incoming,
            already_staged,
            appended: 0,
        });
    }

    let appended = store.append(&batch).await?;
    info!(incoming, already_staged, appended, "staged new rows");
    Ok(StageOutcome {
        batch,
        incoming,
        already_staged,
        appended,
    })
}
