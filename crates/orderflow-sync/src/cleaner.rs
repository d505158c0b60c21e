//! Transform stage: normalize staged rows into destination-shaped records.
//!
//! Rule order matters. Rows missing Cost or Sales are dropped before the numeric
//! coercion, so a present but non-numeric Cost survives as a null Cost.

use std::collections::HashSet;

use chrono::NaiveDate;
use orderflow_core::{fields, CleanedRecord, EtlError, EtlResult, Record, RecordSet, Value};
use serde::Serialize;
use tracing::{info, warn};

pub const ORDER_DATE_FORMAT: &str = "%d/%m/%Y";
pub const DEFAULT_TEXT: &str = "Unknown";
pub const DEFAULT_NUMBER: f64 = 0.0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub input_rows: usize,
    pub duplicates_removed: usize,
    pub unparsable_dates: usize,
    pub dropped_missing_measures: usize,
    pub output_rows: usize,
    pub skipped_missing_order_date: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub records: Vec<CleanedRecord>,
    pub stats: TransformStats,
}

pub fn transform_records(batch: RecordSet) -> EtlResult<TransformOutput> {
    let mut stats = TransformStats {
        input_rows: batch.len(),
        ..TransformStats::default()
    };

    if !batch.has_column(fields::ORDER_DATE) {
        warn!(
            rows = batch.len(),
            "staged batch has no Order_Date column; skipping transformation"
        );
        stats.skipped_missing_order_date = true;
        return Ok(TransformOutput {
            records: Vec::new(),
            stats,
        });
    }

    let mut seen = HashSet::with_capacity(batch.len());
    let mut unique = Vec::with_capacity(batch.len());
    for record in batch.into_records() {
        if seen.contains(&record) {
            stats.duplicates_removed += 1;
        } else {
            seen.insert(record.clone());
            unique.push(record);
        }
    }
    drop(seen);

    let mut records = Vec::with_capacity(unique.len());
    for mut record in unique {
        if normalize_order_date(&mut record) {
            stats.unparsable_dates += 1;
        }
        record.rename(fields::ASSIGNED_SUPERVISOR_SOURCE, fields::ASSIGNED_SUPERVISOR);

        if record.is_missing(fields::COST) || record.is_missing(fields::SALES) {
            stats.dropped_missing_measures += 1;
            continue;
        }
        coerce_numeric(&mut record, fields::COST);
        coerce_numeric(&mut record, fields::SALES);

        let order_number = canonical_order_number(record.get(fields::ORDER_NUMBER))?;
        records.push(into_cleaned(&record, order_number));
    }

    stats.output_rows = records.len();
    info!(
        input = stats.input_rows,
        duplicates = stats.duplicates_removed,
        unparsable_dates = stats.unparsable_dates,
        dropped = stats.dropped_missing_measures,
        output = stats.output_rows,
        "batch transformed"
    );
    Ok(TransformOutput { records, stats })
}

/// `31/01/2024` -> 2024-01-31. Returns true when a non-null value failed to parse and was
/// nulled.
fn normalize_order_date(record: &mut Record) -> bool {
    let parsed = match record.get(fields::ORDER_DATE) {
        Some(Value::Text(text)) => parse_order_date(text),
        _ => return false,
    };
    let failed = parsed.is_none();
    record.insert(
        fields::ORDER_DATE,
        parsed.map_or(Value::Null, Value::Date),
    );
    failed
}

pub fn parse_order_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), ORDER_DATE_FORMAT).ok()
}

fn coerce_numeric(record: &mut Record, field: &str) {
    if let Some(value) = record.get(field) {
        let coerced = value.parse_number().map_or(Value::Null, Value::Number);
        record.insert(field, coerced);
    }
}

/// Integer-then-string form of Order_Number: `" 1001 "` and `"1001.0"` both become `"1001"`.
pub fn canonical_order_number(value: Option<&Value>) -> EtlResult<String> {
    let value = value.unwrap_or(&Value::Null);
    let as_integer = |n: f64| {
        (n.is_finite() && n.fract() == 0.0 && n >= 0.0 && n <= u64::MAX as f64).then(|| n as u64)
    };
    let parsed = match value {
        Value::Text(text) => {
            let text = text.trim();
            text.parse::<u64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(as_integer))
        }
        Value::Number(n) => as_integer(*n),
        Value::Null | Value::Date(_) => None,
    };
    parsed
        .map(|n| n.to_string())
        .ok_or_else(|| EtlError::value(fields::ORDER_NUMBER, value, "is not a non-negative integer"))
}

fn text_or_default(record: &Record, field: &str) -> String {
    match record.get(field) {
        None | Some(Value::Null) => DEFAULT_TEXT.to_string(),
        Some(value) => value.to_string(),
    }
}

fn number_or_default(record: &Record, field: &str) -> f64 {
    record
        .get(field)
        .and_then(Value::parse_number)
        .unwrap_or(DEFAULT_NUMBER)
}

fn measure(record: &Record, field: &str) -> Option<f64> {
    match record.get(field) {
        Some(Value::Number(n)) => Some(*n),
        _ => None,
    }
}

fn into_cleaned(record: &Record, order_number: String) -> CleanedRecord {
    CleanedRecord {
        order_number,
        state_code: text_or_default(record, fields::STATE_CODE),
        customer_name: text_or_default(record, fields::CUSTOMER_NAME),
        order_date: match record.get(fields::ORDER_DATE) {
            Some(Value::Date(date)) => Some(*date),
            _ => None,
        },
        status: text_or_default(record, fields::STATUS),
        product: text_or_default(record, fields::PRODUCT),
        category: text_or_default(record, fields::CATEGORY),
        brand: text_or_default(record, fields::BRAND),
        cost: measure(record, fields::COST),
        sales: measure(record, fields::SALES),
        quantity: number_or_default(record, fields::QUANTITY),
        total_cost: number_or_default(record, fields::TOTAL_COST),
        total_sales: number_or_default(record, fields::TOTAL_SALES),
        assigned_supervisor: text_or_default(record, fields::ASSIGNED_SUPERVISOR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: [&str; 6] = [
        fields::ORDER_NUMBER,
        fields::ORDER_DATE,
        fields::COST,
        fields::SALES,
        fields::QUANTITY,
        fields::ASSIGNED_SUPERVISOR_SOURCE,
    ];

    fn cell(value: Option<&str>) -> Value {
        value.map_or(Value::Null, Value::text)
    }

    fn row(cells: [Option<&str>; 6]) -> Record {
        Record::from_pairs(COLUMNS.iter().zip(cells).map(|(c, v)| (*c, cell(v))))
    }

    fn batch(rows: Vec<Record>) -> RecordSet {
        RecordSet::with_records(COLUMNS.iter().map(|c| c.to_string()).collect(), rows)
    }

    #[test]
    fn day_month_year_dates_become_calendar_dates() {
        let out = transform_records(batch(vec![row([
            Some("3001"),
            Some("31/01/2024"),
            Some("10"),
            Some("12"),
            Some("1"),
            Some("Ann"),
        ])]))
        .expect("transform");

        let record = &out.records[0];
        assert_eq!(record.order_date, NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(
            record.order_date.map(|d| d.format("%Y-%m-%d").to_string()).as_deref(),
            Some("2024-01-31")
        );
        assert_eq!(record.assigned_supervisor, "Ann");
    }

    #[test]
    fn unparsable_dates_become_null_without_dropping_the_row() {
        let out = transform_records(batch(vec![
            row([Some("1"), Some("2024-03-01"), Some("1"), Some("2"), None, None]),
            row([Some("2"), Some("30/02/2024"), Some("1"), Some("2"), None, None]),
            row([Some("3"), None, Some("1"), Some("2"), None, None]),
        ]))
        .expect("transform");

        assert_eq!(out.records.len(), 3);
        assert!(out.records.iter().all(|r| r.order_date.is_none()));
        assert_eq!(out.stats.unparsable_dates, 2);
    }

    #[test]
    fn empty_cost_drops_the_row() {
        let out = transform_records(batch(vec![
            row([Some("1"), Some("01/01/2024"), None, Some("5"), None, None]),
            row([Some("2"), Some("01/01/2024"), Some("5"), None, None, None]),
            row([Some("3"), Some("01/01/2024"), Some("5"), Some("6"), None, None]),
        ]))
        .expect("transform");

        let kept: Vec<_> = out.records.iter().map(|r| r.order_number.as_str()).collect();
        assert_eq!(kept, vec!["3"]);
        assert_eq!(out.stats.dropped_missing_measures, 2);
    }

    #[test]
    fn non_numeric_cost_survives_as_null() {
        let out = transform_records(batch(vec![row([
            Some("1"),
            Some("01/01/2024"),
            Some("abc"),
            Some(" 7.25 "),
            None,
            None,
        ])]))
        .expect("transform");

        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].cost, None);
        assert_eq!(out.records[0].sales, Some(7.25));
    }

    #[test]
    fn exact_duplicates_collapse_but_near_duplicates_remain() {
        let a = row([Some("1"), Some("01/01/2024"), Some("5"), Some("6"), None, None]);
        let b = row([Some("1"), Some("01/01/2024"), Some("5"), Some("7"), None, None]);
        let out = transform_records(batch(vec![a.clone(), a, b])).expect("transform");

        assert_eq!(out.stats.duplicates_removed, 1);
        assert_eq!(out.records.len(), 2);
    }

    #[test]
    fn missing_order_date_column_skips_the_batch() {
        let columns = vec![fields::ORDER_NUMBER.to_string(), fields::COST.to_string()];
        let record = Record::from_pairs([
            (fields::ORDER_NUMBER, Value::text("1")),
            (fields::COST, Value::text("2")),
        ]);
        let out = transform_records(RecordSet::with_records(columns, vec![record]))
            .expect("skip is not an error");

        assert!(out.records.is_empty());
        assert!(out.stats.skipped_missing_order_date);
    }

    #[test]
    fn optional_fields_take_defaults() {
        let out = transform_records(batch(vec![row([
            Some("42"),
            Some("01/01/2024"),
            Some("1"),
            Some("2"),
            Some("lots"),
            None,
        ])]))
        .expect("transform");

        let record = &out.records[0];
        assert_eq!(record.state_code, DEFAULT_TEXT);
        assert_eq!(record.customer_name, DEFAULT_TEXT);
        assert_eq!(record.status, DEFAULT_TEXT);
        assert_eq!(record.product, DEFAULT_TEXT);
        assert_eq!(record.category, DEFAULT_TEXT);
        assert_eq!(record.brand, DEFAULT_TEXT);
        assert_eq!(record.assigned_supervisor, DEFAULT_TEXT);
        assert_eq!(record.quantity, DEFAULT_NUMBER);
        assert_eq!(record.total_cost, DEFAULT_NUMBER);
        assert_eq!(record.total_sales, DEFAULT_NUMBER);
    }

    #[test]
    fn order_numbers_are_canonical_non_negative_integers() {
        assert_eq!(canonical_order_number(Some(&Value::text(" 1001 "))).unwrap(), "1001");
        assert_eq!(canonical_order_number(Some(&Value::text("1001.0"))).unwrap(), "1001");
        assert_eq!(canonical_order_number(Some(&Value::text("+7"))).unwrap(), "7");
        assert_eq!(canonical_order_number(Some(&Value::Number(12.0))).unwrap(), "12");

        for bad in ["ORD-1", "10.5", "-3", ""] {
            let err = canonical_order_number(Some(&Value::text(bad))).expect_err(bad);
            assert_eq!(err.kind(), "ValueError");
        }
        assert!(canonical_order_number(None).is_err());
    }

    #[test]
    fn bad_order_number_fails_the_stage() {
        let err = transform_records(batch(vec![
            row([Some("1"), Some("01/01/2024"), Some("1"), Some("2"), None, None]),
            row([Some("X-2"), Some("01/01/2024"), Some("1"), Some("2"), None, None]),
        ]))
        .expect_err("value error");
        assert!(matches!(err, EtlError::Value { .. }));
    }

    #[test]
    fn bad_order_number_on_a_dropped_row_is_ignored() {
        let out = transform_records(batch(vec![row([
            Some("X-2"),
            Some("01/01/2024"),
            None,
            Some("2"),
            None,
            None,
        ])]))
        .expect("dropped before coercion");
        assert!(out.records.is_empty());
    }
}
