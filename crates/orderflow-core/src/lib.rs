//! Core record model and error taxonomy for the orderflow ETL pipeline.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::NaiveDate;
use serde::{Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "orderflow-core";

/// Column names of the online-order dataset.
pub mod fields {
    pub const ORDER_NUMBER: &str = "Order_Number";
    pub const STATE_CODE: &str = "State_Code";
    pub const CUSTOMER_NAME: &str = "Customer_Name";
    pub const ORDER_DATE: &str = "Order_Date";
    pub const STATUS: &str = "Status";
    pub const PRODUCT: &str = "Product";
    pub const CATEGORY: &str = "Category";
    pub const BRAND: &str = "Brand";
    pub const COST: &str = "Cost";
    pub const SALES: &str = "Sales";
    pub const QUANTITY: &str = "Quantity";
    pub const TOTAL_COST: &str = "Total_Cost";
    pub const TOTAL_SALES: &str = "Total_Sales";
    pub const ASSIGNED_SUPERVISOR: &str = "Assigned_Supervisor";
    /// Header spelling used by the upstream dataset.
    pub const ASSIGNED_SUPERVISOR_SOURCE: &str = "Assigned Supervisor";
}

/// Destination table column order.
pub const DESTINATION_COLUMNS: [&str; 14] = [
    fields::ORDER_NUMBER,
    fields::STATE_CODE,
    fields::CUSTOMER_NAME,
    fields::ORDER_DATE,
    fields::STATUS,
    fields::PRODUCT,
    fields::CATEGORY,
    fields::BRAND,
    fields::COST,
    fields::SALES,
    fields::QUANTITY,
    fields::TOTAL_COST,
    fields::TOTAL_SALES,
    fields::ASSIGNED_SUPERVISOR,
];

/// A single cell. Extraction yields only `Null` and `Text`.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Lenient numeric reading; anything that is not a finite number is `None`.
    pub fn parse_number(&self) -> Option<f64> {
        let n = match self {
            Value::Number(n) => *n,
            Value::Text(s) => s.trim().parse::<f64>().ok()?,
            Value::Null | Value::Date(_) => return None,
        };
        n.is_finite().then_some(n)
    }

    /// Text form used when writing a raw value back to a store.
    pub fn to_db_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::Date(a), Value::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Text(s) => s.hash(state),
            Value::Number(n) => n.to_bits().hash(state),
            Value::Date(d) => d.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Text(s) => f.write_str(s),
            Value::Number(n) => write!(f, "{n}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::Date(d) => d.serialize(serializer),
        }
    }
}

/// Ordered mapping of field names to values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut record = Self::new();
        for (name, value) in pairs {
            record.insert(name, value);
        }
        record
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == name)
    }

    /// Absent or null.
    pub fn is_missing(&self, name: &str) -> bool {
        self.get(name).map_or(true, Value::is_null)
    }

    /// Replaces the value in place when the field exists, otherwise appends it.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Renames `from` to `to`, keeping its position. An existing `to` field is replaced.
    /// Returns false when `from` is absent.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        if from == to {
            return self.contains(from);
        }
        if !self.contains(from) {
            return false;
        }
        self.fields.retain(|(k, _)| k != to);
        if let Some((name, _)) = self.fields.iter_mut().find(|(k, _)| k == from) {
            *name = to.to_string();
        }
        true
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Header plus rows, as produced by extraction and passed between stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    columns: Vec<String>,
    records: Vec<Record>,
}

impl RecordSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            records: Vec::new(),
        }
    }

    pub fn with_records(columns: Vec<String>, records: Vec<Record>) -> Self {
        Self { columns, records }
    }

    /// Same header, no rows.
    pub fn empty_like(&self) -> Self {
        Self::new(self.columns.clone())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Staging comparison key: trimmed text, or an integral number without a fraction.
pub fn order_key(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(format!("{}", *n as i64)),
        Value::Number(n) => Some(n.to_string()),
        Value::Null | Value::Date(_) => None,
    }
}

/// A row that passed the transform stage, shaped like the destination table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanedRecord {
    #[serde(rename = "Order_Number")]
    pub order_number: String,
    #[serde(rename = "State_Code")]
    pub state_code: String,
    #[serde(rename = "Customer_Name")]
    pub customer_name: String,
    #[serde(rename = "Order_Date")]
    pub order_date: Option<NaiveDate>,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Product")]
    pub product: String,
    #[serde(rename = "Category")]
    pub category: String,
    #[serde(rename = "Brand")]
    pub brand: String,
    #[serde(rename = "Cost")]
    pub cost: Option<f64>,
    #[serde(rename = "Sales")]
    pub sales: Option<f64>,
    #[serde(rename = "Quantity")]
    pub quantity: f64,
    #[serde(rename = "Total_Cost")]
    pub total_cost: f64,
    #[serde(rename = "Total_Sales")]
    pub total_sales: f64,
    #[serde(rename = "Assigned_Supervisor")]
    pub assigned_supervisor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Download,
    Extract,
    Stage,
    Transform,
    Upsert,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Download => "download",
            PipelineStage::Extract => "extract",
            PipelineStage::Stage => "stage",
            PipelineStage::Transform => "transform",
            PipelineStage::Upsert => "upsert",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("schema error: `{column}` {detail}")]
    Schema { column: String, detail: String },
    #[error("format error in {path}: {reason}")]
    Format { path: String, reason: String },
    #[error("value error: `{field}` value {value:?} {reason}")]
    Value {
        field: String,
        value: String,
        reason: String,
    },
    #[error("connection error: {store} store unreachable: {message}")]
    Connection { store: String, message: String },
    #[error("database error in {store} store: {message}")]
    Database { store: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EtlError {
    pub fn schema(column: &str, detail: impl Into<String>) -> Self {
        EtlError::Schema {
            column: column.to_string(),
            detail: detail.into(),
        }
    }

    pub fn format(path: impl fmt::Display, reason: impl fmt::Display) -> Self {
        EtlError::Format {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn value(field: &str, value: &Value, reason: impl Into<String>) -> Self {
        EtlError::Value {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn connection(store: &str, message: impl fmt::Display) -> Self {
        EtlError::Connection {
            store: store.to_string(),
            message: message.to_string(),
        }
    }

    pub fn database(store: &str, message: impl fmt::Display) -> Self {
        EtlError::Database {
            store: store.to_string(),
            message: message.to_string(),
        }
    }

    /// Short class name for logs and run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::Schema { .. } => "SchemaError",
            EtlError::Format { .. } => "FormatError",
            EtlError::Value { .. } => "ValueError",
            EtlError::Connection { .. } => "ConnectionError",
            EtlError::Database { .. } => "DatabaseError",
            EtlError::Io(_) => "IoError",
        }
    }
}

pub type EtlResult<T> = Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn rename_keeps_position_and_replaces_target() {
        let mut record = Record::from_pairs([
            ("a", Value::text("1")),
            ("Assigned Supervisor", Value::text("Ann")),
            ("Assigned_Supervisor", Value::Null),
            ("z", Value::Null),
        ]);

        assert!(record.rename("Assigned Supervisor", "Assigned_Supervisor"));
        let names: Vec<_> = record.fields().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a", "Assigned_Supervisor", "z"]);
        assert_eq!(record.get("Assigned_Supervisor"), Some(&Value::text("Ann")));
        assert!(!record.rename("Assigned Supervisor", "Assigned_Supervisor"));
    }

    #[test]
    fn rename_drops_earlier_target_field() {
        let mut record = Record::from_pairs([("to", Value::Null), ("from", Value::text("x"))]);
        assert!(record.rename("from", "to"));
        assert_eq!(record.len(), 1);
        assert_eq!(record.get("to"), Some(&Value::text("x")));
    }

    #[test]
    fn identical_records_hash_equal() {
        let a = Record::from_pairs([("Cost", Value::text("10")), ("Sales", Value::Null)]);
        let b = a.clone();
        let c = Record::from_pairs([("Cost", Value::text("10")), ("Sales", Value::text(""))]);
        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn parse_number_rejects_non_finite_and_garbage() {
        assert_eq!(Value::text(" 12.5 ").parse_number(), Some(12.5));
        assert_eq!(Value::text("NaN").parse_number(), None);
        assert_eq!(Value::text("inf").parse_number(), None);
        assert_eq!(Value::text("1,200").parse_number(), None);
        assert_eq!(Value::Null.parse_number(), None);
    }

    #[test]
    fn order_key_trims_and_normalizes_integral_numbers() {
        assert_eq!(order_key(&Value::text(" 1001 ")), Some("1001".into()));
        assert_eq!(order_key(&Value::Number(1002.0)), Some("1002".into()));
        assert_eq!(order_key(&Value::text("   ")), None);
        assert_eq!(order_key(&Value::Null), None);
    }

    #[test]
    fn cleaned_record_serializes_with_destination_column_names() {
        let record = CleanedRecord {
            order_number: "2002".into(),
            state_code: "CA".into(),
            customer_name: "Unknown".into(),
            order_date: NaiveDate::from_ymd_opt(2024, 1, 31),
            status: "Delivered".into(),
            product: "Phone".into(),
            category: "Electronics".into(),
            brand: "Acme".into(),
            cost: Some(10.0),
            sales: None,
            quantity: 1.0,
            total_cost: 10.0,
            total_sales: 0.0,
            assigned_supervisor: "Unknown".into(),
        };
        let json = serde_json::to_value(&record).expect("serialize");
        let keys: Vec<_> = json.as_object().expect("object").keys().cloned().collect();
        for column in DESTINATION_COLUMNS {
            assert!(keys.iter().any(|k| k == column), "missing {column}");
        }
        assert_eq!(json["Order_Date"], "2024-01-31");
        assert!(json["Sales"].is_null());
    }

    #[test]
    fn error_kinds_match_taxonomy() {
        assert_eq!(EtlError::schema("Order_Number", "missing").kind(), "SchemaError");
        assert_eq!(EtlError::format("a.csv", "bad").kind(), "FormatError");
        assert_eq!(
            EtlError::value("Order_Number", &Value::text("x"), "is not an integer").kind(),
            "ValueError"
        );
        assert_eq!(EtlError::connection("destination", "refused").kind(), "ConnectionError");
    }
}
