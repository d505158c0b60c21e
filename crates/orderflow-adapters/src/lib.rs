//! Tabular source adapters: turn a downloaded file into a `RecordSet`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use orderflow_core::{EtlError, EtlResult, Record, RecordSet, Value};
use tracing::info;

pub const CRATE_NAME: &str = "orderflow-adapters";

/// Cells that extract as `Null` (compared after trimming).
pub const MISSING_TOKENS: &[&str] = &[
    "", "NA", "N/A", "n/a", "NULL", "null", "NaN", "nan", "#N/A", "None",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    Csv,
    Tsv,
}

impl TabularFormat {
    pub fn delimiter(self) -> u8 {
        match self {
            TabularFormat::Csv => b',',
            TabularFormat::Tsv => b'\t',
        }
    }
}

pub trait TabularAdapter: Send + Sync {
    fn format(&self) -> TabularFormat;

    /// `origin` only labels errors.
    fn parse_bytes(&self, origin: &str, bytes: &[u8]) -> EtlResult<RecordSet>;

    fn extract(&self, path: &Path) -> EtlResult<RecordSet> {
        let bytes = fs::read(path).map_err(|err| EtlError::format(path.display(), err))?;
        self.parse_bytes(&path.display().to_string(), &bytes)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DelimitedAdapter {
    format: TabularFormat,
}

impl DelimitedAdapter {
    pub fn new(format: TabularFormat) -> Self {
        Self { format }
    }
}

impl TabularAdapter for DelimitedAdapter {
    fn format(&self) -> TabularFormat {
        self.format
    }

    fn parse_bytes(&self, origin: &str, bytes: &[u8]) -> EtlResult<RecordSet> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.format.delimiter())
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let headers = reader
            .headers()
            .map_err(|err| EtlError::format(origin, err))?
            .clone();
        if headers.is_empty() {
            return Err(EtlError::format(origin, "file has no header row"));
        }

        let mut seen = HashSet::new();
        let mut columns = Vec::with_capacity(headers.len());
        for (idx, name) in headers.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(EtlError::format(origin, format!("header column {} is empty", idx + 1)));
            }
            if !seen.insert(name) {
                return Err(EtlError::format(origin, format!("duplicate header column `{name}`")));
            }
            columns.push(name.to_string());
        }

        let mut set = RecordSet::new(columns.clone());
        for row in reader.records() {
            let row = row.map_err(|err| EtlError::format(origin, err))?;
            if row.len() > columns.len() {
                let line = row.position().map_or(0, |p| p.line());
                return Err(EtlError::format(
                    origin,
                    format!(
                        "line {line} has {} fields but the header has {}",
                        row.len(),
                        columns.len()
                    ),
                ));
            }
            // Short rows are padded with nulls.
            let record = Record::from_pairs(columns.iter().enumerate().map(|(idx, name)| {
                (name.clone(), row.get(idx).map_or(Value::Null, cell_value))
            }));
            set.push(record);
        }

        Ok(set)
    }
}

fn cell_value(cell: &str) -> Value {
    if MISSING_TOKENS.contains(&cell.trim()) {
        Value::Null
    } else {
        Value::Text(cell.to_string())
    }
}

pub fn csv_adapter() -> impl TabularAdapter {
    DelimitedAdapter::new(TabularFormat::Csv)
}

/// Picks an adapter from the file extension; unknown extensions are read as CSV.
pub fn adapter_for_path(path: &Path) -> Box<dyn TabularAdapter> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("tsv") | Some("tab") => Box::new(DelimitedAdapter::new(TabularFormat::Tsv)),
        _ => Box::new(DelimitedAdapter::new(TabularFormat::Csv)),
    }
}

/// The extract stage: read `path` into records, preserving header names and row order.
pub fn extract_file(path: impl AsRef<Path>) -> EtlResult<RecordSet> {
    let path = path.as_ref();
    let adapter = adapter_for_path(path);
    let set = adapter.extract(path)?;
    info!(
        path = %path.display(),
        format = ?adapter.format(),
        columns = set.columns().len(),
        rows = set.len(),
        "extracted tabular file"
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "Order_Number,Order_Date,Cost,Sales,Assigned Supervisor\n\
1001,31/01/2024,10.5,20,Ann\n\
1002,01/02/2024,,NA,Bob\n";

    #[test]
    fn csv_preserves_header_and_row_order() {
        let set = csv_adapter()
            .parse_bytes("sample.csv", SAMPLE.as_bytes())
            .expect("parse");

        assert_eq!(
            set.columns(),
            &["Order_Number", "Order_Date", "Cost", "Sales", "Assigned Supervisor"]
        );
        assert_eq!(set.len(), 2);
        let first = &set.records()[0];
        assert_eq!(first.get("Order_Number"), Some(&Value::text("1001")));
        assert_eq!(first.get("Assigned Supervisor"), Some(&Value::text("Ann")));
        let names: Vec<_> = first.fields().map(|(k, _)| k).collect();
        let expected: Vec<_> = set.columns().iter().map(String::as_str).collect();
        assert_eq!(names, expected);
        assert_eq!(set.records()[1].get("Order_Number"), Some(&Value::text("1002")));
    }

    #[test]
    fn missing_tokens_become_null() {
        let set = csv_adapter()
            .parse_bytes("sample.csv", SAMPLE.as_bytes())
            .expect("parse");
        let second = &set.records()[1];
        assert_eq!(second.get("Cost"), Some(&Value::Null));
        assert_eq!(second.get("Sales"), Some(&Value::Null));
    }

    #[test]
    fn rows_with_extra_fields_are_format_errors() {
        let err = csv_adapter()
            .parse_bytes("bad.csv", b"a,b\n1,2\n1,2,3\n")
            .expect_err("extra field");
        assert!(matches!(err, EtlError::Format { .. }));
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn short_rows_are_padded_with_nulls() {
        let set = csv_adapter()
            .parse_bytes(
                "short.csv",
                b"Order_Number,Order_Date,Cost,Sales\n1,31/01/2024,3,4\n2,31/01/2024,3\n",
            )
            .expect("parse");

        assert_eq!(set.len(), 2);
        let short = &set.records()[1];
        assert_eq!(short.get("Order_Number"), Some(&Value::text("2")));
        assert_eq!(short.get("Cost"), Some(&Value::text("3")));
        assert_eq!(short.get("Sales"), Some(&Value::Null));
        assert_eq!(short.fields().count(), 4);
    }

    #[test]
    fn empty_and_duplicate_headers_are_format_errors() {
        assert!(matches!(
            csv_adapter().parse_bytes("empty.csv", b""),
            Err(EtlError::Format { .. })
        ));
        assert!(matches!(
            csv_adapter().parse_bytes("dup.csv", b"a,a\n1,2\n"),
            Err(EtlError::Format { .. })
        ));
    }

    #[test]
    fn header_only_file_yields_empty_set() {
        let set = csv_adapter()
            .parse_bytes("h.csv", b"Order_Number,Cost\n")
            .expect("parse");
        assert!(set.is_empty());
        assert!(set.has_column("Cost"));
    }

    #[test]
    fn invalid_utf8_is_a_format_error() {
        let err = csv_adapter()
            .parse_bytes("latin1.csv", b"name\n\xff\xfe\n")
            .expect_err("invalid utf8");
        assert!(matches!(err, EtlError::Format { .. }));
    }

    #[test]
    fn extension_selects_tsv_adapter() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("orders.tsv");
        fs::write(&path, "Order_Number\tCost\n7\t1.5\n").expect("write");

        let set = extract_file(&path).expect("extract");
        assert_eq!(set.records()[0].get("Cost"), Some(&Value::text("1.5")));
        assert_eq!(adapter_for_path(&path).format(), TabularFormat::Tsv);
    }

    #[test]
    fn unreadable_file_is_a_format_error() {
        let dir = tempdir().expect("tempdir");
        let err = extract_file(dir.path().join("missing.csv")).expect_err("missing");
        assert_eq!(err.kind(), "FormatError");
    }
}
