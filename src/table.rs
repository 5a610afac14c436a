use crate::error::IngestError;
use std::collections::{BTreeMap, HashMap};

/// Normalized header/rows form of ingested tabular data.
///
/// Every row holds exactly `headers.len()` cells. Headers are not required to be
/// unique; lookups by name resolve to the first matching column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Builds a table from raw records: the first record is the header row.
    ///
    /// Short records are right-padded with empty cells. Records longer than the
    /// header keep their values only when the excess cells are all empty; a
    /// non-empty excess cell would otherwise be lost and is rejected.
    pub fn from_records(records: Vec<Vec<String>>) -> Result<Self, IngestError> {
        let mut records = records.into_iter();
        let Some(headers) = records.next() else {
            return Ok(Table::default());
        };
        let width = headers.len();
        let mut rows = Vec::new();
        for (index, mut record) in records.enumerate() {
            if record.len() > width {
                if record[width..].iter().any(|cell| !cell.is_empty()) {
                    return Err(IngestError::RowTooWide {
                        row: index + 1,
                        expected: width,
                        found: record.len(),
                    });
                }
                record.truncate(width);
            }
            record.resize(width, String::new());
            rows.push(record);
        }
        Ok(Table { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|cells| Row {
            headers: &self.headers,
            cells,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(|cells| Row {
            headers: &self.headers,
            cells,
        })
    }
}

/// Borrowed view of one data row, addressable by header name.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    headers: &'a [String],
    cells: &'a [String],
}

impl<'a> Row<'a> {
    pub fn cells(&self) -> &'a [String] {
        self.cells
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        let index = self.headers.iter().position(|header| header == name)?;
        self.cells.get(index).map(String::as_str)
    }
}

/// Anything a layout field label can be looked up in.
pub trait FieldSource {
    fn value(&self, label: &str) -> Option<&str>;
}

impl FieldSource for Row<'_> {
    fn value(&self, label: &str) -> Option<&str> {
        self.get(label)
    }
}

impl FieldSource for HashMap<String, String> {
    fn value(&self, label: &str) -> Option<&str> {
        self.get(label).map(String::as_str)
    }
}

impl FieldSource for BTreeMap<String, String> {
    fn value(&self, label: &str) -> Option<&str> {
        self.get(label).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn short_rows_are_padded_not_dropped() {
        let table = Table::from_records(vec![rec(&["a", "b", "c"]), rec(&["1"]), rec(&[])])
            .expect("table");
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0], rec(&["1", "", ""]));
        assert_eq!(table.rows()[1], rec(&["", "", ""]));
    }

    #[test]
    fn empty_excess_cells_are_trimmed() {
        let table = Table::from_records(vec![rec(&["a", "b"]), rec(&["1", "2", "", ""])])
            .expect("table");
        assert_eq!(table.rows()[0], rec(&["1", "2"]));
    }

    #[test]
    fn non_empty_excess_cells_are_rejected() {
        let err = Table::from_records(vec![rec(&["a"]), rec(&["1"]), rec(&["1", "lost"])])
            .expect_err("too wide");
        assert_eq!(
            err,
            IngestError::RowTooWide {
                row: 2,
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn duplicate_headers_resolve_to_first_column() {
        let table = Table::from_records(vec![rec(&["Name", "Name"]), rec(&["first", "second"])])
            .expect("table");
        let row = table.row(0).expect("row");
        assert_eq!(row.get("Name"), Some("first"));
        assert_eq!(row.get("Missing"), None);
        assert_eq!(table.column_index("Name"), Some(0));
    }

    #[test]
    fn no_records_yields_empty_table() {
        let table = Table::from_records(Vec::new()).expect("table");
        assert!(table.headers().is_empty());
        assert!(table.is_empty());
    }
}
