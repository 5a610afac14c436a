use crate::csv;
use crate::error::IngestError;
use crate::table::Table;
use crate::workbook;
use encoding_rs::{UTF_16BE, UTF_16LE, WINDOWS_1252};
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Delimited,
    Workbook,
}

impl InputFormat {
    /// Accepts a bare extension (`csv`, `.xlsx`) or a file name (`grads.XLS`).
    pub fn from_hint(hint: &str) -> Result<Self, IngestError> {
        let trimmed = hint.trim();
        let ext = match trimmed.rsplit_once('.') {
            Some((_, ext)) => ext,
            None => trimmed,
        };
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Ok(InputFormat::Delimited),
            "xlsx" | "xls" => Ok(InputFormat::Workbook),
            _ => Err(IngestError::UnsupportedFormat(ext.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InputFormat::Delimited => "csv",
            InputFormat::Workbook => "workbook",
        }
    }
}

/// Parses uploaded tabular bytes into a [`Table`] with at least a header row.
pub fn parse(bytes: &[u8], format_hint: &str) -> Result<Table, IngestError> {
    let table = match InputFormat::from_hint(format_hint)? {
        InputFormat::Delimited => csv::parse_table(&decode_text(bytes))?,
        InputFormat::Workbook => workbook::parse_workbook(bytes)?,
    };
    if table.headers().is_empty() {
        return Err(IngestError::EmptyInput);
    }
    if table.headers().iter().all(|header| header.trim().is_empty()) {
        return Err(IngestError::MalformedHeader(
            "every header cell is blank".to_string(),
        ));
    }
    Ok(table)
}

/// Decodes delimited-text bytes: BOM-marked UTF-8/UTF-16, plain UTF-8, and
/// otherwise Windows-1252 so that no byte of a legacy export is discarded.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    if let Some(rest) = bytes.strip_prefix(b"\xEF\xBB\xBF") {
        return String::from_utf8_lossy(rest);
    }
    if bytes.starts_with(b"\xFF\xFE") {
        let (text, _) = UTF_16LE.decode_with_bom_removal(bytes);
        return text;
    }
    if bytes.starts_with(b"\xFE\xFF") {
        let (text, _) = UTF_16BE.decode_with_bom_removal(bytes);
        return text;
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => {
            let (text, _, _) = WINDOWS_1252.decode(bytes);
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_dispatch_by_extension() {
        assert_eq!(InputFormat::from_hint("csv"), Ok(InputFormat::Delimited));
        assert_eq!(InputFormat::from_hint(".XLSX"), Ok(InputFormat::Workbook));
        assert_eq!(InputFormat::from_hint("class of 2024.xls"), Ok(InputFormat::Workbook));
        assert_eq!(
            InputFormat::from_hint("report.pdf"),
            Err(IngestError::UnsupportedFormat("pdf".to_string()))
        );
    }

    #[test]
    fn unsupported_format_names_extension_and_is_format_class() {
        let err = parse(b"a,b", "tsv").expect_err("unsupported");
        assert_eq!(err, IngestError::UnsupportedFormat("tsv".to_string()));
        assert_eq!(err.class(), crate::error::ErrorClass::Format);
        assert!(err.to_string().contains("tsv"));
    }

    #[test]
    fn zero_rows_is_empty_input() {
        assert_eq!(parse(b"", "csv"), Err(IngestError::EmptyInput));
        assert_eq!(parse(b"\r\n\n", "csv"), Err(IngestError::EmptyInput));
    }

    #[test]
    fn blank_header_row_is_malformed() {
        let err = parse(b" , \nAlice,Bob\n", "csv").expect_err("blank header");
        assert!(matches!(err, IngestError::MalformedHeader(_)));
        assert_eq!(err.class(), crate::error::ErrorClass::Structural);
    }

    #[test]
    fn header_only_csv_is_a_valid_table() {
        let table = parse(b"Name,Course\n", "csv").expect("table");
        assert_eq!(table.headers(), ["Name", "Course"]);
        assert!(table.is_empty());
    }

    #[test]
    fn legacy_encodings_are_decoded_without_loss() {
        let table = parse(b"Name\nJos\xE9\n", "csv").expect("table");
        assert_eq!(table.rows()[0], ["José"]);

        let table = parse(b"\xEF\xBB\xBFName\nZo\xC3\xAB\n", "csv").expect("table");
        assert_eq!(table.headers(), ["Name"]);
        assert_eq!(table.rows()[0], ["Zoë"]);

        let utf16: Vec<u8> = [0xFF, 0xFE]
            .into_iter()
            .chain("N\nA\n".encode_utf16().flat_map(|unit| unit.to_le_bytes()))
            .collect();
        let table = parse(&utf16, "csv").expect("table");
        assert_eq!(table.headers(), ["N"]);
        assert_eq!(table.rows()[0], ["A"]);
    }
}
