use crate::error::IngestError;
use crate::table::Table;
use std::iter::Peekable;
use std::str::Chars;

const DELIMITER: char = ',';
const QUOTE: char = '"';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldEnd {
    Delimiter,
    Record,
    Input,
}

struct Field {
    text: String,
    quoted: bool,
    end: FieldEnd,
}

/// Splits delimited text into records.
///
/// `\r\n`, `\n` and a lone `\r` all terminate a record. A quoted field that is
/// still open at end of input keeps whatever it accumulated. A line holding a
/// single unquoted empty field is a blank line and produces no record. A line
/// holding only `""` is kept as one empty field, so a single-column table with
/// an empty cell survives `write_table` and back.
pub fn parse_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut lone_quoted = false;
    let mut chars = text.chars().peekable();

    loop {
        let field = read_field(&mut chars);
        if record.is_empty() {
            lone_quoted = field.quoted;
        }
        record.push(field.text);
        if field.end == FieldEnd::Delimiter {
            continue;
        }
        let record_done = std::mem::take(&mut record);
        let blank = record_done.len() == 1 && record_done[0].is_empty() && !lone_quoted;
        if !blank {
            records.push(record_done);
        }
        if field.end == FieldEnd::Input {
            break;
        }
    }
    records
}

fn read_field(chars: &mut Peekable<Chars<'_>>) -> Field {
    let mut text = String::new();
    let quoted = chars.peek() == Some(&QUOTE);
    if quoted {
        chars.next();
        loop {
            match chars.next() {
                None => {
                    return Field {
                        text,
                        quoted,
                        end: FieldEnd::Input,
                    };
                }
                Some(QUOTE) => {
                    if chars.peek() == Some(&QUOTE) {
                        chars.next();
                        text.push(QUOTE);
                    } else {
                        break;
                    }
                }
                Some(ch) => text.push(ch),
            }
        }
    }

    // Unquoted content, or stray characters after a closing quote.
    let end = loop {
        match chars.next() {
            None => break FieldEnd::Input,
            Some(DELIMITER) => break FieldEnd::Delimiter,
            Some('\n') => break FieldEnd::Record,
            Some('\r') => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                break FieldEnd::Record;
            }
            Some(ch) => text.push(ch),
        }
    };
    Field { text, quoted, end }
}

/// Parses delimited text into a [`Table`]. Zero records yield an empty table.
pub fn parse_table(text: &str) -> Result<Table, IngestError> {
    Table::from_records(parse_records(text))
}

/// Serializes a table as comma-separated text that [`parse_table`] reads back
/// into an identical table.
pub fn write_table(table: &Table) -> String {
    let mut out = String::new();
    if table.headers().is_empty() {
        return out;
    }
    write_record(&mut out, table.headers());
    for row in table.rows() {
        write_record(&mut out, row);
    }
    out
}

fn write_record(out: &mut String, cells: &[String]) {
    for (index, cell) in cells.iter().enumerate() {
        if index > 0 {
            out.push(DELIMITER);
        }
        // A lone empty cell must be quoted or it reads back as a blank line.
        if needs_quotes(cell) || (cells.len() == 1 && cell.is_empty()) {
            out.push(QUOTE);
            for ch in cell.chars() {
                if ch == QUOTE {
                    out.push(QUOTE);
                }
                out.push(ch);
            }
            out.push(QUOTE);
        } else {
            out.push_str(cell);
        }
    }
    out.push('\n');
}

fn needs_quotes(cell: &str) -> bool {
    cell.starts_with(' ')
        || cell.ends_with(' ')
        || cell
            .chars()
            .any(|ch| ch == DELIMITER || ch == QUOTE || ch == '\r' || ch == '\n')
}
