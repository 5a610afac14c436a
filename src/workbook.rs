use crate::error::IngestError;
use crate::table::Table;
use crate::zip::{ZipArchive, has_zip_signature};
use chrono::{NaiveDate, NaiveTime, TimeDelta};
use roxmltree::{Document as XmlDocument, Node};
use std::collections::HashMap;

const OLE_SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const DEFAULT_WORKBOOK_PART: &str = "xl/workbook.xml";
// Excel's last column is XFD.
const MAX_COLUMNS: usize = 16_384;
// Serial numbers past this are outside Excel's calendar (year 9999).
const MAX_DATE_SERIAL: f64 = 2_958_465.0;

fn corrupt(message: impl Into<String>) -> IngestError {
    IngestError::Workbook(message.into())
}

/// Reads the first sheet of an Office Open XML workbook into a [`Table`].
///
/// Row 1 is the header row. Every cell is stringified: numbers in shortest
/// form, date-formatted numbers as ISO dates, booleans as `TRUE`/`FALSE`.
/// Rows without any non-empty cell are skipped.
pub fn parse_workbook(bytes: &[u8]) -> Result<Table, IngestError> {
    if bytes.starts_with(&OLE_SIGNATURE) {
        return Err(IngestError::UnsupportedFormat(
            "xls (legacy binary workbook)".to_string(),
        ));
    }
    if !has_zip_signature(bytes) {
        return Err(corrupt("not a zip-based workbook container"));
    }
    let archive = ZipArchive::parse(bytes)?;

    let workbook_path = office_document_path(&archive)?;
    let workbook_xml = read_text(&archive, &workbook_path)?
        .ok_or_else(|| corrupt(format!("missing {}", workbook_path)))?;
    let workbook = parse_xml(&workbook_xml, &workbook_path)?;
    let date1904 = workbook
        .descendants()
        .find(|node| node.has_tag_name_local("workbookPr"))
        .and_then(|node| node.attribute("date1904"))
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let Some(first_sheet) = workbook
        .descendants()
        .find(|node| node.has_tag_name_local("sheet"))
    else {
        return Err(IngestError::EmptySheet);
    };
    let sheet_rel_id = attribute_local(first_sheet, "id").map(str::to_string);

    let rels_path = relationships_path(&workbook_path);
    let rels = match read_text(&archive, &rels_path)? {
        Some(text) => parse_relationships(&text, &rels_path, &workbook_path)?,
        None => Vec::new(),
    };
    let find_rel = |suffix: &str| {
        rels.iter()
            .find(|rel| rel.kind.ends_with(suffix))
            .map(|rel| rel.target.clone())
    };

    let sheet_path = sheet_rel_id
        .and_then(|id| rels.iter().find(|rel| rel.id == id).map(|rel| rel.target.clone()))
        .unwrap_or_else(|| "xl/worksheets/sheet1.xml".to_string());
    let shared_path =
        find_rel("/sharedStrings").unwrap_or_else(|| "xl/sharedStrings.xml".to_string());
    let styles_path = find_rel("/styles").unwrap_or_else(|| "xl/styles.xml".to_string());

    let shared_strings = match read_text(&archive, &shared_path)? {
        Some(text) => parse_shared_strings(&text, &shared_path)?,
        None => Vec::new(),
    };
    let date_styles = match read_text(&archive, &styles_path)? {
        Some(text) => parse_date_styles(&text, &styles_path)?,
        None => Vec::new(),
    };
    let sheet_xml = read_text(&archive, &sheet_path)?
        .ok_or_else(|| corrupt(format!("missing {}", sheet_path)))?;

    let context = CellContext {
        shared_strings: &shared_strings,
        date_styles: &date_styles,
        date1904,
    };
    let mut records = read_sheet_rows(&sheet_xml, &sheet_path, &context)?;
    match records.len() {
        0 => return Err(IngestError::NoHeaderRow),
        1 => return Err(IngestError::NoDataRows),
        _ => {}
    }
    // Styled but empty cells often trail the header row.
    let header = &mut records[0];
    while header.last().is_some_and(|cell| cell.is_empty()) {
        header.pop();
    }
    Table::from_records(records)
}

trait LocalName {
    fn has_tag_name_local(&self, name: &str) -> bool;
}

impl LocalName for Node<'_, '_> {
    fn has_tag_name_local(&self, name: &str) -> bool {
        self.is_element() && self.tag_name().name() == name
    }
}

fn attribute_local<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.attributes()
        .find(|attr| attr.name() == name && attr.namespace().is_some())
        .or_else(|| node.attributes().find(|attr| attr.name() == name))
        .map(|attr| attr.value())
}

fn read_text(archive: &ZipArchive<'_>, path: &str) -> Result<Option<String>, IngestError> {
    let Some(bytes) = archive.read(path)? else {
        return Ok(None);
    };
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| corrupt(format!("{} is not valid UTF-8", path)))
}

fn parse_xml<'a>(text: &'a str, path: &str) -> Result<XmlDocument<'a>, IngestError> {
    XmlDocument::parse(text).map_err(|err| corrupt(format!("{}: {}", path, err)))
}

fn office_document_path(archive: &ZipArchive<'_>) -> Result<String, IngestError> {
    let Some(text) = read_text(archive, "_rels/.rels")? else {
        return Ok(DEFAULT_WORKBOOK_PART.to_string());
    };
    let rels = parse_relationships(&text, "_rels/.rels", "")?;
    Ok(rels
        .into_iter()
        .find(|rel| rel.kind.ends_with("/officeDocument"))
        .map(|rel| rel.target)
        .unwrap_or_else(|| DEFAULT_WORKBOOK_PART.to_string()))
}

#[derive(Debug, Clone)]
struct Relationship {
    id: String,
    kind: String,
    target: String,
}

fn relationships_path(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", part),
    }
}

fn parse_relationships(
    text: &str,
    path: &str,
    source_part: &str,
) -> Result<Vec<Relationship>, IngestError> {
    let doc = parse_xml(text, path)?;
    let base_dir = source_part.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    Ok(doc
        .descendants()
        .filter(|node| node.has_tag_name_local("Relationship"))
        .filter_map(|node| {
            let target = node.attribute("Target")?;
            Some(Relationship {
                id: node.attribute("Id").unwrap_or_default().to_string(),
                kind: node.attribute("Type").unwrap_or_default().to_string(),
                target: resolve_part_path(base_dir, target),
            })
        })
        .collect())
}

fn resolve_part_path(base_dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut segments: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn parse_shared_strings(text: &str, path: &str) -> Result<Vec<String>, IngestError> {
    let doc = parse_xml(text, path)?;
    Ok(doc
        .descendants()
        .filter(|node| node.has_tag_name_local("si"))
        .map(rich_text)
        .collect())
}

/// Concatenates the `t` runs of a string item, skipping phonetic guides.
fn rich_text(node: Node<'_, '_>) -> String {
    let mut out = String::new();
    for child in node.descendants() {
        if !child.has_tag_name_local("t") {
            continue;
        }
        let in_phonetic = child
            .ancestors()
            .take_while(|ancestor| *ancestor != node)
            .any(|ancestor| ancestor.has_tag_name_local("rPh"));
        if !in_phonetic {
            out.push_str(child.text().unwrap_or(""));
        }
    }
    out
}

/// One flag per `cellXfs` entry: does that style display numbers as dates?
fn parse_date_styles(text: &str, path: &str) -> Result<Vec<bool>, IngestError> {
    let doc = parse_xml(text, path)?;
    let mut custom: HashMap<u32, bool> = HashMap::new();
    for fmt in doc
        .descendants()
        .filter(|node| node.has_tag_name_local("numFmt"))
    {
        let Some(id) = fmt.attribute("numFmtId").and_then(|v| v.parse::<u32>().ok()) else {
            continue;
        };
        custom.insert(id, is_date_format_code(fmt.attribute("formatCode").unwrap_or("")));
    }
    let Some(cell_xfs) = doc
        .descendants()
        .find(|node| node.has_tag_name_local("cellXfs"))
    else {
        return Ok(Vec::new());
    };
    Ok(cell_xfs
        .children()
        .filter(|node| node.has_tag_name_local("xf"))
        .map(|xf| {
            let id = xf
                .attribute("numFmtId")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0);
            custom
                .get(&id)
                .copied()
                .unwrap_or_else(|| is_builtin_date_format(id))
        })
        .collect())
}

fn is_builtin_date_format(id: u32) -> bool {
    matches!(id, 14..=22 | 27..=36 | 45..=47 | 50..=58)
}

fn is_date_format_code(code: &str) -> bool {
    let mut stripped = String::new();
    let mut chars = code.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                for inner in chars.by_ref() {
                    if inner == '"' {
                        break;
                    }
                }
            }
            '[' => {
                let mut bracket = String::new();
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    bracket.push(inner);
                }
                // Elapsed-time tokens like [h] or [mm] are time; colours and locales are not.
                let lower = bracket.to_ascii_lowercase();
                if !lower.is_empty() && lower.chars().all(|c| matches!(c, 'h' | 'm' | 's')) {
                    stripped.push('h');
                }
            }
            '\\' | '_' | '*' => {
                chars.next();
            }
            other => stripped.push(other.to_ascii_lowercase()),
        }
    }
    stripped
        .chars()
        .any(|c| matches!(c, 'd' | 'm' | 'y' | 'h' | 's'))
}

struct CellContext<'a> {
    shared_strings: &'a [String],
    date_styles: &'a [bool],
    date1904: bool,
}

fn read_sheet_rows(
    text: &str,
    path: &str,
    context: &CellContext<'_>,
) -> Result<Vec<Vec<String>>, IngestError> {
    let doc = parse_xml(text, path)?;
    let mut records = Vec::new();
    for row in doc
        .descendants()
        .filter(|node| node.has_tag_name_local("row"))
    {
        let mut record: Vec<String> = Vec::new();
        let mut next_column = 0usize;
        for cell in row.children().filter(|node| node.has_tag_name_local("c")) {
            let column = cell
                .attribute("r")
                .and_then(column_index_from_reference)
                .unwrap_or(next_column);
            if column >= MAX_COLUMNS {
                return Err(IngestError::Workbook(format!(
                    "{}: cell {} is past the last column (XFD)",
                    path,
                    cell.attribute("r").unwrap_or("?")
                )));
            }
            next_column = column + 1;
            let value = cell_value(cell, context);
            if record.len() <= column {
                record.resize(column + 1, String::new());
            }
            record[column] = value;
        }
        if record.iter().any(|cell| !cell.is_empty()) {
            records.push(record);
        }
    }
    Ok(records)
}

/// `"B3"` → `1`. Returns `None` when the reference has no column letters;
/// overlong references saturate instead of wrapping.
fn column_index_from_reference(reference: &str) -> Option<usize> {
    let mut index = 0usize;
    let mut seen = false;
    for ch in reference.chars() {
        if !ch.is_ascii_alphabetic() {
            break;
        }
        seen = true;
        index = index
            .saturating_mul(26)
            .saturating_add((ch.to_ascii_uppercase() as u8 - b'A') as usize + 1);
    }
    if seen { Some(index - 1) } else { None }
}

fn cell_value(cell: Node<'_, '_>, context: &CellContext<'_>) -> String {
    let raw = cell
        .children()
        .find(|node| node.has_tag_name_local("v"))
        .and_then(|node| node.text())
        .unwrap_or("");
    match cell.attribute("t").unwrap_or("n") {
        "s" => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|index| context.shared_strings.get(index))
            .cloned()
            .unwrap_or_default(),
        "inlineStr" => cell
            .children()
            .find(|node| node.has_tag_name_local("is"))
            .map(rich_text)
            .unwrap_or_default(),
        "b" => {
            if raw.trim() == "1" || raw.trim().eq_ignore_ascii_case("true") {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        "str" | "e" | "d" => raw.to_string(),
        _ => {
            let Ok(number) = raw.trim().parse::<f64>() else {
                return raw.to_string();
            };
            let is_date = cell
                .attribute("s")
                .and_then(|v| v.parse::<usize>().ok())
                .and_then(|style| context.date_styles.get(style))
                .copied()
                .unwrap_or(false);
            if is_date {
                if let Some(text) = serial_to_string(number, context.date1904) {
                    return text;
                }
            }
            format_number(number)
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn serial_to_string(serial: f64, date1904: bool) -> Option<String> {
    if !serial.is_finite() || serial < 0.0 || serial > MAX_DATE_SERIAL {
        return None;
    }
    let mut days = serial.floor() as i64;
    let mut seconds = ((serial - serial.floor()) * 86_400.0).round() as i64;
    if seconds >= 86_400 {
        days += 1;
        seconds -= 86_400;
    }
    let time = NaiveTime::from_num_seconds_from_midnight_opt(seconds as u32, 0)?;
    let time_text = time.format("%H:%M:%S").to_string();
    if days == 0 && seconds > 0 && !date1904 {
        return Some(time_text);
    }

    let date_text = if !date1904 && days == 60 {
        // Excel's phantom 1900-02-29.
        "1900-02-29".to_string()
    } else {
        let (base, offset) = if date1904 {
            (NaiveDate::from_ymd_opt(1904, 1, 1)?, days)
        } else if days > 60 {
            (NaiveDate::from_ymd_opt(1899, 12, 31)?, days - 1)
        } else {
            (NaiveDate::from_ymd_opt(1899, 12, 31)?, days)
        };
        base.checked_add_signed(TimeDelta::days(offset))?
            .format("%Y-%m-%d")
            .to_string()
    };
    if seconds == 0 {
        Some(date_text)
    } else {
        Some(format!("{} {}", date_text, time_text))
    }
}
