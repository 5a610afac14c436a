use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Format,
    Structural,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    UnsupportedFormat(String),
    EmptyInput,
    MalformedHeader(String),
    EmptySheet,
    NoHeaderRow,
    NoDataRows,
    RowTooWide {
        row: usize,
        expected: usize,
        found: usize,
    },
    Workbook(String),
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::UnsupportedFormat(_) | IngestError::Workbook(_) => ErrorClass::Format,
            IngestError::EmptyInput
            | IngestError::MalformedHeader(_)
            | IngestError::EmptySheet
            | IngestError::NoHeaderRow
            | IngestError::NoDataRows
            | IngestError::RowTooWide { .. } => ErrorClass::Structural,
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::UnsupportedFormat(ext) => write!(f, "unsupported file format: {}", ext),
            IngestError::EmptyInput => write!(f, "input contains no rows"),
            IngestError::MalformedHeader(message) => {
                write!(f, "first row cannot be used as a header: {}", message)
            }
            IngestError::EmptySheet => write!(f, "workbook contains no sheets"),
            IngestError::NoHeaderRow => write!(f, "first sheet has no header row"),
            IngestError::NoDataRows => write!(f, "first sheet has a header row but no data rows"),
            IngestError::RowTooWide {
                row,
                expected,
                found,
            } => write!(
                f,
                "row {} has {} values but the header has {} columns",
                row, found, expected
            ),
            IngestError::Workbook(message) => write!(f, "unreadable workbook: {}", message),
        }
    }
}

impl std::error::Error for IngestError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    MissingColumn(String),
    UnknownFont(String),
    /// Characters the field's font cannot draw; each was rendered as `?`.
    UnrepresentableText { font: String, replaced: usize },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldError::MissingColumn(label) => {
                write!(f, "the data has no column named \"{}\"", label)
            }
            FieldError::UnknownFont(family) => write!(f, "font \"{}\" is not available", family),
            FieldError::UnrepresentableText { font, replaced } => write!(
                f,
                "font \"{}\" cannot display {} character(s) of this value; they were replaced with \"?\"",
                font, replaced
            ),
        }
    }
}

impl std::error::Error for FieldError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationFailure {
    Field(FieldError),
    Timeout,
    Render(String),
}

impl GenerationFailure {
    pub fn reason_code(&self) -> &'static str {
        match self {
            GenerationFailure::Field(FieldError::MissingColumn(_)) => "missing_column",
            GenerationFailure::Field(FieldError::UnknownFont(_)) => "unknown_font",
            GenerationFailure::Field(FieldError::UnrepresentableText { .. }) => {
                "unrepresentable_text"
            }
            GenerationFailure::Timeout => "timeout",
            GenerationFailure::Render(_) => "render_error",
        }
    }
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationFailure::Field(err) => write!(f, "{}", err),
            GenerationFailure::Timeout => {
                write!(f, "generation did not finish before the deadline")
            }
            // Internal detail stays in the debug log; users get a stable message.
            GenerationFailure::Render(_) => write!(f, "the document could not be rendered"),
        }
    }
}

impl std::error::Error for GenerationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GenerationFailure::Field(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FieldError> for GenerationFailure {
    fn from(value: FieldError) -> Self {
        GenerationFailure::Field(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayoutError {
    OutOfRange {
        field: String,
        attribute: &'static str,
        value: f64,
    },
    InvalidFontSize {
        field: String,
        value: f64,
    },
    InvalidColor {
        field: String,
        value: String,
    },
    DuplicateId(String),
    Json(String),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::OutOfRange {
                field,
                attribute,
                value,
            } => write!(
                f,
                "field {}: {} must be within 0..=1, got {}",
                field, attribute, value
            ),
            LayoutError::InvalidFontSize { field, value } => {
                write!(f, "field {}: font size must be positive, got {}", field, value)
            }
            LayoutError::InvalidColor { field, value } => {
                write!(f, "field {}: invalid color {:?}", field, value)
            }
            LayoutError::DuplicateId(id) => write!(f, "duplicate field id {}", id),
            LayoutError::Json(message) => write!(f, "invalid layout json: {}", message),
        }
    }
}

impl std::error::Error for LayoutError {}

#[derive(Debug)]
pub enum CertForgeError {
    Ingest(IngestError),
    Layout(LayoutError),
    InvalidConfiguration(String),
    Asset(String),
    Io(std::io::Error),
}

impl fmt::Display for CertForgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertForgeError::Ingest(err) => write!(f, "ingest error: {}", err),
            CertForgeError::Layout(err) => write!(f, "layout error: {}", err),
            CertForgeError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            CertForgeError::Asset(message) => write!(f, "asset error: {}", message),
            CertForgeError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for CertForgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CertForgeError::Ingest(err) => Some(err),
            CertForgeError::Layout(err) => Some(err),
            CertForgeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CertForgeError {
    fn from(value: std::io::Error) -> Self {
        CertForgeError::Io(value)
    }
}

impl From<IngestError> for CertForgeError {
    fn from(value: IngestError) -> Self {
        CertForgeError::Ingest(value)
    }
}

impl From<LayoutError> for CertForgeError {
    fn from(value: LayoutError) -> Self {
        CertForgeError::Layout(value)
    }
}
