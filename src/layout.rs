use crate::error::LayoutError;
use crate::types::Color;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;

pub const DEFAULT_FONT_FAMILY: &str = "Helvetica";
pub const DEFAULT_FONT_SIZE: f64 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    #[serde(alias = "rect")]
    Rectangle,
    Line,
    #[serde(alias = "circle")]
    Ellipse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    #[default]
    Left,
    Center,
    Right,
}

/// One placed element of a certificate layout.
///
/// `x`, `y`, `width` and `height` are fractions of the page width/height with
/// the origin at the top-left corner, never pixels or points. For text, `y`
/// is the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutField {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: FieldKind,
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_font_family")]
    pub font_family: String,
    #[serde(default = "default_font_size")]
    pub font_size: f64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub align: Align,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_value: Option<String>,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: f64,
    #[serde(default)]
    pub filled: bool,
}

fn default_font_family() -> String {
    DEFAULT_FONT_FAMILY.to_string()
}

fn default_font_size() -> f64 {
    DEFAULT_FONT_SIZE
}

fn default_color() -> String {
    "#000000".to_string()
}

fn default_stroke_width() -> f64 {
    1.0
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(text) => text,
        Id::Number(number) => number.to_string(),
    })
}

impl LayoutField {
    pub fn text(id: impl Into<String>, label: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            kind: FieldKind::Text,
            x,
            y,
            font_family: default_font_family(),
            font_size: DEFAULT_FONT_SIZE,
            label: label.into(),
            align: Align::Left,
            static_value: None,
            width: 0.0,
            height: 0.0,
            color: default_color(),
            stroke_width: default_stroke_width(),
            filled: false,
        }
    }

    pub fn shape(id: impl Into<String>, kind: FieldKind, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            kind,
            width,
            height,
            ..Self::text(id, "", x, y)
        }
    }

    pub fn with_align(mut self, align: Align) -> Self {
        self.align = align;
        self
    }

    pub fn with_font(mut self, family: impl Into<String>, size: f64) -> Self {
        self.font_family = family.into();
        self.font_size = size;
        self
    }

    pub fn with_static_value(mut self, value: impl Into<String>) -> Self {
        self.static_value = Some(value.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn filled(mut self, filled: bool) -> Self {
        self.filled = filled;
        self
    }

    pub fn is_text(&self) -> bool {
        self.kind == FieldKind::Text
    }

    /// Parsed fill/stroke colour; black when the stored value does not parse.
    pub fn rgb(&self) -> Color {
        Color::from_hex(&self.color).unwrap_or(Color::BLACK)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        let fraction = |attribute: &'static str, value: f64| {
            if value.is_finite() && (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(LayoutError::OutOfRange {
                    field: self.id.clone(),
                    attribute,
                    value,
                })
            }
        };
        fraction("x", self.x)?;
        fraction("y", self.y)?;
        fraction("width", self.width)?;
        fraction("height", self.height)?;
        if !self.font_size.is_finite() || self.font_size <= 0.0 {
            return Err(LayoutError::InvalidFontSize {
                field: self.id.clone(),
                value: self.font_size,
            });
        }
        if !self.stroke_width.is_finite() || self.stroke_width < 0.0 {
            return Err(LayoutError::OutOfRange {
                field: self.id.clone(),
                attribute: "strokeWidth",
                value: self.stroke_width,
            });
        }
        if Color::from_hex(&self.color).is_none() {
            return Err(LayoutError::InvalidColor {
                field: self.id.clone(),
                value: self.color.clone(),
            });
        }
        Ok(())
    }
}

/// Validates every field and rejects duplicate ids.
pub fn validate_layout(fields: &[LayoutField]) -> Result<(), LayoutError> {
    let mut seen = HashSet::new();
    for field in fields {
        field.validate()?;
        if !seen.insert(field.id.as_str()) {
            return Err(LayoutError::DuplicateId(field.id.clone()));
        }
    }
    Ok(())
}

/// Reads the layout editor's JSON array of fields and validates it.
pub fn parse_layout_json(json: &str) -> Result<Vec<LayoutField>, LayoutError> {
    let fields: Vec<LayoutField> =
        serde_json::from_str(json).map_err(|err| LayoutError::Json(err.to_string()))?;
    validate_layout(&fields)?;
    Ok(fields)
}
