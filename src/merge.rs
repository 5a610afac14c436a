use crate::canvas::Canvas;
use crate::error::{FieldError, GenerationFailure};
use crate::font::{FontRegistry, ResolvedFont};
use crate::geometry::PageGeometry;
use crate::layout::{Align, FieldKind, LayoutField};
use crate::pdf::{self, PdfOptions, PdfStats};
use crate::table::FieldSource;
use crate::template::TemplateImage;
use crate::types::Pt;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    #[default]
    Binary,
    Base64,
}

impl OutputEncoding {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "binary" | "pdf" => Some(OutputEncoding::Binary),
            "base64" => Some(OutputEncoding::Base64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputEncoding::Binary => "binary",
            OutputEncoding::Base64 => "base64",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedDocument {
    Binary(Vec<u8>),
    Base64(String),
}

impl RenderedDocument {
    fn encode(bytes: Vec<u8>, encoding: OutputEncoding) -> Self {
        match encoding {
            OutputEncoding::Binary => RenderedDocument::Binary(bytes),
            OutputEncoding::Base64 => {
                RenderedDocument::Base64(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
        }
    }

    /// Raw PDF bytes regardless of the transport encoding.
    pub fn pdf_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self {
            RenderedDocument::Binary(bytes) => Ok(bytes.clone()),
            RenderedDocument::Base64(text) => {
                base64::engine::general_purpose::STANDARD.decode(text)
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RenderedDocument::Binary(bytes) => bytes.len(),
            RenderedDocument::Base64(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A recoverable per-field problem; the row still renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWarning {
    pub field_id: String,
    pub error: FieldError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedRow {
    pub document: RenderedDocument,
    pub warnings: Vec<FieldWarning>,
}

pub(crate) struct MergeContext<'a> {
    pub(crate) fonts: &'a FontRegistry,
    pub(crate) fallback: &'a ResolvedFont,
    pub(crate) pdf: &'a PdfOptions,
}

/// Top-down page position of a text anchor, mapped to PDF space.
///
/// `y` is the baseline. The font size plays no part in the vertical anchor;
/// `text_width` only moves the horizontal start for center/right alignment.
pub fn text_origin(field: &LayoutField, geometry: &PageGeometry, text_width: Pt) -> (Pt, Pt) {
    let (x_pt, y_pt) = geometry.to_points(field.x, field.y);
    let width = text_width.to_f64();
    let start = match field.align {
        Align::Left => x_pt,
        Align::Center => x_pt - width / 2.0,
        Align::Right => x_pt - width,
    };
    (Pt::from_f64(start), Pt::from_f64(geometry.height_pt - y_pt))
}

fn field_text<'a, S: FieldSource + ?Sized>(
    field: &'a LayoutField,
    row: &'a S,
) -> Result<&'a str, FieldError> {
    if let Some(value) = field.static_value.as_deref() {
        return Ok(value);
    }
    row.value(&field.label)
        .ok_or_else(|| FieldError::MissingColumn(field.label.clone()))
}

pub(crate) fn render_row<S: FieldSource + ?Sized>(
    ctx: &MergeContext<'_>,
    layout: &[LayoutField],
    row: &S,
    geometry: &PageGeometry,
    encoding: OutputEncoding,
    template: Option<&Arc<TemplateImage>>,
) -> Result<(RenderedRow, PdfStats), GenerationFailure> {
    // Every value is looked up before drawing so a missing column fails fast.
    let texts = layout
        .iter()
        .map(|field| {
            if field.is_text() {
                field_text(field, row).map(Some)
            } else {
                Ok(None)
            }
        })
        .collect::<Result<Vec<_>, FieldError>>()?;

    let page_width = Pt::from_f64(geometry.width_pt);
    let page_height = Pt::from_f64(geometry.height_pt);
    let mut canvas = Canvas::new(page_width, page_height);
    let mut warnings = Vec::new();

    if let Some(image) = template {
        canvas.draw_image(Pt::ZERO, Pt::ZERO, page_width, page_height, image.clone());
    }

    for (field, text) in layout.iter().zip(texts) {
        match (field.kind, text) {
            (FieldKind::Text, Some(text)) => {
                let font = match ctx.fonts.resolve(&field.font_family) {
                    Some(font) => font,
                    None => {
                        warnings.push(FieldWarning {
                            field_id: field.id.clone(),
                            error: FieldError::UnknownFont(field.font_family.clone()),
                        });
                        ctx.fallback.clone()
                    }
                };
                let encoded = font.encode(text);
                if encoded.bytes.is_empty() {
                    continue;
                }
                if encoded.replaced > 0 {
                    warnings.push(FieldWarning {
                        field_id: field.id.clone(),
                        error: FieldError::UnrepresentableText {
                            font: font.base_font_name().to_string(),
                            replaced: encoded.replaced,
                        },
                    });
                }
                let size = Pt::from_f64(field.font_size);
                let width = encoded.width(size);
                let (x, y) = text_origin(field, geometry, width);
                canvas.set_fill_color(field.rgb());
                canvas.set_font(&font, size);
                canvas.draw_string(x, y, encoded);
            }
            (FieldKind::Text, None) => {}
            (kind, _) => draw_shape(&mut canvas, field, kind, geometry),
        }
    }

    let (bytes, stats) = pdf::render_document(&canvas.finish(), ctx.pdf)
        .map_err(|err| GenerationFailure::Render(err.to_string()))?;
    Ok((
        RenderedRow {
            document: RenderedDocument::encode(bytes, encoding),
            warnings,
        },
        stats,
    ))
}

fn draw_shape(canvas: &mut Canvas, field: &LayoutField, kind: FieldKind, geometry: &PageGeometry) {
    let (left, top) = geometry.to_points(field.x, field.y);
    let width = field.width * geometry.width_pt;
    let height = field.height * geometry.height_pt;
    let bottom = geometry.height_pt - top - height;
    let color = field.rgb();
    canvas.save_state();
    if field.filled && kind != FieldKind::Line {
        canvas.set_fill_color(color);
    } else {
        canvas.set_stroke_color(color);
        canvas.set_line_width(Pt::from_f64(field.stroke_width));
    }
    let p = Pt::from_f64;
    match kind {
        FieldKind::Rectangle => canvas.draw_rect(p(left), p(bottom), p(width), p(height)),
        FieldKind::Ellipse => canvas.ellipse(p(left), p(bottom), p(width), p(height)),
        FieldKind::Line => {
            canvas.move_to(p(left), p(geometry.height_pt - top));
            canvas.line_to(p(left + width), p(bottom));
        }
        FieldKind::Text => {}
    }
    if field.filled && kind != FieldKind::Line {
        canvas.fill();
    } else {
        canvas.stroke();
    }
    canvas.restore_state();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::StandardFont;
    use crate::geometry;
    use std::collections::HashMap;

    fn row(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn render(
        layout: &[LayoutField],
        data: &HashMap<String, String>,
        geometry: &PageGeometry,
    ) -> Result<RenderedRow, GenerationFailure> {
        let fonts = FontRegistry::new();
        let fallback = ResolvedFont::Standard(StandardFont::Helvetica);
        let pdf = PdfOptions::default();
        let ctx = MergeContext {
            fonts: &fonts,
            fallback: &fallback,
            pdf: &pdf,
        };
        render_row(&ctx, layout, data, geometry, OutputEncoding::Binary, None).map(|(row, _)| row)
    }

    fn content_of(rendered: &RenderedRow) -> String {
        let bytes = rendered.document.pdf_bytes().expect("bytes");
        let doc = lopdf::Document::load_mem(&bytes).expect("load");
        let page_id = *doc.get_pages().values().next().expect("page");
        String::from_utf8_lossy(&doc.get_page_content(page_id).expect("content")).into_owned()
    }

    #[test]
    fn vertical_anchor_ignores_font_size() {
        let geometry = geometry::resolve(Some(2000.0), Some(1414.0));
        let small = LayoutField::text("a", "Name", 0.5, 0.3).with_font("Helvetica", 12.0);
        let large = LayoutField::text("a", "Name", 0.5, 0.3).with_font("Helvetica", 72.0);
        let (_, y_small) = text_origin(&small, &geometry, Pt::ZERO);
        let (_, y_large) = text_origin(&large, &geometry, Pt::ZERO);
        assert_eq!(y_small, y_large);
        assert_eq!(
            y_small,
            Pt::from_f64(geometry.height_pt - 0.3 * geometry.height_pt)
        );
    }

    #[test]
    fn alignment_offsets_use_glyph_widths() {
        let geometry = geometry::resolve(Some(1000.0), Some(1000.0));
        let font = ResolvedFont::Standard(StandardFont::Helvetica);
        let width = font.text_width("Hello", Pt::from_f64(10.0));
        let field = LayoutField::text("a", "Name", 0.5, 0.5);
        let anchor = 0.5 * geometry.width_pt;

        let (left, _) = text_origin(&field, &geometry, width);
        let (center, _) = text_origin(&field.clone().with_align(Align::Center), &geometry, width);
        let (right, _) = text_origin(&field.with_align(Align::Right), &geometry, width);
        assert_eq!(left, Pt::from_f64(anchor));
        assert_eq!(center, Pt::from_f64(anchor - 11.39));
        assert_eq!(right, Pt::from_f64(anchor - 22.78));
    }

    #[test]
    fn static_value_ignores_the_row() {
        let geometry = PageGeometry::FALLBACK;
        let layout = vec![
            LayoutField::text("title", "Unused", 0.1, 0.1).with_static_value("Certificate"),
        ];
        let rendered = render(&layout, &row(&[]), &geometry).expect("rendered");
        assert!(content_of(&rendered).contains("(Certificate) Tj"));
        assert!(rendered.warnings.is_empty());
    }

    #[test]
    fn missing_column_fails_the_row() {
        let geometry = PageGeometry::FALLBACK;
        let layout = vec![LayoutField::text("n", "Name", 0.5, 0.5)];
        let err = render(&layout, &row(&[("Course", "Rust")]), &geometry).expect_err("missing");
        assert_eq!(
            err,
            GenerationFailure::Field(FieldError::MissingColumn("Name".to_string()))
        );
        assert_eq!(err.reason_code(), "missing_column");
    }

    #[test]
    fn empty_cell_is_a_valid_value() {
        let layout = vec![LayoutField::text("n", "Name", 0.5, 0.5)];
        let rendered =
            render(&layout, &row(&[("Name", "")]), &PageGeometry::FALLBACK).expect("rendered");
        assert!(!content_of(&rendered).contains("Tj"));
    }

    #[test]
    fn unknown_font_falls_back_with_a_warning() {
        let layout = vec![
            LayoutField::text("n", "Name", 0.5, 0.5).with_font("Great Vibes", 30.0),
        ];
        let rendered = render(&layout, &row(&[("Name", "Ada")]), &PageGeometry::FALLBACK)
            .expect("rendered");
        assert_eq!(
            rendered.warnings,
            vec![FieldWarning {
                field_id: "n".to_string(),
                error: FieldError::UnknownFont("Great Vibes".to_string()),
            }]
        );
        let bytes = rendered.document.pdf_bytes().expect("bytes");
        assert!(String::from_utf8_lossy(&bytes).contains("/BaseFont /Helvetica"));
    }

    #[test]
    fn text_outside_winansi_is_reported() {
        let layout = vec![LayoutField::text("n", "Name", 0.1, 0.5)];
        let rendered = render(
            &layout,
            &row(&[("Name", "Dvo\u{0159}\u{00E1}k Nguy\u{1EC5}n \u{738B}")]),
            &PageGeometry::FALLBACK,
        )
        .expect("rendered");
        assert_eq!(
            rendered.warnings,
            vec![FieldWarning {
                field_id: "n".to_string(),
                error: FieldError::UnrepresentableText {
                    font: "Helvetica".to_string(),
                    replaced: 3,
                },
            }]
        );
        assert!(content_of(&rendered).contains("(Dvo?\\341k Nguy?n ?) Tj"));
    }

    #[test]
    fn embedded_unicode_font_keeps_every_character() {
        let name = "Dvo\u{0159}\u{00E1}k Nguy\u{1EC5}n \u{738B}";
        let mut glyphs: Vec<(char, u16)> = Vec::new();
        for ch in name.chars() {
            if !glyphs.iter().any(|(known, _)| *known == ch) {
                glyphs.push((ch, 500));
            }
        }
        let mut fonts = FontRegistry::new();
        fonts
            .register_bytes(crate::font::build_test_font(&glyphs), Some("Merge Unicode.ttf"))
            .expect("register");
        let fallback = ResolvedFont::Standard(StandardFont::Helvetica);
        let pdf = PdfOptions::default();
        let ctx = MergeContext {
            fonts: &fonts,
            fallback: &fallback,
            pdf: &pdf,
        };
        let layout = vec![
            LayoutField::text("n", "Name", 0.5, 0.5)
                .with_font("Merge Unicode", 20.0)
                .with_align(Align::Center),
        ];
        let data = row(&[("Name", name)]);
        let (rendered, stats) = render_row(
            &ctx,
            &layout,
            &data,
            &PageGeometry::FALLBACK,
            OutputEncoding::Binary,
            None,
        )
        .expect("rendered");
        assert!(rendered.warnings.is_empty());
        assert_eq!(stats.fonts, 1);
        // 15 glyphs of 500 units at 20pt is 150pt, centred on x = 297.64.
        assert!(content_of(&rendered).contains(
            "BT /F1 20 Tf 222.64 420.945 Td <000100020003000400050006000700080009000A000B000C000D0007000E> Tj ET"
        ));
    }

    #[test]
    fn shapes_use_the_top_down_transform() {
        let geometry = geometry::resolve(Some(100.0), Some(100.0));
        let layout = vec![
            LayoutField::shape("frame", FieldKind::Rectangle, 0.1, 0.1, 0.5, 0.25)
                .with_color("#FF0000")
                .filled(true),
        ];
        let rendered = render(&layout, &row(&[]), &geometry).expect("rendered");
        let content = content_of(&rendered);
        let x = Pt::from_f64(0.1 * geometry.width_pt).to_milli_i64();
        assert!(content.contains("1 0 0 rg"));
        assert!(content.contains(&format!("{}.", x / 1000)));
        assert!(content.contains(" re\nf\n"));
    }

    #[test]
    fn base64_encoding_wraps_the_same_pdf() {
        let layout = vec![LayoutField::text("n", "Name", 0.5, 0.5)];
        let data = row(&[("Name", "Ada")]);
        let fonts = FontRegistry::new();
        let fallback = ResolvedFont::Standard(StandardFont::Helvetica);
        let pdf = PdfOptions::default();
        let ctx = MergeContext {
            fonts: &fonts,
            fallback: &fallback,
            pdf: &pdf,
        };
        let geometry = PageGeometry::FALLBACK;
        let (binary, _) =
            render_row(&ctx, &layout, &data, &geometry, OutputEncoding::Binary, None)
                .expect("binary");
        let (encoded, _) =
            render_row(&ctx, &layout, &data, &geometry, OutputEncoding::Base64, None)
                .expect("base64");
        assert!(matches!(encoded.document, RenderedDocument::Base64(_)));
        assert_eq!(
            encoded.document.pdf_bytes().expect("decode"),
            binary.document.pdf_bytes().expect("bytes")
        );
    }
}
