use crate::canvas::{Command, Document};
use crate::font::{FIRST_CHAR, FontProgramKind, LAST_CHAR, LoadedFont, ResolvedFont};
use std::collections::BTreeMap;
use crate::template::TemplateImage;
use crate::types::{Color, Pt};
use fixed::types::I32F32;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::Arc;

pub const PRODUCER: &str = "certforge";
const COMPRESSION_LEVEL: u8 = 6;

#[derive(Debug, Clone, Default)]
pub struct PdfOptions {
    pub title: Option<String>,
}

/// Counts gathered while writing, reported to the perf log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PdfStats {
    pub bytes: usize,
    pub objects: usize,
    pub fonts: usize,
    pub images: usize,
}

struct FontResource {
    key: String,
    name: String,
    font: ResolvedFont,
    // Glyph id -> character, for embedded fonts' /W and ToUnicode.
    glyphs: BTreeMap<u16, char>,
}

struct ImageResource {
    name: String,
    image: Arc<TemplateImage>,
}

#[derive(Default)]
struct Resources {
    fonts: Vec<FontResource>,
    images: Vec<ImageResource>,
}

impl Resources {
    fn collect(doc: &Document) -> Self {
        let mut resources = Resources::default();
        let mut current: Option<usize> = None;
        for command in &doc.commands {
            match command {
                Command::SetFont { font, .. } => {
                    let key = font.resource_key();
                    let index = match resources.fonts.iter().position(|entry| entry.key == key) {
                        Some(index) => index,
                        None => {
                            let name = format!("F{}", resources.fonts.len() + 1);
                            resources.fonts.push(FontResource {
                                key,
                                name,
                                font: font.clone(),
                                glyphs: BTreeMap::new(),
                            });
                            resources.fonts.len() - 1
                        }
                    };
                    current = Some(index);
                }
                Command::DrawString { text, .. } => {
                    if let Some(entry) = current.and_then(|index| resources.fonts.get_mut(index)) {
                        for (gid, ch) in &text.glyphs {
                            entry.glyphs.entry(*gid).or_insert(*ch);
                        }
                    }
                }
                Command::DrawImage { image, .. } => {
                    if !resources
                        .images
                        .iter()
                        .any(|entry| Arc::ptr_eq(&entry.image, image))
                    {
                        let name = format!("Im{}", resources.images.len() + 1);
                        resources.images.push(ImageResource {
                            name,
                            image: image.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
        resources
    }

    fn font(&self, font: &ResolvedFont) -> Option<&FontResource> {
        let key = font.resource_key();
        self.fonts.iter().find(|entry| entry.key == key)
    }

    fn image_name(&self, image: &Arc<TemplateImage>) -> &str {
        self.images
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.image, image))
            .map(|entry| entry.name.as_str())
            .unwrap_or("Im1")
    }
}

/// Serializes a single-page document.
///
/// Output is a pure function of the document and options: no timestamps, no
/// generated IDs, objects numbered in a fixed order.
pub(crate) fn render_document(doc: &Document, options: &PdfOptions) -> io::Result<(Vec<u8>, PdfStats)> {
    let mut out = Vec::new();
    let stats = write_document(doc, options, &mut out)?;
    Ok((out, stats))
}

pub(crate) fn write_document<W: Write>(
    doc: &Document,
    options: &PdfOptions,
    writer: &mut W,
) -> io::Result<PdfStats> {
    if doc.width <= Pt::ZERO || doc.height <= Pt::ZERO {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "page size must be positive",
        ));
    }
    let resources = Resources::collect(doc);
    let content = content_stream(doc, &resources);

    // 1 catalog, 2 pages, 3 page, 4 content, 5 info, then fonts and images.
    let mut objects: Vec<Vec<u8>> = Vec::new();
    objects.push(b"<< /Type /Catalog /Pages 2 0 R >>".to_vec());
    objects.push(b"<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_vec());
    objects.push(Vec::new());
    objects.push(flate_stream_object("", content.as_bytes()));
    objects.push(info_object(options.title.as_deref()).into_bytes());

    let mut font_refs = Vec::new();
    for entry in &resources.fonts {
        let font_id = objects.len() + 1;
        match &entry.font {
            ResolvedFont::Standard(font) => {
                objects.push(
                    standard_font_object(font.base_font_name(), font.widths()).into_bytes(),
                );
            }
            ResolvedFont::Embedded(font) => {
                // Type0 font, CID font, ToUnicode, descriptor, program.
                let cid_font_id = font_id + 1;
                let to_unicode_id = font_id + 2;
                let descriptor_id = font_id + 3;
                let file_id = font_id + 4;
                objects.push(type0_font_object(font, cid_font_id, to_unicode_id).into_bytes());
                objects.push(cid_font_object(font, &entry.glyphs, descriptor_id).into_bytes());
                objects.push(flate_stream_object("", to_unicode_cmap(&entry.glyphs).as_bytes()));
                objects.push(font_descriptor_object(font, file_id).into_bytes());
                objects.push(font_file_object(&font.data, font.program_kind));
            }
        }
        font_refs.push(format!("/{} {} 0 R", entry.name, font_id));
    }

    let mut image_refs = Vec::new();
    for entry in &resources.images {
        let image_id = objects.len() + 1;
        objects.push(image_object(&entry.image));
        image_refs.push(format!("/{} {} 0 R", entry.name, image_id));
    }

    let mut resource_dict = String::from("<<");
    if !font_refs.is_empty() {
        let _ = write!(resource_dict, " /Font << {} >>", font_refs.join(" "));
    }
    if !image_refs.is_empty() {
        let _ = write!(resource_dict, " /XObject << {} >>", image_refs.join(" "));
    }
    resource_dict.push_str(" >>");
    objects[2] = format!(
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] /Resources {} /Contents 4 0 R >>",
        fmt_pt(doc.width),
        fmt_pt(doc.height),
        resource_dict
    )
    .into_bytes();

    let bytes = build_pdf(writer, &objects, 1, Some(5))?;
    Ok(PdfStats {
        bytes,
        objects: objects.len(),
        fonts: resources.fonts.len(),
        images: resources.images.len(),
    })
}

fn content_stream(doc: &Document, resources: &Resources) -> String {
    let mut out = String::new();
    let mut font: Option<(&FontResource, Pt)> = None;
    for command in &doc.commands {
        match command {
            Command::SaveState => out.push_str("q\n"),
            Command::RestoreState => out.push_str("Q\n"),
            Command::SetFillColor(color) => out.push_str(&color_op(*color, "rg")),
            Command::SetStrokeColor(color) => out.push_str(&color_op(*color, "RG")),
            Command::SetLineWidth(width) => {
                let _ = writeln!(out, "{} w", fmt_pt(*width));
            }
            Command::SetFont { font: resolved, size } => {
                font = resources.font(resolved).map(|entry| (entry, *size));
            }
            Command::MoveTo { x, y } => {
                let _ = writeln!(out, "{} {} m", fmt_pt(*x), fmt_pt(*y));
            }
            Command::LineTo { x, y } => {
                let _ = writeln!(out, "{} {} l", fmt_pt(*x), fmt_pt(*y));
            }
            Command::CurveTo {
                x1,
                y1,
                x2,
                y2,
                x,
                y,
            } => {
                let _ = writeln!(
                    out,
                    "{} {} {} {} {} {} c",
                    fmt_pt(*x1),
                    fmt_pt(*y1),
                    fmt_pt(*x2),
                    fmt_pt(*y2),
                    fmt_pt(*x),
                    fmt_pt(*y)
                );
            }
            Command::ClosePath => out.push_str("h\n"),
            Command::Fill => out.push_str("f\n"),
            Command::Stroke => out.push_str("S\n"),
            Command::DrawRect {
                x,
                y,
                width,
                height,
            } => {
                let _ = writeln!(
                    out,
                    "{} {} {} {} re",
                    fmt_pt(*x),
                    fmt_pt(*y),
                    fmt_pt(*width),
                    fmt_pt(*height)
                );
            }
            Command::DrawString { x, y, text } => {
                let Some((entry, size)) = font else {
                    continue;
                };
                let operand = match entry.font {
                    ResolvedFont::Standard(_) => format!("({})", escape_pdf_bytes(&text.bytes)),
                    ResolvedFont::Embedded(_) => hex_string(&text.bytes),
                };
                let _ = writeln!(
                    out,
                    "BT /{} {} Tf {} {} Td {} Tj ET",
                    entry.name,
                    fmt_pt(size),
                    fmt_pt(*x),
                    fmt_pt(*y),
                    operand
                );
            }
            Command::DrawImage {
                x,
                y,
                width,
                height,
                image,
            } => {
                let _ = writeln!(
                    out,
                    "q {} 0 0 {} {} {} cm /{} Do Q",
                    fmt_pt(*width),
                    fmt_pt(*height),
                    fmt_pt(*x),
                    fmt_pt(*y),
                    resources.image_name(image)
                );
            }
        }
    }
    out
}

fn color_op(color: Color, op: &str) -> String {
    format!(
        "{} {} {} {}\n",
        fmt(color.r),
        fmt(color.g),
        fmt(color.b),
        op
    )
}

fn build_pdf<W: Write>(
    writer: &mut W,
    objects: &[Vec<u8>],
    catalog_id: usize,
    info_id: Option<usize>,
) -> io::Result<usize> {
    let mut offset = 0usize;
    let mut offsets = vec![0usize; objects.len() + 1];
    write_bytes(writer, b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n", &mut offset)?;
    for (index, body) in objects.iter().enumerate() {
        write_pdf_object(writer, &mut offset, &mut offsets, index + 1, body)?;
    }

    let xref_start = offset;
    write_str(writer, &format!("xref\n0 {}\n", objects.len() + 1), &mut offset)?;
    write_bytes(writer, b"0000000000 65535 f \n", &mut offset)?;
    for object_offset in offsets.iter().skip(1) {
        write_str(writer, &format!("{:010} 00000 n \n", object_offset), &mut offset)?;
    }

    let mut trailer = format!(
        "trailer\n<< /Size {} /Root {} 0 R",
        objects.len() + 1,
        catalog_id
    );
    if let Some(info_id) = info_id {
        let _ = write!(trailer, " /Info {} 0 R", info_id);
    }
    let _ = write!(trailer, " >>\nstartxref\n{}\n%%EOF\n", xref_start);
    write_str(writer, &trailer, &mut offset)?;
    Ok(offset)
}

fn write_pdf_object<W: Write>(
    writer: &mut W,
    offset: &mut usize,
    offsets: &mut [usize],
    obj_id: usize,
    body: &[u8],
) -> io::Result<()> {
    if let Some(slot) = offsets.get_mut(obj_id) {
        *slot = *offset;
    }
    write_str(writer, &format!("{} 0 obj\n", obj_id), offset)?;
    write_bytes(writer, body, offset)?;
    write_bytes(writer, b"\nendobj\n", offset)?;
    Ok(())
}

fn write_bytes<W: Write>(writer: &mut W, data: &[u8], offset: &mut usize) -> io::Result<()> {
    writer.write_all(data)?;
    *offset += data.len();
    Ok(())
}

fn write_str<W: Write>(writer: &mut W, data: &str, offset: &mut usize) -> io::Result<()> {
    write_bytes(writer, data.as_bytes(), offset)
}

/// A stream object whose payload is zlib-compressed. `extra` lands inside the
/// dictionary before `/Length`.
fn flate_stream_object(extra: &str, data: &[u8]) -> Vec<u8> {
    let compressed = miniz_oxide::deflate::compress_to_vec_zlib(data, COMPRESSION_LEVEL);
    stream_object(extra, &compressed)
}

fn stream_object(extra: &str, compressed: &[u8]) -> Vec<u8> {
    let mut dict = String::from("<<");
    if !extra.is_empty() {
        dict.push(' ');
        dict.push_str(extra);
    }
    let _ = write!(
        dict,
        " /Length {} /Filter /FlateDecode >>\nstream\n",
        compressed.len()
    );
    let mut out = dict.into_bytes();
    out.extend_from_slice(compressed);
    out.extend_from_slice(b"\nendstream");
    out
}

fn info_object(title: Option<&str>) -> String {
    let mut entries = Vec::new();
    if let Some(title) = title {
        entries.push(format!("/Title ({})", escape_pdf_string(title)));
    }
    entries.push(format!("/Producer ({})", PRODUCER));
    format!("<< {} >>", entries.join(" "))
}

fn widths_array(widths: &[u16]) -> String {
    widths
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn standard_font_object(base_font: &str, widths: &[u16]) -> String {
    format!(
        "<< /Type /Font /Subtype /Type1 /BaseFont /{} /Encoding /WinAnsiEncoding /FirstChar {} /LastChar {} /Widths [{}] >>",
        sanitize_font_name(base_font),
        FIRST_CHAR,
        LAST_CHAR,
        widths_array(widths)
    )
}

fn type0_font_object(font: &LoadedFont, cid_font_id: usize, to_unicode_id: usize) -> String {
    format!(
        "<< /Type /Font /Subtype /Type0 /BaseFont /{} /Encoding /Identity-H /DescendantFonts [{} 0 R] /ToUnicode {} 0 R >>",
        sanitize_font_name(&font.name),
        cid_font_id,
        to_unicode_id
    )
}

fn cid_font_object(font: &LoadedFont, glyphs: &BTreeMap<u16, char>, descriptor_id: usize) -> String {
    let widths: Vec<String> = font
        .glyph_widths(glyphs.keys().copied())
        .into_iter()
        .map(|(gid, width)| format!("{} [{}]", gid, width))
        .collect();
    let w_array = if widths.is_empty() {
        String::new()
    } else {
        format!(" /W [{}]", widths.join(" "))
    };
    // CFF programs are addressed by glyph id directly.
    let (subtype, cid_to_gid) = match font.program_kind {
        FontProgramKind::OpenTypeCff => ("CIDFontType0", ""),
        FontProgramKind::TrueType => ("CIDFontType2", " /CIDToGIDMap /Identity"),
    };
    format!(
        "<< /Type /Font /Subtype /{} /BaseFont /{} /CIDSystemInfo << /Registry (Adobe) /Ordering (Identity) /Supplement 0 >> /FontDescriptor {} 0 R /DW {}{}{} >>",
        subtype,
        sanitize_font_name(&font.name),
        descriptor_id,
        font.metrics.missing_width,
        w_array,
        cid_to_gid
    )
}

fn to_unicode_cmap(glyphs: &BTreeMap<u16, char>) -> String {
    let entries: Vec<(&u16, &char)> = glyphs.iter().collect();
    let mut out = String::new();
    out.push_str("/CIDInit /ProcSet findresource begin\n");
    out.push_str("12 dict begin\n");
    out.push_str("begincmap\n");
    out.push_str("/CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n");
    out.push_str("/CMapName /Adobe-Identity-UCS def\n");
    out.push_str("/CMapType 2 def\n");
    out.push_str("1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n");
    for chunk in entries.chunks(100) {
        let _ = writeln!(out, "{} beginbfchar", chunk.len());
        for (gid, ch) in chunk {
            let mut units = [0u16; 2];
            let utf16: String = ch
                .encode_utf16(&mut units)
                .iter()
                .map(|unit| format!("{:04X}", unit))
                .collect();
            let _ = writeln!(out, "<{:04X}> <{}>", gid, utf16);
        }
        out.push_str("endbfchar\n");
    }
    out.push_str("endcmap\n");
    out.push_str("CMapName currentdict /CMap defineresource pop\n");
    out.push_str("end\nend\n");
    out
}

fn font_descriptor_object(font: &LoadedFont, font_file_id: usize) -> String {
    let metrics = &font.metrics;
    let mut flags = 32;
    if metrics.is_fixed_pitch {
        flags |= 1;
    }
    let font_file_entry = match font.program_kind {
        FontProgramKind::OpenTypeCff => "FontFile3",
        FontProgramKind::TrueType => "FontFile2",
    };
    format!(
        "<< /Type /FontDescriptor /FontName /{} /Flags {} /FontBBox [{} {} {} {}] /ItalicAngle {} /Ascent {} /Descent {} /CapHeight {} /StemV {} /MissingWidth {} /{} {} 0 R >>",
        sanitize_font_name(&font.name),
        flags,
        metrics.bbox.0,
        metrics.bbox.1,
        metrics.bbox.2,
        metrics.bbox.3,
        metrics.italic_angle,
        metrics.ascent,
        metrics.descent,
        metrics.cap_height,
        metrics.stem_v,
        metrics.missing_width,
        font_file_entry,
        font_file_id
    )
}

fn font_file_object(data: &[u8], kind: FontProgramKind) -> Vec<u8> {
    let extra = match kind {
        FontProgramKind::OpenTypeCff => format!("/Length1 {} /Subtype /OpenType", data.len()),
        FontProgramKind::TrueType => format!("/Length1 {}", data.len()),
    };
    flate_stream_object(&extra, data)
}

fn image_object(image: &TemplateImage) -> Vec<u8> {
    let extra = format!(
        "/Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace /DeviceRGB /BitsPerComponent 8",
        image.width_px(),
        image.height_px()
    );
    stream_object(&extra, image.compressed_rgb())
}

fn sanitize_font_name(name: &str) -> String {
    let mut out = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            out.push(ch);
        } else if ch == ' ' {
            out.push('-');
        }
    }
    if out.is_empty() {
        "Helvetica".to_string()
    } else {
        out
    }
}

fn escape_pdf_string(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 2);
    out.push('<');
    for byte in bytes {
        let _ = write!(out, "{:02X}", byte);
    }
    out.push('>');
    out
}

/// Literal-string body for already-encoded bytes; non-printable bytes are
/// written as octal escapes so the content stream stays ASCII.
fn escape_pdf_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'(' => out.push_str("\\("),
            b')' => out.push_str("\\)"),
            b if !(0x20..0x7f).contains(&b) => {
                let _ = write!(out, "\\{:03o}", b);
            }
            b => out.push(b as char),
        }
    }
    out
}

fn fmt(value: f32) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    let fixed = I32F32::from_num(value);
    let scaled = (fixed * I32F32::from_num(1000)).round();
    let milli: i64 = scaled.to_num();
    format_milli(milli)
}

fn format_milli(milli: i64) -> String {
    if milli == 0 {
        return "0".to_string();
    }
    let sign = if milli < 0 { "-" } else { "" };
    let abs = milli.unsigned_abs();
    let int_part = abs / 1000;
    let frac_part = abs % 1000;
    if frac_part == 0 {
        format!("{}{}", sign, int_part)
    } else {
        let mut s = format!("{}{}.{:03}", sign, int_part, frac_part);
        while s.ends_with('0') {
            s.pop();
        }
        s
    }
}

fn fmt_pt(value: Pt) -> String {
    format_milli(value.to_milli_i64())
}
