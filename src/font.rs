use crate::error::CertForgeError;
use crate::types::Pt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

pub(crate) const FIRST_CHAR: u8 = 32;
pub(crate) const LAST_CHAR: u8 = 255;
const WIDTH_COUNT: usize = (LAST_CHAR - FIRST_CHAR) as usize + 1;

// cp1252 code points that differ from Latin-1.
const WINANSI_HIGH: [(u8, char); 27] = [
    (0x80, '\u{20AC}'),
    (0x82, '\u{201A}'),
    (0x83, '\u{0192}'),
    (0x84, '\u{201E}'),
    (0x85, '\u{2026}'),
    (0x86, '\u{2020}'),
    (0x87, '\u{2021}'),
    (0x88, '\u{02C6}'),
    (0x89, '\u{2030}'),
    (0x8A, '\u{0160}'),
    (0x8B, '\u{2039}'),
    (0x8C, '\u{0152}'),
    (0x8E, '\u{017D}'),
    (0x91, '\u{2018}'),
    (0x92, '\u{2019}'),
    (0x93, '\u{201C}'),
    (0x94, '\u{201D}'),
    (0x95, '\u{2022}'),
    (0x96, '\u{2013}'),
    (0x97, '\u{2014}'),
    (0x98, '\u{02DC}'),
    (0x99, '\u{2122}'),
    (0x9A, '\u{0161}'),
    (0x9B, '\u{203A}'),
    (0x9C, '\u{0153}'),
    (0x9E, '\u{017E}'),
    (0x9F, '\u{0178}'),
];

/// Text encoded for a simple WinAnsi font.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WinAnsiText {
    pub(crate) bytes: Vec<u8>,
    pub(crate) replaced: usize,
}

pub(crate) fn winansi_byte(ch: char) -> Option<u8> {
    match ch {
        '\u{0020}'..='\u{007E}' | '\u{00A0}'..='\u{00FF}' => Some(ch as u8),
        _ => WINANSI_HIGH
            .iter()
            .find(|(_, mapped)| *mapped == ch)
            .map(|(byte, _)| *byte),
    }
}

/// Encodes `text` for a WinAnsi font. Characters outside the code page,
/// control characters included, become `?`.
pub(crate) fn encode_winansi(text: &str) -> WinAnsiText {
    let mut bytes = Vec::with_capacity(text.len());
    let mut replaced = 0usize;
    for ch in text.chars() {
        match winansi_byte(ch) {
            Some(byte) => bytes.push(byte),
            None => {
                replaced += 1;
                bytes.push(b'?');
            }
        }
    }
    WinAnsiText { bytes, replaced }
}

#[rustfmt::skip]
const HELVETICA_WIDTHS: [u16; WIDTH_COUNT] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278,
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556,
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778,
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556,
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556,
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584, 0,
    556, 0, 222, 556, 333, 1000, 556, 556, 333, 1000, 667, 333, 1000, 0, 611, 0,
    0, 222, 222, 333, 333, 350, 556, 1000, 333, 1000, 500, 333, 944, 0, 500, 667,
    278, 333, 556, 556, 556, 556, 260, 556, 333, 737, 370, 556, 584, 333, 737, 333,
    400, 584, 333, 333, 333, 556, 537, 278, 333, 333, 365, 556, 834, 834, 834, 611,
    667, 667, 667, 667, 667, 667, 1000, 722, 667, 667, 667, 667, 278, 278, 278, 278,
    722, 722, 778, 778, 778, 778, 778, 584, 778, 722, 722, 722, 722, 667, 667, 611,
    556, 556, 556, 556, 556, 556, 889, 500, 556, 556, 556, 556, 278, 278, 278, 278,
    556, 556, 556, 556, 556, 556, 556, 584, 611, 556, 556, 556, 556, 500, 556, 500,
];

const COURIER_WIDTHS: [u16; WIDTH_COUNT] = [600; WIDTH_COUNT];

/// Base-14 fonts every PDF viewer carries; used when no font program is embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardFont {
    Helvetica,
    Courier,
}

impl StandardFont {
    pub fn base_font_name(&self) -> &'static str {
        match self {
            StandardFont::Helvetica => "Helvetica",
            StandardFont::Courier => "Courier",
        }
    }

    pub(crate) fn widths(&self) -> &'static [u16] {
        match self {
            StandardFont::Helvetica => &HELVETICA_WIDTHS,
            StandardFont::Courier => &COURIER_WIDTHS,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match normalize_name(name).as_str() {
            "helvetica" | "sans-serif" => Some(StandardFont::Helvetica),
            "courier" | "monospace" => Some(StandardFont::Courier),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FontProgramKind {
    TrueType,
    OpenTypeCff,
}

#[derive(Debug)]
pub(crate) struct FontMetrics {
    pub(crate) units_per_em: u16,
    pub(crate) ascent: i16,
    pub(crate) descent: i16,
    pub(crate) cap_height: i16,
    pub(crate) italic_angle: i16,
    pub(crate) stem_v: i16,
    pub(crate) bbox: (i16, i16, i16, i16),
    pub(crate) missing_width: u16,
    pub(crate) is_fixed_pitch: bool,
}

impl FontMetrics {
    fn from_face(face: &ttf_parser::Face<'_>) -> Self {
        let units_per_em = face.units_per_em().max(1);
        let scale = 1000.0 / units_per_em as f32;
        let missing_width = face
            .glyph_hor_advance(ttf_parser::GlyphId(0))
            .map(|advance| scale_u16(advance, units_per_em))
            .unwrap_or(0);
        let ascent = scale_i16(face.ascender(), scale);
        let bbox = face.global_bounding_box();
        Self {
            units_per_em,
            missing_width,
            ascent,
            descent: scale_i16(face.descender(), scale),
            cap_height: face
                .capital_height()
                .map(|value| scale_i16(value, scale))
                .unwrap_or(ascent),
            italic_angle: face
                .italic_angle()
                .map(|value| value.round() as i16)
                .unwrap_or(0),
            stem_v: 80,
            bbox: (
                scale_i16(bbox.x_min, scale),
                scale_i16(bbox.y_min, scale),
                scale_i16(bbox.x_max, scale),
                scale_i16(bbox.y_max, scale),
            ),
            is_fixed_pitch: face.is_monospaced(),
        }
    }
}

/// Text encoded for one font.
///
/// `bytes` is the string operand: WinAnsi codes for base-14 fonts, big-endian
/// glyph ids for embedded programs. `width_units` is the advance in 1/1000 em
/// using the same widths the PDF declares. `glyphs` feeds the ToUnicode map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct EncodedText {
    pub(crate) bytes: Vec<u8>,
    pub(crate) width_units: u64,
    pub(crate) replaced: usize,
    pub(crate) glyphs: Vec<(u16, char)>,
}

impl EncodedText {
    pub(crate) fn width(&self, font_size: Pt) -> Pt {
        let milli = self.width_units as i128 * font_size.to_milli_i64() as i128 / 1000;
        Pt::from_milli_i64(milli.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }
}

/// A decoded TrueType/OpenType program shared read-only between renders.
#[derive(Debug)]
pub struct LoadedFont {
    pub(crate) key: String,
    pub(crate) name: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) data: Arc<[u8]>,
    pub(crate) metrics: FontMetrics,
    pub(crate) program_kind: FontProgramKind,
}

impl LoadedFont {
    fn decode(key: String, data: Arc<[u8]>, source: &Path) -> Result<Self, String> {
        let face = ttf_parser::Face::parse(&data, 0)
            .map_err(|err| format!("invalid font data for {}: {}", source.display(), err))?;
        let (name, aliases) = font_names(&face, source);
        let metrics = FontMetrics::from_face(&face);
        let program_kind = if face.tables().cff.is_some() {
            FontProgramKind::OpenTypeCff
        } else {
            FontProgramKind::TrueType
        };
        Ok(Self {
            key,
            name,
            aliases,
            data: data.clone(),
            metrics,
            program_kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maps `text` to glyph ids. Characters the font has no glyph for, and
    /// control characters, use the `?` glyph (or `.notdef`) and are counted.
    pub(crate) fn encode(&self, text: &str) -> EncodedText {
        let face = ttf_parser::Face::parse(&self.data, 0).ok();
        let lookup = |ch: char| {
            face.as_ref()
                .filter(|_| !ch.is_control())
                .and_then(|face| face.glyph_index(ch))
                .map(|id| id.0)
                .filter(|gid| *gid != 0)
        };
        let fallback = lookup('?');
        let mut encoded = EncodedText::default();
        for ch in text.chars() {
            let gid = match lookup(ch) {
                Some(gid) => {
                    encoded.glyphs.push((gid, ch));
                    gid
                }
                None => {
                    encoded.replaced += 1;
                    if let Some(gid) = fallback {
                        encoded.glyphs.push((gid, '?'));
                    }
                    fallback.unwrap_or(0)
                }
            };
            encoded.bytes.extend_from_slice(&gid.to_be_bytes());
            encoded.width_units += self.glyph_width(face.as_ref(), gid) as u64;
        }
        encoded
    }

    /// Advance widths (1/1000 em) for the given glyph ids, as written to `/W`.
    pub(crate) fn glyph_widths(&self, gids: impl IntoIterator<Item = u16>) -> Vec<(u16, u16)> {
        let face = ttf_parser::Face::parse(&self.data, 0).ok();
        gids.into_iter()
            .map(|gid| (gid, self.glyph_width(face.as_ref(), gid)))
            .collect()
    }

    fn glyph_width(&self, face: Option<&ttf_parser::Face<'_>>, gid: u16) -> u16 {
        face.and_then(|face| face.glyph_hor_advance(ttf_parser::GlyphId(gid)))
            .map(|advance| scale_u16(advance, self.metrics.units_per_em))
            .unwrap_or(self.metrics.missing_width)
    }
}

/// Where a font program comes from. Also the process-wide cache key.
#[derive(Debug, Clone)]
pub enum FontSource {
    File(PathBuf),
    Bytes { name: String, data: Arc<[u8]> },
}

impl FontSource {
    pub fn cache_key(&self) -> String {
        match self {
            FontSource::File(path) => {
                let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.clone());
                format!("file:{}", canonical.display())
            }
            FontSource::Bytes { data, .. } => format!("sha256:{}", sha256_hex(data)),
        }
    }

    fn load(&self, key: String) -> Result<LoadedFont, String> {
        match self {
            FontSource::File(path) => {
                let data = fs::read(path)
                    .map_err(|err| format!("failed to read font {}: {}", path.display(), err))?;
                LoadedFont::decode(key, Arc::from(data), path)
            }
            FontSource::Bytes { name, data } => {
                LoadedFont::decode(key, data.clone(), Path::new(name))
            }
        }
    }
}

type CacheSlot = Arc<Mutex<Option<Arc<LoadedFont>>>>;

/// Decoded fonts keyed by source. Concurrent first loads of one key decode
/// once and share the result. Failed loads are not kept, so the next caller
/// retries.
#[derive(Debug, Default)]
pub struct FontCache {
    slots: Mutex<HashMap<String, CacheSlot>>,
    decodes: AtomicUsize,
}

static GLOBAL_FONT_CACHE: OnceLock<FontCache> = OnceLock::new();

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl FontCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every engine in the process.
    pub fn global() -> &'static FontCache {
        GLOBAL_FONT_CACHE.get_or_init(FontCache::new)
    }

    pub fn load(&self, source: &FontSource) -> Result<Arc<LoadedFont>, CertForgeError> {
        let key = source.cache_key();
        let slot = lock(&self.slots).entry(key.clone()).or_default().clone();
        // Held across the decode so racing loaders of this key wait for it.
        let mut loaded = lock(&*slot);
        if let Some(font) = loaded.as_ref() {
            return Ok(font.clone());
        }
        self.decodes.fetch_add(1, Ordering::Relaxed);
        let font = Arc::new(source.load(key).map_err(CertForgeError::Asset)?);
        *loaded = Some(font.clone());
        Ok(font)
    }

    /// Number of fonts decoded successfully.
    pub fn len(&self) -> usize {
        let slots: Vec<CacheSlot> = lock(&self.slots).values().cloned().collect();
        slots.into_iter().filter(|slot| lock(&**slot).is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }
}

/// A font ready for measuring and writing: a base-14 font or an embedded program.
#[derive(Debug, Clone)]
pub enum ResolvedFont {
    Standard(StandardFont),
    Embedded(Arc<LoadedFont>),
}

impl ResolvedFont {
    pub fn base_font_name(&self) -> &str {
        match self {
            ResolvedFont::Standard(font) => font.base_font_name(),
            ResolvedFont::Embedded(font) => &font.name,
        }
    }

    /// Identity used to share one font resource per document.
    pub(crate) fn resource_key(&self) -> String {
        match self {
            ResolvedFont::Standard(font) => format!("std:{}", font.base_font_name()),
            ResolvedFont::Embedded(font) => font.key.clone(),
        }
    }

    pub(crate) fn encode(&self, text: &str) -> EncodedText {
        match self {
            ResolvedFont::Standard(font) => {
                let WinAnsiText { bytes, replaced } = encode_winansi(text);
                let widths = font.widths();
                let width_units = bytes
                    .iter()
                    .map(|&byte| {
                        byte.checked_sub(FIRST_CHAR)
                            .and_then(|index| widths.get(index as usize))
                            .copied()
                            .unwrap_or(0) as u64
                    })
                    .sum();
                EncodedText {
                    bytes,
                    width_units,
                    replaced,
                    glyphs: Vec::new(),
                }
            }
            ResolvedFont::Embedded(font) => font.encode(text),
        }
    }

    /// Width of `text` as the PDF viewer lays it out at `font_size`.
    pub fn text_width(&self, text: &str, font_size: Pt) -> Pt {
        self.encode(text).width(font_size)
    }
}

/// Per-engine family lookup. Names are matched case-insensitively; the first
/// registration of a name wins.
#[derive(Debug, Clone)]
pub struct FontRegistry {
    lookup: HashMap<String, ResolvedFont>,
    families: Vec<String>,
}

impl Default for FontRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FontRegistry {
    pub fn new() -> Self {
        Self {
            lookup: HashMap::new(),
            families: Vec::new(),
        }
    }

    pub fn register_file(&mut self, path: impl AsRef<Path>) -> Result<String, CertForgeError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|v| v.to_str())
            .map(|v| v.to_ascii_lowercase());
        if !matches!(ext.as_deref(), Some("ttf") | Some("otf")) {
            return Err(CertForgeError::Asset(format!(
                "not a TrueType/OpenType font file: {}",
                path.display()
            )));
        }
        let font = FontCache::global().load(&FontSource::File(path.to_path_buf()))?;
        Ok(self.insert(font))
    }

    /// Registers every `.ttf`/`.otf` directly inside `path`, in file-name order.
    /// Files that fail to decode are skipped.
    pub fn register_dir(&mut self, path: impl AsRef<Path>) -> Result<usize, CertForgeError> {
        let mut files: Vec<PathBuf> = fs::read_dir(path.as_ref())?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        let mut registered = 0;
        for file in files {
            if self.register_file(&file).is_ok() {
                registered += 1;
            }
        }
        Ok(registered)
    }

    pub fn register_bytes(
        &mut self,
        data: Vec<u8>,
        source_name: Option<&str>,
    ) -> Result<String, CertForgeError> {
        let source = FontSource::Bytes {
            name: source_name.unwrap_or("EmbeddedFont").to_string(),
            data: Arc::from(data),
        };
        let font = FontCache::global().load(&source)?;
        Ok(self.insert(font))
    }

    /// Makes `alias` resolve to whatever `family` resolves to.
    pub fn add_alias(&mut self, alias: &str, family: &str) -> Result<(), CertForgeError> {
        let target = self.resolve(family).ok_or_else(|| {
            CertForgeError::InvalidConfiguration(format!(
                "alias {} points at unknown font {}",
                alias, family
            ))
        })?;
        let key = normalize_name(alias);
        if key.is_empty() {
            return Err(CertForgeError::InvalidConfiguration(
                "font alias must not be empty".to_string(),
            ));
        }
        self.lookup.insert(key, target);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<ResolvedFont> {
        if let Some(font) = self.lookup.get(&normalize_name(name)) {
            return Some(font.clone());
        }
        StandardFont::from_name(name).map(ResolvedFont::Standard)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Primary names of registered font programs, in registration order.
    pub fn font_names(&self) -> &[String] {
        &self.families
    }

    fn insert(&mut self, font: Arc<LoadedFont>) -> String {
        let name = font.name.clone();
        if !self.families.contains(&name) {
            self.families.push(name.clone());
        }
        for alias in std::iter::once(&font.name).chain(font.aliases.iter()) {
            let key = normalize_name(alias);
            if key.is_empty() || self.lookup.contains_key(&key) {
                continue;
            }
            self.lookup.insert(key, ResolvedFont::Embedded(font.clone()));
        }
        name
    }
}

fn scale_u16(advance: u16, units_per_em: u16) -> u16 {
    let scaled = (advance as u32 * 1000 + units_per_em as u32 / 2) / units_per_em.max(1) as u32;
    scaled.min(u16::MAX as u32) as u16
}

fn scale_i16(value: i16, scale: f32) -> i16 {
    let scaled = (value as f32 * scale).round() as i32;
    scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn font_names(face: &ttf_parser::Face<'_>, path: &Path) -> (String, Vec<String>) {
    use ttf_parser::name::name_id;

    let mut family = None;
    let mut full = None;
    let mut post = None;

    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        let slot = match entry.name_id {
            name_id::TYPOGRAPHIC_FAMILY | name_id::FAMILY => &mut family,
            name_id::FULL_NAME => &mut full,
            name_id::POST_SCRIPT_NAME => &mut post,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(name);
        }
    }

    let stem = path
        .file_stem()
        .and_then(|v| v.to_str())
        .map(|v| v.to_string());
    let primary = post
        .clone()
        .or_else(|| full.clone())
        .or_else(|| family.clone())
        .or_else(|| stem.clone())
        .unwrap_or_else(|| "EmbeddedFont".to_string());

    let aliases = [family, full, post, stem]
        .into_iter()
        .flatten()
        .filter(|candidate| *candidate != primary)
        .collect();
    (primary, aliases)
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Minimal TrueType program (`cmap`, `head`, `hhea`, `hmtx`, `maxp`) with
/// `.notdef` (advance 500) at glyph 0 and glyph `i + 1` for `glyphs[i]`.
#[cfg(test)]
pub(crate) fn build_test_font(glyphs: &[(char, u16)]) -> Vec<u8> {
    fn be16(out: &mut Vec<u8>, value: u16) {
        out.extend_from_slice(&value.to_be_bytes());
    }
    fn be32(out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    let num_glyphs = glyphs.len() as u16 + 1;

    let mut cmap = Vec::new();
    let mut groups: Vec<(u32, u32)> = glyphs
        .iter()
        .enumerate()
        .map(|(index, (ch, _))| (*ch as u32, index as u32 + 1))
        .collect();
    groups.sort();
    be16(&mut cmap, 0);
    be16(&mut cmap, 1);
    be16(&mut cmap, 3);
    be16(&mut cmap, 10);
    be32(&mut cmap, 12);
    be16(&mut cmap, 12);
    be16(&mut cmap, 0);
    be32(&mut cmap, 16 + 12 * groups.len() as u32);
    be32(&mut cmap, 0);
    be32(&mut cmap, groups.len() as u32);
    for (code, gid) in groups {
        be32(&mut cmap, code);
        be32(&mut cmap, code);
        be32(&mut cmap, gid);
    }

    let mut head = Vec::new();
    be32(&mut head, 0x0001_0000);
    be32(&mut head, 0x0001_0000);
    be32(&mut head, 0);
    be32(&mut head, 0x5F0F_3CF5);
    be16(&mut head, 0);
    be16(&mut head, 1000);
    head.extend_from_slice(&[0; 16]);
    for value in [0i16, -200, 1000, 800] {
        be16(&mut head, value as u16);
    }
    for value in [0u16, 8, 2, 0, 0] {
        be16(&mut head, value);
    }

    let max_advance = glyphs.iter().map(|(_, advance)| *advance).max().unwrap_or(500).max(500);
    let mut hhea = Vec::new();
    be32(&mut hhea, 0x0001_0000);
    for value in [800i16, -200, 0] {
        be16(&mut hhea, value as u16);
    }
    be16(&mut hhea, max_advance);
    for value in [0u16, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0] {
        be16(&mut hhea, value);
    }
    be16(&mut hhea, num_glyphs);

    let mut hmtx = Vec::new();
    for advance in std::iter::once(500).chain(glyphs.iter().map(|(_, advance)| *advance)) {
        be16(&mut hmtx, advance);
        be16(&mut hmtx, 0);
    }

    let mut maxp = Vec::new();
    be32(&mut maxp, 0x0000_5000);
    be16(&mut maxp, num_glyphs);

    let tables: [(&[u8; 4], Vec<u8>); 5] = [
        (b"cmap", cmap),
        (b"head", head),
        (b"hhea", hhea),
        (b"hmtx", hmtx),
        (b"maxp", maxp),
    ];
    let mut out = Vec::new();
    be32(&mut out, 0x0001_0000);
    be16(&mut out, tables.len() as u16);
    be16(&mut out, 64);
    be16(&mut out, 2);
    be16(&mut out, 16);
    let mut offset = 12 + 16 * tables.len();
    let mut body = Vec::new();
    for (tag, data) in &tables {
        out.extend_from_slice(*tag);
        be32(&mut out, 0);
        be32(&mut out, offset as u32);
        be32(&mut out, data.len() as u32);
        body.extend_from_slice(data);
        while body.len() % 4 != 0 {
            body.push(0);
        }
        offset = 12 + 16 * tables.len() + body.len();
    }
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    const SYSTEM_FONT: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";

    #[test]
    fn winansi_covers_cp1252_and_replaces_the_rest() {
        let encoded = encode_winansi("Café €5 \u{2014} Zoë");
        assert_eq!(encoded.replaced, 0);
        assert_eq!(&encoded.bytes[..5], b"Caf\xE9 ");
        assert_eq!(encoded.bytes[5], 0x80);
        assert!(encoded.bytes.contains(&0x97));

        let encoded = encode_winansi("日本\tA");
        assert_eq!(encoded.bytes, b"???A");
        assert_eq!(encoded.replaced, 3);

        assert_eq!(winansi_byte('\u{0160}'), Some(0x8A));
        assert_eq!(winansi_byte('\u{0159}'), None);
    }

    #[test]
    fn helvetica_widths_follow_afm_metrics() {
        let font = ResolvedFont::Standard(StandardFont::Helvetica);
        // H 722 + e 556 + l 222 + l 222 + o 556
        assert_eq!(
            font.text_width("Hello", Pt::from_f64(10.0)).to_milli_i64(),
            22_780
        );
        assert_eq!(font.text_width("", Pt::from_f64(10.0)), Pt::ZERO);
        let widths = StandardFont::Helvetica.widths();
        assert_eq!(widths.len(), WIDTH_COUNT);
        assert_eq!(widths[(b'W' - FIRST_CHAR) as usize], 944);
        assert_eq!(widths[(0xE9 - FIRST_CHAR) as usize], 556);
    }

    #[test]
    fn courier_is_monospaced() {
        let font = ResolvedFont::Standard(StandardFont::Courier);
        let size = Pt::from_f64(12.0);
        assert_eq!(font.text_width("iiii", size), font.text_width("WWWW", size));
        assert_eq!(font.text_width("ab", size).to_milli_i64(), 14_400);
    }

    #[test]
    fn registry_resolves_standard_names_case_insensitively() {
        let registry = FontRegistry::new();
        assert!(matches!(
            registry.resolve(" HELVETICA "),
            Some(ResolvedFont::Standard(StandardFont::Helvetica))
        ));
        assert!(matches!(
            registry.resolve("monospace"),
            Some(ResolvedFont::Standard(StandardFont::Courier))
        ));
        assert!(registry.resolve("Great Vibes").is_none());
    }

    #[test]
    fn aliases_must_target_known_fonts() {
        let mut registry = FontRegistry::new();
        registry.add_alias("Body", "Courier").expect("alias");
        assert!(matches!(
            registry.resolve("body"),
            Some(ResolvedFont::Standard(StandardFont::Courier))
        ));
        let err = registry.add_alias("Script", "Nope").expect_err("unknown");
        assert!(matches!(err, CertForgeError::InvalidConfiguration(_)));
    }

    #[test]
    fn invalid_font_bytes_are_an_asset_error() {
        let mut registry = FontRegistry::new();
        let err = registry
            .register_bytes(b"not a font".to_vec(), Some("broken.ttf"))
            .expect_err("invalid");
        assert!(matches!(err, CertForgeError::Asset(_)));
        let err = registry.register_file("fonts/readme.txt").expect_err("extension");
        assert!(matches!(err, CertForgeError::Asset(_)));
    }

    #[test]
    fn concurrent_first_loads_decode_once() {
        let cache = FontCache::new();
        let source = FontSource::Bytes {
            name: "Shared.ttf".to_string(),
            data: Arc::from(build_test_font(&[('A', 600)])),
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(8)
            .build()
            .expect("pool");
        let fonts: Vec<Arc<LoadedFont>> = pool.install(|| {
            (0..64)
                .into_par_iter()
                .map(|_| cache.load(&source).expect("load"))
                .collect()
        });
        assert!(fonts.iter().all(|font| Arc::ptr_eq(font, &fonts[0])));
        assert_eq!(fonts[0].name(), "Shared");
        assert_eq!(cache.decode_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_loads_are_retried() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!(
            "certforge_fonts_{}_{}",
            std::process::id(),
            nanos
        ));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("Late.ttf");
        let cache = FontCache::new();
        let source = FontSource::File(path.clone());

        assert!(matches!(cache.load(&source), Err(CertForgeError::Asset(_))));
        assert!(cache.load(&source).is_err());
        assert_eq!(cache.decode_count(), 2);
        assert!(cache.is_empty());

        fs::write(&path, build_test_font(&[('A', 600)])).expect("write font");
        let first = cache.load(&source);
        let second = cache.load(&source);
        let _ = fs::remove_dir_all(&dir);

        let first = first.expect("loads once the file exists");
        assert!(Arc::ptr_eq(&first, &second.expect("cached")));
        assert_eq!(cache.decode_count(), 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn embedded_fonts_encode_glyph_ids_with_their_advances() {
        let mut registry = FontRegistry::new();
        let name = registry
            .register_bytes(
                build_test_font(&[('A', 600), ('\u{0159}', 550), ('\u{738B}', 1000), ('?', 450)]),
                Some("Tiny.ttf"),
            )
            .expect("register");
        assert_eq!(name, "Tiny");
        let font = registry.resolve("tiny").expect("resolve");

        let encoded = font.encode("A\u{0159}\u{738B}");
        assert_eq!(encoded.bytes, [0, 1, 0, 2, 0, 3]);
        assert_eq!(encoded.replaced, 0);
        assert_eq!(encoded.width_units, 2150);
        assert_eq!(
            encoded.glyphs,
            [(1, 'A'), (2, '\u{0159}'), (3, '\u{738B}')]
        );
        assert_eq!(
            font.text_width("A\u{0159}\u{738B}", Pt::from_f64(10.0)).to_milli_i64(),
            21_500
        );

        let encoded = font.encode("A\u{00E9}\n");
        assert_eq!(encoded.bytes, [0, 1, 0, 4, 0, 4]);
        assert_eq!(encoded.replaced, 2);
        assert_eq!(encoded.width_units, 1500);
        assert_eq!(encoded.glyphs, [(1, 'A'), (4, '?'), (4, '?')]);

        let ResolvedFont::Embedded(loaded) = &font else {
            panic!("expected an embedded font");
        };
        assert_eq!(loaded.glyph_widths([0, 3]), [(0, 500), (3, 1000)]);
    }

    #[test]
    fn standard_fonts_count_unencodable_characters() {
        let font = ResolvedFont::Standard(StandardFont::Helvetica);
        let encoded = font.encode("Dvo\u{0159}\u{00E1}k \u{738B}");
        assert_eq!(encoded.bytes, b"Dvo?\xE1k ?");
        assert_eq!(encoded.replaced, 2);
        assert!(encoded.glyphs.is_empty());
    }

    #[test]
    fn identical_bytes_share_a_cache_key() {
        let a = FontSource::Bytes {
            name: "a.ttf".to_string(),
            data: Arc::from(vec![1u8, 2, 3]),
        };
        let b = FontSource::Bytes {
            name: "b.ttf".to_string(),
            data: Arc::from(vec![1u8, 2, 3]),
        };
        assert_eq!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("sha256:"));
    }

    #[test]
    fn system_truetype_font_registers_and_measures() {
        let Ok(data) = fs::read(SYSTEM_FONT) else {
            return;
        };
        let mut registry = FontRegistry::new();
        let name = registry
            .register_bytes(data, Some("DejaVuSans.ttf"))
            .expect("register");
        assert_eq!(registry.font_names(), [name.clone()]);
        let font = registry.resolve("DejaVu Sans").expect("family alias");
        assert_eq!(font.base_font_name(), name);
        let size = Pt::from_f64(20.0);
        assert!(font.text_width("Certificate", size) > Pt::ZERO);
        assert!(font.text_width("WW", size) > font.text_width("ii", size));
    }
}
