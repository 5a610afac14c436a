mod batch;
mod canvas;
pub mod csv;
mod debug;
mod error;
mod font;
pub mod geometry;
pub mod ingest;
pub mod layout;
mod merge;
mod pdf;
mod perf;
mod table;
mod template;
mod types;
mod workbook;
mod zip;

pub use batch::{GenerationJob, GenerationReport, GenerationResult};
use batch::BatchRunner;
use debug::DebugLogger;
pub use error::{
    CertForgeError, ErrorClass, FieldError, GenerationFailure, IngestError, LayoutError,
};
pub use font::{FontCache, FontRegistry, FontSource, LoadedFont, ResolvedFont, StandardFont};
pub use geometry::PageGeometry;
pub use ingest::InputFormat;
pub use layout::{Align, FieldKind, LayoutField};
use merge::MergeContext;
pub use merge::{FieldWarning, OutputEncoding, RenderedDocument, RenderedRow, text_origin};
use pdf::PdfOptions;
pub use pdf::PdfStats;
use perf::PerfLogger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
pub use table::{FieldSource, Row, Table};
pub use template::TemplateImage;
pub use types::{Color, Pt};
pub use workbook::parse_workbook;

/// Certificate generation engine: fonts, worker pool and logging configured
/// once, then reused for any number of jobs.
pub struct CertForge {
    fonts: Arc<FontRegistry>,
    fallback: ResolvedFont,
    pool: Arc<rayon::ThreadPool>,
    default_deadline: Option<Duration>,
    pdf_options: PdfOptions,
    debug: Option<Arc<DebugLogger>>,
    perf: Option<Arc<PerfLogger>>,
}

impl CertForge {
    pub fn builder() -> CertForgeBuilder {
        CertForgeBuilder::new()
    }

    /// Renders one document per table row. Never fails as a whole: every row
    /// gets a result, in row order.
    pub fn generate(&self, job: &GenerationJob) -> GenerationReport {
        BatchRunner {
            merge: self.merge_context(),
            pool: &self.pool,
            default_deadline: self.default_deadline,
            debug: self.debug.as_deref(),
            perf: self.perf.as_deref(),
            clock: &Instant::now,
        }
        .run(job)
    }

    /// Renders a single document from any row-like value source.
    ///
    /// An invalid layout or page geometry is reported as a render failure
    /// since there is no job to reject.
    pub fn generate_one<S: FieldSource + ?Sized>(
        &self,
        layout: &[LayoutField],
        row: &S,
        geometry: &PageGeometry,
        encoding: OutputEncoding,
        template: Option<&Arc<TemplateImage>>,
    ) -> Result<RenderedRow, GenerationFailure> {
        layout::validate_layout(layout)
            .map_err(|err| GenerationFailure::Render(err.to_string()))?;
        batch::validate_geometry(geometry)
            .map_err(|err| GenerationFailure::Render(err.to_string()))?;
        merge::render_row(
            &self.merge_context(),
            layout,
            row,
            geometry,
            encoding,
            template,
        )
        .map(|(rendered, _)| rendered)
    }

    pub fn fonts(&self) -> &FontRegistry {
        &self.fonts
    }

    pub fn fallback_font(&self) -> &ResolvedFont {
        &self.fallback
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline
    }

    fn merge_context(&self) -> MergeContext<'_> {
        MergeContext {
            fonts: &self.fonts,
            fallback: &self.fallback,
            pdf: &self.pdf_options,
        }
    }
}

pub struct CertForgeBuilder {
    font_files: Vec<PathBuf>,
    font_dirs: Vec<PathBuf>,
    font_bytes: Vec<(Vec<u8>, Option<String>)>,
    font_aliases: Vec<(String, String)>,
    fallback_font: Option<String>,
    workers: Option<usize>,
    default_deadline: Option<Duration>,
    debug_path: Option<PathBuf>,
    perf_path: Option<PathBuf>,
    document_title: Option<String>,
}

impl CertForgeBuilder {
    pub fn new() -> Self {
        Self {
            font_files: Vec::new(),
            font_dirs: Vec::new(),
            font_bytes: Vec::new(),
            font_aliases: Vec::new(),
            fallback_font: None,
            workers: None,
            default_deadline: None,
            debug_path: None,
            perf_path: None,
            document_title: None,
        }
    }

    pub fn font_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_files.push(path.into());
        self
    }

    pub fn font_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_dirs.push(path.into());
        self
    }

    pub fn font_bytes(mut self, data: Vec<u8>, source_name: Option<&str>) -> Self {
        self.font_bytes.push((data, source_name.map(str::to_string)));
        self
    }

    /// Lets layouts name a registered font by another family name.
    pub fn font_alias(mut self, alias: impl Into<String>, family: impl Into<String>) -> Self {
        self.font_aliases.push((alias.into(), family.into()));
        self
    }

    // Used for fields whose family is not registered. Defaults to Helvetica.
    pub fn fallback_font(mut self, family: impl Into<String>) -> Self {
        self.fallback_font = Some(family.into());
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    pub fn debug_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_path = Some(path.into());
        self
    }

    pub fn perf_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.perf_path = Some(path.into());
        self
    }

    pub fn document_title(mut self, title: impl Into<String>) -> Self {
        self.document_title = Some(title.into());
        self
    }

    pub fn build(self) -> Result<CertForge, CertForgeError> {
        if self.workers == Some(0) {
            return Err(CertForgeError::InvalidConfiguration(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.default_deadline == Some(Duration::ZERO) {
            return Err(CertForgeError::InvalidConfiguration(
                "default_deadline must be greater than zero".to_string(),
            ));
        }

        let mut registry = FontRegistry::new();
        for dir in &self.font_dirs {
            registry.register_dir(dir)?;
        }
        for file in &self.font_files {
            registry.register_file(file)?;
        }
        for (data, name) in self.font_bytes {
            registry.register_bytes(data, name.as_deref())?;
        }
        for (alias, family) in &self.font_aliases {
            registry.add_alias(alias, family)?;
        }
        let fallback_name = self
            .fallback_font
            .unwrap_or_else(|| layout::DEFAULT_FONT_FAMILY.to_string());
        let fallback = registry.resolve(&fallback_name).ok_or_else(|| {
            CertForgeError::InvalidConfiguration(format!(
                "fallback font {} is not registered",
                fallback_name
            ))
        })?;

        let workers = self.workers.unwrap_or_else(rayon::current_num_threads).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("certforge-render-{index}"))
            .build()
            .map_err(|err| CertForgeError::InvalidConfiguration(err.to_string()))?;

        let debug = match self.debug_path {
            Some(path) => Some(Arc::new(DebugLogger::new(path)?)),
            None => None,
        };
        let perf = match self.perf_path {
            Some(path) => Some(Arc::new(PerfLogger::new(path)?)),
            None => None,
        };

        Ok(CertForge {
            fonts: Arc::new(registry),
            fallback,
            pool: Arc::new(pool),
            default_deadline: self.default_deadline,
            pdf_options: PdfOptions {
                title: self.document_title,
            },
            debug,
            perf,
        })
    }
}

impl Default for CertForgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
