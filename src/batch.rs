use crate::debug::DebugLogger;
use crate::error::{CertForgeError, GenerationFailure};
use crate::geometry::PageGeometry;
use crate::layout::{LayoutField, validate_layout};
use crate::merge::{self, MergeContext, OutputEncoding, RenderedRow};
use crate::perf::PerfLogger;
use crate::table::Table;
use crate::template::TemplateImage;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One batch request: a validated layout applied to every row of a table.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    layout: Vec<LayoutField>,
    table: Table,
    geometry: PageGeometry,
    encoding: OutputEncoding,
    template: Option<Arc<TemplateImage>>,
    deadline: Option<Duration>,
}

impl GenerationJob {
    pub fn new(
        layout: Vec<LayoutField>,
        table: Table,
        geometry: PageGeometry,
        encoding: OutputEncoding,
    ) -> Result<Self, CertForgeError> {
        validate_layout(&layout)?;
        validate_geometry(&geometry)?;
        Ok(Self {
            layout,
            table,
            geometry,
            encoding,
            template: None,
            deadline: None,
        })
    }

    pub fn with_template(mut self, template: Arc<TemplateImage>) -> Self {
        self.template = Some(template);
        self
    }

    /// Overrides the engine's default batch deadline for this job.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn layout(&self) -> &[LayoutField] {
        &self.layout
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn geometry(&self) -> PageGeometry {
        self.geometry
    }

    pub fn encoding(&self) -> OutputEncoding {
        self.encoding
    }

    pub fn template(&self) -> Option<&Arc<TemplateImage>> {
        self.template.as_ref()
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }
}

pub(crate) fn validate_geometry(geometry: &PageGeometry) -> Result<(), CertForgeError> {
    let usable = |v: f64| v.is_finite() && v > 0.0;
    if usable(geometry.width_pt) && usable(geometry.height_pt) {
        Ok(())
    } else {
        Err(CertForgeError::InvalidConfiguration(format!(
            "page geometry must be positive, got {} x {}",
            geometry.width_pt, geometry.height_pt
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub row_index: usize,
    pub outcome: Result<RenderedRow, GenerationFailure>,
}

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn reason_code(&self) -> Option<&'static str> {
        self.outcome.as_ref().err().map(GenerationFailure::reason_code)
    }
}

/// Per-row outcomes in row order; `results.len()` always equals the row count.
#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub results: Vec<GenerationResult>,
    pub success_count: usize,
    pub failure_count: usize,
    pub warning_count: usize,
    pub elapsed_ms: f64,
}

impl GenerationReport {
    fn from_results(results: Vec<GenerationResult>, elapsed_ms: f64) -> Self {
        let success_count = results.iter().filter(|r| r.is_success()).count();
        let warning_count = results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok())
            .map(|row| row.warnings.len())
            .sum();
        Self {
            failure_count: results.len() - success_count,
            success_count,
            warning_count,
            elapsed_ms,
            results,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &GenerationFailure)> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|err| (r.row_index, err)))
    }
}

/// Source of the current time for deadline checks.
pub(crate) type Clock<'a> = &'a (dyn Fn() -> Instant + Sync);

pub(crate) struct BatchRunner<'a> {
    pub(crate) merge: MergeContext<'a>,
    pub(crate) pool: &'a rayon::ThreadPool,
    pub(crate) default_deadline: Option<Duration>,
    pub(crate) debug: Option<&'a DebugLogger>,
    pub(crate) perf: Option<&'a PerfLogger>,
    pub(crate) clock: Clock<'a>,
}

impl BatchRunner<'_> {
    /// Renders every row on the pool. Rows that have not started, or that
    /// finish, after the deadline are reported as timeouts; a row already in
    /// progress is never interrupted.
    pub(crate) fn run(&self, job: &GenerationJob) -> GenerationReport {
        let started = (self.clock)();
        let deadline = job.deadline.or(self.default_deadline);
        let cutoff = deadline.and_then(|d| started.checked_add(d));
        let rows = job.table.len();

        if let Some(debug) = self.debug {
            debug.log_event(
                "batch.start",
                serde_json::json!({
                    "rows": rows,
                    "fields": job.layout.len(),
                    "workers": self.pool.current_num_threads(),
                    "encoding": job.encoding.as_str(),
                    "width_pt": job.geometry.width_pt,
                    "height_pt": job.geometry.height_pt,
                    "deadline_ms": deadline.map(|d| d.as_millis() as u64),
                }),
            );
        }

        let results: Vec<GenerationResult> = self.pool.install(|| {
            (0..rows)
                .into_par_iter()
                .map(|row_index| GenerationResult {
                    row_index,
                    outcome: self.render_one(job, row_index, cutoff),
                })
                .collect()
        });

        let elapsed_ms = (self.clock)()
            .saturating_duration_since(started)
            .as_secs_f64()
            * 1000.0;
        let report = GenerationReport::from_results(results, elapsed_ms);
        self.log_report(&report);
        report
    }

    fn render_one(
        &self,
        job: &GenerationJob,
        row_index: usize,
        cutoff: Option<Instant>,
    ) -> Result<RenderedRow, GenerationFailure> {
        let past = |cutoff: Option<Instant>| cutoff.is_some_and(|at| (self.clock)() >= at);
        if past(cutoff) {
            return Err(GenerationFailure::Timeout);
        }
        let row = job
            .table
            .row(row_index)
            .ok_or_else(|| GenerationFailure::Render(format!("row {} out of range", row_index)))?;
        let t0 = Instant::now();
        let outcome = merge::render_row(
            &self.merge,
            &job.layout,
            &row,
            &job.geometry,
            job.encoding,
            job.template.as_ref(),
        );
        if let Some(perf) = self.perf {
            perf.log_span_ms("row.render", Some(row_index), t0.elapsed().as_secs_f64() * 1000.0);
            if let Ok((_, stats)) = &outcome {
                perf.log_counts(
                    "pdf",
                    Some(row_index),
                    &[
                        ("bytes", stats.bytes as u64),
                        ("objects", stats.objects as u64),
                        ("fonts", stats.fonts as u64),
                        ("images", stats.images as u64),
                    ],
                );
            }
        }
        if past(cutoff) {
            return Err(GenerationFailure::Timeout);
        }
        outcome.map(|(rendered, _)| rendered)
    }

    fn log_report(&self, report: &GenerationReport) {
        if let Some(debug) = self.debug {
            for result in &report.results {
                match &result.outcome {
                    Ok(rendered) => {
                        for warning in &rendered.warnings {
                            debug.log_event(
                                "row.warning",
                                serde_json::json!({
                                    "row": result.row_index,
                                    "field": warning.field_id,
                                    "message": warning.error.to_string(),
                                }),
                            );
                            debug.increment("rows.warning", 1);
                        }
                        debug.increment("rows.success", 1);
                    }
                    Err(failure) => {
                        let detail = match failure {
                            GenerationFailure::Render(detail) => Some(detail.as_str()),
                            _ => None,
                        };
                        debug.log_event(
                            "row.failure",
                            serde_json::json!({
                                "row": result.row_index,
                                "reason": failure.reason_code(),
                                "message": failure.to_string(),
                                "detail": detail,
                            }),
                        );
                        debug.increment("rows.failure", 1);
                        debug.increment(&format!("failure.{}", failure.reason_code()), 1);
                    }
                }
            }
            debug.emit_summary("batch");
            debug.flush();
        }
        if let Some(perf) = self.perf {
            perf.log_span_ms("batch.total", None, report.elapsed_ms);
            perf.log_counts(
                "batch",
                None,
                &[
                    ("rows", report.results.len() as u64),
                    ("success", report.success_count as u64),
                    ("failure", report.failure_count as u64),
                    ("warning", report.warning_count as u64),
                ],
            );
            perf.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csv;
    use crate::error::FieldError;
    use crate::font::{FontRegistry, ResolvedFont, StandardFont};
    use crate::geometry;
    use crate::pdf::PdfOptions;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn sample_table(rows: usize) -> Table {
        let mut text = String::from("Name,Course\n");
        for i in 0..rows {
            text.push_str(&format!("Student {i},Course {i}\n"));
        }
        csv::parse_table(&text).expect("table")
    }

    fn name_layout() -> Vec<LayoutField> {
        vec![
            LayoutField::text("name", "Name", 0.5, 0.45).with_font("Helvetica", 36.0),
            LayoutField::text("course", "Course", 0.5, 0.6),
        ]
    }

    fn run_with(job: &GenerationJob, threads: usize, deadline: Option<Duration>) -> GenerationReport {
        run_with_clock(job, threads, deadline, &Instant::now)
    }

    fn run_with_clock(
        job: &GenerationJob,
        threads: usize,
        deadline: Option<Duration>,
        clock: Clock<'_>,
    ) -> GenerationReport {
        let fonts = FontRegistry::new();
        let fallback = ResolvedFont::Standard(StandardFont::Helvetica);
        let pdf = PdfOptions::default();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .expect("pool");
        BatchRunner {
            merge: MergeContext {
                fonts: &fonts,
                fallback: &fallback,
                pdf: &pdf,
            },
            pool: &pool,
            default_deadline: deadline,
            debug: None,
            perf: None,
            clock,
        }
        .run(job)
    }

    fn job(table: Table, layout: Vec<LayoutField>) -> GenerationJob {
        GenerationJob::new(
            layout,
            table,
            geometry::resolve(Some(2000.0), Some(1414.0)),
            OutputEncoding::Binary,
        )
        .expect("job")
    }

    #[test]
    fn two_rows_render_two_documents() {
        let report = run_with(&job(sample_table(2), name_layout()), 2, None);
        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 0);
        assert_eq!(report.results.len(), 2);
        for (index, result) in report.results.iter().enumerate() {
            assert_eq!(result.row_index, index);
            let rendered = result.outcome.as_ref().expect("rendered");
            let bytes = rendered.document.pdf_bytes().expect("bytes");
            assert!(bytes.starts_with(b"%PDF-1.7"));
        }
    }

    #[test]
    fn missing_column_fails_every_row() {
        let table = csv::parse_table("Course\nRust\nGo\nZig\n").expect("table");
        let report = run_with(&job(table, name_layout()), 2, None);
        assert_eq!(report.failure_count, 3);
        assert_eq!(report.success_count, 0);
        assert_eq!(report.results.len(), 3);
        for result in &report.results {
            assert_eq!(
                result.outcome,
                Err(GenerationFailure::Field(FieldError::MissingColumn(
                    "Name".to_string()
                )))
            );
            assert_eq!(result.reason_code(), Some("missing_column"));
        }
    }

    #[test]
    fn bytes_are_identical_across_worker_counts() {
        let job = job(sample_table(6), name_layout());
        let single = run_with(&job, 1, None);
        let parallel = run_with(&job, 4, None);
        assert_eq!(single.results, parallel.results);
    }

    #[test]
    fn expired_deadline_reports_timeouts_for_every_row() {
        let job = job(sample_table(5), name_layout()).with_deadline(Duration::from_nanos(1));
        let report = run_with(&job, 2, Some(Duration::from_secs(60)));
        assert_eq!(report.results.len(), 5);
        assert_eq!(report.failure_count, 5);
        assert!(
            report
                .results
                .iter()
                .all(|r| r.outcome == Err(GenerationFailure::Timeout))
        );
    }

    #[test]
    fn deadline_passing_mid_batch_times_out_only_later_rows() {
        // Each reading advances the clock by one second. The batch reads it at
        // start and end, a row reads it before and after rendering.
        let base = Instant::now();
        let ticks = AtomicU64::new(0);
        let clock = || base + Duration::from_secs(ticks.fetch_add(1, Ordering::SeqCst));
        let job = job(sample_table(5), name_layout()).with_deadline(Duration::from_millis(5500));
        let report = run_with_clock(&job, 1, None, &clock);

        assert_eq!(report.results.len(), 5);
        let rows: Vec<usize> = report.results.iter().map(|r| r.row_index).collect();
        assert_eq!(rows, vec![0, 1, 2, 3, 4]);
        assert!(report.results[0].is_success());
        assert!(report.results[1].is_success());
        // Row 2 starts at 5s and finishes at 6s; rows 3 and 4 never start.
        for result in &report.results[2..] {
            assert_eq!(result.outcome, Err(GenerationFailure::Timeout));
            assert_eq!(result.reason_code(), Some("timeout"));
        }
        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 3);
        assert_eq!(ticks.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn generous_deadline_lets_every_row_finish() {
        let job = job(sample_table(3), name_layout());
        let report = run_with(&job, 2, Some(Duration::from_secs(120)));
        assert_eq!(report.success_count, 3);
    }

    #[test]
    fn header_only_table_yields_an_empty_report() {
        let table = csv::parse_table("Name\n").expect("table");
        let report = run_with(&job(table, name_layout()), 2, None);
        assert!(report.results.is_empty());
        assert_eq!(report.success_count + report.failure_count, 0);
    }

    #[test]
    fn invalid_layout_is_rejected_at_job_construction() {
        let err = GenerationJob::new(
            vec![LayoutField::text("a", "Name", 1.5, 0.5)],
            sample_table(1),
            PageGeometry::FALLBACK,
            OutputEncoding::Binary,
        )
        .expect_err("out of range");
        assert!(matches!(err, CertForgeError::Layout(_)));

        let err = GenerationJob::new(
            name_layout(),
            sample_table(1),
            PageGeometry {
                width_pt: 0.0,
                height_pt: 10.0,
            },
            OutputEncoding::Binary,
        )
        .expect_err("empty page");
        assert!(matches!(err, CertForgeError::InvalidConfiguration(_)));
    }

    #[test]
    fn warnings_are_counted_on_successful_rows() {
        let layout = vec![LayoutField::text("n", "Name", 0.5, 0.5).with_font("Pinyon Script", 30.0)];
        let report = run_with(&job(sample_table(3), layout), 2, None);
        assert_eq!(report.success_count, 3);
        assert_eq!(report.warning_count, 3);
    }
}
