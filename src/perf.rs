use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Timing spans and counters per rendered row. When the last handle is
/// dropped a `<stem>_hot.log` next to the log ranks the most expensive spans.
#[derive(Clone)]
pub(crate) struct PerfLogger {
    inner: Arc<Mutex<PerfState>>,
}

struct PerfState {
    writer: BufWriter<File>,
    path: PathBuf,
    span_totals: HashMap<String, f64>,
    span_counts: HashMap<String, u64>,
    count_totals: HashMap<String, u64>,
}

impl PerfLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PerfState {
                writer: BufWriter::new(file),
                path,
                span_totals: HashMap::new(),
                span_counts: HashMap::new(),
                count_totals: HashMap::new(),
            })),
        })
    }

    pub fn log_span_ms(&self, name: &str, row: Option<usize>, ms: f64) {
        let record = json!({
            "type": "perf.span",
            "name": name,
            "row": row,
            "unit": "ms",
            "ms": (ms * 1000.0).round() / 1000.0,
        });
        if let Ok(mut state) = self.inner.lock() {
            *state.span_totals.entry(name.to_string()).or_insert(0.0) += ms;
            let entry = state.span_counts.entry(name.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            let _ = writeln!(state.writer, "{record}");
        }
    }

    pub fn log_counts(&self, name: &str, row: Option<usize>, counts: &[(&str, u64)]) {
        let counts_map: Map<String, Value> = counts
            .iter()
            .map(|(key, value)| (key.to_string(), Value::from(*value)))
            .collect();
        let record = json!({
            "type": "perf.counts",
            "name": name,
            "row": row,
            "counts": counts_map,
        });
        if let Ok(mut state) = self.inner.lock() {
            for (key, value) in counts {
                let entry = state.count_totals.entry(format!("{name}.{key}")).or_insert(0);
                *entry = entry.saturating_add(*value);
            }
            let _ = writeln!(state.writer, "{record}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

impl Drop for PerfState {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let Ok(file) = File::create(hot_path_for(&self.path)) else {
            return;
        };
        let mut writer = BufWriter::new(file);

        let mut spans: Vec<(&String, &f64)> = self.span_totals.iter().collect();
        spans.sort_by(|a, b| {
            b.1.partial_cmp(a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        for (rank, (name, ms)) in spans.into_iter().take(100).enumerate() {
            let count = self.span_counts.get(name).copied().unwrap_or(1).max(1);
            let record = json!({
                "type": "perf.hot.span",
                "rank": rank + 1,
                "name": name,
                "unit": "ms",
                "agg": "sum",
                "ms": (ms * 1000.0).round() / 1000.0,
                "count": count,
                "avg_ms": (ms / count as f64 * 1000.0).round() / 1000.0,
            });
            let _ = writeln!(writer, "{record}");
        }

        let mut counts: Vec<(&String, &u64)> = self.count_totals.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (rank, (name, value)) in counts.into_iter().take(100).enumerate() {
            let record = json!({
                "type": "perf.hot.count",
                "rank": rank + 1,
                "name": name,
                "value": value,
            });
            let _ = writeln!(writer, "{record}");
        }
        let _ = writer.flush();
    }
}

fn hot_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("certforge_perf.log");
    let stem = file_name
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(file_name);
    path.with_file_name(format!("{stem}_hot.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn hot_path_sits_next_to_the_log() {
        assert_eq!(
            hot_path_for(Path::new("/tmp/run/perf.jsonl")),
            PathBuf::from("/tmp/run/perf_hot.log")
        );
        assert_eq!(
            hot_path_for(Path::new("perf")),
            PathBuf::from("perf_hot.log")
        );
    }

    #[test]
    fn spans_and_hot_summary_are_written() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!(
            "certforge_perf_{}_{}.jsonl",
            std::process::id(),
            nanos
        ));
        {
            let logger = PerfLogger::new(&path).expect("logger");
            logger.log_span_ms("row.render", Some(0), 2.5);
            logger.log_span_ms("row.render", Some(1), 1.5);
            logger.log_span_ms("batch.total", None, 5.0);
            logger.log_counts("pdf", Some(0), &[("bytes", 1200), ("fonts", 1)]);
            logger.flush();
        }
        let log = std::fs::read_to_string(&path).expect("log");
        let hot_path = hot_path_for(&path);
        let hot = std::fs::read_to_string(&hot_path).expect("hot log");
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&hot_path);

        let first: Value = serde_json::from_str(log.lines().next().expect("line")).expect("json");
        assert_eq!(first["type"], "perf.span");
        assert_eq!(first["row"], 0);
        assert_eq!(log.lines().count(), 4);

        let hot: Vec<Value> = hot
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(hot[0]["name"], "batch.total");
        assert_eq!(hot[1]["name"], "row.render");
        assert_eq!(hot[1]["count"], 2);
        assert_eq!(hot[1]["avg_ms"], 2.0);
        assert!(hot.iter().any(|v| v["name"] == "pdf.bytes" && v["value"] == 1200));
    }
}
