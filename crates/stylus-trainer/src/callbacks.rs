//! Metric sinks.
//!
//! - [`TracingSink`] - scalars and progress lines through `tracing`
//! - [`JsonlMetricsSink`] - one JSON object per scalar in a JSONL file
//! - [`ProgressSink`] - progress bar driven by the training mel loss
//! - [`MemorySink`] - keeps everything in memory, for tests and inspection
//! - [`FanoutSink`] - forwards to several sinks
//!
//! Training tags are indexed by iteration; `eval/*` tags by `epoch + 1`.
//!
//! ```ignore
//! use stylus_trainer::callbacks::{FanoutSink, JsonlMetricsSink, TracingSink};
//!
//! let sink = FanoutSink::new()
//!     .with(TracingSink::new())
//!     .with(JsonlMetricsSink::new("logs/metrics.jsonl")?);
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use stylus_core::{MetricsSink, Result};

/// Emits every scalar at debug level and every line at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TracingSink {
    /// New sink.
    pub fn new() -> Self {
        Self
    }
}

impl MetricsSink for TracingSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        tracing::debug!(tag, value, step, "scalar");
        Ok(())
    }

    fn log_line(&mut self, line: &str) -> Result<()> {
        tracing::info!("{}", line);
        Ok(())
    }
}

/// JSONL metrics file.
///
/// ```json
/// {"tag": "train/mel_loss", "value": 0.41, "step": 20, "timestamp": 1760000000}
/// {"line": "Epoch [1/4], Step [20/80], Loss: 0.41000, ...", "timestamp": 1760000000}
/// ```
pub struct JsonlMetricsSink {
    writer: BufWriter<File>,
    path: PathBuf,
    flush_every: usize,
    pending: usize,
}

impl JsonlMetricsSink {
    /// Create (truncating) the file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            flush_every: 10,
            pending: 0,
        })
    }

    /// Flush after this many entries.
    pub fn with_flush_every(mut self, entries: usize) -> Self {
        self.flush_every = entries.max(1);
        self
    }

    /// Path to the metrics file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entry(&mut self, entry: serde_json::Value) -> Result<()> {
        let line = serde_json::to_string(&entry)?;
        writeln!(self.writer, "{}", line)?;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl MetricsSink for JsonlMetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        // serde_json writes non-finite floats as null.
        self.write_entry(serde_json::json!({
            "tag": tag,
            "value": value,
            "step": step,
            "timestamp": unix_seconds(),
        }))
    }

    fn log_line(&mut self, line: &str) -> Result<()> {
        self.write_entry(serde_json::json!({
            "line": line,
            "timestamp": unix_seconds(),
        }))
    }

    fn flush(&mut self) -> Result<()> {
        self.pending = 0;
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlMetricsSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Progress bar over training steps.
///
/// Clones share the same bar.
#[derive(Clone)]
pub struct ProgressSink {
    progress: indicatif::ProgressBar,
}

impl ProgressSink {
    /// Bar with `total_steps` positions.
    pub fn new(total_steps: usize) -> Self {
        let progress = indicatif::ProgressBar::new(total_steps as u64);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
        progress.set_style(style);
        Self { progress }
    }

    /// Hidden bar, for non-interactive runs.
    pub fn hidden() -> Self {
        Self {
            progress: indicatif::ProgressBar::hidden(),
        }
    }

    /// Finish the bar.
    pub fn finish(&self) {
        self.progress.finish_with_message("Training complete!");
    }
}

impl MetricsSink for ProgressSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        if tag == "train/mel_loss" {
            self.progress.set_position(step as u64);
            self.progress.set_message(format!("mel: {:.4}", value));
        }
        Ok(())
    }

    fn log_line(&mut self, line: &str) -> Result<()> {
        self.progress.println(line);
        Ok(())
    }
}

/// One recorded scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarRecord {
    /// Tag.
    pub tag: String,
    /// Value.
    pub value: f64,
    /// Step index.
    pub step: usize,
}

/// Keeps every scalar and line.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    /// Scalars in arrival order.
    pub scalars: Vec<ScalarRecord>,
    /// Progress lines in arrival order.
    pub lines: Vec<String>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records under `tag`.
    pub fn tagged<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a ScalarRecord> + 'a {
        self.scalars.iter().filter(move |r| r.tag == tag)
    }

    /// Last value recorded under `tag`.
    pub fn last(&self, tag: &str) -> Option<f64> {
        self.tagged(tag).last().map(|r| r.value)
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.scalars.push(ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
        });
        Ok(())
    }

    fn log_line(&mut self, line: &str) -> Result<()> {
        self.lines.push(line.to_string());
        Ok(())
    }
}

/// Forwards everything to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanoutSink {
    /// No inner sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Number of inner sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether there are no inner sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        for sink in &mut self.sinks {
            sink.add_scalar(tag, value, step)?;
        }
        Ok(())
    }

    fn log_line(&mut self, line: &str) -> Result<()> {
        for sink in &mut self.sinks {
            sink.log_line(line)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_sink_writes_one_object_per_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("metrics.jsonl");
        {
            let mut sink = JsonlMetricsSink::new(&path).unwrap().with_flush_every(100);
            sink.add_scalar("train/mel_loss", 0.5, 3).unwrap();
            sink.add_scalar("eval/dur_loss", f64::NAN, 1).unwrap();
            sink.log_line("Epoch [1/2]").unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["tag"], "train/mel_loss");
        assert_eq!(rows[0]["step"], 3);
        assert!(rows[1]["value"].is_null());
        assert_eq!(rows[2]["line"], "Epoch [1/2]");
    }

    #[test]
    fn test_memory_sink_queries() {
        let mut sink = MemorySink::new();
        sink.add_scalar("train/gen_loss", 1.0, 1).unwrap();
        sink.add_scalar("train/gen_loss", 2.0, 2).unwrap();
        sink.add_scalar("eval/mel_loss", 3.0, 1).unwrap();
        assert_eq!(sink.tagged("train/gen_loss").count(), 2);
        assert_eq!(sink.last("train/gen_loss"), Some(2.0));
        assert_eq!(sink.last("missing"), None);
    }

    #[test]
    fn test_fanout_forwards_to_all() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.jsonl");
        let mut fanout = FanoutSink::new()
            .with(TracingSink::new())
            .with(ProgressSink::hidden())
            .with(JsonlMetricsSink::new(&path).unwrap());
        assert_eq!(fanout.len(), 3);
        fanout.add_scalar("train/mel_loss", 0.25, 7).unwrap();
        fanout.log_line("hello").unwrap();
        fanout.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }
}
