//! Core trait definitions.

use crate::Result;

/// Destination for training metrics.
///
/// Scalars are tagged (`train/mel_loss`, `eval/F0_loss`, ...) and indexed by
/// the iteration for training tags or by `epoch + 1` for evaluation tags.
pub trait MetricsSink {
    /// Record a named scalar.
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;

    /// Record a formatted progress line.
    fn log_line(&mut self, line: &str) -> Result<()>;

    /// Flush buffered output.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        (**self).add_scalar(tag, value, step)
    }

    fn log_line(&mut self, line: &str) -> Result<()> {
        (**self).log_line(line)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}
