use tch::Tensor;

/// Destination for the metric stream. The handle is created at run start,
/// passed to the trainer, and closed with `finish` at run end.
///
/// Logging is fire-and-forget: implementations must swallow their own
/// failures (warn and drop) rather than surface them to training.
pub trait MetricLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64);
    fn log_image(&mut self, name: &str, image: &Tensor, step: u64);
    fn log_table(&mut self, name: &str, rows: &[Vec<String>], step: u64);
    fn finish(&mut self) {}
}

/// Logger backed by the `log` crate. Images and tables are summarized
/// rather than dumped.
#[derive(Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) {
        log::info!("step {:>8} | {} = {:.6}", step, name, value);
    }

    fn log_image(&mut self, name: &str, image: &Tensor, step: u64) {
        log::info!("step {:>8} | image {} {:?}", step, name, image.size());
    }

    fn log_table(&mut self, name: &str, rows: &[Vec<String>], step: u64) {
        log::info!("step {:>8} | table {} ({} rows)", step, name, rows.len());
    }

    fn finish(&mut self) {
        log::info!("run finished");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarRecord {
    pub name: String,
    pub value: f64,
    pub step: u64,
}

/// In-memory logger for tests.
#[derive(Default)]
pub struct MemoryLogger {
    pub scalars: Vec<ScalarRecord>,
    pub images: Vec<(String, u64)>,
    pub tables: Vec<(String, u64)>,
    pub finished: bool,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar_values(&self, name: &str) -> Vec<f64> {
        self.scalars
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.value)
            .collect()
    }
}

impl MetricLogger for MemoryLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) {
        self.scalars.push(ScalarRecord {
            name: name.to_string(),
            value,
            step,
        });
    }

    fn log_image(&mut self, name: &str, _image: &Tensor, step: u64) {
        self.images.push((name.to_string(), step));
    }

    fn log_table(&mut self, name: &str, _rows: &[Vec<String>], step: u64) {
        self.tables.push((name.to_string(), step));
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

/// Forwarding impl so a test (or any caller) can keep a handle on the
/// logger it hands to the trainer.
impl<L: MetricLogger> MetricLogger for std::sync::Arc<std::sync::Mutex<L>> {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) {
        if let Ok(mut inner) = self.lock() {
            inner.log_scalar(name, value, step);
        } else {
            log::warn!("metric logger lock poisoned; dropping scalar '{}'", name);
        }
    }

    fn log_image(&mut self, name: &str, image: &Tensor, step: u64) {
        if let Ok(mut inner) = self.lock() {
            inner.log_image(name, image, step);
        }
    }

    fn log_table(&mut self, name: &str, rows: &[Vec<String>], step: u64) {
        if let Ok(mut inner) = self.lock() {
            inner.log_table(name, rows, step);
        }
    }

    fn finish(&mut self) {
        if let Ok(mut inner) = self.lock() {
            inner.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_logger_records_in_order() {
        let mut logger = MemoryLogger::new();
        logger.log_scalar("train/loss", 1.0, 1);
        logger.log_scalar("train/loss", 0.5, 2);
        logger.log_scalar("val/loss", 0.7, 2);
        logger.finish();
        assert_eq!(logger.scalar_values("train/loss"), vec![1.0, 0.5]);
        assert!(logger.finished);
    }
}
