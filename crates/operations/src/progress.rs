//! Progress reporting for running work

use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::engine::OperationInner;

/// Handle given to running work for publishing progress metadata.
///
/// Updates take a short synchronous lock and never wait on readers.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<OperationInner>,
}

impl ProgressReporter {
    pub(crate) fn new(inner: Arc<OperationInner>) -> Self {
        Self { inner }
    }

    /// Publish progress for a stage.
    ///
    /// Writes a `progress` map (`stage`, `percent`, `processed`, `speed`) for
    /// API callers and a `<stage>_progress` line for humans.
    pub fn set_progress(
        &self,
        stage: &str,
        display_prefix: &str,
        percent: u64,
        processed: u64,
        speed: u64,
    ) {
        let mut progress = Map::new();
        progress.insert("stage".to_string(), json!(stage));
        if processed > 0 {
            progress.insert("processed".to_string(), json!(processed.to_string()));
        }
        if percent > 0 {
            progress.insert("percent".to_string(), json!(percent.to_string()));
        }
        progress.insert("speed".to_string(), json!(speed.to_string()));

        let line = if percent > 0 {
            format!("{display_prefix}: {percent}% ({}/s)", format_bytes(speed))
        } else if processed > 0 {
            format!(
                "{display_prefix}: {} ({}/s)",
                format_bytes(processed),
                format_bytes(speed)
            )
        } else {
            format!("{display_prefix}: {}/s", format_bytes(speed))
        };

        self.update(|metadata| {
            metadata.insert("progress".to_string(), Value::Object(progress));
            metadata.insert(format!("{stage}_progress"), Value::String(line));
        });
    }

    /// Set an arbitrary metadata field
    pub fn set_field(&self, key: impl Into<String>, value: Value) {
        self.update(|metadata| {
            metadata.insert(key.into(), value);
        });
    }

    fn update(&self, f: impl FnOnce(&mut Map<String, Value>)) {
        if self.inner.status().is_final() {
            return;
        }

        f(&mut self.inner.metadata.write());
        self.inner.touch();
    }
}

/// Formats a byte count with two decimals and a decimal unit suffix
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

    if bytes < 1000 {
        return format!("{bytes}B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    format!("{value:.2}{}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(999), "999B");
        assert_eq!(format_bytes(1500), "1.50kB");
        assert_eq!(format_bytes(2_000_000), "2.00MB");
    }
}
