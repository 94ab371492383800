//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// External tool settings for the converter strategies.
#[derive(Debug, Clone)]
pub struct ConverterSettings {
    /// `pdf2docx` CLI used for pdf-to-word.
    pub pdf2docx_bin: String,
    /// `pandoc` used for markdown-to-word.
    pub pandoc_bin: String,
    /// LibreOffice binary used for word-to-pdf.
    pub soffice_bin: String,
    /// Poppler `pdftotext` used for pdf-to-markdown.
    pub pdftotext_bin: String,
    /// Upper bound on a single external tool run.
    pub tool_timeout: Duration,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            pdf2docx_bin: "pdf2docx".to_string(),
            pandoc_bin: "pandoc".to_string(),
            soffice_bin: "soffice".to_string(),
            pdftotext_bin: "pdftotext".to_string(),
            tool_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl ConverterSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            pdf2docx_bin: lookup("DOCCONV_PDF2DOCX_BIN").unwrap_or(defaults.pdf2docx_bin),
            pandoc_bin: lookup("DOCCONV_PANDOC_BIN").unwrap_or(defaults.pandoc_bin),
            soffice_bin: lookup("DOCCONV_SOFFICE_BIN").unwrap_or(defaults.soffice_bin),
            pdftotext_bin: lookup("DOCCONV_PDFTOTEXT_BIN").unwrap_or(defaults.pdftotext_bin),
            tool_timeout: scaled(lookup, "DOCCONV_TOOL_TIMEOUT_SECS", 1, false)
                .map(Duration::from_secs)
                .unwrap_or(defaults.tool_timeout),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Root under which every task workspace is created.
    pub temp_dir: PathBuf,
    /// Directory for the rolling service log.
    pub logs_dir: PathBuf,
    /// Maximum accepted upload size in bytes.
    pub max_upload_bytes: usize,
    /// How long a completed task stays downloadable after a download.
    pub download_grace: Duration,
    /// How long a failed task stays pollable before it is reclaimed.
    pub failed_task_ttl: Duration,
    /// Leave failed workspaces on disk for inspection.
    pub keep_failed_workspaces: bool,
    /// Workspaces and log files older than this are swept.
    pub stale_max_age: Duration,
    /// Interval between stale sweeps.
    pub sweep_interval: Duration,
    pub converters: ConverterSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            temp_dir: PathBuf::from("temp"),
            logs_dir: PathBuf::from("logs"),
            max_upload_bytes: 100 * 1024 * 1024, // 100MB
            download_grace: Duration::from_secs(5),
            failed_task_ttl: Duration::from_secs(600), // 10 minutes
            keep_failed_workspaces: false,
            stale_max_age: Duration::from_secs(24 * 3600), // 24 hours
            sweep_interval: Duration::from_secs(3600),      // 1 hour
            converters: ConverterSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Build the configuration from `DOCCONV_*` environment variables.
    ///
    /// Unset, unparseable or out-of-range values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let bind_addr = lookup("DOCCONV_BIND")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.bind_addr);

        let keep_failed_workspaces = lookup("DOCCONV_KEEP_FAILED")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.keep_failed_workspaces);

        let secs = |key: &str, allow_zero: bool, default: Duration| {
            scaled(lookup, key, 1, allow_zero)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            bind_addr,
            temp_dir: lookup("DOCCONV_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            logs_dir: lookup("DOCCONV_LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.logs_dir),
            max_upload_bytes: scaled(lookup, "DOCCONV_MAX_UPLOAD_MB", 1024 * 1024, false)
                .and_then(|bytes| usize::try_from(bytes).ok())
                .unwrap_or(defaults.max_upload_bytes),
            download_grace: secs("DOCCONV_DOWNLOAD_GRACE_SECS", true, defaults.download_grace),
            failed_task_ttl: secs("DOCCONV_FAILED_TTL_SECS", true, defaults.failed_task_ttl),
            keep_failed_workspaces,
            stale_max_age: scaled(lookup, "DOCCONV_STALE_MAX_AGE_HOURS", 3600, false)
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_max_age),
            sweep_interval: secs("DOCCONV_SWEEP_INTERVAL_SECS", false, defaults.sweep_interval),
            converters: ConverterSettings::from_lookup(lookup),
        }
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Parse `key` as an integer and multiply by `unit`.
///
/// `None` when unset. Unparseable, zero (unless allowed) and overflowing
/// values are logged and also yield `None`, so the default applies.
fn scaled(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    unit: u64,
    allow_zero: bool,
) -> Option<u64> {
    let raw = lookup(key)?;
    let value = match raw.trim().parse::<u64>() {
        Ok(0) if !allow_zero => {
            warn!(key, "Zero is not allowed here, using the default");
            return None;
        }
        Ok(value) => value,
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Unparseable value, using the default");
            return None;
        }
    };
    let scaled = value.checked_mul(unit);
    if scaled.is_none() {
        warn!(key, value, "Value out of range, using the default");
    }
    scaled
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.max_upload_bytes, 100 * 1024 * 1024);
        assert_eq!(config.download_grace, Duration::from_secs(5));
        assert_eq!(config.bind_addr.port(), 8000);
        assert!(!config.keep_failed_workspaces);
    }

    fn from_pairs(pairs: &[(&str, &str)]) -> ServiceConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(&|key: &str| vars.get(key).cloned())
    }

    #[test]
    fn values_are_read_and_scaled() {
        let config = from_pairs(&[
            ("DOCCONV_MAX_UPLOAD_MB", "2"),
            ("DOCCONV_STALE_MAX_AGE_HOURS", "3"),
            ("DOCCONV_SWEEP_INTERVAL_SECS", "30"),
            ("DOCCONV_DOWNLOAD_GRACE_SECS", "0"),
            ("DOCCONV_KEEP_FAILED", "yes"),
            ("DOCCONV_PANDOC_BIN", "/opt/pandoc"),
        ]);
        assert_eq!(config.max_upload_bytes, 2 * 1024 * 1024);
        assert_eq!(config.stale_max_age, Duration::from_secs(3 * 3600));
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.download_grace, Duration::ZERO);
        assert!(config.keep_failed_workspaces);
        assert_eq!(config.converters.pandoc_bin, "/opt/pandoc");
    }

    #[test]
    fn zero_intervals_fall_back_to_defaults() {
        let defaults = ServiceConfig::default();
        let config = from_pairs(&[
            ("DOCCONV_SWEEP_INTERVAL_SECS", "0"),
            ("DOCCONV_TOOL_TIMEOUT_SECS", "0"),
            ("DOCCONV_MAX_UPLOAD_MB", "0"),
        ]);
        assert_eq!(config.sweep_interval, defaults.sweep_interval);
        assert_eq!(config.converters.tool_timeout, defaults.converters.tool_timeout);
        assert_eq!(config.max_upload_bytes, defaults.max_upload_bytes);
    }

    #[test]
    fn overflowing_and_garbage_values_fall_back_to_defaults() {
        let defaults = ServiceConfig::default();
        let huge = u64::MAX.to_string();
        let config = from_pairs(&[
            ("DOCCONV_MAX_UPLOAD_MB", huge.as_str()),
            ("DOCCONV_STALE_MAX_AGE_HOURS", huge.as_str()),
            ("DOCCONV_FAILED_TTL_SECS", "ten"),
            ("DOCCONV_BIND", "not an address"),
        ]);
        assert_eq!(config.max_upload_bytes, defaults.max_upload_bytes);
        assert_eq!(config.stale_max_age, defaults.stale_max_age);
        assert_eq!(config.failed_task_ttl, defaults.failed_task_ttl);
        assert_eq!(config.bind_addr, defaults.bind_addr);
    }
}
