use crate::error::InspectorError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging configuration for the inspector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Emit JSON lines instead of human readable output
    pub json_format: bool,

    pub include_thread_names: bool,

    /// Whether to include file and line number information
    pub include_file_info: bool,

    /// Log span open/close events
    pub enable_span_events: bool,

    /// Colored output, ignored for JSON and file output
    pub enable_colors: bool,

    /// Also write logs to this file, rotated per `rotation`
    pub log_file: Option<String>,

    /// "minutely", "hourly", "daily" or "never"
    pub rotation: String,

    /// Module-specific log levels
    pub module_levels: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = HashMap::new();

        module_levels.insert("inspector".to_string(), "info".to_string());
        module_levels.insert("capture_core".to_string(), "info".to_string());
        module_levels.insert("sqlx".to_string(), "warn".to_string());
        module_levels.insert("hyper".to_string(), "warn".to_string());
        module_levels.insert("tokio".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            include_thread_names: true,
            include_file_info: false,
            enable_span_events: false,
            enable_colors: true,
            log_file: None,
            rotation: "daily".to_string(),
            module_levels,
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> Result<EnvFilter, InspectorError> {
        if !levels::is_valid_level(&self.level) {
            return Err(InspectorError::Logging(format!(
                "invalid log level '{}', expected one of {:?}",
                self.level,
                levels::valid_levels()
            )));
        }

        let mut filter = EnvFilter::new(self.level.to_lowercase());
        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level);
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| InspectorError::Logging(format!("Invalid log directive: {}", e)))?,
            );
        }
        Ok(filter)
    }

    fn span_events(&self) -> FmtSpan {
        if self.enable_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Initialize logging based on the provided configuration.
///
/// The returned guard flushes the file writer when dropped and must be held
/// for as long as the process logs. An already installed global subscriber
/// is left in place.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, InspectorError> {
    let filter = config.filter()?;

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(config.include_thread_names)
            .with_file(config.include_file_info)
            .with_line_number(config.include_file_info)
            .with_span_events(config.span_events())
    });
    let plain_layer = (!config.json_format).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_names(config.include_thread_names)
            .with_file(config.include_file_info)
            .with_line_number(config.include_file_info)
            .with_ansi(config.enable_colors)
            .with_span_events(config.span_events())
    });

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let appender = create_file_appender(path, &config.rotation)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .with(file_layer)
        .try_init();

    match result {
        Ok(_) => {
            tracing::info!("Logging initialized with config level: {}", config.level);
        }
        Err(_) => {
            tracing::debug!("Logging already initialized, skipping");
        }
    }

    Ok(guard)
}

fn parse_rotation(rotation: &str) -> Result<Rotation, InspectorError> {
    match rotation.to_lowercase().as_str() {
        "minutely" => Ok(Rotation::MINUTELY),
        "hourly" => Ok(Rotation::HOURLY),
        "daily" => Ok(Rotation::DAILY),
        "never" => Ok(Rotation::NEVER),
        other => Err(InspectorError::Logging(format!("unknown log rotation '{}'", other))),
    }
}

/// Create a rolling file appender for `log_file`
fn create_file_appender(log_file: &str, rotation: &str) -> Result<RollingFileAppender, InspectorError> {
    let log_path = Path::new(log_file);
    let directory = match log_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let filename = log_path
        .file_name()
        .ok_or_else(|| InspectorError::Logging("Invalid log file name".to_string()))?
        .to_string_lossy();

    std::fs::create_dir_all(directory)
        .map_err(|e| InspectorError::Logging(format!("Failed to create log directory: {}", e)))?;

    Ok(RollingFileAppender::new(
        parse_rotation(rotation)?,
        directory,
        filename.as_ref(),
    ))
}

/// Log level utilities
pub mod levels {
    /// Check if a log level string is valid
    pub fn is_valid_level(level: &str) -> bool {
        matches!(level.to_lowercase().as_str(), "trace" | "debug" | "info" | "warn" | "error")
    }

    /// Get all valid log levels
    pub fn valid_levels() -> Vec<&'static str> {
        vec!["trace", "debug", "info", "warn", "error"]
    }

    /// Convert log level to numeric value for comparison
    pub fn level_to_numeric(level: &str) -> Option<u8> {
        match level.to_lowercase().as_str() {
            "trace" => Some(0),
            "debug" => Some(1),
            "info" => Some(2),
            "warn" => Some(3),
            "error" => Some(4),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json_format);
        assert!(config.include_thread_names);
        assert!(!config.include_file_info);
        assert!(!config.enable_span_events);
        assert!(config.enable_colors);
        assert!(config.log_file.is_none());
        assert_eq!(config.rotation, "daily");
        assert_eq!(config.module_levels.get("sqlx").map(String::as_str), Some("warn"));
    }

    #[test]
    fn test_invalid_level_rejected() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.filter(), Err(InspectorError::Logging(_))));
    }

    #[test]
    fn test_rotation_parsing() {
        assert!(parse_rotation("Hourly").is_ok());
        assert!(parse_rotation("never").is_ok());
        assert!(parse_rotation("weekly").is_err());
    }

    #[test]
    fn test_log_level_validation() {
        assert!(levels::is_valid_level("info"));
        assert!(levels::is_valid_level("DEBUG"));
        assert!(levels::is_valid_level("Error"));
        assert!(!levels::is_valid_level("invalid"));
        assert!(!levels::is_valid_level(""));
    }

    #[test]
    fn test_log_level_numeric_conversion() {
        assert_eq!(levels::level_to_numeric("trace"), Some(0));
        assert_eq!(levels::level_to_numeric("warn"), Some(3));
        assert_eq!(levels::level_to_numeric("invalid"), None);
    }
}
