use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// Logger writing to several stdout/file targets, each with its own level.
pub struct CustomLogger {
    targets: Vec<LogTarget>,
    format: LogFormat,
    default_level: LogLevel,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig, default_level: LogLevel) -> Result<Self, Box<dyn std::error::Error>> {
        let format = config.format.unwrap_or_default();
        let default_level = config.level.unwrap_or(default_level);
        let targets = config.targets.unwrap_or_default();

        let mut writers = Vec::new();
        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or("File output type requires path")?;
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Box::new(file)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            targets,
            format,
            default_level,
            writers,
        })
    }

    fn target_filter(&self, target: &LogTarget) -> LevelFilter {
        target.level.unwrap_or(self.default_level).to_filter()
    }

    /// Most verbose level any target wants.
    fn max_filter(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|t| self.target_filter(t))
            .max()
            .unwrap_or(LevelFilter::Off)
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        json_line(record)
    }
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.targets
            .iter()
            .any(|target| metadata.level() <= self.target_filter(target))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for (target, writer) in self.targets.iter().zip(&self.writers) {
            if record.level() <= self.target_filter(target) {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

fn json_line(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "message": record.args().to_string(),
    });
    entry.to_string()
}

/// Installs the process logger.
///
/// A `logging` section with targets selects [`CustomLogger`]; otherwise
/// `env_logger` writes to stderr, honoring `RUST_LOG` over `level`.
pub fn init(
    level: LogLevel,
    format: LogFormat,
    config: Option<LoggingConfig>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(config) = config.filter(|c| c.targets.as_ref().is_some_and(|t| !t.is_empty())) {
        let logger = CustomLogger::new(config, level)?;
        let max = logger.max_filter();
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max);
        return Ok(());
    }

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()));
    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
    }
    builder.try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;
    use std::path::PathBuf;

    fn file_target(path: PathBuf, level: Option<LogLevel>) -> LogTarget {
        LogTarget {
            output_type: LogOutputType::File,
            path: Some(path),
            level,
        }
    }

    #[test]
    fn test_per_target_levels() {
        let dir = tempfile::tempdir().unwrap();
        let verbose = dir.path().join("debug.log");
        let quiet = dir.path().join("warn.log");

        let logger = CustomLogger::new(
            LoggingConfig {
                level: None,
                format: Some(LogFormat::Json),
                targets: Some(vec![
                    file_target(verbose.clone(), Some(LogLevel::Debug)),
                    file_target(quiet.clone(), Some(LogLevel::Warn)),
                ]),
            },
            LogLevel::Info,
        )
        .unwrap();
        assert_eq!(logger.max_filter(), LevelFilter::Debug);

        logger.log(
            &Record::builder()
                .args(format_args!("dialing upstream"))
                .level(log::Level::Debug)
                .target("reserver::resolver")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("tunnel refused"))
                .level(log::Level::Warn)
                .target("reserver::resolver")
                .build(),
        );
        logger.flush();

        let verbose = std::fs::read_to_string(verbose).unwrap();
        let quiet = std::fs::read_to_string(quiet).unwrap();
        assert_eq!(verbose.lines().count(), 2);
        assert_eq!(quiet.lines().count(), 1);

        let entry: serde_json::Value = serde_json::from_str(quiet.trim()).unwrap();
        assert_eq!(entry["level"], "warn");
        assert_eq!(entry["message"], "tunnel refused");
    }

    #[test]
    fn test_file_target_requires_path() {
        let result = CustomLogger::new(
            LoggingConfig {
                level: None,
                format: None,
                targets: Some(vec![LogTarget {
                    output_type: LogOutputType::File,
                    path: None,
                    level: None,
                }]),
            },
            LogLevel::Info,
        );
        assert!(result.is_err());
    }
}
