use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use crate::error::ProxyError;
use chrono::Utc;
use log::Record;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// Logger backing the optional `logging` config section. Each target carries
/// its own writer and may override the global level.
pub struct RelayLogger {
    targets: Vec<LogTarget>,
    format: LogFormat,
    level: log::LevelFilter,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl RelayLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, ProxyError> {
        let format = config.format.unwrap_or_default();
        let level = config.level.unwrap_or_default().to_filter();
        let targets = config.targets.unwrap_or_else(|| {
            LoggingConfig::default().targets.unwrap_or_default()
        });

        let mut writers = Vec::new();
        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or_else(|| {
                        ProxyError::Config("File log target requires a path".to_string())
                    })?;
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Box::new(file)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            targets,
            format,
            level,
            writers,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), ProxyError> {
        let logger = Self::new(config)?;
        let max_level = logger.max_level();
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| ProxyError::Config(format!("Failed to install logger: {}", e)))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn max_level(&self) -> log::LevelFilter {
        self.targets
            .iter()
            .map(|t| t.level.as_ref().map(LogLevel::to_filter).unwrap_or(self.level))
            .max()
            .unwrap_or(self.level)
    }

    fn target_accepts(&self, target: &LogTarget, record: &Record) -> bool {
        let filter = target
            .level
            .as_ref()
            .map(LogLevel::to_filter)
            .unwrap_or(self.level);
        record.level() <= filter
    }

    fn format_line(&self, record: &Record) -> String {
        let now = Utc::now();
        match self.format {
            LogFormat::Text => format!(
                "{} [{}] [{}] {}",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level().to_string().to_uppercase(),
                record.target(),
                record.args()
            ),
            LogFormat::Json => json!({
                "timestamp": now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            })
            .to_string(),
        }
    }
}

impl log::Log for RelayLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = self.format_line(record);
        for (target, writer) in self.targets.iter().zip(self.writers.iter()) {
            if !self.target_accepts(target, record) {
                continue;
            }
            if let Ok(mut writer) = writer.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut writer) = writer.lock() {
                let _ = writer.flush();
            }
        }
    }
}
