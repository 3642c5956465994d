use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

type SharedFile = Arc<Mutex<Option<File>>>;

/// Writes every record to stderr and, once a path is attached, appends it to
/// a log file as well.
pub struct RelayLogger {
    file: SharedFile,
    level: LevelFilter,
}

/// Handle kept by `main` to attach the log file after configuration loads.
#[derive(Clone)]
pub struct LogHandle {
    file: SharedFile,
}

impl LogHandle {
    pub fn attach_file(&self, log_path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let mut slot = self.file.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(file);
        Ok(())
    }
}

impl RelayLogger {
    pub fn new(level: LevelFilter) -> Self {
        Self {
            file: Arc::new(Mutex::new(None)),
            level,
        }
    }

    pub fn init(level: LevelFilter) -> Result<LogHandle, log::SetLoggerError> {
        let logger = Self::new(level);
        let handle = LogHandle {
            file: logger.file.clone(),
        };
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(level);
        Ok(handle)
    }

    fn format(record: &Record) -> String {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level_str = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        format!(
            "[{}] {} [{}:{}] {}\n",
            timestamp,
            level_str,
            record.module_path().unwrap_or("<unknown>"),
            record.line().unwrap_or(0),
            record.args()
        )
    }
}

impl Log for RelayLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = Self::format(record);
        let _ = std::io::stderr().write_all(message.as_bytes());
        if let Ok(mut slot) = self.file.lock()
            && let Some(file) = slot.as_mut()
        {
            let _ = file.write_all(message.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut slot) = self.file.lock()
            && let Some(file) = slot.as_mut()
        {
            let _ = file.flush();
        }
    }
}

/// Parses a level name such as `info` or `DEBUG`.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    name.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::RecordBuilder;

    #[test]
    fn writes_formatted_records_to_attached_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.log");
        let logger = RelayLogger::new(LevelFilter::Info);
        LogHandle {
            file: logger.file.clone(),
        }
        .attach_file(&path)
        .unwrap();

        logger.log(
            &RecordBuilder::new()
                .level(Level::Info)
                .module_path(Some("chatrelay::relay"))
                .line(Some(12))
                .args(format_args!("user 7 registered"))
                .build(),
        );
        logger.log(
            &RecordBuilder::new()
                .level(Level::Debug)
                .args(format_args!("hidden"))
                .build(),
        );
        logger.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("INFO  [chatrelay::relay:12] user 7 registered"));
        assert!(!content.contains("hidden"));
    }

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("WARN"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }
}
