//! Console and file logging.
//!
//! Every record is printed to stdout and appended to `<log_dir>/joinsim.log`
//! as `[HH:MM:SS.mmm] [LEVEL] message`.

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const LOG_FILE_NAME: &str = "joinsim.log";

static LOGGER: OnceLock<FileLogger> = OnceLock::new();

struct FileLogger {
    level: LevelFilter,
    file: Mutex<Option<File>>,
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record.level(), &record.args().to_string());
        print!("{}", line);
        if let Some(file) = self.file.lock().as_mut() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
        if let Some(file) = self.file.lock().as_mut() {
            let _ = file.flush();
        }
    }
}

fn format_line(level: Level, msg: &str) -> String {
    let timestamp = Local::now().format("%H:%M:%S%.3f");
    format!("[{}] [{}] {}\n", timestamp, level, msg)
}

fn open_append(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

/// Path of the log file inside `log_dir`.
pub fn log_file(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE_NAME)
}

/// Installs the process logger. Later calls do nothing.
///
/// If the log file cannot be opened, logging continues on the console only.
pub fn init(log_dir: &Path, level: LevelFilter) {
    let mut installed = false;
    let logger = LOGGER.get_or_init(|| {
        installed = true;
        let path = log_file(log_dir);
        let file = open_append(&path);
        if file.is_none() {
            eprintln!("Could not open {}, logging to console only", path.display());
        }
        FileLogger {
            level,
            file: Mutex::new(file),
        }
    });
    if installed && log::set_logger(logger).is_ok() {
        log::set_max_level(logger.level);
    }
}

/// Writes panics to stderr and the log file before the default unwinding.
pub fn install_panic_hook(log_dir: &Path) {
    let path = log_file(log_dir);
    std::panic::set_hook(Box::new(move |panic_info| {
        let msg = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        let location = match panic_info.location() {
            Some(loc) => format!(" at {}:{}:{}", loc.file(), loc.line(), loc.column()),
            None => String::new(),
        };
        let line = format!("[PANIC]{} {}\n", location, msg);
        eprint!("{}", line);
        if let Some(mut file) = open_append(&path) {
            let _ = file.write_all(line.as_bytes());
        }
    }));
}
