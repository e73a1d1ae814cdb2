//! Run logger: human-readable lines to stderr and an optional log file,
//! plus a structured JSON-lines sidecar for machine consumption.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use log::{Level, LevelFilter, Metadata, Record};

use crate::tools::{clock_str, now_ms};

struct RunLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
    json: Option<Mutex<File>>,
}

impl log::Log for RunLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level || self.json.is_some()
    }

    fn log(&self, record: &Record) {
        let timestamp_ms = now_ms();
        let line = format!(
            "{} {:>5} {}",
            clock_str(timestamp_ms),
            record.level(),
            record.args()
        );

        if record.level() <= self.level {
            eprintln!("{line}");
            if let Some(file) = &self.file
                && let Ok(mut file) = file.lock()
            {
                let _ = writeln!(file, "{line}");
            }
        }

        // The JSON log keeps everything down to debug so failures can be
        // reconstructed even when stderr was quiet.
        if let Some(json) = &self.json
            && record.level() <= Level::Debug
            && let Ok(mut json) = json.lock()
        {
            let entry = serde_json::json!({
                "timestamp_ms": timestamp_ms,
                "level": record.level().to_string(),
                "message": record.args().to_string(),
            });
            let _ = writeln!(json, "{entry}");
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            let _ = file.flush();
        }
        if let Some(json) = &self.json
            && let Ok(mut json) = json.lock()
        {
            let _ = json.flush();
        }
    }
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Installs the process-wide logger. `quiet` limits stderr to errors,
/// `verbose` enables debug lines; the JSON sidecar always records debug.
pub fn init(
    quiet: bool,
    verbose: bool,
    log_path: Option<&Path>,
    json_path: Option<&Path>,
) -> anyhow::Result<()> {
    let level = if quiet {
        LevelFilter::Error
    } else if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let file = match log_path {
        Some(path) => Some(Mutex::new(open_log_file(path)?)),
        None => None,
    };
    let json = match json_path {
        Some(path) => Some(Mutex::new(open_log_file(path)?)),
        None => None,
    };

    let logger = RunLogger { level, file, json };
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(LevelFilter::Debug);
    Ok(())
}
