//! Per-deployment JSON logging. The process logs through the `log` facade
//! as usual; while a deployment is active, every record is duplicated into
//! `deployments.0000.<id>.log` under the data store dir as one JSON object
//! per line. Old deployment logs are pruned and renumbered so at most a
//! handful remain and a minimum of free space is kept.

use crate::error::{self, Error, Result};
use chrono::{SecondsFormat, Utc};
use log::{warn, Level, LevelFilter, Log, Metadata, Record};
use regex::Regex;
use simplelog::{ColorChoice, Config, SharedLogger, TermLogger, TerminalMode};
use snafu::ResultExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// How many finished deployment logs may remain on disk.
const MAX_EXISTING_LOGS: usize = 5;

/// Free space to keep available in the log directory.
const LOGS_FREE_SPACE_REQUIRED: u64 = 100 * 1024; // 100 KiB

static SINK: Mutex<Option<File>> = Mutex::new(None);

/// Initializes process logging: a plain stderr logger plus the deployment
/// file sink, which stays dormant until [`DeploymentLog::begin`].
pub fn init(level: LevelFilter) -> Result<()> {
    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(
            level,
            Config::default(),
            TerminalMode::Stderr,
            ColorChoice::Never,
        ),
        DeploymentLogSink::boxed(level),
    ];
    simplelog::CombinedLogger::init(loggers).context(error::LoggerSnafu)
}

/// The `SharedLogger` half that formats records as JSON into the active
/// deployment's file.
struct DeploymentLogSink {
    level: LevelFilter,
    config: Config,
}

impl DeploymentLogSink {
    fn boxed(level: LevelFilter) -> Box<Self> {
        Box::new(Self {
            level,
            config: Config::default(),
        })
    }
}

impl Log for DeploymentLogSink {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = match SINK.lock() {
            Ok(sink) => sink,
            Err(_) => return,
        };
        if let Some(file) = sink.as_mut() {
            let line = format_record(record.level(), &record.args().to_string());
            // A failed write must not take the agent down mid-deployment.
            let _ = writeln!(file, "{}", line);
            let _ = file.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = SINK.lock() {
            if let Some(file) = sink.as_mut() {
                let _ = file.flush();
            }
        }
    }
}

impl SharedLogger for DeploymentLogSink {
    fn level(&self) -> LevelFilter {
        self.level
    }

    fn config(&self) -> Option<&Config> {
        Some(&self.config)
    }

    fn as_log(self: Box<Self>) -> Box<dyn Log> {
        self
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warning",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}

fn format_record(level: Level, message: &str) -> String {
    serde_json::json!({
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        "level": level_name(level),
        "message": message,
    })
    .to_string()
}

/// An active deployment's log file. Dropping it (or calling
/// [`DeploymentLog::finish`]) detaches the sink.
pub struct DeploymentLog {
    path: PathBuf,
}

impl DeploymentLog {
    /// Prunes and renumbers old logs, then opens (or reopens) this
    /// deployment's file in append mode and attaches the global sink.
    pub fn begin(data_store_dir: &Path, deployment_id: &str) -> Result<Self> {
        fs::create_dir_all(data_store_dir).context(error::IoSnafu {
            path: data_store_dir,
        })?;
        prepare_log_directory(data_store_dir, deployment_id)?;

        let path = data_store_dir.join(format!("deployments.0000.{}.log", deployment_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(error::DeploymentLogFileSnafu { path: &path })?;

        if let Ok(mut sink) = SINK.lock() {
            *sink = Some(file);
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(self) {
        // Drop detaches the sink.
    }
}

impl Drop for DeploymentLog {
    fn drop(&mut self) {
        if let Ok(mut sink) = SINK.lock() {
            if let Some(file) = sink.as_mut() {
                let _ = file.flush();
            }
            *sink = None;
        }
    }
}

fn free_space(dir: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(dir).context(error::LogFreeSpaceSnafu)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Deletes the oldest logs until at most `MAX_EXISTING_LOGS - 1` remain
/// and free space is adequate, then renames the survivors to contiguous
/// indices starting at 0001 (the current deployment takes 0000).
fn prepare_log_directory(dir: &Path, deployment_id: &str) -> Result<()> {
    let pattern = Regex::new(r"^deployments\.(\d{4})\.(.+)\.log$").expect("static regex");
    let current_name = format!("deployments.0000.{}.log", deployment_id);

    let mut old_logs = Vec::new();
    for entry in fs::read_dir(dir).context(error::IoSnafu { path: dir })? {
        let entry = entry.context(error::IoSnafu { path: dir })?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy().to_string();
        if name == current_name {
            // This deployment's own file gets reused, leave it alone.
            continue;
        }
        match pattern.captures(&name) {
            Some(captures) => {
                let id = captures.get(2).expect("group 2").as_str().to_string();
                old_logs.push((name.clone(), id));
            }
            None if name.starts_with("deployments.") && name.ends_with(".log") => {
                warn!("Old deployment log with a malformed file name found: {}", name);
            }
            None => {}
        }
    }
    old_logs.sort();

    let mut available = free_space(dir)?;
    while !old_logs.is_empty()
        && (available < LOGS_FREE_SPACE_REQUIRED || old_logs.len() > MAX_EXISTING_LOGS - 1)
    {
        let (last, _) = old_logs.pop().expect("checked non-empty");
        let path = dir.join(&last);
        fs::remove_file(&path).context(error::DeploymentLogFileSnafu { path: &path })?;
        if available < LOGS_FREE_SPACE_REQUIRED {
            available = free_space(dir)?;
        }
    }

    // Renumber survivors so indices are contiguous from 0001, oldest last.
    for (i, (name, id)) in old_logs.iter().enumerate().rev() {
        let new_name = format!("deployments.{:04}.{}.log", i + 1, id);
        if *name == new_name {
            continue;
        }
        let from = dir.join(name);
        let to = dir.join(&new_name);
        fs::rename(&from, &to).context(error::DeploymentLogFileSnafu { path: &from })?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"{}\n").unwrap();
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn record_format_is_one_json_object() {
        let line = format_record(Level::Warn, "something \"quoted\" happened");
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["level"], "warning");
        assert_eq!(parsed["message"], "something \"quoted\" happened");
        // RFC 3339 timestamp.
        assert!(parsed["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn begin_creates_the_log_file() {
        let dir = TempDir::new().unwrap();
        let log = DeploymentLog::begin(dir.path(), "abc-123").unwrap();
        assert!(log.path().ends_with("deployments.0000.abc-123.log"));
        assert!(log.path().exists());
        log.finish();
    }

    #[test]
    fn old_logs_are_renumbered_from_0001() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "deployments.0000.old-one.log");
        touch(dir.path(), "deployments.0001.older.log");

        let log = DeploymentLog::begin(dir.path(), "fresh").unwrap();
        let all = names(dir.path());
        assert!(all.contains(&"deployments.0000.fresh.log".to_string()));
        assert!(all.contains(&"deployments.0001.old-one.log".to_string()));
        assert!(all.contains(&"deployments.0002.older.log".to_string()));
        log.finish();
    }

    #[test]
    fn excess_logs_are_deleted_oldest_first() {
        let dir = TempDir::new().unwrap();
        for i in 0..6 {
            touch(dir.path(), &format!("deployments.{:04}.id-{}.log", i, i));
        }

        let log = DeploymentLog::begin(dir.path(), "fresh").unwrap();
        let all: Vec<String> = names(dir.path())
            .into_iter()
            .filter(|n| n.starts_with("deployments."))
            .collect();
        // Current plus at most four historical ones.
        assert_eq!(all.len(), MAX_EXISTING_LOGS);
        assert!(all.contains(&"deployments.0000.fresh.log".to_string()));
        // The highest-numbered (oldest) ones went first.
        assert!(all.contains(&"deployments.0001.id-0.log".to_string()));
        assert!(!all.iter().any(|n| n.contains("id-5") || n.contains("id-4")));
        log.finish();
    }

    #[test]
    fn current_deployments_file_is_reused() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("deployments.0000.mine.log"),
            b"existing line\n",
        )
        .unwrap();
        let log = DeploymentLog::begin(dir.path(), "mine").unwrap();
        // Still there, not rotated away.
        let content = fs::read_to_string(log.path()).unwrap();
        assert!(content.starts_with("existing line"));
        log.finish();
    }

    #[test]
    fn malformed_names_are_left_alone() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "deployments.12.short.log");
        touch(dir.path(), "unrelated.txt");

        let log = DeploymentLog::begin(dir.path(), "fresh").unwrap();
        let all = names(dir.path());
        assert!(all.contains(&"deployments.12.short.log".to_string()));
        assert!(all.contains(&"unrelated.txt".to_string()));
        log.finish();
    }
}
