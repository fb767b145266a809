//! Discovery and best-effort reads of the collector daemon's feed
//!
//! The daemon is a separate process that samples host CPU/memory on its
//! own cadence and drops one JSON snapshot per tick into a data
//! directory. This client shares no locks and no IPC with it:
//! coordination is purely filesystem last-writer-wins plus a staleness
//! window, so either side can start or stop in any order.
//!
//! Every read here is synchronous, bounded filesystem I/O — a handful of
//! `stat` and `read` calls, no retries, no polling. Callers that cannot
//! afford microseconds-to-low-milliseconds of blocking should not put
//! these calls on their critical path.

use crate::config::KronicalConfig;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

/// Snapshot files are named `metrics_<millis_since_epoch>.json`
fn snapshot_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^metrics_(\d+)\.json$").expect("static pattern"))
}

/// One host-load sample produced by the collector daemon
///
/// Read-only to this crate; a sample that fails validation is treated
/// the same as a corrupt file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    /// Seconds since epoch at sample time
    pub timestamp: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_available_mb: f64,
    pub memory_used_mb: f64,
}

impl SystemMetrics {
    /// Range check per the feed contract
    pub fn is_valid(&self) -> bool {
        let finite = self.timestamp.is_finite()
            && self.cpu_percent.is_finite()
            && self.memory_percent.is_finite()
            && self.memory_available_mb.is_finite()
            && self.memory_used_mb.is_finite();
        finite
            && (0.0..=100.0).contains(&self.cpu_percent)
            && (0.0..=100.0).contains(&self.memory_percent)
            && self.memory_available_mb >= 0.0
            && self.memory_used_mb >= 0.0
    }
}

#[derive(Debug, Clone)]
struct SnapshotFile {
    stamp_millis: u64,
    mtime: SystemTime,
    path: PathBuf,
}

/// Locates the active daemon feed and reads its snapshots
#[derive(Debug, Clone)]
pub struct DaemonClient {
    data_dirs: Vec<PathBuf>,
    staleness_window: Duration,
}

impl DaemonClient {
    /// Build the candidate list from configuration
    ///
    /// Precedence is fixed and deterministic: an explicit
    /// `daemon.data_dir` is the only candidate when set; otherwise the
    /// local data directory (when `local.enabled`), then the per-user
    /// data directory, then `/tmp/kode-kronical`.
    pub fn new(config: &KronicalConfig) -> Self {
        let data_dirs = match &config.daemon.data_dir {
            Some(dir) => vec![dir.clone()],
            None => {
                let mut dirs = Vec::new();
                if config.local.enabled {
                    dirs.push(config.local.data_dir.clone());
                }
                if let Some(user_dir) = user_data_dir() {
                    dirs.push(user_dir.join("kode-kronical"));
                }
                dirs.push(PathBuf::from("/tmp/kode-kronical"));
                dirs
            }
        };
        DaemonClient {
            data_dirs,
            staleness_window: staleness_window(config.daemon.staleness_window_secs),
        }
    }

    /// Single explicit candidate, default staleness window
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        DaemonClient {
            data_dirs: vec![dir.into()],
            staleness_window: staleness_window(
                KronicalConfig::default().daemon.staleness_window_secs,
            ),
        }
    }

    /// Explicit candidate list and window, in precedence order
    pub fn with_candidates(data_dirs: Vec<PathBuf>, staleness_window: Duration) -> Self {
        DaemonClient {
            data_dirs,
            staleness_window,
        }
    }

    /// Candidate directories in the order they are checked
    pub fn data_dirs(&self) -> &[PathBuf] {
        &self.data_dirs
    }

    /// First candidate with a fresh liveness marker, re-resolved on
    /// every call since the daemon may start or stop at any time
    ///
    /// `None` is the expected "daemon not running" state, not an error.
    pub fn active_data_dir(&self) -> Option<PathBuf> {
        self.data_dirs
            .iter()
            .find(|dir| self.is_active(dir))
            .cloned()
    }

    pub fn daemon_running(&self) -> bool {
        self.active_data_dir().is_some()
    }

    /// Freshest valid snapshot from the active directory, if any
    ///
    /// A corrupt or mid-write newest file yields `None` for this call
    /// only; subsequent calls see whatever the daemon writes next.
    pub fn get_latest_metrics(&self) -> Option<SystemMetrics> {
        let dir = self.active_data_dir()?;
        let newest = newest_snapshot(&dir)?;
        match parse_snapshot(&newest.path) {
            Ok(metrics) => Some(metrics),
            Err(err) => {
                tracing::debug!("unreadable snapshot {}: {err:#}", newest.path.display());
                None
            }
        }
    }

    /// Up to `limit` newest valid snapshots, ascending by timestamp
    ///
    /// Unparseable files in the window are skipped, not fatal. This is
    /// the one daemon query a summary computation performs.
    pub fn get_recent_metrics(&self, limit: usize) -> Vec<SystemMetrics> {
        let Some(dir) = self.active_data_dir() else {
            return Vec::new();
        };
        let mut files = list_snapshots(&dir).unwrap_or_default();
        files.sort_by_key(|f| (f.stamp_millis, f.mtime));
        let skip = files.len().saturating_sub(limit);
        let mut metrics: Vec<SystemMetrics> = files[skip..]
            .iter()
            .filter_map(|file| match parse_snapshot(&file.path) {
                Ok(m) => Some(m),
                Err(err) => {
                    tracing::debug!("skipping snapshot {}: {err:#}", file.path.display());
                    None
                }
            })
            .collect();
        metrics.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        metrics
    }

    fn is_active(&self, dir: &Path) -> bool {
        let Some(newest) = newest_snapshot(dir) else {
            return false;
        };
        match SystemTime::now().duration_since(newest.mtime) {
            Ok(age) => age <= self.staleness_window,
            // An mtime in the future means the file was just written
            Err(_) => true,
        }
    }
}

/// Unvalidated windows clamp to the documented default rather than
/// panicking; construction through `KronicalConfig` rejects them first
fn staleness_window(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .unwrap_or_else(|_| Duration::from_secs_f64(default_staleness_secs()))
}

fn default_staleness_secs() -> f64 {
    KronicalConfig::default().daemon.staleness_window_secs
}

/// `$XDG_DATA_HOME`, else `$HOME/.local/share`
fn user_data_dir() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg));
        }
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
}

fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotFile>> {
    let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(captures) = snapshot_pattern().captures(name) else {
            continue;
        };
        let Ok(stamp_millis) = captures[1].parse::<u64>() else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        files.push(SnapshotFile {
            stamp_millis,
            mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path: entry.path(),
        });
    }
    Ok(files)
}

fn newest_snapshot(dir: &Path) -> Option<SnapshotFile> {
    list_snapshots(dir)
        .ok()?
        .into_iter()
        .max_by_key(|f| (f.stamp_millis, f.mtime))
}

fn parse_snapshot(path: &Path) -> Result<SystemMetrics> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let metrics: SystemMetrics =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    if !metrics.is_valid() {
        bail!("snapshot values out of range in {}", path.display());
    }
    Ok(metrics)
}
