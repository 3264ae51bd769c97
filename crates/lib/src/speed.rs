//! Coalesce throughput tracking (used to predict leaf-coalesce downtime)
//! and rate-limited reporting of coalesce errors to the user.

use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::control::{ConfigMap, Session, MSG_PRIORITY_WARNING};
use crate::vdi::{LIVE_LEAF_MAX_SIZE, LIVE_LEAF_TIMEOUT, TIMEOUT_SAFETY_MARGIN};

/// Samples kept in the running average.
pub const N_RUNNING_AVERAGE: usize = 10;

/// Rate limit for user-visible coalesce errors: messages per second.
/// Zero disables throttling; negative disables reporting entirely.
pub const DEFAULT_COALESCE_ERR_RATE: f64 = 1.0 / 60.0;

const COALESCE_LAST_ERR_KEY: &str = "last-coalesce-error";
const COALESCE_ERR_RATE_KEY: &str = "coalesce-error-rate";

/// The per-SR throughput log: one float (bytes/second) per line, newest
/// last, rewritten atomically.
#[derive(Debug, Clone)]
pub struct SpeedLog {
    path: Utf8PathBuf,
}

impl SpeedLog {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Append one sample, keeping only the newest [`N_RUNNING_AVERAGE`].
    pub fn record(&self, bytes: u64, elapsed: Duration) -> Result<()> {
        if elapsed.is_zero() {
            return Ok(());
        }
        let speed = bytes as f64 / elapsed.as_secs_f64();
        let mut samples = self.samples()?;
        samples.push(speed);
        if samples.len() > N_RUNNING_AVERAGE {
            samples.drain(..samples.len() - N_RUNNING_AVERAGE);
        }
        let mut content = String::new();
        for s in &samples {
            content.push_str(&format!("{s}\n"));
        }
        vhdgc_utils::replace_file_contents(&self.path, content.as_bytes())
    }

    fn samples(&self) -> Result<Vec<f64>> {
        let Some(raw) = vhdgc_utils::read_optional_string(&self.path)? else {
            return Ok(Vec::new());
        };
        let mut r = Vec::new();
        for line in raw.lines() {
            match line.trim().parse::<f64>() {
                Ok(v) => r.push(v),
                Err(_) => {
                    tracing::warn!("ignoring bad entry in speed log {}: {line:?}", self.path);
                    return Ok(Vec::new());
                }
            }
        }
        Ok(r)
    }

    /// Average bytes/second, or `None` when unknown (which callers treat as
    /// "fall back to the fixed size threshold").
    pub fn average(&self) -> Result<Option<f64>> {
        let samples = self.samples()?;
        if samples.is_empty() {
            return Ok(None);
        }
        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        if avg <= 0.0 {
            tracing::warn!("non-positive average in speed log {}", self.path);
            return Ok(None);
        }
        Ok(Some(avg))
    }
}

/// Can a leaf with `allocated` bytes of data be coalesced within the
/// bounded pause? With a known throughput we predict the copy time against
/// the downtime budget (with a safety margin); otherwise we fall back to a
/// fixed size threshold. `forced` overrides the prediction.
pub fn can_live_coalesce(allocated: u64, speed: Option<f64>, forced: bool) -> bool {
    if forced {
        return true;
    }
    match speed {
        Some(speed) => {
            let allowed = TIMEOUT_SAFETY_MARGIN * LIVE_LEAF_TIMEOUT.as_secs_f64();
            (allocated as f64 / speed) < allowed
        }
        None => allocated < LIVE_LEAF_MAX_SIZE,
    }
}

/// Classify an error for the user-visible message.
fn errno_of(e: &anyhow::Error) -> Option<i32> {
    e.chain()
        .filter_map(|c| c.downcast_ref::<std::io::Error>())
        .find_map(|io| io.raw_os_error())
}

/// Post a user-visible coalesce error, throttled by the per-SR configured
/// rate (default one message per minute).
pub fn report_coalesce_error(session: &Session, sr_uuid: &str, e: &anyhow::Error) {
    let (name, body) = match errno_of(e) {
        Some(code) if code == rustix::io::Errno::NOSPC.raw_os_error() => {
            ("ENOSPC", "Run out of space while coalescing.")
        }
        Some(code) if code == rustix::io::Errno::IO.raw_os_error() => {
            ("EIO", "I/O error while coalescing.")
        }
        _ => ("ECOALESCE", ""),
    };
    tracing::warn!("coalesce failed on SR {sr_uuid}: {name} ({body})");

    let r = throttle_and_post(session, sr_uuid, name, body);
    if let Err(e) = r {
        tracing::warn!("failed to post coalesce error message: {e}");
    }
}

fn throttle_and_post(session: &Session, sr_uuid: &str, name: &str, body: &str) -> Result<()> {
    let sr = session.sr_record(sr_uuid)?;
    let rate = sr
        .other_config
        .get(COALESCE_ERR_RATE_KEY)
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(DEFAULT_COALESCE_ERR_RATE);
    if rate < 0.0 {
        return Ok(());
    }
    let mut post = rate == 0.0;
    if rate > 0.0 {
        let now = chrono::Utc::now().timestamp();
        let min_gap = (1.0 / rate) as i64;
        match sr
            .sm_config
            .get(COALESCE_LAST_ERR_KEY)
            .and_then(|v| v.parse::<i64>().ok())
        {
            Some(last) if now - last < min_gap => {}
            Some(_) => {
                session.sr_config_remove(sr_uuid, ConfigMap::Sm, COALESCE_LAST_ERR_KEY)?;
                post = true;
            }
            None => post = true,
        }
        if post {
            session.sr_config_set(
                sr_uuid,
                ConfigMap::Sm,
                COALESCE_LAST_ERR_KEY,
                &now.to_string(),
            )?;
        }
    }
    if post {
        session.message_create(name, MSG_PRIORITY_WARNING, "SR", sr_uuid, body)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> (tempfile::TempDir, SpeedLog) {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8PathBuf::try_from(td.path().join("sr.speed_log")).unwrap();
        (td, SpeedLog::new(p))
    }

    #[test]
    fn test_empty_log() {
        let (_td, log) = log();
        assert_eq!(log.average().unwrap(), None);
    }

    #[test]
    fn test_running_average_window() {
        let (_td, log) = log();
        // 100 B/s each
        log.record(1000, Duration::from_secs(10)).unwrap();
        log.record(100, Duration::from_secs(1)).unwrap();
        assert_eq!(log.average().unwrap(), Some(100.0));
        // push the window past its cap with faster samples
        for _ in 0..N_RUNNING_AVERAGE {
            log.record(2000, Duration::from_secs(1)).unwrap();
        }
        assert_eq!(log.average().unwrap(), Some(2000.0));
        let lines = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(lines.lines().count(), N_RUNNING_AVERAGE);
    }

    #[test]
    fn test_zero_elapsed_is_skipped() {
        let (_td, log) = log();
        log.record(1234, Duration::ZERO).unwrap();
        assert_eq!(log.average().unwrap(), None);
    }

    #[test]
    fn test_corrupt_log_disables_prediction() {
        let (_td, log) = log();
        vhdgc_utils::replace_file_contents(log.path(), b"not-a-number\n").unwrap();
        assert_eq!(log.average().unwrap(), None);
    }

    #[test]
    fn test_can_live_coalesce() {
        // unknown speed: the 20 MiB threshold decides
        assert!(can_live_coalesce(5 * 1024 * 1024, None, false));
        assert!(!can_live_coalesce(LIVE_LEAF_MAX_SIZE, None, false));
        // known speed: predicted copy time against half the 10s budget
        let speed = Some(10.0 * 1024.0 * 1024.0); // 10 MiB/s
        assert!(can_live_coalesce(40 * 1024 * 1024, speed, false));
        assert!(!can_live_coalesce(60 * 1024 * 1024, speed, false));
        // user force always wins
        assert!(can_live_coalesce(u64::MAX, None, true));
    }
}
