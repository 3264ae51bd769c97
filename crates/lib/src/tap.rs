//! Pause/unpause/refresh of attached tap-disks via `tap-ctl`. A VDI with no
//! tap-disk (not attached anywhere locally) pauses trivially.

use std::collections::HashMap;
use std::process::Command;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use regex::Regex;

use vhdgc_utils::CommandRunExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tapdisk {
    pub pid: u32,
    pub minor: u32,
}

/// Parse key-value pairs from one `tap-ctl list` output line.
fn split_list_line(line: &str) -> HashMap<String, String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r#"([a-z]+)=([^ ]+)"#).unwrap());
    let mut fields = HashMap::new();
    for cap in regex.captures_iter(line) {
        fields.insert(cap[1].to_string(), cap[2].to_string());
    }
    fields
}

pub fn parse_list_output(output: &str, backing_path: &Utf8Path) -> Option<Tapdisk> {
    for line in output.lines() {
        let fields = split_list_line(line);
        let Some(args) = fields.get("args") else {
            continue;
        };
        // args looks like "vhd:/run/sr-mount/<sr>/<uuid>.vhd"
        if args.split_once(':').map(|(_, p)| p) != Some(backing_path.as_str()) {
            continue;
        }
        let pid = fields.get("pid").and_then(|v| v.parse().ok())?;
        let minor = fields.get("minor").and_then(|v| v.parse().ok())?;
        return Some(Tapdisk { pid, minor });
    }
    None
}

/// The tap-disk currently serving `backing_path`, if any.
#[context("Finding tapdisk for {backing_path}")]
pub fn find_by_path(backing_path: &Utf8Path) -> Result<Option<Tapdisk>> {
    let out = Command::new("tap-ctl").arg("list").run_get_string()?;
    Ok(parse_list_output(&out, backing_path))
}

#[context("Pausing tapdisk for {backing_path}")]
pub fn pause(backing_path: &Utf8Path) -> Result<()> {
    let Some(tap) = find_by_path(backing_path)? else {
        tracing::debug!("no tapdisk on {backing_path}, nothing to pause");
        return Ok(());
    };
    Command::new("tap-ctl")
        .args(["pause", "-p", &tap.pid.to_string(), "-m", &tap.minor.to_string()])
        .log_debug()
        .run()
        .context("tap-ctl pause")
}

#[context("Unpausing tapdisk for {backing_path}")]
pub fn unpause(backing_path: &Utf8Path, new_path: Option<&Utf8Path>) -> Result<()> {
    let Some(tap) = find_by_path(backing_path)? else {
        tracing::debug!("no tapdisk on {backing_path}, nothing to unpause");
        return Ok(());
    };
    let mut cmd = Command::new("tap-ctl");
    cmd.args(["unpause", "-p", &tap.pid.to_string(), "-m", &tap.minor.to_string()]);
    if let Some(p) = new_path {
        cmd.args(["-a", &format!("vhd:{p}")]);
    }
    cmd.log_debug().run().context("tap-ctl unpause")
}

/// Shut a tap-disk down entirely (cache sweeper only).
#[context("Shutting down tapdisk for {backing_path}")]
pub fn shutdown(backing_path: &Utf8Path) -> Result<()> {
    let Some(tap) = find_by_path(backing_path)? else {
        return Ok(());
    };
    Command::new("tap-ctl")
        .args(["destroy", "-p", &tap.pid.to_string(), "-m", &tap.minor.to_string()])
        .log_debug()
        .run()
        .context("tap-ctl destroy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let fixture = indoc::indoc! { "
            pid=2341 minor=0 state=0 args=vhd:/run/sr-mount/sr1/aaaa.vhd
            pid=2342 minor=1 state=0 args=vhd:/run/sr-mount/sr1/bbbb.vhd
            pid=- minor=2 state=- args=-
        " };
        let t = parse_list_output(fixture, Utf8Path::new("/run/sr-mount/sr1/bbbb.vhd")).unwrap();
        assert_eq!(t, Tapdisk { pid: 2342, minor: 1 });
        assert!(parse_list_output(fixture, Utf8Path::new("/run/sr-mount/sr1/cccc.vhd")).is_none());
    }
}
