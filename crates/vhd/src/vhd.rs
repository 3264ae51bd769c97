use std::collections::HashMap;
use std::process::Command;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use regex::Regex;

use vhdgc_utils::CommandRunExt;

/// The VHD allocation unit.
pub const VHD_BLOCK_SIZE: u64 = 2 * 1024 * 1024;
/// One disk sector; `vhd-util coalesce` reports its result in these.
pub const VHD_SECTOR_SIZE: u64 = 512;
/// Size of the journal file used for journaled (crash-safe) resizes.
pub const VHD_JOURNAL_SIZE: u64 = 16 * 1024 * 1024;

pub const FILE_EXTN_VHD: &str = ".vhd";
pub const FILE_EXTN_RAW: &str = ".raw";

const VHD_UTIL: &str = "vhd-util";
const MIB: u64 = 1024 * 1024;

/// Metadata of one VHD image as reported by `vhd-util`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VhdInfo {
    pub path: String,
    /// Guest-visible size in bytes.
    pub size_virt: u64,
    /// Physical utilization of the file/LV in bytes.
    pub size_phys: u64,
    /// Bytes covered by allocated blocks.
    pub size_allocated: u64,
    pub hidden: bool,
    /// UUID of the parent image, if any.
    pub parent_uuid: Option<String>,
    /// The batch scanner failed to read this image's metadata.
    pub error: bool,
}

/// Parse key-value pairs from one `vhd-util scan` output line.
fn split_scan_line(line: &str) -> HashMap<String, String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r#"([a-z-]+)=([^ ]+)"#).unwrap());
    let mut fields: HashMap<String, String> = HashMap::new();
    for cap in regex.captures_iter(line) {
        fields.insert(cap[1].to_string(), cap[2].to_string());
    }
    fields
}

/// Parse the full output of `vhd-util scan -f -m <pattern>`. The scanner
/// emits one `vhd=... capacity=... size=... hidden=... parent=...` line per
/// image, with `scan-error=<errno>` lines for images it could not read.
/// `extract_uuid` maps the reported image name to a VDI UUID; names it
/// rejects are skipped.
pub fn parse_scan_output(
    output: &str,
    extract_uuid: impl Fn(&str) -> Option<String>,
) -> Result<HashMap<String, VhdInfo>> {
    let mut r = HashMap::new();
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with("vhd=") {
            continue;
        }
        let fields = split_scan_line(line);
        let name = fields.get("vhd").ok_or_else(|| anyhow!("missing vhd= in {line}"))?;
        let Some(uuid) = extract_uuid(name) else {
            continue;
        };
        let mut info = VhdInfo {
            path: name.clone(),
            ..Default::default()
        };
        if fields.contains_key("scan-error") {
            tracing::warn!("scan error on {name}: {:?}", fields.get("scan-error"));
            info.error = true;
            r.insert(uuid, info);
            continue;
        }
        info.size_virt = fields
            .get("capacity")
            .ok_or_else(|| anyhow!("missing capacity= in {line}"))?
            .parse()?;
        info.size_phys = fields
            .get("size")
            .ok_or_else(|| anyhow!("missing size= in {line}"))?
            .parse()?;
        info.hidden = fields.get("hidden").map(|v| v.as_str()) == Some("1");
        info.parent_uuid = fields
            .get("parent")
            .filter(|v| v.as_str() != "none")
            .and_then(|v| extract_uuid(v));
        r.insert(uuid, info);
    }
    Ok(r)
}

/// Enumerate every VHD matching `pattern` in one batch scan.
#[context("Scanning VHDs matching {pattern}")]
pub fn scan(
    pattern: &str,
    extract_uuid: impl Fn(&str) -> Option<String>,
) -> Result<HashMap<String, VhdInfo>> {
    let out = Command::new(VHD_UTIL)
        .args(["scan", "-f", "-m", pattern])
        .log_debug()
        .run_get_string()?;
    parse_scan_output(&out, extract_uuid)
}

fn query(path: &Utf8Path, field: &str) -> Result<String> {
    let out = Command::new(VHD_UTIL)
        .args(["query", "-n", path.as_str(), field])
        .run_get_string()?;
    Ok(out.trim().to_string())
}

/// Guest-visible size in bytes (`vhd-util` reports MiB).
#[context("Querying virtual size of {path}")]
pub fn get_size_virt(path: &Utf8Path) -> Result<u64> {
    let mib: u64 = query(path, "-v")?.parse()?;
    Ok(mib * MIB)
}

/// Physical utilization of the image in bytes.
#[context("Querying physical size of {path}")]
pub fn get_size_phys(path: &Utf8Path) -> Result<u64> {
    Ok(query(path, "-s")?.parse()?)
}

/// Bytes covered by allocated data blocks.
#[context("Querying allocated size of {path}")]
pub fn get_allocated_size(path: &Utf8Path) -> Result<u64> {
    let blocks: u64 = query(path, "-a")?.parse()?;
    Ok(blocks * VHD_BLOCK_SIZE)
}

/// The largest virtual size (bytes) this image can be resized to without
/// relocating metadata (the fast, in-place path).
#[context("Querying max resize size of {path}")]
pub fn get_max_resize_size(path: &Utf8Path) -> Result<u64> {
    let mib: u64 = query(path, "-S")?.parse()?;
    Ok(mib * MIB)
}

/// Parent image name, or `None` for a root. `extract` maps the raw tool
/// output (a path or LV name) to whatever the caller keys images by.
#[context("Querying parent of {path}")]
pub fn get_parent(path: &Utf8Path, extract: impl Fn(&str) -> Option<String>) -> Result<Option<String>> {
    let out = query(path, "-p")?;
    if out.contains("has no parent") {
        return Ok(None);
    }
    Ok(extract(&out))
}

#[context("Querying hidden flag of {path}")]
pub fn get_hidden(path: &Utf8Path) -> Result<bool> {
    let out = query(path, "-f")?;
    // the flag dump is a comma-separated "key: value" list
    for field in out.split(',') {
        if let Some(v) = field.trim().strip_prefix("hidden:") {
            return Ok(v.trim() == "1");
        }
    }
    anyhow::bail!("no hidden field in `{out}`")
}

#[context("Setting parent of {path}")]
pub fn set_parent(path: &Utf8Path, parent_path: &Utf8Path, parent_raw: bool) -> Result<()> {
    let mut cmd = Command::new(VHD_UTIL);
    cmd.args(["modify", "-n", path.as_str(), "-p", parent_path.as_str()]);
    if parent_raw {
        cmd.arg("-m");
    }
    cmd.log_debug().run()
}

#[context("Setting hidden={hidden} on {path}")]
pub fn set_hidden(path: &Utf8Path, hidden: bool) -> Result<()> {
    let val = if hidden { "1" } else { "0" };
    Command::new(VHD_UTIL)
        .args(["set", "-n", path.as_str(), "-f", "hidden", "-v", val])
        .log_debug()
        .run()
}

/// Build the argv for a coalesce; the caller runs it (usually under a
/// watchdog) and feeds stdout back to [`parse_coalesce_output`].
pub fn coalesce_command(path: &Utf8Path) -> Command {
    let mut cmd = Command::new(VHD_UTIL);
    cmd.args(["coalesce", "-n", path.as_str()]);
    cmd
}

/// `vhd-util coalesce` prints the number of sectors written.
pub fn parse_coalesce_output(output: &str) -> Result<u64> {
    let sectors: u64 = output
        .split_whitespace()
        .filter_map(|t| t.parse().ok())
        .next_back()
        .ok_or_else(|| anyhow!("no sector count in coalesce output `{output}`"))?;
    Ok(sectors * VHD_SECTOR_SIZE)
}

/// Structural validation. `fast` skips the (slow) block-bitmap walk.
#[context("Checking {path}")]
pub fn check(path: &Utf8Path, fast: bool) -> Result<()> {
    let mut cmd = Command::new(VHD_UTIL);
    cmd.args(["check", "-n", path.as_str()]);
    if fast {
        cmd.arg("-B");
    }
    cmd.log_debug().run()
}

#[context("Repairing {path}")]
pub fn repair(path: &Utf8Path) -> Result<()> {
    Command::new(VHD_UTIL)
        .args(["repair", "-n", path.as_str()])
        .log_debug()
        .run()
}

/// Fast in-place virtual resize; only valid up to [`get_max_resize_size`].
#[context("Fast-resizing {path}")]
pub fn set_size_virt_fast(path: &Utf8Path, size: u64) -> Result<()> {
    Command::new(VHD_UTIL)
        .args(["resize", "-n", path.as_str(), "-s", &(size / MIB).to_string(), "-f"])
        .log_debug()
        .run()
}

/// Journaled virtual resize. Offline-only: no concurrent opener may exist.
#[context("Resizing {path}")]
pub fn set_size_virt(path: &Utf8Path, size: u64, journal: &Utf8Path) -> Result<()> {
    Command::new(VHD_UTIL)
        .args([
            "resize",
            "-n",
            path.as_str(),
            "-s",
            &(size / MIB).to_string(),
            "-j",
            journal.as_str(),
        ])
        .log_debug()
        .run()
}

/// Raw allocation bitmap, one bit per [`VHD_BLOCK_SIZE`] block.
#[context("Reading block bitmap of {path}")]
pub fn get_block_bitmap(path: &Utf8Path) -> Result<Vec<u8>> {
    let out = Command::new(VHD_UTIL)
        .args(["read", "-B", "-n", path.as_str()])
        .output()
        .context("spawning vhd-util")?;
    if !out.status.success() {
        anyhow::bail!(
            "`vhd-util read -B -n {path}`: {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(out.stdout)
}

/// Population count of `a | b`, padding the shorter bitmap with zeros.
pub fn count_blocks_or(a: &[u8], b: &[u8]) -> u64 {
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut count: u64 = 0;
    for (i, byte) in long.iter().enumerate() {
        let merged = byte | short.get(i).copied().unwrap_or(0);
        count += u64::from(merged.count_ones());
    }
    count
}

fn round_up(align: u64, n: u64) -> u64 {
    n.div_ceil(align) * align
}

/// Metadata overhead of an empty VHD of the given virtual size:
/// footer + footer copy + header, plus the BAT and batmap.
pub fn calc_overhead_empty(size_virt: u64) -> u64 {
    let mut overhead: u64 = 3 * 1024;
    let blocks = size_virt.div_ceil(VHD_BLOCK_SIZE);
    // BAT: 4 bytes per block, sector-aligned
    overhead += round_up(512, blocks * 4);
    // batmap: 1 bit per block
    overhead = round_up(4096, overhead) + round_up(4096, blocks.div_ceil(8));
    overhead
}

/// Overhead of the per-block sector bitmaps for fully-allocated data of the
/// given size.
pub fn calc_overhead_bitmap(size_data: u64) -> u64 {
    size_data.div_ceil(VHD_BLOCK_SIZE) * 4096
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_scan() {
        let fixture = indoc::indoc! { "
            vhd=33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e.vhd capacity=10737418240 size=9068544 hidden=1 parent=none
              vhd=8bb77ea2-9c22-441f-8a42-21923e4d9be7.vhd capacity=10737418240 size=4096 hidden=0 parent=33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e.vhd
            vhd=33a1fb37-0d01-4c71-bd1e-7d7a6c0cb11f.vhd scan-error=-22 error-message='failure parsing fields'
        " };
        let extract = |name: &str| {
            name.strip_suffix(FILE_EXTN_VHD)
                .map(|u| u.to_string())
                .filter(|u| u.len() == 36)
        };
        let vhds = parse_scan_output(fixture, extract).unwrap();
        assert_eq!(vhds.len(), 3);
        assert!(vhds["33a1fb37-0d01-4c71-bd1e-7d7a6c0cb11f"].error);
        let root = &vhds["33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e"];
        assert_eq!(root.size_virt, 10737418240);
        assert_eq!(root.size_phys, 9068544);
        assert!(root.hidden);
        assert_eq!(root.parent_uuid, None);
        let child = &vhds["8bb77ea2-9c22-441f-8a42-21923e4d9be7"];
        assert!(!child.hidden);
        assert_eq!(
            child.parent_uuid.as_deref(),
            Some("33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e")
        );
    }

    #[test]
    fn test_parse_coalesce() {
        assert_eq!(parse_coalesce_output("4096\n").unwrap(), 4096 * 512);
        assert_eq!(parse_coalesce_output("coalesced 10 sectors").unwrap(), 10 * 512);
        assert!(parse_coalesce_output("").is_err());
    }

    #[test]
    fn test_count_blocks_or() {
        assert_eq!(count_blocks_or(&[], &[]), 0);
        assert_eq!(count_blocks_or(&[0xff], &[]), 8);
        assert_eq!(count_blocks_or(&[0x0f], &[0xf0]), 8);
        assert_eq!(count_blocks_or(&[0x01, 0x01], &[0x01]), 3);
        // symmetric in its arguments
        assert_eq!(count_blocks_or(&[0x01], &[0x01, 0x01]), 3);
    }

    #[test]
    fn test_overheads() {
        // An empty 10 GiB VHD: 5120 blocks -> 20480B BAT (sector aligned),
        // 640B batmap, both rounded to 4k after the 3k static headers.
        let v = calc_overhead_empty(10 * 1024 * 1024 * 1024);
        assert_eq!(v, 28672);
        assert_eq!(calc_overhead_bitmap(VHD_BLOCK_SIZE), 4096);
        assert_eq!(calc_overhead_bitmap(VHD_BLOCK_SIZE + 1), 8192);
        assert_eq!(calc_overhead_bitmap(0), 0);
    }
}
