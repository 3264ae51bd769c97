use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use vhdgc_utils::CommandRunExt;

/// LVM rounds every volume up to a multiple of this.
pub const LVM_SIZE_INCREMENT: u64 = 4 * 1024 * 1024;

/// Where activated volume groups appear in the filesystem.
pub const VG_LOCATION: &str = "/dev";

#[derive(Debug, Deserialize)]
struct LvsOutput {
    report: Vec<LvsReport>,
}

#[derive(Debug, Deserialize)]
struct LvsReport {
    #[serde(default)]
    lv: Vec<LogicalVolume>,
    #[serde(default)]
    vg: Vec<VolumeGroup>,
}

/// One row of `lvs --reportformat=json`.
#[derive(Debug, Deserialize, Clone)]
pub struct LogicalVolume {
    pub lv_name: String,
    pub lv_size: String,
    #[serde(default)]
    pub lv_attr: String,
    #[serde(default)]
    pub lv_tags: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VolumeGroup {
    pub vg_name: String,
    pub vg_size: String,
    pub vg_free: String,
}

/// lvm prints sizes as e.g. "10737418240B" with `--units b`.
fn parse_size_bytes(s: &str) -> Result<u64> {
    let s = s.trim().trim_end_matches('B');
    s.parse().with_context(|| format!("parsing lvm size {s:?}"))
}

/// State of one logical volume derived from its `lv_attr` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvState {
    pub name: String,
    pub size: u64,
    pub active: bool,
    pub open: bool,
    pub readonly: bool,
    pub tags: Vec<String>,
}

impl LvState {
    fn from_report(lv: &LogicalVolume) -> Result<Self> {
        let attr = lv.lv_attr.as_bytes();
        Ok(Self {
            name: lv.lv_name.clone(),
            size: parse_size_bytes(&lv.lv_size)?,
            // attr layout: volume type, permissions, alloc, minor, state, open, ...
            active: attr.get(4) == Some(&b'a'),
            open: attr.get(5) == Some(&b'o'),
            readonly: attr.get(1) == Some(&b'r'),
            tags: lv
                .lv_tags
                .split(',')
                .filter(|t| !t.is_empty())
                .map(|t| t.to_string())
                .collect(),
        })
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// List all logical volumes in `vg_name`.
#[context("Listing LVs in {vg_name}")]
pub fn list_lvs(vg_name: &str) -> Result<Vec<LvState>> {
    let output: LvsOutput = Command::new("lvs")
        .args([
            "--reportformat=json",
            "--units",
            "b",
            "-o",
            "lv_name,lv_size,lv_attr,lv_tags",
            vg_name,
        ])
        .log_debug()
        .run_and_parse_json()?;
    output
        .report
        .iter()
        .flat_map(|r| r.lv.iter())
        .map(LvState::from_report)
        .collect()
}

/// Total and free bytes of a volume group.
#[context("Querying stats of {vg_name}")]
pub fn vg_stats(vg_name: &str) -> Result<(u64, u64)> {
    let output: LvsOutput = Command::new("vgs")
        .args([
            "--reportformat=json",
            "--units",
            "b",
            "-o",
            "vg_name,vg_size,vg_free",
            vg_name,
        ])
        .run_and_parse_json()?;
    let vg = output
        .report
        .iter()
        .flat_map(|r| r.vg.iter())
        .next()
        .ok_or_else(|| anyhow!("no vgs output for {vg_name}"))?;
    Ok((parse_size_bytes(&vg.vg_size)?, parse_size_bytes(&vg.vg_free)?))
}

pub fn lv_path(vg_name: &str, lv_name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(VG_LOCATION).join(vg_name).join(lv_name)
}

fn size_arg(size: u64) -> String {
    format!("{size}b")
}

#[context("Creating LV {lv_name}")]
pub fn create(vg_name: &str, lv_name: &str, size: u64, activate: bool) -> Result<()> {
    let mut cmd = Command::new("lvcreate");
    cmd.args(["-n", lv_name, "-L", &size_arg(size.max(LVM_SIZE_INCREMENT))]);
    if !activate {
        cmd.args(["-a", "n"]);
        // don't wipe an inactive volume
        cmd.args(["--zero", "n"]);
    }
    cmd.arg(vg_name);
    cmd.log_debug().run()
}

/// Resize (grow or shrink) to exactly `size` bytes, which must be a
/// multiple of [`LVM_SIZE_INCREMENT`].
#[context("Resizing LV {lv_name} to {size}")]
pub fn resize(vg_name: &str, lv_name: &str, size: u64) -> Result<()> {
    Command::new("lvresize")
        .args(["-f", "-L", &size_arg(size)])
        .arg(format!("{vg_name}/{lv_name}"))
        .log_debug()
        .run()
}

#[context("Removing LV {lv_name}")]
pub fn remove(vg_name: &str, lv_name: &str) -> Result<()> {
    Command::new("lvremove")
        .args(["-f", &format!("{vg_name}/{lv_name}")])
        .log_debug()
        .run()
}

#[context("Renaming LV {old_name} -> {new_name}")]
pub fn rename(vg_name: &str, old_name: &str, new_name: &str) -> Result<()> {
    Command::new("lvrename")
        .args([vg_name, old_name, new_name])
        .log_debug()
        .run()
}

#[context("Activating LV {lv_name}")]
pub fn activate(vg_name: &str, lv_name: &str) -> Result<()> {
    Command::new("lvchange")
        .args(["-ay", &format!("{vg_name}/{lv_name}")])
        .log_debug()
        .run()
}

#[context("Deactivating LV {lv_name}")]
pub fn deactivate(vg_name: &str, lv_name: &str) -> Result<()> {
    Command::new("lvchange")
        .args(["-an", &format!("{vg_name}/{lv_name}")])
        .log_debug()
        .run()
}

/// Add or remove a named LV tag (used to carry flags raw volumes cannot
/// store in image metadata).
#[context("Tagging LV {lv_name}")]
pub fn set_tag(vg_name: &str, lv_name: &str, tag: &str, present: bool) -> Result<()> {
    let op = if present { "--addtag" } else { "--deltag" };
    Command::new("lvchange")
        .args([op, tag, &format!("{vg_name}/{lv_name}")])
        .log_debug()
        .run()
}

#[context("Setting readonly={readonly} on LV {lv_name}")]
pub fn set_readonly(vg_name: &str, lv_name: &str, readonly: bool) -> Result<()> {
    let perm = if readonly { "r" } else { "rw" };
    Command::new("lvchange")
        .args(["-p", perm, &format!("{vg_name}/{lv_name}")])
        .log_debug()
        .run()
}

/// Check for the presence of a single LV without listing the whole group.
pub fn exists(vg_name: &str, lv_name: &str) -> Result<bool> {
    let st = Command::new("lvs")
        .arg(format!("{vg_name}/{lv_name}"))
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .context("spawning lvs")?;
    Ok(st.success())
}

/// Round a byte count up to the LVM allocation increment.
pub fn round_size(size: u64) -> u64 {
    size.div_ceil(LVM_SIZE_INCREMENT) * LVM_SIZE_INCREMENT
}

/// Zero-fill `length` bytes of a block device starting at `offset`,
/// in chunks, invoking `checkpoint` between chunks so the caller can
/// abort a long fill.
#[context("Zeroing {path} from {offset}")]
pub fn zero_out(
    path: &Utf8Path,
    offset: u64,
    length: u64,
    mut checkpoint: impl FnMut() -> Result<()>,
) -> Result<()> {
    use std::io::{Seek, Write};
    const CHUNK: u64 = 4 * 1024 * 1024;
    tracing::debug!("zeroing {length} bytes of {path} at offset {offset}");
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .open(path.as_std_path())
        .with_context(|| format!("opening {path}"))?;
    f.seek(std::io::SeekFrom::Start(offset))?;
    let zeros = vec![0u8; CHUNK as usize];
    let mut remaining = length;
    while remaining > 0 {
        checkpoint()?;
        let n = remaining.min(CHUNK);
        f.write_all(&zeros[..n as usize])?;
        remaining -= n;
    }
    f.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_lvs() {
        let fixture = indoc::indoc! { r#"
        {
            "report": [
                {
                    "lv": [
                        {"lv_name": "VHD-8bb77ea2-9c22-441f-8a42-21923e4d9be7", "lv_size": "8589934592B", "lv_attr": "-wi-ao----"},
                        {"lv_name": "VHD-33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e", "lv_size": "4194304B", "lv_attr": "-ri-------", "lv_tags": "hidden"}
                    ]
                }
            ]
        }
        "# };
        let o: LvsOutput = serde_json::from_str(fixture).unwrap();
        let lvs: Vec<LvState> = o.report[0].lv.iter().map(|l| LvState::from_report(l).unwrap()).collect();
        assert_eq!(lvs[0].size, 8589934592);
        assert!(lvs[0].active);
        assert!(lvs[0].open);
        assert!(!lvs[0].readonly);
        assert!(!lvs[1].active);
        assert!(lvs[1].readonly);
        assert!(lvs[1].has_tag("hidden"));
        assert!(!lvs[0].has_tag("hidden"));
    }

    #[test]
    fn test_parse_vgs() {
        let fixture = indoc::indoc! { r#"
        {
            "report": [
                {
                    "vg": [
                        {"vg_name": "VG_HSM-b0c4e94b", "vg_size": "107374182400B", "vg_free": "53687091200B"}
                    ]
                }
            ]
        }
        "# };
        let o: LvsOutput = serde_json::from_str(fixture).unwrap();
        let vg = &o.report[0].vg[0];
        assert_eq!(parse_size_bytes(&vg.vg_size).unwrap(), 107374182400);
        assert_eq!(parse_size_bytes(&vg.vg_free).unwrap(), 53687091200);
    }

    #[test]
    fn test_round_size() {
        assert_eq!(round_size(0), 0);
        assert_eq!(round_size(1), LVM_SIZE_INCREMENT);
        assert_eq!(round_size(LVM_SIZE_INCREMENT), LVM_SIZE_INCREMENT);
        assert_eq!(round_size(LVM_SIZE_INCREMENT + 1), 2 * LVM_SIZE_INCREMENT);
    }

    #[test]
    fn test_zero_out() {
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("blob");
        std::fs::write(&p, vec![0xffu8; 8192]).unwrap();
        let p = camino::Utf8PathBuf::try_from(p).unwrap();
        zero_out(&p, 4096, 4096, || Ok(())).unwrap();
        let data = std::fs::read(&p).unwrap();
        assert!(data[..4096].iter().all(|b| *b == 0xff));
        assert!(data[4096..].iter().all(|b| *b == 0));
    }
}
