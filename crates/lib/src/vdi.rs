//! One node of a VHD tree: a virtual disk image and its on-disk metadata.

use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::control::ConfigMap;

pub const UUID_LEN: usize = 36;

/// Prefix given to the obsolete leaf while a leaf-coalesce swaps
/// identities; also recognized by scan as interrupted-coalesce residue.
pub const TMP_RENAME_PREFIX: &str = "OLD_";

/// Below this allocated size a leaf is always considered pauseable within
/// the downtime bound, even with no throughput history.
pub const LIVE_LEAF_MAX_SIZE: u64 = 20 * 1024 * 1024;
/// Maximum tolerated downtime of the final paused leaf-coalesce step.
pub const LIVE_LEAF_TIMEOUT: Duration = Duration::from_secs(10);
/// Margin applied to the downtime prediction.
pub const TIMEOUT_SAFETY_MARGIN: f64 = 0.5;

/// Per-VDI configuration keys the engine reads or writes.
pub mod config_keys {
    pub const VHD_PARENT: &str = "vhd-parent";
    pub const VDI_TYPE: &str = "vdi_type";
    pub const VHD_BLOCKS: &str = "vhd-blocks";
    pub const PAUSED: &str = "paused";
    pub const RELINKING: &str = "relinking";
    pub const ACTIVATING: &str = "activating";
    pub const GC: &str = "gc";
    pub const COALESCE: &str = "coalesce";
    pub const LEAF_COALESCE: &str = "leaf-coalesce";
    pub const GC_NO_SPACE: &str = "gc_no_space";
    pub const ON_BOOT: &str = "on-boot";
    pub const ALLOW_CACHING: &str = "allow_caching";

    /// leaf-coalesce values set by the user.
    pub const LEAFCLSC_DISABLED: &str = "false";
    pub const LEAFCLSC_FORCE: &str = "force";
    /// Set by the engine for external tooling: snap-coalesce does not fit
    /// but an offline coalesce would.
    pub const LEAFCLSC_OFFLINE: &str = "offline";

    pub const ONBOOT_RESET: &str = "reset";

    pub const VDI_TYPE_VHD: &str = "vhd";
    pub const VDI_TYPE_RAW: &str = "aio";
}

/// Which configuration map each key lives in.
pub fn config_map_for(key: &str) -> ConfigMap {
    use config_keys::*;
    match key {
        VHD_PARENT | VDI_TYPE | VHD_BLOCKS | PAUSED | RELINKING | ACTIVATING | GC_NO_SPACE => {
            ConfigMap::Sm
        }
        GC | COALESCE | LEAF_COALESCE => ConfigMap::Other,
        ON_BOOT => ConfigMap::OnBoot,
        ALLOW_CACHING => ConfigMap::AllowCaching,
        _ => ConfigMap::Other,
    }
}

/// Logical-volume state of a VDI on the LV back-end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LvInfo {
    pub size: u64,
    pub active: bool,
    pub open: bool,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Vdi {
    pub uuid: String,
    /// Basename of the backing file, or the LV name.
    pub file_name: String,
    pub path: Utf8PathBuf,
    /// No VHD header; leaf-only.
    pub raw: bool,
    pub hidden: bool,
    /// Metadata could not be read during a forced scan.
    pub scan_error: bool,
    pub size_virt: u64,
    /// Physical utilization; lazily loaded on the LV back-end.
    pub size_phys: Option<u64>,
    /// Bytes covered by allocated blocks; lazily loaded on the LV back-end.
    pub size_allocated: Option<u64>,
    pub parent_uuid: Option<String>,
    pub children: Vec<String>,
    /// LV back-end only.
    pub lv: Option<LvInfo>,
}

impl Vdi {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Was this node left behind by an interrupted leaf-coalesce?
    pub fn is_rename_residue(&self) -> bool {
        self.uuid.starts_with(TMP_RENAME_PREFIX)
    }
}

fn num2str(n: u64) -> String {
    const PREFIXES: [(&str, u64); 3] = [
        ("G", 1024 * 1024 * 1024),
        ("M", 1024 * 1024),
        ("K", 1024),
    ];
    for (p, mul) in PREFIXES {
        if n >= mul {
            return format!("{:.3}{p}", n as f64 / mul as f64);
        }
    }
    format!("{n}")
}

impl fmt::Display for Vdi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hidden {
            write!(f, "*")?;
        }
        write!(f, "{}({}", &self.uuid[..self.uuid.len().min(8)], num2str(self.size_virt))?;
        if !self.raw {
            if let Some(p) = self.size_phys {
                write!(f, "/{}", num2str(p))?;
            }
            if let Some(a) = self.size_allocated {
                write!(f, "/{}", num2str(a))?;
            }
        }
        write!(f, ")")?;
        if self.raw {
            write!(f, "[RAW]")?;
        }
        if let Some(lv) = &self.lv {
            let a = if lv.active { "a" } else { "n" };
            let o = if lv.open { "o" } else { "" };
            write!(f, "<{}|{a}{o}>", num2str(lv.size))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let v = Vdi {
            uuid: "33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e".into(),
            hidden: true,
            size_virt: 10 * 1024 * 1024 * 1024,
            size_phys: Some(9068544),
            ..Default::default()
        };
        assert_eq!(format!("{v}"), "*33a1fb37(10.000G/8.648M)");
        let raw = Vdi {
            uuid: "8bb77ea2-9c22-441f-8a42-21923e4d9be7".into(),
            raw: true,
            size_virt: 1024,
            ..Default::default()
        };
        assert_eq!(format!("{raw}"), "8bb77ea2(1.000K)[RAW]");
    }

    #[test]
    fn test_config_maps() {
        use config_keys::*;
        assert_eq!(config_map_for(VHD_PARENT), ConfigMap::Sm);
        assert_eq!(config_map_for(LEAF_COALESCE), ConfigMap::Other);
        assert_eq!(config_map_for(ON_BOOT), ConfigMap::OnBoot);
        assert_eq!(config_map_for(ALLOW_CACHING), ConfigMap::AllowCaching);
    }

    #[test]
    fn test_rename_residue() {
        let mut v = Vdi {
            uuid: "8bb77ea2-9c22-441f-8a42-21923e4d9be7".into(),
            ..Default::default()
        };
        assert!(!v.is_rename_residue());
        v.uuid = format!("{TMP_RENAME_PREFIX}{}", v.uuid);
        assert!(v.is_rename_residue());
    }
}
