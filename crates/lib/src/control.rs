//! The hypervisor control-plane client, abstracted to exactly the surface
//! the engine consumes. Production talks JSON-RPC over the platform's local
//! control socket; tests substitute an in-memory implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

/// Which of the per-object configuration maps a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMap {
    Sm,
    Other,
    /// The scalar "on-boot" policy, exposed as a single-key map.
    OnBoot,
    /// The scalar "allow-caching" flag, exposed as a single-key map.
    AllowCaching,
}

impl ConfigMap {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigMap::Sm => "sm-config",
            ConfigMap::Other => "other-config",
            ConfigMap::OnBoot => "on-boot",
            ConfigMap::AllowCaching => "allow-caching",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SrRecord {
    pub uuid: String,
    pub name_label: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub shared: bool,
    #[serde(default)]
    pub sm_config: BTreeMap<String, String>,
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VdiRecord {
    pub uuid: String,
    pub managed: bool,
    #[serde(default)]
    pub is_a_snapshot: bool,
    #[serde(default)]
    pub allow_caching: bool,
    #[serde(default)]
    pub sm_config: BTreeMap<String, String>,
}

/// One host with the SR currently attached.
#[derive(Debug, Clone, Deserialize)]
pub struct HostBinding {
    pub host: String,
    /// True if this binding is the calling host's.
    pub local: bool,
}

/// Message priority as understood by the control plane ("3" = warning).
pub const MSG_PRIORITY_WARNING: &str = "3";

pub trait ControlPlane: Send + Sync + fmt::Debug {
    fn sr_record(&self, sr_uuid: &str) -> Result<SrRecord>;
    fn attached_hosts(&self, sr_uuid: &str) -> Result<Vec<HostBinding>>;
    fn this_host(&self) -> Result<String>;
    fn pool_master(&self) -> Result<String>;
    fn online_hosts(&self) -> Result<Vec<String>>;

    fn vdi_record(&self, vdi_uuid: &str) -> Result<Option<VdiRecord>>;
    fn vdi_config(&self, vdi_uuid: &str, map: ConfigMap) -> Result<BTreeMap<String, String>>;
    fn vdi_config_set(&self, vdi_uuid: &str, map: ConfigMap, key: &str, value: &str) -> Result<()>;
    fn vdi_config_remove(&self, vdi_uuid: &str, map: ConfigMap, key: &str) -> Result<()>;
    /// Internal (hidden from the user) snapshot; returns the new VDI uuid.
    fn snapshot_internal(&self, vdi_uuid: &str) -> Result<String>;
    /// Drop a VDI from the inventory; already-forgotten VDIs are ignored.
    fn forget_vdi(&self, vdi_uuid: &str) -> Result<()>;

    fn sr_config_set(&self, sr_uuid: &str, map: ConfigMap, key: &str, value: &str) -> Result<()>;
    fn sr_config_remove(&self, sr_uuid: &str, map: ConfigMap, key: &str) -> Result<()>;

    fn message_create(
        &self,
        name: &str,
        priority: &str,
        cls: &str,
        obj_uuid: &str,
        body: &str,
    ) -> Result<String>;
    fn message_destroy(&self, msg_id: &str) -> Result<()>;
    fn message_exists(&self, msg_id: &str) -> Result<bool>;

    /// Invoke a named plugin function on one host.
    fn call_plugin(
        &self,
        host: &str,
        plugin: &str,
        func: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Hosts (other than this one) with any of the given VDIs attached.
    fn hosts_attached_on(&self, sr_uuid: &str, vdi_uuids: &[String]) -> Result<Vec<String>>;

    /// Mark all local-cache-enabled SRs dirty.
    fn mark_cache_srs_dirty(&self) -> Result<()>;
    /// Kick an asynchronous SR re-scan.
    fn update_sr_async(&self, sr_uuid: &str) -> Result<()>;

    fn task_create(&self, label: &str, description: &str) -> Result<String>;
    fn task_progress(&self, task: &str, progress: f64) -> Result<()>;
    fn task_status(&self, task: &str, success: bool) -> Result<()>;
}

/// Shared handle passed through the whole engine.
pub type Session = Arc<dyn ControlPlane>;

/// The default control socket location.
pub const CONTROL_SOCKET: &str = "/run/sm/control.sock";

/// JSON-RPC client over the platform control socket. One request per line,
/// one response per line.
pub struct SocketClient {
    stream: Mutex<BufReader<UnixStream>>,
    next_id: Mutex<u64>,
}

impl fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketClient").finish_non_exhaustive()
    }
}

impl SocketClient {
    pub fn connect_default() -> Result<Self> {
        Self::connect(CONTROL_SOCKET)
    }

    pub fn connect(path: &str) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .with_context(|| format!("connecting to control socket {path}"))?;
        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            next_id: Mutex::new(0),
        })
    }

    fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = {
            let mut n = self.next_id.lock().unwrap();
            *n += 1;
            *n
        };
        let req = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let mut stream = self.stream.lock().unwrap();
        {
            let sock = stream.get_mut();
            serde_json::to_writer(&mut *sock, &req)?;
            sock.write_all(b"\n")?;
            sock.flush()?;
        }
        let mut line = String::new();
        stream.read_line(&mut line).context("reading control-plane response")?;
        let resp: Value = serde_json::from_str(&line).context("parsing control-plane response")?;
        if let Some(err) = resp.get("error").filter(|e| !e.is_null()) {
            return Err(anyhow!("control plane error from {method}: {err}"));
        }
        Ok(resp.get("result").cloned().unwrap_or(Value::Null))
    }

    fn call_parsed<T: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let v = self.call(method, params)?;
        serde_json::from_value(v).with_context(|| format!("decoding {method} result"))
    }
}

impl ControlPlane for SocketClient {
    fn sr_record(&self, sr_uuid: &str) -> Result<SrRecord> {
        self.call_parsed("SR.get_record", json!({"uuid": sr_uuid}))
    }

    fn attached_hosts(&self, sr_uuid: &str) -> Result<Vec<HostBinding>> {
        self.call_parsed("SR.get_attached_hosts", json!({"uuid": sr_uuid}))
    }

    fn this_host(&self) -> Result<String> {
        self.call_parsed("host.get_this", json!({}))
    }

    fn pool_master(&self) -> Result<String> {
        self.call_parsed("pool.get_master", json!({}))
    }

    fn online_hosts(&self) -> Result<Vec<String>> {
        self.call_parsed("host.get_online", json!({}))
    }

    fn vdi_record(&self, vdi_uuid: &str) -> Result<Option<VdiRecord>> {
        self.call_parsed("VDI.get_record", json!({"uuid": vdi_uuid}))
    }

    fn vdi_config(&self, vdi_uuid: &str, map: ConfigMap) -> Result<BTreeMap<String, String>> {
        self.call_parsed(
            "VDI.get_config",
            json!({"uuid": vdi_uuid, "map": map.as_str()}),
        )
    }

    fn vdi_config_set(&self, vdi_uuid: &str, map: ConfigMap, key: &str, value: &str) -> Result<()> {
        self.call(
            "VDI.set_config",
            json!({"uuid": vdi_uuid, "map": map.as_str(), "key": key, "value": value}),
        )
        .map(|_| ())
    }

    fn vdi_config_remove(&self, vdi_uuid: &str, map: ConfigMap, key: &str) -> Result<()> {
        self.call(
            "VDI.remove_config",
            json!({"uuid": vdi_uuid, "map": map.as_str(), "key": key}),
        )
        .map(|_| ())
    }

    fn snapshot_internal(&self, vdi_uuid: &str) -> Result<String> {
        self.call_parsed("VDI.snapshot_internal", json!({"uuid": vdi_uuid}))
    }

    fn forget_vdi(&self, vdi_uuid: &str) -> Result<()> {
        self.call("VDI.forget", json!({"uuid": vdi_uuid})).map(|_| ())
    }

    fn sr_config_set(&self, sr_uuid: &str, map: ConfigMap, key: &str, value: &str) -> Result<()> {
        self.call(
            "SR.set_config",
            json!({"uuid": sr_uuid, "map": map.as_str(), "key": key, "value": value}),
        )
        .map(|_| ())
    }

    fn sr_config_remove(&self, sr_uuid: &str, map: ConfigMap, key: &str) -> Result<()> {
        self.call(
            "SR.remove_config",
            json!({"uuid": sr_uuid, "map": map.as_str(), "key": key}),
        )
        .map(|_| ())
    }

    fn message_create(
        &self,
        name: &str,
        priority: &str,
        cls: &str,
        obj_uuid: &str,
        body: &str,
    ) -> Result<String> {
        self.call_parsed(
            "message.create",
            json!({"name": name, "priority": priority, "cls": cls, "obj_uuid": obj_uuid, "body": body}),
        )
    }

    fn message_destroy(&self, msg_id: &str) -> Result<()> {
        self.call("message.destroy", json!({"id": msg_id})).map(|_| ())
    }

    fn message_exists(&self, msg_id: &str) -> Result<bool> {
        self.call_parsed("message.exists", json!({"id": msg_id}))
    }

    fn call_plugin(
        &self,
        host: &str,
        plugin: &str,
        func: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<String> {
        self.call_parsed(
            "host.call_plugin",
            json!({"host": host, "plugin": plugin, "fn": func, "args": args}),
        )
    }

    fn hosts_attached_on(&self, sr_uuid: &str, vdi_uuids: &[String]) -> Result<Vec<String>> {
        self.call_parsed(
            "SR.get_hosts_attached_on",
            json!({"uuid": sr_uuid, "vdis": vdi_uuids}),
        )
    }

    fn mark_cache_srs_dirty(&self) -> Result<()> {
        self.call("SR.mark_caches_dirty", json!({})).map(|_| ())
    }

    fn update_sr_async(&self, sr_uuid: &str) -> Result<()> {
        self.call("SR.update_async", json!({"uuid": sr_uuid})).map(|_| ())
    }

    fn task_create(&self, label: &str, description: &str) -> Result<String> {
        self.call_parsed(
            "task.create",
            json!({"label": label, "description": description}),
        )
    }

    fn task_progress(&self, task: &str, progress: f64) -> Result<()> {
        self.call("task.set_progress", json!({"task": task, "progress": progress}))
            .map(|_| ())
    }

    fn task_status(&self, task: &str, success: bool) -> Result<()> {
        let status = if success { "success" } else { "failure" };
        self.call("task.set_status", json!({"task": task, "status": status}))
            .map(|_| ())
    }
}
