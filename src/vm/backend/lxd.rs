//! LXD backend over the REST API.
//!
//! Instances are LXD virtual machines addressed as `/instances/<name>`.
//! Mutating requests return background operations which are awaited through
//! `/operations/<id>/wait`, with the short or long task timeout depending on
//! the weight of the request.

use super::{wait_for, BackendDriver, BackendKind, Capabilities, StartRequest};
use crate::config::{LxdSettings, Timeouts};
use crate::error::{Error, Result};
use crate::network::{InterfaceType, NetworkInterfaceInfo};
use crate::vm::description::{MemorySize, NetworkInterface, VirtualMachineDescription};
use crate::vm::snapshot::Snapshot;
use crate::vm::state::{ShutdownPolicy, VmState};
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// API version prefix LXD puts in operation URLs.
const API_PREFIX: &str = "/1.0";

/// Raw access to the LXD REST API.
pub trait LxdClient: Send + Sync {
    /// Send `method` to `path` (relative to the API root, e.g.
    /// `/instances/primary`) and return the decoded response body.
    ///
    /// LXD error bodies and HTTP failures come back as [`Error::Lxd`].
    fn request(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Value>;
}

/// [`LxdClient`] over HTTPS with a client certificate.
pub struct HttpLxdClient {
    http: reqwest::blocking::Client,
    base: String,
    project: String,
}

impl HttpLxdClient {
    /// Build the client.
    ///
    /// The request timeout covers the longest operation wait, since waits are
    /// served by the LXD daemon holding the request open.
    pub fn new(settings: &LxdSettings, timeouts: &Timeouts) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .user_agent(format!("hvorch/{}", crate::VERSION))
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .timeout(timeouts.lxd_task_long + timeouts.lxd_task_short);

        if let (Some(cert), Some(key)) = (&settings.client_cert, &settings.client_key) {
            let mut pem = std::fs::read(cert)?;
            pem.push(b'\n');
            pem.extend(std::fs::read(key)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::Config(format!("invalid lxd client certificate: {}", e)))?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build lxd client: {}", e)))?;

        Ok(Self {
            http,
            base: settings.url.trim_end_matches('/').to_string(),
            project: settings.project.clone(),
        })
    }
}

impl LxdClient for HttpLxdClient {
    fn request(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let verb = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| Error::Lxd {
            code: 0,
            message: format!("bad method {}: {}", method, e),
        })?;

        tracing::trace!(method, url = %url, "requesting lxd");
        let mut request = self
            .http
            .request(verb, &url)
            .query(&[("project", self.project.as_str())]);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().map_err(|e| Error::Lxd {
            code: e.status().map(|s| s.as_u16()).unwrap_or(0),
            message: format!("{}: {}", url, e),
        })?;
        let status = response.status().as_u16();
        let text = response.text().map_err(|e| Error::Lxd {
            code: status,
            message: format!("{}: {}", url, e),
        })?;

        decode_response(status, &text)
    }
}

/// Turn an LXD response into a JSON body or an [`Error::Lxd`].
pub fn decode_response(status: u16, text: &str) -> Result<Value> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return Err(Error::Lxd {
                code: status,
                message: if status >= 400 {
                    text.trim().to_string()
                } else {
                    format!("invalid lxd response: {}", e)
                },
            })
        }
    };

    if !value.is_object() {
        return Err(Error::Lxd {
            code: status,
            message: format!("invalid lxd response: {}", text.trim()),
        });
    }

    if value["type"] == "error" || status >= 400 {
        let code = value["error_code"]
            .as_u64()
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(status);
        let message = value["error"].as_str().unwrap_or("unknown error").to_string();
        return Err(Error::Lxd { code, message });
    }

    Ok(value)
}

/// Map an LXD status code.
///
/// 109/110 (freezing/frozen) are kept although LXD instances cannot be
/// suspended through this backend; they are only observed when an instance
/// was frozen out of band.
pub fn map_status_code(code: i64) -> VmState {
    match code {
        // Started, Running, Stopping, Thawed
        101 | 103 | 107 | 111 => VmState::Running,
        102 => VmState::Stopped,
        106 => VmState::Starting,
        109 => VmState::Suspending,
        110 => VmState::Suspended,
        // Cancelling, Aborting, Error
        104 | 108 | 112 => VmState::Unknown,
        other => {
            tracing::error!(status_code = other, "unexpected lxd status code");
            VmState::Unknown
        }
    }
}

/// First `inet` address of `eth0` (or any non-loopback interface) in a
/// `/state` response.
pub fn ipv4_from_state(state: &Value) -> Option<Ipv4Addr> {
    let network = state["metadata"]["network"].as_object()?;

    let inet = |iface: &Value| -> Option<Ipv4Addr> {
        iface["addresses"]
            .as_array()?
            .iter()
            .filter(|a| a["family"] == "inet")
            .find_map(|a| a["address"].as_str()?.parse().ok())
    };

    network
        .get("eth0")
        .and_then(inet)
        .or_else(|| {
            network
                .iter()
                .filter(|(name, _)| name.as_str() != "lo")
                .find_map(|(_, iface)| inet(iface))
        })
}

/// LXD adapter.
pub struct LxdBackend {
    name: String,
    client: Arc<dyn LxdClient>,
    task_short: Duration,
    task_long: Duration,
}

impl LxdBackend {
    /// Attach to the instance, creating it when LXD does not know it.
    ///
    /// Images are referenced by fingerprint, the file stem of the
    /// description's image path.
    pub fn new(
        desc: &VirtualMachineDescription,
        timeouts: &Timeouts,
        client: Arc<dyn LxdClient>,
    ) -> Result<Self> {
        let backend = Self {
            name: desc.name.clone(),
            client,
            task_short: timeouts.lxd_task_short,
            task_long: timeouts.lxd_task_long,
        };

        match backend.client.request("GET", &backend.instance_path(), None) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => backend.create_instance(desc)?,
            Err(e) => return Err(e),
        }
        Ok(backend)
    }

    fn create_instance(&self, desc: &VirtualMachineDescription) -> Result<()> {
        let fingerprint = desc
            .image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::debug!(vm = %self.name, %fingerprint, "creating lxd instance");

        let body = json!({
            "name": self.name,
            "type": "virtual-machine",
            "config": {
                "limits.cpu": desc.num_cores.to_string(),
                "limits.memory": desc.mem_size.in_bytes().to_string(),
                "volatile.eth0.hwaddr": desc.default_mac,
            },
            "devices": {
                "root": {
                    "path": "/",
                    "pool": "default",
                    "type": "disk",
                    "size": desc.disk_space.in_bytes().to_string(),
                },
            },
            "source": {
                "type": "image",
                "fingerprint": fingerprint,
            },
        });

        let reply = self.client.request("POST", "/instances", Some(&body))?;
        self.wait_operation(&reply, self.task_long)?;
        for (i, iface) in desc.extra_interfaces.iter().enumerate() {
            self.add_network_interface(i, &desc.default_mac, iface)?;
        }
        Ok(())
    }

    fn instance_path(&self) -> String {
        format!("/instances/{}", self.name)
    }

    fn state_path(&self) -> String {
        format!("/instances/{}/state", self.name)
    }

    /// Wait for the background operation of an async reply.
    fn wait_operation(&self, reply: &Value, timeout: Duration) -> Result<Value> {
        if reply["type"] != "async" {
            return Ok(reply.clone());
        }
        let Some(operation) = reply["operation"].as_str() else {
            return Ok(reply.clone());
        };

        let path = format!(
            "{}/wait?timeout={}",
            operation.strip_prefix(API_PREFIX).unwrap_or(operation),
            timeout.as_secs()
        );
        let result = self.client.request("GET", &path, None)?;

        let metadata = &result["metadata"];
        let err = metadata["err"].as_str().unwrap_or("");
        if !err.is_empty() {
            let code = metadata["status_code"]
                .as_u64()
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(400);
            return Err(Error::Lxd {
                code,
                message: err.to_string(),
            });
        }
        Ok(result)
    }

    fn request_state(&self, body: Value, timeout: Duration) -> Result<()> {
        let reply = self.client.request("PUT", &self.state_path(), Some(&body))?;
        self.wait_operation(&reply, timeout).map(drop)
    }

    fn patch(&self, operation: &str, body: Value) -> Result<()> {
        let reply = self
            .client
            .request("PATCH", &self.instance_path(), Some(&body))
            .map_err(|e| Error::operation_failed(operation, &self.name, e.diagnostic()))?;
        self.wait_operation(&reply, self.task_short)
            .map(drop)
            .map_err(|e| Error::operation_failed(operation, &self.name, e.diagnostic()))
    }
}

impl BackendDriver for LxdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lxd
    }

    fn capabilities(&self) -> Capabilities {
        super::capabilities_of(BackendKind::Lxd)
    }

    fn start(&self, _request: &StartRequest<'_>) -> Result<()> {
        self.request_state(json!({ "action": "start" }), self.task_short)
            .map_err(|e| Error::start_failure(&self.name, e.diagnostic()))
    }

    fn shutdown(&self, policy: ShutdownPolicy, timeout: Duration) -> Result<()> {
        let state = self.current_state()?;

        let body = match (state, policy) {
            (s, _) if s.is_stopped() => return Ok(()),
            (VmState::Suspended, ShutdownPolicy::Graceful) => return Ok(()),
            (VmState::Suspended, ShutdownPolicy::Forced)
            | (VmState::Starting, _)
            | (_, ShutdownPolicy::Forced) => json!({ "action": "stop", "force": true }),
            (_, ShutdownPolicy::Graceful) => {
                json!({ "action": "stop", "timeout": timeout.as_secs() })
            }
        };

        self.request_state(body, timeout.max(self.task_short))
            .map_err(|e| match e {
                Error::Lxd { ref message, .. } if message.contains("timed out") => {
                    Error::timeout("lxd instance stop", timeout)
                }
                other => Error::operation_failed("shutdown", &self.name, other.diagnostic()),
            })?;

        wait_for("lxd instance stop", self.task_short, || {
            Ok(self.current_state()?.is_stopped())
        })
    }

    fn suspend(&self) -> Result<()> {
        self.require_suspend_support()?;
        Ok(())
    }

    fn current_state(&self) -> Result<VmState> {
        let reply = self.client.request("GET", &self.state_path(), None)?;
        let metadata = &reply["metadata"];
        tracing::debug!(
            vm = %self.name,
            status = %metadata["status"].as_str().unwrap_or("?"),
            "got lxd instance state"
        );
        Ok(map_status_code(metadata["status_code"].as_i64().unwrap_or(-1)))
    }

    fn update_cpus(&self, num_cores: u32, _running: bool) -> Result<()> {
        self.patch(
            "update cpus",
            json!({ "config": { "limits.cpu": num_cores.to_string() } }),
        )
    }

    fn resize_memory(&self, size: MemorySize, _running: bool) -> Result<()> {
        self.patch(
            "resize memory",
            json!({ "config": { "limits.memory": size.in_bytes().to_string() } }),
        )
    }

    fn resize_disk(&self, size: MemorySize, _running: bool) -> Result<()> {
        self.patch(
            "resize disk",
            json!({
                "devices": {
                    "root": {
                        "path": "/",
                        "pool": "default",
                        "type": "disk",
                        "size": size.in_bytes().to_string(),
                    }
                }
            }),
        )
    }

    fn add_network_interface(
        &self,
        index: usize,
        _default_mac: &str,
        interface: &NetworkInterface,
    ) -> Result<()> {
        let device = format!("eth{}", index + 1);
        self.patch(
            "add network interface",
            json!({
                "devices": {
                    device: {
                        "type": "nic",
                        "nictype": "bridged",
                        "parent": interface.id,
                        "hwaddr": interface.mac_address,
                    }
                }
            }),
        )
    }

    fn management_ipv4(&self) -> Result<Option<Ipv4Addr>> {
        let state = self.client.request("GET", &self.state_path(), None)?;
        let ip = ipv4_from_state(&state);
        if ip.is_none() {
            tracing::debug!(vm = %self.name, "ip not found yet");
        }
        Ok(ip)
    }

    fn capture_snapshot(&self, _snapshot: &Snapshot) -> Result<()> {
        self.require_snapshots_support()?;
        Ok(())
    }

    fn apply_snapshot(&self, _snapshot: &Snapshot) -> Result<()> {
        self.require_snapshots_support()?;
        Ok(())
    }

    fn erase_snapshot(&self, _snapshot: &Snapshot) -> Result<()> {
        self.require_snapshots_support()?;
        Ok(())
    }

    fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        let reply = self.client.request("GET", "/networks?recursion=1", None)?;
        let networks = reply["metadata"].as_array().cloned().unwrap_or_default();

        Ok(networks
            .iter()
            .filter(|n| n["managed"] != true)
            .filter_map(|n| {
                let id = n["name"].as_str()?;
                let kind = match n["type"].as_str().unwrap_or("") {
                    "bridge" => InterfaceType::Bridge,
                    "physical" => InterfaceType::Ethernet,
                    _ => return None,
                };
                let description = n["description"]
                    .as_str()
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| match kind {
                        InterfaceType::Bridge => "Network bridge".to_string(),
                        _ => "Ethernet device".to_string(),
                    });
                Some(NetworkInterfaceInfo::new(id, kind, description))
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// [`LxdClient`] double answering `(method, path prefix)` rules and
    /// recording every request.
    #[derive(Default)]
    pub struct MockLxdClient {
        rules: Mutex<Vec<(String, String, VecDeque<std::result::Result<Value, (u16, String)>>)>>,
        calls: Mutex<Vec<(String, String, Option<Value>)>>,
    }

    impl MockLxdClient {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a reply; the last one for a rule repeats.
        pub fn reply(&self, method: &str, path: &str, body: Value) -> &Self {
            self.push(method, path, Ok(body))
        }

        /// Queue an LXD error.
        pub fn fail(&self, method: &str, path: &str, code: u16, message: &str) -> &Self {
            self.push(method, path, Err((code, message.to_string())))
        }

        fn push(
            &self,
            method: &str,
            path: &str,
            entry: std::result::Result<Value, (u16, String)>,
        ) -> &Self {
            let mut rules = self.rules.lock();
            if let Some((_, _, queue)) = rules.iter_mut().find(|(m, p, _)| m == method && p == path) {
                queue.push_back(entry);
            } else {
                rules.push((method.to_string(), path.to_string(), VecDeque::from([entry])));
            }
            self
        }

        pub fn calls(&self) -> Vec<(String, String, Option<Value>)> {
            self.calls.lock().clone()
        }

        pub fn count(&self, method: &str, path: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|(m, p, _)| m == method && p.starts_with(path))
                .count()
        }
    }

    impl LxdClient for MockLxdClient {
        fn request(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Value> {
            self.calls
                .lock()
                .push((method.to_string(), path.to_string(), body.cloned()));

            let mut rules = self.rules.lock();
            let best = rules
                .iter_mut()
                .filter(|(m, p, _)| m == method && path.starts_with(p.as_str()))
                .max_by_key(|(_, p, _)| p.len());

            let entry = match best {
                Some((_, _, queue)) if queue.len() > 1 => queue.pop_front(),
                Some((_, _, queue)) => queue.front().cloned(),
                None => None,
            };
            match entry {
                Some(Ok(v)) => Ok(v),
                Some(Err((code, message))) => Err(Error::Lxd { code, message }),
                None => Ok(json!({ "type": "sync", "status_code": 200, "metadata": {} })),
            }
        }
    }
}
