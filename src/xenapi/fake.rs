// Scripted in-memory XenAPI used by unit tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{Connector, XenApiError, XenTransport};
use crate::config::HostConfig;

type Key = (String, String);

/// Fake host answering calls from a table keyed by (method, object ref)
#[derive(Default)]
pub struct FakeXen {
    responses: Mutex<HashMap<Key, Result<Value, String>>>,
    login_fault: Mutex<Option<String>>,
    pub logins: AtomicUsize,
    pub logouts: AtomicUsize,
    pub calls: AtomicUsize,
}

/// One resident VM: (reference, is control domain, VCPUs_number value)
pub type FakeVm<'a> = (&'a str, bool, Value);

impl FakeXen {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, method: &str, obj_ref: &str, value: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), obj_ref.to_string()), Ok(value));
    }

    pub fn fault(&self, method: &str, obj_ref: &str, code: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), obj_ref.to_string()), Err(code.to_string()));
    }

    pub fn fail_login(&self, code: Option<&str>) {
        *self.login_fault.lock().unwrap() = code.map(str::to_string);
    }

    /// Scripts one host with `cpus` physical CPUs and the given VMs and
    /// appends it to the `host.get_all` listing
    pub fn add_host(&self, host_ref: &str, name: &str, cpus: usize, vms: &[FakeVm<'_>]) {
        let mut hosts = match self.lookup("host.get_all", "") {
            Some(Ok(Value::Array(items))) => items,
            _ => Vec::new(),
        };
        hosts.push(json!(host_ref));
        self.respond("host.get_all", "", Value::Array(hosts));

        self.respond("host.get_name_label", host_ref, json!(name));
        let cpu_refs: Vec<String> = (0..cpus).map(|i| format!("{host_ref}/cpu{i}")).collect();
        self.respond("host.get_host_CPUs", host_ref, json!(cpu_refs));

        let vm_refs: Vec<&str> = vms.iter().map(|(vm_ref, _, _)| *vm_ref).collect();
        self.respond("host.get_resident_VMs", host_ref, json!(vm_refs));

        for (vm_ref, is_control_domain, vcpus) in vms {
            let metrics_ref = format!("{vm_ref}/metrics");
            self.respond("VM.get_is_control_domain", vm_ref, json!(is_control_domain));
            self.respond("VM.get_metrics", vm_ref, json!(metrics_ref));
            self.respond("VM_metrics.get_VCPUs_number", &metrics_ref, vcpus.clone());
        }
    }

    fn lookup(&self, method: &str, obj_ref: &str) -> Option<Result<Value, String>> {
        self.responses
            .lock()
            .unwrap()
            .get(&(method.to_string(), obj_ref.to_string()))
            .cloned()
    }
}

#[async_trait]
impl XenTransport for FakeXen {
    async fn login(&self, username: &str, _password: &str) -> Result<String, XenApiError> {
        // Give concurrent callers a chance to interleave.
        tokio::task::yield_now().await;

        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(code) = self.login_fault.lock().unwrap().clone() {
            return Err(XenApiError::Fault {
                method: "session.login_with_password".to_string(),
                code,
                details: vec![username.to_string()],
            });
        }
        Ok(format!("OpaqueRef:session-{n}"))
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, XenApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if method == "session.logout" {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            return Ok(Value::Null);
        }

        let obj_ref = params.get(1).and_then(Value::as_str).unwrap_or("");
        match self.lookup(method, obj_ref) {
            Some(Ok(value)) => Ok(value),
            Some(Err(code)) => Err(XenApiError::Fault {
                method: method.to_string(),
                code,
                details: vec![obj_ref.to_string()],
            }),
            None => Err(XenApiError::Fault {
                method: method.to_string(),
                code: "MESSAGE_METHOD_UNKNOWN".to_string(),
                details: vec![method.to_string()],
            }),
        }
    }
}

/// Hands out the scripted fake registered for each host address
#[derive(Default)]
pub struct FakeConnector {
    hosts: HashMap<String, Arc<FakeXen>>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, xen: Arc<FakeXen>) -> Self {
        self.hosts.insert(host.to_string(), xen);
        self
    }
}

impl Connector for FakeConnector {
    fn connect(&self, host: &HostConfig) -> Result<Arc<dyn XenTransport>, XenApiError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.hosts.get(host.host()) {
            Some(xen) => Ok(xen.clone() as Arc<dyn XenTransport>),
            None => Err(XenApiError::Connect {
                host: host.host().to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}
