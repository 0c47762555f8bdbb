//! In-memory container engine for tests
//!
//! Models the parts of Docker the node driver depends on: removal that only
//! becomes visible after a few listings, an iptables INPUT chain per container
//! that can be missing until installed, and a filesystem fed through tar
//! archives.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;

use super::runtime::{ContainerRuntime, ContainerSpec, ContainerSummary, ExecOutput, IpamBlock};
use crate::error::{DeployError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRule {
    pub chain: String,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub ip: Option<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub rules: Vec<FakeRule>,
    pub iptables_installed: bool,
    /// Listings left before a container being removed disappears
    pub removing: Option<u32>,
}

struct FakeState {
    containers: Vec<FakeContainer>,
    ipam: Vec<IpamBlock>,
    image_tags: Vec<String>,
    next_host: u8,
    removal_lag: u32,
    iptables_preinstalled: bool,
    apt_available: bool,
    exec_log: Vec<(String, Vec<String>)>,
    stop_failures: Vec<String>,
}

pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                containers: Vec::new(),
                ipam: vec![IpamBlock {
                    subnet: Some("172.28.0.0/16".to_string()),
                    ip_range: Some("172.28.5.0/24".to_string()),
                    gateway: Some("172.28.5.254".to_string()),
                }],
                image_tags: Vec::new(),
                next_host: 2,
                removal_lag: 3,
                iptables_preinstalled: true,
                apt_available: true,
                exec_log: Vec::new(),
                stop_failures: Vec::new(),
            }),
        }
    }

    pub fn with_ipam(self, ipam: Vec<IpamBlock>) -> Self {
        self.state.lock().unwrap().ipam = ipam;
        self
    }

    pub fn without_iptables(self) -> Self {
        self.state.lock().unwrap().iptables_preinstalled = false;
        self
    }

    pub fn without_apt(self) -> Self {
        self.state.lock().unwrap().apt_available = false;
        self
    }

    /// Listings a removed container stays visible for
    pub fn with_removal_lag(self, listings: u32) -> Self {
        self.state.lock().unwrap().removal_lag = listings;
        self
    }

    pub fn with_image_tags(self, tags: &[&str]) -> Self {
        self.state.lock().unwrap().image_tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Make every stop of `id` fail with an engine error
    pub fn fail_stop(&self, id: &str) {
        self.state.lock().unwrap().stop_failures.push(id.to_string());
    }

    /// Add an unrelated container that does not carry the node labels
    pub fn add_foreign_container(&self, labels: HashMap<String, String>) -> String {
        let mut state = self.state.lock().unwrap();
        let id = uuid::Uuid::new_v4().simple().to_string();
        state.containers.push(FakeContainer {
            id: id.clone(),
            spec: ContainerSpec {
                name: format!("foreign-{}", id),
                labels,
                ..Default::default()
            },
            running: true,
            ip: Some("172.28.9.9".to_string()),
            files: BTreeMap::new(),
            rules: Vec::new(),
            iptables_installed: false,
            removing: None,
        });
        id
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        let state = self.state.lock().unwrap();
        state.containers.iter().find(|c| c.id == id).cloned()
    }

    pub fn rules(&self, id: &str) -> Vec<FakeRule> {
        self.container(id).map(|c| c.rules).unwrap_or_default()
    }

    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().exec_log.clone()
    }

    /// First matching INPUT rule decides; the chain policy is ACCEPT
    pub fn evaluate_input(&self, id: &str, source: Ipv4Addr) -> Verdict {
        for rule in self.rules(id) {
            if rule.chain == "INPUT" && source_matches(&rule.source, source) {
                return if rule.target == "DROP" {
                    Verdict::Drop
                } else {
                    Verdict::Accept
                };
            }
        }
        Verdict::Accept
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeContainer) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        match state
            .containers
            .iter_mut()
            .find(|c| c.id == id && c.removing != Some(0))
        {
            Some(container) => f(container),
            None => Err(DeployError::ResourceNotFound(format!(
                "No such container: {}",
                id
            ))),
        }
    }
}

fn source_matches(source: &str, addr: Ipv4Addr) -> bool {
    let (base, prefix) = match source.split_once('/') {
        Some((base, prefix)) => (base, prefix.parse::<u32>().unwrap_or(32)),
        None => (source, 32),
    };
    let Ok(base) = base.parse::<Ipv4Addr>() else {
        return false;
    };
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    (u32::from(base) & mask) == (u32::from(addr) & mask)
}

fn ok_output(stdout: impl Into<String>) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn not_found_output(bin: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 127,
        stdout: format!(
            "OCI runtime exec failed: exec: \"{}\": executable file not found in $PATH",
            bin
        ),
        stderr: String::new(),
    }
}

fn run_iptables(container: &mut FakeContainer, args: &[String]) -> ExecOutput {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["-F"] => {
            container.rules.clear();
            ok_output("")
        }
        ["-S"] => {
            let mut out = String::from("-P INPUT ACCEPT\n");
            for rule in &container.rules {
                out.push_str(&format!(
                    "-A {} -s {} -j {}\n",
                    rule.chain, rule.source, rule.target
                ));
            }
            ok_output(out)
        }
        [op @ ("-I" | "-A"), chain, "-s", source, "-j", target] => {
            let rule = FakeRule {
                chain: chain.to_string(),
                source: source.to_string(),
                target: target.to_string(),
            };
            if *op == "-I" {
                container.rules.insert(0, rule);
            } else {
                container.rules.push(rule);
            }
            ok_output("")
        }
        _ => ExecOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: format!("iptables: unsupported arguments {:?}", args),
        },
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, label_key: &str) -> Result<Vec<ContainerSummary>> {
        let mut state = self.state.lock().unwrap();

        for container in state.containers.iter_mut() {
            if let Some(left) = container.removing.as_mut() {
                *left = left.saturating_sub(1);
            }
        }
        state.containers.retain(|c| c.removing != Some(0));

        Ok(state
            .containers
            .iter()
            .filter(|c| c.spec.labels.contains_key(label_key))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.spec.name)],
                labels: c.spec.labels.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
                image: c.spec.image.clone(),
                ip_address: c.ip.clone(),
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(DeployError::Backend(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let iptables_installed = state.iptables_preinstalled;
        state.containers.push(FakeContainer {
            id: id.clone(),
            spec: spec.clone(),
            running: false,
            ip: None,
            files: BTreeMap::new(),
            rules: Vec::new(),
            iptables_installed,
            removing: None,
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let host = {
            let mut state = self.state.lock().unwrap();
            state.next_host += 1;
            state.next_host
        };
        self.with_container(id, |c| {
            c.running = true;
            c.ip = Some(format!("172.28.5.{}", host));
            Ok(())
        })
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let lag = {
            let state = self.state.lock().unwrap();
            if state.stop_failures.iter().any(|stuck| stuck == id) {
                return Err(DeployError::Backend(format!("cannot stop container {}", id)));
            }
            state.removal_lag
        };
        self.with_container(id, |c| {
            c.running = false;
            c.ip = None;
            if c.spec.auto_remove && c.removing.is_none() {
                c.removing = Some(lag);
            }
            Ok(())
        })
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let lag = self.state.lock().unwrap().removal_lag;
        self.with_container(id, |c| {
            if c.removing.is_none() {
                c.removing = Some(lag);
            }
            Ok(())
        })
    }

    async fn upload_archive(&self, id: &str, dest_dir: &str, archive: Vec<u8>) -> Result<()> {
        let mut entries = Vec::new();
        let mut tar = tar::Archive::new(Cursor::new(archive));
        for entry in tar.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            entries.push((path, data));
        }

        let dest_dir = dest_dir.trim_end_matches('/').to_string();
        self.with_container(id, |c| {
            for (path, data) in entries {
                c.files.insert(format!("{}/{}", dest_dir, path), data);
            }
            Ok(())
        })
    }

    async fn download_archive(&self, id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let path = path.trim_end_matches('/').to_string();
        let files = self.with_container(id, |c| Ok(c.files.clone()))?;

        let base = path.rsplit('/').next().unwrap_or_default().to_string();
        let prefix = format!("{}/", path);
        let matching: Vec<(String, Vec<u8>)> = files
            .into_iter()
            .filter_map(|(name, data)| {
                if name == path {
                    Some((base.clone(), data))
                } else {
                    name.strip_prefix(&prefix)
                        .map(|rest| (format!("{}/{}", base, rest), data))
                }
            })
            .collect();

        if matching.is_empty() {
            return Ok(None);
        }

        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in matching {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, data.as_slice())?;
        }
        Ok(Some(builder.into_inner()?))
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let apt_available = {
            let mut state = self.state.lock().unwrap();
            state.exec_log.push((id.to_string(), cmd.to_vec()));
            state.apt_available
        };

        self.with_container(id, |c| {
            let Some((bin, args)) = cmd.split_first() else {
                return Ok(not_found_output(""));
            };
            Ok(match bin.as_str() {
                "iptables" if c.iptables_installed => run_iptables(c, args),
                "iptables" => not_found_output("iptables"),
                "apt-get" if !apt_available => ExecOutput {
                    exit_code: 100,
                    stdout: String::new(),
                    stderr: "E: Unable to locate package iptables".to_string(),
                },
                "apt-get" => {
                    if args.iter().any(|a| a == "install") && args.iter().any(|a| a == "iptables")
                    {
                        c.iptables_installed = true;
                    }
                    ok_output("")
                }
                other => not_found_output(other),
            })
        })
    }

    async fn network_ipam(&self, _network: &str) -> Result<Vec<IpamBlock>> {
        Ok(self.state.lock().unwrap().ipam.clone())
    }

    async fn list_image_tags(&self, repository: &str) -> Result<Vec<String>> {
        let prefix = format!("{}:", repository);
        Ok(self
            .state
            .lock()
            .unwrap()
            .image_tags
            .iter()
            .filter(|tag| tag.starts_with(&prefix))
            .cloned()
            .collect())
    }
}
