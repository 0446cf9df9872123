//! The request dispatcher: resolves caller credentials, routes each verb to
//! the container or volume operation, enforces permissions and carries the
//! wait registry that turns container deaths into Wait responses.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use log::debug;

use crate::cred::Cred;
use crate::daemon::Daemon;
use crate::data;
use crate::error::{Error, ErrorKind, Result};
use crate::property;
use crate::protocol::{Request, Response, VolumeDescription};
use crate::volume::VolumeSpec;

/// Containers a waiter is interested in; `*` globs are allowed.
struct Waiter {
    id: u64,
    patterns: Vec<regex::Regex>,
    sender: Sender<String>,
}

pub struct WaitRegistry {
    waiters: Mutex<Vec<Waiter>>,
    next_id: std::sync::atomic::AtomicU64,
}

fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    regex::Regex::new(&expr)
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad pattern {:?}", pattern)))
}

impl WaitRegistry {
    pub fn new() -> WaitRegistry {
        WaitRegistry {
            waiters: Mutex::new(vec![]),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Block the calling worker until a matching container dies or the
    /// timeout passes. An empty result means timeout.
    pub fn wait(&self, names: &[String], timeout_ms: Option<u64>) -> Result<Option<String>> {
        let mut patterns = vec![];
        for name in names {
            patterns.push(glob_to_regex(name)?);
        }
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (sender, receiver) = bounded(1);
        self.waiters.lock().unwrap().push(Waiter {
            id,
            patterns,
            sender,
        });

        let result = match timeout_ms {
            Some(ms) => receiver.recv_timeout(Duration::from_millis(ms)).ok(),
            None => receiver.recv().ok(),
        };
        // fired waiters are removed by deliver(); expired ones here
        self.waiters.lock().unwrap().retain(|w| w.id != id);
        Ok(result)
    }

    /// A container reached a terminal state: wake every matching waiter.
    pub fn deliver(&self, name: &str) {
        let mut waiters = self.waiters.lock().unwrap();
        waiters.retain(|waiter| {
            if waiter.patterns.iter().any(|p| p.is_match(name)) {
                let _ = waiter.sender.send(name.to_string());
                false
            } else {
                true
            }
        });
    }
}

/// Handle one decoded request on a worker thread.
pub fn dispatch(daemon: &Daemon, client: &Cred, client_pid: u32, request: Request) -> Response {
    debug!("request from uid {} pid {}: {:?}", client.uid, client_pid, request);
    let result = dispatch_inner(daemon, client, client_pid, request);
    Response::from(result)
}

fn dispatch_inner(
    daemon: &Daemon,
    client: &Cred,
    client_pid: u32,
    request: Request,
) -> Result<Response> {
    let config = &daemon.config;
    match request {
        Request::Create { name } => {
            daemon.holder.create(&name, client, config)?;
            Ok(Response::ok())
        }
        Request::Destroy { name } => {
            daemon
                .holder
                .destroy(&name, client, config, &daemon.volumes)?;
            Ok(Response::ok())
        }
        Request::List => Ok(Response::list(daemon.holder.list())),
        Request::Start { name } => {
            daemon
                .holder
                .start(&name, client, config, &daemon.hier, &daemon.network)?;
            daemon.watch_container_oom(&name);
            Ok(Response::ok())
        }
        Request::Stop { name } => {
            daemon.holder.stop(&name, Some(client), config)?;
            Ok(Response::ok())
        }
        Request::Pause { name } => {
            daemon.holder.pause(&name, client, config)?;
            Ok(Response::ok())
        }
        Request::Resume { name } => {
            daemon.holder.resume(&name, client, config)?;
            Ok(Response::ok())
        }
        Request::Kill { name, signal } => {
            let container = daemon.holder.get(&name)?;
            let container = container.lock().unwrap();
            check_owner(client, &container.owner, &name)?;
            container.kill(signal)?;
            Ok(Response::ok())
        }
        Request::GetProperty { name, property } => {
            let container = daemon.holder.get(&name)?;
            let container = container.lock().unwrap();
            let value = container.get_property(&property, config)?;
            Ok(Response::value(value.format()))
        }
        Request::SetProperty {
            name,
            property,
            value,
        } => {
            // tree-wide invariant, checked before the slot is touched
            if property == property::P_MEM_GUARANTEE {
                let requested = crate::value::Value::parse(
                    crate::value::ValueKind::Uint,
                    &value,
                    true,
                )?;
                daemon
                    .holder
                    .check_guarantee_budget(&name, requested.as_uint(), config)?;
            }
            let container = daemon.holder.get(&name)?;
            let mut container = container.lock().unwrap();
            container.set_property(&property, &value, client, config)?;
            container.record_std_origin(&property, client_pid)?;
            daemon.holder.save_container(&container, config)?;
            Ok(Response::ok())
        }
        Request::GetData { name, data } => {
            let container = daemon.holder.get(&name)?;
            let mut container = container.lock().unwrap();
            let value = data::get(&mut container, &data, config)?;
            Ok(Response::value(value.format()))
        }
        Request::Get { names, variables } => {
            let mut map = BTreeMap::new();
            for name in &names {
                let mut values = BTreeMap::new();
                match daemon.holder.get(name) {
                    Ok(container) => {
                        let mut container = container.lock().unwrap();
                        for variable in &variables {
                            let result = container
                                .get_property(variable, config)
                                .or_else(|e| {
                                    if e.kind() == ErrorKind::InvalidProperty {
                                        data::get(&mut container, variable, config)
                                    } else {
                                        Err(e)
                                    }
                                });
                            values.insert(
                                variable.clone(),
                                match result {
                                    Ok(value) => value.format(),
                                    Err(e) => format!("error: {}", e),
                                },
                            );
                        }
                    }
                    Err(e) => {
                        for variable in &variables {
                            values.insert(variable.clone(), format!("error: {}", e));
                        }
                    }
                }
                map.insert(name.clone(), values);
            }
            Ok(Response {
                map: Some(map),
                ..Response::default()
            })
        }
        Request::Plist => Ok(Response::list(
            property::visible_names()
                .into_iter()
                .map(String::from)
                .collect(),
        )),
        Request::Dlist => Ok(Response::list(
            data::table().iter().map(|d| d.name.to_string()).collect(),
        )),
        Request::Wait { names, timeout_ms } => {
            if names.is_empty() {
                return Err(Error::new(ErrorKind::InvalidValue, "nothing to wait for"));
            }
            match daemon.waits.wait(&names, timeout_ms)? {
                Some(name) => Ok(Response::value(name)),
                None => Ok(Response::value("")), // timeout
            }
        }
        Request::Raw { request } => {
            if !client.is_root() {
                return Err(Error::new(
                    ErrorKind::Permission,
                    "raw requests are for the superuser",
                ));
            }
            let parsed: Request = serde_json::from_str(&request)
                .map_err(|e| Error::new(ErrorKind::InvalidMethod, format!("raw: {}", e)))?;
            Ok(dispatch(daemon, client, client_pid, parsed))
        }
        Request::CreateVolume { path, properties } => {
            let spec = volume_spec(path, &properties)?;
            let path = daemon.volumes.create(spec, client, config)?;
            Ok(Response::value(path.display().to_string()))
        }
        Request::DestroyVolume { path } => {
            daemon
                .volumes
                .destroy(&PathBuf::from(path), client, config)?;
            Ok(Response::ok())
        }
        Request::LinkVolume { path, container } => {
            daemon.holder.get(&container)?; // the link target must exist
            daemon
                .volumes
                .link_container(&PathBuf::from(&path), &container, client)?;
            let c = daemon.holder.get(&container)?;
            c.lock().unwrap().linked_volumes.push(PathBuf::from(path));
            Ok(Response::ok())
        }
        Request::UnlinkVolume { path, container } => {
            daemon.volumes.unlink_container(
                &PathBuf::from(&path),
                &container,
                Some(client),
                config,
            )?;
            if let Ok(c) = daemon.holder.get(&container) {
                c.lock()
                    .unwrap()
                    .linked_volumes
                    .retain(|p| *p != PathBuf::from(&path));
            }
            Ok(Response::ok())
        }
        Request::ListVolumes => {
            let mut volumes = vec![];
            for path in daemon.volumes.list_paths() {
                if let Ok(volume) = daemon.volumes.find(&path) {
                    let volume = volume.lock().unwrap();
                    let mut properties = BTreeMap::new();
                    properties.insert("space_limit".to_string(), volume.space_limit.to_string());
                    properties.insert("inode_limit".to_string(), volume.inode_limit.to_string());
                    properties.insert("read_only".to_string(), volume.read_only.to_string());
                    properties.insert("layers".to_string(), volume.layers.join(";"));
                    volumes.push(VolumeDescription {
                        path: volume.path.display().to_string(),
                        backend: volume.backend.name().to_string(),
                        containers: volume.containers.clone(),
                        properties,
                    });
                }
            }
            Ok(Response {
                volumes: Some(volumes),
                ..Response::default()
            })
        }
        Request::TuneVolume { path, properties } => {
            let path = PathBuf::from(path);
            let space = parse_size(properties.get("space_limit"))?;
            let inodes = parse_size(properties.get("inode_limit"))?;
            daemon.volumes.resize(&path, space, inodes, client)?;
            Ok(Response::ok())
        }
        Request::ImportLayer {
            layer,
            tarball,
            merge,
        } => {
            daemon
                .volumes
                .import_layer(&layer, &PathBuf::from(tarball), merge, config)?;
            Ok(Response::ok())
        }
        Request::ExportLayer { volume, tarball } => {
            daemon
                .volumes
                .export_layer(&PathBuf::from(volume), &PathBuf::from(tarball))?;
            Ok(Response::ok())
        }
        Request::RemoveLayer { layer } => {
            daemon.volumes.remove_layer(&layer, config)?;
            Ok(Response::ok())
        }
        Request::ListLayers => Ok(Response::list(daemon.volumes.list_layers(config)?)),
    }
}

fn check_owner(client: &Cred, owner: &Cred, name: &str) -> Result<()> {
    if client.can_control(owner) {
        return Ok(());
    }
    Err(Error::new(
        ErrorKind::Permission,
        format!("container {} is not owned by uid {}", name, client.uid),
    ))
}

fn volume_spec(
    path: Option<String>,
    properties: &BTreeMap<String, String>,
) -> Result<VolumeSpec> {
    let mut spec = VolumeSpec {
        path: path.map(PathBuf::from),
        ..VolumeSpec::default()
    };
    for (key, value) in properties {
        match key.as_str() {
            "backend" => spec.backend = Some(value.clone()),
            "storage" => spec.storage = Some(PathBuf::from(value)),
            "layers" => {
                spec.layers = value
                    .split(';')
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect()
            }
            "space_limit" => spec.space_limit = parse_size(Some(value))?,
            "inode_limit" => spec.inode_limit = parse_size(Some(value))?,
            "read_only" => spec.read_only = value == "true",
            "permissions" => {
                spec.permissions = u32::from_str_radix(value, 8).map_err(|_| {
                    Error::new(
                        ErrorKind::InvalidValue,
                        format!("invalid permissions {:?}", value),
                    )
                })?
            }
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidProperty,
                    format!("unknown volume property {:?}", other),
                ))
            }
        }
    }
    Ok(spec)
}

fn parse_size(value: Option<&String>) -> Result<u64> {
    match value {
        None => Ok(0),
        Some(v) => crate::value::Value::parse(crate::value::ValueKind::Uint, v, true)
            .map(|v| v.as_uint()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globs_match_names() {
        let re = glob_to_regex("a*").unwrap();
        assert!(re.is_match("a"));
        assert!(re.is_match("a/b"));
        assert!(!re.is_match("b"));
        let re = glob_to_regex("a/?").unwrap();
        assert!(re.is_match("a/b"));
        assert!(!re.is_match("a/bc"));
        // regex metacharacters in names are literal
        let re = glob_to_regex("a.b").unwrap();
        assert!(re.is_match("a.b"));
        assert!(!re.is_match("axb"));
    }

    #[test]
    fn waiters_wake_on_matching_death() {
        let registry = std::sync::Arc::new(WaitRegistry::new());
        let handle = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.wait(&["job-*".to_string()], Some(5000)))
        };
        std::thread::sleep(Duration::from_millis(50));
        registry.deliver("other");
        registry.deliver("job-7");
        let result = handle.join().unwrap().unwrap();
        assert_eq!(result, Some("job-7".to_string()));
    }

    #[test]
    fn wait_times_out_empty() {
        let registry = WaitRegistry::new();
        let result = registry.wait(&["a".to_string()], Some(10)).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn volume_spec_parses_properties() {
        let mut properties = BTreeMap::new();
        properties.insert("backend".to_string(), "overlay".to_string());
        properties.insert("layers".to_string(), "base;app".to_string());
        properties.insert("space_limit".to_string(), "1G".to_string());
        let spec = volume_spec(Some("/v/x".to_string()), &properties).unwrap();
        assert_eq!(spec.backend.as_deref(), Some("overlay"));
        assert_eq!(spec.layers, vec!["base", "app"]);
        assert_eq!(spec.space_limit, 1 << 30);

        let mut bad = BTreeMap::new();
        bad.insert("bogus".to_string(), "1".to_string());
        assert!(volume_spec(None, &bad).is_err());
    }
}
