use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use crate::consts::{Role, DEFAULT_OPENFLOW_PORT};
use crate::error::Error;

/// Startup configuration ([SPEC_FULL] §6). Carries the same keys and
/// semantics as the original property bag, read via [`Config::from_map`]
/// rather than parsed from a specific file format - the caller decides
/// where the `HashMap` comes from (CLI flags, a `.properties` file, env).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// `0` selects `tokio`'s default multi-threaded scheduler; a positive
    /// value pins `Builder::worker_threads` to it ([SPEC_FULL] §5).
    pub worker_threads: usize,
    pub initial_role: Role,
    pub flush_switches_on_reconnect: bool,
}

impl Config {
    /// Builds a [`Config`] from a flat `key=value` map.
    ///
    /// `role` takes precedence; if absent, `rolepath` is consulted via
    /// [`read_role_from_properties`]. If neither yields a role, the
    /// controller starts as `Role::Master`, matching a standalone
    /// (non-HA-aware) deployment.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Config, Error> {
        let port = match map.get("openflowport") {
            Some(value) => value.parse::<u16>().map_err(|_| Error::InvalidConfig { key: "openflowport", value: value.clone() })?,
            None => DEFAULT_OPENFLOW_PORT,
        };
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);

        let worker_threads = match map.get("workerthreads") {
            Some(value) => value.parse::<usize>().map_err(|_| Error::InvalidConfig { key: "workerthreads", value: value.clone() })?,
            None => 0,
        };

        let initial_role = match map.get("role") {
            Some(value) => parse_role(value)?,
            None => match map.get("rolepath") {
                Some(path) => read_role_from_properties(Path::new(path))?.unwrap_or(Role::Master),
                None => Role::Master,
            },
        };

        let flush_switches_on_reconnect = match map.get("flushSwitchesOnReconnect") {
            Some(value) => value.parse::<bool>().map_err(|_| Error::InvalidConfig { key: "flushSwitchesOnReconnect", value: value.clone() })?,
            None => false,
        };

        Ok(Config { bind_addr, worker_threads, initial_role, flush_switches_on_reconnect })
    }
}

fn parse_role(value: &str) -> Result<Role, Error> {
    match value.to_ascii_uppercase().as_str() {
        "MASTER" => Ok(Role::Master),
        "EQUAL" => Ok(Role::Equal),
        "SLAVE" => Ok(Role::Slave),
        _ => Err(Error::InvalidConfig { key: "role", value: value.to_string() }),
    }
}

/// Reads the `floodlight.role` key out of a `key=value` properties file,
/// ignoring blank lines and `#`-prefixed comments, per [SPEC_FULL] §6.
/// Returns `Ok(None)` if the file exists but carries no such key.
fn read_role_from_properties(path: &Path) -> Result<Option<Role>, Error> {
    let contents = std::fs::read_to_string(path)?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else { continue };
        if key.trim() == "floodlight.role" {
            return parse_role(value.trim()).map(Some);
        }
    }
    Ok(None)
}
