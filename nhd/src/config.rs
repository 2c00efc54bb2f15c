// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! Configuration for `nhd`.

use std::collections::BTreeSet;

use serde::Deserialize;
use structopt::StructOpt;

use crate::tag;
use crate::types::NhError;
use crate::types::NhResult;

#[derive(Debug, Default, StructOpt)]
#[structopt(name = "nhd", about = "openflow network hypervisor daemon")]
pub struct Opt {
    #[structopt(long, help = "path to the TOML configuration file")]
    pub config_file: Option<String>,

    #[structopt(
        long,
        help = "send log data to the named file rather than stdout"
    )]
    pub log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        help = "format logs for 'human' or 'json' consumption"
    )]
    pub log_format: Option<common::logging::LogFormat>,

    #[structopt(
        long,
        help = "TCP port on which to accept switch connections"
    )]
    pub listen: Option<u16>,
}

fn default_listen_port() -> u16 {
    common::DEFAULT_LISTEN_PORT
}

fn default_echo_interval_ms() -> u64 {
    5_000
}

fn default_topology_period_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One virtual port: the tenant-facing number and the physical port it
/// stands for.
#[derive(Debug, Clone, Deserialize)]
pub struct PortMapEntry {
    pub vport: u32,
    pub phys_dpid: u64,
    pub phys_port: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualSwitchConfig {
    pub dpid: u64,
    #[serde(default)]
    pub ports: Vec<PortMapEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SliceConfig {
    pub id: u16,
    pub controller_host: String,
    pub controller_port: u16,
    pub max_rate_pps: u32,
    #[serde(default)]
    pub virtual_switches: Vec<VirtualSwitchConfig>,
}

/// The run-time settings of the daemon: the TOML file contents plus the
/// log options, which only exist on the command line.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default = "default_echo_interval_ms")]
    pub echo_interval_ms: u64,

    #[serde(default = "default_topology_period_ms")]
    pub topology_period_ms: u64,

    /// Defaults to three discovery periods.
    #[serde(default)]
    pub link_ttl_ms: Option<u64>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub slices: Vec<SliceConfig>,

    #[serde(skip)]
    pub log_file: Option<String>,

    #[serde(skip)]
    pub log_format: common::logging::LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_port: default_listen_port(),
            echo_interval_ms: default_echo_interval_ms(),
            topology_period_ms: default_topology_period_ms(),
            link_ttl_ms: None,
            log_level: default_log_level(),
            slices: Vec::new(),
            log_file: None,
            log_format: common::logging::LogFormat::default(),
        }
    }
}

impl Config {
    pub fn link_ttl_ms(&self) -> u64 {
        self.link_ttl_ms.unwrap_or(3 * self.topology_period_ms)
    }
}

// Use the command-line arguments to update the run-time config.
fn update_from_cli(opts: &Opt, config: &mut Config) {
    if let Some(log_file) = &opts.log_file {
        config.log_file = Some(log_file.to_string());
    }

    if let Some(log_format) = opts.log_format {
        config.log_format = log_format;
    }

    if let Some(port) = opts.listen {
        config.listen_port = port;
    }
}

fn validate(config: &Config) -> NhResult<()> {
    let mut slice_ids = BTreeSet::new();
    let mut vswitch_dpids = BTreeSet::new();

    for slice in &config.slices {
        if slice.id as u32 >= 1 << tag::SLICE_BITS {
            return Err(NhError::InvalidConfig(format!(
                "slice id {} does not fit in the vlan slice field",
                slice.id
            )));
        }
        if !slice_ids.insert(slice.id) {
            return Err(NhError::InvalidConfig(format!(
                "duplicate slice id {}",
                slice.id
            )));
        }
        for vsw in &slice.virtual_switches {
            if !vswitch_dpids.insert(vsw.dpid) {
                return Err(NhError::InvalidConfig(format!(
                    "duplicate virtual datapath id {:#x}",
                    vsw.dpid
                )));
            }
            let mut vports = BTreeSet::new();
            for port in &vsw.ports {
                if !vports.insert(port.vport) {
                    return Err(NhError::InvalidConfig(format!(
                        "virtual switch {:#x} declares port {} twice",
                        vsw.dpid, port.vport
                    )));
                }
                if port.phys_port >= tag::MAX_PORT_ID as u32 {
                    return Err(NhError::InvalidConfig(format!(
                        "physical port {} on {:#x} does not fit in the \
                         vlan port field",
                        port.phys_port, port.phys_dpid
                    )));
                }
            }
        }
    }
    Ok(())
}

/// This builds a Config struct containing the tunable settings used to
/// adjust the daemon's behavior.  Settings come from the TOML file named
/// on the command line, with the remaining command line options applied
/// on top.
pub fn build_config(opts: &Opt) -> NhResult<Config> {
    let mut config = match &opts.config_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents).map_err(|e| {
                NhError::InvalidConfig(format!("failed to parse TOML: {e}"))
            })?
        }
        None => Config::default(),
    };
    update_from_cli(opts, &mut config);
    validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        listen_port = 6653
        topology_period_ms = 500

        [[slices]]
        id = 0
        controller_host = "127.0.0.1"
        controller_port = 6633
        max_rate_pps = 10000

        [[slices.virtual_switches]]
        dpid = 100
        ports = [
            { vport = 1, phys_dpid = 1, phys_port = 2 },
            { vport = 2, phys_dpid = 2, phys_port = 2 },
        ]
    "#;

    #[test]
    fn test_parse_example() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.listen_port, 6653);
        assert_eq!(config.topology_period_ms, 500);
        // TTL defaults to three discovery periods.
        assert_eq!(config.link_ttl_ms(), 1500);
        assert_eq!(config.slices.len(), 1);
        let vsw = &config.slices[0].virtual_switches[0];
        assert_eq!(vsw.dpid, 100);
        assert_eq!(vsw.ports.len(), 2);
        validate(&config).unwrap();
    }

    #[test]
    fn test_cli_overrides() {
        let opts = Opt {
            listen: Some(9999),
            log_file: Some("test.log".to_string()),
            ..Opt::default()
        };
        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        update_from_cli(&opts, &mut config);
        assert_eq!(config.listen_port, 9999);
        assert_eq!(config.log_file, Some("test.log".to_string()));
    }

    #[test]
    fn test_duplicate_slice_rejected() {
        let text = r#"
            [[slices]]
            id = 1
            controller_host = "a"
            controller_port = 1
            max_rate_pps = 1

            [[slices]]
            id = 1
            controller_host = "b"
            controller_port = 2
            max_rate_pps = 1
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_oversized_slice_id_rejected() {
        let text = r#"
            [[slices]]
            id = 400
            controller_host = "a"
            controller_port = 1
            max_rate_pps = 1
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert!(validate(&config).is_err());
    }
}
