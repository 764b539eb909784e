//! Loading and validation of settings.
//!
//! Settings come from an INI file (section names map to the identically
//! named fields below) and can be overridden through `ANOQ__`-prefixed
//! environment variables, e.g. `ANOQ__SETUP__CLIENT_PORT=9100`.
//!
//! The cluster size is not configured directly: it is the number of rows in
//! the client-list file, and it must be prime; the overlay permutation
//! depends on it. A non-prime client list is a fatal start-up error.

use std::{
    collections::HashMap,
    fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

use anoq_core::{common::is_prime, NodeId, UTILITY_NODE_ID};

/// The configuration file used when none is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "anoq.ini";

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("could not read client list {path}: {reason}")]
    ClientList { path: String, reason: String },
    #[error("cluster size {0} is not prime")]
    NonPrimeClusterSize(i32),
    #[error("validation failed: {0}")]
    Validation(String),
}

/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically
/// named settings field.
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub setup: SetupSettings,
    /// Application-level simulation parameters; only the smart-meter
    /// example reads these.
    pub simulation: Option<SimulationSettings>,
    #[serde(default)]
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings from a configuration file.
    ///
    /// # Errors
    /// Fails when the file cannot be loaded or a setting is out of range.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::new(
                path.as_ref().to_str().unwrap_or_default(),
                FileFormat::Ini,
            ))
            .add_source(Environment::with_prefix("anoq").separator("__"))
            .build()?
            .try_deserialize()
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.setup.client_port == 0 {
            return Err(SettingsError::Validation("client_port must not be 0".into()));
        }
        if self.setup.server_port == 0 {
            return Err(SettingsError::Validation("server_port must not be 0".into()));
        }
        if let Some(simulation) = &self.simulation {
            simulation.validate()?;
        }
        Ok(())
    }
}

/// The `[Setup]` section: identity, endpoints and key locations.
#[derive(Debug, Deserialize)]
pub struct SetupSettings {
    /// The unique id of the running client. Not needed by the server.
    pub client_id: Option<NodeId>,
    /// The port clients listen on for peer and server messages.
    pub client_port: u16,
    /// The port the server listens on.
    pub server_port: u16,
    /// This node's private key (PEM).
    pub private_key_file: PathBuf,
    /// The server's public key (PEM).
    pub server_key_file: PathBuf,
    /// The table of `<id> <ipv4> <port>` rows naming every client.
    pub client_list_file: PathBuf,
    /// The folder holding every client's public key.
    pub client_keys_folder: PathBuf,
    /// Client key files are named `<prefix><id>.pem`.
    pub client_key_file_prefix: String,
}

impl SetupSettings {
    /// The expected public-key file of every client, plus the server's key
    /// under the utility id.
    pub fn key_paths(&self, num_clients: i32) -> HashMap<NodeId, PathBuf> {
        let mut paths: HashMap<NodeId, PathBuf> = (0..num_clients)
            .map(|id| {
                let file = format!("{}{}.pem", self.client_key_file_prefix, id);
                (id, self.client_keys_folder.join(file))
            })
            .collect();
        paths.insert(UTILITY_NODE_ID, self.server_key_file.clone());
        paths
    }
}

/// The `[Simulation]` section, consumed by the smart-meter example.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SimulationSettings {
    pub simulation_days: u32,
    /// Minutes of simulated time per usage timestep; must divide a day.
    pub usage_timestep_min: u32,
    pub total_timesteps: u32,
    pub percent_poor_homes: u32,
    pub percent_rich_homes: u32,
    pub num_queries: u32,
    pub ms_per_timestep: u64,
}

impl SimulationSettings {
    fn validate(&self) -> Result<(), SettingsError> {
        if self.usage_timestep_min == 0 || 1440 % self.usage_timestep_min != 0 {
            return Err(SettingsError::Validation(
                "usage_timestep_min must divide 1440".into(),
            ));
        }
        if self.percent_poor_homes + self.percent_rich_homes > 100 {
            return Err(SettingsError::Validation(
                "income percentages exceed 100".into(),
            ));
        }
        Ok(())
    }
}

/// The `[Log]` section.
#[derive(Debug, Deserialize)]
pub struct LoggingSettings {
    /// A `tracing` env-filter string, e.g. `"info"` or `"anoq_node=debug"`.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

/// The parsed client-list file: every client's id and address, plus
/// (optionally) the utility's address under id `-1`.
#[derive(Debug, Clone)]
pub struct ClientList {
    addresses: HashMap<NodeId, SocketAddr>,
    num_clients: i32,
}

impl ClientList {
    /// Parses a whitespace-separated `<id> <ipv4> <port>` table and checks
    /// that the cluster size is prime and the ids are dense.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let error = |reason: &dyn fmt::Display| SettingsError::ClientList {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };
        let contents = fs::read_to_string(path).map_err(|e| error(&e))?;
        Self::parse(&contents).map_err(|e| match e {
            SettingsError::ClientList { reason, .. } => error(&reason),
            other => other,
        })
    }

    /// Parses the client-list table from a string (see [`load`](Self::load)).
    pub fn parse(contents: &str) -> Result<Self, SettingsError> {
        let error = |reason: String| SettingsError::ClientList {
            path: String::new(),
            reason,
        };
        let mut addresses = HashMap::new();
        for (line_number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(id), Some(ip), Some(port)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(error(format!("line {}: expected 3 fields", line_number + 1)));
            };
            let id: NodeId = id
                .parse()
                .map_err(|_| error(format!("line {}: bad id", line_number + 1)))?;
            let address: SocketAddr = format!("{}:{}", ip, port)
                .parse()
                .map_err(|_| error(format!("line {}: bad address", line_number + 1)))?;
            if addresses.insert(id, address).is_some() {
                return Err(error(format!("duplicate id {}", id)));
            }
        }

        let num_clients = addresses.keys().filter(|id| **id >= 0).count() as i32;
        if !is_prime(num_clients) {
            return Err(SettingsError::NonPrimeClusterSize(num_clients));
        }
        for id in 0..num_clients {
            if !addresses.contains_key(&id) {
                return Err(error(format!("client ids are not dense: {} missing", id)));
            }
        }
        Ok(Self {
            addresses,
            num_clients,
        })
    }

    pub fn num_clients(&self) -> i32 {
        self.num_clients
    }

    /// The address table, with the utility's address filled in from the
    /// given port if the list did not carry a `-1` row (the server is then
    /// assumed to run on the local host).
    pub fn addresses_with_utility(&self, server_port: u16) -> HashMap<NodeId, SocketAddr> {
        let mut addresses = self.addresses.clone();
        addresses
            .entry(UTILITY_NODE_ID)
            .or_insert_with(|| SocketAddr::from(([127, 0, 0, 1], server_port)));
        addresses
    }

    pub fn address_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.addresses.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "\
        0 127.0.0.1 9000\n\
        1 127.0.0.1 9001\n\
        2 127.0.0.1 9002\n";

    #[test]
    fn parses_a_client_list() {
        let list = ClientList::parse(LIST).unwrap();
        assert_eq!(list.num_clients(), 3);
        assert_eq!(
            list.address_of(1),
            Some(SocketAddr::from(([127, 0, 0, 1], 9001)))
        );
    }

    #[test]
    fn non_prime_cluster_is_rejected() {
        let four = format!("{}3 127.0.0.1 9003\n", LIST);
        assert!(matches!(
            ClientList::parse(&four),
            Err(SettingsError::NonPrimeClusterSize(4))
        ));
    }

    #[test]
    fn utility_row_is_not_counted() {
        let with_utility = format!("{}-1 10.0.0.9 8000\n", LIST);
        let list = ClientList::parse(&with_utility).unwrap();
        assert_eq!(list.num_clients(), 3);
        assert_eq!(
            list.addresses_with_utility(8000)[&UTILITY_NODE_ID],
            SocketAddr::from(([10, 0, 0, 9], 8000))
        );
    }

    #[test]
    fn missing_utility_row_defaults_to_localhost() {
        let list = ClientList::parse(LIST).unwrap();
        assert_eq!(
            list.addresses_with_utility(8000)[&UTILITY_NODE_ID],
            SocketAddr::from(([127, 0, 0, 1], 8000))
        );
    }

    #[test]
    fn sparse_ids_are_rejected() {
        let sparse = "0 127.0.0.1 9000\n4 127.0.0.1 9004\n";
        assert!(ClientList::parse(sparse).is_err());
    }

    #[test]
    fn key_paths_cover_all_clients_and_the_utility() {
        let setup = SetupSettings {
            client_id: Some(0),
            client_port: 9000,
            server_port: 8000,
            private_key_file: "me.pem".into(),
            server_key_file: "server.pem".into(),
            client_list_file: "clients.list".into(),
            client_keys_folder: "keys".into(),
            client_key_file_prefix: "client_".into(),
        };
        let paths = setup.key_paths(3);
        assert_eq!(paths.len(), 4);
        assert_eq!(paths[&2], PathBuf::from("keys/client_2.pem"));
        assert_eq!(paths[&UTILITY_NODE_ID], PathBuf::from("server.pem"));
    }
}
