use crate::models::Environment;
use crate::transport::{AddressFamily, ConnectOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FleetConfig {
    pub data_dir: PathBuf,
    pub mqtt: MqttConf,
    pub dispatch: DispatchConf,
    /// Variables globales injectées dans chaque exécution
    pub environment: Environment,
    pub registration: RegistrationConf,
    pub scheduler: SchedulerConf,
    pub reachability: ReachabilityConf,
    pub health: HealthConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConf {
    pub connect_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    pub address_family: AddressFamily,
    /// Ne pas contacter un hôte dont le dernier essai a échoué depuis moins de N s
    pub skip_unreachable_for_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RegistrationConf {
    /// Clé partagée des agents ; auto-enregistrement désactivé si absente
    pub shared_key: Option<String>,
    pub default_group: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConf {
    pub enabled: bool,
    /// Rapports conservés par planification (0 = historique complet)
    pub report_retention: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReachabilityConf {
    /// 0 = pas de sonde périodique
    pub probe_interval_secs: u64,
    pub flush_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConf {
    pub publish_interval_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            mqtt: MqttConf::default(),
            dispatch: DispatchConf::default(),
            environment: Environment::new(),
            registration: RegistrationConf::default(),
            scheduler: SchedulerConf::default(),
            reachability: ReachabilityConf::default(),
            health: HealthConf::default(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "symbion-fleet".into(),
            keep_alive_secs: 15,
        }
    }
}

impl Default for DispatchConf {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            exec_timeout_secs: 300,
            address_family: AddressFamily::Any,
            skip_unreachable_for_secs: None,
        }
    }
}

impl Default for RegistrationConf {
    fn default() -> Self {
        Self {
            shared_key: None,
            default_group: "unassigned".into(),
        }
    }
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self {
            enabled: true,
            report_retention: crate::schedules::DEFAULT_REPORT_RETENTION,
        }
    }
}

impl Default for ReachabilityConf {
    fn default() -> Self {
        Self {
            probe_interval_secs: 120,
            flush_interval_secs: 60,
        }
    }
}

impl Default for HealthConf {
    fn default() -> Self {
        Self {
            publish_interval_secs: 30,
        }
    }
}

impl DispatchConf {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            timeout: Duration::from_secs(self.connect_timeout_secs),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            family: self.address_family,
        }
    }

    pub fn skip_unreachable_for(&self) -> Option<Duration> {
        self.skip_unreachable_for_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

impl FleetConfig {
    /// Surcharges par variables d'environnement (après lecture du fichier)
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("SYMBION_REGISTRATION_KEY") {
            if !key.is_empty() {
                self.registration.shared_key = Some(key);
            }
        }
    }
}

/// Lit `fleet.yaml` (ou `SYMBION_FLEET_CONFIG`) ; défauts si absent
pub async fn load_config() -> Result<FleetConfig, ConfigError> {
    let path = std::env::var("SYMBION_FLEET_CONFIG").unwrap_or_else(|_| "fleet.yaml".into());
    let mut cfg = load_config_from(&path).await?;
    cfg.apply_env();
    Ok(cfg)
}

pub async fn load_config_from<P: AsRef<Path>>(path: P) -> Result<FleetConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(?path, "no fleet config file, using defaults");
        return Ok(FleetConfig::default());
    }
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if txt.trim().is_empty() {
        return Ok(FleetConfig::default());
    }
    serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
