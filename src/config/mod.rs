//! Daemon configuration.
//!
//! Loaded from a YAML file, then [`DaemonConfig::check`] fills defaults, resolves
//! network interfaces and inlines PEM material given as file paths.

pub mod interface;

use crate::radius::system;
use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::{
    env, fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "/usr/local/etc/radrotor.yml";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(240 * 3600);

const PEM_MARKER: &str = "-----BEGIN ";

fn secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

fn humantime_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn optional_humantime_duration<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
        .transpose()
}

/// Top level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub api: ApiConfig,
    pub client: ClientConfig,
    pub radius: RadiusConfig,
    pub fetcher: Option<FetcherConfig>,
}

impl DaemonConfig {
    /// Read and parse a YAML configuration file.
    ///
    /// # Errors
    /// Returns an error if the file is missing or is not valid YAML for this schema.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("configuration file {} does not exist", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("invalid configuration file {}", path.display()))
    }

    /// # Errors
    /// Returns an error if `content` is not valid YAML for this schema.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Fill defaults and validate every section.
    ///
    /// # Errors
    /// Returns the first validation failure.
    pub fn check(&mut self) -> Result<()> {
        self.api.check().context("api")?;

        if self.radius.api_host.is_empty() {
            self.radius.api_host = self.api.ip_address.to_string();
        }
        if self.radius.api_port == 0 {
            self.radius.api_port = self.api.port;
        }
        if self.radius.api_token.expose_secret().is_empty() {
            self.radius.api_token = self.api.token.clone();
        }

        self.radius.check().context("radius")?;

        if self.client.token.expose_secret().is_empty() {
            let token = bcrypt::hash(self.radius.secret.expose_secret(), 4)
                .context("cannot compute client token from radius secret")?;
            self.client.token = SecretString::from(token);
        }

        self.client.check().context("client")?;

        if let Some(fetcher) = self.fetcher.as_mut() {
            fetcher.check().context("fetcher")?;
        }

        debug!("configuration checked");

        Ok(())
    }
}

/// Local authorization API the RADIUS `rest` module talks to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub interface: String,
    #[serde(skip)]
    pub ip_address: Ipv4Addr,
    pub port: u16,
    #[serde(deserialize_with = "secret")]
    pub token: SecretString,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            ip_address: Ipv4Addr::LOCALHOST,
            port: 8812,
            token: SecretString::default(),
        }
    }
}

impl ApiConfig {
    fn check(&mut self) -> Result<()> {
        if self.interface.is_empty() {
            self.interface = interface::LOOPBACK_INTERFACE.to_string();
        }

        self.ip_address = interface::resolve(&self.interface)?.ip;

        if self.token.expose_secret().is_empty() {
            let bytes: [u8; 16] = rand::thread_rng().gen();
            let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            self.token = SecretString::from(token);
        }

        Ok(())
    }
}

/// Upstream API client, used to fetch renewed certificates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: String,
    pub api_version: u16,
    #[serde(deserialize_with = "secret")]
    pub token: SecretString,
    pub ca: String,
    pub certificate: String,
    #[serde(deserialize_with = "secret")]
    pub key: SecretString,
    pub source_interface: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            api_version: 1,
            token: SecretString::default(),
            ca: String::new(),
            certificate: String::new(),
            key: SecretString::default(),
            source_interface: None,
        }
    }
}

impl ClientConfig {
    fn check(&mut self) -> Result<()> {
        if self.server.is_empty() {
            bail!("authenticator server URL is mandatory");
        }

        Url::parse(&self.server).with_context(|| format!("invalid server URL {}", self.server))?;

        self.ca = pem_or_file(&self.ca, "ca")?;
        self.certificate = pem_or_file(&self.certificate, "certificate")?;
        self.key = SecretString::from(pem_or_file(self.key.expose_secret(), "key")?);

        Ok(())
    }
}

/// Certificate updater settings. When absent, radiusd runs with the configured
/// certificate and is never rotated.
#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    #[serde(
        default = "default_interval",
        deserialize_with = "humantime_duration"
    )]
    pub interval: Duration,
    #[serde(default)]
    pub cache: PathBuf,
    #[serde(default, deserialize_with = "optional_humantime_duration")]
    pub fetch_timeout: Option<Duration>,
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

impl FetcherConfig {
    fn check(&self) -> Result<()> {
        if self.cache.as_os_str().is_empty() {
            bail!("cache directory is mandatory");
        }
        if self.interval.is_zero() {
            bail!("interval must be greater than zero");
        }
        Ok(())
    }
}

/// Everything needed to run one radiusd instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RadiusConfig {
    /// Path to the FreeRADIUS binary
    pub binary: PathBuf,
    /// Launch with `-xx` instead of `-x`
    pub debug: bool,
    /// radiusd stdout goes here when set
    pub log_file: Option<PathBuf>,
    pub interface: String,
    #[serde(skip)]
    pub interface_net: String,
    #[serde(skip)]
    pub interface_ip: Option<Ipv4Addr>,
    pub port: u16,
    /// Base directory, the tree is rendered under `<run_directory>/radius`
    pub run_directory: PathBuf,
    pub clean_on_stop: bool,
    pub stay_root: bool,
    #[serde(deserialize_with = "secret")]
    pub secret: SecretString,
    pub ca: String,
    pub enable_auto_chain: bool,
    pub no_bundle: bool,
    pub certificate: String,
    #[serde(deserialize_with = "secret")]
    pub key: SecretString,
    #[serde(deserialize_with = "secret")]
    pub api_token: SecretString,
    pub api_host: String,
    pub api_port: u16,
    pub enable_admin: bool,
    pub client_net: Option<String>,
    /// Maximum time in seconds to handle a request (5 to 120)
    pub max_request_time: u8,
    /// Seconds to wait before cleaning up a reply (2 to 10)
    pub cleanup_delay: u8,
    /// Requests tracked by the server, 256 per client
    pub max_requests: u64,
    pub log_auth: bool,
    pub start_servers: u16,
    pub max_servers: u16,
    pub min_spare_servers: u16,
    pub max_spare_servers: u16,
    pub max_queue_size: u32,
}

impl Default for RadiusConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::new(),
            debug: false,
            log_file: None,
            interface: String::new(),
            interface_net: String::new(),
            interface_ip: None,
            port: 1812,
            run_directory: PathBuf::new(),
            clean_on_stop: false,
            stay_root: false,
            secret: SecretString::default(),
            ca: String::new(),
            enable_auto_chain: false,
            no_bundle: false,
            certificate: String::new(),
            key: SecretString::default(),
            api_token: SecretString::default(),
            api_host: String::new(),
            api_port: 0,
            enable_admin: false,
            client_net: None,
            max_request_time: 30,
            cleanup_delay: 5,
            max_requests: 16384,
            log_auth: false,
            start_servers: 5,
            max_servers: 32,
            min_spare_servers: 3,
            max_spare_servers: 10,
            max_queue_size: 65536,
        }
    }
}

impl RadiusConfig {
    /// Root of the rendered configuration tree.
    #[must_use]
    pub fn configuration_base(&self) -> PathBuf {
        self.run_directory.join("radius")
    }

    /// Fill defaults and validate.
    ///
    /// # Errors
    /// Returns an error if the binary is missing, the secret is empty outside of admin
    /// mode, the interface has no IPv4 address or TLS material cannot be loaded.
    pub fn check(&mut self) -> Result<()> {
        if self.binary.as_os_str().is_empty() {
            self.binary = find_in_path(system::BINARY_NAME)
                .ok_or_else(|| anyhow!("{} not found in PATH", system::BINARY_NAME))?;
        }
        if !self.binary.is_file() {
            bail!(
                "freeradius binary {} does not exist",
                self.binary.display()
            );
        }

        if self.secret.expose_secret().is_empty() && !self.enable_admin {
            bail!("radius secret is mandatory");
        }

        if self.run_directory.as_os_str().is_empty() {
            self.run_directory = PathBuf::from(system::RUN_DIRECTORY);
        }

        if self.interface.is_empty() {
            self.interface = interface::LOOPBACK_INTERFACE.to_string();
        }
        let address = interface::resolve(&self.interface)?;
        self.interface_net = address.network();
        self.interface_ip = Some(address.ip);

        if let Some(net) = &self.client_net {
            interface::validate_cidr(net)?;
        }

        self.ca = pem_or_file(&self.ca, "ca")?;
        self.certificate = pem_or_file(&self.certificate, "certificate")?;
        self.key = SecretString::from(pem_or_file(self.key.expose_secret(), "key")?);

        if self.certificate.is_empty() || self.key.expose_secret().is_empty() {
            info!("no certificate configured, generating a self-signed one");
            let (certificate, key) = self_signed(address.ip)?;
            self.certificate = certificate;
            self.key = key;
        }

        Ok(())
    }
}

/// Inline PEM content is kept as is, anything else is read as a file path.
fn pem_or_file(value: &str, what: &str) -> Result<String> {
    if value.is_empty() || value.contains(PEM_MARKER) {
        return Ok(value.to_string());
    }

    let path = Path::new(value);
    if !path.is_file() {
        bail!("{what} is not a PEM string nor a valid file");
    }

    fs::read_to_string(path).with_context(|| format!("cannot read {what} file {value}"))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn self_signed(ip: Ipv4Addr) -> Result<(String, SecretString)> {
    let generated = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        ip.to_string(),
    ])
    .context("cannot generate self-signed certificate for the RADIUS server")?;

    Ok((
        generated.cert.pem(),
        SecretString::from(generated.key_pair.serialize_pem()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const MINIMAL: &str = r"
client:
  server: https://auth.example.org
radius:
  binary: /bin/sh
  secret: testing123
";

    fn temp_dir(label: &str) -> Result<PathBuf> {
        let dir = env::temp_dir().join(format!("radrotor-config-{label}-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn parse_applies_defaults() -> Result<()> {
        let config = DaemonConfig::parse(MINIMAL)?;

        assert_eq!(config.radius.port, 1812);
        assert_eq!(config.radius.max_request_time, 30);
        assert_eq!(config.radius.cleanup_delay, 5);
        assert_eq!(config.radius.max_requests, 16384);
        assert_eq!(config.radius.start_servers, 5);
        assert_eq!(config.radius.max_servers, 32);
        assert_eq!(config.radius.min_spare_servers, 3);
        assert_eq!(config.radius.max_spare_servers, 10);
        assert_eq!(config.radius.max_queue_size, 65536);
        assert_eq!(config.client.api_version, 1);
        assert_eq!(config.api.port, 8812);
        assert!(config.fetcher.is_none());
        Ok(())
    }

    #[test]
    fn parse_fetcher_interval() -> Result<()> {
        let config = DaemonConfig::parse(
            "fetcher:\n  cache: /var/cache/radrotor\n  interval: 12h\n  fetch_timeout: 30s\n",
        )?;
        let fetcher = config.fetcher.ok_or_else(|| anyhow!("missing fetcher"))?;
        assert_eq!(fetcher.interval, Duration::from_secs(12 * 3600));
        assert_eq!(fetcher.fetch_timeout, Some(Duration::from_secs(30)));

        let config = DaemonConfig::parse("fetcher:\n  cache: /var/cache/radrotor\n")?;
        let fetcher = config.fetcher.ok_or_else(|| anyhow!("missing fetcher"))?;
        assert_eq!(fetcher.interval, DEFAULT_INTERVAL);
        assert_eq!(fetcher.fetch_timeout, None);
        Ok(())
    }

    #[test]
    fn parse_rejects_bad_interval() {
        assert!(DaemonConfig::parse("fetcher:\n  cache: /tmp\n  interval: soon\n").is_err());
    }

    #[test]
    fn check_fills_derived_values() -> Result<()> {
        let mut config = DaemonConfig::parse(MINIMAL)?;
        config.check()?;

        assert_eq!(config.radius.interface, interface::LOOPBACK_INTERFACE);
        assert!(config.radius.interface_ip.is_some_and(|ip| ip.is_loopback()));
        assert!(config.radius.interface_net.ends_with("/8"));
        assert_eq!(config.radius.run_directory, PathBuf::from(system::RUN_DIRECTORY));
        assert_eq!(config.radius.api_port, 8812);
        assert_eq!(config.radius.api_host, config.api.ip_address.to_string());
        assert_eq!(config.api.token.expose_secret().len(), 32);
        assert_eq!(
            config.radius.api_token.expose_secret(),
            config.api.token.expose_secret()
        );

        // self-signed material generated
        assert!(config.radius.certificate.contains("BEGIN CERTIFICATE"));
        assert!(config.radius.key.expose_secret().contains("PRIVATE KEY"));

        // client token derived from the radius secret
        assert!(bcrypt::verify("testing123", config.client.token.expose_secret())?);
        Ok(())
    }

    #[test]
    fn check_requires_secret_unless_admin() -> Result<()> {
        let mut config = RadiusConfig {
            binary: PathBuf::from("/bin/sh"),
            ..RadiusConfig::default()
        };
        assert!(config.check().is_err());

        config.enable_admin = true;
        config.check()?;
        Ok(())
    }

    #[test]
    fn check_rejects_missing_binary() {
        let mut config = RadiusConfig {
            binary: PathBuf::from("/nonexistent/radiusd"),
            secret: SecretString::from("s".to_string()),
            ..RadiusConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn check_rejects_invalid_client_net() {
        let mut config = RadiusConfig {
            binary: PathBuf::from("/bin/sh"),
            secret: SecretString::from("s".to_string()),
            client_net: Some("10.0.0.0".to_string()),
            ..RadiusConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn check_reads_pem_from_files() -> Result<()> {
        let dir = temp_dir("pem")?;
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        fs::write(&cert_path, generated.cert.pem())?;
        fs::write(&key_path, generated.key_pair.serialize_pem())?;

        let mut config = RadiusConfig {
            binary: PathBuf::from("/bin/sh"),
            secret: SecretString::from("s".to_string()),
            certificate: cert_path.display().to_string(),
            key: SecretString::from(key_path.display().to_string()),
            ..RadiusConfig::default()
        };
        config.check()?;

        assert_eq!(config.certificate, generated.cert.pem());
        assert_eq!(
            config.key.expose_secret(),
            generated.key_pair.serialize_pem()
        );

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn check_rejects_unreadable_ca() {
        let mut config = RadiusConfig {
            binary: PathBuf::from("/bin/sh"),
            secret: SecretString::from("s".to_string()),
            ca: "/nonexistent/ca.pem".to_string(),
            ..RadiusConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn client_requires_server() -> Result<()> {
        let mut config = DaemonConfig::parse("radius:\n  binary: /bin/sh\n  secret: s\n")?;
        assert!(config.check().is_err());
        Ok(())
    }

    #[test]
    fn fetcher_requires_cache() -> Result<()> {
        let mut config = DaemonConfig::parse(&format!("{MINIMAL}fetcher:\n  interval: 1h\n"))?;
        assert!(config.check().is_err());
        Ok(())
    }

    #[test]
    fn load_missing_file() {
        let path = env::temp_dir().join(format!("radrotor-missing-{}.yml", Uuid::new_v4()));
        assert!(DaemonConfig::load(&path).is_err());
    }
}
