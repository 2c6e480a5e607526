//! FreeRADIUS process supervision.
//!
//! A [`Supervisor`] owns one immutable [`RadiusConfig`]: it renders the configuration
//! tree for it, opens the log file and runs a single `radiusd` child.
//!
//! ```text
//! Unconfigured --configure--> Configured --start--> Running --stop--> Stopped
//! ```

pub mod assets;
pub mod materialize;
pub mod process;
pub mod system;

use crate::config::RadiusConfig;
use materialize::{Materializer, RenderedTree};
use process::RadiusProcess;
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// How long radiusd gets to exit after SIGTERM.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const LOG_FILE_MODE: u32 = 0o640;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot write {}: {source}", .path.display())]
    Materialize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot render {name}: {reason}")]
    Render { name: String, reason: String },

    #[error("cannot change ownership of {}: {source}", .path.display())]
    Ownership {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("cannot open log file {}: {source}", .path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot start {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot stop radiusd (pid {pid}): {source}")]
    Terminate {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Supervises one radiusd built from one configuration.
#[derive(Debug)]
pub struct Supervisor {
    config: Arc<RadiusConfig>,
    materializer: Materializer,
    tree: Option<RenderedTree>,
    log_file: Option<File>,
    process: Option<RadiusProcess>,
    grace: Duration,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: Arc<RadiusConfig>) -> Self {
        Self::with_materializer(config, Materializer::default())
    }

    #[must_use]
    pub fn with_materializer(config: Arc<RadiusConfig>, materializer: Materializer) -> Self {
        Self {
            config,
            materializer,
            tree: None,
            log_file: None,
            process: None,
            grace: TERMINATE_GRACE,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<RadiusConfig> {
        &self.config
    }

    /// Render the configuration tree and open the log file.
    ///
    /// The log file is opened once and kept across restarts.
    ///
    /// # Errors
    /// Returns an error if the tree cannot be rendered or the log file cannot be opened.
    #[instrument(skip(self), fields(root = %self.config.configuration_base().display()))]
    pub async fn configure(&mut self) -> Result<(), Error> {
        let materializer = self.materializer.clone();
        let config = Arc::clone(&self.config);

        let tree = tokio::task::spawn_blocking(move || materializer.materialize(&config))
            .await
            .map_err(|e| Error::Materialize {
                path: self.config.configuration_base(),
                source: io::Error::other(e),
            })??;

        // recorded only once the log file is open
        if let Err(e) = self.open_log_file() {
            if self.config.clean_on_stop {
                if let Err(remove) = tree.remove() {
                    warn!("Failed to remove {}: {}", tree.root().display(), remove);
                }
            }
            return Err(e);
        }

        self.tree = Some(tree);

        debug!("radius configured");

        Ok(())
    }

    fn open_log_file(&mut self) -> Result<(), Error> {
        if self.log_file.is_some() {
            return Ok(());
        }

        if let Some(path) = &self.config.log_file {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .mode(LOG_FILE_MODE)
                .open(path)
                .map_err(|source| Error::LogFile {
                    path: path.clone(),
                    source,
                })?;
            self.log_file = Some(file);
        }

        Ok(())
    }

    /// Start radiusd, restarting it when already running.
    ///
    /// An unconfigured supervisor is configured first.
    ///
    /// # Errors
    /// Returns an error if configuring, stopping the previous process or spawning fails.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.tree.is_none() {
            self.configure().await?;
        }

        if let Some(process) = self.process.take() {
            debug!(pid = process.id(), "restarting radiusd");
            process.terminate(self.grace).await?;
        }

        self.process = Some(RadiusProcess::spawn(
            &self.config,
            self.log_file.as_ref(),
        )?);

        Ok(())
    }

    /// Stop radiusd, close the log file and remove the tree when `clean_on_stop`.
    ///
    /// Stopping a supervisor that never started, or stopping twice, does nothing.
    ///
    /// # Errors
    /// Returns an error if the process cannot be terminated. The supervisor is
    /// stopped either way.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), Error> {
        self.shutdown(self.config.clean_on_stop).await
    }

    /// Like [`Supervisor::stop`] but leaves the rendered tree in place, for when a
    /// replacement instance takes over the run directory.
    ///
    /// # Errors
    /// Returns an error if the process cannot be terminated.
    #[instrument(skip(self))]
    pub async fn stop_retaining_tree(&mut self) -> Result<(), Error> {
        self.shutdown(false).await
    }

    async fn shutdown(&mut self, remove_tree: bool) -> Result<(), Error> {
        let result = match self.process.take() {
            Some(process) => process.terminate(self.grace).await,
            None => Ok(()),
        };

        self.log_file = None;

        if let Some(tree) = self.tree.take() {
            if remove_tree {
                if let Err(e) = tree.remove() {
                    warn!("Failed to remove {}: {}", tree.root().display(), e);
                }
            }
        }

        result
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(RadiusProcess::id)
    }

    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(RadiusProcess::is_running)
    }

    #[cfg(test)]
    pub(crate) fn set_grace(&mut self, grace: Duration) {
        self.grace = grace;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::radius::system::SystemDefaults;
    use anyhow::Result;
    use secrecy::SecretString;
    use std::{fs, net::Ipv4Addr, os::unix::fs::PermissionsExt, path::Path};
    use uuid::Uuid;

    /// A shell script standing in for radiusd plus a run directory with seeded DH
    /// parameters.
    pub(crate) fn fixture() -> Result<(PathBuf, RadiusConfig)> {
        let dir = std::env::temp_dir().join(format!("radrotor-supervisor-{}", Uuid::new_v4()));
        let tls = dir.join("radius").join("tls");
        fs::create_dir_all(&tls)?;
        fs::write(tls.join("dhparam.pem"), "seeded")?;

        let binary = dir.join("radiusd");
        fs::write(&binary, "#!/bin/sh\nexec sleep 60\n")?;
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755))?;

        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;

        let config = RadiusConfig {
            binary,
            run_directory: dir.clone(),
            stay_root: true,
            secret: SecretString::from("testing123".to_string()),
            certificate: generated.cert.pem(),
            key: SecretString::from(generated.key_pair.serialize_pem()),
            interface: "lo".to_string(),
            interface_net: "127.0.0.0/8".to_string(),
            interface_ip: Some(Ipv4Addr::LOCALHOST),
            api_host: "127.0.0.1".to_string(),
            api_port: 8812,
            api_token: SecretString::from("api-token".to_string()),
            ..RadiusConfig::default()
        };

        Ok((dir, config))
    }

    pub(crate) fn supervisor(config: RadiusConfig) -> Supervisor {
        let mut supervisor = Supervisor::with_materializer(
            Arc::new(config),
            Materializer::new(Arc::new(assets::EmbeddedAssets), SystemDefaults::new(vec![])),
        );
        supervisor.set_grace(Duration::from_secs(2));
        supervisor
    }

    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn lifecycle() -> Result<()> {
        let (dir, config) = fixture()?;
        let mut supervisor = supervisor(config);

        supervisor.configure().await?;
        assert!(dir.join("radius/radiusd.conf").exists());
        assert!(supervisor.pid().is_none());

        supervisor.start().await?;
        let first = supervisor.pid();
        assert!(first.is_some());
        assert!(supervisor.is_running());

        // restart
        supervisor.start().await?;
        assert!(supervisor.pid().is_some());
        assert_ne!(supervisor.pid(), first);

        supervisor.stop().await?;
        assert!(supervisor.pid().is_none());
        assert!(!supervisor.is_running());
        assert!(dir.join("radius").exists());

        cleanup(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_cleans() -> Result<()> {
        let (dir, mut config) = fixture()?;
        config.clean_on_stop = true;
        let mut supervisor = supervisor(config);

        // never started
        supervisor.stop().await?;

        supervisor.start().await?;
        supervisor.stop().await?;
        assert!(!dir.join("radius").exists());

        fs::create_dir_all(dir.join("radius"))?;
        supervisor.stop().await?;
        assert!(dir.join("radius").exists());

        cleanup(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn stop_retaining_tree_keeps_files() -> Result<()> {
        let (dir, mut config) = fixture()?;
        config.clean_on_stop = true;
        let mut supervisor = supervisor(config);

        supervisor.start().await?;
        supervisor.stop_retaining_tree().await?;
        assert!(supervisor.pid().is_none());
        assert!(dir.join("radius/radiusd.conf").exists());

        cleanup(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_process() -> Result<()> {
        let (dir, mut config) = fixture()?;
        config.binary = dir.join("missing-radiusd");
        let mut supervisor = supervisor(config);

        assert!(matches!(
            supervisor.start().await,
            Err(Error::Spawn { .. })
        ));
        assert!(supervisor.pid().is_none());
        supervisor.stop().await?;

        cleanup(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn log_file_failure_aborts_configure() -> Result<()> {
        let (dir, mut config) = fixture()?;
        config.log_file = Some(dir.join("missing").join("radiusd.log"));
        let mut supervisor = supervisor(config);

        assert!(matches!(
            supervisor.start().await,
            Err(Error::LogFile { .. })
        ));
        assert!(supervisor.pid().is_none());

        cleanup(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn log_file_failure_is_retried_on_start() -> Result<()> {
        let (dir, mut config) = fixture()?;
        let log = dir.join("missing").join("radiusd.log");
        config.log_file = Some(log.clone());
        let mut supervisor = supervisor(config);

        assert!(matches!(
            supervisor.configure().await,
            Err(Error::LogFile { .. })
        ));
        assert!(matches!(
            supervisor.start().await,
            Err(Error::LogFile { .. })
        ));
        assert!(supervisor.pid().is_none());

        fs::create_dir_all(dir.join("missing"))?;
        supervisor.start().await?;
        assert!(supervisor.pid().is_some());
        assert!(log.exists());
        supervisor.stop().await?;

        cleanup(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn log_file_failure_removes_tree_when_cleaning() -> Result<()> {
        let (dir, mut config) = fixture()?;
        config.clean_on_stop = true;
        config.log_file = Some(dir.join("missing").join("radiusd.log"));
        let mut supervisor = supervisor(config);

        assert!(supervisor.configure().await.is_err());
        assert!(!dir.join("radius").exists());

        cleanup(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn log_file_is_created() -> Result<()> {
        let (dir, mut config) = fixture()?;
        let log = dir.join("radiusd.log");
        config.log_file = Some(log.clone());
        let mut supervisor = supervisor(config);

        supervisor.start().await?;
        assert_eq!(
            fs::metadata(&log)?.permissions().mode() & 0o777,
            LOG_FILE_MODE
        );
        supervisor.stop().await?;

        cleanup(&dir);
        Ok(())
    }
}
