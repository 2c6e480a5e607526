use super::Error;
use crate::config::RadiusConfig;
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{ffi::OsString, fs::File, io, process::Stdio, time::Duration};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Command line for radiusd: foreground, logging to stdout.
#[must_use]
pub fn radius_args(config: &RadiusConfig) -> Vec<OsString> {
    vec![
        OsString::from("-d"),
        config.configuration_base().into_os_string(),
        OsString::from("-f"),
        OsString::from("-l"),
        OsString::from("stdout"),
        OsString::from(if config.debug { "-xx" } else { "-x" }),
    ]
}

/// A spawned radiusd.
#[derive(Debug)]
pub struct RadiusProcess {
    child: Child,
}

impl RadiusProcess {
    /// Spawn radiusd. Stdout goes to `log_file` when the configuration names one,
    /// stderr is inherited.
    ///
    /// # Errors
    /// Returns an error if a log file is configured but not open, its handle
    /// cannot be duplicated, or the binary cannot be executed.
    pub fn spawn(config: &RadiusConfig, log_file: Option<&File>) -> Result<Self, Error> {
        let stdout = match (log_file, &config.log_file) {
            (Some(file), Some(path)) => {
                Stdio::from(file.try_clone().map_err(|source| Error::LogFile {
                    path: path.clone(),
                    source,
                })?)
            }
            (None, Some(path)) => {
                return Err(Error::LogFile {
                    path: path.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "log file is not open"),
                });
            }
            (_, None) => Stdio::inherit(),
        };

        let child = Command::new(&config.binary)
            .args(radius_args(config))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                binary: config.binary.clone(),
                source,
            })?;

        info!(pid = child.id(), binary = %config.binary.display(), "radiusd started");

        Ok(Self { child })
    }

    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Reaps the child if it already exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(%status, "radiusd exited");
                false
            }
            Err(e) => {
                warn!("Failed to poll radiusd: {}", e);
                false
            }
        }
    }

    /// SIGTERM, then SIGKILL once `grace` has elapsed.
    ///
    /// # Errors
    /// Returns an error if the process cannot be signalled or reaped.
    pub async fn terminate(mut self, grace: Duration) -> Result<(), Error> {
        let Some(pid) = self.child.id() else {
            // already reaped
            return Ok(());
        };

        let terminate = |source: io::Error| Error::Terminate { pid, source };

        if !self.is_running() {
            return Ok(());
        }

        match i32::try_from(pid) {
            Ok(raw) => match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(terminate(io::Error::from(e))),
            },
            Err(_) => {
                self.child.kill().await.map_err(terminate)?;
                return Ok(());
            }
        }

        tokio::select! {
            status = self.child.wait() => {
                let status = status.map_err(terminate)?;
                info!(pid, %status, "radiusd stopped");
            }
            () = tokio::time::sleep(grace) => {
                warn!(pid, "radiusd did not stop within {:?}, killing", grace);
                self.child.kill().await.map_err(terminate)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::{os::unix::fs::PermissionsExt, path::PathBuf};
    use uuid::Uuid;

    fn script(body: &str) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("radrotor-process-{}.sh", Uuid::new_v4()));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[test]
    fn args_follow_debug_flag() {
        let mut config = RadiusConfig {
            run_directory: PathBuf::from("/var/run"),
            ..RadiusConfig::default()
        };

        assert_eq!(
            radius_args(&config),
            ["-d", "/var/run/radius", "-f", "-l", "stdout", "-x"]
                .iter()
                .map(OsString::from)
                .collect::<Vec<_>>()
        );

        config.debug = true;
        assert_eq!(radius_args(&config).last(), Some(&OsString::from("-xx")));
    }

    #[tokio::test]
    async fn spawn_and_terminate() -> Result<()> {
        let binary = script("exec sleep 60")?;
        let config = RadiusConfig {
            binary: binary.clone(),
            ..RadiusConfig::default()
        };

        let mut process = RadiusProcess::spawn(&config, None)?;
        assert!(process.id().is_some());
        assert!(process.is_running());

        process.terminate(Duration::from_secs(5)).await?;

        std::fs::remove_file(binary)?;
        Ok(())
    }

    #[tokio::test]
    async fn terminate_kills_after_grace() -> Result<()> {
        let binary = script("trap '' TERM\nwhile true; do sleep 1; done")?;
        let config = RadiusConfig {
            binary: binary.clone(),
            ..RadiusConfig::default()
        };

        let process = RadiusProcess::spawn(&config, None)?;
        // let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        process.terminate(Duration::from_millis(200)).await?;

        std::fs::remove_file(binary)?;
        Ok(())
    }

    #[tokio::test]
    async fn spawn_missing_binary() {
        let config = RadiusConfig {
            binary: PathBuf::from("/nonexistent/radiusd"),
            ..RadiusConfig::default()
        };

        assert!(matches!(
            RadiusProcess::spawn(&config, None),
            Err(Error::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn spawn_requires_open_log_file() {
        let config = RadiusConfig {
            binary: PathBuf::from("/bin/true"),
            log_file: Some(PathBuf::from("/tmp/radiusd.log")),
            ..RadiusConfig::default()
        };

        assert!(matches!(
            RadiusProcess::spawn(&config, None),
            Err(Error::LogFile { .. })
        ));
    }

    #[tokio::test]
    async fn exited_process_is_not_running() -> Result<()> {
        let binary = script("exit 0")?;
        let config = RadiusConfig {
            binary: binary.clone(),
            ..RadiusConfig::default()
        };

        let mut process = RadiusProcess::spawn(&config, None)?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!process.is_running());
        process.terminate(Duration::from_secs(1)).await?;

        std::fs::remove_file(binary)?;
        Ok(())
    }
}
