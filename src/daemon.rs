//! Lifecycle shared by the supervised services and the signal loop driving them.

use crate::{
    config::DaemonConfig,
    radius::Supervisor,
    updater::{source::HttpCertificateSource, Scheduler, SchedulerHandle},
};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, instrument, warn};

#[async_trait]
pub trait Lifecycle: Send + std::fmt::Debug {
    /// # Errors
    /// Returns an error if the service cannot be prepared.
    async fn configure(&mut self) -> Result<()>;

    /// # Errors
    /// Returns an error if the service cannot be started.
    async fn start(&mut self) -> Result<()>;

    /// # Errors
    /// Returns an error if the service did not stop cleanly.
    async fn stop(&mut self) -> Result<()>;
}

#[async_trait]
impl Lifecycle for Supervisor {
    async fn configure(&mut self) -> Result<()> {
        Ok(Supervisor::configure(self).await?)
    }

    async fn start(&mut self) -> Result<()> {
        Ok(Supervisor::start(self).await?)
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(Supervisor::stop(self).await?)
    }
}

#[async_trait]
impl Lifecycle for Scheduler {
    async fn configure(&mut self) -> Result<()> {
        Scheduler::configure(self)
    }

    async fn start(&mut self) -> Result<()> {
        Scheduler::start(self).await
    }

    async fn stop(&mut self) -> Result<()> {
        Scheduler::stop(self).await
    }
}

/// The service run by the binary: a bare supervisor, or a rotating one when a
/// fetcher is configured.
#[derive(Debug)]
pub struct Daemon {
    service: Box<dyn Lifecycle>,
    refresh: Option<SchedulerHandle>,
}

impl Daemon {
    /// Build the service from a checked configuration.
    ///
    /// # Errors
    /// Returns an error if the certificate source cannot be built.
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        let radius = Arc::new(config.radius.clone());

        let Some(fetcher) = &config.fetcher else {
            info!("no fetcher configured, certificates will not be rotated");
            return Ok(Self {
                service: Box::new(Supervisor::new(radius)),
                refresh: None,
            });
        };

        let source = HttpCertificateSource::new(&config.client, fetcher.fetch_timeout)?;
        let scheduler = Scheduler::new(radius, fetcher, Arc::new(source));
        let refresh = scheduler.handle();

        Ok(Self {
            service: Box::new(scheduler),
            refresh: Some(refresh),
        })
    }

    #[must_use]
    pub fn from_service(service: Box<dyn Lifecycle>, refresh: Option<SchedulerHandle>) -> Self {
        Self { service, refresh }
    }

    /// Configure and start the service, then run until SIGINT or SIGTERM.
    /// SIGHUP asks for a certificate refresh.
    ///
    /// # Errors
    /// Returns an error if the service fails to configure, start or stop.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;

        self.service.configure().await?;
        self.service.start().await?;

        info!("radrotor started");

        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("SIGINT received, stopping");
                    break;
                }
                _ = terminate.recv() => {
                    info!("SIGTERM received, stopping");
                    break;
                }
                _ = hangup.recv() => match &self.refresh {
                    Some(refresh) => {
                        info!("SIGHUP received, refreshing certificate");
                        if let Err(e) = refresh.trigger() {
                            error!("Failed to trigger certificate refresh: {}", e);
                        }
                    }
                    None => warn!("SIGHUP ignored, certificate rotation is disabled"),
                },
            }
        }

        self.service.stop().await
    }
}
