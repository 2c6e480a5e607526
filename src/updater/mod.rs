//! Certificate rotation.
//!
//! A single task owns the running [`Supervisor`] and handles refresh requests one
//! at a time. Each refresh resolves a certificate bundle from the first level of
//! the fallback chain that works:
//!
//! 1. the remote [`CertificateSource`] (the result is written to the disk cache),
//! 2. the [`DiskCache`],
//! 3. the PEM material of the configuration currently applied.
//!
//! The replacement supervisor is configured before the current one is stopped and
//! only becomes current once it has started.

pub mod cache;
pub mod certificate;
pub mod source;

use crate::{
    config::{FetcherConfig, RadiusConfig},
    radius::{
        materialize::{Materializer, RenderedTree},
        Supervisor,
    },
};
use anyhow::{anyhow, bail, Context, Result};
use cache::DiskCache;
use certificate::CertificateBundle;
use chrono::{DateTime, Utc};
use source::CertificateSource;
use std::{
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

/// Which level of the fallback chain supplied a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateOrigin {
    Remote,
    Cache,
    Embedded,
}

impl fmt::Display for CertificateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Cache => write!(f, "cache"),
            Self::Embedded => write!(f, "embedded"),
        }
    }
}

/// Snapshot of the update loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub pid: Option<u32>,
    pub running: bool,
    pub signature_date: Option<DateTime<Utc>>,
    pub fingerprint: Option<String>,
    pub origin: Option<CertificateOrigin>,
    /// Successful swaps, bootstrap included
    pub updates: u64,
    /// Refreshes that kept the running instance because nothing changed
    pub unchanged: u64,
    pub failures: u64,
    pub cache_writes: u64,
    pub manual_refreshes: u64,
    pub timer_refreshes: u64,
}

/// What started a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Manual,
    Timer,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Timer => write!(f, "timer"),
        }
    }
}

#[derive(Debug)]
enum Command {
    Refresh,
    Status(oneshot::Sender<SchedulerStatus>),
    Shutdown,
}

type CommandSender = Arc<RwLock<mpsc::UnboundedSender<Command>>>;

/// Talks to a running [`Scheduler`] loop. Handles stay valid when the scheduler
/// is stopped and started again.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: CommandSender,
}

impl SchedulerHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .read()
            .map_err(|_| anyhow!("update loop sender is poisoned"))?
            .send(command)
            .map_err(|_| anyhow!("update loop is not running"))
    }

    /// Ask for a refresh outside of the timer.
    ///
    /// # Errors
    /// Returns an error if the loop is gone.
    pub fn trigger(&self) -> Result<()> {
        self.send(Command::Refresh)
    }

    /// Requests queued before the loop starts are answered once it runs.
    ///
    /// # Errors
    /// Returns an error if the loop is gone.
    pub async fn status(&self) -> Result<SchedulerStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply))?;
        rx.await.context("update loop stopped before answering")
    }
}

#[derive(Debug, Clone)]
struct Applied {
    signature_date: Option<DateTime<Utc>>,
    fingerprint: Option<String>,
    origin: CertificateOrigin,
}

/// Everything the update loop owns.
#[derive(Debug)]
pub struct SchedulerState {
    current: Arc<RadiusConfig>,
    instance: Option<Supervisor>,
    source: Arc<dyn CertificateSource>,
    cache: DiskCache,
    materializer: Materializer,
    applied: Option<Applied>,
    updates: u64,
    unchanged: u64,
    failures: u64,
    cache_writes: u64,
    manual_refreshes: u64,
    timer_refreshes: u64,
}

impl SchedulerState {
    fn new(
        config: Arc<RadiusConfig>,
        source: Arc<dyn CertificateSource>,
        cache: DiskCache,
        materializer: Materializer,
    ) -> Self {
        Self {
            current: config,
            instance: None,
            source,
            cache,
            materializer,
            applied: None,
            updates: 0,
            unchanged: 0,
            failures: 0,
            cache_writes: 0,
            manual_refreshes: 0,
            timer_refreshes: 0,
        }
    }

    /// One refresh cycle, falling back to the local certificate when nothing is
    /// running afterwards.
    async fn refresh(&mut self, trigger: Trigger) {
        debug!(%trigger, "refreshing radius certificate");

        match trigger {
            Trigger::Manual => self.manual_refreshes += 1,
            Trigger::Timer => self.timer_refreshes += 1,
        }

        if let Err(e) = self.apply_update().await {
            self.failures += 1;
            error!("Failed to update radius certificate: {:#}", e);

            if !self.is_running() {
                if let Err(e) = self.bootstrap().await {
                    error!("Failed to start radius with local certificate: {:#}", e);
                }
            }
        }
    }

    /// Resolve a bundle through the whole fallback chain and apply it.
    ///
    /// # Errors
    /// Returns an error if no bundle is available or the swap failed.
    #[instrument(skip(self))]
    pub async fn apply_update(&mut self) -> Result<()> {
        let (bundle, origin) = match self.source.fetch_remote().await {
            Ok(bundle) => {
                match self.cache.write(&bundle) {
                    Ok(()) => self.cache_writes += 1,
                    Err(e) => error!("Failed to write certificate cache: {:#}", e),
                }
                (bundle, CertificateOrigin::Remote)
            }
            Err(e) => {
                warn!("Failed to fetch remote certificate: {:#}", e);
                self.local_certificate()?
            }
        };

        self.apply(bundle, origin).await
    }

    /// Apply the cached or embedded certificate, never calling the remote source.
    ///
    /// # Errors
    /// Returns an error if no local bundle is usable or the swap failed.
    #[instrument(skip(self))]
    pub async fn bootstrap(&mut self) -> Result<()> {
        let (bundle, origin) = self.local_certificate()?;
        self.apply(bundle, origin).await
    }

    fn local_certificate(&self) -> Result<(CertificateBundle, CertificateOrigin)> {
        match self.cache.read() {
            Ok(Some(mut bundle)) => match bundle.validate() {
                Ok(()) => return Ok((bundle, CertificateOrigin::Cache)),
                Err(e) => warn!("Ignoring cached certificate: {:#}", e),
            },
            Ok(None) => debug!("certificate cache is empty"),
            Err(e) => warn!("Failed to read certificate cache: {:#}", e),
        }

        let bundle = CertificateBundle::from_config(&self.current)
            .context("no usable certificate in cache nor in configuration")?;

        Ok((bundle, CertificateOrigin::Embedded))
    }

    async fn apply(&mut self, bundle: CertificateBundle, origin: CertificateOrigin) -> Result<()> {
        if bundle.is_applied_to(&self.current) && self.is_running() {
            self.unchanged += 1;
            info!(%origin, "certificate unchanged, keeping radiusd running");
            return Ok(());
        }

        let config = Arc::new(bundle.apply_to(&self.current));
        self.swap(Arc::clone(&config)).await?;

        self.current = config;
        self.updates += 1;
        self.applied = Some(Applied {
            signature_date: bundle.signature_date,
            fingerprint: certificate::fingerprint(&bundle.certificate).ok(),
            origin,
        });

        info!(
            %origin,
            signature_date = ?bundle.signature_date,
            pid = self.instance.as_ref().and_then(Supervisor::pid),
            "radius certificate applied"
        );

        Ok(())
    }

    /// Replace the running instance with one built from `config`.
    ///
    /// On failure the previous instance keeps (or gets back) its tree and keeps
    /// running.
    async fn swap(&mut self, config: Arc<RadiusConfig>) -> Result<()> {
        let mut next = Supervisor::with_materializer(config, self.materializer.clone());

        if let Err(e) = next.configure().await {
            self.restore_previous(false).await;
            return Err(e).context("cannot configure new radius instance");
        }

        let mut previous = self.instance.take();
        if let Some(previous) = previous.as_mut() {
            if let Err(e) = previous.stop_retaining_tree().await {
                error!("Failed to stop radiusd: {}", e);
            }
        }

        if let Err(e) = next.start().await {
            if let Err(stop) = next.stop_retaining_tree().await {
                warn!("Failed to clean up new radius instance: {}", stop);
            }
            self.instance = previous;
            self.restore_previous(true).await;
            return Err(e).context("cannot start new radius instance");
        }

        self.instance = Some(next);

        Ok(())
    }

    async fn restore_previous(&mut self, restart: bool) {
        let Some(previous) = self.instance.as_mut() else {
            return;
        };

        let restored = if restart {
            previous.start().await
        } else {
            previous.configure().await
        };

        if let Err(e) = restored {
            error!("Failed to restore previous radius instance: {}", e);
        }
    }

    fn is_running(&mut self) -> bool {
        self.instance.as_mut().is_some_and(Supervisor::is_running)
    }

    fn status(&mut self) -> SchedulerStatus {
        let running = self.is_running();
        let applied = self.applied.clone();

        SchedulerStatus {
            pid: self.instance.as_ref().and_then(Supervisor::pid),
            running,
            signature_date: applied.as_ref().and_then(|a| a.signature_date),
            fingerprint: applied.as_ref().and_then(|a| a.fingerprint.clone()),
            origin: applied.map(|a| a.origin),
            updates: self.updates,
            unchanged: self.unchanged,
            failures: self.failures,
            cache_writes: self.cache_writes,
            manual_refreshes: self.manual_refreshes,
            timer_refreshes: self.timer_refreshes,
        }
    }

    #[must_use]
    pub fn current(&self) -> &Arc<RadiusConfig> {
        &self.current
    }
}

async fn run(
    mut state: SchedulerState,
    mut rx: mpsc::UnboundedReceiver<Command>,
    period: Duration,
) -> Option<Supervisor> {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            command = rx.recv() => match command {
                Some(Command::Refresh) => state.refresh(Trigger::Manual).await,
                Some(Command::Status(reply)) => {
                    let _ = reply.send(state.status());
                }
                Some(Command::Shutdown) | None => break,
            },

            _ = ticker.tick() => state.refresh(Trigger::Timer).await,
        }
    }

    debug!("update loop stopped");

    state.instance.take()
}

/// Keeps radiusd running with the freshest certificate available.
#[derive(Debug)]
pub struct Scheduler {
    config: Arc<RadiusConfig>,
    source: Arc<dyn CertificateSource>,
    cache: DiskCache,
    interval: Duration,
    materializer: Materializer,
    tx: CommandSender,
    rx: Option<mpsc::UnboundedReceiver<Command>>,
    task: Option<JoinHandle<Option<Supervisor>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        config: Arc<RadiusConfig>,
        fetcher: &FetcherConfig,
        source: Arc<dyn CertificateSource>,
    ) -> Self {
        Self::with_materializer(config, fetcher, source, Materializer::default())
    }

    #[must_use]
    pub fn with_materializer(
        config: Arc<RadiusConfig>,
        fetcher: &FetcherConfig,
        source: Arc<dyn CertificateSource>,
        materializer: Materializer,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            config,
            source,
            cache: DiskCache::new(fetcher.cache.clone()),
            interval: fetcher.interval,
            materializer,
            tx: Arc::new(RwLock::new(tx)),
            rx: Some(rx),
            task: None,
        }
    }

    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: Arc::clone(&self.tx),
        }
    }

    /// Create the cache directory.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn configure(&self) -> Result<()> {
        self.cache.create_dir()
    }

    /// Start radiusd with the local certificate, then run the update loop with a
    /// first refresh queued ahead of the timer.
    ///
    /// # Errors
    /// Returns an error if the scheduler already ran or radiusd cannot be started
    /// with the cached or configured certificate.
    #[instrument(skip(self), fields(interval = ?self.interval))]
    pub async fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            bail!("update scheduler already started");
        }

        let rx = match self.rx.take() {
            Some(rx) => rx,
            None => self.reopen()?,
        };

        self.cache.create_dir()?;

        let mut state = SchedulerState::new(
            Arc::clone(&self.config),
            Arc::clone(&self.source),
            self.cache.clone(),
            self.materializer.clone(),
        );

        if let Err(e) = state.bootstrap().await {
            self.rx = Some(rx);
            return Err(e).context("cannot start radius with local certificate");
        }

        self.handle().trigger()?;

        self.task = Some(tokio::spawn(run(state, rx, self.interval)));

        Ok(())
    }

    /// New command channel for a scheduler started again after [`Scheduler::stop`].
    /// Existing handles are pointed at it.
    fn reopen(&mut self) -> Result<mpsc::UnboundedReceiver<Command>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .tx
            .write()
            .map_err(|_| anyhow!("update loop sender is poisoned"))? = tx;
        Ok(rx)
    }

    /// Stop the loop, waiting for an in-flight update, then stop radiusd.
    ///
    /// # Errors
    /// Returns an error if radiusd cannot be stopped.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        let _ = self.handle().send(Command::Shutdown);

        match task.await {
            Ok(Some(mut instance)) => instance.stop().await?,
            Ok(None) => {}
            Err(e) => {
                // the loop's instance was dropped with it, which killed radiusd
                error!("Failed to join update loop: {}", e);
                if self.config.clean_on_stop {
                    let tree = RenderedTree::new(self.config.configuration_base());
                    if let Err(e) = tree.remove() {
                        warn!("Failed to remove {}: {}", tree.root().display(), e);
                    }
                }
            }
        }

        info!("update scheduler stopped");

        Ok(())
    }
}
