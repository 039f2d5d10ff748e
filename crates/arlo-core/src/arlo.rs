// ── Arlo entry point ──
//
// Connects, enumerates devices, starts the push channel and the refresh
// jobs, then (optionally) waits for the first full refresh pass. Jobs hold
// only a weak reference, so dropping every `Arlo` handle lets the runtime
// wind down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use arlo_api::{ConsoleTwoFactor, Packet, StreamStats, TwoFactorSource};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::barrier::StartupBarrier;
use crate::config::{ArloConfig, TfaSource};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{CoreError, LastError, TaskError};
use crate::registry::{Device, DeviceEvent, DeviceKind, DeviceRegistry};
use crate::scheduler::TaskScheduler;
use crate::store::StateStore;

/// Key under which account-level attributes are stored.
pub const ACCOUNT_KEY: &str = "ARLO";

/// A connected account: its devices, their state, and the background
/// work keeping that state current.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct Arlo {
    inner: Arc<ArloInner>,
}

struct ArloInner {
    config: ArloConfig,
    store: Arc<StateStore>,
    registry: Arc<DeviceRegistry>,
    connection: Arc<ConnectionManager>,
    scheduler: TaskScheduler,
    barrier: StartupBarrier,
    errors: LastError,
    /// Next device re-enumeration, when enabled.
    next_device_refresh: Mutex<Option<Instant>>,
    stopped: AtomicBool,
}

impl Arlo {
    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect using the two-factor source named in the config.
    pub async fn connect(config: ArloConfig) -> Result<Self, CoreError> {
        Self::connect_with_source(config, None).await
    }

    /// Connect with an explicit two-factor source. Required when the
    /// config names a mailbox source.
    pub async fn connect_with_source(
        config: ArloConfig,
        source: Option<Arc<dyn TwoFactorSource>>,
    ) -> Result<Self, CoreError> {
        let source: Arc<dyn TwoFactorSource> = match (source, config.tfa.source) {
            (Some(source), _) => source,
            (None, TfaSource::Console) => Arc::new(ConsoleTwoFactor),
            (None, TfaSource::Mailbox) => {
                return Err(CoreError::Config {
                    message: "mailbox two-factor source selected but no mailbox supplied".into(),
                });
            }
        };

        let errors = LastError::default();
        let store = Arc::new(StateStore::new(
            config.save_state.then(|| config.state_file()),
        ));
        if let Err(e) = store.load() {
            warn!(error = %e, "saved state ignored");
            errors.record(&e);
        }

        let connection = Arc::new(ConnectionManager::new(&config, source, errors.clone())?);
        let scheduler = TaskScheduler::new(config.workers, errors.clone());
        let registry = Arc::new(DeviceRegistry::new(Arc::clone(&store)));
        let next_device_refresh = config
            .device_refresh_interval()
            .map(|every| Instant::now() + every);

        let arlo = Self {
            inner: Arc::new(ArloInner {
                config,
                store,
                registry,
                connection,
                scheduler,
                barrier: StartupBarrier::new(),
                errors,
                next_device_refresh: Mutex::new(next_device_refresh),
                stopped: AtomicBool::new(false),
            }),
        };

        if let Err(e) = arlo.start().await {
            warn!(error = %e, "startup failed");
            if let Err(stop_err) = arlo.stop().await {
                debug!(error = %stop_err, "cleanup after failed startup");
            }
            return Err(e);
        }
        Ok(arlo)
    }

    async fn start(&self) -> Result<(), CoreError> {
        let inner = &self.inner;

        inner.connection.login().await?;
        inner
            .connection
            .start_stream(Arc::clone(&inner.registry))
            .await;

        let added = inner.enumerate().await?;
        info!(devices = added, "devices enumerated");
        inner
            .store
            .set(&[ACCOUNT_KEY, "libraryDays"], inner.config.library_days);

        if let Err(e) = inner.ping_bases().await {
            warn!(error = %e, "initial ping failed");
        }

        self.schedule_jobs();

        if inner.config.wait_for_initial_setup {
            self.wait_for_initial_setup().await?;
        }
        Ok(())
    }

    fn schedule_jobs(&self) {
        let weak = Arc::downgrade(&self.inner);
        let timings = &self.inner.config.timings;
        let sched = &self.inner.scheduler;

        debug!("getting initial settings");
        sched.run_after(
            "initial-refresh",
            timings.initial_delay,
            job(&weak, ArloInner::initial_refresh),
        );

        debug!("registering refresh jobs");
        sched.run_every(
            "fast-refresh",
            timings.fast_interval,
            job(&weak, ArloInner::fast_refresh),
        );
        sched.run_every(
            "slow-refresh",
            timings.slow_interval,
            job(&weak, ArloInner::slow_refresh),
        );
    }

    /// Block until the initial refresh pass has completed, bounded by
    /// `initial_setup_timeout`.
    pub async fn wait_for_initial_setup(&self) -> Result<(), CoreError> {
        self.inner
            .barrier
            .wait(self.inner.config.initial_setup_bound())
            .await
    }

    /// Whether the initial refresh pass has completed.
    pub fn is_started(&self) -> bool {
        self.inner.barrier.is_released()
    }

    /// Save state, stop background work and log out. Later calls do nothing.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("stopping");

        if let Err(e) = inner.store.save() {
            warn!(error = %e, "final state save failed");
            inner.errors.record(&e);
        }
        inner.scheduler.shutdown();
        let logout = inner.connection.logout().await;
        inner.scheduler.join().await;
        logout
    }

    // ── Test entry point ─────────────────────────────────────────────

    /// Feed a synthetic push packet to the dispatcher. Returns how many
    /// devices received it.
    pub fn inject_packet(&self, packet: Value) -> Result<usize, CoreError> {
        let packet: Packet = serde_json::from_value(packet).map_err(|e| CoreError::Stream {
            message: format!("malformed packet: {e}"),
        })?;
        Ok(self.inner.registry.dispatch(&packet))
    }

    // ── Devices ──────────────────────────────────────────────────────

    pub fn cameras(&self) -> Vec<Arc<Device>> {
        self.inner.registry.of_kind(DeviceKind::Camera)
    }

    pub fn doorbells(&self) -> Vec<Arc<Device>> {
        self.inner.registry.of_kind(DeviceKind::Doorbell)
    }

    pub fn lights(&self) -> Vec<Arc<Device>> {
        self.inner.registry.of_kind(DeviceKind::Light)
    }

    pub fn base_stations(&self) -> Vec<Arc<Device>> {
        self.inner.registry.of_kind(DeviceKind::BaseStation)
    }

    pub fn lookup_camera_by_id(&self, id: &str) -> Option<Arc<Device>> {
        self.inner.registry.get(id, DeviceKind::Camera)
    }

    pub fn lookup_camera_by_name(&self, name: &str) -> Option<Arc<Device>> {
        self.inner.registry.by_name(name, DeviceKind::Camera)
    }

    pub fn lookup_doorbell_by_id(&self, id: &str) -> Option<Arc<Device>> {
        self.inner.registry.get(id, DeviceKind::Doorbell)
    }

    pub fn lookup_doorbell_by_name(&self, name: &str) -> Option<Arc<Device>> {
        self.inner.registry.by_name(name, DeviceKind::Doorbell)
    }

    pub fn lookup_light_by_id(&self, id: &str) -> Option<Arc<Device>> {
        self.inner.registry.get(id, DeviceKind::Light)
    }

    pub fn lookup_light_by_name(&self, name: &str) -> Option<Arc<Device>> {
        self.inner.registry.by_name(name, DeviceKind::Light)
    }

    pub fn lookup_base_station_by_id(&self, id: &str) -> Option<Arc<Device>> {
        self.inner.registry.get(id, DeviceKind::BaseStation)
    }

    pub fn lookup_base_station_by_name(&self, name: &str) -> Option<Arc<Device>> {
        self.inner.registry.by_name(name, DeviceKind::BaseStation)
    }

    /// Stored attribute of a device.
    pub fn device_attribute(&self, device: &Device, attr: &str) -> Option<Value> {
        device.attribute(&self.inner.store, attr)
    }

    /// Whether `device` saw motion or a button press within `recent_time`.
    pub fn is_recently_active(&self, device: &Device) -> bool {
        device.recent_activity(&self.inner.store, self.inner.config.recent_time)
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Account-level attribute, stored under `["ARLO", name]`.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.inner.store.get_value(&[ACCOUNT_KEY, name])
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &ArloConfig {
        &self.inner.config
    }

    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.registry.subscribe()
    }

    pub fn last_error(&self) -> Option<Arc<String>> {
        self.inner.errors.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.connection_state()
    }

    pub async fn stream_stats(&self) -> Option<Arc<StreamStats>> {
        self.inner.connection.stream_stats().await
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }
}

impl std::fmt::Debug for Arlo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arlo")
            .field("name", &self.inner.config.name)
            .field("devices", &self.inner.registry.len())
            .field("started", &self.inner.barrier.is_released())
            .finish_non_exhaustive()
    }
}

/// Wrap a refresh step as a scheduler job that holds only a weak handle.
fn job<F, Fut>(
    weak: &Weak<ArloInner>,
    step: F,
) -> impl Fn() -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync + 'static
where
    F: Fn(Arc<ArloInner>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    let weak = weak.clone();
    move || {
        let run = weak.upgrade().map(&step);
        async move {
            match run {
                Some(run) => run.await,
                None => Ok(()),
            }
        }
        .boxed()
    }
}

// ── Refresh steps ────────────────────────────────────────────────────

impl ArloInner {
    /// List devices and register every provisioned one. Returns the
    /// number of new registrations.
    async fn enumerate(&self) -> Result<usize, CoreError> {
        let listed = self.connection.devices().await?;
        let mut added = 0;
        for info in &listed {
            if !info.is_provisioned() {
                debug!(id = %info.device_id, state = ?info.state, "skipping unprovisioned device");
                continue;
            }
            let kinds = DeviceKind::classify(info);
            if kinds.is_empty() {
                debug!(id = %info.device_id, device_type = %info.device_type, "unsupported device type");
                continue;
            }
            added += self.registry.register_info(info);
        }
        self.store_totals();
        Ok(added)
    }

    fn store_totals(&self) {
        for (key, kind) in [
            ("totalCameras", DeviceKind::Camera),
            ("totalDoorbells", DeviceKind::Doorbell),
            ("totalLights", DeviceKind::Light),
        ] {
            self.store
                .set(&[ACCOUNT_KEY, key], self.registry.count(kind));
        }
    }

    /// Keep each base station publishing to this session.
    async fn ping_bases(&self) -> Result<(), CoreError> {
        let session = self
            .connection
            .current_session()
            .ok_or(CoreError::NotConnected)?;
        let resource = format!("subscriptions/{}", session.web_id);

        let mut first_err = None;
        for base in self.registry.of_kind(DeviceKind::BaseStation) {
            let body = json!({
                "action": "set",
                "resource": resource,
                "publishResponse": false,
                "properties": { "devices": [base.id] },
            });
            if let Err(e) = self.connection.notify(&base, body).await {
                warn!(base = %base.id, error = %e, "ping failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Ask each base station for its modes and attached devices; the
    /// answers arrive on the push channel.
    async fn refresh_bases(&self, initial: bool) -> Result<(), CoreError> {
        let mut resources = vec!["modes"];
        if initial {
            resources.push("activeAutomations");
        }
        resources.extend(["cameras", "doorbells", "lights"]);

        let mut first_err = None;
        for base in self.registry.of_kind(DeviceKind::BaseStation) {
            for resource in &resources {
                let body = json!({ "action": "get", "resource": resource, "publishResponse": false });
                if let Err(e) = self.connection.notify(&base, body).await {
                    warn!(base = %base.id, resource, error = %e, "base refresh failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Request sensor history from cameras that carry ambient sensors.
    async fn refresh_ambient_sensors(&self) -> Result<(), CoreError> {
        let mut first_err = None;
        for camera in self.registry.of_kind(DeviceKind::Camera) {
            if !camera.has_ambient_sensors() {
                continue;
            }
            let body = json!({
                "action": "get",
                "resource": format!("cameras/{}/ambientSensors/history", camera.id),
                "publishResponse": false,
            });
            if let Err(e) = self.connection.notify(&camera, body).await {
                warn!(camera = %camera.id, error = %e, "ambient sensor refresh failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Re-enumerate devices when the configured interval has elapsed.
    async fn maybe_reload_devices(&self) -> Result<(), CoreError> {
        let Some(every) = self.config.device_refresh_interval() else {
            return Ok(());
        };
        let now = Instant::now();
        {
            let mut next = self
                .next_device_refresh
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if next.is_some_and(|at| now < at) {
                return Ok(());
            }
            *next = Some(now + every);
        }
        debug!("reloading device list");
        let added = self.enumerate().await?;
        if added > 0 {
            info!(added, "new devices registered");
        }
        Ok(())
    }

    // ── Scheduled jobs ───────────────────────────────────────────────

    async fn initial_refresh(self: Arc<Self>) -> Result<(), TaskError> {
        debug!("initial refresh");
        let bases = self.refresh_bases(true).await;
        let ambient = self.refresh_ambient_sensors().await;
        self.barrier.release();
        bases.and(ambient).map_err(TaskError::from)
    }

    async fn fast_refresh(self: Arc<Self>) -> Result<(), TaskError> {
        debug!("fast refresh");
        let saved = self.store.save().map(drop).map_err(|e| {
            warn!(error = %e, "state save failed");
            CoreError::from(e)
        });
        let pinged = self.ping_bases().await;
        saved.and(pinged).map_err(TaskError::from)
    }

    async fn slow_refresh(self: Arc<Self>) -> Result<(), TaskError> {
        debug!("slow refresh");
        let bases = self.refresh_bases(false).await;
        let ambient = self.refresh_ambient_sensors().await;
        let reload = self.maybe_reload_devices().await;
        bases.and(ambient).and(reload).map_err(TaskError::from)
    }
}

