//! Public SDK surface
//!
//! `Gametrics` is the one object a game constructs at startup: it owns the
//! event queue, the HTTP client, the session state, and a small background
//! runtime that delivery generations run on. Event constructors never
//! block the caller beyond a queue-handoff lock and never surface errors:
//! analytics must not crash or stall the game.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DeviceInfo};
use crate::dispatcher::{DispatchMode, Dispatcher};
use crate::error::{Error, Result};
use crate::events::{Event, EventEnvelope, Gender, UserFields};
use crate::net::{AlwaysOnline, CollectorClient, Connectivity};
use crate::session::SessionManager;
use crate::store::EventStore;

const SDK_VERSION: &str = concat!("gametrics ", env!("CARGO_PKG_VERSION"));

// Preconfigured event ids
const USER_INFO_EVENT: &str = "GA:UserInfo";
const REFERRAL_EVENT: &str = "GA:Referral";
const AVERAGE_FPS_EVENT: &str = "GA:AverageFPS";
const CRITICAL_FPS_EVENT: &str = "GA:CriticalFPS";
const MODEL_EVENT_PREFIX: &str = "GA:Model:";
const OS_VERSION_EVENT_PREFIX: &str = "GA:OSVersion:";

/// Frame counter for the FPS helpers
struct FpsTracker {
    started_at: Option<Instant>,
    frames: u32,
}

/// Analytics client handle.
///
/// Construct once with [`Gametrics::initialise`], call
/// [`start_session`](Self::start_session) on every screen entry and
/// [`stop_session`](Self::stop_session) on every exit, then record events.
pub struct Gametrics {
    app_key: String,
    secret_key: String,
    build: String,
    device: DeviceInfo,

    auto_batch: bool,
    cache_locally: bool,
    send_interval: Duration,
    poll_interval: Duration,
    minimum_fps_period_ms: AtomicU64,
    critical_fps_limit: AtomicU32,

    user_id: Mutex<String>,
    area: Mutex<String>,
    sessions: Mutex<SessionManager>,
    fps: Mutex<FpsTracker>,

    store: Arc<EventStore>,
    client: Arc<CollectorClient>,
    connectivity: Arc<dyn Connectivity>,

    /// At most one dispatcher generation may be active at a time
    worker_active: Arc<AtomicBool>,
    cancel: CancellationToken,
    runtime: Option<tokio::runtime::Runtime>,
    handle: tokio::runtime::Handle,
}

impl Gametrics {
    /// Initialise the SDK with the default (always-online) connectivity
    /// probe.
    pub fn initialise(config: Config) -> Result<Self> {
        Self::initialise_with_connectivity(config, Arc::new(AlwaysOnline))
    }

    /// Initialise the SDK with a host-supplied connectivity probe.
    pub fn initialise_with_connectivity(
        config: Config,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self> {
        config.validate()?;

        let user_id = match (&config.user_id, &config.device_id) {
            (Some(custom), _) => custom.clone(),
            (None, Some(device_id)) => derive_user_id(device_id),
            (None, None) => uuid::Uuid::new_v4().simple().to_string(),
        };

        let store = EventStore::open(&config.resolved_database_path())?;
        store.migrate()?;
        store.set_max_events(config.max_event_storage);

        let client = CollectorClient::new(
            &config.base_url,
            Duration::from_secs(config.request_timeout_secs),
        )?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("gametrics")
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("failed to start background runtime: {}", e)))?;
        let handle = runtime.handle().clone();

        tracing::info!(app_key = %config.app_key, build = %config.build, "gametrics initialised");

        Ok(Self {
            app_key: config.app_key,
            secret_key: config.secret_key,
            build: config.build,
            device: config.device,
            auto_batch: config.auto_batch,
            cache_locally: config.cache_locally,
            send_interval: Duration::from_millis(config.send_interval_ms),
            poll_interval: Duration::from_millis(config.network_poll_interval_ms),
            minimum_fps_period_ms: AtomicU64::new(config.minimum_fps_period_ms),
            critical_fps_limit: AtomicU32::new(config.critical_fps_limit),
            sessions: Mutex::new(SessionManager::new(
                user_id.clone(),
                config.session_timeout_ms,
            )),
            user_id: Mutex::new(user_id),
            area: Mutex::new(String::new()),
            fps: Mutex::new(FpsTracker {
                started_at: None,
                frames: 0,
            }),
            store: Arc::new(store),
            client: Arc::new(client),
            connectivity,
            worker_active: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            runtime: Some(runtime),
            handle,
        })
    }

    // ============================================
    // Session lifecycle
    // ============================================

    /// Call on every screen entry. The screen name becomes the default
    /// `area` for subsequent events; a fresh session id is only generated
    /// once the session timeout has elapsed since the last `stop_session`.
    pub fn start_session(&self, area: &str) {
        *self.area.lock().unwrap() = area.to_string();
        let handle = self.sessions.lock().unwrap().start_session();
        if handle.is_new {
            self.send_session_info();
        }
    }

    /// Call on every screen exit; schedules session expiry.
    pub fn stop_session(&self) {
        self.sessions.lock().unwrap().stop_session();
    }

    /// Whether a session is currently started
    pub fn is_session_started(&self) -> bool {
        self.sessions.lock().unwrap().is_started()
    }

    /// One-time device/OS info events accompanying a new session
    fn send_session_info(&self) {
        if let Some(model) = self.device.device.clone() {
            self.quality_event(&format!("{}{}", MODEL_EVENT_PREFIX, model), "");
        }
        if let Some(os) = self.device.os_major.clone() {
            self.quality_event(&format!("{}{}", OS_VERSION_EVENT_PREFIX, os), "");
        }
        let fields = UserFields {
            platform: self.device.platform.clone(),
            device: self.device.device.clone(),
            os_major: self.device.os_major.clone(),
            os_minor: self.device.os_minor.clone(),
            sdk_version: Some(SDK_VERSION.to_string()),
            ..Default::default()
        };
        self.user_event_with_fields(USER_INFO_EVENT, fields);
    }

    // ============================================
    // Event constructors
    // ============================================

    /// Record a design event in the current area
    pub fn design_event(&self, event_id: &str, value: f32) {
        self.design_event_impl(event_id, value, None, 0.0, 0.0, 0.0);
    }

    /// Record a design event with explicit area and position
    pub fn design_event_at(&self, event_id: &str, value: f32, area: &str, x: f32, y: f32, z: f32) {
        self.design_event_impl(event_id, value, Some(area), x, y, z);
    }

    fn design_event_impl(
        &self,
        event_id: &str,
        value: f32,
        area: Option<&str>,
        x: f32,
        y: f32,
        z: f32,
    ) {
        let Some(envelope) = self.envelope(event_id, area, x, y, z) else {
            return;
        };
        self.submit(Event::design(envelope, value));
    }

    /// Record a business event in the current area. `amount` is in the
    /// smallest currency unit, `currency` a 3-letter code like `"USD"`.
    pub fn business_event(&self, event_id: &str, currency: &str, amount: i64) {
        self.business_event_impl(event_id, currency, amount, None, 0.0, 0.0, 0.0);
    }

    /// Record a business event with explicit area and position
    pub fn business_event_at(
        &self,
        event_id: &str,
        currency: &str,
        amount: i64,
        area: &str,
        x: f32,
        y: f32,
        z: f32,
    ) {
        self.business_event_impl(event_id, currency, amount, Some(area), x, y, z);
    }

    fn business_event_impl(
        &self,
        event_id: &str,
        currency: &str,
        amount: i64,
        area: Option<&str>,
        x: f32,
        y: f32,
        z: f32,
    ) {
        let Some(envelope) = self.envelope(event_id, area, x, y, z) else {
            return;
        };
        self.submit(Event::business(envelope, currency.to_string(), amount));
    }

    /// Record a quality event (error message, stack trace) in the current
    /// area
    pub fn quality_event(&self, event_id: &str, message: &str) {
        self.quality_event_impl(event_id, message, None, 0.0, 0.0, 0.0);
    }

    /// Record a quality event with explicit area and position
    pub fn quality_event_at(
        &self,
        event_id: &str,
        message: &str,
        area: &str,
        x: f32,
        y: f32,
        z: f32,
    ) {
        self.quality_event_impl(event_id, message, Some(area), x, y, z);
    }

    fn quality_event_impl(
        &self,
        event_id: &str,
        message: &str,
        area: Option<&str>,
        x: f32,
        y: f32,
        z: f32,
    ) {
        let Some(envelope) = self.envelope(event_id, area, x, y, z) else {
            return;
        };
        self.submit(Event::quality(envelope, message.to_string()));
    }

    /// Record a user event with demographics only
    pub fn user_event(&self, event_id: &str, gender: Gender, birth_year: i32, friend_count: i32) {
        self.user_event_with_fields(
            event_id,
            UserFields {
                gender,
                birth_year,
                friend_count,
                ..Default::default()
            },
        );
    }

    fn user_event_with_fields(&self, event_id: &str, fields: UserFields) {
        let Some(envelope) = self.envelope(event_id, None, 0.0, 0.0, 0.0) else {
            return;
        };
        self.submit(Event::user(envelope, fields));
    }

    /// Report user demographics
    pub fn set_user_info(&self, gender: Gender, birth_year: i32, friend_count: i32) {
        self.user_event(USER_INFO_EVENT, gender, birth_year, friend_count);
    }

    /// Report install attribution. Also mirrors the terms into a quality
    /// event so they show up in developer-facing reports.
    pub fn set_referral_info(
        &self,
        install_publisher: Option<&str>,
        install_site: Option<&str>,
        install_campaign: Option<&str>,
        install_ad: Option<&str>,
        install_keyword: Option<&str>,
    ) {
        let fields = UserFields {
            install_publisher: install_publisher.map(str::to_string),
            install_site: install_site.map(str::to_string),
            install_campaign: install_campaign.map(str::to_string),
            install_ad: install_ad.map(str::to_string),
            install_keyword: install_keyword.map(str::to_string),
            ..Default::default()
        };
        self.user_event_with_fields(REFERRAL_EVENT, fields);

        let mut quality_id = REFERRAL_EVENT.to_string();
        for term in [
            install_publisher,
            install_site,
            install_campaign,
            install_ad,
            install_keyword,
        ]
        .into_iter()
        .flatten()
        {
            quality_id.push(':');
            quality_id.push_str(term);
        }
        if quality_id != REFERRAL_EVENT {
            self.quality_event(&quality_id, "");
        }
    }

    // ============================================
    // FPS helpers
    // ============================================

    /// Call once per frame inside the draw loop
    pub fn log_fps(&self) {
        let mut fps = self.fps.lock().unwrap();
        match fps.started_at {
            None => {
                tracing::debug!("start logging FPS");
                fps.started_at = Some(Instant::now());
                fps.frames = 0;
            }
            Some(_) => fps.frames += 1,
        }
    }

    /// Collate the frame count into an average-FPS design event, using the
    /// current area
    pub fn stop_logging_fps(&self) {
        self.stop_logging_fps_impl(None, 0.0, 0.0, 0.0);
    }

    /// Collate the frame count into an average-FPS design event with an
    /// explicit area and position
    pub fn stop_logging_fps_at(&self, area: &str, x: f32, y: f32, z: f32) {
        self.stop_logging_fps_impl(Some(area), x, y, z);
    }

    fn stop_logging_fps_impl(&self, area: Option<&str>, x: f32, y: f32, z: f32) {
        let (elapsed_ms, frames) = {
            let mut fps = self.fps.lock().unwrap();
            let Some(started_at) = fps.started_at.take() else {
                tracing::warn!("stop_logging_fps called before log_fps");
                return;
            };
            (started_at.elapsed().as_millis() as u64, fps.frames)
        };

        let minimum = self.minimum_fps_period_ms.load(Ordering::Relaxed);
        if elapsed_ms < minimum.max(1) {
            tracing::warn!(
                elapsed_ms,
                minimum_ms = minimum,
                "insufficient time elapsed between starting and stopping FPS logging"
            );
            return;
        }

        let average = (u64::from(frames) * 1000 / elapsed_ms) as f32;
        self.design_event_impl(AVERAGE_FPS_EVENT, average, area, x, y, z);
        if (average as u32) < self.critical_fps_limit.load(Ordering::Relaxed) {
            self.design_event_impl(CRITICAL_FPS_EVENT, average, area, x, y, z);
        }
    }

    /// Minimum elapsed time for an FPS average to be recorded
    pub fn set_minimum_fps_period_ms(&self, millis: u64) {
        self.minimum_fps_period_ms.store(millis, Ordering::Relaxed);
    }

    /// Average FPS below this limit logs an additional critical-FPS event
    pub fn set_critical_fps_limit(&self, fps: u32) {
        self.critical_fps_limit.store(fps, Ordering::Relaxed);
    }

    // ============================================
    // Configuration
    // ============================================

    /// Override the generated user id for all subsequent events
    pub fn set_user_id(&self, user_id: &str) {
        *self.user_id.lock().unwrap() = user_id.to_string();
        self.sessions
            .lock()
            .unwrap()
            .set_user_id(user_id.to_string());
    }

    /// Cap local storage at `max` events; 0 = unlimited
    pub fn set_maximum_event_storage(&self, max: u32) {
        self.store.set_max_events(max);
    }

    /// Number of events waiting for delivery
    pub fn pending_events(&self) -> u64 {
        self.store.pending_count().unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to count pending events");
            0
        })
    }

    // ============================================
    // Delivery
    // ============================================

    /// Send pending events now: no interval wait, and no connectivity
    /// polling (an offline flush aborts, retaining the queue).
    pub fn flush(&self) {
        tracing::info!("starting manual batch");
        if !self.ensure_dispatcher(DispatchMode::Manual, Duration::ZERO) {
            tracing::warn!("delivery worker already active, wait for it to finish");
        }
    }

    /// Release background resources. Cancels any in-flight interval or
    /// connectivity wait; pending events stay queued for the next run.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(runtime) = self.runtime.take() {
            shutdown_runtime(runtime);
        }
    }

    /// Spawn a dispatcher generation unless one is already active.
    ///
    /// The compare-and-set on `worker_active` is the at-most-one-generation
    /// guarantee; the flag is released only when the spawned task observes
    /// the generation's outcome.
    fn ensure_dispatcher(&self, mode: DispatchMode, send_interval: Duration) -> bool {
        if self
            .worker_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.client),
            Arc::clone(&self.connectivity),
            send_interval,
            self.poll_interval,
            self.cache_locally,
            mode,
            self.cancel.child_token(),
        );
        let active = Arc::clone(&self.worker_active);
        self.handle.spawn(async move {
            let outcome = dispatcher.run().await;
            tracing::debug!(?outcome, "dispatcher generation finished");
            active.store(false, Ordering::Release);
        });
        true
    }

    // ============================================
    // Internals
    // ============================================

    /// Build an envelope for a new event, or discard (with a warning) when
    /// no session is started.
    fn envelope(
        &self,
        event_id: &str,
        area: Option<&str>,
        x: f32,
        y: f32,
        z: f32,
    ) -> Option<EventEnvelope> {
        let session_id = {
            let sessions = self.sessions.lock().unwrap();
            if !sessions.is_started() {
                tracing::warn!(
                    event_id,
                    "session not started, event discarded; call start_session() on screen entry"
                );
                return None;
            }
            sessions.session_id()?.to_string()
        };

        Some(EventEnvelope {
            user_id: self.user_id.lock().unwrap().clone(),
            session_id,
            build: self.build.clone(),
            event_id: event_id.to_string(),
            area: area
                .map(str::to_string)
                .unwrap_or_else(|| self.area.lock().unwrap().clone()),
            x,
            y,
            z,
        })
    }

    /// Queue the event off the caller's path and make sure a delivery
    /// generation is (or will be) running.
    fn submit(&self, event: Event) {
        tracing::debug!(
            category = %event.category(),
            event_id = %event.envelope.event_id,
            "new event"
        );

        let store = Arc::clone(&self.store);
        let app_key = self.app_key.clone();
        let secret = self.secret_key.clone();
        self.handle.spawn_blocking(move || {
            match store.append(&app_key, &secret, &event) {
                Ok(Some(sequence_id)) => tracing::debug!(sequence_id, "event stored"),
                Ok(None) => {} // storage cap reached, already logged
                Err(e) => tracing::error!(error = %e, "failed to store event"),
            }
        });

        if self.auto_batch {
            self.ensure_dispatcher(DispatchMode::Auto, self.send_interval);
        }
    }
}

impl Drop for Gametrics {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(runtime) = self.runtime.take() {
            shutdown_runtime(runtime);
        }
    }
}

/// Shut the background runtime down without blocking an async caller
fn shutdown_runtime(runtime: tokio::runtime::Runtime) {
    if tokio::runtime::Handle::try_current().is_ok() {
        runtime.shutdown_background();
    } else {
        runtime.shutdown_timeout(Duration::from_secs(2));
    }
}

/// Register a panic hook that records a quality event before delegating to
/// the previously installed hook. Call once at startup, after
/// `start_session`.
pub fn install_panic_hook(client: &Arc<Gametrics>) {
    let handle = Arc::downgrade(client);
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(client) = handle.upgrade() {
            client.quality_event("Exception:panic", &info.to_string());
        }
        previous(info);
    }));
}

/// Stable user id derived from a device identifier
fn derive_user_id(device_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::new("game-key", "secret");
        config.database_path = Some(dir.path().join("events.db"));
        // Keep delivery out of unit tests; integration tests cover it
        config.auto_batch = false;
        config
    }

    fn wait_until(description: &str, condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for: {}", description);
    }

    #[test]
    fn test_event_before_session_is_discarded() {
        let dir = TempDir::new().unwrap();
        let client = Gametrics::initialise(test_config(&dir)).unwrap();

        client.design_event("Tutorial:Start", 1.0);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(client.pending_events(), 0);
    }

    #[test]
    fn test_events_stored_after_session_start() {
        let dir = TempDir::new().unwrap();
        let client = Gametrics::initialise(test_config(&dir)).unwrap();

        client.start_session("MainMenu");
        client.design_event("Tutorial:Start", 1.0);
        client.business_event("Buy:Gems", "USD", 499);

        // New session also emits the one-time user info event
        wait_until("3 pending events", || client.pending_events() == 3);
    }

    #[test]
    fn test_new_session_emits_device_info_pair() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.device = DeviceInfo {
            platform: Some("android".to_string()),
            device: Some("Pixel 9".to_string()),
            os_major: Some("Android 16".to_string()),
            os_minor: Some("16.0.1".to_string()),
        };
        let client = Gametrics::initialise(config).unwrap();

        client.start_session("MainMenu");
        // Model + OS quality events plus the user info event
        wait_until("3 session info events", || client.pending_events() == 3);

        // Re-entering a screen within the timeout does not repeat them
        client.stop_session();
        client.start_session("Level1");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(client.pending_events(), 3);
    }

    #[test]
    fn test_custom_user_id_used() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.user_id = Some("custom-user".to_string());
        let client = Gametrics::initialise(config).unwrap();

        client.start_session("MainMenu");
        client.quality_event("Check", "msg");
        wait_until("events stored", || client.pending_events() > 0);

        drop(client);
        let store = EventStore::open(&dir.path().join("events.db")).unwrap();
        store.migrate().unwrap();
        let batches = store.drain().unwrap();
        assert!(batches
            .iter()
            .flat_map(|b| &b.records)
            .all(|r| r.event.envelope.user_id == "custom-user"));
    }

    #[test]
    fn test_derive_user_id_stable() {
        assert_eq!(derive_user_id("device-1"), derive_user_id("device-1"));
        assert_ne!(derive_user_id("device-1"), derive_user_id("device-2"));
        assert_eq!(derive_user_id("device-1").len(), 32);
    }

    #[test]
    fn test_fps_requires_minimum_period() {
        let dir = TempDir::new().unwrap();
        let client = Gametrics::initialise(test_config(&dir)).unwrap();
        client.start_session("Level1");
        wait_until("session info stored", || client.pending_events() == 1);

        // Default minimum period is 5s; an immediate stop records nothing
        client.log_fps();
        client.log_fps();
        client.stop_logging_fps();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(client.pending_events(), 1);
    }

    #[test]
    fn test_fps_average_recorded() {
        let dir = TempDir::new().unwrap();
        let client = Gametrics::initialise(test_config(&dir)).unwrap();
        client.start_session("Level1");
        wait_until("session info stored", || client.pending_events() == 1);

        client.set_minimum_fps_period_ms(10);
        client.log_fps();
        for _ in 0..100 {
            client.log_fps();
        }
        std::thread::sleep(Duration::from_millis(20));
        client.stop_logging_fps();

        // 100 frames over ~20ms is far above the critical limit, so only
        // the average event is recorded
        wait_until("fps event stored", || client.pending_events() == 2);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(client.pending_events(), 2);
    }
}
