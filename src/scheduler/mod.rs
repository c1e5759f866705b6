//! Heartbeat scheduling state machine.
//!
//! [`SchedulerBuilder::spawn`] starts the event loop and returns a
//! [`HeartbeatHandle`]; host events (app foregrounded, display on/off, settings
//! saved) are forwarded through the handle.

mod cycle;
mod flight;
mod machine;
mod notify;

use anyhow::Result;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub use notify::SubscriptionId;

use crate::config::HeartbeatConfig;
use crate::dispatch::UiDispatcher;
use crate::error::{HeartbeatError, HeartbeatResult};
use crate::net::{SubmissionClient, Submitter};
use crate::storage::SettingsStore;
use crate::types::{
    DisplayController, FrameSource, HeartbeatListener, RunState, ScreenState, StatusProvider,
    StatusSnapshot,
};
use cycle::{CycleContext, SourceList};
use flight::SingleFlight;
use machine::{Command, Machine};
use notify::Notifier;

pub const SCREEN_OFF_DELAY: Duration = Duration::from_secs(30);
pub const WAKE_DELAY: Duration = Duration::from_secs(2);
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Display-off to first background push.
    pub screen_off_delay: Duration,
    pub wake_delay: Duration,
    pub wake_retry_delay: Duration,
    /// Pause after a woken cycle before deciding to go back to background.
    pub settle_delay: Duration,
    pub capture_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            screen_off_delay: SCREEN_OFF_DELAY,
            wake_delay: WAKE_DELAY,
            wake_retry_delay: WAKE_DELAY,
            settle_delay: WAKE_DELAY,
            capture_timeout: CAPTURE_TIMEOUT,
        }
    }
}

pub struct SchedulerBuilder {
    store: Arc<SettingsStore>,
    device_id: String,
    submitter: Option<Arc<dyn Submitter>>,
    ui: Option<UiDispatcher>,
    display: Option<Arc<dyn DisplayController>>,
    status: Option<Arc<dyn StatusProvider>>,
    sources: Vec<Arc<dyn FrameSource>>,
    screen: ScreenState,
    timings: Timings,
}

impl SchedulerBuilder {
    pub fn new(store: Arc<SettingsStore>, device_id: impl Into<String>) -> Self {
        Self {
            store,
            device_id: device_id.into(),
            submitter: None,
            ui: None,
            display: None,
            status: None,
            sources: Vec::new(),
            screen: ScreenState::On,
            timings: Timings::default(),
        }
    }

    pub fn submitter(mut self, submitter: Arc<dyn Submitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn ui_dispatcher(mut self, ui: UiDispatcher) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn display_controller(mut self, display: Arc<dyn DisplayController>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn status_provider(mut self, status: Arc<dyn StatusProvider>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn sources(mut self, sources: Vec<Arc<dyn FrameSource>>) -> Self {
        self.sources = sources;
        self
    }

    /// Display state at boot; the device may come up with the display off.
    pub fn initial_screen(mut self, screen: ScreenState) -> Self {
        self.screen = screen;
        self
    }

    pub fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Spawns the event loop on the current tokio runtime.
    pub fn spawn(self) -> Result<HeartbeatHandle> {
        let submitter = match self.submitter {
            Some(s) => s,
            None => Arc::new(SubmissionClient::new()?),
        };
        let ui = self.ui.unwrap_or_else(UiDispatcher::spawn);
        let notifier = Notifier::new(ui.clone());
        let sources: SourceList = Arc::new(RwLock::new(self.sources));

        let ctx = Arc::new(CycleContext {
            store: self.store.clone(),
            device_id: self.device_id,
            sources: sources.clone(),
            status: self.status,
            submitter,
            ui,
            notifier: notifier.clone(),
            capture_timeout: self.timings.capture_timeout,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let machine = Machine::new(
            tx.clone(),
            ctx,
            self.display,
            self.screen,
            SingleFlight::default(),
            self.timings,
        );
        tokio::spawn(machine.run(rx));

        Ok(HeartbeatHandle {
            tx,
            store: self.store,
            sources,
            notifier,
        })
    }
}

#[derive(Clone)]
pub struct HeartbeatHandle {
    tx: mpsc::UnboundedSender<Command>,
    store: Arc<SettingsStore>,
    sources: SourceList,
    notifier: Notifier,
}

impl HeartbeatHandle {
    fn send(&self, command: Command) -> HeartbeatResult<()> {
        self.tx
            .send(command)
            .map_err(|_| HeartbeatError::Unexpected("scheduler is not running".to_string()))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> HeartbeatResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await
            .map_err(|_| HeartbeatError::Unexpected("scheduler dropped the request".to_string()))
    }

    /// Starts the display-on cadence. Configuration problems come back here
    /// and never reach the stats.
    pub async fn start(&self) -> HeartbeatResult<RunState> {
        self.request(Command::Start).await?
    }

    pub fn pause(&self) -> HeartbeatResult<()> {
        self.send(Command::Pause)
    }

    pub fn stop(&self) -> HeartbeatResult<()> {
        self.send(Command::Stop)
    }

    pub fn on_screen_on(&self) -> HeartbeatResult<()> {
        self.send(Command::ScreenOn)
    }

    pub fn on_screen_off(&self) -> HeartbeatResult<()> {
        self.send(Command::ScreenOff)
    }

    pub fn on_config_changed(&self) -> HeartbeatResult<()> {
        self.send(Command::ConfigChanged)
    }

    /// Runs one cycle now. `false` when a cycle is already in flight.
    pub async fn execute_once(&self) -> HeartbeatResult<bool> {
        self.request(Command::ExecuteOnce).await
    }

    pub async fn snapshot(&self) -> HeartbeatResult<StatusSnapshot> {
        let (run_state, screen, executing) = self.request(Command::Snapshot).await?;
        Ok(StatusSnapshot {
            run_state,
            screen,
            executing,
            stats: self.store.stats()?,
        })
    }

    pub fn config(&self) -> Result<HeartbeatConfig> {
        HeartbeatConfig::load(&self.store)
    }

    /// Persists new settings and re-evaluates the schedule.
    pub fn update_config(&self, config: &HeartbeatConfig) -> HeartbeatResult<()> {
        config.save(&self.store)?;
        self.on_config_changed()
    }

    pub fn reset_stats(&self) -> Result<()> {
        self.store.reset_stats()
    }

    pub fn set_sources(&self, sources: Vec<Arc<dyn FrameSource>>) {
        if let Ok(mut current) = self.sources.write() {
            *current = sources;
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn HeartbeatListener>) -> SubscriptionId {
        self.notifier.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn shutdown(&self) -> HeartbeatResult<()> {
        self.send(Command::Shutdown)
    }
}
