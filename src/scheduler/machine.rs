use std::mem;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cycle::{self, CycleContext};
use super::flight::SingleFlight;
use super::Timings;
use crate::config::HeartbeatConfig;
use crate::error::{HeartbeatError, HeartbeatResult};
use crate::timer::{Timer, TimerId, Timers};
use crate::types::{DisplayController, RunState, ScreenState};

pub(crate) enum Command {
    Start(oneshot::Sender<HeartbeatResult<RunState>>),
    Pause,
    Stop,
    ScreenOn,
    ScreenOff,
    ConfigChanged,
    ExecuteOnce(oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<(RunState, ScreenState, bool)>),
    Shutdown,
    Timer(TimerId, TimerEvent),
    CycleFinished(CycleOrigin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    ForegroundTick,
    BackgroundTick,
    WakeCheck { attempt: u8 },
    ReturnToBackground,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleOrigin {
    Foreground,
    Background,
    Manual,
}

/// Owns every state transition. Runs as a single task fed by one channel, so
/// transitions never race each other.
pub(crate) struct Machine {
    state: RunState,
    screen: ScreenState,
    /// Foreground or background cadence, never both.
    cadence: Option<Timer>,
    /// Wake-readiness checks and the post-cycle settle delay.
    wake_timer: Option<Timer>,
    woken_by_heartbeat: bool,
    timers: Timers<Command>,
    tx: mpsc::UnboundedSender<Command>,
    flight: SingleFlight,
    cancel: CancellationToken,
    ctx: Arc<CycleContext>,
    display: Option<Arc<dyn DisplayController>>,
    timings: Timings,
}

impl Machine {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Command>,
        ctx: Arc<CycleContext>,
        display: Option<Arc<dyn DisplayController>>,
        screen: ScreenState,
        flight: SingleFlight,
        timings: Timings,
    ) -> Self {
        Self {
            state: RunState::Stopped,
            screen,
            cadence: None,
            wake_timer: None,
            woken_by_heartbeat: false,
            timers: Timers::new(tx.clone()),
            tx,
            flight,
            cancel: CancellationToken::new(),
            ctx,
            display,
            timings,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!(screen = ?self.screen, "Heartbeat scheduler running");
        while let Some(command) = rx.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        info!("Heartbeat scheduler exited");
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Pause => self.pause(),
            Command::Stop => self.stop(),
            Command::ScreenOn => self.screen_on(),
            Command::ScreenOff => self.screen_off(),
            Command::ConfigChanged => self.config_changed(),
            Command::ExecuteOnce(reply) => {
                info!("Manual heartbeat requested");
                let _ = reply.send(self.trigger_cycle(CycleOrigin::Manual));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send((self.state, self.screen, self.flight.is_busy()));
            }
            Command::Shutdown => {
                self.stop();
                return false;
            }
            Command::Timer(id, event) => self.timer_fired(id, event),
            Command::CycleFinished(origin) => self.cycle_finished(origin),
        }
        true
    }

    fn load_config(&self) -> Option<HeartbeatConfig> {
        match HeartbeatConfig::load(&self.ctx.store) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "Failed to read heartbeat config");
                None
            }
        }
    }

    fn set_state(&mut self, next: RunState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Run state transition");
            self.state = next;
        }
    }

    // foreground

    fn start(&mut self) -> HeartbeatResult<RunState> {
        let config = HeartbeatConfig::load(&self.ctx.store)?;
        debug!(
            enabled = config.enabled,
            configured = config.is_configured(),
            screen = ?self.screen,
            screen_on_push = config.screen_on_push,
            "start() called"
        );
        if !config.is_configured() {
            return Err(HeartbeatError::Config(config.config_status().to_string()));
        }
        if !config.enabled {
            return Err(HeartbeatError::Config("heartbeat is disabled".to_string()));
        }
        if self.screen == ScreenState::Off {
            debug!("Display is off, foreground push not started");
            return Ok(self.state);
        }
        if !config.screen_on_push {
            return Err(HeartbeatError::Config("display-on push is disabled".to_string()));
        }
        if self.state == RunState::ForegroundActive {
            debug!("Foreground push already running");
            return Ok(self.state);
        }
        self.start_foreground(&config);
        Ok(self.state)
    }

    fn start_foreground(&mut self, config: &HeartbeatConfig) {
        self.wake_timer = None;
        self.set_state(RunState::ForegroundActive);
        info!(interval = config.interval.as_secs(), "Foreground heartbeat started");
        self.ctx.notifier.started();

        self.trigger_cycle(CycleOrigin::Foreground);
        let period = config.interval.as_duration();
        self.cadence = Some(self.timers.periodic(period, period, |id| {
            Command::Timer(id, TimerEvent::ForegroundTick)
        }));
    }

    fn foreground_still_valid(&self) -> bool {
        if self.screen == ScreenState::Off {
            return false;
        }
        match self.load_config() {
            Some(config) => config.enabled && config.is_configured() && config.screen_on_push,
            None => false,
        }
    }

    fn stop_foreground(&mut self, reason: &str) {
        if self.state != RunState::ForegroundActive {
            return;
        }
        self.cadence = None;
        self.set_state(RunState::Stopped);
        info!(reason, "Foreground heartbeat stopped");
        self.ctx.notifier.stopped();
    }

    fn pause(&mut self) {
        self.stop_foreground("paused");
    }

    fn stop(&mut self) {
        self.cadence = None;
        self.wake_timer = None;
        self.woken_by_heartbeat = false;
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.flight.force_clear();
        let was_foreground = self.state == RunState::ForegroundActive;
        self.set_state(RunState::Stopped);
        if was_foreground {
            self.ctx.notifier.stopped();
        }
        debug!("Heartbeat stopped");
    }

    // display transitions

    fn screen_off(&mut self) {
        info!("Display off");
        self.screen = ScreenState::Off;
        self.stop_foreground("display off");
        self.arm_background();
    }

    fn screen_on(&mut self) {
        info!("Display on");
        self.screen = ScreenState::On;
        if self.state.is_background() {
            self.cadence = None;
            self.wake_timer = None;
            self.woken_by_heartbeat = false;
            self.set_state(RunState::Stopped);
            info!("Display-off heartbeat disarmed");
        }
    }

    fn arm_background(&mut self) {
        let Some(config) = self.load_config() else {
            return;
        };
        if !config.enabled || !config.is_configured() || !config.screen_off_push {
            debug!("Display-off push disabled or not configured");
            return;
        }
        self.cadence = Some(self.timers.periodic(
            self.timings.screen_off_delay,
            config.interval.as_duration(),
            |id| Command::Timer(id, TimerEvent::BackgroundTick),
        ));
        self.set_state(RunState::BackgroundArmed);
        info!(
            delay_secs = self.timings.screen_off_delay.as_secs(),
            "Display-off heartbeat armed"
        );
    }

    fn config_changed(&mut self) {
        info!("Heartbeat config changed, re-evaluating");
        self.stop();

        let Some(mut config) = self.load_config() else {
            return;
        };
        if !config.is_configured() {
            debug!(status = config.config_status(), "Heartbeat not configured");
            return;
        }
        if config.auto_start && !config.enabled {
            info!("Auto-start enabled, turning heartbeat on");
            if let Err(e) = HeartbeatConfig::persist_enabled(&self.ctx.store, true) {
                warn!(error = %e, "Failed to persist enabled flag");
            }
            config.enabled = true;
        }
        if !config.enabled {
            debug!("Heartbeat disabled");
            return;
        }

        match self.screen {
            ScreenState::On => {
                let in_background = self
                    .display
                    .as_ref()
                    .map(|d| d.is_backgrounded())
                    .unwrap_or(false);
                if config.screen_on_push && !in_background {
                    self.start_foreground(&config);
                }
            }
            ScreenState::Off => self.arm_background(),
        }
    }

    // timers

    fn timer_fired(&mut self, id: TimerId, event: TimerEvent) {
        let current = match event {
            TimerEvent::ForegroundTick | TimerEvent::BackgroundTick => self.cadence.as_ref(),
            TimerEvent::WakeCheck { .. } | TimerEvent::ReturnToBackground => self.wake_timer.as_ref(),
        };
        if current.map(Timer::id) != Some(id) {
            debug!(?event, "Ignoring stale timer");
            return;
        }

        match event {
            TimerEvent::ForegroundTick => self.foreground_tick(),
            TimerEvent::BackgroundTick => self.background_tick(),
            TimerEvent::WakeCheck { attempt } => {
                self.wake_timer = None;
                self.wake_check(attempt);
            }
            TimerEvent::ReturnToBackground => {
                self.wake_timer = None;
                self.return_to_background();
            }
        }
    }

    fn foreground_tick(&mut self) {
        if !self.foreground_still_valid() {
            self.stop_foreground("no longer valid");
            return;
        }
        self.trigger_cycle(CycleOrigin::Foreground);
    }

    fn background_tick(&mut self) {
        if self.screen == ScreenState::On {
            self.cadence = None;
            return;
        }
        let still_enabled = self
            .load_config()
            .map(|c| c.enabled && c.screen_off_push)
            .unwrap_or(false);
        if !still_enabled {
            info!("Display-off push disabled, disarming");
            self.cadence = None;
            self.set_state(RunState::Stopped);
            return;
        }
        if self.state == RunState::BackgroundExecuting {
            warn!("Previous display-off cycle still underway, skipping");
            return;
        }
        self.execute_background();
    }

    // background wake choreography

    fn execute_background(&mut self) {
        let Some(display) = self.display.clone() else {
            warn!("No display controller, cannot run display-off heartbeat");
            return;
        };
        self.set_state(RunState::BackgroundExecuting);

        let backgrounded = display.is_backgrounded();
        let has_sources = display.has_connected_sources();
        debug!(backgrounded, has_sources, "Running display-off heartbeat");

        // A connected source is taken as "already in the foreground", e.g.
        // woken by some other trigger; push without the wake/return dance.
        if has_sources || !backgrounded {
            self.woken_by_heartbeat = false;
            if !self.trigger_cycle(CycleOrigin::Background) {
                self.set_state(RunState::BackgroundArmed);
            }
            return;
        }

        self.woken_by_heartbeat = true;
        info!("Waking to foreground for display-off heartbeat");
        display.wake_to_foreground();
        self.wake_timer = Some(self.timers.once(self.timings.wake_delay, |id| {
            Command::Timer(id, TimerEvent::WakeCheck { attempt: 1 })
        }));
    }

    fn wake_check(&mut self, attempt: u8) {
        if !self.state.is_background() {
            return;
        }
        let ready = self
            .display
            .as_ref()
            .map(|d| d.has_connected_sources())
            .unwrap_or(false);

        if ready {
            debug!(attempt, "Sources ready after wake");
            if !self.trigger_cycle(CycleOrigin::Background) {
                self.cycle_finished(CycleOrigin::Background);
            }
        } else if attempt < 2 {
            debug!(attempt, "Sources not ready yet, waiting");
            self.wake_timer = Some(self.timers.once(self.timings.wake_retry_delay, move |id| {
                Command::Timer(id, TimerEvent::WakeCheck { attempt: attempt + 1 })
            }));
        } else {
            warn!("Sources not ready after wake, skipping this cycle");
            cycle::record_failure(
                &self.ctx,
                &HeartbeatError::Capture("frame sources not ready after wake".to_string()),
            );
            self.set_state(RunState::BackgroundArmed);
            self.return_to_background();
        }
    }

    fn cycle_finished(&mut self, origin: CycleOrigin) {
        if origin != CycleOrigin::Background {
            return;
        }
        if self.state == RunState::BackgroundExecuting {
            self.set_state(RunState::BackgroundArmed);
        }
        if self.woken_by_heartbeat {
            self.wake_timer = Some(self.timers.once(self.timings.settle_delay, |id| {
                Command::Timer(id, TimerEvent::ReturnToBackground)
            }));
        }
    }

    fn return_to_background(&mut self) {
        let woken = mem::take(&mut self.woken_by_heartbeat);
        let Some(display) = self.display.clone() else {
            return;
        };

        let backgrounded = display.is_backgrounded();
        let screen_off = self.screen == ScreenState::Off;
        let recording = display.is_recording();
        let stay = display.must_stay_foreground();
        debug!(woken, backgrounded, screen_off, recording, stay, "Return-to-background check");

        let blocker = if !woken {
            Some("not woken by heartbeat")
        } else if !backgrounded {
            Some("app is in the foreground")
        } else if !screen_off {
            Some("display is on")
        } else if recording {
            Some("recording in progress")
        } else if stay {
            Some("foreground required by policy")
        } else {
            None
        };

        match blocker {
            Some(reason) => debug!(reason, "Staying in foreground"),
            None => {
                info!("Display-off heartbeat done, moving to background");
                display.move_to_background();
            }
        }
    }

    // execution

    /// Spawns one cycle worker unless one is already in flight.
    fn trigger_cycle(&mut self, origin: CycleOrigin) -> bool {
        let Some(permit) = self.flight.try_acquire() else {
            warn!(?origin, "Previous heartbeat still executing, skipping");
            return false;
        };

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            cycle::execute(&ctx, &cancel).await;
            drop(permit);
            let _ = tx.send(Command::CycleFinished(origin));
        });
        true
    }
}
