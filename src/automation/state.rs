//! Join state machine.
//!
//! The machine sequences: Searching → Clicking → Waiting → Success, with
//! FailedFull / FailedTimeout → Retry → Searching loops in between. It is a
//! pure function of (state, detection snapshot, time): it never touches the
//! screen or input itself, it only tells the caller what to do next.

use chrono::{DateTime, Local};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::automation::detection::DetectionSnapshot;
use crate::capture::Point;
use crate::input::timing::{secs, uniform};

/// Upper bound on a single retry delay.
const LONGEST_RETRY_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Join state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinState {
    /// Stopped, waiting for `start()`
    Idle,
    /// Looking for the game window and the join button
    Searching,
    /// Join button found, click pending
    Clicking,
    /// Clicked, waiting for the outcome
    Waiting,
    /// Joined the server
    Success,
    /// Server full popup seen
    FailedFull,
    /// No outcome in time, or kicked back to the server list
    FailedTimeout,
    /// Waiting out the retry delay
    Retry,
}

impl JoinState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinState::Idle => "IDLE",
            JoinState::Searching => "SEARCHING",
            JoinState::Clicking => "CLICKING",
            JoinState::Waiting => "WAITING",
            JoinState::Success => "SUCCESS",
            JoinState::FailedFull => "FAILED_FULL",
            JoinState::FailedTimeout => "FAILED_TIMEOUT",
            JoinState::Retry => "RETRY",
        }
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinState::Idle => write!(f, "Idle"),
            JoinState::Searching => write!(f, "Searching"),
            JoinState::Clicking => write!(f, "Clicking"),
            JoinState::Waiting => write!(f, "Waiting for result"),
            JoinState::Success => write!(f, "Success"),
            JoinState::FailedFull => write!(f, "Server full"),
            JoinState::FailedTimeout => write!(f, "Timed out"),
            JoinState::Retry => write!(f, "Retrying"),
        }
    }
}

/// What the caller should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Click the join button at this screen position.
    Click { x: i32, y: i32 },
    /// Dismiss the "server full" popup.
    DismissPopup,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::DismissPopup => "dismiss_popup",
        }
    }
}

/// Timing and retry budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    /// Longest wait for an outcome after clicking (seconds).
    pub timeout_seconds: f64,
    pub retry_delay_min: f64,
    pub retry_delay_max: f64,
    /// 0 means unlimited.
    pub max_retries: u32,
    /// How long the window may stay missing while searching (seconds).
    pub window_timeout: f64,
    /// Seeing the server list earlier than this after clicking is not a kick (seconds).
    pub list_screen_grace: f64,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 15.0,
            retry_delay_min: 1.0,
            retry_delay_max: 3.0,
            max_retries: 0,
            window_timeout: 10.0,
            list_screen_grace: 2.0,
        }
    }
}

/// Snapshot of the machine for display.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionInfo {
    pub state: JoinState,
    /// Seconds since the current state was entered.
    pub time_in_state: f64,
    pub retry_count: u32,
    pub total_clicks: u32,
    pub started_at: Option<DateTime<Local>>,
    /// Seconds since `start()`.
    pub elapsed: Option<f64>,
    pub last_error: Option<String>,
}

/// Handle for removing a registered state-change callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type StateCallback = Box<dyn FnMut(JoinState, JoinState) + Send>;

/// State together with the data only that state needs.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle,
    Searching { window_lost_since: Option<Instant> },
    Clicking { target: Option<Point> },
    Waiting { since: Instant },
    Success,
    FailedFull,
    FailedTimeout,
    Retry { wake_at: Option<Instant> },
}

impl Phase {
    fn state(&self) -> JoinState {
        match self {
            Phase::Idle => JoinState::Idle,
            Phase::Searching { .. } => JoinState::Searching,
            Phase::Clicking { .. } => JoinState::Clicking,
            Phase::Waiting { .. } => JoinState::Waiting,
            Phase::Success => JoinState::Success,
            Phase::FailedFull => JoinState::FailedFull,
            Phase::FailedTimeout => JoinState::FailedTimeout,
            Phase::Retry { .. } => JoinState::Retry,
        }
    }
}

pub struct JoinStateMachine {
    config: StateMachineConfig,
    phase: Phase,
    entered_at: Instant,
    retry_count: u32,
    total_clicks: u32,
    started: Option<(Instant, DateTime<Local>)>,
    last_error: Option<String>,
    callbacks: Vec<(CallbackId, StateCallback)>,
    next_callback: u64,
    rng: StdRng,
}

impl JoinStateMachine {
    pub fn new(config: StateMachineConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            entered_at: Instant::now(),
            retry_count: 0,
            total_clicks: 0,
            started: None,
            last_error: None,
            callbacks: Vec::new(),
            next_callback: 0,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Makes retry delays reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    pub fn state(&self) -> JoinState {
        self.phase.state()
    }

    /// Position the next `Clicking` tick will click, if any.
    pub fn pending_click(&self) -> Option<Point> {
        match self.phase {
            Phase::Clicking { target } => target,
            _ => None,
        }
    }

    /// Removes and returns the pending click position.
    ///
    /// A `Clicking` tick without a position falls back to `Searching`.
    pub fn take_pending_click(&mut self) -> Option<Point> {
        match &mut self.phase {
            Phase::Clicking { target } => target.take(),
            _ => None,
        }
    }

    pub fn info(&self) -> SessionInfo {
        self.info_at(Instant::now())
    }

    pub fn info_at(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            state: self.state(),
            time_in_state: now.saturating_duration_since(self.entered_at).as_secs_f64(),
            retry_count: self.retry_count,
            total_clicks: self.total_clicks,
            started_at: self.started.map(|(_, wall)| wall),
            elapsed: self
                .started
                .map(|(at, _)| now.saturating_duration_since(at).as_secs_f64()),
            last_error: self.last_error.clone(),
        }
    }

    /// Registers a callback run on every real state change.
    pub fn on_state_change<F>(&mut self, callback: F) -> CallbackId
    where
        F: FnMut(JoinState, JoinState) + Send + 'static,
    {
        let id = CallbackId(self.next_callback);
        self.next_callback += 1;
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    /// Returns false if the callback was not registered.
    pub fn remove_state_change_callback(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(cb_id, _)| *cb_id != id);
        self.callbacks.len() != before
    }

    /// Starts searching. Returns false unless the machine is idle.
    pub fn start(&mut self) -> bool {
        self.start_at(Instant::now())
    }

    pub fn start_at(&mut self, now: Instant) -> bool {
        if self.phase != Phase::Idle {
            return false;
        }
        self.started = Some((now, Local::now()));
        self.retry_count = 0;
        self.total_clicks = 0;
        self.last_error = None;
        log::info!("Join session started");
        self.transition(
            Phase::Searching {
                window_lost_since: None,
            },
            now,
            None,
        );
        true
    }

    /// Returns to idle from any state.
    pub fn stop(&mut self) {
        self.transition(Phase::Idle, Instant::now(), None);
    }

    /// Clears counters and the last error without changing state.
    pub fn reset_stats(&mut self) {
        self.retry_count = 0;
        self.total_clicks = 0;
        self.last_error = None;
    }

    /// Advances one tick using the current time.
    pub fn update(&mut self, snapshot: Option<&DetectionSnapshot>) -> Option<Action> {
        self.update_at(snapshot, Instant::now())
    }

    /// Advances one tick at `now`. `None` counts as a snapshot where nothing
    /// was seen.
    pub fn update_at(&mut self, snapshot: Option<&DetectionSnapshot>, now: Instant) -> Option<Action> {
        let empty = DetectionSnapshot::default();
        let snap = snapshot.unwrap_or(&empty);
        let mut action = None;

        match self.phase {
            Phase::Idle | Phase::Success => {}

            Phase::Searching { window_lost_since } => {
                if !snap.window_found {
                    match window_lost_since {
                        None => {
                            self.phase = Phase::Searching {
                                window_lost_since: Some(now),
                            };
                        }
                        Some(lost) => {
                            let missing = now.saturating_duration_since(lost);
                            if missing >= secs(self.config.window_timeout) {
                                self.transition(Phase::Idle, now, Some("Window not found"));
                            }
                        }
                    }
                } else {
                    self.phase = Phase::Searching {
                        window_lost_since: None,
                    };
                    if let Some(target) = snap.join_button {
                        self.transition(
                            Phase::Clicking {
                                target: Some(target),
                            },
                            now,
                            None,
                        );
                    }
                }
            }

            Phase::Clicking { target } => match target {
                Some(p) => {
                    action = Some(Action::Click { x: p.x, y: p.y });
                    self.total_clicks += 1;
                    self.transition(Phase::Waiting { since: now }, now, None);
                }
                None => {
                    self.transition(
                        Phase::Searching {
                            window_lost_since: None,
                        },
                        now,
                        Some("No click position available"),
                    );
                }
            },

            Phase::Waiting { since } => {
                let waited = now.saturating_duration_since(since);
                if snap.loading || snap.spawn_screen {
                    self.transition(Phase::Success, now, None);
                } else if snap.server_full {
                    self.transition(Phase::FailedFull, now, Some("Server full"));
                } else if waited >= secs(self.config.timeout_seconds) {
                    self.transition(Phase::FailedTimeout, now, Some("Timeout waiting for result"));
                } else if snap.server_list && waited > secs(self.config.list_screen_grace) {
                    self.transition(Phase::FailedTimeout, now, Some("Kicked to server list"));
                }
            }

            Phase::FailedFull => {
                action = Some(Action::DismissPopup);
                self.retry_or_give_up(now);
            }

            Phase::FailedTimeout => {
                self.retry_or_give_up(now);
            }

            Phase::Retry { wake_at } => {
                if wake_at.is_none_or(|wake| now >= wake) {
                    self.transition(
                        Phase::Searching {
                            window_lost_since: None,
                        },
                        now,
                        None,
                    );
                }
            }
        }

        action
    }

    fn retry_or_give_up(&mut self, now: Instant) {
        self.retry_count += 1;
        let max = self.config.max_retries;
        if max > 0 && self.retry_count >= max {
            self.transition(Phase::Idle, now, Some("Max retries reached"));
            return;
        }
        let delay = uniform(&mut self.rng, self.config.retry_delay_min, self.config.retry_delay_max);
        log::info!("Retry {} in {:.1}s", self.retry_count, delay);
        self.transition(
            Phase::Retry {
                wake_at: now.checked_add(secs(delay).min(LONGEST_RETRY_WAIT)),
            },
            now,
            None,
        );
    }

    fn transition(&mut self, next: Phase, now: Instant, error: Option<&str>) {
        let old = self.state();
        let new = next.state();
        if old == new {
            return;
        }
        self.phase = next;
        self.entered_at = now;
        if let Some(msg) = error {
            log::warn!("{} -> {}: {}", old, new, msg);
            self.last_error = Some(msg.to_string());
        } else {
            log::info!("{} -> {}", old, new);
        }

        for (id, callback) in &mut self.callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(old, new))).is_err() {
                log::error!("State change callback {:?} panicked ({} -> {})", id, old, new);
            }
        }
    }
}

impl fmt::Debug for JoinStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info();
        write!(
            f,
            "JoinStateMachine(state={}, time_in_state={:.1}s, retries={}, clicks={})",
            info.state.as_str(),
            info.time_in_state,
            info.retry_count,
            info.total_clicks
        )
    }
}
