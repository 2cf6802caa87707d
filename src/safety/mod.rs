//! Safety gate
//!
//! A three-state machine deciding whether the pipeline may act on what it
//! detects. Toggling is debounced by a cooldown; an emergency stop latches
//! until it is explicitly reset.

pub mod listener;

pub use listener::{Gated, InputListener};

use log::{error, info, warn};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::SafetyConfig;
use crate::utils::thread::panic_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyState {
    Idle,
    Enabled,
    EmergencyStopped,
}

impl std::fmt::Display for SafetyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyState::Idle => write!(f, "Idle"),
            SafetyState::Enabled => write!(f, "Enabled"),
            SafetyState::EmergencyStopped => write!(f, "EmergencyStopped"),
        }
    }
}

/// Operator input understood by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyInput {
    Toggle,
    Emergency,
    Reset,
    /// Emergency stop followed by an engine shutdown
    Exit,
}

impl FromStr for SafetyInput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "t" | "toggle" => Ok(SafetyInput::Toggle),
            "e" | "emergency" | "stop" => Ok(SafetyInput::Emergency),
            "r" | "reset" => Ok(SafetyInput::Reset),
            "q" | "quit" | "exit" => Ok(SafetyInput::Exit),
            other => anyhow::bail!("unknown safety input: {other}"),
        }
    }
}

type EmergencyCallback = Arc<dyn Fn() + Send + Sync>;
type ToggleCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct GateState {
    state: SafetyState,
    last_toggle: Option<Instant>,
}

#[derive(Default)]
struct Callbacks {
    emergency: Vec<EmergencyCallback>,
    toggle: Vec<ToggleCallback>,
}

/// Thread-safe safety state machine.
///
/// Callbacks are invoked after the state lock is released, so they may call
/// back into the gate.
pub struct SafetyGate {
    cooldown: Duration,
    state: Mutex<GateState>,
    callbacks: Mutex<Callbacks>,
}

impl SafetyGate {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            cooldown: config.toggle_cooldown(),
            state: Mutex::new(GateState {
                state: SafetyState::Idle,
                last_toggle: None,
            }),
            callbacks: Mutex::new(Callbacks::default()),
        }
    }

    /// Flip between `Idle` and `Enabled`.
    ///
    /// Ignored while emergency stopped or within the cooldown of the previous
    /// toggle. Returns whether the state changed.
    pub fn toggle(&self) -> bool {
        self.toggle_at(Instant::now())
    }

    pub(crate) fn toggle_at(&self, now: Instant) -> bool {
        let enabled = {
            let mut gate = self.lock();
            if gate.state == SafetyState::EmergencyStopped {
                return false;
            }
            if let Some(last) = gate.last_toggle
                && now.saturating_duration_since(last) < self.cooldown
            {
                return false;
            }

            gate.state = match gate.state {
                SafetyState::Enabled => SafetyState::Idle,
                _ => SafetyState::Enabled,
            };
            gate.last_toggle = Some(now);
            gate.state == SafetyState::Enabled
        };

        info!("Action {}", if enabled { "ENABLED" } else { "DISABLED" });

        let callbacks = self.callbacks().toggle.clone();
        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(enabled))) {
                error!("Toggle callback error: {}", panic_message(payload.as_ref()));
            }
        }
        true
    }

    /// Latch the emergency stop from any state.
    ///
    /// Callbacks fire once per trigger: triggering while already stopped
    /// changes nothing and returns `false`.
    pub fn trigger_emergency(&self) -> bool {
        {
            let mut gate = self.lock();
            if gate.state == SafetyState::EmergencyStopped {
                return false;
            }
            gate.state = SafetyState::EmergencyStopped;
        }

        warn!("EMERGENCY STOP TRIGGERED");

        let callbacks = self.callbacks().emergency.clone();
        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback())) {
                error!(
                    "Emergency callback error: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        true
    }

    /// Leave `EmergencyStopped` for `Idle`. Does nothing in any other state.
    pub fn reset_emergency(&self) -> bool {
        let mut gate = self.lock();
        if gate.state != SafetyState::EmergencyStopped {
            return false;
        }
        gate.state = SafetyState::Idle;
        info!("Emergency state reset");
        true
    }

    pub fn is_safe(&self) -> bool {
        self.state() != SafetyState::EmergencyStopped
    }

    pub fn is_action_authorized(&self) -> bool {
        self.state() == SafetyState::Enabled
    }

    pub fn state(&self) -> SafetyState {
        self.lock().state
    }

    pub fn on_emergency(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks().emergency.push(Arc::new(callback));
    }

    /// Register a callback receiving the new enabled flag after each toggle.
    pub fn on_toggle(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.callbacks().toggle.push(Arc::new(callback));
    }

    /// Apply an operator input. Returns whether the state changed.
    pub fn apply(&self, input: SafetyInput) -> bool {
        match input {
            SafetyInput::Toggle => self.toggle(),
            SafetyInput::Emergency | SafetyInput::Exit => self.trigger_emergency(),
            SafetyInput::Reset => self.reset_emergency(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGate")
            .field("state", &self.state())
            .field("cooldown", &self.cooldown)
            .finish()
    }
}
