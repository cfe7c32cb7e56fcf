//! Guild-wide on/off control.
//!
//! A view is opened by the settings command and stays usable until it has
//! gone `timeout` without a press. After that it is inert: presses are
//! rejected without touching any state.

use std::time::Duration;

use tokio::time::Instant;

use crate::state::{PartialToggle, StateCache};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Active,
    Expired,
}

#[derive(Debug)]
pub enum PressOutcome {
    Toggled { enabled: bool, channels: usize },
    Expired,
    Failed(PartialToggle),
}

#[derive(Debug)]
pub struct ToggleView {
    enabled: bool,
    state: ViewState,
    last_interaction: Instant,
    timeout: Duration,
}

impl ToggleView {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            enabled,
            state: ViewState::Active,
            last_interaction: Instant::now(),
            timeout,
        }
    }

    /// Current state, moving to `Expired` once the timeout has elapsed.
    pub fn state(&mut self) -> ViewState {
        if self.state == ViewState::Active && self.last_interaction.elapsed() >= self.timeout {
            self.state = ViewState::Expired;
        }
        self.state
    }

    /// Guild-wide flag the view will flip away from.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Flip every channel in `channel_ids` to the opposite of the view's flag.
    pub async fn press(&mut self, state: &StateCache, channel_ids: &[u64]) -> PressOutcome {
        if self.state() == ViewState::Expired {
            return PressOutcome::Expired;
        }
        self.last_interaction = Instant::now();

        let target = !self.enabled;
        match state.set_channels_enabled(channel_ids, target).await {
            Ok(channels) => {
                self.enabled = target;
                PressOutcome::Toggled {
                    enabled: target,
                    channels,
                }
            }
            Err(partial) => PressOutcome::Failed(partial),
        }
    }
}
