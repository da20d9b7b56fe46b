//! Stall detection for the live call.
//!
//! A 250 ms ticker compares the time since the last inbound packet against the
//! stall thresholds. Stalls are reported once per episode; resumption is
//! reported from the packet path as soon as media arrives again.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use commsdk_protocol::messages::Signal;
use commsdk_protocol::types::{CallId, MediaMode};

use super::{CallInner, CallState, CallStateMachine, EndReason, LiveCall};
use crate::config::CoreConfig;
use crate::events::Notification;

const TICK: Duration = Duration::from_millis(250);

/// Stall and timeout thresholds. Global, kept between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Stall length after which the call is hung up, when enabled.
    pub connection_timeout: Duration,
    pub connection_stall: Duration,
    pub video_stall: Duration,
    pub hangup_on_connection_timeout: bool,
}

impl Timeouts {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            connection_timeout: Duration::from_secs(config.connection_timeout_secs),
            connection_stall: Duration::from_secs(config.connection_stall_timeout_secs),
            video_stall: Duration::from_secs(config.video_stall_timeout_secs),
            hangup_on_connection_timeout: config.hangup_on_connection_timeout,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Verdict {
    connection_stalling: bool,
    video_stalling: bool,
    hang_up: bool,
}

/// Update the stall flags of `call` for time `now`.
fn evaluate(call: &mut LiveCall, timeouts: &Timeouts, now: Instant) -> Verdict {
    let mut verdict = Verdict::default();
    if !call.session.state.is_live() {
        return verdict;
    }

    let silent = now.saturating_duration_since(call.last_packet);
    if silent >= timeouts.connection_stall && !call.connection_stalled {
        call.connection_stalled = true;
        verdict.connection_stalling = true;
    }
    if timeouts.hangup_on_connection_timeout && silent >= timeouts.connection_timeout {
        verdict.hang_up = true;
        return verdict;
    }

    let video_expected = call.session.mode == MediaMode::Video
        && matches!(call.session.state, CallState::Active | CallState::GroupActive);
    if video_expected {
        let video_silent = now.saturating_duration_since(call.last_video_packet);
        if video_silent >= timeouts.video_stall && !call.video_stalled {
            call.video_stalled = true;
            verdict.video_stalling = true;
        }
    }
    verdict
}

pub(super) fn spawn(inner: Weak<CallInner>, call_id: CallId) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if !tick(CallStateMachine { inner }, call_id) {
                break;
            }
        }
    })
}

/// One watchdog pass. Returns false once the call is gone.
fn tick(machine: CallStateMachine, call_id: CallId) -> bool {
    let verdict = {
        let mut st = machine.lock();
        let timeouts = st.timeouts;
        match st.call.as_mut().filter(|c| c.session.id == call_id) {
            Some(call) => evaluate(call, &timeouts, Instant::now()),
            None => return false,
        }
    };

    if verdict.connection_stalling {
        warn!(call_id, "connection stalling");
        machine.inner.events.emit(Notification::ConnectionStalling { call_id });
    }
    if verdict.video_stalling {
        warn!(call_id, "video stalling");
        machine.inner.events.emit(Notification::VideoStalling { call_id });
    }
    if verdict.hang_up {
        info!(call_id, "connection timed out, hanging up");
        if machine.end_call(call_id, EndReason::ConnectionTimeout) {
            machine.send_detached(Signal::Hangup { call_id });
        }
        return false;
    }
    true
}
