//! Call State Machine.
//!
//! One call session at a time, solo or group:
//!
//! ```text
//! Idle → Dialing ─┐
//! Idle → Ringing ─┴→ Connecting → Active ⇄ GroupActive
//!          any non-terminal state → Ending → Idle
//! ```
//!
//! Transitions happen synchronously under the machine's lock; signaling is sent
//! afterwards on spawned tasks. Results of those tasks, and inbound signals,
//! are checked against the current call id so that anything belonging to a
//! superseded call is dropped.

mod watchdog;

pub use watchdog::Timeouts;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use commsdk_protocol::media::{MediaPacket, MediaPacketType};
use commsdk_protocol::messages::Signal;
use commsdk_protocol::types::{CallDirection, CallId, MediaMode, Target, UserId};

use crate::capture::{recording, CaptureSessionManager, ConsumerId, FrameConsumer, VideoFrame};
use crate::config::CoreConfig;
use crate::error::{CallError, TransportError};
use crate::events::{EventBus, Notification};
use crate::link::SessionLink;
use crate::messaging::normalize_phone;
use crate::records::{self, CallRecord, Record, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    Connecting,
    Active,
    GroupActive,
    Ending,
}

impl CallState {
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Idle, Dialing | Ringing) => true,
            (Dialing | Ringing, Connecting) => true,
            (Connecting, Active | GroupActive) => true,
            (Active, GroupActive) | (GroupActive, Active) => true,
            (Ending, Idle) => true,
            (Idle | Ending, Ending) => false,
            (_, Ending) => true,
            _ => false,
        }
    }

    /// Media is expected to flow: the watchdogs run.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Active | Self::GroupActive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    /// The callee was already in a call.
    Busy,
    Failed(String),
    /// Auto-hangup after the connection stalled past the timeout.
    ConnectionTimeout,
    Disconnected,
}

/// Snapshot of the current call.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: CallId,
    pub target: Target,
    /// Display name of the remote party (1:1 calls).
    pub remote_name: Option<String>,
    /// Remote participants currently in the call.
    pub members: BTreeSet<UserId>,
    pub mode: MediaMode,
    pub direction: CallDirection,
    pub state: CallState,
    /// Video offered by the caller (incoming calls).
    pub offered_video: bool,
    pub started_at: Instant,
    pub connected_at: Option<Instant>,
}

/// Receives media of the active call for playback.
pub trait CallMediaSink: Send + Sync {
    fn on_audio(&self, _call_id: CallId, _payload: &[u8]) {}
    fn on_video(&self, _call_id: CallId, _payload: &[u8]) {}
}

struct VideoBinding {
    consumer: ConsumerId,
    pump: JoinHandle<()>,
}

struct LiveCall {
    session: CallSession,
    started_unix_ms: u64,
    last_packet: Instant,
    last_video_packet: Instant,
    connection_stalled: bool,
    video_stalled: bool,
    audio_sequence: u32,
    watchdog: Option<JoinHandle<()>>,
    video: Option<VideoBinding>,
}

impl LiveCall {
    fn transition(&mut self, next: CallState, notes: &mut Vec<Notification>) -> bool {
        let current = self.session.state;
        if !current.can_transition_to(next) {
            debug!(call_id = self.session.id, ?current, ?next, "transition refused");
            return false;
        }
        info!(call_id = self.session.id, from = ?current, to = ?next, "call state");
        self.session.state = next;
        notes.push(Notification::CallStateChanged {
            call_id: self.session.id,
            state: next,
        });
        true
    }

    /// Active or GroupActive depending on the participant count.
    fn settled_state(&self) -> CallState {
        if self.session.members.len() > 1 {
            CallState::GroupActive
        } else {
            CallState::Active
        }
    }
}

#[derive(Default)]
struct OutputToggles {
    audio_disabled: AtomicBool,
    video_disabled: AtomicBool,
}

struct MachineState {
    call: Option<LiveCall>,
    timeouts: Timeouts,
}

struct CallInner {
    state: Mutex<MachineState>,
    link: SessionLink,
    records: Arc<dyn RecordStore>,
    events: EventBus,
    capture: CaptureSessionManager,
    output: OutputToggles,
    media_sink: Mutex<Option<Arc<dyn CallMediaSink>>>,
    jpeg_quality: u8,
}

#[derive(Clone)]
pub struct CallStateMachine {
    inner: Arc<CallInner>,
}

impl CallStateMachine {
    pub fn new(
        link: SessionLink,
        records: Arc<dyn RecordStore>,
        events: EventBus,
        capture: CaptureSessionManager,
        config: &CoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CallInner {
                state: Mutex::new(MachineState {
                    call: None,
                    timeouts: Timeouts::from_config(config),
                }),
                link,
                records,
                events,
                capture,
                output: OutputToggles::default(),
                media_sink: Mutex::new(None),
                jpeg_quality: config.jpeg_quality,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MachineState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_all(&self, notes: Vec<Notification>) {
        for n in notes {
            self.inner.events.emit(n);
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn state(&self) -> CallState {
        self.lock()
            .call
            .as_ref()
            .map_or(CallState::Idle, |c| c.session.state)
    }

    pub fn current_call(&self) -> Option<CallSession> {
        self.lock().call.as_ref().map(|c| c.session.clone())
    }

    pub fn is_in_call(&self) -> bool {
        self.lock().call.is_some()
    }

    /// Remote participants of the current call.
    pub fn active_members(&self) -> Vec<UserId> {
        self.lock()
            .call
            .as_ref()
            .map(|c| c.session.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Id and display name of the other party in a 1:1 call.
    pub fn remote_party(&self) -> Option<(UserId, String)> {
        let st = self.lock();
        let session = &st.call.as_ref()?.session;
        let id = match &session.target {
            Target::User(id) | Target::Phone(id) => id.clone(),
            Target::Group(_) => return None,
        };
        let name = session.remote_name.clone().unwrap_or_else(|| id.clone());
        Some((id, name))
    }

    // ── Timeouts and output toggles ───────────────────────────────────

    pub fn timeouts(&self) -> Timeouts {
        self.lock().timeouts
    }

    pub fn set_connection_timeout(&self, timeout: Duration) {
        self.lock().timeouts.connection_timeout = timeout;
    }

    pub fn set_video_stall_timeout(&self, timeout: Duration) {
        self.lock().timeouts.video_stall = timeout;
    }

    pub fn set_connection_stall_timeout(&self, timeout: Duration) {
        self.lock().timeouts.connection_stall = timeout;
    }

    pub fn set_hangup_on_connection_timeout(&self, enabled: bool) {
        self.lock().timeouts.hangup_on_connection_timeout = enabled;
    }

    pub fn disable_media_output(&self, disabled: bool) {
        self.disable_audio_output(disabled);
        self.disable_video_output(disabled);
    }

    pub fn disable_audio_output(&self, disabled: bool) {
        self.inner.output.audio_disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn disable_video_output(&self, disabled: bool) {
        self.inner.output.video_disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn audio_output_disabled(&self) -> bool {
        self.inner.output.audio_disabled.load(Ordering::Relaxed)
    }

    pub fn video_output_disabled(&self) -> bool {
        self.inner.output.video_disabled.load(Ordering::Relaxed)
    }

    pub fn set_media_sink(&self, sink: Option<Arc<dyn CallMediaSink>>) {
        *self
            .inner
            .media_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = sink;
    }

    // ── Outgoing calls ────────────────────────────────────────────────

    /// Call a phone number (PSTN).
    pub fn call_number(&self, number: &str, video: bool) -> Result<CallId, CallError> {
        let number = normalize_phone(number).ok_or_else(|| CallError::InvalidNumber(number.to_string()))?;
        let members = BTreeSet::from([number.clone()]);
        self.dial(Target::Phone(number), None, members, video)
    }

    pub fn call_peer(&self, user_id: &str, video: bool) -> Result<CallId, CallError> {
        self.call_peer_in_group(user_id, video, None)
    }

    /// Call a peer, optionally as a call of one of their groups.
    pub fn call_peer_in_group(
        &self,
        user_id: &str,
        video: bool,
        group_id: Option<&str>,
    ) -> Result<CallId, CallError> {
        match group_id {
            Some(gid) => {
                let me = self.inner.link.user_id().ok_or(CallError::NotConnected)?;
                let group = records::group(self.inner.records.as_ref(), gid)
                    .ok_or_else(|| CallError::UnknownCallee(gid.to_string()))?;
                if !group.is_member(user_id) {
                    return Err(CallError::UnknownCallee(user_id.to_string()));
                }
                let members = group.members().iter().filter(|m| **m != me).cloned().collect();
                self.dial(Target::Group(group.id.clone()), Some(group.name), members, video)
            }
            None => {
                let identity = records::identity(self.inner.records.as_ref(), user_id)
                    .ok_or_else(|| CallError::UnknownCallee(user_id.to_string()))?;
                let members = BTreeSet::from([identity.id.clone()]);
                self.dial(Target::User(identity.id), Some(identity.display_name), members, video)
            }
        }
    }

    /// Call every member of a group.
    pub fn call_group(&self, group_id: &str, video: bool) -> Result<CallId, CallError> {
        let me = self.inner.link.user_id().ok_or(CallError::NotConnected)?;
        let group = records::group(self.inner.records.as_ref(), group_id)
            .ok_or_else(|| CallError::UnknownCallee(group_id.to_string()))?;
        let members: BTreeSet<UserId> =
            group.members().iter().filter(|m| **m != me).cloned().collect();
        if members.is_empty() {
            return Err(CallError::UnknownCallee(group_id.to_string()));
        }
        self.dial(Target::Group(group.id.clone()), Some(group.name), members, video)
    }

    fn dial(
        &self,
        target: Target,
        remote_name: Option<String>,
        members: BTreeSet<UserId>,
        video: bool,
    ) -> Result<CallId, CallError> {
        let me = self.inner.link.user_id().ok_or(CallError::NotConnected)?;
        let call_id = uuid::Uuid::new_v4().as_u64_pair().0;
        let mode = if video { MediaMode::Video } else { MediaMode::AudioOnly };

        let mut notes = Vec::new();
        {
            let mut st = self.lock();
            if st.call.is_some() {
                return Err(CallError::Busy);
            }
            let mut call = new_live_call(
                call_id,
                target.clone(),
                remote_name,
                members.clone(),
                mode,
                CallDirection::Outgoing,
                video,
            );
            call.transition(CallState::Dialing, &mut notes);
            st.call = Some(call);
        }
        self.emit_all(notes);

        let from_name = records::identity(self.inner.records.as_ref(), &me)
            .map(|i| i.display_name)
            .unwrap_or_else(|| me.clone());
        self.send_for_call(
            call_id,
            Signal::Invite {
                call_id,
                from: me,
                from_name,
                target,
                video,
                members: members.into_iter().collect(),
            },
        );
        Ok(call_id)
    }

    // ── Incoming calls ────────────────────────────────────────────────

    /// Answer the ringing call.
    pub fn take_call(&self, use_video: bool) -> Result<(), CallError> {
        let mut notes = Vec::new();
        let (call_id, video) = {
            let mut st = self.lock();
            let Some(call) = st.call.as_mut() else {
                return Err(CallError::InvalidState(format!("{:?}", CallState::Idle)));
            };
            if call.session.state != CallState::Ringing {
                return Err(CallError::InvalidState(format!("{:?}", call.session.state)));
            }
            let video = use_video && call.session.offered_video;
            call.session.mode = if video { MediaMode::Video } else { MediaMode::AudioOnly };
            self.enter_connecting(call, &mut notes);
            (call.session.id, video)
        };
        self.emit_all(notes);
        if video {
            self.bind_video(call_id);
        }
        self.send_for_call(call_id, Signal::Accept { call_id, video });
        Ok(())
    }

    fn enter_connecting(&self, call: &mut LiveCall, notes: &mut Vec<Notification>) {
        if call.transition(CallState::Connecting, notes) {
            let now = Instant::now();
            call.last_packet = now;
            call.last_video_packet = now;
            call.watchdog = Some(watchdog::spawn(Arc::downgrade(&self.inner), call.session.id));
        }
    }

    fn on_invite(
        &self,
        call_id: CallId,
        from: UserId,
        from_name: String,
        target: Target,
        video: bool,
        members: Vec<UserId>,
    ) {
        let me = self.inner.link.user_id();
        if me.as_deref() == Some(from.as_str()) {
            return;
        }
        let (target, members) = match target {
            Target::Group(gid) => {
                let mut set: BTreeSet<UserId> = members
                    .into_iter()
                    .filter(|m| Some(m.as_str()) != me.as_deref())
                    .collect();
                set.insert(from.clone());
                (Target::Group(gid), set)
            }
            _ => (Target::User(from.clone()), BTreeSet::from([from.clone()])),
        };
        let mode = if video { MediaMode::Video } else { MediaMode::AudioOnly };

        let mut notes = Vec::new();
        let busy = {
            let mut st = self.lock();
            if st.call.is_some() {
                true
            } else {
                let mut call = new_live_call(
                    call_id,
                    target.clone(),
                    Some(from_name),
                    members,
                    mode,
                    CallDirection::Incoming,
                    video,
                );
                call.transition(CallState::Ringing, &mut notes);
                st.call = Some(call);
                false
            }
        };

        if busy {
            info!(call_id, from = %from, "busy, rejecting incoming call");
            self.send_detached(Signal::Reject { call_id });
            self.write_call_record(&CallRecord {
                id: call_id.to_string(),
                contact: from,
                direction: CallDirection::Incoming,
                video,
                missed: true,
                duration_secs: 0,
                timestamp: crate::unix_millis(),
            });
            return;
        }

        notes.push(Notification::IncomingCall { call_id, from, video });
        self.emit_all(notes);
    }

    // ── Ending ────────────────────────────────────────────────────────

    /// Hang up the current call, whatever its state.
    pub fn hang_up(&self) -> Result<(), CallError> {
        let call_id = self.current_id().ok_or_else(|| CallError::InvalidState("Idle".into()))?;
        if self.end_call(call_id, EndReason::LocalHangup) {
            self.send_detached(Signal::Hangup { call_id });
        }
        Ok(())
    }

    /// Decline the current call. A ringing call is rejected, anything else
    /// is hung up.
    pub fn reject_call(&self) -> Result<(), CallError> {
        let (call_id, state) = {
            let st = self.lock();
            let call = st.call.as_ref().ok_or_else(|| CallError::InvalidState("Idle".into()))?;
            (call.session.id, call.session.state)
        };
        if self.end_call(call_id, EndReason::Rejected) {
            let signal = if state == CallState::Ringing {
                Signal::Reject { call_id }
            } else {
                Signal::Hangup { call_id }
            };
            self.send_detached(signal);
        }
        Ok(())
    }

    fn current_id(&self) -> Option<CallId> {
        self.lock().call.as_ref().map(|c| c.session.id)
    }

    /// Move `call_id` through Ending to Idle. Returns false if that call is no
    /// longer current.
    pub(crate) fn end_call(&self, call_id: CallId, reason: EndReason) -> bool {
        let mut notes = Vec::new();
        let mut call = {
            let mut st = self.lock();
            match st.call.as_ref() {
                Some(c) if c.session.id == call_id && c.session.state != CallState::Ending => {}
                _ => return false,
            }
            let Some(mut call) = st.call.take() else {
                return false;
            };
            call.transition(CallState::Ending, &mut notes);
            call
        };

        if let Some(watchdog) = call.watchdog.take() {
            watchdog.abort();
        }
        if let Some(binding) = call.video.take() {
            binding.pump.abort();
            self.inner.capture.stop_capture_for_consumer(binding.consumer);
        }

        let session = &call.session;
        let duration_secs = session
            .connected_at
            .map_or(0, |t| t.elapsed().as_secs());
        self.write_call_record(&CallRecord {
            id: call_id.to_string(),
            contact: match &session.target {
                Target::User(id) | Target::Group(id) | Target::Phone(id) => id.clone(),
            },
            direction: session.direction,
            video: session.mode == MediaMode::Video,
            missed: session.direction == CallDirection::Incoming && session.connected_at.is_none(),
            duration_secs,
            timestamp: call.started_unix_ms,
        });

        call.transition(CallState::Idle, &mut notes);
        match &reason {
            EndReason::Failed(_) | EndReason::ConnectionTimeout => {
                warn!(call_id, ?reason, duration_secs, "call ended")
            }
            _ => info!(call_id, ?reason, duration_secs, "call ended"),
        }
        notes.push(Notification::CallEnded { call_id, reason });
        self.emit_all(notes);
        true
    }

    /// End any call, e.g. when the session goes away.
    pub(crate) fn end_all(&self, reason: EndReason) {
        if let Some(call_id) = self.current_id() {
            self.end_call(call_id, reason);
        }
    }

    fn write_call_record(&self, record: &CallRecord) {
        self.inner.records.put(Record::Call(record.clone()));
    }

    // ── Signaling ─────────────────────────────────────────────────────

    /// Send signaling for a call; a failure ends that call if it is still
    /// current and not yet established.
    fn send_for_call(&self, call_id: CallId, signal: Signal) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.inner.link.send(signal).await {
                this.on_signaling_failure(call_id, e);
            }
        });
    }

    fn on_signaling_failure(&self, call_id: CallId, error: TransportError) {
        let state = {
            let st = self.lock();
            match st.call.as_ref() {
                Some(c) if c.session.id == call_id => c.session.state,
                _ => {
                    debug!(call_id, "discarding signaling failure for superseded call");
                    return;
                }
            }
        };
        if matches!(state, CallState::Dialing | CallState::Ringing | CallState::Connecting) {
            warn!(call_id, ?state, "signaling failed: {error}");
            self.end_call(call_id, EndReason::Failed(error.to_string()));
        }
    }

    fn send_detached(&self, signal: Signal) {
        let link = self.inner.link.clone();
        tokio::spawn(async move {
            if let Err(e) = link.send(signal).await {
                debug!("signal not sent: {e}");
            }
        });
    }

    /// Inbound call signaling.
    pub(crate) fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::Invite {
                call_id,
                from,
                from_name,
                target,
                video,
                members,
            } => self.on_invite(call_id, from, from_name, target, video, members),
            Signal::Accept { call_id, video } => self.on_accept(call_id, video),
            Signal::Reject { call_id } => {
                let ended = self.end_call(call_id, EndReason::Rejected);
                log_stale(call_id, ended);
            }
            Signal::Hangup { call_id } => {
                let ended = self.end_call(call_id, EndReason::RemoteHangup);
                log_stale(call_id, ended);
            }
            Signal::CallFailed { call_id, reason } => {
                let reason = if reason.eq_ignore_ascii_case("busy") {
                    EndReason::Busy
                } else {
                    EndReason::Failed(reason)
                };
                let ended = self.end_call(call_id, reason);
                log_stale(call_id, ended);
            }
            Signal::MediaFlowing { call_id } => self.on_media_flowing(call_id, Instant::now()),
            Signal::MemberJoined { call_id, user_id } => self.on_membership(call_id, user_id, true),
            Signal::MemberLeft { call_id, user_id } => self.on_membership(call_id, user_id, false),
            _ => {}
        }
    }

    fn on_accept(&self, call_id: CallId, video: bool) {
        let mut notes = Vec::new();
        let bind = {
            let mut st = self.lock();
            let Some(call) = st.call.as_mut().filter(|c| c.session.id == call_id) else {
                log_stale(call_id, false);
                return;
            };
            if call.session.state != CallState::Dialing {
                return;
            }
            if !video {
                call.session.mode = MediaMode::AudioOnly;
            }
            self.enter_connecting(call, &mut notes);
            call.session.mode == MediaMode::Video
        };
        self.emit_all(notes);
        if bind {
            self.bind_video(call_id);
        }
    }

    fn on_media_flowing(&self, call_id: CallId, now: Instant) {
        let mut notes = Vec::new();
        {
            let mut st = self.lock();
            let Some(call) = st.call.as_mut().filter(|c| c.session.id == call_id) else {
                return;
            };
            promote_if_connecting(call, now, &mut notes);
        }
        self.emit_all(notes);
    }

    fn on_membership(&self, call_id: CallId, user_id: UserId, joined: bool) {
        let mut notes = Vec::new();
        let empty = {
            let mut st = self.lock();
            let Some(call) = st.call.as_mut().filter(|c| c.session.id == call_id) else {
                return;
            };
            if joined {
                call.session.members.insert(user_id);
            } else {
                call.session.members.remove(&user_id);
            }
            if matches!(call.session.state, CallState::Active | CallState::GroupActive) {
                let next = call.settled_state();
                if next != call.session.state {
                    call.transition(next, &mut notes);
                }
            }
            call.session.members.is_empty()
        };
        self.emit_all(notes);
        if empty {
            self.end_call(call_id, EndReason::RemoteHangup);
        }
    }

    // ── Media ─────────────────────────────────────────────────────────

    /// Inbound call media. Feeds the watchdogs and the host's media sink.
    pub(crate) fn on_media_packet(&self, packet: MediaPacket) {
        let now = Instant::now();
        let mut notes = Vec::new();
        {
            let mut st = self.lock();
            let Some(call) = st.call.as_mut().filter(|c| c.session.id == packet.call_id) else {
                return;
            };
            call.last_packet = now;
            if call.connection_stalled {
                call.connection_stalled = false;
                info!(call_id = packet.call_id, "connection resumed");
                notes.push(Notification::ConnectionResumed { call_id: packet.call_id });
            }
            if packet.packet_type == MediaPacketType::Video {
                call.last_video_packet = now;
                if call.video_stalled {
                    call.video_stalled = false;
                    info!(call_id = packet.call_id, "video resumed");
                    notes.push(Notification::VideoResumed { call_id: packet.call_id });
                }
            }
            promote_if_connecting(call, now, &mut notes);
        }
        self.emit_all(notes);

        let sink = self
            .inner
            .media_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            match packet.packet_type {
                MediaPacketType::Audio if !self.audio_output_disabled() => {
                    sink.on_audio(packet.call_id, &packet.payload)
                }
                MediaPacketType::Video if !self.video_output_disabled() => {
                    sink.on_video(packet.call_id, &packet.payload)
                }
                _ => {}
            }
        }
    }

    /// Send one encoded audio frame for the current call.
    pub fn send_audio(&self, payload: Vec<u8>) -> Result<(), CallError> {
        if self.inner.capture.is_audio_muted() {
            return Ok(());
        }
        let (call_id, sequence) = {
            let mut st = self.lock();
            let call = st
                .call
                .as_mut()
                .filter(|c| c.session.state.is_live())
                .ok_or_else(|| CallError::InvalidState("no live call".into()))?;
            call.audio_sequence = call.audio_sequence.wrapping_add(1);
            (call.session.id, call.audio_sequence)
        };
        let link = self.inner.link.clone();
        tokio::spawn(async move {
            if let Err(e) = link.send_media(MediaPacket::audio(call_id, sequence, payload)).await {
                debug!(call_id, "audio packet not sent: {e}");
            }
        });
        Ok(())
    }

    /// Attach the camera to the call's outbound video.
    fn bind_video(&self, call_id: CallId) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(4);
        let consumer = Arc::new(OutboundVideo {
            tx,
            quality: self.inner.jpeg_quality,
        });
        let Some(consumer_id) = self.inner.capture.add_frame_consumer(consumer) else {
            warn!(call_id, "no capture slot for outbound video");
            return;
        };
        let link = self.inner.link.clone();
        let pump = tokio::spawn(async move {
            let mut sequence = 0u32;
            while let Some(jpeg) = rx.recv().await {
                sequence = sequence.wrapping_add(1);
                if let Err(e) = link.send_media(MediaPacket::video(call_id, sequence, jpeg)).await {
                    debug!(call_id, "video packet not sent: {e}");
                }
            }
        });

        let stale = {
            let mut st = self.lock();
            match st.call.as_mut().filter(|c| c.session.id == call_id) {
                Some(call) => {
                    info!(call_id, "outbound video bound to capture");
                    call.video = Some(VideoBinding {
                        consumer: consumer_id,
                        pump,
                    });
                    None
                }
                None => Some(pump),
            }
        };
        // The call ended while binding.
        if let Some(pump) = stale {
            pump.abort();
            self.inner.capture.stop_capture_for_consumer(consumer_id);
        }
    }
}

fn new_live_call(
    id: CallId,
    target: Target,
    remote_name: Option<String>,
    members: BTreeSet<UserId>,
    mode: MediaMode,
    direction: CallDirection,
    offered_video: bool,
) -> LiveCall {
    let now = Instant::now();
    LiveCall {
        session: CallSession {
            id,
            target,
            remote_name,
            members,
            mode,
            direction,
            state: CallState::Idle,
            offered_video,
            started_at: now,
            connected_at: None,
        },
        started_unix_ms: crate::unix_millis(),
        last_packet: now,
        last_video_packet: now,
        connection_stalled: false,
        video_stalled: false,
        audio_sequence: 0,
        watchdog: None,
        video: None,
    }
}

fn promote_if_connecting(call: &mut LiveCall, now: Instant, notes: &mut Vec<Notification>) {
    if call.session.state != CallState::Connecting {
        return;
    }
    let next = call.settled_state();
    if call.transition(next, notes) {
        call.session.connected_at = Some(now);
        call.last_packet = now;
        call.last_video_packet = now;
    }
}

fn log_stale(call_id: CallId, ended: bool) {
    if !ended {
        debug!(call_id, "discarding signal for superseded call");
    }
}

/// Encodes camera frames for the call and hands them to the send pump.
struct OutboundVideo {
    tx: mpsc::Sender<Vec<u8>>,
    quality: u8,
}

impl FrameConsumer for OutboundVideo {
    fn on_frame(&self, frame: &VideoFrame) {
        match recording::encode_jpeg(frame, self.quality) {
            // A full queue means the network is behind; drop the frame.
            Ok(jpeg) => {
                let _ = self.tx.try_send(jpeg);
            }
            Err(e) => debug!("outbound frame not encoded: {e}"),
        }
    }
}
