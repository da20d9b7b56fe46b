//! Messaging Pipeline: plain and rich-media submission and reception.
//!
//! Rich media runs in three phases, each short-circuiting on failure:
//! normalize, register in the content store (and upload), then submit a
//! reference message carrying the media key.

pub mod sms;
pub mod transcode;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use commsdk_protocol::messages::{InstantMessage, MessageBody, MessagePayload, Signal};
use commsdk_protocol::types::{
    CallDirection, DeliveryChannel, GroupId, MediaKey, MediaType, MessageId, Target, UserId,
};

use crate::capture::recording::RecordingContainer;
use crate::completion::Pending;
use crate::config::CoreConfig;
use crate::content_store::ContentStore;
use crate::error::{RetrieveError, SubmitError};
use crate::events::{EventBus, Notification};
use crate::keys::KeyTrustManager;
use crate::link::SessionLink;
use crate::records::{self, MessageRecord, MessageStatus, Record, RecordKind, RecordStore};

use transcode::{ImageQuality, MediaTranscoder, PassthroughTranscoder};

/// Where rich-media content comes from.
#[derive(Debug, Clone)]
pub enum MediaSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// Outcome of an accepted message submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceipt {
    pub message_id: MessageId,
    pub channel: DeliveryChannel,
    /// Billed SMS segments, 1 for non-SMS delivery.
    pub segments: usize,
    pub encrypted: bool,
    /// Users able to read the message (group sends exclude unverified members).
    pub recipients: Vec<UserId>,
}

/// JSON body of a `friend` rich-media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendCard {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub address: Option<String>,
}

/// JSON body of a `loc` rich-media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub label: Option<String>,
}

/// How a given submission gets encrypted.
#[derive(Debug, Clone)]
enum Sealing {
    Plain,
    ForUser(UserId),
    ForGroup(GroupId),
}

struct PipelineInner {
    link: SessionLink,
    records: Arc<dyn RecordStore>,
    store: ContentStore,
    keys: KeyTrustManager,
    events: EventBus,
    config: CoreConfig,
    prefer_encryption: AtomicBool,
    transcoder: Arc<dyn MediaTranscoder>,
}

#[derive(Clone)]
pub struct MessagingPipeline {
    inner: Arc<PipelineInner>,
}

/// Strip formatting from a phone number. `None` unless it is an optional
/// leading `+` followed by 3 to 15 digits.
pub fn normalize_phone(input: &str) -> Option<String> {
    let compact: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let digits = compact.strip_prefix('+').unwrap_or(&compact);
    let valid = (3..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit());
    valid.then_some(compact)
}

fn looks_like_phone(input: &str) -> bool {
    input
        .trim()
        .chars()
        .next()
        .is_some_and(|c| c == '+' || c.is_ascii_digit())
}

impl MessagingPipeline {
    pub fn new(
        link: SessionLink,
        records: Arc<dyn RecordStore>,
        store: ContentStore,
        keys: KeyTrustManager,
        events: EventBus,
        config: CoreConfig,
    ) -> Self {
        let prefer = config.prefer_message_encryption;
        Self {
            inner: Arc::new(PipelineInner {
                link,
                records,
                store,
                keys,
                events,
                config,
                prefer_encryption: AtomicBool::new(prefer),
                transcoder: Arc::new(PassthroughTranscoder),
            }),
        }
    }

    /// Replace the video transcoder. Only valid before the pipeline is shared.
    pub fn with_transcoder(mut self, transcoder: Arc<dyn MediaTranscoder>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.transcoder = transcoder;
        } else {
            warn!("pipeline already shared, keeping current transcoder");
        }
        self
    }

    pub fn prefer_message_encryption(&self) -> bool {
        self.inner.prefer_encryption.load(Ordering::Relaxed)
    }

    pub fn set_prefer_message_encryption(&self, prefer: bool) {
        self.inner.prefer_encryption.store(prefer, Ordering::Relaxed);
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.inner.store
    }

    // ── Target and channel resolution ─────────────────────────────────

    /// Resolve a host-supplied target. Known group and user ids win over the
    /// phone-number reading, so numeric ids stay in-app.
    pub fn resolve_target(&self, target: &str) -> Result<Target, SubmitError> {
        let trimmed = target.trim();
        if trimmed.is_empty() {
            return Err(SubmitError::InvalidTarget(target.to_string()));
        }
        let records = self.inner.records.as_ref();

        if records::group(records, trimmed).is_some() {
            return Ok(Target::Group(trimmed.to_string()));
        }
        if records::identity(records, trimmed).is_some() {
            return Ok(Target::User(trimmed.to_string()));
        }
        if trimmed.contains('@') {
            return records::identity_by_address(records, trimmed)
                .map(|i| Target::User(i.id))
                .ok_or_else(|| SubmitError::InvalidTarget(target.to_string()));
        }
        if looks_like_phone(trimmed) {
            return Self::resolve_number(trimmed);
        }
        Err(SubmitError::InvalidTarget(target.to_string()))
    }

    fn resolve_number(number: &str) -> Result<Target, SubmitError> {
        normalize_phone(number)
            .map(Target::Phone)
            .ok_or_else(|| SubmitError::InvalidTarget(number.to_string()))
    }

    fn channel_for(&self, target: &Target) -> DeliveryChannel {
        match target {
            Target::Phone(_) => DeliveryChannel::Sms,
            _ if self.inner.link.is_foreground() => DeliveryChannel::InApp,
            _ => DeliveryChannel::Push,
        }
    }

    fn plan_sealing(&self, target: &Target, prefer: bool) -> Sealing {
        if !prefer {
            return Sealing::Plain;
        }
        let keys = &self.inner.keys;
        match target {
            Target::User(id) if keys.can_submit_encrypted_to_user(id) => Sealing::ForUser(id.clone()),
            Target::Group(id) if keys.encryption_enabled() && keys.group_encryption_enabled(id) => {
                Sealing::ForGroup(id.clone())
            }
            _ => Sealing::Plain,
        }
    }

    // ── Plain messages ────────────────────────────────────────────────

    /// Submit a text message. Phone targets go out as SMS, split into segments.
    pub fn submit_message(
        &self,
        text: &str,
        target: &str,
    ) -> Pending<Result<MessageReceipt, SubmitError>> {
        let target = match self.resolve_target(target) {
            Ok(t) => t,
            Err(e) => return Pending::ready(Err(e)),
        };
        let payload = MessagePayload {
            text: text.to_string(),
            media_key: None,
        };
        let sealing = self.plan_sealing(&target, self.prefer_message_encryption());
        let this = self.clone();
        Pending::spawn(async move { this.deliver(payload, target, sealing).await })
    }

    /// Submit a text message as SMS, whatever ids the number collides with.
    pub fn submit_message_to_number(
        &self,
        text: &str,
        number: &str,
    ) -> Pending<Result<MessageReceipt, SubmitError>> {
        let target = match Self::resolve_number(number) {
            Ok(t) => t,
            Err(e) => return Pending::ready(Err(e)),
        };
        let payload = MessagePayload {
            text: text.to_string(),
            media_key: None,
        };
        let this = self.clone();
        Pending::spawn(async move { this.deliver(payload, target, Sealing::Plain).await })
    }

    /// Send a reference message for stored media, with the configured
    /// encryption preference.
    pub fn submit_rich_message(
        &self,
        key: &MediaKey,
        text: &str,
        target: &str,
    ) -> Pending<Result<MessageReceipt, SubmitError>> {
        self.submit_rich_message_with(key, text, target, self.prefer_message_encryption())
    }

    pub fn submit_rich_message_with(
        &self,
        key: &MediaKey,
        text: &str,
        target: &str,
        prefer_encryption: bool,
    ) -> Pending<Result<MessageReceipt, SubmitError>> {
        let target = match self.resolve_target(target) {
            Ok(t) => t,
            Err(e) => return Pending::ready(Err(e)),
        };
        if let Target::Phone(_) = target {
            if !key.media_type().sms_representable() {
                return Pending::ready(Err(SubmitError::UnsupportedForChannel {
                    media_type: key.media_type(),
                    channel: DeliveryChannel::Sms,
                }));
            }
        }
        let payload = MessagePayload {
            text: text.to_string(),
            media_key: Some(key.to_string()),
        };
        let sealing = self.plan_sealing(&target, prefer_encryption);
        let this = self.clone();
        Pending::spawn(async move { this.deliver(payload, target, sealing).await })
    }

    async fn deliver(
        &self,
        payload: MessagePayload,
        target: Target,
        sealing: Sealing,
    ) -> Result<MessageReceipt, SubmitError> {
        let me = self.inner.link.user_id().ok_or(SubmitError::NotConnected)?;
        let message_id = uuid::Uuid::new_v4().to_string();
        let channel = self.channel_for(&target);
        let now = crate::unix_millis();

        let (signal, segments, recipients, encrypted) = match &target {
            Target::Phone(number) => {
                // SMS carries a media reference as a trailing link.
                let text = match &payload.media_key {
                    Some(key) if payload.text.is_empty() => key.clone(),
                    Some(key) => format!("{}\n{key}", payload.text),
                    None => payload.text.clone(),
                };
                let (_, segments) = sms::segment(&text);
                let count = segments.len();
                (
                    Signal::Sms {
                        message_id: message_id.clone(),
                        from: me.clone(),
                        number: number.clone(),
                        segments,
                    },
                    count,
                    vec![number.clone()],
                    false,
                )
            }
            Target::User(_) | Target::Group(_) => {
                let recipients = self.recipients_for(&target, &sealing, &me);
                let body = self.seal_body(&payload, &sealing)?;
                let encrypted = !matches!(body, MessageBody::Plain(_));
                (
                    Signal::InstantMessage(InstantMessage {
                        message_id: message_id.clone(),
                        from: me.clone(),
                        target: target.clone(),
                        body,
                        delivery: channel,
                        recipients: recipients.clone(),
                        sent_at: now,
                    }),
                    1,
                    recipients,
                    encrypted,
                )
            }
        };

        let mut record = MessageRecord {
            id: message_id.clone(),
            peer: target,
            sender: me,
            direction: CallDirection::Outgoing,
            text: payload.text,
            media_key: payload.media_key,
            encrypted,
            status: MessageStatus::Pending,
            read: true,
            timestamp: now,
        };

        let sent = self.inner.link.send(signal).await;
        record.status = match &sent {
            Ok(()) => MessageStatus::Sent,
            Err(e) => MessageStatus::Failed(e.to_string()),
        };
        self.inner.records.put(Record::Message(record));
        sent?;

        info!(message_id, ?channel, segments, encrypted, "message submitted");
        Ok(MessageReceipt {
            message_id,
            channel,
            segments,
            encrypted,
            recipients,
        })
    }

    fn recipients_for(&self, target: &Target, sealing: &Sealing, me: &str) -> Vec<UserId> {
        match target {
            Target::User(id) => vec![id.clone()],
            Target::Group(gid) => {
                let members = match sealing {
                    Sealing::ForGroup(_) => self.inner.keys.encryption_enabled_members(gid),
                    _ => records::group(self.inner.records.as_ref(), gid)
                        .map(|g| g.members().clone())
                        .unwrap_or_default(),
                };
                members.into_iter().filter(|m| m != me).collect()
            }
            Target::Phone(number) => vec![number.clone()],
        }
    }

    fn seal_body(&self, payload: &MessagePayload, sealing: &Sealing) -> Result<MessageBody, SubmitError> {
        let encode = || postcard::to_allocvec(payload).map_err(|e| SubmitError::Encryption(e.to_string()));
        match sealing {
            Sealing::Plain => Ok(MessageBody::Plain(payload.clone())),
            Sealing::ForUser(id) => {
                let sealed = self
                    .inner
                    .keys
                    .seal_for_user(id, &encode()?)
                    .map_err(|e| SubmitError::Encryption(e.to_string()))?;
                Ok(MessageBody::Sealed(sealed))
            }
            Sealing::ForGroup(gid) => {
                let (key_id, ciphertext) = self
                    .inner
                    .keys
                    .group_encrypt(gid, &encode()?)
                    .map_err(|e| SubmitError::Encryption(e.to_string()))?;
                Ok(MessageBody::GroupSealed { key_id, ciphertext })
            }
        }
    }

    // ── Rich media ────────────────────────────────────────────────────

    /// Normalize, store and reference `source`. Resolves with the media key.
    pub fn submit_rich_media(
        &self,
        source: MediaSource,
        media_type: MediaType,
        caption: &str,
        target: &str,
    ) -> Pending<Result<MediaKey, SubmitError>> {
        self.submit_rich_media_with(source, media_type, ImageQuality::default(), caption, target)
    }

    pub fn submit_rich_media_with(
        &self,
        source: MediaSource,
        media_type: MediaType,
        quality: ImageQuality,
        caption: &str,
        target: &str,
    ) -> Pending<Result<MediaKey, SubmitError>> {
        let target = match self.resolve_target(target) {
            Ok(t) => t,
            Err(e) => return Pending::ready(Err(e)),
        };
        if matches!(target, Target::Phone(_)) && !media_type.sms_representable() {
            return Pending::ready(Err(SubmitError::UnsupportedForChannel {
                media_type,
                channel: DeliveryChannel::Sms,
            }));
        }
        if media_type == MediaType::Text {
            return Pending::ready(Err(SubmitError::Transcode("text is not rich media".into())));
        }

        let sealing = self.plan_sealing(&target, self.prefer_message_encryption());
        let caption = caption.to_string();
        let this = self.clone();
        Pending::spawn(async move {
            this.run_rich_pipeline(source, media_type, quality, caption, target, sealing)
                .await
        })
    }

    async fn run_rich_pipeline(
        &self,
        source: MediaSource,
        media_type: MediaType,
        quality: ImageQuality,
        caption: String,
        target: Target,
        sealing: Sealing,
    ) -> Result<MediaKey, SubmitError> {
        if !self.inner.link.is_connected() {
            return Err(SubmitError::NotConnected);
        }
        let raw = match source {
            MediaSource::Bytes(b) => b,
            MediaSource::Path(p) => tokio::fs::read(&p)
                .await
                .map_err(|e| SubmitError::Source(format!("{}: {e}", p.display())))?,
        };

        // Phase 1: normalize
        let config = &self.inner.config;
        let transcoder = self.inner.transcoder.clone();
        let normalized = tokio::task::spawn_blocking({
            let config = config.clone();
            move || transcode::normalize(media_type, raw, quality, &config, transcoder.as_ref())
        })
        .await
        .map_err(|e| SubmitError::Transcode(e.to_string()))?
        .inspect_err(|e| warn!(?media_type, "normalization failed: {e}"))?;

        // Plaintext never reaches the store when the message is encrypted.
        let blob = self.seal_blob(normalized, &sealing)?;

        // Phase 2: register and upload
        let (key, created) = self
            .inner
            .store
            .put(media_type, blob)
            .map_err(|e| SubmitError::StoreWrite(e.to_string()))?;
        if let Err(e) = self.inner.store.upload(&key).await {
            warn!(media_key = %key, "upload failed: {e}");
            if created {
                self.inner.store.evict(&key);
            }
            return Err(SubmitError::Upload(e.to_string()));
        }

        // Phase 3: reference message
        let payload = MessagePayload {
            text: caption,
            media_key: Some(key.to_string()),
        };
        self.deliver(payload, target, sealing).await?;
        debug!(media_key = %key, "rich media submitted");
        Ok(key)
    }

    fn seal_blob(&self, data: Vec<u8>, sealing: &Sealing) -> Result<Vec<u8>, SubmitError> {
        match sealing {
            Sealing::Plain => Ok(data),
            Sealing::ForUser(id) => self
                .inner
                .keys
                .seal_for_user(id, &data)
                .map_err(|e| SubmitError::Encryption(e.to_string())),
            Sealing::ForGroup(gid) => {
                let (key_id, ct) = self
                    .inner
                    .keys
                    .group_encrypt(gid, &data)
                    .map_err(|e| SubmitError::Encryption(e.to_string()))?;
                let mut out = Vec::with_capacity(4 + ct.len());
                out.extend_from_slice(&key_id.to_be_bytes());
                out.extend_from_slice(&ct);
                Ok(out)
            }
        }
    }

    // ── Convenience submitters ────────────────────────────────────────

    pub fn submit_image(
        &self,
        data: Vec<u8>,
        quality: ImageQuality,
        caption: &str,
        target: &str,
    ) -> Pending<Result<MediaKey, SubmitError>> {
        self.submit_rich_media_with(MediaSource::Bytes(data), MediaType::Image, quality, caption, target)
    }

    pub fn submit_video(&self, source: MediaSource, caption: &str, target: &str) -> Pending<Result<MediaKey, SubmitError>> {
        self.submit_rich_media(source, MediaType::Video, caption, target)
    }

    /// Voicemail / audio clip.
    pub fn submit_audio(&self, source: MediaSource, caption: &str, target: &str) -> Pending<Result<MediaKey, SubmitError>> {
        self.submit_rich_media(source, MediaType::Voicemail, caption, target)
    }

    pub fn submit_file(&self, source: MediaSource, caption: &str, target: &str) -> Pending<Result<MediaKey, SubmitError>> {
        self.submit_rich_media(source, MediaType::File, caption, target)
    }

    pub fn submit_vcard(&self, vcard: &str, target: &str) -> Pending<Result<MediaKey, SubmitError>> {
        self.submit_rich_media(MediaSource::Bytes(vcard.as_bytes().to_vec()), MediaType::VCard, "", target)
    }

    pub fn submit_friend(&self, friend: &FriendCard, target: &str) -> Pending<Result<MediaKey, SubmitError>> {
        match serde_json::to_vec(friend) {
            Ok(json) => self.submit_rich_media(MediaSource::Bytes(json), MediaType::Friend, "", target),
            Err(e) => Pending::ready(Err(SubmitError::Source(e.to_string()))),
        }
    }

    pub fn submit_location(
        &self,
        location: &LocationPayload,
        target: &str,
    ) -> Pending<Result<MediaKey, SubmitError>> {
        match serde_json::to_vec(location) {
            Ok(json) => self.submit_rich_media(MediaSource::Bytes(json), MediaType::Location, "", target),
            Err(e) => Pending::ready(Err(SubmitError::Source(e.to_string()))),
        }
    }

    // ── Retrieval ─────────────────────────────────────────────────────

    /// Local-only existence check. Malformed keys are simply absent.
    pub fn has_object_for_key(&self, key: &str) -> bool {
        MediaKey::parse(key).is_ok_and(|k| self.inner.store.has(&k))
    }

    /// Fetch the stored blob, downloading it if needed. Resolves exactly once.
    pub fn retrieve_object_for_key(
        &self,
        key: &str,
    ) -> Pending<Result<Arc<Vec<u8>>, RetrieveError>> {
        match MediaKey::parse(key) {
            Ok(k) => self.inner.store.retrieve(&k),
            Err(_) => Pending::ready(Err(RetrieveError::UnknownKey(key.to_string()))),
        }
    }

    /// Best-effort media type from the key alone.
    pub fn media_type_for_key(&self, key: &str) -> MediaType {
        MediaKey::classify(key)
    }

    pub fn media_path_for_key(&self, key: &str) -> Option<PathBuf> {
        MediaKey::parse(key)
            .ok()
            .and_then(|k| self.inner.store.media_path_for_key(&k))
    }

    /// Decoded picture for a locally stored `image` or `userimage` key.
    pub fn image_for_key(&self, key: &str) -> Option<DynamicImage> {
        let key = MediaKey::parse(key).ok()?;
        if !matches!(key.media_type(), MediaType::Image | MediaType::UserImage) {
            return None;
        }
        let blob = self.inner.store.get(&key)?;
        image::load_from_memory(&blob).ok()
    }

    /// Thumbnail fitting `max_side` for a local picture or recording. Smaller
    /// pictures come back unscaled.
    pub fn thumbnail_for_key(&self, key: &str, max_side: u32) -> Option<DynamicImage> {
        let parsed = MediaKey::parse(key).ok()?;
        let full = match parsed.media_type() {
            MediaType::Image | MediaType::UserImage => self.image_for_key(key)?,
            MediaType::Video => {
                let blob = self.inner.store.get(&parsed)?;
                let recording = RecordingContainer::from_bytes(&blob).ok()?;
                image::load_from_memory(recording.frames.first()?).ok()?
            }
            _ => return None,
        };
        if full.width() <= max_side && full.height() <= max_side {
            return Some(full);
        }
        Some(full.thumbnail(max_side, max_side))
    }

    /// Picture of a known user, when it is stored locally.
    pub fn userimage_for_user_id(&self, user_id: &str) -> Option<DynamicImage> {
        let identity = records::identity(self.inner.records.as_ref(), user_id)?;
        self.image_for_key(identity.image_key.as_deref()?)
    }

    /// Fetch the media attached to a received message, decrypted if it was sent
    /// encrypted.
    pub fn retrieve_message_media(
        &self,
        message_id: &str,
    ) -> Pending<Result<Arc<Vec<u8>>, RetrieveError>> {
        let Some(record) = records::message(self.inner.records.as_ref(), message_id) else {
            return Pending::ready(Err(RetrieveError::UnknownKey(message_id.to_string())));
        };
        let Some(key) = record.media_key.as_deref().and_then(|k| MediaKey::parse(k).ok()) else {
            return Pending::ready(Err(RetrieveError::UnknownKey(message_id.to_string())));
        };
        let this = self.clone();
        Pending::spawn(async move { this.open_message_media(&record, &key).await })
    }

    async fn open_message_media(
        &self,
        record: &MessageRecord,
        key: &MediaKey,
    ) -> Result<Arc<Vec<u8>>, RetrieveError> {
        let blob = self.inner.store.fetch(key).await?;
        // Outbound ciphertext is sealed to the recipient, not to us.
        if !record.encrypted || record.direction == CallDirection::Outgoing {
            return Ok(blob);
        }
        let keys = &self.inner.keys;
        let plain = match &record.peer {
            Target::Group(gid) => {
                if blob.len() < 4 {
                    return Err(RetrieveError::Decrypt("truncated group blob".into()));
                }
                let key_id = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]);
                keys.group_decrypt(gid, key_id, &blob[4..])
            }
            _ => keys.open_for_self(&blob),
        }
        .map_err(|e| RetrieveError::Decrypt(e.to_string()))?;
        Ok(Arc::new(plain))
    }

    pub fn mark_read(&self, message_id: &str) {
        let records = self.inner.records.as_ref();
        if let Some(mut m) = records::message(records, message_id) {
            if !m.read {
                m.read = true;
                records.put(Record::Message(m));
            }
        }
    }

    pub fn unread_count(&self) -> usize {
        let unread = |r: &Record| {
            matches!(r, Record::Message(m) if m.direction == CallDirection::Incoming && !m.read)
        };
        self.inner
            .records
            .query(RecordKind::Message, &unread, true, None)
            .len()
    }

    // ── Inbound ───────────────────────────────────────────────────────

    pub(crate) async fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::InstantMessage(msg) => self.on_instant_message(msg).await,
            Signal::Sms {
                message_id,
                from,
                number,
                segments,
            } => {
                let payload = MessagePayload {
                    text: segments.concat(),
                    media_key: None,
                };
                self.record_inbound(&message_id, &from, Target::Phone(number), &payload, false, crate::unix_millis());
                self.inner.events.emit(Notification::MessageReceived {
                    message_id,
                    from,
                    payload,
                });
            }
            Signal::Ack { message_id } => {
                self.set_status(&message_id, MessageStatus::Delivered);
                self.inner
                    .events
                    .emit(Notification::MessageDelivered { message_id });
            }
            Signal::MessageFailed { message_id, reason } => {
                warn!(message_id, "message failed: {reason}");
                self.set_status(&message_id, MessageStatus::Failed(reason.clone()));
                self.inner
                    .events
                    .emit(Notification::MessageFailed { message_id, reason });
            }
            _ => {}
        }
    }

    async fn on_instant_message(&self, msg: InstantMessage) {
        if self.inner.link.user_id().as_deref() == Some(msg.from.as_str()) {
            return;
        }
        let encrypted = !matches!(msg.body, MessageBody::Plain(_));
        let payload = match self.open_body(&msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(message_id = %msg.message_id, from = %msg.from, "cannot open message: {e}");
                return;
            }
        };
        let peer = match &msg.target {
            Target::Group(gid) => Target::Group(gid.clone()),
            _ => Target::User(msg.from.clone()),
        };
        self.record_inbound(&msg.message_id, &msg.from, peer, &payload, encrypted, msg.sent_at);

        if let Err(e) = self
            .inner
            .link
            .send(Signal::Ack {
                message_id: msg.message_id.clone(),
            })
            .await
        {
            debug!(message_id = %msg.message_id, "ack not sent: {e}");
        }

        self.inner.events.emit(Notification::MessageReceived {
            message_id: msg.message_id,
            from: msg.from,
            payload,
        });
    }

    fn open_body(&self, msg: &InstantMessage) -> Result<MessagePayload, SubmitError> {
        let decode = |bytes: Vec<u8>| {
            postcard::from_bytes::<MessagePayload>(&bytes)
                .map_err(|e| SubmitError::Encryption(e.to_string()))
        };
        match &msg.body {
            MessageBody::Plain(p) => Ok(p.clone()),
            MessageBody::Sealed(ct) => decode(
                self.inner
                    .keys
                    .open_for_self(ct)
                    .map_err(|e| SubmitError::Encryption(e.to_string()))?,
            ),
            MessageBody::GroupSealed { key_id, ciphertext } => {
                let Target::Group(gid) = &msg.target else {
                    return Err(SubmitError::Encryption("group body for non-group target".into()));
                };
                decode(
                    self.inner
                        .keys
                        .group_decrypt(gid, *key_id, ciphertext)
                        .map_err(|e| SubmitError::Encryption(e.to_string()))?,
                )
            }
        }
    }

    fn record_inbound(
        &self,
        message_id: &str,
        from: &str,
        peer: Target,
        payload: &MessagePayload,
        encrypted: bool,
        timestamp: u64,
    ) {
        self.inner.records.put(Record::Message(MessageRecord {
            id: message_id.to_string(),
            peer,
            sender: from.to_string(),
            direction: CallDirection::Incoming,
            text: payload.text.clone(),
            media_key: payload.media_key.clone(),
            encrypted,
            status: MessageStatus::Received,
            read: false,
            timestamp,
        }));
    }

    fn set_status(&self, message_id: &str, status: MessageStatus) {
        let records = self.inner.records.as_ref();
        if let Some(mut m) = records::message(records, message_id) {
            m.status = status;
            records.put(Record::Message(m));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_numbers_are_normalized() {
        assert_eq!(normalize_phone("+1 (555) 010-2000").as_deref(), Some("+15550102000"));
        assert_eq!(normalize_phone("911").as_deref(), Some("911"));
        assert!(normalize_phone("12").is_none());
        assert!(normalize_phone("+1555abc").is_none());
        assert!(normalize_phone("1234567890123456").is_none());
    }

    #[test]
    fn phone_detection_uses_leading_char() {
        assert!(looks_like_phone(" +44 20"));
        assert!(looks_like_phone("0171"));
        assert!(!looks_like_phone("alice"));
    }
}
