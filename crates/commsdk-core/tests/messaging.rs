mod common;

use std::io::Cursor;

use serial_test::serial;

use commsdk_core::capture::recording::{encode_jpeg, RecordingContainer};
use commsdk_core::capture::VideoFrame;
use commsdk_core::content_store::key_for;
use commsdk_core::events::Notification;
use commsdk_core::messaging::transcode::{normalize_image, ImageQuality};
use commsdk_core::messaging::{FriendCard, LocationPayload, MediaSource};
use commsdk_core::records::{self, MessageStatus, Record};
use commsdk_core::{CoreConfig, RetrieveError, SubmitError};
use commsdk_crypto::{sealed, IdentityKeyPair};
use commsdk_protocol::messages::{InstantMessage, MessageBody, MessagePayload, Signal};
use commsdk_protocol::types::{DeliveryChannel, Group, Identity, MediaType, Target};

use common::*;

fn verified(id: &str, name: &str) -> (Identity, IdentityKeyPair) {
    let pair = IdentityKeyPair::generate();
    let mut identity = Identity::new(id, name);
    identity.public_key = Some(pair.public_bytes().to_vec());
    identity.encryption_ready = true;
    (identity, pair)
}

fn sent_messages(h: &Harness) -> Vec<InstantMessage> {
    h.transport
        .sent()
        .into_iter()
        .filter_map(|s| match s {
            Signal::InstantMessage(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 120, 240]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

#[tokio::test]
#[serial]
async fn long_text_to_a_number_goes_out_as_segmented_sms() {
    let h = logged_in(CoreConfig::default()).await;
    let messaging = h.session.messaging().unwrap();

    let text = "a".repeat(161);
    let receipt = messaging
        .submit_message(&text, "+1 555 010 2000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(receipt.channel, DeliveryChannel::Sms);
    assert_eq!(receipt.segments, 2);
    assert!(!receipt.encrypted);

    let sms = h.transport.sent().into_iter().find_map(|s| match s {
        Signal::Sms { number, segments, .. } => Some((number, segments)),
        _ => None,
    });
    let (number, segments) = sms.unwrap();
    assert_eq!(number, "+15550102000");
    assert_eq!(segments.concat(), text);

    let unicode = messaging
        .submit_message(&"ж".repeat(71), "+15550102000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unicode.segments, 2);
}

#[tokio::test]
#[serial]
async fn text_to_a_peer_is_recorded_as_sent() {
    let h = logged_in(CoreConfig::default()).await;
    h.session.records().put(Record::Identity(Identity::new("bob", "Bob")));
    let messaging = h.session.messaging().unwrap();

    let receipt = messaging.submit_message("hi", "bob").await.unwrap().unwrap();
    assert_eq!(receipt.channel, DeliveryChannel::InApp);
    assert_eq!(receipt.recipients, vec!["bob".to_string()]);

    let record = records::message(h.session.records().as_ref(), &receipt.message_id).unwrap();
    assert_eq!(record.status, MessageStatus::Sent);
    assert_eq!(record.peer, Target::User("bob".into()));

    let sent = sent_messages(&h);
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0].body, MessageBody::Plain(p) if p.text == "hi"));
}

#[tokio::test]
#[serial]
async fn groups_with_uuid_ids_get_in_app_delivery() {
    let h = logged_in(CoreConfig::default()).await;
    h.session.records().put(Record::Identity(Identity::new("bob", "Bob")));
    let created = h
        .session
        .create_group("team", &["bob".into()])
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    // A uuid that starts with digits, like most generated ones.
    let numeric_start = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    h.session.records().put(Record::Group(Group::new(
        numeric_start,
        "ops",
        USER,
        ["bob".to_string()],
    )));
    let messaging = h.session.messaging().unwrap();

    for group_id in [created.as_str(), numeric_start] {
        let receipt = messaging.submit_message("hi team", group_id).await.unwrap().unwrap();
        assert_eq!(receipt.channel, DeliveryChannel::InApp);
        assert_eq!(receipt.recipients, vec!["bob".to_string()]);
        assert!(sent_messages(&h)
            .iter()
            .any(|m| m.message_id == receipt.message_id && m.target == Target::Group(group_id.into())));
    }
    assert!(!h.transport.sent().iter().any(|s| matches!(s, Signal::Sms { .. })));
}

#[tokio::test]
#[serial]
async fn numeric_user_ids_are_not_phone_numbers() {
    let h = logged_in(CoreConfig::default()).await;
    h.session.records().put(Record::Identity(Identity::new("100234", "Bob")));
    let messaging = h.session.messaging().unwrap();

    let receipt = messaging.submit_message("hi bob", "100234").await.unwrap().unwrap();
    assert_eq!(receipt.channel, DeliveryChannel::InApp);
    assert_eq!(receipt.recipients, vec!["100234".to_string()]);
    assert!(!h.transport.sent().iter().any(|s| matches!(s, Signal::Sms { .. })));

    // The explicit number overload still reaches the phone.
    let sms = messaging
        .submit_message_to_number("hi bob", "100234")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sms.channel, DeliveryChannel::Sms);
    assert_eq!(sms.segments, 1);
    assert!(matches!(
        messaging.submit_message_to_number("hi", "bob").await.unwrap(),
        Err(SubmitError::InvalidTarget(_))
    ));
}

#[tokio::test]
#[serial]
async fn background_messages_use_push_delivery() {
    let h = logged_in(CoreConfig::default()).await;
    h.session.records().put(Record::Identity(Identity::new("bob", "Bob")));
    h.session.did_enter_background();
    let receipt = h
        .session
        .messaging()
        .unwrap()
        .submit_message("later", "bob")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(receipt.channel, DeliveryChannel::Push);
}

#[tokio::test]
#[serial]
async fn unresolvable_targets_fail_synchronously() {
    let h = logged_in(CoreConfig::default()).await;
    let messaging = h.session.messaging().unwrap();

    for target in ["nobody", "", "ghost@example.com", "+12"] {
        let result = messaging.submit_message("hi", target).await.unwrap();
        assert!(matches!(result, Err(SubmitError::InvalidTarget(_))), "{target}");
    }
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
#[serial]
async fn failed_send_marks_the_record() {
    let h = logged_in(CoreConfig::default()).await;
    h.session.records().put(Record::Identity(Identity::new("bob", "Bob")));
    h.transport
        .fail_signals
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let result = h
        .session
        .messaging()
        .unwrap()
        .submit_message("hi", "bob")
        .await
        .unwrap();
    assert!(matches!(result, Err(SubmitError::Transport(_))));
    let failed = h.session.records().query(
        records::RecordKind::Message,
        &|r: &Record| matches!(r, Record::Message(m) if matches!(m.status, MessageStatus::Failed(_))),
        true,
        None,
    );
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
#[serial]
async fn rich_media_key_is_retrievable_once_submitted() {
    let h = logged_in(CoreConfig::default()).await;
    h.session.records().put(Record::Identity(Identity::new("bob", "Bob")));
    let messaging = h.session.messaging().unwrap();

    let data = b"%PDF-1.4 quarterly report".to_vec();
    let key = messaging
        .submit_file(MediaSource::Bytes(data.clone()), "report", "bob")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(key.media_type(), MediaType::File);
    assert!(key.as_str().starts_with("file://"));
    assert!(messaging.has_object_for_key(key.as_str()));
    assert_eq!(messaging.media_type_for_key(key.as_str()), MediaType::File);
    let blob = messaging.retrieve_object_for_key(key.as_str()).await.unwrap().unwrap();
    assert_eq!(*blob, data);
    assert!(h.blobs.blobs.lock().unwrap().contains_key(key.as_str()));

    let sent = sent_messages(&h);
    assert!(matches!(
        &sent[0].body,
        MessageBody::Plain(MessagePayload { text, media_key: Some(k) }) if text == "report" && k == key.as_str()
    ));

    // Same content, same key.
    let again = messaging
        .submit_file(MediaSource::Bytes(data), "", "bob")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again, key);
}

#[tokio::test]
#[serial]
async fn images_are_normalized_before_storage() {
    let h = logged_in(CoreConfig::default()).await;
    h.session.records().put(Record::Identity(Identity::new("bob", "Bob")));
    let messaging = h.session.messaging().unwrap();

    let key = messaging
        .submit_image(png(1280, 640), ImageQuality::Low, "", "bob")
        .await
        .unwrap()
        .unwrap();
    let stored = messaging.retrieve_object_for_key(key.as_str()).await.unwrap().unwrap();
    let decoded = image::load_from_memory(&stored).unwrap();
    let limit = CoreConfig::default().image_limits.low;
    assert!(decoded.width() <= limit && decoded.height() <= limit);
    assert_eq!(decoded.width(), 2 * decoded.height());

    let garbage = messaging
        .submit_image(b"not an image".to_vec(), ImageQuality::High, "", "bob")
        .await
        .unwrap();
    assert!(matches!(garbage, Err(SubmitError::Transcode(_))));
}

#[tokio::test]
#[serial]
async fn contact_cards_cannot_go_over_sms() {
    let h = logged_in(CoreConfig::default()).await;
    let messaging = h.session.messaging().unwrap();

    let vcard = messaging
        .submit_vcard("BEGIN:VCARD\nFN:Bob\nEND:VCARD", "+15550102000")
        .await
        .unwrap();
    assert!(matches!(
        vcard,
        Err(SubmitError::UnsupportedForChannel {
            media_type: MediaType::VCard,
            channel: DeliveryChannel::Sms
        })
    ));

    let friend = FriendCard {
        user_id: "bob".into(),
        display_name: "Bob".into(),
        address: None,
    };
    let result = messaging.submit_friend(&friend, "+15550102000").await.unwrap();
    assert!(matches!(result, Err(SubmitError::UnsupportedForChannel { .. })));

    // Locations can, as a link.
    let location = LocationPayload {
        latitude: 52.52,
        longitude: 13.405,
        label: Some("Berlin".into()),
    };
    let key = messaging
        .submit_location(&location, "+15550102000")
        .await
        .unwrap()
        .unwrap();
    let sms_text = h.transport.sent().into_iter().find_map(|s| match s {
        Signal::Sms { segments, .. } => Some(segments.concat()),
        _ => None,
    });
    assert_eq!(sms_text.as_deref(), Some(key.as_str()));
}

#[tokio::test]
#[serial]
async fn encrypted_send_only_to_verified_peers() {
    let h = logged_in(CoreConfig {
        prefer_message_encryption: true,
        ..Default::default()
    })
    .await;
    let (bob, _bob_keys) = verified("bob", "Bob");
    h.session.records().put(Record::Identity(bob));
    h.session.records().put(Record::Identity(Identity::new("carol", "Carol")));
    let messaging = h.session.messaging().unwrap();

    // No account key yet.
    let plain = messaging.submit_message("one", "bob").await.unwrap().unwrap();
    assert!(!plain.encrypted);

    let keys = h.session.keys().unwrap();
    keys.enable_encryption().unwrap().await.unwrap().unwrap();
    assert!(keys.can_submit_encrypted_to_user("bob"));
    assert!(!keys.can_submit_encrypted_to_user("carol"));

    let sealed_receipt = messaging.submit_message("two", "bob").await.unwrap().unwrap();
    assert!(sealed_receipt.encrypted);
    let to_carol = messaging.submit_message("three", "carol").await.unwrap().unwrap();
    assert!(!to_carol.encrypted);

    let sent = sent_messages(&h);
    let body = sent
        .iter()
        .find(|m| m.message_id == sealed_receipt.message_id)
        .map(|m| &m.body)
        .unwrap();
    assert!(matches!(body, MessageBody::Sealed(_)));

    // Preference turned off at runtime.
    messaging.set_prefer_message_encryption(false);
    let opted_out = messaging.submit_message("four", "bob").await.unwrap().unwrap();
    assert!(!opted_out.encrypted);
}

#[tokio::test]
#[serial]
async fn inbound_messages_are_recorded_acked_and_announced() {
    let h = logged_in(CoreConfig::default()).await;
    let messaging = h.session.messaging().unwrap();
    let mut rx = h.session.events().subscribe();

    h.transport
        .inject_signal(Signal::InstantMessage(InstantMessage {
            message_id: "m1".into(),
            from: "bob".into(),
            target: Target::User(USER.into()),
            body: MessageBody::Plain(MessagePayload {
                text: "hello".into(),
                media_key: None,
            }),
            delivery: DeliveryChannel::InApp,
            recipients: vec![USER.into()],
            sent_at: 42,
        }))
        .await;
    settle().await;

    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        Notification::MessageReceived { message_id, payload, .. } if message_id == "m1" && payload.text == "hello"
    )));
    assert!(h
        .transport
        .sent()
        .iter()
        .any(|s| matches!(s, Signal::Ack { message_id } if message_id == "m1")));
    assert_eq!(messaging.unread_count(), 1);
    messaging.mark_read("m1");
    assert_eq!(messaging.unread_count(), 0);
}

#[tokio::test]
#[serial]
async fn sealed_inbound_message_is_opened_with_the_account_key() {
    let h = logged_in(CoreConfig::default()).await;
    let keys = h.session.keys().unwrap();
    keys.enable_encryption().unwrap().await.unwrap().unwrap();
    let me = records::identity(h.session.records().as_ref(), USER).unwrap();
    let my_public = me.verified_public_key().unwrap().to_vec();

    let payload = MessagePayload {
        text: "secret".into(),
        media_key: None,
    };
    let sealed_body =
        sealed::seal(&my_public, format!("user:{USER}").as_bytes(), &postcard::to_allocvec(&payload).unwrap())
            .unwrap();
    let mut rx = h.session.events().subscribe();
    h.transport
        .inject_signal(Signal::InstantMessage(InstantMessage {
            message_id: "m2".into(),
            from: "bob".into(),
            target: Target::User(USER.into()),
            body: MessageBody::Sealed(sealed_body),
            delivery: DeliveryChannel::InApp,
            recipients: vec![],
            sent_at: 1,
        }))
        .await;
    settle().await;

    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        Notification::MessageReceived { payload: p, .. } if p.text == "secret"
    )));
    let record = records::message(h.session.records().as_ref(), "m2").unwrap();
    assert!(record.encrypted);
}

#[tokio::test]
#[serial]
async fn delivery_reports_update_status() {
    let h = logged_in(CoreConfig::default()).await;
    h.session.records().put(Record::Identity(Identity::new("bob", "Bob")));
    let messaging = h.session.messaging().unwrap();
    let first = messaging.submit_message("a", "bob").await.unwrap().unwrap();
    let second = messaging.submit_message("b", "bob").await.unwrap().unwrap();

    h.transport
        .inject_signal(Signal::Ack {
            message_id: first.message_id.clone(),
        })
        .await;
    h.transport
        .inject_signal(Signal::MessageFailed {
            message_id: second.message_id.clone(),
            reason: "recipient unknown".into(),
        })
        .await;
    settle().await;

    let records = h.session.records().as_ref();
    assert_eq!(
        records::message(records, &first.message_id).unwrap().status,
        MessageStatus::Delivered
    );
    assert_eq!(
        records::message(records, &second.message_id).unwrap().status,
        MessageStatus::Failed("recipient unknown".into())
    );
}

#[tokio::test]
#[serial]
async fn remote_media_is_downloaded_with_progress() {
    let h = logged_in(CoreConfig::default()).await;
    let messaging = h.session.messaging().unwrap();
    let mut rx = h.session.events().subscribe();

    let data = b"remote voicemail".to_vec();
    let key = key_for(MediaType::Voicemail, &data).unwrap();
    h.blobs.blobs.lock().unwrap().insert(key.to_string(), data.clone());
    assert!(!messaging.has_object_for_key(key.as_str()));

    let blob = messaging.retrieve_object_for_key(key.as_str()).await.unwrap().unwrap();
    assert_eq!(*blob, data);
    assert!(messaging.has_object_for_key(key.as_str()));
    let percents: Vec<u8> = drain(&mut rx)
        .into_iter()
        .filter_map(|n| match n {
            Notification::DownloadProgress { percent, .. } => Some(percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents.last(), Some(&100));

    // Tampered remote content is refused.
    let other = key_for(MediaType::File, b"expected").unwrap();
    h.blobs.blobs.lock().unwrap().insert(other.to_string(), b"tampered".to_vec());
    let result = messaging.retrieve_object_for_key(other.as_str()).await.unwrap();
    assert!(matches!(result, Err(RetrieveError::IntegrityMismatch(_))));

    let missing = key_for(MediaType::File, b"nowhere").unwrap();
    let result = messaging.retrieve_object_for_key(missing.as_str()).await.unwrap();
    assert!(matches!(result, Err(RetrieveError::UnknownKey(_))));
    assert!(matches!(
        messaging.retrieve_object_for_key("garbage").await.unwrap(),
        Err(RetrieveError::UnknownKey(_))
    ));
}

fn last_group_sealed(h: &Harness) -> InstantMessage {
    sent_messages(h)
        .into_iter()
        .rev()
        .find(|m| matches!(m.body, MessageBody::GroupSealed { .. }))
        .unwrap()
}

/// Replay one of our own group messages as if `from` had sent it.
async fn echo_as(h: &Harness, mut msg: InstantMessage, message_id: &str, from: &str) {
    msg.message_id = message_id.into();
    msg.from = from.into();
    h.transport.inject_signal(Signal::InstantMessage(msg)).await;
    settle().await;
}

#[tokio::test]
#[serial]
async fn encrypted_images_are_stored_sealed_to_the_recipient() {
    let config = CoreConfig {
        prefer_message_encryption: true,
        ..Default::default()
    };
    let h = logged_in(config.clone()).await;
    let (bob, bob_keys) = verified("bob", "Bob");
    h.session.records().put(Record::Identity(bob));
    h.session.keys().unwrap().enable_encryption().unwrap().await.unwrap().unwrap();
    let messaging = h.session.messaging().unwrap();

    let source = png(64, 32);
    let plain = normalize_image(
        &source,
        ImageQuality::Low.max_dimension(&config.image_limits),
        config.jpeg_quality,
    )
    .unwrap();
    let key = messaging
        .submit_image(source, ImageQuality::Low, "pic", "bob")
        .await
        .unwrap()
        .unwrap();

    let stored = messaging.retrieve_object_for_key(key.as_str()).await.unwrap().unwrap();
    assert_ne!(*stored, plain);
    assert!(image::load_from_memory(&stored).is_err());
    assert_eq!(h.blobs.blobs.lock().unwrap()[key.as_str()], *stored);
    assert_eq!(sealed::open(&bob_keys, b"user:bob", &stored).unwrap(), plain);
    assert!(matches!(
        sent_messages(&h).last().unwrap().body,
        MessageBody::Sealed(_)
    ));
}

#[tokio::test]
#[serial]
async fn sealed_inbound_media_is_opened_on_retrieval() {
    let h = logged_in(CoreConfig::default()).await;
    let keys = h.session.keys().unwrap();
    keys.enable_encryption().unwrap().await.unwrap().unwrap();
    let me = records::identity(h.session.records().as_ref(), USER).unwrap();
    let my_public = me.verified_public_key().unwrap().to_vec();
    let aad = format!("user:{USER}");

    let voicemail = b"pcm voicemail frames".to_vec();
    let blob = sealed::seal(&my_public, aad.as_bytes(), &voicemail).unwrap();
    let key = key_for(MediaType::Voicemail, &blob).unwrap();
    h.blobs.blobs.lock().unwrap().insert(key.to_string(), blob);

    let payload = MessagePayload {
        text: String::new(),
        media_key: Some(key.to_string()),
    };
    let body = sealed::seal(&my_public, aad.as_bytes(), &postcard::to_allocvec(&payload).unwrap())
        .unwrap();
    h.transport
        .inject_signal(Signal::InstantMessage(InstantMessage {
            message_id: "m-voice".into(),
            from: "bob".into(),
            target: Target::User(USER.into()),
            body: MessageBody::Sealed(body),
            delivery: DeliveryChannel::InApp,
            recipients: vec![USER.into()],
            sent_at: 7,
        }))
        .await;
    settle().await;

    let messaging = h.session.messaging().unwrap();
    let media = messaging.retrieve_message_media("m-voice").await.unwrap().unwrap();
    assert_eq!(*media, voicemail);
    assert!(matches!(
        messaging.retrieve_message_media("nope").await.unwrap(),
        Err(RetrieveError::UnknownKey(_))
    ));
}

#[tokio::test]
#[serial]
async fn group_media_is_stored_under_the_group_key() {
    let config = CoreConfig {
        prefer_message_encryption: true,
        ..Default::default()
    };
    let h = logged_in(config.clone()).await;
    let (bob, _bob_keys) = verified("bob", "Bob");
    h.session.records().put(Record::Identity(bob));
    h.session
        .records()
        .put(Record::Group(Group::new("g1", "team", USER, ["bob".to_string()])));
    let keys = h.session.keys().unwrap();
    keys.enable_encryption().unwrap().await.unwrap().unwrap();
    keys.enable_encryption_for_group("g1").unwrap().await.unwrap().unwrap();
    let messaging = h.session.messaging().unwrap();

    let source = png(48, 48);
    let plain = normalize_image(
        &source,
        ImageQuality::Low.max_dimension(&config.image_limits),
        config.jpeg_quality,
    )
    .unwrap();
    let key = messaging
        .submit_image(source, ImageQuality::Low, "", "g1")
        .await
        .unwrap()
        .unwrap();
    let stored = messaging.retrieve_object_for_key(key.as_str()).await.unwrap().unwrap();
    assert_ne!(*stored, plain);
    assert!(image::load_from_memory(&stored).is_err());

    // A member's copy of the same reference message opens with our group key.
    echo_as(&h, last_group_sealed(&h), "m-group", "bob").await;
    let record = records::message(h.session.records().as_ref(), "m-group").unwrap();
    assert!(record.encrypted);
    let media = messaging.retrieve_message_media("m-group").await.unwrap().unwrap();
    assert_eq!(*media, plain);

    // Too short to carry a key id.
    let tiny = key_for(MediaType::File, b"abc").unwrap();
    h.blobs.blobs.lock().unwrap().insert(tiny.to_string(), b"abc".to_vec());
    messaging
        .submit_rich_message(&tiny, "", "g1")
        .await
        .unwrap()
        .unwrap();
    echo_as(&h, last_group_sealed(&h), "m-tiny", "bob").await;
    assert!(matches!(
        messaging.retrieve_message_media("m-tiny").await.unwrap(),
        Err(RetrieveError::Decrypt(_))
    ));
}

#[tokio::test]
#[serial]
async fn stored_pictures_and_recordings_have_thumbnails() {
    let h = logged_in(CoreConfig::default()).await;
    let messaging = h.session.messaging().unwrap();
    let store = h.session.content_store().unwrap();

    let (picture, _) = store.put(MediaType::Image, png(1280, 640)).unwrap();
    let full = messaging.image_for_key(picture.as_str()).unwrap();
    assert_eq!((full.width(), full.height()), (1280, 640));
    let thumb = messaging.thumbnail_for_key(picture.as_str(), 128).unwrap();
    assert_eq!((thumb.width(), thumb.height()), (128, 64));
    let small = messaging.thumbnail_for_key(picture.as_str(), 4096).unwrap();
    assert_eq!(small.width(), 1280);

    let frame = encode_jpeg(&VideoFrame::new(16, 16, vec![90; 16 * 16 * 3], 0), 80).unwrap();
    let recording = RecordingContainer {
        fps: 15,
        width: 16,
        height: 16,
        frames: vec![frame],
        ..Default::default()
    };
    let (video, _) = store.put(MediaType::Video, recording.to_bytes().unwrap()).unwrap();
    let thumb = messaging.thumbnail_for_key(video.as_str(), 8).unwrap();
    assert_eq!((thumb.width(), thumb.height()), (8, 8));
    assert!(messaging.image_for_key(video.as_str()).is_none());

    let (file, _) = store.put(MediaType::File, b"not a picture".to_vec()).unwrap();
    assert!(messaging.thumbnail_for_key(file.as_str(), 8).is_none());
    assert!(messaging.image_for_key("garbage").is_none());
}

#[tokio::test]
#[serial]
async fn user_pictures_resolve_through_the_identity() {
    let h = logged_in(CoreConfig::default()).await;
    let messaging = h.session.messaging().unwrap();
    let (key, _) = h
        .session
        .content_store()
        .unwrap()
        .put(MediaType::UserImage, png(32, 32))
        .unwrap();
    let mut carol = Identity::new("carol", "Carol");
    carol.image_key = Some(key.to_string());
    h.session.records().put(Record::Identity(carol));
    h.session.records().put(Record::Identity(Identity::new("dave", "Dave")));

    let picture = messaging.userimage_for_user_id("carol").unwrap();
    assert_eq!((picture.width(), picture.height()), (32, 32));
    assert!(messaging.userimage_for_user_id("dave").is_none());
    assert!(messaging.userimage_for_user_id("ghost").is_none());
}
