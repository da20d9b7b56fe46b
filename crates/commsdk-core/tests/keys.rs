mod common;

use std::collections::BTreeSet;

use serial_test::serial;

use commsdk_core::events::Notification;
use commsdk_core::records::{self, Record};
use commsdk_core::{CoreConfig, KeyError};
use commsdk_crypto::{GroupKey, IdentityKeyPair};
use commsdk_protocol::messages::{MessageBody, Signal, WrappedGroupKey};
use commsdk_protocol::types::{Group, Identity};

use common::*;

fn verified(id: &str) -> Identity {
    let mut identity = Identity::new(id, id);
    identity.public_key = Some(IdentityKeyPair::generate().public_bytes().to_vec());
    identity.encryption_ready = true;
    identity
}

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn distributions(h: &Harness) -> Vec<(u32, usize)> {
    h.transport
        .sent()
        .into_iter()
        .filter_map(|s| match s {
            Signal::GroupKeyDistribution { key_id, wrapped, .. } => Some((key_id, wrapped.len())),
            _ => None,
        })
        .collect()
}

async fn encrypted_session() -> Harness {
    let h = logged_in(CoreConfig::default()).await;
    h.session
        .keys()
        .unwrap()
        .enable_encryption()
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    h
}

#[tokio::test]
#[serial]
async fn account_encryption_toggles_once() {
    let h = logged_in(CoreConfig::default()).await;
    let keys = h.session.keys().unwrap();
    assert!(!keys.encryption_enabled());
    assert!(keys.disable_encryption().is_none());
    assert!(keys.export_key_pair_as_qr((256, 256)).is_none());

    keys.enable_encryption().unwrap().await.unwrap().unwrap();
    assert!(keys.encryption_enabled());
    assert!(keys.enable_encryption().is_none());
    assert!(h.transport.sent().iter().any(|s| matches!(
        s,
        Signal::PublicKeyPublished { user_id, public_key: Some(k) } if user_id == USER && k.len() == 32
    )));
    let me = records::identity(h.session.records().as_ref(), USER).unwrap();
    assert!(me.verified_public_key().is_some());

    keys.disable_encryption().unwrap().await.unwrap().unwrap();
    assert!(!keys.encryption_enabled());
    assert!(!keys.encryption_enabled_for_account());
    let me = records::identity(h.session.records().as_ref(), USER).unwrap();
    assert!(me.public_key.is_none());
}

#[tokio::test]
#[serial]
async fn enabling_fails_cleanly_when_publishing_fails() {
    let h = logged_in(CoreConfig::default()).await;
    let keys = h.session.keys().unwrap();
    h.transport
        .fail_signals
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let result = keys.enable_encryption().unwrap().await.unwrap();
    assert!(matches!(result, Err(KeyError::Transport(_))));
    assert!(!keys.encryption_enabled());

    // Not stuck busy.
    h.transport
        .fail_signals
        .store(false, std::sync::atomic::Ordering::SeqCst);
    keys.enable_encryption().unwrap().await.unwrap().unwrap();
    assert!(keys.encryption_enabled());
}

#[tokio::test]
#[serial]
async fn group_key_reaches_verified_members_only() {
    let h = encrypted_session().await;
    let store = h.session.records();
    store.put(Record::Identity(verified("bob")));
    store.put(Record::Identity(Identity::new("carol", "Carol")));
    store.put(Record::Group(Group::new(
        "g1",
        "team",
        USER,
        vec!["bob".to_string(), "carol".to_string()],
    )));
    let keys = h.session.keys().unwrap();

    let provisioned = keys.enable_encryption_for_group("g1").unwrap().await.unwrap().unwrap();
    assert_eq!(provisioned, set(&[USER, "bob"]));
    assert!(keys.group_encryption_enabled("g1"));
    assert_eq!(keys.encryption_enabled_members("g1"), set(&[USER, "bob"]));
    assert!(keys.enable_encryption_for_group("g1").is_none());

    // Carol verifies; the next refresh includes her under the same key.
    store.put(Record::Identity(verified("carol")));
    let refreshed = keys.refresh_keys_for_group("g1").unwrap().await.unwrap().unwrap();
    assert_eq!(refreshed, set(&[USER, "bob", "carol"]));

    let again = keys.refresh_keys_for_group("g1").unwrap().await.unwrap().unwrap();
    assert_eq!(again, refreshed);
    assert_eq!(distributions(&h), vec![(1, 1), (1, 2), (1, 2)]);
    let group = records::group(store.as_ref(), "g1").unwrap();
    assert_eq!(group.key_id, Some(1));
}

#[tokio::test]
#[serial]
async fn removing_a_member_rotates_the_group_key() {
    let h = encrypted_session().await;
    let store = h.session.records();
    store.put(Record::Identity(verified("bob")));
    store.put(Record::Identity(verified("carol")));
    store.put(Record::Group(Group::new(
        "g1",
        "team",
        USER,
        vec!["bob".to_string(), "carol".to_string()],
    )));
    let keys = h.session.keys().unwrap();
    keys.enable_encryption_for_group("g1").unwrap().await.unwrap().unwrap();

    let mut group = records::group(store.as_ref(), "g1").unwrap();
    assert!(group.remove_member("carol"));
    store.put(Record::Group(group));

    let provisioned = keys.refresh_keys_for_group("g1").unwrap().await.unwrap().unwrap();
    assert_eq!(provisioned, set(&[USER, "bob"]));
    assert_eq!(distributions(&h).last(), Some(&(2, 1)));
    assert_eq!(records::group(store.as_ref(), "g1").unwrap().key_id, Some(2));
}

#[tokio::test]
#[serial]
async fn restored_group_key_still_rotates_on_removal() {
    let dir = tempfile::tempdir().unwrap();
    let h = logged_in(CoreConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    })
    .await;
    let keys = h.session.keys().unwrap();
    keys.enable_encryption().unwrap().await.unwrap().unwrap();
    *h.transport.key_fingerprint.lock().unwrap() = keys.account_fingerprint();

    let store = h.session.records().clone();
    store.put(Record::Identity(verified("bob")));
    store.put(Record::Identity(verified("carol")));
    store.put(Record::Group(Group::new(
        "g1",
        "team",
        USER,
        vec!["bob".to_string(), "carol".to_string()],
    )));
    let provisioned = keys.enable_encryption_for_group("g1").unwrap().await.unwrap().unwrap();
    assert_eq!(provisioned, set(&[USER, "bob", "carol"]));

    h.session.logout().await;
    h.session.login(USER, PASSWORD).await.unwrap();
    let keys = h.session.keys().unwrap();
    assert!(keys.group_encryption_enabled("g1"));

    let mut group = records::group(store.as_ref(), "g1").unwrap();
    assert!(group.remove_member("carol"));
    store.put(Record::Group(group));

    let refreshed = keys.refresh_keys_for_group("g1").unwrap().await.unwrap().unwrap();
    assert_eq!(refreshed, set(&[USER, "bob"]));
    let last = h.transport.sent().into_iter().rev().find_map(|s| match s {
        Signal::GroupKeyDistribution { key_id, wrapped, .. } => Some((key_id, wrapped)),
        _ => None,
    });
    let (key_id, wrapped) = last.unwrap();
    assert_eq!(key_id, 2);
    assert!(wrapped.iter().all(|w| w.member != "carol"));
}

#[tokio::test]
#[serial]
async fn group_requests_need_an_eligible_account_and_group() {
    let h = logged_in(CoreConfig::default()).await;
    h.session
        .records()
        .put(Record::Group(Group::new("g1", "team", USER, vec!["bob".to_string()])));
    let keys = h.session.keys().unwrap();

    assert!(keys.enable_encryption_for_group("g1").is_none());
    keys.enable_encryption().unwrap().await.unwrap().unwrap();
    assert!(keys.enable_encryption_for_group("missing").is_none());
    assert!(keys.refresh_keys_for_group("g1").is_none());
    assert!(keys.disable_encryption_for_group("g1").is_none());

    keys.enable_encryption_for_group("g1").unwrap().await.unwrap().unwrap();
    keys.disable_encryption_for_group("g1").unwrap().await.unwrap().unwrap();
    assert!(!keys.group_encryption_enabled("g1"));
    assert!(keys.encryption_enabled_members("g1").is_empty());
    assert!(h
        .transport
        .sent()
        .iter()
        .any(|s| matches!(s, Signal::GroupKeyRevoked { group_id } if group_id == "g1")));
}

#[tokio::test]
#[serial]
async fn received_group_key_encrypts_group_messages() {
    let h = logged_in(CoreConfig {
        prefer_message_encryption: true,
        ..Default::default()
    })
    .await;
    let keys = h.session.keys().unwrap();
    keys.enable_encryption().unwrap().await.unwrap().unwrap();
    let store = h.session.records();
    store.put(Record::Group(Group::new(
        "g1",
        "team",
        "bob",
        vec![USER.to_string(), "carol".to_string()],
    )));
    let my_public = records::identity(store.as_ref(), USER)
        .unwrap()
        .public_key
        .unwrap();
    let mut rx = h.session.events().subscribe();

    let key = GroupKey::generate(5).unwrap();
    h.transport
        .inject_signal(Signal::GroupKeyDistribution {
            group_id: "g1".into(),
            key_id: 5,
            from: "bob".into(),
            wrapped: vec![WrappedGroupKey {
                member: USER.into(),
                sealed: key.wrap_for("g1", &my_public).unwrap(),
            }],
        })
        .await;
    settle().await;

    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        Notification::GroupKeyInstalled { group_id, key_id: 5 } if group_id == "g1"
    )));
    assert!(keys.group_encryption_enabled("g1"));
    assert_eq!(keys.encryption_enabled_members("g1"), set(&[USER, "bob"]));

    let receipt = h
        .session
        .messaging()
        .unwrap()
        .submit_message("for the team", "g1")
        .await
        .unwrap()
        .unwrap();
    assert!(receipt.encrypted);
    // Carol holds no key and is left out.
    assert_eq!(receipt.recipients, vec!["bob".to_string()]);
    let body = h.transport.sent().into_iter().find_map(|s| match s {
        Signal::InstantMessage(m) if m.message_id == receipt.message_id => Some(m.body),
        _ => None,
    });
    assert!(matches!(body, Some(MessageBody::GroupSealed { key_id: 5, .. })));
}

#[tokio::test]
#[serial]
async fn qr_import_is_all_or_nothing() {
    let h = encrypted_session().await;
    let keys = h.session.keys().unwrap();
    let original = keys.export_key_pair_as_qr((300, 300)).unwrap();
    assert_eq!(original.dimensions, (300, 300));
    let fingerprint = keys.account_fingerprint().unwrap();

    let mut corrupted = original.payload.to_string();
    corrupted.pop();
    assert!(matches!(keys.import_key_pair(&corrupted), Err(KeyError::InvalidPayload(_))));
    assert!(matches!(keys.import_key_pair("hello"), Err(KeyError::InvalidPayload(_))));
    assert_eq!(keys.account_fingerprint(), Some(fingerprint.clone()));
    assert!(keys.encryption_enabled());

    // A key pair the backend does not know about is installed but drifted.
    let foreign = IdentityKeyPair::generate().export_qr_payload();
    keys.import_key_pair(&foreign).unwrap();
    assert!(!keys.encryption_enabled());
    assert!(!keys.validate_certificate_for_account());

    keys.import_key_pair(&original.payload).unwrap();
    assert_eq!(keys.account_fingerprint(), Some(fingerprint));
    assert!(keys.validate_certificate_for_account());
    assert!(keys.encryption_enabled());
}

#[tokio::test]
#[serial]
async fn key_published_elsewhere_is_drift() {
    let h = encrypted_session().await;
    let keys = h.session.keys().unwrap();
    let mut rx = h.session.events().subscribe();

    let other = IdentityKeyPair::generate();
    h.transport
        .inject_signal(Signal::PublicKeyPublished {
            user_id: USER.into(),
            public_key: Some(other.public_bytes().to_vec()),
        })
        .await;
    settle().await;

    assert!(drain(&mut rx)
        .iter()
        .any(|n| matches!(n, Notification::KeyDriftDetected)));
    assert!(!keys.encryption_enabled());
    assert!(keys.encryption_enabled_for_account());
    // Re-enabling is allowed again.
    keys.enable_encryption().unwrap().await.unwrap().unwrap();
    assert!(keys.encryption_enabled());
}

#[tokio::test]
#[serial]
async fn login_detects_keys_held_only_by_the_backend() {
    let h = harness(CoreConfig::default());
    *h.transport.key_fingerprint.lock().unwrap() = Some("0123456789abcdef".into());
    let mut rx = h.session.events().subscribe();

    h.session.login(USER, PASSWORD).await.unwrap();
    let keys = h.session.keys().unwrap();
    assert!(!keys.encryption_enabled());
    assert!(keys.encryption_enabled_for_account());
    assert!(!keys.validate_certificate_for_account());
    assert!(drain(&mut rx)
        .iter()
        .any(|n| matches!(n, Notification::KeyDriftDetected)));
}

#[tokio::test]
#[serial]
async fn peer_key_updates_change_trust() {
    let h = encrypted_session().await;
    let keys = h.session.keys().unwrap();
    h.session.records().put(Record::Identity(Identity::new("bob", "Bob")));
    assert!(!keys.can_submit_encrypted_to_user("bob"));

    let bob = IdentityKeyPair::generate();
    h.transport
        .inject_signal(Signal::PublicKeyPublished {
            user_id: "bob".into(),
            public_key: Some(bob.public_bytes().to_vec()),
        })
        .await;
    settle().await;
    assert!(keys.can_submit_encrypted_to_user("bob"));

    h.transport
        .inject_signal(Signal::PublicKeyPublished {
            user_id: "bob".into(),
            public_key: None,
        })
        .await;
    settle().await;
    assert!(!keys.can_submit_encrypted_to_user("bob"));
}
