//! Key & Trust Manager.
//!
//! Owns the account key pair and the symmetric keys of encrypted groups.
//! Private material never leaves this module except through the QR export the
//! user explicitly requests.
//!
//! Eligibility checks run synchronously: a request on an account or group that
//! is not eligible returns `None` without spawning anything. Accepted requests
//! resolve their [`Pending`] exactly once.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use commsdk_crypto::identity::fingerprint_of;
use commsdk_crypto::{persistence, sealed, GroupKey, IdentityKeyPair, KeyStore};
use commsdk_protocol::messages::{Signal, WrappedGroupKey};
use commsdk_protocol::types::{GroupId, UserId};
use zeroize::Zeroizing;

use crate::completion::Pending;
use crate::error::{KeyError, TransportError};
use crate::events::{EventBus, Notification};
use crate::link::SessionLink;
use crate::records::{self, Record, RecordStore};

#[derive(Default)]
struct KeyState {
    account: Option<IdentityKeyPair>,
    /// Fingerprint the backend holds for this account.
    remote_fingerprint: Option<String>,
    drifted: bool,
    /// An enable/disable request is in flight.
    account_busy: bool,
    group_keys: HashMap<GroupId, GroupKey>,
    /// Members that received the current key, per group.
    provisioned: HashMap<GroupId, BTreeSet<UserId>>,
    groups_busy: BTreeSet<GroupId>,
}

struct KeyInner {
    state: Mutex<KeyState>,
    link: SessionLink,
    records: Arc<dyn RecordStore>,
    events: EventBus,
}

/// An exported key pair, ready to be rendered as a QR code by the host.
pub struct QrExport {
    pub payload: Zeroizing<String>,
    pub dimensions: (u32, u32),
}

#[derive(Clone)]
pub struct KeyTrustManager {
    inner: Arc<KeyInner>,
}

/// AAD for payloads sealed to a single user.
pub(crate) fn user_aad(user_id: &str) -> Vec<u8> {
    let mut aad = b"user:".to_vec();
    aad.extend_from_slice(user_id.as_bytes());
    aad
}

/// AAD for payloads encrypted with a group key.
pub(crate) fn group_aad(group_id: &str) -> Vec<u8> {
    let mut aad = b"group:".to_vec();
    aad.extend_from_slice(group_id.as_bytes());
    aad
}

impl KeyTrustManager {
    pub fn new(link: SessionLink, records: Arc<dyn RecordStore>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(KeyInner {
                state: Mutex::new(KeyState::default()),
                link,
                records,
                events,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, KeyState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Account ───────────────────────────────────────────────────────

    /// Local keys are usable: present and not drifted from the backend.
    pub fn encryption_enabled(&self) -> bool {
        let st = self.state();
        st.account.is_some() && !st.drifted
    }

    /// The account has encryption enabled somewhere, possibly on another device.
    pub fn encryption_enabled_for_account(&self) -> bool {
        let st = self.state();
        st.account.is_some() || st.remote_fingerprint.is_some()
    }

    /// Generate a key pair and publish its public half.
    ///
    /// Returns `None` if encryption is already enabled.
    pub fn enable_encryption(&self) -> Option<Pending<Result<(), KeyError>>> {
        {
            let mut st = self.state();
            if (st.account.is_some() && !st.drifted) || st.account_busy {
                return None;
            }
            st.account_busy = true;
        }

        let this = self.clone();
        Some(Pending::spawn(async move {
            let result = this.publish_new_account_key().await;
            this.state().account_busy = false;
            result
        }))
    }

    async fn publish_new_account_key(&self) -> Result<(), KeyError> {
        let user_id = self.inner.link.user_id().ok_or(TransportError::NotConnected)?;
        let pair = IdentityKeyPair::generate();
        let public = pair.public_bytes();

        self.inner
            .link
            .send(Signal::PublicKeyPublished {
                user_id: user_id.clone(),
                public_key: Some(public.to_vec()),
            })
            .await?;

        let fingerprint = pair.fingerprint();
        {
            let mut st = self.state();
            st.account = Some(pair);
            st.remote_fingerprint = Some(fingerprint.clone());
            st.drifted = false;
        }
        self.update_identity_key(&user_id, Some(public.to_vec()));
        info!(%fingerprint, "account encryption enabled");
        Ok(())
    }

    /// Withdraw the account key. Returns `None` if encryption is not enabled.
    pub fn disable_encryption(&self) -> Option<Pending<Result<(), KeyError>>> {
        {
            let mut st = self.state();
            if st.account.is_none() || st.account_busy {
                return None;
            }
            st.account_busy = true;
        }

        let this = self.clone();
        Some(Pending::spawn(async move {
            let result = this.withdraw_account_key().await;
            this.state().account_busy = false;
            result
        }))
    }

    async fn withdraw_account_key(&self) -> Result<(), KeyError> {
        let user_id = self.inner.link.user_id().ok_or(TransportError::NotConnected)?;
        self.inner
            .link
            .send(Signal::PublicKeyPublished {
                user_id: user_id.clone(),
                public_key: None,
            })
            .await?;
        {
            let mut st = self.state();
            st.account = None;
            st.remote_fingerprint = None;
            st.drifted = false;
        }
        self.update_identity_key(&user_id, None);
        info!("account encryption disabled");
        Ok(())
    }

    /// Compare local key material with the backend's. On drift, encryption is
    /// reported disabled until keys are re-imported or re-established.
    pub fn validate_certificate_for_account(&self) -> bool {
        let drift = {
            let mut st = self.state();
            let local = st.account.as_ref().map(IdentityKeyPair::fingerprint);
            let drift = match (&local, &st.remote_fingerprint) {
                (Some(l), Some(r)) => l != r,
                (None, Some(_)) => true,
                _ => false,
            };
            let newly = drift && !st.drifted;
            st.drifted = drift;
            (drift, newly)
        };
        if drift.1 {
            warn!("account key drift detected");
            self.inner.events.emit(Notification::KeyDriftDetected);
        }
        !drift.0
    }

    pub(crate) fn set_remote_fingerprint(&self, fingerprint: Option<String>) {
        self.state().remote_fingerprint = fingerprint;
    }

    /// Install a key pair from a QR payload. All-or-nothing.
    pub fn import_key_pair(&self, payload: &str) -> Result<(), KeyError> {
        let pair = IdentityKeyPair::import_qr_payload(payload)
            .map_err(|e| KeyError::InvalidPayload(e.to_string()))?;
        let fingerprint = pair.fingerprint();
        {
            let mut st = self.state();
            st.drifted = st
                .remote_fingerprint
                .as_ref()
                .is_some_and(|remote| *remote != fingerprint);
            if st.remote_fingerprint.is_none() {
                st.remote_fingerprint = Some(fingerprint.clone());
            }
            st.account = Some(pair);
        }
        info!(%fingerprint, "key pair imported");
        Ok(())
    }

    /// Export the account key pair for QR rendering. `None` without a key pair.
    pub fn export_key_pair_as_qr(&self, dimensions: (u32, u32)) -> Option<QrExport> {
        let st = self.state();
        let pair = st.account.as_ref()?;
        Some(QrExport {
            payload: pair.export_qr_payload(),
            dimensions,
        })
    }

    pub fn account_fingerprint(&self) -> Option<String> {
        self.state().account.as_ref().map(IdentityKeyPair::fingerprint)
    }

    fn update_identity_key(&self, user_id: &str, public_key: Option<Vec<u8>>) {
        let records = self.inner.records.as_ref();
        let mut identity = records::identity(records, user_id)
            .unwrap_or_else(|| commsdk_protocol::types::Identity::new(user_id, user_id));
        identity.encryption_ready = public_key.is_some();
        identity.public_key = public_key;
        records.put(Record::Identity(identity));
    }

    // ── Per-user payloads ─────────────────────────────────────────────

    pub fn can_submit_encrypted_to_user(&self, user_id: &str) -> bool {
        self.encryption_enabled() && self.verified_key(user_id).is_some()
    }

    fn verified_key(&self, user_id: &str) -> Option<Vec<u8>> {
        records::identity(self.inner.records.as_ref(), user_id)
            .and_then(|i| i.verified_public_key().map(<[u8]>::to_vec))
    }

    pub(crate) fn seal_for_user(&self, user_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        if !self.encryption_enabled() {
            return Err(KeyError::NotEnabled);
        }
        let key = self
            .verified_key(user_id)
            .ok_or_else(|| KeyError::NoVerifiedKey(user_id.to_string()))?;
        sealed::seal(&key, &user_aad(user_id), plaintext).map_err(|e| KeyError::Crypto(e.to_string()))
    }

    pub(crate) fn open_for_self(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        let user_id = self.inner.link.user_id().ok_or(TransportError::NotConnected)?;
        let st = self.state();
        let pair = st.account.as_ref().ok_or(KeyError::NotEnabled)?;
        sealed::open(pair, &user_aad(&user_id), ciphertext).map_err(|e| KeyError::Crypto(e.to_string()))
    }

    // ── Groups ────────────────────────────────────────────────────────

    pub fn group_encryption_enabled(&self, group_id: &str) -> bool {
        self.state().group_keys.contains_key(group_id)
    }

    /// Members holding the current group key.
    pub fn encryption_enabled_members(&self, group_id: &str) -> BTreeSet<UserId> {
        records::group(self.inner.records.as_ref(), group_id)
            .map(|g| g.encryption_ready().clone())
            .unwrap_or_default()
    }

    /// Generate a group key and distribute it to every verified member.
    ///
    /// Returns `None` if account encryption is off, the group is unknown or it
    /// already has a key. Resolves with the members that were provisioned.
    pub fn enable_encryption_for_group(
        &self,
        group_id: &str,
    ) -> Option<Pending<Result<BTreeSet<UserId>, KeyError>>> {
        if !self.encryption_enabled()
            || records::group(self.inner.records.as_ref(), group_id).is_none()
        {
            return None;
        }
        {
            let mut st = self.state();
            if st.group_keys.contains_key(group_id) || !st.groups_busy.insert(group_id.to_string()) {
                return None;
            }
        }
        let key = match GroupKey::generate(1) {
            Ok(k) => k,
            Err(e) => {
                self.state().groups_busy.remove(group_id);
                return Some(Pending::ready(Err(KeyError::Crypto(e.to_string()))));
            }
        };
        Some(self.spawn_distribution(group_id.to_string(), key))
    }

    /// Re-wrap and redistribute the group key to the current verified members.
    ///
    /// Members that were removed since the last distribution force a new key.
    /// With no membership or verification change the result is identical.
    pub fn refresh_keys_for_group(
        &self,
        group_id: &str,
    ) -> Option<Pending<Result<BTreeSet<UserId>, KeyError>>> {
        if !self.encryption_enabled() {
            return None;
        }
        let group = records::group(self.inner.records.as_ref(), group_id)?;
        let key = {
            let mut st = self.state();
            let current = st.group_keys.get(group_id)?.clone();
            if !st.groups_busy.insert(group_id.to_string()) {
                return None;
            }
            // Unknown holders could include a removed member.
            let removed_member = st
                .provisioned
                .get(group_id)
                .map_or(true, |set| set.iter().any(|m| !group.is_member(m)));
            if removed_member {
                None
            } else {
                Some(current)
            }
        };
        let key = match key {
            Some(k) => k,
            None => {
                let next_id = self
                    .state()
                    .group_keys
                    .get(group_id)
                    .map_or(1, |k| k.key_id.wrapping_add(1));
                info!(group_id, key_id = next_id, "member removed, rotating group key");
                match GroupKey::generate(next_id) {
                    Ok(k) => k,
                    Err(e) => {
                        self.state().groups_busy.remove(group_id);
                        return Some(Pending::ready(Err(KeyError::Crypto(e.to_string()))));
                    }
                }
            }
        };
        Some(self.spawn_distribution(group_id.to_string(), key))
    }

    fn spawn_distribution(
        &self,
        group_id: GroupId,
        key: GroupKey,
    ) -> Pending<Result<BTreeSet<UserId>, KeyError>> {
        let this = self.clone();
        Pending::spawn(async move {
            let result = this.distribute(&group_id, key).await;
            this.state().groups_busy.remove(&group_id);
            result
        })
    }

    async fn distribute(&self, group_id: &str, key: GroupKey) -> Result<BTreeSet<UserId>, KeyError> {
        let me = self.inner.link.user_id().ok_or(TransportError::NotConnected)?;
        let records = self.inner.records.as_ref();
        let mut group = records::group(records, group_id)
            .ok_or_else(|| KeyError::UnknownGroup(group_id.to_string()))?;

        let mut provisioned = BTreeSet::new();
        let mut wrapped = Vec::new();
        for member in group.members() {
            if *member == me {
                provisioned.insert(member.clone());
                continue;
            }
            let Some(public) = self.verified_key(member) else {
                continue;
            };
            match key.wrap_for(group_id, &public) {
                Ok(sealed) => {
                    wrapped.push(WrappedGroupKey {
                        member: member.clone(),
                        sealed,
                    });
                    provisioned.insert(member.clone());
                }
                Err(e) => warn!(group_id, member = %member, "failed to wrap group key: {e}"),
            }
        }

        self.inner
            .link
            .send(Signal::GroupKeyDistribution {
                group_id: group_id.to_string(),
                key_id: key.key_id,
                from: me,
                wrapped,
            })
            .await?;

        let key_id = key.key_id;
        {
            let mut st = self.state();
            st.group_keys.insert(group_id.to_string(), key);
            st.provisioned.insert(group_id.to_string(), provisioned.clone());
        }
        group.key_id = Some(key_id);
        group.set_ready(provisioned.iter().cloned());
        records.put(Record::Group(group));

        info!(group_id, key_id, members = provisioned.len(), "group key distributed");
        Ok(provisioned)
    }

    /// Revoke the group key. Returns `None` if the group has no key.
    pub fn disable_encryption_for_group(
        &self,
        group_id: &str,
    ) -> Option<Pending<Result<(), KeyError>>> {
        {
            let mut st = self.state();
            if !st.group_keys.contains_key(group_id) || !st.groups_busy.insert(group_id.to_string()) {
                return None;
            }
        }
        let this = self.clone();
        let group_id = group_id.to_string();
        Some(Pending::spawn(async move {
            let result = this
                .inner
                .link
                .send(Signal::GroupKeyRevoked {
                    group_id: group_id.clone(),
                })
                .await
                .map_err(KeyError::from);
            if result.is_ok() {
                this.drop_group_key(&group_id);
                info!(group_id, "group encryption disabled");
            }
            this.state().groups_busy.remove(&group_id);
            result
        }))
    }

    fn drop_group_key(&self, group_id: &str) {
        {
            let mut st = self.state();
            st.group_keys.remove(group_id);
            st.provisioned.remove(group_id);
        }
        let records = self.inner.records.as_ref();
        if let Some(mut group) = records::group(records, group_id) {
            group.key_id = None;
            group.clear_ready();
            records.put(Record::Group(group));
        }
    }

    pub(crate) fn group_encrypt(
        &self,
        group_id: &str,
        plaintext: &[u8],
    ) -> Result<(u32, Vec<u8>), KeyError> {
        let st = self.state();
        let key = st
            .group_keys
            .get(group_id)
            .ok_or_else(|| KeyError::UnknownGroup(group_id.to_string()))?;
        let ct = key
            .encrypt(&group_aad(group_id), plaintext)
            .map_err(|e| KeyError::Crypto(e.to_string()))?;
        Ok((key.key_id, ct))
    }

    pub(crate) fn group_decrypt(
        &self,
        group_id: &str,
        key_id: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        let st = self.state();
        let key = st
            .group_keys
            .get(group_id)
            .filter(|k| k.key_id == key_id)
            .ok_or_else(|| KeyError::UnknownGroup(group_id.to_string()))?;
        key.decrypt(&group_aad(group_id), ciphertext)
            .map_err(|e| KeyError::Crypto(e.to_string()))
    }

    // ── Inbound ───────────────────────────────────────────────────────

    pub(crate) fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::PublicKeyPublished { user_id, public_key } => {
                self.on_public_key_published(&user_id, public_key)
            }
            Signal::GroupKeyDistribution {
                group_id,
                key_id,
                from,
                wrapped,
            } => self.on_group_key(&group_id, key_id, &from, &wrapped),
            Signal::GroupKeyRevoked { group_id } => self.drop_group_key(&group_id),
            _ => {}
        }
    }

    fn on_public_key_published(&self, user_id: &str, public_key: Option<Vec<u8>>) {
        if self.inner.link.user_id().as_deref() == Some(user_id) {
            // Our account key changed elsewhere.
            self.set_remote_fingerprint(public_key.as_deref().map(fingerprint_of));
            self.validate_certificate_for_account();
        }
        self.update_identity_key(user_id, public_key);
    }

    fn on_group_key(&self, group_id: &str, key_id: u32, from: &str, wrapped: &[WrappedGroupKey]) {
        let Some(me) = self.inner.link.user_id() else {
            return;
        };
        let Some(entry) = wrapped.iter().find(|w| w.member == me) else {
            return;
        };
        let key = {
            let st = self.state();
            let Some(pair) = st.account.as_ref() else {
                warn!(group_id, "group key received without an account key");
                return;
            };
            match GroupKey::unwrap_from(pair, group_id, key_id, &entry.sealed) {
                Ok(k) => k,
                Err(e) => {
                    warn!(group_id, key_id, "failed to unwrap group key: {e}");
                    return;
                }
            }
        };

        let mut holders: BTreeSet<UserId> = wrapped.iter().map(|w| w.member.clone()).collect();
        holders.insert(from.to_string());
        {
            let mut st = self.state();
            st.group_keys.insert(group_id.to_string(), key);
            st.provisioned.insert(group_id.to_string(), holders.clone());
        }
        let records = self.inner.records.as_ref();
        if let Some(mut group) = records::group(records, group_id) {
            group.key_id = Some(key_id);
            group.set_ready(holders);
            records.put(Record::Group(group));
        }
        info!(group_id, key_id, "group key installed");
        self.inner
            .events
            .emit(Notification::GroupKeyInstalled { group_id: group_id.to_string(), key_id });
    }

    // ── Persistence ───────────────────────────────────────────────────

    /// Save account and group keys, encrypted with the account secret.
    pub fn save_to(&self, path: &Path, secret: &str) -> anyhow::Result<()> {
        let store = {
            let st = self.state();
            KeyStore {
                account: st.account.as_ref().map(IdentityKeyPair::to_serializable),
                group_keys: st
                    .group_keys
                    .iter()
                    .map(|(id, k)| (id.clone(), k.clone()))
                    .collect(),
                group_holders: st
                    .provisioned
                    .iter()
                    .map(|(id, holders)| (id.clone(), holders.clone()))
                    .collect(),
            }
        };
        let blob = persistence::encrypt_store(&store, secret)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Restore keys saved by [`save_to`](Self::save_to). A missing file is not an error.
    pub fn load_from(&self, path: &Path, secret: &str) -> anyhow::Result<bool> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let store = persistence::decrypt_store(&data, secret)?;
        let account = store
            .account
            .as_ref()
            .map(|a| a.to_identity_key_pair())
            .transpose()?;
        let mut st = self.state();
        st.account = account;
        st.group_keys = store.group_keys.clone().into_iter().collect();
        st.provisioned = store.group_holders.clone().into_iter().collect();
        Ok(true)
    }

    /// Forget all key material (logout).
    pub(crate) fn clear(&self) {
        *self.state() = KeyState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aad_domains_do_not_collide() {
        assert_ne!(user_aad("x"), group_aad("x"));
        assert!(user_aad("bob").ends_with(b"bob"));
    }
}
