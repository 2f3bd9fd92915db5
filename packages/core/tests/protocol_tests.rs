//! End-to-end protocol tests through the KeyService facade
//!
//! - One-time prekey consumption under concurrency
//! - Handshake without one-time prekeys, tampered bundles, timeouts
//! - Conversation key rotation and history, concurrent rotations
//! - Device revocation cascade, messages from the revoked device

use async_trait::async_trait;
use construct_e2ee::crypto::messaging::RatchetLimits;
use construct_e2ee::session::{LocalBundleSource, RatchetSessions};
use construct_e2ee::{
    BundleSource, Config, ConstructError, ConversationKeyring, DeviceAddress, KeyService, KeyStore, ManualClock,
    MemoryStorage, PreKeyBundle, Result, SealingKey, SessionKey, SessionState, SystemClock,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn config() -> Config {
    Config {
        one_time_prekey_batch: 5,
        one_time_prekey_low_water: 2,
        ..Config::default()
    }
}

fn service() -> KeyService<MemoryStorage> {
    KeyService::new(MemoryStorage::new(), SealingKey::generate().unwrap(), config())
}

fn device(user: &str, name: &str) -> DeviceAddress {
    DeviceAddress::new(user, name)
}

/// Exactly one claimer wins a given one-time prekey id
#[test]
fn test_concurrent_one_time_prekey_claim() {
    let api = service();
    let bob = device("bob", "laptop");
    let published = api.publish_device(&bob, false).unwrap();
    let key_id = published.one_time_prekeys[0].key_id;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let prekeys = api.prekeys().clone();
            let bob = bob.clone();
            std::thread::spawn(move || prekeys.consume_one_time_prekey(&bob, Some(key_id)))
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| matches!(r, Ok(Some(_)))).count();
    let already_used = results
        .iter()
        .filter(|r| matches!(r, Err(ConstructError::AlreadyUsed { .. })))
        .count();

    assert_eq!(winners, 1);
    assert_eq!(already_used, 7);
}

/// Concurrent handshakes never share a one-time prekey; losers degrade to reduced security
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_handshakes_share_no_one_time_prekey() {
    let api = KeyService::new(
        MemoryStorage::new(),
        SealingKey::generate().unwrap(),
        Config {
            one_time_prekey_batch: 1,
            ..config()
        },
    );
    let bob = device("bob", "laptop");
    api.publish_device(&bob, false).unwrap();

    let initiators: Vec<_> = (0..6).map(|i| device("alice", &format!("device-{}", i))).collect();
    for initiator in &initiators {
        api.publish_device(initiator, false).unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for initiator in initiators {
        let api = api.clone();
        let bob = bob.clone();
        tasks.spawn(async move { api.establish_session(&initiator, &bob).await });
    }

    let mut with_one_time_prekey = 0;
    let mut reduced = 0;
    while let Some(joined) = tasks.join_next().await {
        let session = joined.unwrap().unwrap();
        if session.reduced_security {
            reduced += 1;
        } else {
            with_one_time_prekey += 1;
        }
    }

    assert_eq!(with_one_time_prekey, 1);
    assert_eq!(reduced, 5);
}

/// Handshake with an empty one-time prekey pool still reaches Established
#[tokio::test]
async fn test_handshake_without_one_time_prekeys() {
    let api = KeyService::new(
        MemoryStorage::new(),
        SealingKey::generate().unwrap(),
        Config {
            one_time_prekey_batch: 0,
            one_time_prekey_low_water: 0,
            ..config()
        },
    );
    let alice = device("alice", "phone");
    let bob = device("bob", "laptop");
    api.publish_device(&alice, false).unwrap();
    let published = api.publish_device(&bob, false).unwrap();
    assert!(published.bundle.one_time_prekey.is_none());

    let initiated = api.establish_session(&alice, &bob).await.unwrap();
    assert!(initiated.reduced_security);
    assert_eq!(api.session_state(&alice, &bob).unwrap(), SessionState::Established);

    let message = initiated.initial_message.unwrap();
    assert_eq!(message.one_time_prekey_id, None);
    let accepted = api.accept_session(&bob, &message).unwrap();
    assert!(accepted.reduced_security);
    assert_eq!(api.session_state(&bob, &alice).unwrap(), SessionState::Established);
}

struct TamperingSource<S: construct_e2ee::KeyStore> {
    inner: LocalBundleSource<S>,
}

#[async_trait]
impl<S: construct_e2ee::KeyStore> BundleSource for TamperingSource<S> {
    async fn fetch_bundle(&self, address: &DeviceAddress) -> Result<PreKeyBundle> {
        let mut bundle = self.inner.fetch_bundle(address).await?;
        bundle.signed_prekey_signature[0] ^= 0x01;
        Ok(bundle)
    }

    async fn claim_one_time_prekey(&self, address: &DeviceAddress, key_id: u32) -> Result<()> {
        self.inner.claim_one_time_prekey(address, key_id).await
    }
}

/// One flipped signature bit aborts the handshake before any session exists
#[tokio::test]
async fn test_tampered_signed_prekey_signature() {
    let store = MemoryStorage::new();
    let sealing = SealingKey::generate().unwrap();
    let publisher = KeyService::new(store.clone(), sealing.clone(), config());
    let alice = device("alice", "phone");
    let bob = device("bob", "laptop");
    publisher.publish_device(&alice, false).unwrap();
    publisher.publish_device(&bob, false).unwrap();

    let source = Arc::new(TamperingSource {
        inner: LocalBundleSource::new(publisher.prekeys().clone()),
    });
    let api = KeyService::with_bundle_source(store.clone(), sealing, config(), Arc::new(ManualClock::new(Utc::now())), source);

    let result = api.establish_session(&alice, &bob).await;
    assert!(matches!(result, Err(ConstructError::InvalidSignature(_))));
    assert_eq!(store.session_count().unwrap(), 0);
    assert_eq!(api.session_state(&alice, &bob).unwrap(), SessionState::Uninitialized);
    // One-time prekey не тронут
    assert_eq!(api.prekeys().available_one_time_prekeys(&bob).unwrap(), 5);
}

struct StalledSource;

#[async_trait]
impl BundleSource for StalledSource {
    async fn fetch_bundle(&self, address: &DeviceAddress) -> Result<PreKeyBundle> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ConstructError::NotFound(format!("Bundle for {}", address)))
    }

    async fn claim_one_time_prekey(&self, _address: &DeviceAddress, _key_id: u32) -> Result<()> {
        Ok(())
    }
}

/// A bundle fetch that never completes surfaces HandshakeTimeout and persists nothing
#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let store = MemoryStorage::new();
    let api = KeyService::with_bundle_source(
        store.clone(),
        SealingKey::generate().unwrap(),
        Config {
            handshake_timeout_ms: 500,
            ..config()
        },
        Arc::new(ManualClock::new(Utc::now())),
        Arc::new(StalledSource),
    );
    let alice = device("alice", "phone");
    let bob = device("bob", "laptop");
    api.publish_device(&alice, false).unwrap();

    let result = api.establish_session(&alice, &bob).await;
    assert_eq!(result.unwrap_err(), ConstructError::HandshakeTimeout(500));
    assert!(ConstructError::HandshakeTimeout(500).is_retryable());
    assert_eq!(store.session_count().unwrap(), 0);
}

/// Versions increase; old keys read history but not new messages
#[tokio::test]
async fn test_conversation_key_rotation() {
    let api = service();
    let owner = device("alice", "phone");
    let bob = device("bob", "laptop");
    api.publish_device(&owner, false).unwrap();
    api.publish_device(&bob, false).unwrap();

    let conversation_id = Uuid::new_v4();
    let first = api
        .distribute_key(&owner, conversation_id, vec![bob.clone()])
        .await
        .unwrap();
    let mut bob_keyring = ConversationKeyring::new(conversation_id);
    bob_keyring.insert(
        first.version,
        api.unwrap_bundle(&bob, &first.delivered[0]).await.unwrap(),
    );

    let owner_keyring = api.conversation_keyring(conversation_id).unwrap();
    let history = owner_keyring.encrypt(b"written under v1").unwrap();

    let second = api.rotate_conversation_key(conversation_id).await.unwrap();
    assert!(second.version > first.version);
    let owner_keyring = api.conversation_keyring(conversation_id).unwrap();
    let latest = owner_keyring.encrypt(b"written under v2").unwrap();
    assert_eq!(latest.version, second.version);

    // Bob ещё не развернул v2
    assert!(bob_keyring.decrypt(&latest).is_err());
    assert_eq!(bob_keyring.decrypt(&history).unwrap(), b"written under v1");

    let pending = api.pending_bundles(conversation_id, &bob).unwrap();
    assert_eq!(pending.len(), 2);
    assert!(!pending[0].is_active);
    let v2 = pending.iter().find(|b| b.version == second.version).unwrap();
    bob_keyring.insert(v2.version, api.unwrap_bundle(&bob, v2).await.unwrap());

    assert_eq!(bob_keyring.decrypt(&latest).unwrap(), b"written under v2");
    assert_eq!(bob_keyring.decrypt(&history).unwrap(), b"written under v1");
}

/// Concurrent rotations of one conversation never reuse a version
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rotations_are_serialized() {
    let api = service();
    let owner = device("alice", "phone");
    let bob = device("bob", "laptop");
    api.publish_device(&owner, false).unwrap();
    api.publish_device(&bob, false).unwrap();

    let conversation_id = Uuid::new_v4();
    api.distribute_key(&owner, conversation_id, vec![bob.clone()])
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let api = api.clone();
            tokio::spawn(async move { api.rotate_conversation_key(conversation_id).await })
        })
        .collect();
    let mut reports = Vec::new();
    for handle in handles {
        reports.push(handle.await.unwrap().unwrap());
    }

    let mut versions: Vec<u32> = reports.iter().map(|r| r.version).collect();
    versions.sort_unstable();
    versions.dedup();
    assert_eq!(versions.len(), 8);

    let owner_keyring = api.conversation_keyring(conversation_id).unwrap();
    for report in &reports {
        let message = report.key.encrypt(conversation_id, report.version, b"sealed matches sent").unwrap();
        assert_eq!(owner_keyring.decrypt(&message).unwrap(), b"sealed matches sent");
    }
}

/// Revocation flips sessions and keys, then rotates the device's conversations
#[tokio::test]
async fn test_device_revocation() {
    let store = MemoryStorage::new();
    let sealing = SealingKey::generate().unwrap();
    let api = KeyService::new(store.clone(), sealing.clone(), config());
    let owner = device("alice", "phone");
    let bob = device("bob", "laptop");
    let lost = device("bob", "old-phone");
    for d in [&owner, &bob, &lost] {
        api.publish_device(d, false).unwrap();
    }

    let conversation_id = Uuid::new_v4();
    let first = api
        .distribute_key(&owner, conversation_id, vec![bob.clone(), lost.clone()])
        .await
        .unwrap();
    assert!(first.is_complete());

    // lost отвечает, чтобы у него тоже была сессия
    let to_lost = first.delivered.iter().find(|b| b.recipient == lost).unwrap();
    api.unwrap_bundle(&lost, to_lost).await.unwrap();
    let late = api.encrypt(&lost, &owner, b"late ack").await.unwrap();
    let ack = api.encrypt(&lost, &owner, b"ack").await.unwrap();
    assert_eq!(api.decrypt(&owner, &lost, &ack.envelope, None).await.unwrap(), b"ack");

    // Копия состояния, оставшаяся на украденном устройстве
    let lost_to_owner = SessionKey::new(lost.clone(), owner.clone());
    let retained = MemoryStorage::new();
    retained
        .insert_session(store.active_session(&lost_to_owner).unwrap().unwrap())
        .unwrap();
    let stolen = RatchetSessions::new(
        retained,
        sealing.clone(),
        Arc::new(SystemClock),
        RatchetLimits::from_config(&config()),
    );

    let report = api.revoke_device(&lost, "reported stolen").await.unwrap();
    assert!(report.identity_deactivated);
    assert_eq!(report.sessions_revoked, 2);
    assert_eq!(report.conversations_rotated.len(), 1);
    assert!(report.conversations_rotated[0].version > first.version);

    assert_eq!(api.session_state(&owner, &lost).unwrap(), SessionState::Revoked);
    let send = api.encrypt(&owner, &lost, b"after").await;
    assert!(matches!(send, Err(ConstructError::SessionRevoked(_))));
    let send_back = api.encrypt(&lost, &owner, b"after").await;
    assert!(matches!(send_back, Err(ConstructError::SessionRevoked(_))));

    // Ключ late выведен до отзыва, поэтому сообщение всё ещё расшифровывается
    assert_eq!(api.decrypt(&owner, &lost, &late.envelope, None).await.unwrap(), b"late ack");

    // Новое сообщение старой сессией от отозванного устройства
    let forged = stolen.encrypt(&lost_to_owner, b"after revoke").await.unwrap();
    let received = api.decrypt(&owner, &lost, &forged.envelope, None).await;
    assert!(matches!(received, Err(ConstructError::SessionRevoked(_))));

    // Новая версия доставлена только bob
    let latest = api.pending_bundles(conversation_id, &bob).unwrap();
    assert_eq!(latest.last().unwrap().version, report.conversations_rotated[0].version);
    let lost_bundles = api.pending_bundles(conversation_id, &lost).unwrap();
    assert!(lost_bundles.iter().all(|b| b.version == first.version && !b.is_active));
}

/// Hybrid identities yield a hybrid session on both sides
#[cfg(feature = "post-quantum")]
#[tokio::test]
async fn test_hybrid_session_end_to_end() {
    let api = service();
    let alice = device("alice", "phone");
    let bob = device("bob", "laptop");
    api.publish_device(&alice, true).unwrap();
    let published = api.publish_device(&bob, true).unwrap();
    assert!(published.bundle.quantum.is_some());

    let outbound = api.encrypt(&alice, &bob, b"post-quantum hello").await.unwrap();
    let handshake = outbound.handshake.clone().unwrap();
    assert!(handshake.quantum.is_some());

    let plaintext = api
        .decrypt(&bob, &alice, &outbound.envelope, Some(&handshake))
        .await
        .unwrap();
    assert_eq!(plaintext, b"post-quantum hello");
}
