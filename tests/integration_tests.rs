//! Integration tests for the engine
//!
//! Tests complete flows through `E2eeManager`:
//! - Initialization, recovery and locking
//! - First contact via X3DH and ratcheted conversation
//! - Out-of-order delivery
//! - Safety numbers, maintenance and error surfaces

use e2ee_core::{
    AuditEvent, DeviceAddress, Directory, E2eeConfig, E2eeManager, Envelope, EnvelopeKind, Error,
    InMemoryBlobStore, InMemoryDirectory, ManualClock, MemoryAuditSink, SessionState,
};
use std::sync::Arc;

const DAY: i64 = 24 * 60 * 60;

struct World {
    directory: Arc<InMemoryDirectory>,
    clock: Arc<ManualClock>,
}

impl World {
    fn new() -> Self {
        Self {
            directory: Arc::new(InMemoryDirectory::new()),
            clock: Arc::new(ManualClock::new(1_700_000_000)),
        }
    }

    fn config() -> E2eeConfig {
        E2eeConfig {
            kdf_iterations: 1_000,
            one_time_prekey_batch: 10,
            one_time_prekey_low_watermark: 4,
            safety_number_iterations: 50,
            ..E2eeConfig::default()
        }
    }

    fn device_on(
        &self,
        user: &str,
        blobs: InMemoryBlobStore,
        audit: Arc<MemoryAuditSink>,
    ) -> E2eeManager {
        E2eeManager::with_clock_and_audit(
            DeviceAddress::new(user, 1),
            Arc::new(blobs),
            self.directory.clone(),
            Self::config(),
            self.clock.clone(),
            audit,
        )
        .expect("valid config")
    }

    fn device(&self, user: &str) -> E2eeManager {
        self.device_on(user, InMemoryBlobStore::new(), Arc::new(MemoryAuditSink::new()))
    }
}

fn kind(bytes: &[u8]) -> EnvelopeKind {
    Envelope::from_bytes(bytes).expect("valid envelope").kind()
}

#[tokio::test]
async fn test_concrete_scenario() {
    let world = World::new();
    let alice_blobs = InMemoryBlobStore::new();
    let alice = world.device_on("alice", alice_blobs.clone(), Arc::new(MemoryAuditSink::new()));
    let bob = world.device("bob");

    let recovery_code = alice.initialize("correct-horse").await.unwrap();
    bob.initialize("tr0ub4dor").await.unwrap();

    // First message runs X3DH: one bundle fetch, one one-time prekey.
    let hi = alice.encrypt_for_send("bob", 1, b"hi").await.unwrap();
    assert_eq!(kind(&hi), EnvelopeKind::PreKeyMessage);
    assert_eq!(world.directory.fetch_count(), 1);

    assert_eq!(&bob.decrypt_received(&hi).await.unwrap()[..], b"hi");
    assert_eq!(bob.session_state("alice", 1).unwrap(), SessionState::Established);
    assert_eq!(
        world
            .directory
            .consumed_prekeys(bob.device())
            .unwrap()
            .len(),
        1
    );

    // Second message needs no handshake.
    let there = alice.encrypt_for_send("bob", 1, b"there").await.unwrap();
    assert_eq!(kind(&there), EnvelopeKind::NormalMessage);
    assert_eq!(world.directory.fetch_count(), 1);
    assert_eq!(&bob.decrypt_received(&there).await.unwrap()[..], b"there");

    // Fresh install over the same storage, recovered with the code.
    let reinstalled = world.device_on("alice", alice_blobs, Arc::new(MemoryAuditSink::new()));
    assert!(reinstalled.is_locked());
    reinstalled.recover(&recovery_code.to_string()).await.unwrap();
    assert!(!reinstalled.is_locked());

    let again = reinstalled.encrypt_for_send("bob", 1, b"still me").await.unwrap();
    assert_eq!(kind(&again), EnvelopeKind::NormalMessage);
    assert_eq!(&bob.decrypt_received(&again).await.unwrap()[..], b"still me");
}

#[tokio::test]
async fn test_conversation_round_trips() {
    let world = World::new();
    let alice = world.device("alice");
    let bob = world.device("bob");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();

    for round in 0..5 {
        let from_alice = format!("alice {round}");
        let envelope = alice
            .encrypt_for_send("bob", 1, from_alice.as_bytes())
            .await
            .unwrap();
        assert_eq!(&bob.decrypt_received(&envelope).await.unwrap()[..], from_alice.as_bytes());

        let from_bob = format!("bob {round}");
        let envelope = bob
            .encrypt_for_send("alice", 1, from_bob.as_bytes())
            .await
            .unwrap();
        assert_eq!(&alice.decrypt_received(&envelope).await.unwrap()[..], from_bob.as_bytes());
    }
}

#[tokio::test]
async fn test_out_of_order_delivery() {
    let world = World::new();
    let alice = world.device("alice");
    let bob = world.device("bob");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();

    let hello = alice.encrypt_for_send("bob", 1, b"hello").await.unwrap();
    bob.decrypt_received(&hello).await.unwrap();

    let m1 = alice.encrypt_for_send("bob", 1, b"one").await.unwrap();
    let m2 = alice.encrypt_for_send("bob", 1, b"two").await.unwrap();
    let m3 = alice.encrypt_for_send("bob", 1, b"three").await.unwrap();

    assert_eq!(&bob.decrypt_received(&m2).await.unwrap()[..], b"two");
    assert_eq!(&bob.decrypt_received(&m3).await.unwrap()[..], b"three");
    assert_eq!(&bob.decrypt_received(&m1).await.unwrap()[..], b"one");

    // Each skipped key opens its message once.
    assert_eq!(
        bob.decrypt_received(&m1).await.unwrap_err(),
        Error::DecryptionFailed
    );
}

#[tokio::test]
async fn test_tampering_and_garbage() {
    let world = World::new();
    let alice = world.device("alice");
    let bob = world.device("bob");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();

    bob.decrypt_received(&alice.encrypt_for_send("bob", 1, b"x").await.unwrap())
        .await
        .unwrap();

    let mut envelope = alice.encrypt_for_send("bob", 1, b"secret").await.unwrap();
    let last = envelope.len() - 1;
    envelope[last] ^= 0x80;
    let err = bob.decrypt_received(&envelope).await.unwrap_err();
    assert_eq!(err, Error::DecryptionFailed);
    assert_eq!(err.user_message(), "Message could not be decrypted.");

    assert_eq!(
        bob.decrypt_received(b"\x01\x02garbage").await.unwrap_err(),
        Error::InvalidEnvelope
    );
}

#[tokio::test]
async fn test_wrong_password_and_locked() {
    let world = World::new();
    let alice = world.device("alice");
    alice.initialize("correct-horse").await.unwrap();

    alice.lock();
    assert_eq!(alice.safety_number("bob", 1).await.unwrap_err(), Error::Locked);
    assert_eq!(
        alice.decrypt_received(b"anything").await.unwrap_err(),
        Error::Locked
    );
    assert_eq!(
        alice.unlock("battery-staple").unwrap_err(),
        Error::AuthenticationFailed
    );
    alice.unlock("correct-horse").unwrap();
}

#[tokio::test]
async fn test_recovery_on_unrelated_storage_fails() {
    let world = World::new();
    let alice = world.device("alice");
    let code = alice.initialize("pw").await.unwrap();

    let stranger = world.device("alice");
    assert_eq!(
        stranger.recover(&code.to_string()).await.unwrap_err(),
        Error::NotInitialized
    );
}

#[tokio::test]
async fn test_safety_numbers_match_and_persist_verification() {
    let world = World::new();
    let alice = world.device("alice");
    let bob = world.device("bob");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();

    let seen_by_alice = alice.safety_number("bob", 1).await.unwrap();
    let seen_by_bob = bob.safety_number("alice", 1).await.unwrap();
    assert_eq!(seen_by_alice.digits(), seen_by_bob.digits());
    assert!(!seen_by_alice.is_verified());

    assert!(!alice
        .mark_safety_number_verified("bob", 1, "00000 00000")
        .await
        .unwrap());
    assert!(alice
        .mark_safety_number_verified("bob", 1, &seen_by_bob.display_string())
        .await
        .unwrap());
    assert!(alice.safety_number("bob", 1).await.unwrap().is_verified());
}

#[tokio::test]
async fn test_peer_reinstall_clears_verification() {
    let world = World::new();
    let audit = Arc::new(MemoryAuditSink::new());
    let alice = world.device_on("alice", InMemoryBlobStore::new(), audit.clone());
    let bob = world.device("bob");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();

    let first = bob.encrypt_for_send("alice", 1, b"hi").await.unwrap();
    alice.decrypt_received(&first).await.unwrap();
    let number = alice.safety_number("bob", 1).await.unwrap();
    assert!(alice
        .mark_safety_number_verified("bob", 1, number.digits())
        .await
        .unwrap());

    // Bob reinstalls and writes again.
    let bob_again = world.device("bob");
    bob_again.initialize("b2").await.unwrap();
    let envelope = bob_again.encrypt_for_send("alice", 1, b"new phone").await.unwrap();
    assert_eq!(&alice.decrypt_received(&envelope).await.unwrap()[..], b"new phone");

    assert!(audit.events().contains(&AuditEvent::PeerIdentityChanged {
        peer: DeviceAddress::new("bob", 1)
    }));
    let changed = alice.safety_number("bob", 1).await.unwrap();
    assert_ne!(changed.digits(), number.digits());
    assert!(!changed.is_verified());
}

#[tokio::test]
async fn test_maintenance_cycle() {
    let world = World::new();
    let alice = world.device("alice");
    let bob = world.device("bob");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();

    // Drain Bob's published pool below the watermark.
    for _ in 0..7 {
        world.directory.fetch_bundle(bob.device()).await.unwrap();
    }
    bob.decrypt_received(&alice.encrypt_for_send("bob", 1, b"hi").await.unwrap())
        .await
        .unwrap();
    assert_eq!(
        world
            .directory
            .remaining_one_time_prekeys(bob.device())
            .await
            .unwrap(),
        2
    );

    world.clock.advance(8 * DAY);
    let report = bob.run_maintenance().await.unwrap();
    assert_eq!(report.rotated_signed_prekey, Some(2));
    assert_eq!(report.signed_prekeys_purged, 0);
    assert_eq!(report.one_time_prekeys_generated, 8);
    assert_eq!(report.pending_consumptions_completed, 0);
    assert_eq!(report.sessions_expired, 0);
    assert_eq!(world.directory.signed_prekey_id(bob.device()).unwrap(), Some(2));

    // Sessions built on the retired signed prekey keep working.
    let more = alice.encrypt_for_send("bob", 1, b"after rotation").await.unwrap();
    assert_eq!(&bob.decrypt_received(&more).await.unwrap()[..], b"after rotation");

    world.clock.advance(31 * DAY);
    let report = bob.run_maintenance().await.unwrap();
    assert_eq!(report.signed_prekeys_purged, 1);
    assert_eq!(report.rotated_signed_prekey, Some(3));
    assert_eq!(report.sessions_expired, 1);
    assert_eq!(bob.session_state("alice", 1).unwrap(), SessionState::Expired);
}

#[tokio::test]
async fn test_handshake_with_retired_signed_prekey() {
    let world = World::new();
    let alice = world.device("alice");
    let bob = world.device("bob");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();

    // Alice's first message is in flight while Bob rotates.
    let in_flight = alice.encrypt_for_send("bob", 1, b"in flight").await.unwrap();
    world.clock.advance(7 * DAY);
    bob.run_maintenance().await.unwrap();

    assert_eq!(&bob.decrypt_received(&in_flight).await.unwrap()[..], b"in flight");
}

#[tokio::test]
async fn test_revoke_forces_new_handshake() {
    let world = World::new();
    let alice = world.device("alice");
    let bob = world.device("bob");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();

    bob.decrypt_received(&alice.encrypt_for_send("bob", 1, b"1").await.unwrap())
        .await
        .unwrap();

    assert!(alice.revoke_session("bob", 1).await.unwrap());
    assert_eq!(alice.session_state("bob", 1).unwrap(), SessionState::Expired);

    let envelope = alice.encrypt_for_send("bob", 1, b"2").await.unwrap();
    assert_eq!(kind(&envelope), EnvelopeKind::PreKeyMessage);
    assert_eq!(world.directory.fetch_count(), 2);
    assert_eq!(&bob.decrypt_received(&envelope).await.unwrap()[..], b"2");
}

#[tokio::test]
async fn test_unknown_session_is_retriable() {
    let world = World::new();
    let alice = world.device("alice");
    let bob = world.device("bob");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();

    let _lost = alice.encrypt_for_send("bob", 1, b"lost").await.unwrap();
    let next = alice.encrypt_for_send("bob", 1, b"next").await.unwrap();

    let err = bob.decrypt_received(&next).await.unwrap_err();
    assert_eq!(err, Error::UnknownSession);
    assert!(err.is_retriable());

    // Sender starts over.
    alice.revoke_session("bob", 1).await.unwrap();
    let retry = alice.encrypt_for_send("bob", 1, b"next").await.unwrap();
    assert_eq!(&bob.decrypt_received(&retry).await.unwrap()[..], b"next");
}

#[tokio::test]
async fn test_forged_sender_cannot_take_over_session() {
    let world = World::new();
    let alice = world.device("alice");
    let bob = world.device("bob");
    let mallory = world.device("mallory");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();
    mallory.initialize("m").await.unwrap();

    bob.decrypt_received(&alice.encrypt_for_send("bob", 1, b"hi").await.unwrap())
        .await
        .unwrap();

    let envelope = mallory
        .encrypt_for_send("bob", 1, b"it's alice, new phone")
        .await
        .unwrap();
    let mut forged = Envelope::from_bytes(&envelope).unwrap();
    forged.sender = DeviceAddress::new("alice", 1);
    assert_eq!(
        bob.decrypt_received(&forged.to_bytes().unwrap()).await.unwrap_err(),
        Error::HandshakeFailed
    );

    let reply = bob.encrypt_for_send("alice", 1, b"secret for alice").await.unwrap();
    assert_eq!(kind(&reply), EnvelopeKind::NormalMessage);
    assert_eq!(&alice.decrypt_received(&reply).await.unwrap()[..], b"secret for alice");
}

#[tokio::test]
async fn test_reset_publishes_full_prekey_pool() {
    let world = World::new();
    let alice = world.device("alice");
    let bob = world.device("bob");
    alice.initialize("a").await.unwrap();
    bob.initialize("b").await.unwrap();

    bob.decrypt_received(&alice.encrypt_for_send("bob", 1, b"hi").await.unwrap())
        .await
        .unwrap();
    assert_eq!(world.directory.consumed_prekeys(bob.device()).unwrap(), vec![1]);

    bob.reset("b2").await.unwrap();
    assert_eq!(
        world
            .directory
            .remaining_one_time_prekeys(bob.device())
            .await
            .unwrap(),
        10
    );
    assert!(world.directory.consumed_prekeys(bob.device()).unwrap().is_empty());

    // Alice's stale session is answered with a fresh handshake.
    alice.revoke_session("bob", 1).await.unwrap();
    let again = alice.encrypt_for_send("bob", 1, b"again").await.unwrap();
    assert_eq!(&bob.decrypt_received(&again).await.unwrap()[..], b"again");
}
