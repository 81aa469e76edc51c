use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use e2ee_core::keys::{IdentityKeyPair, KeyPair};
use e2ee_core::primitives::derive_key;
use e2ee_core::x3dh::{initiate, respond, sign_prekey, PreKeyBundle, ResponderKeys};
use e2ee_core::SafetyNumberService;
use rand_core::OsRng;

struct Bob {
    identity: IdentityKeyPair,
    signed_prekey: KeyPair,
    one_time_prekey: KeyPair,
}

impl Bob {
    fn generate() -> Self {
        Self {
            identity: IdentityKeyPair::generate(&mut OsRng),
            signed_prekey: KeyPair::generate(&mut OsRng),
            one_time_prekey: KeyPair::generate(&mut OsRng),
        }
    }

    fn bundle(&self) -> PreKeyBundle {
        PreKeyBundle {
            identity_key: self.identity.public_key(),
            signed_prekey_id: 1,
            signed_prekey: self.signed_prekey.public_key(),
            signature: sign_prekey(
                &mut OsRng,
                &self.identity,
                &self.signed_prekey.public_key(),
            )
            .unwrap(),
            one_time_prekey: Some((1, self.one_time_prekey.public_key())),
        }
    }

    fn keys(&self) -> ResponderKeys<'_> {
        ResponderKeys {
            identity: &self.identity,
            signed_prekey: &self.signed_prekey,
            one_time_prekey: Some(&self.one_time_prekey),
        }
    }
}

fn bench_key_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_generation");

    group.bench_function("identity_keypair", |b| {
        b.iter(|| black_box(IdentityKeyPair::generate(&mut OsRng)));
    });

    for count in [10, 100] {
        group.bench_with_input(
            BenchmarkId::new("one_time_prekeys", count),
            &count,
            |b, &count| {
                b.iter(|| {
                    black_box(
                        (0..count)
                            .map(|_| KeyPair::generate(&mut OsRng))
                            .collect::<Vec<_>>(),
                    )
                });
            },
        );
    }

    group.finish();
}

fn bench_x3dh_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("x3dh_handshake");

    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Bob::generate();
    let bundle = bob.bundle();

    group.bench_function("initiate", |b| {
        b.iter(|| black_box(initiate(&mut OsRng, &alice_identity, &bundle).unwrap()));
    });

    group.bench_function("respond", |b| {
        let init = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();
        b.iter(|| black_box(respond(&bob.keys(), &init.initial_message).unwrap()));
    });

    group.bench_function("full_handshake", |b| {
        b.iter(|| {
            let alice = IdentityKeyPair::generate(&mut OsRng);
            let bob = Bob::generate();

            let init = initiate(&mut OsRng, &alice, &bob.bundle()).unwrap();
            let resp = respond(&bob.keys(), &init.initial_message).unwrap();

            black_box((init, resp))
        });
    });

    group.finish();
}

fn bench_signature_verification(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_verification");

    let bundle = Bob::generate().bundle();

    group.bench_function("verify_bundle_signature", |b| {
        b.iter(|| black_box(bundle.verify_signature().unwrap()));
    });

    group.finish();
}

fn bench_identity_derivations(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_derivations");
    group.sample_size(10);

    group.bench_function("master_key_100k", |b| {
        b.iter(|| black_box(derive_key(b"correct-horse", &[7u8; 16], 100_000)));
    });

    let alice = IdentityKeyPair::generate(&mut OsRng).public_key();
    let bob = IdentityKeyPair::generate(&mut OsRng).public_key();
    let service = SafetyNumberService::default();

    group.bench_function("safety_number", |b| {
        b.iter(|| black_box(service.generate(&alice, "alice", &bob, "bob")));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_key_generation,
    bench_x3dh_handshake,
    bench_signature_verification,
    bench_identity_derivations
);

criterion_main!(benches);
