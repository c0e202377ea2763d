use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use sspool::crypto::{derive_subkey, evp_bytes_to_key, AeadCipher, CipherKind, MAX_PAYLOAD};

fn bench_chunk_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_seal");
    for kind in [
        CipherKind::Aes128Gcm,
        CipherKind::Aes256Gcm,
        CipherKind::ChaCha20Poly1305,
    ] {
        let key = evp_bytes_to_key(b"bench-password", kind.key_len());
        let salt = vec![0u8; kind.salt_len()];
        let subkey = derive_subkey(&key, &salt, kind.key_len()).unwrap();
        let payload = vec![0xABu8; MAX_PAYLOAD];

        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_function(kind.canonical_name(), |b| {
            let mut cipher = AeadCipher::new(kind, subkey.clone());
            b.iter(|| cipher.encrypt(&payload).unwrap());
        });
    }
    group.finish();
}

fn bench_chunk_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_open");
    for kind in [
        CipherKind::Aes128Gcm,
        CipherKind::Aes256Gcm,
        CipherKind::ChaCha20Poly1305,
    ] {
        let key = evp_bytes_to_key(b"bench-password", kind.key_len());
        let salt = vec![0u8; kind.salt_len()];
        let subkey = derive_subkey(&key, &salt, kind.key_len()).unwrap();
        let payload = vec![0xABu8; MAX_PAYLOAD];

        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_function(kind.canonical_name(), |b| {
            b.iter_batched(
                || {
                    let mut sealer = AeadCipher::new(kind, subkey.clone());
                    let frame = sealer.encrypt(&payload).unwrap();
                    (AeadCipher::new(kind, subkey.clone()), frame)
                },
                |(mut opener, frame)| opener.decrypt(&frame).unwrap(),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");
    group.bench_function("evp_bytes_to_key_32", |b| {
        b.iter(|| evp_bytes_to_key(b"bench-password", 32));
    });
    group.bench_function("hkdf_subkey_32", |b| {
        let key = evp_bytes_to_key(b"bench-password", 32);
        let salt = vec![7u8; 32];
        b.iter(|| derive_subkey(&key, &salt, 32).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_chunk_seal, bench_chunk_open, bench_key_derivation);
criterion_main!(benches);
