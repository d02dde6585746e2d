// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Integration tests for the JWKS-backed key resolver: cache hits, TTL
//! expiry, single-flight coalescing of concurrent misses, and failure
//! sharing between coalesced waiters.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::future::join_all;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::Algorithm;
use log::debug;
use oidc_gatekeeper::{AuthError, JwksCache, JwksFetcher};
use rsa::traits::PublicKeyParts;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

static INIT: Once = Once::new();

/// Setup logger for tests
fn setup() {
    INIT.call_once(|| {
        env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// Build a one-key JWKS document from a freshly generated RSA key pair.
fn test_jwk_set() -> JwkSet {
    let mut rng = rsa::rand_core::OsRng;
    let private_key =
        rsa::RsaPrivateKey::new(&mut rng, 2048).expect("Failed to generate RSA private key");
    let public_key = rsa::RsaPublicKey::from(&private_key);
    let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());
    serde_json::from_value(json!({
        "keys": [{
            "kty": "RSA",
            "kid": "key-1",
            "alg": "RS256",
            "use": "sig",
            "n": n,
            "e": e,
        }]
    }))
    .expect("JWKS document should parse")
}

/// Fetcher that counts calls and optionally delays, widening the window in
/// which concurrent misses can pile up behind the fetch lock.
struct CountingFetcher {
    set: JwkSet,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl JwksFetcher for CountingFetcher {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.set.clone())
    }
}

/// Fetcher that always fails at the transport level.
struct FailingFetcher {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl JwksFetcher for FailingFetcher {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AuthError::ProviderUnreachable {
            detail: "connection refused".to_string(),
        })
    }
}

/// Fetcher that always times out.
struct TimingOutFetcher {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl JwksFetcher for TimingOutFetcher {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AuthError::Timeout {
            operation: "JWKS fetch",
        })
    }
}

/// Fetcher that signals when a fetch has started, blocks until released,
/// then fails. Lets a test line up a second resolver behind the fetch lock
/// deterministically.
struct GatedFailingFetcher {
    started: Arc<Semaphore>,
    release: Arc<Notify>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl JwksFetcher for GatedFailingFetcher {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.add_permits(1);
        self.release.notified().await;
        Err(AuthError::KeyResolutionFailed {
            reason: "synthetic fetch failure".to_string(),
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fifty_concurrent_misses_trigger_exactly_one_fetch() {
    setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(JwksCache::new(Box::new(CountingFetcher {
        set: test_jwk_set(),
        calls: calls.clone(),
        delay: Duration::from_millis(20),
    })));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.resolve("key-1").await })
        })
        .collect();

    for result in join_all(tasks).await {
        let key = result.expect("task panicked").expect("resolve failed");
        assert_eq!(key.kid, "key-1");
        assert_eq!(key.algorithm, Some(Algorithm::RS256));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_hit_skips_the_network() {
    setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = JwksCache::new(Box::new(CountingFetcher {
        set: test_jwk_set(),
        calls: calls.clone(),
        delay: Duration::ZERO,
    }));

    cache.resolve("key-1").await.expect("first resolve");
    cache.resolve("key-1").await.expect("second resolve");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_kid_fails_without_poisoning_the_cache() {
    setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = JwksCache::new(Box::new(CountingFetcher {
        set: test_jwk_set(),
        calls: calls.clone(),
        delay: Duration::ZERO,
    }));

    let err = cache.resolve("nope").await.unwrap_err();
    match err {
        AuthError::KeyResolutionFailed { reason } => {
            debug!("Unknown kid reported as: {}", reason);
            assert!(reason.contains("nope"));
        }
        other => panic!("expected KeyResolutionFailed, got {:?}", other),
    }

    // The fetch itself succeeded, so a known kid resolves from the cache.
    cache.resolve("key-1").await.expect("known kid resolves");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_ttl_forces_a_refetch() {
    setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = JwksCache::with_ttl(
        Box::new(CountingFetcher {
            set: test_jwk_set(),
            calls: calls.clone(),
            delay: Duration::ZERO,
        }),
        Duration::ZERO,
    );

    cache.resolve("key-1").await.expect("first resolve");
    cache.resolve("key-1").await.expect("second resolve");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn transport_failure_is_retried_once_then_surfaced() {
    setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = JwksCache::new(Box::new(FailingFetcher {
        calls: calls.clone(),
    }));

    let err = cache.resolve("key-1").await.unwrap_err();
    assert!(matches!(err, AuthError::KeyResolutionFailed { .. }));
    // One attempt plus exactly one retry.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn timed_out_fetch_is_retried_once_then_surfaced() {
    setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = JwksCache::new(Box::new(TimingOutFetcher {
        calls: calls.clone(),
    }));

    match cache.resolve("key-1").await.unwrap_err() {
        AuthError::KeyResolutionFailed { reason } => assert!(reason.contains("timed out")),
        other => panic!("expected KeyResolutionFailed, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn coalesced_waiters_share_a_failed_fetch() {
    setup();
    let started = Arc::new(Semaphore::new(0));
    let release = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(JwksCache::new(Box::new(GatedFailingFetcher {
        started: started.clone(),
        release: release.clone(),
        calls: calls.clone(),
    })));

    let first = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.resolve("key-1").await })
    };
    // Wait until the first resolver is inside the fetch before queueing the
    // second one behind it.
    started.acquire().await.expect("semaphore closed").forget();
    let second = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.resolve("key-1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.notify_one();

    let first = first.await.expect("task panicked");
    let second = second.await.expect("task panicked");
    assert!(matches!(first, Err(AuthError::KeyResolutionFailed { .. })));
    assert!(matches!(second, Err(AuthError::KeyResolutionFailed { .. })));
    // The waiter observed the leader's failure instead of fetching again.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
