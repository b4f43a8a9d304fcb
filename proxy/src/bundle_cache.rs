//! Cache of per-trust-domain CA bundles fed by the authority's bundle
//! subscription.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use authority_api::DelegatedAuthorityClient;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::trust_domain::TrustDomain;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Holds the latest trust bundle snapshot from the authority.
///
/// Reads block until the first snapshot has arrived, then always serve
/// the most recent snapshot. Each snapshot replaces the whole map, so a
/// trust domain absent from the newest snapshot is no longer served even
/// if an older snapshot carried it. If the subscription drops after the
/// first snapshot, reads keep serving the last snapshot while the cache
/// reconnects in the background.
pub struct TrustBundleCache {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    initialized: AtomicBool,
}

struct Inner {
    client: DelegatedAuthorityClient,
    bundles: RwLock<HashMap<String, Bytes>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl TrustBundleCache {
    /// Creates a cache that is not yet subscribed. Call [`Self::init`]
    /// to start the background subscription.
    #[must_use]
    pub fn new(client: DelegatedAuthorityClient) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        TrustBundleCache {
            inner: Arc::new(Inner {
                client,
                bundles: RwLock::new(HashMap::new()),
                ready_tx,
                ready_rx,
            }),
            supervisor: Mutex::new(None),
            cancel: CancellationToken::new(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Starts the background bundle subscription. Idempotent.
    pub fn init(&self) -> Result<(), ProxyError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            run_subscription(inner, cancel).await;
        });

        let mut supervisor = self
            .supervisor
            .lock()
            .map_err(ProxyError::from_lock_err)?;
        *supervisor = Some(handle);
        Ok(())
    }

    /// Returns the CA bundle for the given trust domain from the latest
    /// snapshot, waiting until the given deadline for the first snapshot
    /// if none has arrived yet.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::TrustBundleTimeout`] if no snapshot arrives
    /// before the deadline, or [`ProxyError::TrustBundleMissing`] if the
    /// latest snapshot has no bundle for the trust domain.
    pub async fn x509_bundle(
        &self,
        trust_domain: &TrustDomain,
        deadline: Instant,
    ) -> Result<Bytes, ProxyError> {
        let mut ready = self.inner.ready_rx.clone();
        if !*ready.borrow() {
            debug!("waiting for the first trust bundle snapshot");
            match tokio::time::timeout_at(deadline, ready.wait_for(|r| *r)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_closed)) => {
                    return Err(ProxyError::Internal(
                        "trust bundle cache was shut down".to_string(),
                    ));
                }
                Err(_elapsed) => return Err(ProxyError::TrustBundleTimeout),
            }
        }

        let bundles = self
            .inner
            .bundles
            .read()
            .map_err(ProxyError::from_lock_err)?;
        bundles
            .get(trust_domain.as_str())
            .cloned()
            .ok_or_else(|| ProxyError::TrustBundleMissing {
                trust_domain: trust_domain.to_string(),
            })
    }

    #[cfg(test)]
    pub(crate) fn set_snapshot_for_tests(&self, snapshot: HashMap<String, Bytes>) {
        store_snapshot(&self.inner, snapshot);
    }

    /// Stops the background subscription and waits for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = match self.supervisor.lock() {
            Ok(mut supervisor) => supervisor.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl fmt::Debug for TrustBundleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustBundleCache")
            .field("ready", &*self.inner.ready_rx.borrow())
            .finish_non_exhaustive()
    }
}

/// Keeps a bundle subscription open, replacing the snapshot map on every
/// message. Reconnects with capped exponential backoff after a stream
/// failure; the backoff resets once a snapshot is delivered again.
async fn run_subscription(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut backoff = MIN_BACKOFF;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let stream = tokio::select! {
            () = cancel.cancelled() => return,
            result = inner.client.stream_x509_bundles() => result,
        };

        match stream {
            Ok(mut stream) => loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    message = stream.next() => match message {
                        Some(Ok(snapshot)) => {
                            store_snapshot(&inner, snapshot);
                            backoff = MIN_BACKOFF;
                        }
                        Some(Err(e)) => {
                            warn!("trust bundle subscription failed: {e}");
                            break;
                        }
                        None => {
                            warn!("trust bundle subscription closed by the authority");
                            break;
                        }
                    },
                }
            },
            Err(e) => {
                warn!("failed to open trust bundle subscription: {e}");
            }
        }

        debug!("retrying trust bundle subscription in {backoff:?}");
        if !sleep_or_cancel(&cancel, backoff).await {
            return;
        }
        backoff = next_backoff(backoff);
    }
}

fn store_snapshot(inner: &Inner, snapshot: HashMap<String, Bytes>) {
    info!(
        "received trust bundle snapshot with {} trust domain(s)",
        snapshot.len()
    );
    match inner.bundles.write() {
        Ok(mut bundles) => *bundles = snapshot,
        Err(e) => {
            warn!("trust bundle lock poisoned, dropping snapshot: {e}");
            return;
        }
    }
    inner.ready_tx.send_replace(true);
}

/// Sleeps for the given duration unless cancelled first. Returns `false`
/// if the token was cancelled.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = MIN_BACKOFF;
        backoff = next_backoff(backoff);
        assert_eq!(backoff, Duration::from_secs(2));
        backoff = next_backoff(backoff);
        assert_eq!(backoff, Duration::from_secs(4));
        for _ in 0..10 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_sleep_or_cancel_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_or_cancel(&cancel, Duration::from_secs(60)).await);
    }
}
