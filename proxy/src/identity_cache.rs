//! Read-through cache of workload identities keyed by selector set.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use authority_api::selectors::Selector;
use authority_api::{selectors_key, DelegatedAuthorityClient};
use log::{debug, info, warn};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::identity::WorkloadIdentity;

/// Caches identity documents per canonical selector key, fetching misses
/// through the authority's identity subscription.
///
/// At most one subscription is open per selector key. Concurrent first
/// requests for the same key share a single subscription and all wait on
/// its first message. Once a subscription is open it keeps feeding the
/// cache, so rotated certificates replace cached ones without another
/// round trip. Expired entries are evicted on lookup.
pub struct WorkloadIdentityCache {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

struct Inner {
    client: DelegatedAuthorityClient,
    identities: RwLock<HashMap<String, Vec<Arc<WorkloadIdentity>>>>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<FetchOutcome>>>>,
    streams: Mutex<HashMap<String, CancellationToken>>,
}

/// Resolution of a fetch: what the subscription's first message (or its
/// failure) meant for the waiting callers.
#[derive(Debug, Clone)]
enum FetchOutcome {
    Delivered,
    Empty,
    Malformed(String),
    Failed(String),
}

impl WorkloadIdentityCache {
    /// Creates an empty cache backed by the given authority client.
    #[must_use]
    pub fn new(client: DelegatedAuthorityClient) -> Self {
        WorkloadIdentityCache {
            inner: Arc::new(Inner {
                client,
                identities: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns a non-expired identity for the selector set, fetching from
    /// the authority on a miss and waiting until the given deadline for
    /// the first identity to arrive.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::IdentityTimeout`] if no identity arrives
    /// before the deadline, [`ProxyError::IdentityUnavailable`] if the
    /// authority has none registered for the selectors, and
    /// [`ProxyError::IdentityFetch`] if the subscription fails.
    pub async fn x509_identity(
        &self,
        selectors: &[Selector],
        deadline: Instant,
    ) -> Result<Arc<WorkloadIdentity>, ProxyError> {
        let key = selectors_key(selectors);

        if let Some(identity) = self.lookup_fresh(&key, OffsetDateTime::now_utc())? {
            return Ok(identity);
        }

        debug!("identity cache miss for selectors [{key}]");
        let mut rx = self.join_or_spawn_fetch(&key, selectors.to_vec())?;

        let outcome = match tokio::time::timeout_at(deadline, rx.wait_for(Option::is_some)).await {
            Ok(Ok(resolved)) => resolved.clone().ok_or_else(|| {
                ProxyError::Internal("identity fetch resolved without an outcome".to_string())
            })?,
            Ok(Err(_closed)) => {
                return Err(ProxyError::IdentityFetch {
                    key,
                    reason: "identity subscription task ended unexpectedly".to_string(),
                })
            }
            Err(_elapsed) => return Err(ProxyError::IdentityTimeout { key }),
        };

        match outcome {
            FetchOutcome::Delivered => self
                .lookup_fresh(&key, OffsetDateTime::now_utc())?
                .ok_or_else(|| {
                    ProxyError::Internal(format!(
                        "identity for selectors [{key}] was delivered but is not cached"
                    ))
                }),
            FetchOutcome::Empty => Err(ProxyError::IdentityUnavailable { key }),
            FetchOutcome::Malformed(reason) => Err(ProxyError::Internal(format!(
                "malformed identity for selectors [{key}]: {reason}"
            ))),
            FetchOutcome::Failed(reason) => Err(ProxyError::IdentityFetch { key, reason }),
        }
    }

    /// Cancels all identity subscriptions.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(&self, key: &str, document: authority_api::X509Identity) {
        let identity = WorkloadIdentity::from_authority(document).unwrap();
        let mut identities = self.inner.identities.write().unwrap();
        identities.insert(key.to_string(), vec![Arc::new(identity)]);
    }

    /// Returns the cached identity for the key if one exists and has not
    /// expired. An expired entry is evicted so the caller falls through
    /// to a fetch.
    fn lookup_fresh(
        &self,
        key: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Arc<WorkloadIdentity>>, ProxyError> {
        {
            let identities = self
                .inner
                .identities
                .read()
                .map_err(ProxyError::from_lock_err)?;
            match identities.get(key).and_then(|docs| docs.first()) {
                Some(identity) if !identity.is_expired_at(now) => {
                    return Ok(Some(Arc::clone(identity)))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let mut identities = self
            .inner
            .identities
            .write()
            .map_err(ProxyError::from_lock_err)?;
        if let Some(first) = identities.get(key).and_then(|docs| docs.first()) {
            // Re-check under the write lock: the entry may have been
            // replaced by a rotated identity in the meantime.
            if !first.is_expired_at(now) {
                return Ok(Some(Arc::clone(first)));
            }
            debug!("evicting expired identity for selectors [{key}]");
            identities.remove(key);
        }
        Ok(None)
    }

    /// Joins the in-flight fetch for the key, or spawns one if none is
    /// running. The returned receiver resolves with the fetch outcome.
    fn join_or_spawn_fetch(
        &self,
        key: &str,
        selectors: Vec<Selector>,
    ) -> Result<watch::Receiver<Option<FetchOutcome>>, ProxyError> {
        let (tx, rx) = {
            let mut inflight = self
                .inner
                .inflight
                .lock()
                .map_err(ProxyError::from_lock_err)?;
            if let Some(rx) = inflight.get(key) {
                return Ok(rx.clone());
            }
            let (tx, rx) = watch::channel(None);
            inflight.insert(key.to_string(), rx.clone());
            (tx, rx)
        };

        let token = self.cancel.child_token();
        {
            let mut streams = match self.inner.streams.lock() {
                Ok(streams) => streams,
                Err(e) => {
                    clear_inflight(&self.inner, key);
                    return Err(ProxyError::from_lock_err(e));
                }
            };
            if let Some(old) = streams.insert(key.to_string(), token.clone()) {
                old.cancel();
            }
        }

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            subscribe_and_feed(inner, key, selectors, tx, token).await;
        });
        Ok(rx)
    }
}

impl fmt::Debug for WorkloadIdentityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadIdentityCache").finish_non_exhaustive()
    }
}

/// Opens the identity subscription for one selector key and feeds every
/// message into the cache. The first message (or failure) resolves the
/// waiting callers through the watch channel; later messages replace the
/// cached documents as the authority rotates certificates.
async fn subscribe_and_feed(
    inner: Arc<Inner>,
    key: String,
    selectors: Vec<Selector>,
    tx: watch::Sender<Option<FetchOutcome>>,
    cancel: CancellationToken,
) {
    let stream = tokio::select! {
        () = cancel.cancelled() => {
            clear_inflight(&inner, &key);
            return;
        }
        result = inner.client.stream_x509_identities(selectors) => result,
    };

    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            warn!("failed to open identity subscription for selectors [{key}]: {e}");
            clear_inflight(&inner, &key);
            tx.send_replace(Some(FetchOutcome::Failed(e.to_string())));
            return;
        }
    };

    let mut first = true;
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                if first {
                    clear_inflight(&inner, &key);
                }
                return;
            }
            message = stream.next() => match message {
                Some(Ok(documents)) => {
                    let outcome = store_documents(&inner, &key, documents);
                    if first {
                        first = false;
                        clear_inflight(&inner, &key);
                    }
                    tx.send_replace(Some(outcome));
                }
                Some(Err(e)) => {
                    warn!("identity subscription for selectors [{key}] failed: {e}");
                    if first {
                        clear_inflight(&inner, &key);
                        tx.send_replace(Some(FetchOutcome::Failed(e.to_string())));
                    }
                    return;
                }
                None => {
                    warn!("identity subscription for selectors [{key}] closed by the authority");
                    if first {
                        clear_inflight(&inner, &key);
                        tx.send_replace(Some(FetchOutcome::Failed(
                            "subscription closed before delivering an identity".to_string(),
                        )));
                    }
                    return;
                }
            },
        }
    }
}

/// Parses one identity message and replaces the cache entry for the key.
/// An empty list is stored too, recording that the authority currently
/// has nothing registered for the selectors.
fn store_documents(
    inner: &Inner,
    key: &str,
    documents: Vec<authority_api::X509Identity>,
) -> FetchOutcome {
    let mut parsed = Vec::with_capacity(documents.len());
    for document in documents {
        match WorkloadIdentity::from_authority(document) {
            Ok(identity) => parsed.push(Arc::new(identity)),
            Err(e) => return FetchOutcome::Malformed(e.to_string()),
        }
    }

    let outcome = if parsed.is_empty() {
        FetchOutcome::Empty
    } else {
        FetchOutcome::Delivered
    };
    info!(
        "received {} identity document(s) for selectors [{key}]",
        parsed.len()
    );

    match inner.identities.write() {
        Ok(mut identities) => {
            identities.insert(key.to_string(), parsed);
        }
        Err(e) => {
            warn!("identity cache lock poisoned, dropping update: {e}");
            return FetchOutcome::Failed(format!("lock poisoned: {e}"));
        }
    }
    outcome
}

fn clear_inflight(inner: &Inner, key: &str) {
    let mut inflight = match inner.inflight.lock() {
        Ok(guard) => guard,
        Err(e) => e.into_inner(),
    };
    inflight.remove(key);
}
