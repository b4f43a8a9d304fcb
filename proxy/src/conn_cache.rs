//! Cache of outbound mTLS connections keyed by caller selector set.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use authority_api::selectors_key;
use bytes::Bytes;
use log::{debug, info};
use time::OffsetDateTime;
use tokio::time::Instant;
use tonic::transport::Uri;

use crate::attestor::WorkloadAttestor;
use crate::bundle_cache::TrustBundleCache;
use crate::error::ProxyError;
use crate::identity::WorkloadIdentity;
use crate::identity_cache::WorkloadIdentityCache;
use crate::mtls;
use crate::trust_domain::TrustDomain;

/// A multiplexed channel to the backend.
pub type BackendChannel = tonic_rustls::channel::Channel;

/// Everything a dialer needs to build one outbound connection.
#[derive(Debug)]
pub struct DialRequest {
    /// Identity presented to the backend.
    pub identity: Arc<WorkloadIdentity>,
    /// Concatenated DER CA bundle used to verify the backend.
    pub bundle: Bytes,
    /// Trust domain the backend must belong to.
    pub trust_domain: TrustDomain,
    /// Backend address to dial.
    pub backend: Uri,
}

type DialFuture = Pin<Box<dyn Future<Output = Result<BackendChannel, ProxyError>> + Send>>;

/// Builds an outbound connection from a dial request. The production
/// dialer performs the mTLS handshake; alternatives exist for tests and
/// custom transports.
pub type Dialer = Arc<dyn Fn(DialRequest) -> DialFuture + Send + Sync + 'static>;

/// A connection expires a safety margin before its client certificate
/// does, so in-flight requests are not cut off by the backend rejecting
/// an expired certificate mid-handshake.
const CONN_EXPIRY_MARGIN: time::Duration = time::Duration::minutes(1);

struct CachedConn {
    channel: Mutex<Option<BackendChannel>>,
    expires_at: OffsetDateTime,
}

impl CachedConn {
    fn new(channel: BackendChannel, expires_at: OffsetDateTime) -> Self {
        CachedConn {
            channel: Mutex::new(Some(channel)),
            expires_at,
        }
    }

    fn channel(&self) -> Option<BackendChannel> {
        match self.channel.lock() {
            Ok(guard) => guard.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    fn close(&self) {
        let mut guard = match self.channel.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };
        *guard = None;
    }

    fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// Resolves caller processes to live backend connections.
///
/// Every call re-attests the caller, because process ids are recycled by
/// the operating system. The connection table maps canonical selector
/// keys to cached channels; misses and expired entries trigger a dial
/// that concurrent callers for the same key wait on instead of dialing
/// in parallel. [`ConnCache::close`] drops every cached connection but
/// leaves the cache usable, so the next call simply dials again.
pub struct ConnCache {
    attestor: Arc<dyn WorkloadAttestor>,
    identities: Arc<WorkloadIdentityCache>,
    bundles: Arc<TrustBundleCache>,
    trust_domain: TrustDomain,
    backend: Uri,
    request_timeout: Duration,
    dialer: Dialer,
    conns: RwLock<HashMap<String, Arc<CachedConn>>>,
    dial_flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnCache {
    /// Creates a cache that dials the backend over mutual TLS.
    #[must_use]
    pub fn new(
        attestor: Arc<dyn WorkloadAttestor>,
        identities: Arc<WorkloadIdentityCache>,
        bundles: Arc<TrustBundleCache>,
        trust_domain: TrustDomain,
        backend: Uri,
        request_timeout: Duration,
    ) -> Self {
        let dialer: Dialer = Arc::new(|request: DialRequest| {
            Box::pin(async move {
                let config =
                    mtls::client_config(&request.identity, &request.bundle, &request.trust_domain)?;
                mtls::dial_backend(&request.backend, config).await
            })
        });
        Self::with_dialer(
            attestor,
            identities,
            bundles,
            trust_domain,
            backend,
            request_timeout,
            dialer,
        )
    }

    /// Creates a cache with a custom dialer.
    #[must_use]
    pub fn with_dialer(
        attestor: Arc<dyn WorkloadAttestor>,
        identities: Arc<WorkloadIdentityCache>,
        bundles: Arc<TrustBundleCache>,
        trust_domain: TrustDomain,
        backend: Uri,
        request_timeout: Duration,
        dialer: Dialer,
    ) -> Self {
        ConnCache {
            attestor,
            identities,
            bundles,
            trust_domain,
            backend,
            request_timeout,
            dialer,
            conns: RwLock::new(HashMap::new()),
            dial_flights: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a live backend channel for the caller process, attesting
    /// it, resolving its identity and dialing if no fresh cached
    /// connection exists.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if attestation, identity resolution, the
    /// trust bundle wait or the dial fails within the request timeout.
    pub async fn get(&self, peer_pid: Option<i32>) -> Result<BackendChannel, ProxyError> {
        let deadline = Instant::now() + self.request_timeout;

        let pid = peer_pid.ok_or_else(|| {
            ProxyError::Internal("caller process identity missing from connection".to_string())
        })?;

        let selectors = self.attestor.attest(pid).await?;
        let key = selectors_key(&selectors);

        let identity = self.identities.x509_identity(&selectors, deadline).await?;
        debug!("caller {} resolved for selectors [{key}]", identity.uri());

        if let Some(channel) = self.lookup_fresh_conn(&key, OffsetDateTime::now_utc())? {
            return Ok(channel);
        }

        let flight = self.dial_flight(&key)?;
        let _guard = tokio::time::timeout_at(deadline, flight.lock())
            .await
            .map_err(|_elapsed| ProxyError::Dial {
                backend: self.backend.to_string(),
                reason: "timed out waiting for an in-flight dial".to_string(),
            })?;

        // Another caller may have finished dialing while this one waited
        // on the flight lock.
        let now = OffsetDateTime::now_utc();
        if let Some(channel) = self.lookup_fresh_conn(&key, now)? {
            return Ok(channel);
        }
        self.evict_expired(&key, now)?;

        let bundle = self.bundles.x509_bundle(&self.trust_domain, deadline).await?;

        info!("dialing backend {} for selectors [{key}]", self.backend);
        let channel = (self.dialer)(DialRequest {
            identity: Arc::clone(&identity),
            bundle,
            trust_domain: self.trust_domain.clone(),
            backend: self.backend.clone(),
        })
        .await?;

        let expires_at = identity.not_after() - CONN_EXPIRY_MARGIN;
        let mut conns = self.conns.write().map_err(ProxyError::from_lock_err)?;
        conns.insert(
            key,
            Arc::new(CachedConn::new(channel.clone(), expires_at)),
        );
        Ok(channel)
    }

    /// Drops every cached connection. The cache stays usable; later
    /// calls dial fresh connections.
    pub fn close(&self) -> Result<(), ProxyError> {
        let drained: Vec<Arc<CachedConn>> = {
            let mut conns = self.conns.write().map_err(ProxyError::from_lock_err)?;
            conns.drain().map(|(_, conn)| conn).collect()
        };
        info!("closing {} cached backend connection(s)", drained.len());
        for conn in drained {
            conn.close();
        }
        Ok(())
    }

    fn lookup_fresh_conn(
        &self,
        key: &str,
        now: OffsetDateTime,
    ) -> Result<Option<BackendChannel>, ProxyError> {
        let conns = self.conns.read().map_err(ProxyError::from_lock_err)?;
        match conns.get(key) {
            Some(conn) if !conn.is_expired_at(now) => Ok(conn.channel()),
            _ => Ok(None),
        }
    }

    /// Removes an expired entry for the key and closes it outside the
    /// table lock.
    fn evict_expired(&self, key: &str, now: OffsetDateTime) -> Result<(), ProxyError> {
        let expired = {
            let mut conns = self.conns.write().map_err(ProxyError::from_lock_err)?;
            match conns.get(key) {
                Some(conn) if conn.is_expired_at(now) => {
                    debug!("evicting expired backend connection for selectors [{key}]");
                    conns.remove(key)
                }
                _ => None,
            }
        };
        if let Some(conn) = expired {
            conn.close();
        }
        Ok(())
    }

    fn dial_flight(&self, key: &str) -> Result<Arc<tokio::sync::Mutex<()>>, ProxyError> {
        let mut flights = self
            .dial_flights
            .lock()
            .map_err(ProxyError::from_lock_err)?;
        Ok(Arc::clone(
            flights
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        ))
    }
}

impl fmt::Debug for ConnCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnCache")
            .field("trust_domain", &self.trust_domain)
            .field("backend", &self.backend)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
