// Session module - one authenticated XenAPI session per host
//
// Sessions are created lazily on first use and cached for the lifetime of
// the process. The map is the only state shared between concurrently
// running collectors, so every mutation goes through one mutex.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::xenapi::{Connector, XenApiError, XenClient};

/// An authenticated handle to one host's management API
pub struct Session {
    host: HostConfig,
    client: XenClient,
}

impl Session {
    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    pub fn client(&self) -> &XenClient {
        &self.client
    }
}

/// Cache of live sessions keyed by host address
///
/// # Invariants
/// - At most one session per host address is ever cached.
/// - A failed login leaves no entry behind, so the next lookup starts over.
pub struct SessionCache {
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    revalidate: bool,
}

impl SessionCache {
    /// Creates an empty cache
    ///
    /// # Arguments
    /// * `connector` - Builds the transport for a host on first use
    /// * `revalidate` - Probe cached sessions before handing them out
    pub fn new(connector: Arc<dyn Connector>, revalidate: bool) -> Self {
        SessionCache {
            connector,
            sessions: Mutex::new(HashMap::new()),
            revalidate,
        }
    }

    /// Returns the cached session for `host`, logging in if there is none
    ///
    /// Two callers racing on an uncached host may both log in. The first to
    /// insert wins; the loser's session is logged out and both callers get
    /// the winner.
    pub async fn get(&self, host: &HostConfig) -> Result<Arc<Session>, XenApiError> {
        let cached = self.sessions.lock().await.get(host.host()).cloned();

        if let Some(session) = cached {
            if !self.revalidate {
                return Ok(session);
            }
            match session.client.ping().await {
                Ok(()) => return Ok(session),
                Err(e) => {
                    warn!("Cached session for {} failed revalidation: {}", host.host(), e);
                    self.evict(&session).await;
                }
            }
        }

        let fresh = Arc::new(self.login(host).await?);

        let winner = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(host.host()) {
                Some(existing) => Some(existing.clone()),
                None => {
                    sessions.insert(host.host().to_string(), fresh.clone());
                    None
                }
            }
        };

        match winner {
            Some(existing) => {
                debug!("Discarding duplicate session for {}", host.host());
                if let Err(e) = fresh.client.logout().await {
                    warn!("Failed to close duplicate session for {}: {}", host.host(), e);
                }
                Ok(existing)
            }
            None => Ok(fresh),
        }
    }

    /// Drops `session` from the cache if it is still the cached one
    ///
    /// Comparing by identity keeps a stale caller from evicting a session
    /// another task has already replaced.
    pub async fn evict(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        let key = session.host().host();
        if sessions
            .get(key)
            .is_some_and(|cached| Arc::ptr_eq(cached, session))
        {
            sessions.remove(key);
            warn!("Evicted session for {}", key);
        }
    }

    /// Number of cached sessions
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn login(&self, host: &HostConfig) -> Result<Session, XenApiError> {
        let transport = self.connector.connect(host)?;
        let session_ref = transport.login(host.username(), host.password()).await?;

        info!("Logged in to {} as '{}'", host.host(), host.username());

        Ok(Session {
            host: host.clone(),
            client: XenClient::new(transport, session_ref),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xenapi::fake::{FakeConnector, FakeXen};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn host(addr: &str) -> HostConfig {
        HostConfig::new(addr, "root", "secret")
    }

    #[tokio::test]
    async fn test_get_reuses_cached_session() {
        let xen = FakeXen::new();
        let connector = Arc::new(FakeConnector::new().with_host("h1", xen.clone()));
        let cache = SessionCache::new(connector.clone(), false);

        let first = cache.get(&host("h1")).await.unwrap();
        let second = cache.get(&host("h1")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(xen.logins.load(Ordering::SeqCst), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_one_session_per_host() {
        let a = FakeXen::new();
        let b = FakeXen::new();
        let connector = Arc::new(
            FakeConnector::new()
                .with_host("a", a.clone())
                .with_host("b", b.clone()),
        );
        let cache = SessionCache::new(connector, false);

        let sa = cache.get(&host("a")).await.unwrap();
        let sb = cache.get(&host("b")).await.unwrap();

        assert!(!Arc::ptr_eq(&sa, &sb));
        assert_eq!(sa.host().host(), "a");
        assert_eq!(sb.host().host(), "b");
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_login_failure_leaves_no_entry() {
        let xen = FakeXen::new();
        xen.fail_login(Some("SESSION_AUTHENTICATION_FAILED"));
        let connector = Arc::new(FakeConnector::new().with_host("h1", xen.clone()));
        let cache = SessionCache::new(connector, false);

        let err = cache.get(&host("h1")).await.err().unwrap();
        assert!(err.to_string().contains("SESSION_AUTHENTICATION_FAILED"));
        assert_eq!(cache.len().await, 0);

        // The next lookup starts from scratch and succeeds.
        xen.fail_login(None);
        assert!(cache.get(&host("h1")).await.is_ok());
        assert_eq!(xen.logins.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let cache = SessionCache::new(Arc::new(FakeConnector::new()), false);
        let err = cache.get(&host("unknown")).await.err().unwrap();
        assert!(matches!(err, XenApiError::Connect { .. }));
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_keeps_single_session() {
        let xen = FakeXen::new();
        let connector = Arc::new(FakeConnector::new().with_host("h1", xen.clone()));
        let cache = SessionCache::new(connector, false);
        let h1 = host("h1");

        let (left, right) = tokio::join!(cache.get(&h1), cache.get(&h1));
        let (left, right) = (left.unwrap(), right.unwrap());

        assert!(Arc::ptr_eq(&left, &right));
        assert_eq!(cache.len().await, 1);

        // Every extra login was closed again.
        let logins = xen.logins.load(Ordering::SeqCst);
        let logouts = xen.logouts.load(Ordering::SeqCst);
        assert_eq!(logins - logouts, 1);
    }

    #[tokio::test]
    async fn test_revalidate_replaces_dead_session() {
        let xen = FakeXen::new();
        let connector = Arc::new(FakeConnector::new().with_host("h1", xen.clone()));
        let cache = SessionCache::new(connector, true);

        xen.respond("session.get_this_host", "OpaqueRef:session-1", json!("OpaqueRef:host"));
        let first = cache.get(&host("h1")).await.unwrap();
        let again = cache.get(&host("h1")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(xen.logins.load(Ordering::SeqCst), 1);

        xen.fault("session.get_this_host", "OpaqueRef:session-1", "SESSION_INVALID");
        let replaced = cache.get(&host("h1")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &replaced));
        assert_eq!(replaced.client().session_ref(), "OpaqueRef:session-2");
        assert_eq!(xen.logins.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_evict_ignores_replaced_session() {
        let xen = FakeXen::new();
        let connector = Arc::new(FakeConnector::new().with_host("h1", xen.clone()));
        let cache = SessionCache::new(connector, false);

        let old = cache.get(&host("h1")).await.unwrap();
        cache.evict(&old).await;
        assert_eq!(cache.len().await, 0);

        let new = cache.get(&host("h1")).await.unwrap();
        cache.evict(&old).await;
        assert_eq!(cache.len().await, 1);
        assert!(Arc::ptr_eq(&new, &cache.get(&host("h1")).await.unwrap()));
    }
}
