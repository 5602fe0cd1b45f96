//! Memoised service handles keyed by profile, region and service.

use super::{CallerIdentity, ClientFactory, IdentityApi, LookupApi, ObjectStore, StackApi};
use crate::errors::CloudError;
use crate::retry::{with_retry_if, RetryConfig};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The service a cached handle talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Stack lifecycle.
    Stacks,
    /// Object storage.
    Objects,
    /// Zone/parameter/secret lookups.
    Lookup,
    /// Caller identity.
    Identity,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stacks => write!(f, "stacks"),
            Self::Objects => write!(f, "objects"),
            Self::Lookup => write!(f, "lookup"),
            Self::Identity => write!(f, "identity"),
        }
    }
}

#[derive(Clone)]
enum CachedClient {
    Stacks(Arc<dyn StackApi>),
    Objects(Arc<dyn ObjectStore>),
    Lookup(Arc<dyn LookupApi>),
    Identity(Arc<dyn IdentityApi>),
}

type ClientKey = (String, String, ServiceKind);

/// Thread-safe cache of service handles.
///
/// The whole check-create-insert sequence runs under one async mutex, so
/// concurrent first use of the same key creates exactly one handle.
pub struct ClientCache {
    factory: Arc<dyn ClientFactory>,
    clients: Mutex<HashMap<ClientKey, CachedClient>>,
    identities: DashMap<String, CallerIdentity>,
    retry: RetryConfig,
}

impl fmt::Debug for ClientCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCache")
            .field("identities", &self.identities.len())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ClientCache {
    /// Creates a cache over a factory.
    #[must_use]
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: Mutex::new(HashMap::new()),
            identities: DashMap::new(),
            retry: RetryConfig::client_creation(),
        }
    }

    /// Sets the retry policy for handle creation.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the number of cached handles.
    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Returns true if nothing has been cached yet.
    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    async fn get_or_create<F, Fut>(
        &self,
        key: ClientKey,
        create: F,
    ) -> Result<CachedClient, CloudError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CachedClient, CloudError>>,
    {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let label = format!("{}/{}/{}", key.0, key.1, key.2);
        let client = with_retry_if(&self.retry, &label, create, CloudError::is_retryable)
            .await
            .map_err(|exhausted| exhausted.error)?;

        tracing::debug!(profile = %key.0, region = %key.1, service = %key.2, "Created client");
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Returns the stack API handle for a profile and region.
    pub async fn stacks(&self, profile: &str, region: &str) -> Result<Arc<dyn StackApi>, CloudError> {
        let key = (profile.to_string(), region.to_string(), ServiceKind::Stacks);
        let factory = &self.factory;
        match self
            .get_or_create(key, || async move {
                factory
                    .stack_api(profile, region)
                    .await
                    .map(CachedClient::Stacks)
            })
            .await?
        {
            CachedClient::Stacks(client) => Ok(client),
            _ => Err(mismatch(ServiceKind::Stacks)),
        }
    }

    /// Returns the object store handle for a profile and region.
    pub async fn objects(
        &self,
        profile: &str,
        region: &str,
    ) -> Result<Arc<dyn ObjectStore>, CloudError> {
        let key = (profile.to_string(), region.to_string(), ServiceKind::Objects);
        let factory = &self.factory;
        match self
            .get_or_create(key, || async move {
                factory
                    .object_store(profile, region)
                    .await
                    .map(CachedClient::Objects)
            })
            .await?
        {
            CachedClient::Objects(client) => Ok(client),
            _ => Err(mismatch(ServiceKind::Objects)),
        }
    }

    /// Returns the lookup handle for a profile and region.
    pub async fn lookup(&self, profile: &str, region: &str) -> Result<Arc<dyn LookupApi>, CloudError> {
        let key = (profile.to_string(), region.to_string(), ServiceKind::Lookup);
        let factory = &self.factory;
        match self
            .get_or_create(key, || async move {
                factory
                    .lookup_api(profile, region)
                    .await
                    .map(CachedClient::Lookup)
            })
            .await?
        {
            CachedClient::Lookup(client) => Ok(client),
            _ => Err(mismatch(ServiceKind::Lookup)),
        }
    }

    /// Returns the account and partition for a profile, memoised.
    pub async fn identity(&self, profile: &str) -> Result<CallerIdentity, CloudError> {
        if let Some(identity) = self.identities.get(profile) {
            return Ok(identity.clone());
        }

        let key = (profile.to_string(), String::new(), ServiceKind::Identity);
        let factory = &self.factory;
        let client = match self
            .get_or_create(key, || async move {
                factory.identity_api(profile).await.map(CachedClient::Identity)
            })
            .await?
        {
            CachedClient::Identity(client) => client,
            _ => return Err(mismatch(ServiceKind::Identity)),
        };

        let identity = with_retry_if(
            &self.retry,
            profile,
            || client.caller_identity(),
            CloudError::is_retryable,
        )
        .await
        .map_err(|exhausted| exhausted.error)?;

        self.identities
            .insert(profile.to_string(), identity.clone());
        Ok(identity)
    }
}

fn mismatch(service: ServiceKind) -> CloudError {
    CloudError::service("client-cache", format!("cached handle is not a {service} client"))
}
