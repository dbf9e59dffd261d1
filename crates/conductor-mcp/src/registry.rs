//! Session registry
//!
//! A coalescing cache in front of the negotiator and the catalog builder,
//! holding no business logic of its own. It is an injected, explicitly
//! owned instance; per-endpoint `OnceCell` entries guarantee that N
//! concurrent first-uses of an endpoint collapse into one `initialize`.

use conductor_core::{ConductorError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::catalog::{discover, ToolDescriptor};
use crate::endpoint::Endpoint;
use crate::session::{negotiate, SessionContext};
use crate::transport::RpcTransport;

type SessionCell = Arc<OnceCell<Arc<SessionContext>>>;
type CatalogCell = Arc<OnceCell<Arc<Vec<ToolDescriptor>>>>;

pub struct SessionRegistry {
    transport: Arc<dyn RpcTransport>,
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    sessions: Mutex<HashMap<String, SessionCell>>,
    catalogs: Mutex<HashMap<String, CatalogCell>>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            transport,
            endpoints: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            catalogs: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &dyn RpcTransport {
        self.transport.as_ref()
    }

    /// Register an endpoint. Replacing an existing registration discards
    /// its session and catalog.
    pub async fn register(&self, endpoint: Endpoint) {
        let id = endpoint.id.clone();
        let previous = self
            .endpoints
            .write()
            .await
            .insert(id.clone(), Arc::new(endpoint));
        if previous.is_some() {
            warn!("endpoint '{}' re-registered, discarding cached state", id);
            self.sessions.lock().await.remove(&id);
            self.catalogs.lock().await.remove(&id);
        } else {
            info!("registered endpoint '{}'", id);
        }
    }

    pub async fn remove(&self, id: &str) {
        self.endpoints.write().await.remove(id);
        self.sessions.lock().await.remove(id);
        self.catalogs.lock().await.remove(id);
        info!("removed endpoint '{}'", id);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<Endpoint>> {
        let mut endpoints: Vec<Arc<Endpoint>> =
            self.endpoints.read().await.values().cloned().collect();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        endpoints
    }

    /// Return the endpoint's session, negotiating on first use. Concurrent
    /// callers for the same endpoint share one in-flight negotiation; a
    /// failed negotiation leaves the slot empty so the next use retries.
    pub async fn get_or_negotiate(&self, id: &str) -> Result<Arc<SessionContext>> {
        let endpoint = self
            .get(id)
            .await
            .ok_or_else(|| ConductorError::Config(format!("unknown endpoint '{id}'")))?;

        let cell = {
            let mut sessions = self.sessions.lock().await;
            sessions.entry(id.to_string()).or_default().clone()
        };

        let session = cell
            .get_or_try_init(|| async {
                let context = negotiate(self.transport.as_ref(), &endpoint).await?;
                Ok::<_, ConductorError>(Arc::new(context))
            })
            .await?;
        Ok(session.clone())
    }

    /// Return the endpoint's cached catalog, discovering (and negotiating)
    /// lazily on first use. Catalogs live until an explicit clear or the
    /// endpoint's removal.
    pub async fn catalog(&self, id: &str) -> Result<Arc<Vec<ToolDescriptor>>> {
        let endpoint = self
            .get(id)
            .await
            .ok_or_else(|| ConductorError::Config(format!("unknown endpoint '{id}'")))?;

        let cell = {
            let mut catalogs = self.catalogs.lock().await;
            catalogs.entry(id.to_string()).or_default().clone()
        };

        let catalog = cell
            .get_or_try_init(|| async {
                let session = self.get_or_negotiate(id).await?;
                let tools = discover(self.transport.as_ref(), &endpoint, &session).await;
                Ok::<_, ConductorError>(Arc::new(tools))
            })
            .await?;
        Ok(catalog.clone())
    }

    /// Discard a cached session after an auth/session-expired error; the
    /// next use of the endpoint renegotiates.
    pub async fn invalidate_session(&self, id: &str) {
        if self.sessions.lock().await.remove(id).is_some() {
            info!("invalidated session for endpoint '{}'", id);
        } else {
            debug!("no session to invalidate for endpoint '{}'", id);
        }
    }

    /// Drop every cached catalog, forcing re-discovery. Exposed to the
    /// surrounding application; discovery is never refreshed automatically.
    pub async fn clear_catalogs(&self) {
        self.catalogs.lock().await.clear();
        info!("cleared all cached tool catalogs");
    }
}
