//! Shared HTTP route table for inputs
//!
//! Inputs implementing [`HttpRegistrable`](crate::input::HttpRegistrable)
//! register their routes here when they are added. The routes become
//! visible to the agent's HTTP server when the table is reloaded, which
//! the reconciler does at the end of every pass.
//!
//! Routes registered inside [`HttpRegistry::register_as`] are tagged with a
//! [`RouteOwner`] so they can be released when their instance goes away.

use crate::reconcile::ReloadHook;
use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use axum::routing::MethodRouter;
use axum::Router;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// Identity of the instance that registered a set of routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteOwner(u64);

struct Registered {
    handler: MethodRouter,
    owner: Option<RouteOwner>,
}

/// Route table shared between inputs and the HTTP server
#[derive(Default)]
pub struct HttpRegistry {
    routes: RwLock<BTreeMap<String, Registered>>,
    served: RwLock<Router>,
    next_owner: AtomicU64,
    registering: Mutex<Option<RouteOwner>>,
}

/// Clears the registering owner, also when the registration panics
struct OwnerGuard<'a>(&'a Mutex<Option<RouteOwner>>);

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl HttpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an owner tag for [`register_as`](Self::register_as)
    pub fn new_owner(&self) -> RouteOwner {
        RouteOwner(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Run `register` with every route it adds tagged by `owner`
    pub fn register_as<R>(&self, owner: RouteOwner, register: impl FnOnce(&HttpRegistry) -> R) -> R {
        *self.registering.lock().unwrap_or_else(PoisonError::into_inner) = Some(owner);
        let _guard = OwnerGuard(&self.registering);
        register(self)
    }

    /// Remove every route still held by `owner`. Returns how many were removed.
    pub fn release(&self, owner: RouteOwner) -> usize {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let before = routes.len();
        routes.retain(|_, registered| registered.owner != Some(owner));
        let released = before - routes.len();
        if released > 0 {
            debug!(released = released, "Released input routes");
        }
        released
    }

    /// Register a handler, replacing any earlier handler for the same path
    pub fn route(&self, path: &str, handler: MethodRouter) {
        if !path.starts_with('/') {
            warn!(path = %path, "Ignoring input route without leading slash");
            return;
        }

        let owner = *self.registering.lock().unwrap_or_else(PoisonError::into_inner);
        let replaced = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), Registered { handler, owner })
            .is_some();
        debug!(path = %path, replaced = replaced, "Registered input route");
    }

    pub fn remove(&self, path: &str) -> bool {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
    }

    /// Registered paths, sorted
    pub fn paths(&self) -> Vec<String> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Rebuild the served router from the registered routes.
    /// Returns the number of routes now being served.
    pub fn rebuild(&self) -> usize {
        let (router, count) = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            let router = routes
                .iter()
                .fold(Router::new(), |router, (path, registered)| {
                    router.route(path, registered.handler.clone())
                });
            (router, routes.len())
        };

        *self.served.write().unwrap_or_else(PoisonError::into_inner) = router;
        count
    }

    /// Router currently being served
    pub fn router(&self) -> Router {
        self.served
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Route a request through the served router
    pub async fn dispatch(&self, request: Request) -> Response {
        match self.router().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

#[async_trait]
impl ReloadHook for HttpRegistry {
    fn name(&self) -> &str {
        "http"
    }

    async fn reload(&self) -> anyhow::Result<()> {
        let count = self.rebuild();
        info!(routes = count, "Reloaded input HTTP routes");
        Ok(())
    }
}
