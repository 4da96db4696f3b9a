//! JSON REST API for the volume control plane.
//!
//! Routes:
//!
//! - `GET /v0/nodes`: list storage nodes and their reachability
//! - `POST /v0/nodes/{node}/heartbeat`: record a node heartbeat
//! - `PUT /v0/nodes/{node}/liveness`: take a node down or bring it back
//! - `PUT /v0/nodes/{node}/pools/{pool}`: create a pool on a node
//! - `GET /v0/volumes`: list volumes
//! - `PUT /v0/volumes/{id}`: create a volume
//! - `GET /v0/volumes/{id}`: fetch a volume
//! - `DELETE /v0/volumes/{id}`: delete a volume (`204`, or `404` if absent)
//! - `PUT /v0/volumes/{id}/target`: publish a volume
//! - `DELETE /v0/volumes/{id}/target`: unpublish a volume
//! - `GET /v0/cleanups`: list the pending-cleanup ledger

mod error;
mod handlers;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use reef_agent::MemoryAgent;
use reef_reconcile::VolumeService;
use reef_types::NodeId;

pub use error::ApiError;

/// Shared application state for all handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    /// The volume service.
    pub service: Arc<VolumeService>,
    /// In-process agents, by node, for liveness control.
    pub fleet: Arc<BTreeMap<NodeId, Arc<MemoryAgent>>>,
}

/// HTTP server exposing a [`VolumeService`].
pub struct ApiServer {
    router: Router,
}

impl ApiServer {
    /// Create a server over `service`. `fleet` holds the in-process agents
    /// the liveness route may switch on and off.
    pub fn new(service: Arc<VolumeService>, fleet: BTreeMap<NodeId, Arc<MemoryAgent>>) -> Self {
        let state = AppState {
            service,
            fleet: Arc::new(fleet),
        };
        Self {
            router: Self::build_router(state),
        }
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/v0/nodes", get(handlers::list_nodes))
            .route("/v0/nodes/{node}/heartbeat", post(handlers::heartbeat))
            .route("/v0/nodes/{node}/liveness", put(handlers::set_liveness))
            .route("/v0/nodes/{node}/pools/{pool}", put(handlers::put_pool))
            .route("/v0/volumes", get(handlers::list_volumes))
            .route(
                "/v0/volumes/{id}",
                put(handlers::put_volume)
                    .get(handlers::get_volume)
                    .delete(handlers::delete_volume),
            )
            .route(
                "/v0/volumes/{id}/target",
                put(handlers::put_target).delete(handlers::delete_target),
            )
            .route("/v0/cleanups", get(handlers::list_cleanups))
            .with_state(state)
    }

    /// Return the inner [`Router`] (useful for testing with `tower::ServiceExt`).
    #[cfg(test)]
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve the API with graceful shutdown triggered by the given future.
    ///
    /// When `shutdown` completes, the server stops accepting new connections
    /// and waits for in-flight requests to finish.
    pub async fn serve_with_shutdown(
        self,
        addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "API server listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
