pub mod api;

use crate::application::engine::LedgerEngine;
use crate::application::identity::Authorizer;
use crate::domain::ports::EventSink;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lets trusted producers push raw envelopes onto the ingress bus over HTTP.
#[derive(Clone)]
pub struct Ingress {
    pub sink: Arc<dyn EventSink>,
    pub token: String,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LedgerEngine>,
    pub authorizer: Arc<Authorizer>,
    pub ingress: Option<Ingress>,
}

impl AppState {
    pub fn new(engine: Arc<LedgerEngine>, authorizer: Arc<Authorizer>) -> Self {
        Self {
            engine,
            authorizer,
            ingress: None,
        }
    }

    pub fn with_ingress(mut self, sink: Arc<dyn EventSink>, token: impl Into<String>) -> Self {
        self.ingress = Some(Ingress {
            sink,
            token: token.into(),
        });
        self
    }
}

pub fn app(state: AppState) -> Router {
    api::router().with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
