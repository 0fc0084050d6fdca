//! # marquee_api
//!
//! HTTP API library for Marquee.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use marquee_core::agent::printer::PrintSink;
use marquee_core::agent::{AgentSupervisor, SupervisorConfig};
use marquee_core::auth::jwt::TokenIssuer;
use marquee_core::auth::resolver::UserResolver;
use marquee_core::bus::NotificationBus;
use marquee_core::store::DynStore;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ApiConfig;
use crate::handlers::{agents, auth, health, notifications, orders, stream};
use crate::services::agent_backend::LocalAgentBackend;
use crate::services::auth::AuthService;
use crate::services::orders::OrderService;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: DynStore,
    pub config: Arc<ApiConfig>,
    pub auth: AuthService,
    pub orders: OrderService,
    pub bus: NotificationBus,
    pub agents: AgentSupervisor,
}

impl AppState {
    /// Wire services, bus and agent supervisor over `store`.
    pub fn new(store: DynStore, config: ApiConfig, printer: Arc<dyn PrintSink>) -> Self {
        Self::with_supervisor_config(store, config, printer, SupervisorConfig::default())
    }

    pub fn with_supervisor_config(
        store: DynStore,
        config: ApiConfig,
        printer: Arc<dyn PrintSink>,
        supervisor: SupervisorConfig,
    ) -> Self {
        let tokens = TokenIssuer::new(&config.jwt_secret, &config.jwt_refresh_secret, config.ttls);
        let auth = AuthService::new(
            store.clone(),
            tokens,
            UserResolver::standard(),
            config.db_ready_timeout,
            config.session_fail_closed,
        );
        let bus = NotificationBus::new();
        let orders = OrderService::new(store.clone(), bus.clone());
        let backend = LocalAgentBackend::new(auth.clone(), orders.clone(), bus.clone());
        let agents = AgentSupervisor::new(Arc::new(backend), printer, supervisor);
        Self {
            store,
            config: Arc::new(config),
            auth,
            orders,
            bus,
            agents,
        }
    }
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes (no auth required)
    let public = Router::new()
        .route("/health", get(health::health_handler))
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/validate-pin", post(auth::validate_pin_handler))
        .route("/auth/refresh", post(auth::refresh_handler))
        .route("/auth/logout", post(auth::logout_handler))
        .route("/auth/agent-token", post(auth::agent_token_handler));

    // Protected routes (require auth)
    let protected = Router::new()
        .route("/auth/check-session", get(auth::check_session_handler))
        .route("/auth/validate", get(auth::validate_handler))
        .route(
            "/orders",
            get(orders::list_orders_handler).post(orders::submit_order_handler),
        )
        .route("/orders/unprinted", get(orders::unprinted_orders_handler))
        .route("/orders/{order_id}/printed", post(orders::mark_printed_handler))
        .route("/stream", get(stream::stream_handler))
        .route("/agents/start", post(agents::start_agent_handler))
        .route("/agents/stop", post(agents::stop_agent_handler))
        .route("/agents/{tenant_id}", get(agents::agent_status_handler))
        .route(
            "/notifications/broadcast",
            post(notifications::broadcast_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(cors)
        .with_state(state)
}

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
