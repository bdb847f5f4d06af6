//! HTTP surface of the login flow.
//!
//! - `POST /{prefix}/login` - Redirects to the provider
//! - `GET /{prefix}/login` - Provider return URL
//! - `GET /{prefix}/login/check?idx=N` - Resumes the login after role selection
//! - `GET /health` - Liveness

pub mod health;
pub mod login;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::{config::AppConfig, service::LoginService};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub login: Arc<LoginService>,
}

impl AppState {
    pub fn new(config: AppConfig, login: LoginService) -> Self {
        Self {
            config: Arc::new(config),
            login: Arc::new(login),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let prefix = state.config.openid.route_prefix();

    let login_routes = Router::new()
        .route("/login", post(login::start).get(login::callback))
        .route("/login/check", get(login::check));

    let app = if prefix.is_empty() {
        login_routes
    } else {
        Router::new().nest(&prefix, login_routes)
    };

    app.route("/health", get(health::liveness))
        .layer(tower_cookies::CookieManagerLayer::new())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}
