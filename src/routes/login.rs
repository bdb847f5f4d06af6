//! Login handlers.
//!
//! One cookie carries first the login flow id handed out by `start`, then the
//! session id the verified user is stored under. The user itself stays in the
//! session store behind [`LoginService`](crate::service::LoginService).

use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tower_cookies::{
    Cookie, Cookies,
    cookie::{SameSite as CookieSameSite, time::Duration as CookieDuration},
};
use uuid::Uuid;

use super::AppState;
use crate::{
    auth::{AuthError, CallbackParams},
    config::{RedirectConfig, SameSite, SessionConfig},
    service::LoginOutcome,
};

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    /// Zero-based index into the user's affiliations.
    pub idx: Option<usize>,
}

fn cookie_same_site(config: &SessionConfig) -> CookieSameSite {
    match config.same_site {
        SameSite::Strict => CookieSameSite::Strict,
        SameSite::Lax => CookieSameSite::Lax,
        SameSite::None => CookieSameSite::None,
    }
}

fn build_session_cookie(config: &SessionConfig, id: Uuid) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), id.to_string()))
        .path("/")
        .http_only(true)
        .secure(config.secure)
        .same_site(cookie_same_site(config))
        .max_age(CookieDuration::seconds(config.duration_secs as i64))
        .build()
}

/// Build a session removal cookie with the same security attributes as the login cookie.
fn build_removal_cookie(config: &SessionConfig) -> Cookie<'static> {
    Cookie::build(config.cookie_name.clone())
        .path("/")
        .http_only(true)
        .secure(config.secure)
        .same_site(cookie_same_site(config))
        .max_age(CookieDuration::ZERO)
        .build()
}

fn session_id(cookies: &Cookies, config: &SessionConfig) -> Option<Uuid> {
    cookies
        .get(&config.cookie_name)
        .and_then(|cookie| cookie.value().parse::<Uuid>().ok())
}

/// Login start: send the user to the provider.
///
/// Any cookie the browser already carries is replaced by a fresh flow id.
#[tracing::instrument(name = "openid.login", skip(state, cookies))]
pub async fn start(State(state): State<AppState>, cookies: Cookies) -> Response {
    match state.login.begin().await {
        Ok(start) => {
            cookies.add(build_session_cookie(&state.config.session, start.flow_id));
            tracing::debug!(flow_id = %start.flow_id, "Redirecting to OpenID provider");
            Redirect::to(&start.auth_url).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Provider return URL.
#[tracing::instrument(name = "openid.callback", skip(state, cookies, params))]
pub async fn callback(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(params): Query<CallbackParams>,
) -> Response {
    let flow_id = session_id(&cookies, &state.config.session);
    let result = state.login.complete(flow_id, &params).await;

    match result.as_ref().ok().and_then(|completion| completion.session_id) {
        Some(id) => cookies.add(build_session_cookie(&state.config.session, id)),
        None if flow_id.is_some() => cookies.remove(build_removal_cookie(&state.config.session)),
        None => {}
    }

    respond(&state, &cookies, result.map(|completion| completion.outcome))
}

/// Resume the login once the user picked an affiliation.
#[tracing::instrument(name = "openid.check", skip(state, cookies, query), fields(idx = ?query.idx))]
pub async fn check(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(query): Query<CheckQuery>,
) -> Response {
    let Some(session_id) = session_id(&cookies, &state.config.session) else {
        return error_response(state.login.redirects(), AuthError::EmptyUser);
    };
    let result = state.login.check(session_id, query.idx).await;
    respond(&state, &cookies, result)
}

fn respond(
    state: &AppState,
    cookies: &Cookies,
    result: Result<LoginOutcome, AuthError>,
) -> Response {
    let redirects = state.login.redirects();
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => return error_response(redirects, e),
    };

    match outcome {
        LoginOutcome::Cancelled => Redirect::to(&redirects.user_cancel).into_response(),
        LoginOutcome::VerificationFailed => Redirect::to(&redirects.validate_fail).into_response(),
        LoginOutcome::OutOfFlow => Redirect::to(&redirects.other).into_response(),
        LoginOutcome::SelectRole(choices) => Json(choices).into_response(),
        LoginOutcome::Allowed(_) => Redirect::to(&redirects.login_allow).into_response(),
        LoginOutcome::Denied => {
            cookies.remove(build_removal_cookie(&state.config.session));
            Redirect::to(&redirects.login_deny).into_response()
        }
    }
}

fn error_response(redirects: &RedirectConfig, error: AuthError) -> Response {
    match error {
        AuthError::EmptyUser => {
            tracing::debug!("No verified user in session");
            Redirect::to(&redirects.other).into_response()
        }
        AuthError::ProviderData(_) | AuthError::Verification(_) => {
            tracing::warn!(error = %error, "OpenID login failed");
            Redirect::to(&redirects.validate_fail).into_response()
        }
        other => other.into_response(),
    }
}
