use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::binder::RequestParams;
use crate::error::Error;
use crate::service::Service;
use crate::session::SessionGrant;

pub const JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";
pub const AUTH_NAME: &str = "Authorization";

#[derive(Debug, Clone, Copy)]
pub struct HttpOptions {
    pub keepalive: bool,
    /// Session key travels in a cookie rather than the `Authorization` header.
    pub cookie: bool,
    pub doc: bool,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            keepalive: false,
            cookie: true,
            doc: true,
        }
    }
}

#[derive(Clone)]
struct AppState {
    service: Arc<Service>,
    options: HttpOptions,
}

pub fn router(service: Arc<Service>, options: HttpOptions) -> Router {
    let login_required = service.login_required();
    let mut app = Router::new()
        .route("/sql/*name", post(sql_handler))
        .route("/health", get(health_handler));

    if login_required {
        app = app
            .route("/login", post(login_handler))
            .route("/logout", post(logout_handler));
    }
    if options.doc {
        app = app.route("/doc", get(doc_handler));
    }

    app.with_state(AppState { service, options })
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.to_string()).into_response()
    }
}

fn params(pairs: Vec<(String, String)>) -> RequestParams {
    RequestParams::from_pairs(pairs)
}

fn success(options: &HttpOptions, body: Vec<u8>) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    if options.keepalive {
        headers.insert(header::CONNECTION, HeaderValue::from_static("Keep-Alive"));
    }
    response
}

/// Session key from the `Authorization` cookie or header, per `cookie`.
pub fn auth_key(headers: &HeaderMap, cookie: bool) -> Option<String> {
    if !cookie {
        return headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .filter(|v| !v.is_empty());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == AUTH_NAME)
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
}

fn session_cookie(grant: &SessionGrant) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; Expires={}",
        AUTH_NAME,
        grant.token,
        grant.expires_at.format("%a, %d %b %Y %H:%M:%S GMT")
    )
}

async fn sql_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Form(form): Form<Vec<(String, String)>>,
) -> Result<Response, Error> {
    let name = name.trim_start_matches('/');
    let key = auth_key(&headers, state.options.cookie);
    state.service.authorize(name, key.as_deref())?;

    let output = state
        .service
        .run_query(name, params(form), 0, &CancellationToken::new())
        .await?;
    Ok(success(&state.options, output.json))
}

async fn login_handler(
    State(state): State<AppState>,
    Form(form): Form<Vec<(String, String)>>,
) -> Result<Response, Error> {
    let (output, grant) = state
        .service
        .login(params(form), &CancellationToken::new())
        .await?;

    let mut response = success(&state.options, output.json);
    let (name, value) = if state.options.cookie {
        (header::SET_COOKIE, session_cookie(&grant))
    } else {
        (header::AUTHORIZATION, grant.token.clone())
    };
    let value = HeaderValue::from_str(&value)
        .map_err(|e| Error::Internal(format!("Invalid session header: {}", e)))?;
    response.headers_mut().insert(name, value);
    Ok(response)
}

async fn logout_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<Vec<(String, String)>>,
) -> Result<Response, Error> {
    let key = auth_key(&headers, state.options.cookie);
    let output = state
        .service
        .logout(key.as_deref(), params(form), &CancellationToken::new())
        .await?;
    let body = output.map(|o| o.json).unwrap_or_default();
    Ok(success(&state.options, body))
}

async fn doc_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.describe())
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.service.health().await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "error", "message": e.to_string()})),
        )
            .into_response(),
    }
}
