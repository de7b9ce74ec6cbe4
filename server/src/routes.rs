//! HTTP route handlers for the Merathon server.
//!
//! | Method | Path | Session | Purpose |
//! |--------|------|---------|---------|
//! | GET | `/` | - | liveness text |
//! | GET | `/health` | - | health and uptime |
//! | POST | `/jwt` | - | issue session cookie from body claims |
//! | POST | `/logout` | - | clear session cookie |
//! | POST | `/events` | - | create event |
//! | GET | `/events` | - | list events (`email`, `sortOrder`) |
//! | GET | `/events/limited` | - | list up to 6 events (`sortOrder`) |
//! | PUT | `/events/{id}` | owner | partial update |
//! | DELETE | `/events/{id}` | owner | delete |
//! | POST | `/events/{id}/reconcile` | owner | repair `registrationCount` |
//! | GET | `/merathon/{id}` | - | fetch one event |
//! | POST | `/register` | - | create registration and bump counter |
//! | GET | `/register` | owner | list registrations by `email` |
//! | PUT | `/register/{id}` | owner | partial update |
//! | DELETE | `/register/{id}` | owner | delete |
//! | POST | `/chat` | - | relay a question to the completion service |
//!
//! # Architecture
//!
//! All routes share [`AppState`], which owns the configuration, the store
//! handle, the token signer and the optional chat client. Routes marked
//! "owner" take a [`Session`] argument, so the session cookie is verified
//! before the handler runs, and then call [`authorize_owner`] against the
//! resource's owner email.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use merathon_server::config::Config;
//! use merathon_server::routes::{create_router, AppState};
//! use merathon_server::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config, Arc::new(MemoryStore::new()), None);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:5000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRef, Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{authorize_owner, removal_cookie, session_cookie, Session, TokenSigner};
use crate::chat::{build_prompt, ChatClient, ChatError, CONTEXT_EVENT_COUNT};
use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::models::{
    apply_patch, strip_event_patch, strip_registration_patch, Event, EventQuery, NewEvent,
    NewRegistration, Patch, Registration, SortOrder, UpdateSummary, LIMITED_EVENT_COUNT,
};
use crate::registrations::{reconcile_registration_count, register, Reconciliation};
use crate::store::{parse_id, Store};

// ============================================================================
// Constants
// ============================================================================

/// Maximum request body size (1 MB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Body of `GET /`.
const ROOT_MESSAGE: &str = "merathon management system";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Cloned for each request; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Event and registration storage.
    pub store: Arc<dyn Store>,

    /// Signs and verifies session tokens.
    pub signer: Arc<TokenSigner>,

    /// Completion service client. `None` when no API key is configured.
    pub chat: Option<ChatClient>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state, deriving the token signer from the
    /// configured secret.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn Store>, chat: Option<ChatClient>) -> Self {
        let signer = TokenSigner::new(&config.token_secret);

        Self {
            config: Arc::new(config),
            store,
            signer: Arc::new(signer),
            chat,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("store", &self.store.backend())
            .field("signer", &self.signer)
            .field("chat", &self.chat)
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl FromRef<AppState> for Arc<TokenSigner> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.signer)
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes, body limit, tracing and
/// CORS configured.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/jwt", post(post_jwt))
        .route("/logout", post(post_logout))
        .route("/events", post(post_events).get(get_events))
        .route("/events/limited", get(get_limited_events))
        .route("/events/{id}", put(put_event).delete(delete_event))
        .route("/events/{id}/reconcile", post(post_reconcile))
        .route("/merathon/{id}", get(get_marathon))
        .route("/register", post(post_register).get(get_registrations))
        .route(
            "/register/{id}",
            put(put_registration).delete(delete_registration),
        )
        .route("/chat", post(post_chat))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Credentialed CORS for the configured web client origins.
fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unusable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

// ============================================================================
// Shared request and response types
// ============================================================================

/// Parses a JSON request body, reporting failures as validation errors.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::validation(format!("invalid JSON body: {e}")))
}

/// Parses a partial update, rejecting one that changes nothing.
fn parse_patch(body: &Bytes, strip: impl FnOnce(&mut Patch)) -> Result<Patch> {
    let mut patch: Patch = parse_body(body)?;
    strip(&mut patch);

    if patch.is_empty() {
        return Err(ApiError::validation(
            "update must contain at least one writable field",
        ));
    }
    Ok(patch)
}

/// Checks that `patch` leaves `record` readable before it is written.
fn check_patch<T>(record: &T, patch: &Patch) -> Result<()>
where
    T: Serialize + DeserializeOwned,
{
    apply_patch(record, patch)
        .map(|_| ())
        .map_err(|e| ApiError::validation(format!("invalid update: {e}")))
}

/// Query parameters accepted by the event listings.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// Only events created by this email.
    pub email: Option<String>,

    /// `asc` for oldest first. Anything else lists newest first.
    pub sort_order: Option<String>,
}

impl ListParams {
    fn order(&self) -> SortOrder {
        match self.sort_order.as_deref() {
            Some(order) if order.eq_ignore_ascii_case("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }

    fn email(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
    }
}

/// Response for a created record.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertedResponse {
    pub acknowledged: bool,
    pub inserted_id: String,
}

/// Response for an update.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedResponse {
    pub acknowledged: bool,

    #[serde(flatten)]
    pub summary: UpdateSummary,
}

/// Response for a delete.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedResponse {
    pub acknowledged: bool,
    pub deleted_count: u64,
}

impl From<UpdateSummary> for UpdatedResponse {
    fn from(summary: UpdateSummary) -> Self {
        Self {
            acknowledged: true,
            summary,
        }
    }
}

impl From<u64> for DeletedResponse {
    fn from(deleted_count: u64) -> Self {
        Self {
            acknowledged: true,
            deleted_count,
        }
    }
}

// ============================================================================
// GET / and GET /health
// ============================================================================

async fn get_root() -> &'static str {
    ROOT_MESSAGE
}

/// Response body for the health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// `ok` if the store answered a ping, `unavailable` otherwise.
    pub store: String,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health
///
/// ```json
/// {"status": "ok", "store": "ok", "uptimeSeconds": 3600}
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = match state.store.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            warn!(error = %e, backend = state.store.backend(), "Store ping failed");
            "unavailable"
        }
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        store: store.to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// POST /jwt and POST /logout - Session cookie
// ============================================================================

/// Body of the session endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// POST /jwt - Issue a session cookie.
///
/// The JSON body becomes the token's claims and must carry an `email`.
///
/// # Responses
///
/// - `200 OK` - `{"success": true}` with a `Set-Cookie: token=...` header
/// - `400 Bad Request` - body is not a JSON object or lacks `email`
async fn post_jwt(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let claims: Map<String, Value> = parse_body(&body)?;
    let token = state.signer.issue(claims)?;

    debug!("Session token issued");

    let jar = jar.add(session_cookie(token, state.config.production));
    Ok((jar, Json(SuccessResponse { success: true })))
}

/// POST /logout - Clear the session cookie.
async fn post_logout(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    let jar = jar.add(removal_cookie(state.config.production));
    (jar, Json(SuccessResponse { success: true }))
}

// ============================================================================
// Events
// ============================================================================

/// POST /events - Create an event.
///
/// # Responses
///
/// - `201 Created` - `{"acknowledged": true, "insertedId": "..."}`
/// - `400 Bad Request` - a required field is missing; nothing is written
async fn post_events(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse> {
    let new_event: NewEvent = parse_body(&body)?;
    let details = new_event
        .validate(Utc::now())
        .map_err(|missing| ApiError::missing_fields(&missing))?;

    let id = state.store.create_event(details).await?;

    info!(event_id = %id, "Event created");

    Ok((
        StatusCode::CREATED,
        Json(InsertedResponse {
            acknowledged: true,
            inserted_id: id.to_hex(),
        }),
    ))
}

/// GET /events - List events, optionally only those created by `email`.
async fn get_events(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Event>>> {
    let mut query = EventQuery::new().with_order(params.order());
    if let Some(email) = params.email() {
        query = query.with_creator(email);
    }

    let events = state.store.list_events(&query).await?;
    debug!(count = events.len(), "Listed events");
    Ok(Json(events))
}

/// GET /events/limited - List at most six events.
async fn get_limited_events(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Event>>> {
    let query = EventQuery::new()
        .with_order(params.order())
        .with_limit(LIMITED_EVENT_COUNT);

    Ok(Json(state.store.list_events(&query).await?))
}

/// GET /merathon/{id} - Fetch one event.
///
/// The id is checked before the store is touched.
async fn get_marathon(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Event>> {
    let id = parse_id(&id)?;

    state
        .store
        .get_event(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("event {id} not found")))
}

/// PUT /events/{id} - Partially update an event the session owns.
///
/// `_id`, `createdAt`, `registrationCount` and `userEmail` cannot be written.
/// A patch that would give a known field the wrong type is rejected with 400.
async fn put_event(
    State(state): State<AppState>,
    Session(claims): Session,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<UpdatedResponse>> {
    let id = parse_id(&id)?;
    let patch = parse_patch(&body, strip_event_patch)?;

    let event = state
        .store
        .get_event(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("event {id} not found")))?;
    authorize_owner(&claims, event.details.user_email.as_deref())?;
    check_patch(&event.details, &patch)?;

    let summary = state.store.update_event(id, patch).await?;

    info!(event_id = %id, modified = summary.modified_count, "Event updated");
    Ok(Json(summary.into()))
}

/// DELETE /events/{id} - Delete an event the session owns.
///
/// Deleting an id that does not exist reports `deletedCount: 0`.
async fn delete_event(
    State(state): State<AppState>,
    Session(claims): Session,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>> {
    let id = parse_id(&id)?;

    let Some(event) = state.store.get_event(id).await? else {
        return Ok(Json(DeletedResponse::from(0)));
    };
    authorize_owner(&claims, event.details.user_email.as_deref())?;

    let deleted = state.store.delete_event(id).await?;

    info!(event_id = %id, deleted, "Event deleted");
    Ok(Json(deleted.into()))
}

/// POST /events/{id}/reconcile - Raise `registrationCount` to the number of
/// stored registrations for the event.
async fn post_reconcile(
    State(state): State<AppState>,
    Session(claims): Session,
    Path(id): Path<String>,
) -> Result<Json<Reconciliation>> {
    let id = parse_id(&id)?;
    let not_found = || ApiError::not_found(format!("event {id} not found"));

    let event = state.store.get_event(id).await?.ok_or_else(not_found)?;
    authorize_owner(&claims, event.details.user_email.as_deref())?;

    reconcile_registration_count(state.store.as_ref(), id)
        .await?
        .map(Json)
        .ok_or_else(not_found)
}

// ============================================================================
// Registrations
// ============================================================================

/// Response for `POST /register`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub acknowledged: bool,
    pub inserted_id: String,

    /// Whether the event's `registrationCount` was incremented.
    pub counter_updated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// POST /register - Record a registration and bump the event counter.
///
/// # Responses
///
/// - `201 Created` - registration stored; `counterUpdated` tells whether the
///   event counter followed
/// - `400 Bad Request` - `email` or `marathonId` missing
async fn post_register(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse> {
    let new_registration: NewRegistration = parse_body(&body)?;
    let details = new_registration
        .validate()
        .map_err(|missing| ApiError::missing_fields(&missing))?;

    let outcome = register(state.store.as_ref(), details).await?;

    info!(
        registration_id = %outcome.inserted_id,
        counter_updated = outcome.counter_updated,
        "Registration created"
    );

    let message = (!outcome.counter_updated).then(|| {
        "registration saved but the event's registration count was not updated".to_string()
    });

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            acknowledged: true,
            inserted_id: outcome.inserted_id,
            counter_updated: outcome.counter_updated,
            message,
        }),
    ))
}

/// Query parameters for `GET /register`.
#[derive(Debug, Default, Deserialize)]
pub struct RegistrationParams {
    pub email: Option<String>,
}

/// GET /register?email= - List the session holder's registrations.
///
/// The queried email must belong to the session.
async fn get_registrations(
    State(state): State<AppState>,
    Session(claims): Session,
    Query(params): Query<RegistrationParams>,
) -> Result<Json<Vec<Registration>>> {
    let email = params
        .email
        .as_deref()
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .ok_or_else(|| ApiError::validation("email query parameter is required"))?;

    authorize_owner(&claims, Some(email))?;

    Ok(Json(state.store.list_registrations(email).await?))
}

/// PUT /register/{id} - Partially update a registration the session owns.
///
/// `_id` and `email` cannot be written.
async fn put_registration(
    State(state): State<AppState>,
    Session(claims): Session,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<UpdatedResponse>> {
    let id = parse_id(&id)?;
    let patch = parse_patch(&body, strip_registration_patch)?;

    let registration = state
        .store
        .get_registration(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("registration {id} not found")))?;
    authorize_owner(&claims, Some(&registration.details.email))?;
    check_patch(&registration.details, &patch)?;

    let summary = state.store.update_registration(id, patch).await?;

    info!(registration_id = %id, modified = summary.modified_count, "Registration updated");
    Ok(Json(summary.into()))
}

/// DELETE /register/{id} - Delete a registration the session owns.
///
/// The event counter is left unchanged.
async fn delete_registration(
    State(state): State<AppState>,
    Session(claims): Session,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>> {
    let id = parse_id(&id)?;

    let Some(registration) = state.store.get_registration(id).await? else {
        return Ok(Json(DeletedResponse::from(0)));
    };
    authorize_owner(&claims, Some(&registration.details.email))?;

    let deleted = state.store.delete_registration(id).await?;

    info!(registration_id = %id, deleted, "Registration deleted");
    Ok(Json(deleted.into()))
}

// ============================================================================
// POST /chat - Chat relay
// ============================================================================

/// Body of `POST /chat`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    message: Option<String>,
    user_email: Option<String>,
}

/// Response for `POST /chat`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
}

/// POST /chat - Answer a question with the most recent events as context.
///
/// # Responses
///
/// - `200 OK` - `{"reply": "..."}`
/// - `400 Bad Request` - `message` missing
/// - `500 Internal Server Error` - completion service failed or is not configured
async fn post_chat(State(state): State<AppState>, body: Bytes) -> Result<Json<ChatResponse>> {
    let request: ChatRequest = parse_body(&body)?;
    let message = request
        .message
        .filter(|message| !message.trim().is_empty())
        .ok_or_else(|| ApiError::missing_fields(&["message"]))?;

    let client = state.chat.as_ref().ok_or_else(|| {
        ChatError::Configuration("completion service is not configured".to_string())
    })?;

    let context = EventQuery::new().with_limit(CONTEXT_EVENT_COUNT);
    let events = state.store.list_events(&context).await?;
    let prompt = build_prompt(&message, request.user_email.as_deref(), &events);

    let reply = client.complete(&prompt).await?;

    Ok(Json(ChatResponse { reply }))
}

// ============================================================================
// Tests
// ============================================================================
