//! Review panel routes and handlers.
//!
//! Reviewers sign in with Discord, see the queue of requests awaiting
//! review for their guilds, inspect submitted documents and decide. Failed
//! side-effect deliveries show up on the dashboard from the operator log.

use axum::{
    extract::{Path, Query, State},
    http::{header, header::SET_COOKIE, HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        Html, IntoResponse, Redirect, Response,
    },
    routing::{get, post},
    Form, Router,
};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::VerificationError;
use crate::logging::SharedLogBuffer;
use crate::managers::{ReviewOutcome, SharedVerificationManager};
use crate::state::{SharedIdentityStore, VerificationRequest};

use super::auth::{
    create_logout_cookie, create_session_cookie, get_session_token, DiscordOAuth,
    ReviewerCallbackParams, ReviewerSession, SharedSessionStore,
};

/// Extended app state for the review panel
#[derive(Clone)]
pub struct AdminState {
    pub oauth: DiscordOAuth,
    pub manager: SharedVerificationManager,
    pub store: SharedIdentityStore,
    pub session_store: SharedSessionStore,
    pub log_buffer: SharedLogBuffer,
}

/// Create the review panel router
pub fn reviewer_router(state: AdminState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/login", get(login))
        .route("/logout", get(logout))
        .route("/callback", get(oauth_callback))
        .route("/review/:rid", get(review_detail))
        .route("/review/:rid/accept", post(accept_request))
        .route("/review/:rid/reject", post(reject_request))
        .route("/photo/:side/:rid", get(photo_proxy))
        .route("/logs", get(logs_page))
        .route("/logs/stream", get(logs_stream))
        .with_state(state)
}

/// Check authentication and return the session or a redirect to login
async fn require_auth(headers: &HeaderMap, state: &AdminState) -> Result<ReviewerSession, Response> {
    let token = get_session_token(headers)
        .ok_or_else(|| Redirect::to("/admin/login").into_response())?;

    state
        .session_store
        .get_session(&token)
        .await
        .ok_or_else(|| Redirect::to("/admin/login").into_response())
}

/// GET /admin/login - Show login page
async fn login(State(state): State<AdminState>) -> Html<String> {
    Html(login_page(&state.oauth.login_url()))
}

/// GET /admin/logout - Clear session and redirect to login
async fn logout(headers: HeaderMap, State(state): State<AdminState>) -> impl IntoResponse {
    if let Some(token) = get_session_token(&headers) {
        state.session_store.remove_session(&token).await;
    }

    (
        [(SET_COOKIE, create_logout_cookie())],
        Redirect::to("/admin/login"),
    )
}

/// GET /admin/callback - Handle Discord OAuth callback
async fn oauth_callback(
    Query(params): Query<ReviewerCallbackParams>,
    State(state): State<AdminState>,
) -> Response {
    if params.state != "reviewer_login" {
        return (StatusCode::BAD_REQUEST, Html("Invalid OAuth state".to_string()))
            .into_response();
    }

    let user = match state.oauth.fetch_user(&params.code).await {
        Ok(user) => user,
        Err(e) => {
            error!("Reviewer login failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html("Authentication failed".to_string()),
            )
                .into_response();
        }
    };

    let user_id: u64 = match user.id.parse() {
        Ok(id) => id,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, Html("Malformed user id".to_string()))
                .into_response();
        }
    };

    // Access requires a roster entry for at least one guild
    let is_reviewer = {
        let store = state.store.read().await;
        store
            .reviewers
            .values()
            .any(|r| r.identity.user_id == user_id)
    };
    if !is_reviewer {
        warn!("User {} tried to open the review panel without a roster entry", user_id);
        return (StatusCode::FORBIDDEN, Html(access_denied_page())).into_response();
    }

    let name = user.global_name.unwrap_or(user.username);
    let token = state
        .session_store
        .create_session(ReviewerSession::new(user_id, name.clone()))
        .await;
    info!("Reviewer {} ({}) signed in to the review panel", name, user_id);

    (
        [(SET_COOKIE, create_session_cookie(&token))],
        Redirect::to("/admin"),
    )
        .into_response()
}

/// GET /admin - review queue dashboard
async fn dashboard(headers: HeaderMap, State(state): State<AdminState>) -> Response {
    let session = match require_auth(&headers, &state).await {
        Ok(session) => session,
        Err(redirect) => return redirect,
    };

    let guild_ids: Vec<u64> = {
        let store = state.store.read().await;
        store
            .reviewers
            .values()
            .filter(|r| r.identity.user_id == session.discord_id)
            .map(|r| r.identity.guild_id)
            .collect()
    };

    let mut queue: Vec<VerificationRequest> = Vec::new();
    for guild_id in guild_ids {
        queue.extend(state.manager.list_pending(guild_id).await);
    }

    let errors = state.log_buffer.recent_errors(10);
    Html(dashboard_page(&session, &queue, &errors)).into_response()
}

/// GET /admin/review/{rid} - request detail with documents
async fn review_detail(
    headers: HeaderMap,
    State(state): State<AdminState>,
    Path(rid): Path<Uuid>,
) -> Response {
    if let Err(redirect) = require_auth(&headers, &state).await {
        return redirect;
    }

    let store = state.store.read().await;
    match store.get_request(&rid) {
        Some(request) => Html(review_page(request)).into_response(),
        None => (StatusCode::NOT_FOUND, Html("No such request".to_string())).into_response(),
    }
}

#[derive(Deserialize)]
struct AcceptForm {
    #[serde(default)]
    student_number: String,
}

/// POST /admin/review/{rid}/accept
async fn accept_request(
    headers: HeaderMap,
    State(state): State<AdminState>,
    Path(rid): Path<Uuid>,
    Form(form): Form<AcceptForm>,
) -> Response {
    let session = match require_auth(&headers, &state).await {
        Ok(session) => session,
        Err(redirect) => return redirect,
    };

    let student_number = {
        let trimmed = form.student_number.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    };

    let outcome = state
        .manager
        .decide_review(&rid, session.discord_id, ReviewOutcome::Accept { student_number })
        .await;
    decision_response(outcome, &rid)
}

#[derive(Deserialize)]
struct RejectForm {
    reason: String,
}

/// POST /admin/review/{rid}/reject
async fn reject_request(
    headers: HeaderMap,
    State(state): State<AdminState>,
    Path(rid): Path<Uuid>,
    Form(form): Form<RejectForm>,
) -> Response {
    let session = match require_auth(&headers, &state).await {
        Ok(session) => session,
        Err(redirect) => return redirect,
    };

    let outcome = state
        .manager
        .decide_review(
            &rid,
            session.discord_id,
            ReviewOutcome::Reject { reason: form.reason },
        )
        .await;
    decision_response(outcome, &rid)
}

fn decision_response(outcome: crate::error::Result<()>, rid: &Uuid) -> Response {
    match outcome {
        Ok(()) => Redirect::to("/admin").into_response(),
        Err(VerificationError::Unauthorized { .. }) => {
            (StatusCode::FORBIDDEN, Html(access_denied_page())).into_response()
        }
        Err(
            e @ VerificationError::AlreadyDecided { .. } | e @ VerificationError::Conflict { .. },
        ) => {
            // Someone else decided first; back to the queue
            warn!("Decision on request {} lost the race: {}", rid, e);
            Redirect::to("/admin").into_response()
        }
        Err(e) => {
            error!("Decision on request {} failed: {}", rid, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!("Decision failed: {}", e)),
            )
                .into_response()
        }
    }
}

/// GET /admin/photo/{side}/{rid} - serve submitted document images
async fn photo_proxy(
    headers: HeaderMap,
    State(state): State<AdminState>,
    Path((side, rid)): Path<(String, Uuid)>,
) -> Response {
    if let Err(redirect) = require_auth(&headers, &state).await {
        return redirect;
    }

    let store = state.store.read().await;
    let evidence = match store.get_request(&rid).and_then(|r| r.evidence.as_ref()) {
        Some(evidence) => evidence,
        None => return (StatusCode::NOT_FOUND, "no documents").into_response(),
    };

    let image = match side.as_str() {
        "front" => &evidence.front,
        "back" => &evidence.back,
        _ => return (StatusCode::BAD_REQUEST, "front or back").into_response(),
    };

    (
        [(header::CONTENT_TYPE, image.content_type.clone())],
        image.bytes.clone(),
    )
        .into_response()
}

/// GET /admin/logs - recent operator log
async fn logs_page(headers: HeaderMap, State(state): State<AdminState>) -> Response {
    if let Err(redirect) = require_auth(&headers, &state).await {
        return redirect;
    }

    let recent = state.log_buffer.get_recent(200);
    let lines: String = recent
        .iter()
        .map(|e| format!("<div>{}</div>\n", html_escape(&e.format())))
        .collect();

    Html(format!(
        r#"<!DOCTYPE html>
<html><head><title>Operator log</title>
<style>body {{ font-family: monospace; background: #111; color: #ddd; padding: 1rem; }}</style>
</head><body>
<h2>Operator log</h2>
<div id="log">{lines}</div>
<script>
const log = document.getElementById('log');
const source = new EventSource('/admin/logs/stream');
source.onmessage = (e) => {{
    const entry = JSON.parse(e.data);
    const div = document.createElement('div');
    div.textContent = `${{entry.timestamp}} ${{entry.level}} [${{entry.target}}] ${{entry.message}}`;
    log.appendChild(div);
}};
</script>
</body></html>"#
    ))
    .into_response()
}

/// GET /admin/logs/stream - live log SSE stream
async fn logs_stream(
    headers: HeaderMap,
    State(state): State<AdminState>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, Response> {
    require_auth(&headers, &state).await?;

    let receiver = state.log_buffer.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|entry| {
        entry
            .ok()
            .map(|entry| Ok(Event::default().data(entry.to_json())))
    });

    Ok(Sse::new(stream))
}

// --- pages ---

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

const PANEL_STYLE: &str = r#"
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
               background: #1a1a2e; color: #eee; margin: 0; padding: 2rem; }
        a { color: #5865F2; text-decoration: none; }
        .card { background: rgba(255,255,255,0.05); border-radius: 12px; padding: 1.5rem;
                margin-bottom: 1rem; border: 1px solid rgba(255,255,255,0.1); }
        .error { color: #ED4245; font-family: monospace; font-size: 0.85rem; }
        button { background: #5865F2; color: white; border: none; border-radius: 8px;
                 padding: 0.5rem 1.25rem; font-weight: 600; cursor: pointer; }
        button.danger { background: #ED4245; }
        input { padding: 0.5rem; border-radius: 8px; border: 1px solid #444;
                background: #222; color: #eee; }
        img.doc { max-width: 45%; border-radius: 8px; margin-right: 1rem; }
"#;

fn panel_page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{title}</title>
    <style>{PANEL_STYLE}</style>
</head>
<body>
{body}
</body>
</html>"#
    )
}

fn login_page(oauth_url: &str) -> String {
    panel_page(
        "Reviewer login",
        &format!(
            r#"<div class="card">
<h1>Review panel</h1>
<p>Sign in with Discord. Access is limited to registered reviewers.</p>
<p><a href="{}"><button>Login with Discord</button></a></p>
</div>"#,
            oauth_url
        ),
    )
}

fn access_denied_page() -> String {
    panel_page(
        "Access denied",
        r#"<div class="card">
<h1>Access denied</h1>
<p>You are not registered as a reviewer. Ask the server staff to add you with
<code>/reviewer add</code>.</p>
<p><a href="/admin/login">Try logging in again</a></p>
</div>"#,
    )
}

fn dashboard_page(
    session: &ReviewerSession,
    queue: &[VerificationRequest],
    errors: &[crate::logging::LogEntry],
) -> String {
    let queue_html: String = if queue.is_empty() {
        "<p>No requests waiting for review.</p>".to_string()
    } else {
        queue
            .iter()
            .map(|r| {
                format!(
                    r#"<div class="card">
<b>{}</b> (guild {}) — waiting since {}<br>
<a href="/admin/review/{}">Review</a>
</div>"#,
                    html_escape(&r.identity.display_name()),
                    r.identity.guild_id,
                    r.created_at.format("%Y-%m-%d %H:%M"),
                    r.id,
                )
            })
            .collect()
    };

    let errors_html: String = if errors.is_empty() {
        String::new()
    } else {
        let lines: String = errors
            .iter()
            .map(|e| format!("<div class=\"error\">{}</div>\n", html_escape(&e.format())))
            .collect();
        format!(
            "<div class=\"card\"><h2>Recent delivery failures</h2>{}</div>",
            lines
        )
    };

    panel_page(
        "Review queue",
        &format!(
            r#"<h1>Review queue</h1>
<p>Signed in as <b>{}</b> — <a href="/admin/logs">operator log</a> — <a href="/admin/logout">logout</a></p>
{}
{}"#,
            html_escape(&session.username),
            queue_html,
            errors_html,
        ),
    )
}

fn review_page(request: &VerificationRequest) -> String {
    let documents = if request.evidence.is_some() {
        format!(
            r#"<div class="card">
<h2>Submitted documents</h2>
<img class="doc" src="/admin/photo/front/{rid}" alt="front">
<img class="doc" src="/admin/photo/back/{rid}" alt="back">
</div>"#,
            rid = request.id
        )
    } else {
        "<div class=\"card\"><p>No documents submitted.</p></div>".to_string()
    };

    panel_page(
        "Review request",
        &format!(
            r#"<h1>Review request</h1>
<div class="card">
<p><b>{user}</b> in guild <b>{guild}</b></p>
<p>State: {state} — created {created}</p>
</div>
{documents}
<div class="card">
<form method="post" action="/admin/review/{rid}/accept">
    <input name="student_number" placeholder="Student number (s12345)">
    <button type="submit">Accept</button>
</form>
<form method="post" action="/admin/review/{rid}/reject" style="margin-top: 1rem;">
    <input name="reason" placeholder="Rejection reason" required>
    <button class="danger" type="submit">Reject</button>
</form>
</div>
<p><a href="/admin">Back to queue</a></p>"#,
            user = html_escape(&request.identity.display_name()),
            guild = request.identity.guild_id,
            state = request.state,
            created = request.created_at.format("%Y-%m-%d %H:%M"),
            documents = documents,
            rid = request.id,
        ),
    )
}
