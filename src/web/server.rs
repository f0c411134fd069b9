//! Web server for the OAuth verification flow and the review panel.

use axum::{
    extract::{Host, Path, State},
    handler::HandlerWithoutStateExt,
    http::{StatusCode, Uri},
    response::{Html, Redirect},
    routing::{get, post},
    BoxError, Form, Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use base64::Engine;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::{net::SocketAddr, path::PathBuf};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::error::VerificationError;
use crate::managers::SharedVerificationManager;
use crate::state::{DocumentImage, Evidence, RequestState};

use super::admin::{reviewer_router, AdminState};
use super::oauth::{CredentialForm, OAuthState};

/// Web server configuration
pub struct WebServerConfig {
    /// HTTPS port (main server)
    pub https_port: u16,
    /// HTTP port (redirects to HTTPS)
    pub http_port: u16,
    /// Path to certificate PEM file (cert + CA bundle)
    pub cert_path: PathBuf,
    /// Path to private key PEM file
    pub key_path: PathBuf,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            https_port: 443,
            http_port: 80,
            cert_path: PathBuf::from("certs/cert.pem"),
            key_path: PathBuf::from("certs/key.pem"),
        }
    }
}

impl WebServerConfig {
    pub fn from_env() -> Self {
        Self {
            https_port: std::env::var("HTTPS_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(443),
            http_port: std::env::var("HTTP_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(80),
            cert_path: std::env::var("TLS_CERT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("certs/cert.pem")),
            key_path: std::env::var("TLS_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("certs/key.pem")),
        }
    }
}

/// Ports configuration for HTTP to HTTPS redirect
#[derive(Clone, Copy)]
struct Ports {
    http: u16,
    https: u16,
}

/// Seconds a user must wait between sign-in attempts on the same link.
/// The OAuth path may be retried indefinitely while a request is open; this
/// only slows down credential stuffing.
const LOGIN_COOLDOWN_SECS: u64 = 5;

/// Shared state for the user-facing verification handlers
#[derive(Clone)]
pub struct AppState {
    pub oauth: OAuthState,
    pub manager: SharedVerificationManager,
    /// Last sign-in attempt per secret code (unix seconds)
    pub login_attempts: Arc<DashMap<String, u64>>,
}

/// Start the web server for verification and the review panel.
pub async fn start_web_server(
    config: WebServerConfig,
    oauth: OAuthState,
    manager: SharedVerificationManager,
    admin_state: AdminState,
) -> anyhow::Result<()> {
    let state = AppState {
        oauth: oauth.clone(),
        manager,
        login_attempts: Arc::new(DashMap::new()),
    };

    let app = Router::new()
        .route("/", get(health))
        .route("/verify/:secret", get(verify_page))
        .route(
            "/verify/:secret/documents",
            get(documents_page).post(submit_documents),
        )
        .route("/login", post(oauth_login))
        .with_state(state)
        .nest("/admin", reviewer_router(admin_state))
        .layer(CorsLayer::permissive());

    let ports = Ports {
        http: config.http_port,
        https: config.https_port,
    };

    if !config.cert_path.exists() {
        return Err(anyhow::anyhow!(
            "Certificate file not found: {}",
            config.cert_path.display()
        ));
    }
    if !config.key_path.exists() {
        return Err(anyhow::anyhow!(
            "Private key file not found: {}",
            config.key_path.display()
        ));
    }

    let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to load TLS certificates: {}\n  Certificate: {}\n  Private key: {}",
                e,
                config.cert_path.display(),
                config.key_path.display()
            )
        })?;

    tokio::spawn(redirect_http_to_https(ports));

    let https_addr = SocketAddr::from(([0, 0, 0, 0], config.https_port));
    info!("Web server listening on https://0.0.0.0:{}", config.https_port);
    info!("Review panel available at {}/admin", oauth.base_url);

    axum_server::bind_rustls(https_addr, tls_config)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

/// Redirect all HTTP requests to HTTPS
async fn redirect_http_to_https(ports: Ports) {
    fn make_https(host: &str, uri: Uri, https_port: u16) -> Result<Uri, BoxError> {
        let mut parts = uri.into_parts();

        parts.scheme = Some(axum::http::uri::Scheme::HTTPS);

        if parts.path_and_query.is_none() {
            parts.path_and_query = Some("/".parse().unwrap());
        }

        let authority: axum::http::uri::Authority = host.parse()?;
        let bare_host = match authority.port() {
            Some(port_struct) => authority
                .as_str()
                .strip_suffix(port_struct.as_str())
                .unwrap()
                .strip_suffix(':')
                .unwrap(),
            None => authority.as_str(),
        };

        if https_port == 443 {
            parts.authority = Some(bare_host.parse()?);
        } else {
            parts.authority = Some(format!("{bare_host}:{https_port}").parse()?);
        }

        Ok(Uri::from_parts(parts)?)
    }

    let redirect = move |Host(host): Host, uri: Uri| async move {
        match make_https(&host, uri, ports.https) {
            Ok(uri) => Ok(Redirect::permanent(&uri.to_string())),
            Err(error) => {
                warn!(%error, "Failed to convert URI to HTTPS");
                Err(StatusCode::BAD_REQUEST)
            }
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], ports.http));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind HTTP redirect server on port {}: {}", ports.http, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, redirect.into_make_service()).await {
        error!("HTTP redirect server error: {}", e);
    }
}

/// Health check endpoint
async fn health() -> &'static str {
    "Verification server running"
}

/// GET /verify/{secret} - sign-in page for a verification link
async fn verify_page(
    State(state): State<AppState>,
    Path(secret): Path<String>,
) -> (StatusCode, Html<String>) {
    let request = match state.manager.find_by_secret(&secret).await {
        Some(request) => request,
        None => {
            return (
                StatusCode::NOT_FOUND,
                Html(message_page("Unknown link", "This verification link does not exist.")),
            );
        }
    };

    match request.state {
        RequestState::Created => (
            StatusCode::OK,
            Html(login_page(&state.oauth, &secret)),
        ),
        RequestState::AwaitingEvidence | RequestState::InReview => (
            StatusCode::OK,
            Html(documents_form_page(&secret, request.state == RequestState::InReview)),
        ),
        RequestState::Accepted => (
            StatusCode::OK,
            Html(message_page("Already verified", "This link has already been used.")),
        ),
        RequestState::Rejected => (
            StatusCode::OK,
            Html(message_page(
                "Request rejected",
                "This verification request was rejected. Ask the server staff to open a new one.",
            )),
        ),
    }
}

/// POST /login - credential callback from the provider's sign-in widget
async fn oauth_login(
    State(state): State<AppState>,
    Form(form): Form<CredentialForm>,
) -> (StatusCode, Html<String>) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if let Some(last) = state.login_attempts.get(&form.state) {
        if now.saturating_sub(*last) < LOGIN_COOLDOWN_SECS {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Html(message_page("Slow down", "Wait a few seconds before trying again.")),
            );
        }
    }
    state.login_attempts.insert(form.state.clone(), now);

    let request = match state.manager.find_by_secret(&form.state).await {
        Some(request) => request,
        None => {
            return (
                StatusCode::NOT_FOUND,
                Html(message_page("Unknown link", "This verification link does not exist.")),
            );
        }
    };

    let assertion = match state.oauth.fetch_claims(&form.credential).await {
        Ok(assertion) => assertion,
        Err(e) => {
            warn!("Credential exchange failed for request {}: {}", request.id, e);
            return (
                StatusCode::BAD_REQUEST,
                Html(message_page("Sign-in failed", "The provider rejected the credential.")),
            );
        }
    };

    match state.manager.decide_oauth(&request.id, &assertion).await {
        Ok(record) => (
            StatusCode::OK,
            Html(verified_page(record.student_number.as_deref())),
        ),
        Err(VerificationError::AlreadyDecided { .. }) => (
            StatusCode::CONFLICT,
            Html(message_page("Already verified", "This link has already been used.")),
        ),
        Err(VerificationError::IdentityConflict { .. }) => (
            StatusCode::CONFLICT,
            Html(message_page(
                "Already linked",
                "These credentials are already linked to another account.",
            )),
        ),
        Err(e @ VerificationError::InvalidAssertion { .. })
        | Err(e @ VerificationError::AssertionRejected { .. }) => {
            warn!("Assertion declined for request {}: {}", request.id, e);
            (
                StatusCode::BAD_REQUEST,
                Html(message_page(
                    "Sign-in rejected",
                    "The account you signed in with cannot be used for student verification. \
                     Use your university account and try again.",
                )),
            )
        }
        Err(e) => {
            error!("OAuth decision failed for request {}: {}", request.id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(message_page("Something went wrong", "Try again in a moment.")),
            )
        }
    }
}

/// One uploaded document side, base64 over JSON.
#[derive(Deserialize)]
pub struct UploadImage {
    pub content_type: String,
    pub data: String,
}

#[derive(Deserialize)]
pub struct EvidenceUpload {
    pub front: UploadImage,
    pub back: UploadImage,
    pub contact_email: Option<String>,
}

impl EvidenceUpload {
    fn into_evidence(self) -> Result<Evidence, base64::DecodeError> {
        let decode = |image: UploadImage| -> Result<DocumentImage, base64::DecodeError> {
            Ok(DocumentImage {
                content_type: image.content_type,
                bytes: base64::engine::general_purpose::STANDARD.decode(image.data.as_bytes())?,
            })
        };
        Ok(Evidence {
            front: decode(self.front)?,
            back: decode(self.back)?,
            contact_email: self.contact_email,
        })
    }
}

/// GET /verify/{secret}/documents - document upload page
async fn documents_page(
    State(state): State<AppState>,
    Path(secret): Path<String>,
) -> (StatusCode, Html<String>) {
    match state.manager.find_by_secret(&secret).await {
        Some(request) if request.is_active() => (
            StatusCode::OK,
            Html(documents_form_page(&secret, request.state == RequestState::InReview)),
        ),
        Some(_) => (
            StatusCode::CONFLICT,
            Html(message_page("Already decided", "This request has already been decided.")),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Html(message_page("Unknown link", "This verification link does not exist.")),
        ),
    }
}

/// POST /verify/{secret}/documents - receive document photos
async fn submit_documents(
    State(state): State<AppState>,
    Path(secret): Path<String>,
    Json(upload): Json<EvidenceUpload>,
) -> (StatusCode, Html<String>) {
    let request = match state.manager.find_by_secret(&secret).await {
        Some(request) => request,
        None => {
            return (
                StatusCode::NOT_FOUND,
                Html(message_page("Unknown link", "This verification link does not exist.")),
            );
        }
    };

    let evidence = match upload.into_evidence() {
        Ok(evidence) => evidence,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Html(message_page("Upload failed", &format!("Malformed image data: {}", e))),
            );
        }
    };

    match state.manager.submit_evidence(&request.id, evidence).await {
        Ok(()) => (
            StatusCode::OK,
            Html(message_page(
                "Documents received",
                "A reviewer will look at your submission shortly. You will get a direct \
                 message with the outcome.",
            )),
        ),
        Err(VerificationError::InvalidState { .. })
        | Err(VerificationError::AlreadyDecided { .. }) => (
            StatusCode::CONFLICT,
            Html(message_page("Already decided", "This request has already been decided.")),
        ),
        Err(e) => {
            error!("Evidence submission failed for request {}: {}", request.id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(message_page("Something went wrong", "Try again in a moment.")),
            )
        }
    }
}

// --- pages ---

const PAGE_STYLE: &str = r#"
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
        }
        .container {
            background: white;
            padding: 40px;
            border-radius: 16px;
            box-shadow: 0 10px 40px rgba(0,0,0,0.2);
            text-align: center;
            max-width: 420px;
        }
        h1 { color: #333; margin-bottom: 10px; }
        p { color: #666; }
        input, button {
            width: 100%;
            margin-top: 12px;
            padding: 10px;
            border-radius: 8px;
            border: 1px solid #ccc;
            box-sizing: border-box;
        }
        button {
            background: #5865F2;
            color: white;
            border: none;
            font-weight: 600;
            cursor: pointer;
        }
"#;

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>{PAGE_STYLE}</style>
</head>
<body>
    <div class="container">
{body}
    </div>
</body>
</html>"#
    )
}

fn message_page(header: &str, text: &str) -> String {
    page(header, &format!("<h1>{}</h1>\n<p>{}</p>", header, text))
}

fn login_page(oauth: &OAuthState, secret: &str) -> String {
    let body = format!(
        r#"<h1>Student verification</h1>
<p>Sign in with your university account to link it with your Discord membership.</p>
<div id="g_id_onload"
     data-client_id="{client_id}"
     data-login_uri="{base_url}/login"
     data-state="{secret}"></div>
<div class="g_id_signin" data-type="standard"></div>
<script src="https://accounts.google.com/gsi/client" async defer></script>"#,
        client_id = oauth.client_id,
        base_url = oauth.base_url,
        secret = secret,
    );
    page("Student verification", &body)
}

fn documents_form_page(secret: &str, already_submitted: bool) -> String {
    let note = if already_submitted {
        "<p>Your documents are in review. Uploading again replaces the previous submission \
         only if the request has not been decided.</p>"
    } else {
        "<p>Upload photos of both sides of your student ID card.</p>"
    };
    let body = format!(
        r#"<h1>Submit your student ID</h1>
{note}
<input type="file" id="front" accept="image/*">
<input type="file" id="back" accept="image/*">
<input type="email" id="email" placeholder="Contact email (optional)">
<button onclick="submitDocs()">Submit</button>
<p id="status"></p>
<script>
async function encode(input) {{
    const file = input.files[0];
    const buf = await file.arrayBuffer();
    const data = btoa(String.fromCharCode(...new Uint8Array(buf)));
    return {{ content_type: file.type, data }};
}}
async function submitDocs() {{
    const status = document.getElementById('status');
    try {{
        const body = {{
            front: await encode(document.getElementById('front')),
            back: await encode(document.getElementById('back')),
            contact_email: document.getElementById('email').value || null,
        }};
        const resp = await fetch('/verify/{secret}/documents', {{
            method: 'POST',
            headers: {{ 'Content-Type': 'application/json' }},
            body: JSON.stringify(body),
        }});
        status.textContent = resp.ok ? 'Documents received!' : 'Upload failed.';
    }} catch (e) {{
        status.textContent = 'Select both photos first.';
    }}
}}
</script>"#,
        note = note,
        secret = secret,
    );
    page("Submit your student ID", &body)
}

fn verified_page(student_number: Option<&str>) -> String {
    let detail = match student_number {
        Some(number) => format!("<p>Linked student number: <b>{}</b></p>", number),
        None => String::new(),
    };
    page(
        "Verified",
        &format!(
            "<h1>Verified!</h1>\n<p>Your role will be granted in a moment. Check your \
             Discord DMs for confirmation.</p>\n{}",
            detail
        ),
    )
}
