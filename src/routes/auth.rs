use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Extension, Json,
};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    middleware::{auth::get_cookie, csrf, request_id::RequestInfo, tenant::BoundTenant},
    models::{
        audit::AuditEvent,
        user::{
            ForgotPasswordRequest, LoginRequest, RegisterRequest, ResetPasswordRequest,
            UserProfile, VerifyEmailRequest,
        },
    },
    services::auth::{AuthService, IssuedSession, LoginOutcome},
    AppState,
};

pub const ACCESS_COOKIE_MAX_AGE: u32 = 900;
pub const REFRESH_COOKIE_MAX_AGE: u32 = 604800;

/// The three cookies set on every successful credential issuance. The token
/// cookies are HttpOnly and cross-site (SPA on another origin); the CSRF
/// cookie is readable so client script can echo it into the header.
pub fn session_cookies(session: &IssuedSession) -> [String; 3] {
    let csrf_token = csrf::generate_csrf_token();
    [
        format!(
            "access_token={}; Max-Age={ACCESS_COOKIE_MAX_AGE}; Path=/; HttpOnly; Secure; SameSite=None",
            session.access_token
        ),
        format!(
            "refresh_token={}; Max-Age={REFRESH_COOKIE_MAX_AGE}; Path=/; HttpOnly; Secure; SameSite=None",
            session.refresh_token
        ),
        format!("csrf_token={csrf_token}; Max-Age={REFRESH_COOKIE_MAX_AGE}; Path=/; Secure; SameSite=Strict"),
    ]
}

fn cleared_cookies() -> [String; 3] {
    [
        "access_token=; Max-Age=0; Path=/; HttpOnly; Secure; SameSite=None".to_string(),
        "refresh_token=; Max-Age=0; Path=/; HttpOnly; Secure; SameSite=None".to_string(),
        "csrf_token=; Max-Age=0; Path=/; Secure; SameSite=Strict".to_string(),
    ]
}

/// JSON response with Set-Cookie headers attached.
pub fn json_with_cookies(status: StatusCode, body: &Value, cookies: &[String]) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    for cookie in cookies {
        builder = builder.header(header::SET_COOKIE, cookie);
    }
    builder
        .body(Body::from(serde_json::to_string(body).unwrap_or_default()))
        .unwrap_or_default()
}

pub fn session_body(session: &IssuedSession) -> Value {
    let mut user = serde_json::to_value(UserProfile::from(&session.user)).unwrap_or_default();
    if let Value::Object(map) = &mut user {
        map.insert("role".into(), json!(session.role));
    }
    json!({ "user": user })
}

pub async fn register(
    State(state): State<AppState>,
    BoundTenant(ctx): BoundTenant,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<RegisterRequest>,
) -> AppResult<Response> {
    let mut ctx = ctx.0.lock().await;
    let tenant = ctx.tenant.clone();

    let (user, method) = match body.token.clone() {
        Some(token) => {
            let user =
                AuthService::register_invited(ctx.tx()?, &state.config, &body, &token).await?;
            (user, "invitation")
        }
        None => {
            let user = AuthService::register_public(ctx.tx()?, &state.config, &tenant, &body).await?;
            // Public signups start unverified; the proof-of-mailbox email
            // goes out with the registration itself.
            AuthService::request_email_verification(ctx.tx()?, &tenant, &user.email, &info.request_id)
                .await?;
            (user, "public")
        }
    };

    ctx.audit(
        AuditEvent::new("user.registered")
            .actor(user.id)
            .target(user.id)
            .meta("method", method),
    );

    Ok(json_with_cookies(
        StatusCode::CREATED,
        &json!({ "user": UserProfile::from(&user) }),
        &[],
    ))
}

pub async fn login(
    State(state): State<AppState>,
    BoundTenant(ctx): BoundTenant,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<LoginRequest>,
) -> AppResult<Response> {
    let mut ctx = ctx.0.lock().await;
    let tenant = ctx.tenant.clone();

    let outcome = AuthService::login(
        ctx.tx()?,
        &state.db,
        &state.tokens,
        &state.config,
        &tenant,
        &body.email,
        &body.password,
        &info.ip,
        &info.user_agent,
    )
    .await?;

    match outcome {
        LoginOutcome::MfaRequired { pre_auth_token } => Ok(json_with_cookies(
            StatusCode::OK,
            &json!({ "mfa_required": true, "pre_auth_token": pre_auth_token }),
            &[],
        )),
        LoginOutcome::Authenticated(session) => {
            ctx.audit(
                AuditEvent::new("login.success")
                    .actor(session.user.id)
                    .session(session.session_id)
                    .meta("method", "password"),
            );
            Ok(json_with_cookies(
                StatusCode::OK,
                &session_body(&session),
                &session_cookies(&session),
            ))
        }
    }
}

pub async fn refresh(
    State(state): State<AppState>,
    BoundTenant(ctx): BoundTenant,
    Extension(info): Extension<RequestInfo>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let raw = get_cookie(&headers, "refresh_token").ok_or(AppError::InvalidCredentials)?;

    let mut ctx = ctx.0.lock().await;
    let session = AuthService::refresh(
        ctx.tx()?,
        &state.db,
        &state.tokens,
        &state.config,
        &raw,
        &info.ip,
        &info.user_agent,
    )
    .await?;

    Ok(json_with_cookies(
        StatusCode::OK,
        &session_body(&session),
        &session_cookies(&session),
    ))
}

/// Family revocation by refresh cookie. Deliberately unauthenticated: any
/// holder of a refresh token may revoke its family. Idempotent.
pub async fn logout(
    BoundTenant(ctx): BoundTenant,
    headers: HeaderMap,
) -> AppResult<Response> {
    let mut ctx = ctx.0.lock().await;

    if let Some(raw) = get_cookie(&headers, "refresh_token") {
        if let Some(record) = AuthService::logout(ctx.tx()?, &raw).await? {
            ctx.audit(
                AuditEvent::new("logout")
                    .actor(record.user_id)
                    .session(record.id)
                    .meta("family_id", record.family_id.to_string()),
            );
        }
    }

    Ok(json_with_cookies(
        StatusCode::OK,
        &json!({ "message": "Logged out" }),
        &cleared_cookies(),
    ))
}

/// Uniform success whether or not the account exists.
pub async fn forgot_password(
    BoundTenant(ctx): BoundTenant,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<ForgotPasswordRequest>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let tenant = ctx.tenant.clone();
    AuthService::request_password_reset(ctx.tx()?, &tenant, &body.email, &info.request_id).await?;
    Ok(Json(json!({
        "message": "If the account exists, a reset email has been sent"
    })))
}

pub async fn reset_password(
    State(state): State<AppState>,
    BoundTenant(ctx): BoundTenant,
    Json(body): Json<ResetPasswordRequest>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    AuthService::reset_password(ctx.tx()?, &state.config, &body.token, &body.new_password).await?;
    ctx.audit(AuditEvent::new("password.reset"));
    Ok(Json(json!({ "message": "Password updated" })))
}

/// Uniform success whether or not the account exists or is already verified.
pub async fn resend_verification(
    BoundTenant(ctx): BoundTenant,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<ForgotPasswordRequest>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let tenant = ctx.tenant.clone();
    AuthService::request_email_verification(ctx.tx()?, &tenant, &body.email, &info.request_id)
        .await?;
    Ok(Json(json!({
        "message": "If the account exists, a verification email has been sent"
    })))
}

pub async fn verify_email(
    BoundTenant(ctx): BoundTenant,
    Json(body): Json<VerifyEmailRequest>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let user_id = AuthService::verify_email(ctx.tx()?, &body.token).await?;
    ctx.audit(AuditEvent::new("email.verified").actor(user_id).target(user_id));
    Ok(Json(json!({ "message": "Email verified" })))
}
