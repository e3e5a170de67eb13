//! # Autenticação — Dois Tiers de Chave
//!
//! Duas chaves, dois níveis: `API_KEY` (usuário) e `ADMIN_API_KEY`
//! (administrador). A chave chega em `x-api-key` ou
//! `Authorization: Bearer …`.
//!
//! Uma variável de ambiente **vazia** desabilita a exigência daquele
//! tier — é o modo de desenvolvimento local. A chave de admin também
//! passa nos endpoints de usuário.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::web::state::AppState;

/// Extrai a chave apresentada no request, se houver.
fn presented_key(req: &Request) -> Option<String> {
    if let Some(v) = req.headers().get("x-api-key") {
        if let Ok(s) = v.to_str() {
            return Some(s.trim().to_string());
        }
    }
    let auth = req.headers().get(axum::http::header::AUTHORIZATION)?;
    let raw = auth.to_str().ok()?;
    raw.strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
}

fn check(expected: &[&str], req: &Request) -> Result<(), ApiError> {
    // Tier desabilitado quando todas as chaves esperadas são vazias.
    if expected.iter().all(|k| k.is_empty()) {
        return Ok(());
    }
    match presented_key(req) {
        Some(key) if expected.iter().any(|k| !k.is_empty() && **k == key) => Ok(()),
        Some(_) => Err(ApiError::Forbidden),
        None => Err(ApiError::Unauthorized),
    }
}

/// Middleware do tier usuário (a chave de admin também vale).
pub async fn require_user(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    check(
        &[state.config.api_key.as_str(), state.config.admin_api_key.as_str()],
        &req,
    )?;
    Ok(next.run(req).await)
}

/// Middleware do tier administrador.
pub async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    check(&[state.config.admin_api_key.as_str()], &req)?;
    Ok(next.run(req).await)
}
