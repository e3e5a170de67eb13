//! # Módulo Web — A Superfície HTTP do Serviço
//!
//! Organiza toda a camada web, construída com **Axum** + **tower-http**.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Cliente (admin UI / integrações)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Axum Router (este módulo)                                   │
//! │  ├── GET    /api/health            → sem auth               │
//! │  ├── POST   /api/query             → user + 30/min/IP       │
//! │  ├── POST   /api/search            → user                   │
//! │  ├── GET    /api/stats             → user                   │
//! │  ├── GET    /api/documents         → user                   │
//! │  ├── POST   /api/upload            → admin + 100/min/IP     │
//! │  ├── GET    /api/upload/status/{id}→ admin                  │
//! │  ├── POST   /api/check-duplicates  → admin                  │
//! │  ├── POST   /api/reindex           → admin                  │
//! │  ├── POST   /api/import-data       → admin (NDJSON)         │
//! │  ├── POST   /api/compact           → admin                  │
//! │  ├── DELETE /api/clear             → admin                  │
//! │  ├── DELETE /api/clear-all         → admin                  │
//! │  ├── DELETE /api/remove-sources    → admin                  │
//! │  ├── GET    /api/export            → admin                  │
//! │  └── GET    /api/telemetry/rag     → admin                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ CORS (ALLOWED_ORIGINS) · limites de corpo por rota          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submódulos
//!
//! | Módulo | Responsabilidade |
//! |--------|------------------|
//! | [`state`] | Estado compartilhado (`AppState`) |
//! | [`handlers`] | Handlers de cada rota |
//! | [`auth`] | Chaves user/admin (`x-api-key` / Bearer) |
//! | [`rate_limit`] | Janela fixa por IP |

pub mod auth;
pub mod handlers;
pub mod rate_limit;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use state::AppState;

/// Limite de corpo do import NDJSON (transferências entre deployments).
const IMPORT_BODY_LIMIT: usize = 512 * 1024 * 1024;

/// Cria o router Axum com todas as rotas e camadas.
pub fn create_router(state: AppState) -> Router {
    // ── CORS: origens explícitas, ou aberto quando não configurado ──
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // ── Rotas de usuário ──
    let user_routes = Router::new()
        .route("/api/stats", get(handlers::stats))
        .route("/api/documents", get(handlers::documents))
        .route("/api/search", post(handlers::search))
        .layer(from_fn_with_state(state.clone(), auth::require_user));

    // Consulta tem rate limit próprio (30/min/IP).
    let query_route = Router::new()
        .route("/api/query", post(handlers::query))
        .layer(from_fn_with_state(state.clone(), auth::require_user))
        .layer(from_fn_with_state(state.clone(), rate_limit::limit_query));

    // ── Rotas administrativas ──
    let upload_route = Router::new()
        .route("/api/upload", post(handlers::upload))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes + 1024 * 1024))
        .layer(from_fn_with_state(state.clone(), auth::require_admin))
        .layer(from_fn_with_state(state.clone(), rate_limit::limit_upload));

    let import_route = Router::new()
        .route("/api/import-data", post(handlers::import_data))
        .layer(DefaultBodyLimit::max(IMPORT_BODY_LIMIT))
        .layer(from_fn_with_state(state.clone(), auth::require_admin));

    let admin_routes = Router::new()
        .route("/api/check-duplicates", post(handlers::check_duplicates))
        .route("/api/upload/status/{task_id}", get(handlers::upload_status))
        .route("/api/reindex", post(handlers::reindex))
        .route("/api/clear", delete(handlers::clear))
        .route("/api/clear-all", delete(handlers::clear_all))
        .route("/api/compact", post(handlers::compact))
        .route("/api/remove-sources", delete(handlers::remove_sources))
        .route("/api/export", get(handlers::export))
        .route("/api/telemetry/rag", get(handlers::telemetry))
        .layer(from_fn_with_state(state.clone(), auth::require_admin));

    Router::new()
        .route("/api/health", get(handlers::health))
        .merge(user_routes)
        .merge(query_route)
        .merge(upload_route)
        .merge(import_route)
        .merge(admin_routes)
        .layer(cors)
        .with_state(state)
}
