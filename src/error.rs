//! # Erros da API — Taxonomia e Conversão HTTP
//!
//! O [`ApiError`] é a taxonomia única de falhas visíveis ao cliente.
//! Cada variante carrega a mensagem legível e mapeia para um status
//! HTTP estável com corpo JSON `{"error": ..., "message": ...}`.
//!
//! | Variante | Status | Quando |
//! |----------|--------|--------|
//! | `Validation` | 400 | Request malformado, arquivo não-PDF, payload grande demais |
//! | `Unauthorized` | 401 | Chave ausente |
//! | `Forbidden` | 403 | Chave inválida ou sem privilégio |
//! | `NotFound` | 404 | Task ou recurso inexistente |
//! | `Conflict` | 409 | Reindex durante o load inicial |
//! | `TooManyRequests` | 429 | Rate limit por IP |
//! | `NotReady` | 503 | Índice ainda carregando |
//! | `Upstream` | 502 | Provedor de embedding/geração falhou |
//! | `Internal` | 500 | Qualquer exceção não tratada |
//!
//! Falhas internas de ingestão **não** passam por aqui — depois do
//! `taskId` ser devolvido, elas só aparecem em `/api/upload/status/:id`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Erro visível ao cliente HTTP.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("chave de API ausente")]
    Unauthorized,

    #[error("chave de API inválida")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("limite de requisições excedido")]
    TooManyRequests,

    #[error("índice ainda carregando: {0}")]
    NotReady(String),

    #[error("falha no provedor externo: {0}")]
    Upstream(String),

    #[error("erro interno")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rótulo estável da variante, usado no campo `error` do corpo JSON.
    fn label(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::TooManyRequests => "rate_limited",
            ApiError::NotReady(_) => "not_ready",
            ApiError::Upstream(_) => "upstream",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Erros internos vão para o log com a causa completa; o cliente
        // recebe apenas a mensagem genérica.
        if let ApiError::Internal(ref e) = self {
            tracing::error!(error = %e, "Erro interno na API");
        }
        let body = json!({ "error": self.label(), "message": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}
