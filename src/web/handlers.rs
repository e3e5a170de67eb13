//! # Handlers HTTP — Os Endpoints da API
//!
//! Cada função pública é um handler Axum, mapeado a uma rota em
//! [`super::create_router()`]. Tudo fala JSON.
//!
//! | Handler | Método/Rota | Tier |
//! |---------|-------------|------|
//! | `health` | GET `/api/health` | — |
//! | `stats` | GET `/api/stats` | user |
//! | `documents` | GET `/api/documents` | user |
//! | `check_duplicates` | POST `/api/check-duplicates` | admin |
//! | `upload` | POST `/api/upload` (multipart) | admin |
//! | `upload_status` | GET `/api/upload/status/{taskId}` | admin |
//! | `reindex` | POST `/api/reindex` | admin |
//! | `query` | POST `/api/query` | user |
//! | `search` | POST `/api/search` | user |
//! | `clear` | DELETE `/api/clear` | admin |
//! | `clear_all` | DELETE `/api/clear-all` | admin |
//! | `import_data` | POST `/api/import-data` (NDJSON) | admin |
//! | `compact` | POST `/api/compact` | admin |
//! | `telemetry` | GET `/api/telemetry/rag` | admin |
//! | `remove_sources` | DELETE `/api/remove-sources` | admin |
//! | `export` | GET `/api/export` | admin |
//!
//! ## Índice Carregando
//!
//! Enquanto o load inicial roda: `/api/search` devolve 503,
//! `/api/query` devolve 200 com mensagem amigável, `/api/reindex`
//! devolve 409. O `/api/health` expõe o progresso.

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::ingest::{AdmitOutcome, DiskDocument, IngestionTask, ReindexReport};
use crate::retrieval::{HistoryMessage, QueryError, QueryResponse};
use crate::store::{SearchHit, StoreError};
use crate::telemetry::QueryTelemetry;

use super::state::AppState;

/// Teto de caracteres de uma pergunta.
const MAX_QUESTION_CHARS: usize = 2000;

fn store_err(e: StoreError) -> ApiError {
    match e {
        StoreError::NotReady(p) => ApiError::NotReady(p),
        StoreError::Backend(e) => ApiError::Internal(e),
    }
}

// ─── Saúde e listagens ───────────────────────────────────────────

/// GET `/api/health` — status do serviço e progresso do load.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    match state.store.loading_progress() {
        Some(progress) => Json(json!({ "status": "loading", "loadingProgress": progress })),
        None => Json(json!({ "status": "ok" })),
    }
}

/// GET `/api/stats` — tamanho do índice.
pub async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = state.store.stats().await.map_err(store_err)?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

/// GET `/api/documents` — PDFs presentes em disco.
pub async fn documents(State(state): State<AppState>) -> Json<Vec<DiskDocument>> {
    Json(state.ingestor.list_documents())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDuplicatesRequest {
    pub file_names: Vec<String>,
}

/// POST `/api/check-duplicates` — separa nomes já indexados dos novos.
pub async fn check_duplicates(
    State(state): State<AppState>,
    Json(body): Json<CheckDuplicatesRequest>,
) -> Result<Json<Value>, ApiError> {
    if state.store.loading_progress().is_some() {
        return Ok(Json(
            json!({ "duplicates": [], "newFiles": [], "loading": true }),
        ));
    }
    let mut duplicates = Vec::new();
    let mut new_files = Vec::new();
    for name in body.file_names {
        if state.store.has_source(&name).await.map_err(store_err)? {
            duplicates.push(name);
        } else {
            new_files.push(name);
        }
    }
    Ok(Json(
        json!({ "duplicates": duplicates, "newFiles": new_files, "loading": false }),
    ))
}

// ─── Upload ──────────────────────────────────────────────────────

/// POST `/api/upload` — multipart `pdf` + campo `brandName` opcional.
///
/// Responde com `{taskId}` antes de qualquer processamento pesado, ou
/// `{skipped: true}` quando a fonte já está indexada.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut pdf_bytes: Option<Vec<u8>> = None;
    let mut filename = String::new();
    let mut brand_param: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("multipart inválido: {}", e)))?
    {
        match field.name().unwrap_or("") {
            "pdf" => {
                filename = field
                    .file_name()
                    .unwrap_or("documento.pdf")
                    .to_string();
                let content_type = field.content_type().map(|c| c.to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(format!("falha ao ler upload: {}", e)))?;

                // Admissão: só PDF, abaixo do teto de tamanho.
                let looks_pdf = content_type
                    .as_deref()
                    .map(|c| c.contains("pdf"))
                    .unwrap_or(false)
                    || filename.to_lowercase().ends_with(".pdf");
                if !looks_pdf {
                    return Err(ApiError::Validation("apenas arquivos PDF são aceitos".into()));
                }
                if bytes.len() > state.config.max_upload_bytes {
                    return Err(ApiError::Validation(format!(
                        "arquivo acima do limite de {} bytes",
                        state.config.max_upload_bytes
                    )));
                }
                pdf_bytes = Some(bytes.to_vec());
            }
            "brandName" => {
                brand_param = field.text().await.ok().filter(|t| !t.trim().is_empty());
            }
            _ => {}
        }
    }

    let bytes = pdf_bytes
        .ok_or_else(|| ApiError::Validation("campo multipart 'pdf' ausente".into()))?;

    tracing::info!(arquivo = %filename, bytes = bytes.len(), "Upload recebido");
    match state
        .ingestor
        .clone()
        .admit(&filename, bytes, brand_param)
        .await
        .map_err(store_err)?
    {
        AdmitOutcome::Accepted { task_id, filename } => {
            // O nome devolvido é a chave de fonte normalizada — o mesmo
            // valor que /api/check-duplicates e has_source consultam.
            Ok(Json(json!({ "taskId": task_id, "filename": filename })))
        }
        AdmitOutcome::Skipped { filename } => {
            Ok(Json(json!({ "skipped": true, "filename": filename })))
        }
    }
}

/// GET `/api/upload/status/{taskId}` — snapshot do task.
pub async fn upload_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<IngestionTask>, ApiError> {
    state
        .ingestor
        .task(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task {} não encontrado", task_id)))
}

// ─── Reindex / import / manutenção ───────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexRequest {
    #[serde(default)]
    pub include_regex: Option<String>,
    #[serde(default)]
    pub brand_name: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// POST `/api/reindex` — reprocessa PDFs do disco que casam com o filtro.
pub async fn reindex(
    State(state): State<AppState>,
    Json(body): Json<ReindexRequest>,
) -> Result<Json<ReindexReport>, ApiError> {
    // Reindex durante o load inicial conflita com o replay do log.
    if let Some(progress) = state.store.loading_progress() {
        return Err(ApiError::Conflict(format!(
            "índice ainda carregando {}",
            progress
        )));
    }
    let report = state
        .ingestor
        .clone()
        .reindex(
            body.include_regex.as_deref(),
            body.brand_name.as_deref(),
            body.dry_run,
        )
        .await
        .map_err(store_err)?;
    Ok(Json(report))
}

/// POST `/api/import-data` — carga NDJSON sem re-embedding.
pub async fn import_data(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let report = state.ingestor.import_ndjson(&body).await.map_err(store_err)?;
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

/// DELETE `/api/clear` — esvazia o índice.
pub async fn clear(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.store.clear().await.map_err(store_err)?;
    Ok(Json(json!({ "cleared": true })))
}

/// DELETE `/api/clear-all` — esvazia o índice e apaga os PDFs do disco.
pub async fn clear_all(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.store.clear().await.map_err(store_err)?;
    let removed_files = state.ingestor.delete_all_pdfs().map_err(ApiError::Internal)?;
    Ok(Json(json!({ "cleared": true, "removedFiles": removed_files })))
}

/// POST `/api/compact` — dobra o append-log no snapshot.
pub async fn compact(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let outcome = state.store.compact().await.map_err(store_err)?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct RemoveSourcesRequest {
    pub names: Vec<String>,
}

/// DELETE `/api/remove-sources` — remoção escopada por fonte.
pub async fn remove_sources(
    State(state): State<AppState>,
    Json(body): Json<RemoveSourcesRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.names.is_empty() {
        return Err(ApiError::Validation("lista de fontes vazia".into()));
    }
    let outcome = state
        .store
        .remove_sources(&body.names)
        .await
        .map_err(store_err)?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct ExportParams {
    #[serde(default = "default_export_limit")]
    pub limit: usize,
    #[serde(default)]
    pub brand: Option<String>,
}

fn default_export_limit() -> usize {
    1000
}

/// GET `/api/export` — chunks para geração de eval-sets.
pub async fn export(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Json<Value>, ApiError> {
    let chunks = state
        .store
        .export_corpus(params.limit, params.brand.as_deref())
        .await
        .map_err(store_err)?;
    Ok(Json(json!({ "total": chunks.len(), "chunks": chunks })))
}

// ─── Consulta ────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub question: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub brand_filter: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<HistoryMessage>,
}

fn default_top_k() -> usize {
    5
}

/// POST `/api/query` — pergunta → resposta fundamentada com fontes.
pub async fn query(
    State(state): State<AppState>,
    Json(body): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let question = body.question.trim();
    if question.is_empty() {
        return Err(ApiError::Validation("pergunta vazia".into()));
    }
    if question.chars().count() > MAX_QUESTION_CHARS {
        return Err(ApiError::Validation(format!(
            "pergunta acima de {} caracteres",
            MAX_QUESTION_CHARS
        )));
    }

    let result = state
        .retrieval
        .answer_question(
            question,
            body.top_k,
            body.brand_filter.as_deref().filter(|b| !b.trim().is_empty()),
            &body.conversation_history,
        )
        .await;

    match result {
        Ok(response) => Ok(Json(response)),
        // Índice carregando: resposta suave, não erro.
        Err(QueryError::NotReady(progress)) => Ok(Json(QueryResponse {
            answer: format!(
                "O índice de manuais ainda está carregando {}. Tente novamente em instantes.",
                progress
            ),
            sources: Vec::new(),
            search_time_ms: 0,
            from_cache: false,
            clarification: false,
        })),
        Err(QueryError::Upstream(msg)) => Err(ApiError::Upstream(msg)),
        Err(QueryError::Internal(e)) => Err(ApiError::Internal(e)),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub search_time_ms: u64,
}

/// POST `/api/search` — busca vetorial crua, sem geração.
pub async fn search(
    State(state): State<AppState>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let text = body.query.trim();
    if text.is_empty() {
        return Err(ApiError::Validation("consulta vazia".into()));
    }
    let started = std::time::Instant::now();
    let vector = state
        .embedder
        .embed_one(text)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    let outcome = state
        .store
        .search(&vector, body.top_k.clamp(1, 50), None)
        .await
        .map_err(store_err)?;
    Ok(Json(SearchResponse {
        results: outcome.hits,
        search_time_ms: started.elapsed().as_millis() as u64,
    }))
}

/// GET `/api/telemetry/rag` — ring buffer de telemetria.
pub async fn telemetry(State(state): State<AppState>) -> Json<Vec<QueryTelemetry>> {
    Json(state.retrieval.telemetry_snapshot())
}
