//! # Estado da Aplicação Web
//!
//! O [`AppState`] agrega os subsistemas compartilhados por todos os
//! handlers Axum. Tudo é `Arc` — clonar o estado é barato e cada
//! handler enxerga as mesmas instâncias.
//!
//! ```text
//! AppState
//!   ├── config      — configuração congelada do startup
//!   ├── store       — índice vetorial (embutido ou Qdrant)
//!   ├── embedder    — cliente de embeddings (cache LRU de queries)
//!   ├── retrieval   — núcleo de consulta (cache + telemetria)
//!   ├── ingestor    — pipeline de uploads + mapa de tasks
//!   ├── ocr         — pool compartilhado de OCR (p/ shutdown)
//!   └── rate_limits — janelas por IP (query / upload)
//! ```

use std::sync::Arc;

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::ingest::Ingestor;
use crate::ocr::OcrEngine;
use crate::retrieval::RetrievalCore;
use crate::store::VectorStore;
use crate::web::rate_limit::RateLimiter;

/// Estado compartilhado da aplicação Axum.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<EmbeddingClient>,
    pub retrieval: Arc<RetrievalCore>,
    pub ingestor: Arc<Ingestor>,
    pub ocr: Arc<OcrEngine>,
    pub rate_limits: Arc<RateLimiter>,
}
