#![allow(dead_code)]
#![allow(rustdoc::broken_intra_doc_links, rustdoc::invalid_html_tags)]
//! # Manual Chat — QA sobre Manuais Técnicos em PDF
//!
//! **Ponto de entrada principal** do serviço de perguntas e respostas
//! sobre manuais técnicos de elevadores.
//!
//! Este arquivo inicializa todos os componentes e sobe o servidor web.
//! A arquitetura segue um padrão de inicialização em duas fases:
//!
//! 1. **Fase imediata**: o servidor axum começa a aceitar conexões na
//!    porta configurada instantaneamente
//! 2. **Fase background**: o índice vetorial (snapshot + append-log, ou
//!    a collection remota) é carregado em uma task separada, sem
//!    bloquear o servidor — enquanto carrega, `/api/health` reporta o
//!    progresso e as buscas respondem 503
//!
//! ## Fluxo de Inicialização
//!
//! ```text
//! main()
//!   ├── Configura tracing/logging
//!   ├── Lê Config do ambiente
//!   ├── Constrói clientes (embeddings, geração), OCR, extrator
//!   ├── Constrói o backend do índice (embedded | qdrant)
//!   ├── Monta AppState e Router
//!   ├── Inicia servidor TCP
//!   ├── Spawn background: store.load()
//!   └── Ctrl-C → encerra o pool de OCR e sai
//! ```
//!
//! ## Exemplo de Uso
//!
//! ```bash
//! GEMINI_API_KEY=... cargo run
//!
//! # Logs detalhados
//! RUST_LOG=debug GEMINI_API_KEY=... cargo run
//! ```

/// Módulo `brands` — tabela canônica de fabricantes.
mod brands;

/// Módulo `chunker` — divisão do texto em unidades de recuperação.
mod chunker;

/// Módulo `config` — configuração via ambiente.
mod config;

/// Módulo `embedding` — cliente da API de embeddings.
mod embedding;

/// Módulo `encoding` — reparo de mojibake nas respostas.
mod encoding;

/// Módulo `error` — taxonomia de erros da API.
mod error;

/// Módulo `generation` — cliente do modelo generativo.
mod generation;

/// Módulo `ingest` — orquestrador do pipeline de ingestão.
mod ingest;

/// Módulo `ocr` — pool de workers de OCR.
mod ocr;

/// Módulo `pdf` — extração de texto com OCR seletivo.
mod pdf;

/// Módulo `retrieval` — núcleo de consulta e montagem de resposta.
mod retrieval;

/// Módulo `store` — índice vetorial persistente (dois backends).
mod store;

/// Módulo `telemetry` — ring buffer de telemetria de consultas.
mod telemetry;

/// Módulo `web` — servidor axum, handlers, auth e rate limit.
mod web;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::generation::GenerationClient;
use crate::ingest::Ingestor;
use crate::ocr::OcrEngine;
use crate::pdf::PdfExtractor;
use crate::retrieval::RetrievalCore;
use crate::web::rate_limit::RateLimiter;
use crate::web::state::AppState;

/// Função principal do serviço.
///
/// # Erros
///
/// Retorna erro se não conseguir fazer bind na porta configurada ou se
/// o servidor axum falhar durante a execução.
#[tokio::main]
async fn main() -> Result<()> {
    // Carrega variáveis de um .env local, se existir, antes de ler a
    // configuração — sem erro quando o arquivo não está presente.
    dotenvy::dotenv().ok();

    // Logging estruturado; RUST_LOG controla o nível.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("📚 Manual Chat — Starting...");

    let config = Arc::new(Config::from_env());
    if config.gemini_api_key.is_empty() {
        tracing::warn!("GEMINI_API_KEY vazio — embeddings e geração vão falhar");
    }

    // ── Clientes e subsistemas ──
    let embedder = Arc::new(EmbeddingClient::new(&config));
    let generator = Arc::new(GenerationClient::new(&config));
    let ocr = Arc::new(OcrEngine::new(&config, generator.clone()));
    let extractor = Arc::new(PdfExtractor::new(ocr.clone(), config.pdf_img_scale));

    let store = store::build_store(&config);
    let ingestor = Ingestor::new(
        (*config).clone(),
        store.clone(),
        embedder.clone(),
        extractor,
    );
    let retrieval = Arc::new(RetrievalCore::new(
        store.clone(),
        embedder.clone(),
        generator.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        embedder,
        retrieval,
        ingestor,
        ocr: ocr.clone(),
        rate_limits: Arc::new(RateLimiter::new()),
    };

    let app = web::create_router(state);

    // O servidor aceita conexões IMEDIATAMENTE; o índice carrega em
    // background e o health expõe o progresso.
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(backend = ?config.vector_backend, "🚀 Server running at http://{}", addr);

    {
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.load().await {
                tracing::error!(error = %e, "Load inicial do índice falhou");
            }
        });
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(ocr))
    .await?;

    Ok(())
}

/// Espera ctrl-c e desmonta os recursos compartilhados — o pool de OCR
/// é encerrado antes do processo sair.
async fn shutdown_signal(ocr: Arc<OcrEngine>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Encerrando: desligando pool de OCR");
    ocr.terminate().await;
}
