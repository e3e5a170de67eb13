//! # Configuração — Variáveis de Ambiente
//!
//! Toda a configuração do serviço vem do ambiente, lida uma única vez
//! no startup via [`Config::from_env()`]. Um `.env` local é carregado
//! antes (via `dotenvy`, em `main()`). Valores numéricos inválidos
//! caem no default com um warning — o serviço nunca deixa de subir por
//! causa de um número mal formatado.
//!
//! ## Variáveis Principais
//!
//! | Variável | Default | Uso |
//! |----------|---------|-----|
//! | `PORT` | 3000 | Porta do servidor HTTP |
//! | `DATA_PATH` | `data` | Snapshot + append-log do índice |
//! | `PDF_PATH` | `data/pdfs` | PDFs enviados |
//! | `VECTOR_BACKEND` | `embedded` | `embedded` ou `qdrant` |
//! | `GEMINI_API_KEY` | — | Chave dos provedores de embedding/geração |
//! | `OCR_MODE` | `tesseract` | `tesseract` ou `vision` |

use std::path::PathBuf;

/// Backend do índice vetorial, escolhido no startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorBackend {
    /// Store embutido: snapshot JSON + append-log em disco.
    Embedded,
    /// Adaptador fino sobre um serviço Qdrant remoto.
    Qdrant,
}

/// Modo de OCR para páginas fracas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OcrMode {
    /// Binário `tesseract` do sistema (por+eng), pool de workers.
    Tesseract,
    /// Modelo de visão (transcrição Markdown literal por página).
    Vision,
}

/// Configuração completa do serviço, congelada no startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Diretório de dados (snapshot + append-log).
    pub data_path: PathBuf,
    /// Diretório dos PDFs enviados.
    pub pdf_path: PathBuf,
    /// Origens permitidas no CORS (vazio = qualquer origem).
    pub allowed_origins: Vec<String>,
    /// Chave de usuário (`x-api-key`). Vazia = tier desabilitado.
    pub api_key: String,
    /// Chave de administrador. Vazia = tier desabilitado.
    pub admin_api_key: String,

    // ── Provedores externos ──
    pub gemini_api_key: String,
    pub embed_model: String,
    pub chat_model: String,
    /// Dimensão dos embeddings (D).
    pub embed_dim: usize,
    pub embed_batch_size: usize,
    pub embed_concurrency: usize,

    // ── OCR ──
    pub ocr_mode: OcrMode,
    pub ocr_workers: usize,
    pub ocr_page_timeout_ms: u64,
    pub ocr_global_timeout_ms: u64,
    /// Escala de rasterização das páginas fracas, clampada em [1.0, 3.0].
    pub pdf_img_scale: f32,

    /// Teto supervisório da extração por upload (piso de 60 s).
    pub upload_extract_timeout_ms: u64,
    /// Teto de tamanho de upload em bytes.
    pub max_upload_bytes: usize,

    // ── Backend vetorial ──
    pub vector_backend: VectorBackend,
    pub qdrant_url: String,
    pub qdrant_api_key: String,
    pub qdrant_collection: String,
    /// Dimensão dos vetores da collection remota (default = `embed_dim`).
    pub qdrant_vector_size: usize,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Lê uma variável numérica, caindo no default (com warning) se inválida.
fn env_num<T: std::str::FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = key, valor = %raw, default = %default, "Valor inválido, usando default");
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    /// Monta a configuração a partir do ambiente.
    pub fn from_env() -> Self {
        let vector_backend = match env_or("VECTOR_BACKEND", "embedded").to_lowercase().as_str() {
            "qdrant" => VectorBackend::Qdrant,
            _ => VectorBackend::Embedded,
        };
        let ocr_mode = match env_or("OCR_MODE", "tesseract").to_lowercase().as_str() {
            "vision" => OcrMode::Vision,
            _ => OcrMode::Tesseract,
        };

        let allowed_origins: Vec<String> = env_or("ALLOWED_ORIGINS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        // Workers de OCR: default 4, teto 8 (cada worker é single-threaded).
        let ocr_workers = env_num("OCR_WORKERS", 4usize).clamp(1, 8);

        // Teto supervisório com piso — um valor baixo demais mataria
        // qualquer extração com OCR antes de terminar.
        let upload_extract_timeout_ms =
            env_num("UPLOAD_EXTRACT_TIMEOUT_MS", 45 * 60 * 1000u64).max(60_000);

        let embed_dim = env_num("EMBED_DIM", 3072usize);

        Self {
            port: env_num("PORT", 3000u16),
            data_path: PathBuf::from(env_or("DATA_PATH", "data")),
            pdf_path: PathBuf::from(env_or("PDF_PATH", "data/pdfs")),
            allowed_origins,
            api_key: env_or("API_KEY", ""),
            admin_api_key: env_or("ADMIN_API_KEY", ""),
            gemini_api_key: env_or("GEMINI_API_KEY", ""),
            embed_model: env_or("GEMINI_EMBED_MODEL", "gemini-embedding-001"),
            chat_model: env_or("GEMINI_CHAT_MODEL", "gemini-2.0-flash"),
            embed_dim,
            embed_batch_size: env_num("EMBED_BATCH_SIZE", 32usize).max(1),
            embed_concurrency: env_num("EMBED_CONCURRENCY", 8usize).max(1),
            ocr_mode,
            ocr_workers,
            ocr_page_timeout_ms: env_num("OCR_PAGE_TIMEOUT_MS", 60_000u64),
            ocr_global_timeout_ms: env_num("OCR_GLOBAL_TIMEOUT_MS", 30 * 60 * 1000u64),
            pdf_img_scale: env_num("PDF_IMG_SCALE", 1.5f32).clamp(1.0, 3.0),
            upload_extract_timeout_ms,
            max_upload_bytes: env_num("MAX_UPLOAD_BYTES", 100 * 1024 * 1024usize),
            vector_backend,
            qdrant_url: env_or("QDRANT_URL", "http://localhost:6333"),
            qdrant_api_key: env_or("QDRANT_API_KEY", ""),
            qdrant_collection: env_or("QDRANT_COLLECTION", "manuais"),
            qdrant_vector_size: env_num("QDRANT_VECTOR_SIZE", embed_dim),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Valores ausentes caem nos defaults documentados.
    #[test]
    fn test_defaults() {
        let cfg = Config::from_env();
        assert_eq!(cfg.embed_dim, 3072);
        assert_eq!(cfg.embed_batch_size, 32);
        assert!(cfg.ocr_workers >= 1 && cfg.ocr_workers <= 8);
        assert!(cfg.upload_extract_timeout_ms >= 60_000);
        assert!(cfg.pdf_img_scale >= 1.0 && cfg.pdf_img_scale <= 3.0);
    }
}
