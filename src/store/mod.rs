//! # Vector Store — Índice Persistente de Chunks
//!
//! O índice vetorial aparece em duas encarnações intercambiáveis,
//! escolhidas no startup via `VECTOR_BACKEND`:
//!
//! | Backend | Módulo | Persistência |
//! |---------|--------|--------------|
//! | Embutido | [`embedded`] | snapshot JSON + append-log NDJSON |
//! | Remoto | [`qdrant`] | serviço Qdrant via HTTP |
//!
//! Todos os consumidores enxergam apenas o trait [`VectorStore`];
//! exatamente uma implementação é construída em `main()`.
//!
//! ## Modelo de Dados
//!
//! Cada registro é um [`Chunk`]: `(id, content, metadata, embedding)`.
//! O "documento" não tem linha própria — existe como classe de
//! equivalência dos chunks que compartilham `metadata.source`.

pub mod bm25;
pub mod embedded;
pub mod qdrant;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Config, VectorBackend};

/// Família do chunk — decide como ele foi recortado do texto.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    /// Recorte por seção + janela com overlap.
    Semantic,
    /// Janela deslizante sobre a página inteira.
    PageWindow,
    /// Contexto em volta de um código de falha, preservado verbatim.
    FaultCode,
    /// Janela única sobre o texto inteiro quando nada mais rendeu chunks.
    Fallback,
}

/// Metadados estruturados de um chunk.
///
/// `(source, chunk_index)` é único dentro do índice a qualquer momento.
/// `source` é o nome visível ao usuário (prefixo de upload removido) e
/// é a chave usada por todas as operações escopadas por fonte.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub chunk_index: usize,
    pub chunk_type: ChunkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_code: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub num_pages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reindexed_at: Option<String>,
    #[serde(default)]
    pub ocr_used: bool,
    #[serde(default)]
    pub ocr_partial: bool,
}

/// Unidade de recuperação: texto + metadados (o embedding anda separado).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// Resultado individual de uma busca (vetorial ou lexical).
#[derive(Clone, Debug, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub similarity: f32,
}

/// Resultado completo de uma busca vetorial.
///
/// `brand_fallback = true` indica que o filtro de marca não casou com
/// nenhum candidato e a busca caiu para o índice inteiro.
#[derive(Clone, Debug, Serialize)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub brand_fallback: bool,
}

/// Resultado de `remove_sources`.
#[derive(Clone, Debug, Serialize)]
pub struct RemovalOutcome {
    pub removed: usize,
    pub remaining: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_documents: usize,
    pub collection_name: String,
}

/// Registro completo como persistido — também é o formato de cada linha
/// do import NDJSON e do append-log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub document: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
}

/// Página de um scroll paginado sobre o índice.
#[derive(Clone, Debug)]
pub struct ScrollPage {
    pub records: Vec<StoredRecord>,
    /// Cursor opaco da próxima página; `None` quando acabou.
    pub next: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompactOutcome {
    pub snapshot_records: usize,
    pub folded_from_log: usize,
}

/// Falha de uma operação do índice.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Índice ainda carregando — a mensagem carrega `(loaded / total)`.
    #[error("índice carregando: {0}")]
    NotReady(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Operações comuns aos dois backends.
///
/// Disciplina de concorrência: escritor único (`add`, `remove_sources`,
/// `clear`, `compact`), leitores múltiplos (buscas e listagens).
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Prepara o backend: load do disco (embutido) ou garantia da
    /// collection (remoto). Roda em background no startup.
    async fn load(&self) -> StoreResult<()>;

    /// Inserção durável de chunks alinhados 1-a-1 com seus embeddings.
    /// Duplicatas por `id` são sobrescritas.
    async fn add(&self, chunks: Vec<Chunk>, embeddings: Vec<Vec<f32>>) -> StoreResult<usize>;

    /// Top-k por similaridade cosseno, decrescente.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        brand_filter: Option<&str>,
    ) -> StoreResult<SearchOutcome>;

    /// Busca lexical BM25 sobre um corpus limitado com cache TTL curto.
    async fn lexical_search(
        &self,
        text: &str,
        k: usize,
        brand_filter: Option<&str>,
    ) -> StoreResult<Vec<SearchHit>>;

    /// Match exato primeiro; fallback pelo nome normalizado. Nunca substring.
    async fn has_source(&self, name: &str) -> StoreResult<bool>;

    async fn remove_sources(&self, names: &[String]) -> StoreResult<RemovalOutcome>;

    /// Lista deduplicada dos nomes de fonte indexados.
    async fn indexed_sources(&self) -> StoreResult<Vec<String>>;

    async fn stats(&self) -> StoreResult<StoreStats>;

    /// Lista de chunks para geração de eval-sets.
    async fn export_corpus(
        &self,
        limit: usize,
        brand_filter: Option<&str>,
    ) -> StoreResult<Vec<Chunk>>;

    /// Iterador explícito sobre o índice inteiro, em páginas.
    async fn scroll(&self, cursor: Option<String>, limit: usize) -> StoreResult<ScrollPage>;

    /// Dobra o append-log no snapshot (no-op no backend remoto).
    async fn compact(&self) -> StoreResult<CompactOutcome>;

    async fn clear(&self) -> StoreResult<()>;

    /// `Some("(x / y)")` enquanto o load inicial roda; `None` quando pronto.
    fn loading_progress(&self) -> Option<String>;
}

/// Constrói o backend escolhido na configuração.
pub fn build_store(cfg: &Config) -> Arc<dyn VectorStore> {
    match cfg.vector_backend {
        VectorBackend::Embedded => Arc::new(embedded::EmbeddedStore::new(&cfg.data_path)),
        VectorBackend::Qdrant => Arc::new(qdrant::QdrantStore::new(
            &cfg.qdrant_url,
            &cfg.qdrant_api_key,
            &cfg.qdrant_collection,
            cfg.qdrant_vector_size,
        )),
    }
}

/// Similaridade cosseno entre dois vetores.
///
/// Retorna 0.0 para vetores de tamanhos diferentes, vazios, ou de norma
/// zero — nunca NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Filtro de marca: substring case-insensitive sobre `source ∪ brandName`.
pub fn brand_matches(meta: &ChunkMetadata, filter: &str) -> bool {
    let needle = filter.to_lowercase();
    if meta.source.to_lowercase().contains(&needle) {
        return true;
    }
    meta.brand_name
        .as_deref()
        .map(|b| b.to_lowercase().contains(&needle))
        .unwrap_or(false)
}

/// Remove o prefixo de upload `<millis>-<rand>-` de um nome de arquivo.
pub fn strip_upload_prefix(name: &str) -> String {
    static PREFIX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PREFIX.get_or_init(|| {
        regex::Regex::new(r"^\d{10,14}-[0-9a-z]+-").unwrap()
    });
    re.replace(name, "").into_owned()
}

/// Forma normalizada usada no fallback de `has_source`.
pub fn normalized_source(name: &str) -> String {
    strip_upload_prefix(name).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(source: &str, brand: Option<&str>) -> ChunkMetadata {
        ChunkMetadata {
            source: source.to_string(),
            brand_name: brand.map(|b| b.to_string()),
            page: None,
            chunk_index: 0,
            chunk_type: ChunkType::Semantic,
            fault_code: None,
            title: String::new(),
            num_pages: 0,
            uploaded_at: None,
            reindexed_at: None,
            ocr_used: false,
            ocr_partial: false,
        }
    }

    /// Vetores idênticos têm similaridade 1; mismatch de tamanho dá 0.
    #[test]
    fn test_cosine_basics() {
        let a = vec![1.0, 0.0, 2.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(sim.abs() < 1e-6);
    }

    /// O filtro de marca olha tanto o nome do arquivo quanto o brandName.
    #[test]
    fn test_brand_matches() {
        let m = meta("OtisGen2.pdf", Some("Otis"));
        assert!(brand_matches(&m, "otis"));
        assert!(brand_matches(&m, "GEN2"));
        assert!(!brand_matches(&m, "orona"));

        let sem_marca = meta("manual.pdf", None);
        assert!(!brand_matches(&sem_marca, "otis"));
    }

    /// O prefixo `<millis>-<rand>-` some; nomes sem prefixo ficam intactos.
    #[test]
    fn test_strip_upload_prefix() {
        assert_eq!(
            strip_upload_prefix("1733154000123-a1b2c3-Manual Otis.pdf"),
            "Manual Otis.pdf"
        );
        assert_eq!(strip_upload_prefix("manual.pdf"), "manual.pdf");
        // Um número curto no começo do nome não é prefixo de upload.
        assert_eq!(strip_upload_prefix("2024-relatorio.pdf"), "2024-relatorio.pdf");
    }

    #[test]
    fn test_normalized_source() {
        assert_eq!(
            normalized_source("1733154000123-a1b2c3-Manual Otis.pdf"),
            "manual otis.pdf"
        );
    }

    /// O metadata serializa em camelCase — o formato do snapshot e do
    /// import NDJSON depende disso.
    #[test]
    fn test_metadata_wire_format() {
        let m = meta("x.pdf", Some("Otis"));
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"chunkIndex\""));
        assert!(json.contains("\"chunkType\":\"semantic\""));
        assert!(json.contains("\"brandName\""));
        assert!(!json.contains("\"faultCode\"")); // None é omitido
    }
}
