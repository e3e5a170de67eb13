//! # Backend Remoto — Adaptador Qdrant
//!
//! Adaptador fino sobre a API REST de um Qdrant externo. O serviço fala
//! apenas as operações do trait [`VectorStore`]; paginação vira o scroll
//! nativo do Qdrant e remoção escopada vira delete por filtro de payload.
//!
//! ## Payload
//!
//! Cada ponto carrega `{"document": <texto>, "metadata": {...}}` — o
//! mesmo metadata camelCase do backend embutido, então o import NDJSON
//! e o export funcionam idênticos nos dois backends.
//!
//! ## Filtro de marca
//!
//! A semântica do filtro é substring case-insensitive, que o match de
//! payload do Qdrant não expressa — o adaptador busca com overfetch e
//! filtra no cliente, caindo para o resultado sem filtro quando nada
//! casa.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::bm25::Bm25Index;
use super::{
    brand_matches, normalized_source, Chunk, ChunkMetadata, CompactOutcome, RemovalOutcome,
    ScrollPage, SearchHit, SearchOutcome, StoreError, StoreResult, StoreStats, StoredRecord,
    VectorStore,
};

/// Overfetch da busca vetorial para compensar o filtro client-side.
const BRAND_OVERFETCH: usize = 4;
/// Corpus máximo puxado por scroll para a busca BM25.
const BM25_CORPUS_LIMIT: usize = 1000;
const BM25_CACHE_TTL: Duration = Duration::from_secs(30);
/// Tamanho de página dos scrolls internos (listagem de fontes, export).
const SCROLL_PAGE: usize = 256;

pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    collection: String,
    vector_size: usize,
    bm25_cache: Mutex<Option<Bm25Cache>>,
}

struct Bm25Cache {
    key: (String, usize),
    index: Bm25Index,
    records: Vec<StoredRecord>,
    built_at: Instant,
}

// ─── Respostas da API ────────────────────────────────────────────

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<ScoredPoint>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
struct ScrollResponse {
    result: ScrollResult,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

#[derive(Deserialize)]
struct CountResponse {
    result: CountResult,
}

impl QdrantStore {
    pub fn new(url: &str, api_key: &str, collection: &str, vector_size: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            collection: collection.to_string(),
            vector_size,
            bm25_cache: Mutex::new(None),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.base_url, self.collection, suffix
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        if !self.api_key.is_empty() {
            req = req.header("api-key", &self.api_key);
        }
        req
    }

    async fn post(&self, suffix: &str, body: Value) -> Result<Value> {
        let resp = self
            .request(reqwest::Method::POST, self.url(suffix))
            .json(&body)
            .send()
            .await
            .context("Falha na conexão com o Qdrant")?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("Qdrant respondeu {}: {}", status, detail);
        }
        resp.json().await.context("Resposta inválida do Qdrant")
    }

    fn point_to_record(p: ScoredPoint) -> Option<StoredRecord> {
        let payload = p.payload?;
        let document = payload.get("document")?.as_str()?.to_string();
        let metadata: ChunkMetadata =
            serde_json::from_value(payload.get("metadata")?.clone()).ok()?;
        let id = match &p.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(StoredRecord {
            id,
            document,
            metadata,
            embedding: p.vector.unwrap_or_default(),
        })
    }

    /// Scroll interno paginado, juntando até `limit` registros.
    async fn scroll_all(&self, limit: usize, with_vector: bool) -> Result<Vec<StoredRecord>> {
        let mut records = Vec::new();
        let mut offset: Option<Value> = None;
        while records.len() < limit {
            let page = (limit - records.len()).min(SCROLL_PAGE);
            let mut body = json!({
                "limit": page,
                "with_payload": true,
                "with_vector": with_vector,
            });
            if let Some(off) = &offset {
                body["offset"] = off.clone();
            }
            let raw = self.post("/points/scroll", body).await?;
            let parsed: ScrollResponse =
                serde_json::from_value(raw).context("Scroll inválido do Qdrant")?;
            let n = parsed.result.points.len();
            records.extend(
                parsed
                    .result
                    .points
                    .into_iter()
                    .filter_map(Self::point_to_record),
            );
            match parsed.result.next_page_offset {
                Some(next) if n > 0 => offset = Some(next),
                _ => break,
            }
        }
        Ok(records)
    }

    async fn count_by_source(&self, source: &str) -> Result<usize> {
        let raw = self
            .post(
                "/points/count",
                json!({
                    "exact": true,
                    "filter": { "must": [{ "key": "metadata.source", "match": { "value": source } }] },
                }),
            )
            .await?;
        let parsed: CountResponse = serde_json::from_value(raw).context("Count inválido")?;
        Ok(parsed.result.count)
    }

    async fn total_count(&self) -> Result<usize> {
        let raw = self.post("/points/count", json!({ "exact": true })).await?;
        let parsed: CountResponse = serde_json::from_value(raw).context("Count inválido")?;
        Ok(parsed.result.count)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    /// Garante que a collection existe (cria com distância cosseno).
    async fn load(&self) -> StoreResult<()> {
        let resp = self
            .request(reqwest::Method::GET, self.url(""))
            .send()
            .await
            .context("Falha na conexão com o Qdrant")?;
        if resp.status().is_success() {
            return Ok(());
        }

        let create = self
            .request(reqwest::Method::PUT, self.url(""))
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Cosine" }
            }))
            .send()
            .await
            .context("Falha ao criar collection no Qdrant")?;
        if !create.status().is_success() {
            let status = create.status();
            let detail = create.text().await.unwrap_or_default();
            return Err(StoreError::Backend(anyhow::anyhow!(
                "Criação da collection falhou ({}): {}",
                status,
                detail
            )));
        }
        tracing::info!(collection = %self.collection, "Collection criada no Qdrant");
        Ok(())
    }

    async fn add(&self, chunks: Vec<Chunk>, embeddings: Vec<Vec<f32>>) -> StoreResult<usize> {
        if chunks.len() != embeddings.len() {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "chunks ({}) e embeddings ({}) desalinhados",
                chunks.len(),
                embeddings.len()
            )));
        }
        let points: Vec<Value> = chunks
            .iter()
            .zip(&embeddings)
            .map(|(c, e)| {
                json!({
                    "id": c.id,
                    "vector": e,
                    "payload": {
                        "document": c.content,
                        "metadata": c.metadata,
                    },
                })
            })
            .collect();
        let count = points.len();
        self.post("/points?wait=true", json!({ "points": points }))
            .await?;
        *self.bm25_cache.lock() = None;
        Ok(count)
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        brand_filter: Option<&str>,
    ) -> StoreResult<SearchOutcome> {
        let fetch = match brand_filter {
            Some(f) if !f.trim().is_empty() => k * BRAND_OVERFETCH,
            _ => k,
        };
        let raw = self
            .post(
                "/points/search",
                json!({
                    "vector": query,
                    "limit": fetch.max(1),
                    "with_payload": true,
                }),
            )
            .await?;
        let parsed: SearchResponse =
            serde_json::from_value(raw).context("Busca inválida do Qdrant")?;

        let all: Vec<SearchHit> = parsed
            .result
            .into_iter()
            .filter_map(|p| {
                let score = p.score;
                Self::point_to_record(p).map(|r| SearchHit {
                    id: r.id,
                    content: r.document,
                    metadata: r.metadata,
                    similarity: score,
                })
            })
            .collect();

        match brand_filter {
            Some(f) if !f.trim().is_empty() => {
                let filtered: Vec<SearchHit> = all
                    .iter()
                    .filter(|h| brand_matches(&h.metadata, f))
                    .cloned()
                    .take(k)
                    .collect();
                if filtered.is_empty() {
                    Ok(SearchOutcome {
                        hits: all.into_iter().take(k).collect(),
                        brand_fallback: true,
                    })
                } else {
                    Ok(SearchOutcome {
                        hits: filtered,
                        brand_fallback: false,
                    })
                }
            }
            _ => Ok(SearchOutcome {
                hits: all.into_iter().take(k).collect(),
                brand_fallback: false,
            }),
        }
    }

    async fn lexical_search(
        &self,
        text: &str,
        k: usize,
        brand_filter: Option<&str>,
    ) -> StoreResult<Vec<SearchHit>> {
        let key = (
            brand_filter.unwrap_or("").to_lowercase(),
            BM25_CORPUS_LIMIT,
        );
        let rebuild = {
            let cache = self.bm25_cache.lock();
            match cache.as_ref() {
                Some(c) => c.key != key || c.built_at.elapsed() > BM25_CACHE_TTL,
                None => true,
            }
        };
        if rebuild {
            let mut records = self.scroll_all(BM25_CORPUS_LIMIT, false).await?;
            if let Some(f) = brand_filter {
                if !f.trim().is_empty() {
                    let filtered: Vec<StoredRecord> = records
                        .iter()
                        .filter(|r| brand_matches(&r.metadata, f))
                        .cloned()
                        .collect();
                    if !filtered.is_empty() {
                        records = filtered;
                    }
                }
            }
            let index = Bm25Index::build(records.iter().map(|r| r.document.as_str()));
            *self.bm25_cache.lock() = Some(Bm25Cache {
                key,
                index,
                records,
                built_at: Instant::now(),
            });
        }

        let cache = self.bm25_cache.lock();
        let Some(cached) = cache.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(cached
            .index
            .score(text)
            .into_iter()
            .take(k)
            .map(|(pos, score)| {
                let r = &cached.records[pos];
                SearchHit {
                    id: r.id.clone(),
                    content: r.document.clone(),
                    metadata: r.metadata.clone(),
                    similarity: score as f32,
                }
            })
            .collect())
    }

    async fn has_source(&self, name: &str) -> StoreResult<bool> {
        // Match exato via filtro de payload.
        if self.count_by_source(name).await? > 0 {
            return Ok(true);
        }
        // Fallback normalizado: compara contra a lista de fontes.
        let wanted = normalized_source(name);
        let sources = self.indexed_sources().await?;
        Ok(sources.iter().any(|s| normalized_source(s) == wanted))
    }

    async fn remove_sources(&self, names: &[String]) -> StoreResult<RemovalOutcome> {
        let mut removed = 0usize;
        for name in names {
            let count = self.count_by_source(name).await?;
            if count == 0 {
                continue;
            }
            self.post(
                "/points/delete?wait=true",
                json!({
                    "filter": { "must": [{ "key": "metadata.source", "match": { "value": name } }] },
                }),
            )
            .await?;
            removed += count;
        }
        *self.bm25_cache.lock() = None;
        let remaining = self.total_count().await?;
        Ok(RemovalOutcome { removed, remaining })
    }

    async fn indexed_sources(&self) -> StoreResult<Vec<String>> {
        let records = self.scroll_all(BM25_CORPUS_LIMIT * 10, false).await?;
        let mut seen = std::collections::HashSet::new();
        let mut sources = Vec::new();
        for r in records {
            if seen.insert(r.metadata.source.clone()) {
                sources.push(r.metadata.source);
            }
        }
        Ok(sources)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        Ok(StoreStats {
            total_documents: self.total_count().await?,
            collection_name: self.collection.clone(),
        })
    }

    async fn export_corpus(
        &self,
        limit: usize,
        brand_filter: Option<&str>,
    ) -> StoreResult<Vec<Chunk>> {
        let records = self.scroll_all(limit, false).await?;
        Ok(records
            .into_iter()
            .filter(|r| match brand_filter {
                Some(f) if !f.trim().is_empty() => brand_matches(&r.metadata, f),
                _ => true,
            })
            .map(|r| Chunk {
                id: r.id,
                content: r.document,
                metadata: r.metadata,
            })
            .collect())
    }

    async fn scroll(&self, cursor: Option<String>, limit: usize) -> StoreResult<ScrollPage> {
        let mut body = json!({
            "limit": limit,
            "with_payload": true,
            "with_vector": true,
        });
        if let Some(c) = cursor {
            // O cursor opaco é o next_page_offset serializado.
            if let Ok(v) = serde_json::from_str::<Value>(&c) {
                body["offset"] = v;
            }
        }
        let raw = self.post("/points/scroll", body).await?;
        let parsed: ScrollResponse =
            serde_json::from_value(raw).context("Scroll inválido do Qdrant")?;
        let records = parsed
            .result
            .points
            .into_iter()
            .filter_map(Self::point_to_record)
            .collect();
        let next = parsed
            .result
            .next_page_offset
            .and_then(|v| serde_json::to_string(&v).ok());
        Ok(ScrollPage { records, next })
    }

    /// Compactação é responsabilidade do próprio Qdrant — no-op aqui.
    async fn compact(&self) -> StoreResult<CompactOutcome> {
        let total = self.total_count().await?;
        Ok(CompactOutcome {
            snapshot_records: total,
            folded_from_log: 0,
        })
    }

    async fn clear(&self) -> StoreResult<()> {
        let resp = self
            .request(reqwest::Method::DELETE, self.url(""))
            .send()
            .await
            .context("Falha ao apagar collection")?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(StoreError::Backend(anyhow::anyhow!(
                "Remoção da collection falhou ({})",
                status
            )));
        }
        *self.bm25_cache.lock() = None;
        self.load().await
    }

    fn loading_progress(&self) -> Option<String> {
        None
    }
}
