//! # Cliente de Embeddings — Vetores via API Externa
//!
//! O [`EmbeddingClient`] fala com a API Generative Language
//! (`models/<m>:embedContent` e `:batchEmbedContents`) e devolve vetores
//! de dimensão fixa D (default 3072).
//!
//! ## Dois Caminhos
//!
//! | Método | Uso | Cache |
//! |--------|-----|-------|
//! | [`embed_one`](EmbeddingClient::embed_one) | queries de busca | LRU (cap 100) |
//! | [`embed_many`](EmbeddingClient::embed_many) | ingestão em lote | — |
//!
//! ## Semântica de Falha do Lote
//!
//! ```text
//! lote inteiro falhou → degrada para tentativas item a item
//! item falhou em definitivo → None naquela posição (posições preservadas)
//! HTTP 429 / resource exhausted → backoff com delay dobrando, até 3 tentativas
//! ```
//!
//! O orquestrador descarta as posições `None` antes de persistir — um
//! chunk sem embedding nunca chega ao índice.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Capacidade do cache LRU de embeddings de query.
const QUERY_CACHE_CAP: usize = 100;
/// Prefixo (em caracteres) usado como chave do cache.
const QUERY_CACHE_KEY_LEN: usize = 300;
/// Pausa entre lotes consecutivos.
const INTER_BATCH_DELAY: Duration = Duration::from_millis(150);
/// Delay inicial do backoff em rate-limit; dobra a cada tentativa.
const BACKOFF_BASE: Duration = Duration::from_millis(1000);
/// Tentativas máximas contra rate-limit.
const MAX_ATTEMPTS: u32 = 3;

// ─── Formato de requisição/resposta da API ───────────────────────

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct EmbedContentRequest {
    model: String,
    content: Content,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: usize,
}

#[derive(Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedContentRequest>,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbedContentResponse {
    embedding: EmbeddingValues,
}

#[derive(Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<EmbeddingValues>,
}

/// Progresso do embedding em lote, emitido a cada lote concluído.
#[derive(Clone, Copy, Debug)]
pub struct EmbedProgress {
    pub current: usize,
    pub total: usize,
    pub percentage: u8,
}

pub type ProgressFn = Arc<dyn Fn(EmbedProgress) + Send + Sync>;

/// Cache LRU de embeddings de query — chave é o prefixo normalizado do
/// texto, descarte O(1) por ordem de inserção.
struct QueryCache {
    map: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
    cap: usize,
}

impl QueryCache {
    fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn key(text: &str) -> String {
        text.trim().to_lowercase().chars().take(QUERY_CACHE_KEY_LEN).collect()
    }

    fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.map.get(&Self::key(text)).cloned()
    }

    fn insert(&mut self, text: &str, embedding: Vec<f32>) {
        let key = Self::key(text);
        if self.map.insert(key.clone(), embedding).is_none() {
            self.order.push_back(key);
            if self.order.len() > self.cap {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                }
            }
        }
    }
}

/// Cliente da API de embeddings.
pub struct EmbeddingClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    dim: usize,
    batch_size: usize,
    concurrency: usize,
    cache: Mutex<QueryCache>,
}

impl EmbeddingClient {
    pub fn new(cfg: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: cfg.gemini_api_key.clone(),
            model: cfg.embed_model.clone(),
            dim: cfg.embed_dim,
            batch_size: cfg.embed_batch_size,
            concurrency: cfg.embed_concurrency,
            cache: Mutex::new(QueryCache::new(QUERY_CACHE_CAP)),
        }
    }

    /// Dimensão D dos vetores produzidos.
    pub fn dim(&self) -> usize {
        self.dim
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:{}?key={}",
            self.model, method, self.api_key
        )
    }

    fn single_request(&self, text: &str) -> EmbedContentRequest {
        EmbedContentRequest {
            model: format!("models/{}", self.model),
            content: Content {
                parts: vec![Part { text: text.to_string() }],
            },
            output_dimensionality: self.dim,
        }
    }

    /// POST com backoff em rate-limit (429 / "resource exhausted").
    async fn post_with_backoff<B: Serialize>(&self, url: &str, body: &B) -> Result<reqwest::Response> {
        let mut delay = BACKOFF_BASE;
        for attempt in 1..=MAX_ATTEMPTS {
            let resp = self
                .http
                .post(url)
                .json(body)
                .send()
                .await
                .context("Falha na conexão com a API de embeddings")?;

            if resp.status().as_u16() == 429 {
                if attempt == MAX_ATTEMPTS {
                    anyhow::bail!("Rate limit persistente após {} tentativas", MAX_ATTEMPTS);
                }
                tracing::warn!(tentativa = attempt, delay_ms = delay.as_millis() as u64, "Rate limit no embedding, aguardando");
                tokio::time::sleep(delay).await;
                delay *= 2;
                continue;
            }

            if !resp.status().is_success() {
                let status = resp.status();
                let detail = resp.text().await.unwrap_or_default();
                if detail.to_lowercase().contains("resource exhausted") && attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    continue;
                }
                anyhow::bail!("API de embeddings respondeu {}: {}", status, detail);
            }

            return Ok(resp);
        }
        unreachable!("loop de backoff sempre retorna ou falha")
    }

    /// Embedding de um texto único, com cache LRU pela primeira parte
    /// do texto. Usado pelas queries de busca.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.lock().get(text) {
            tracing::debug!("Cache hit no embedding de query");
            return Ok(hit);
        }

        let resp = self
            .post_with_backoff(&self.endpoint("embedContent"), &self.single_request(text))
            .await?;
        let parsed: EmbedContentResponse = resp
            .json()
            .await
            .context("Resposta inválida da API de embeddings")?;
        let values = parsed.embedding.values;
        if values.len() != self.dim {
            anyhow::bail!(
                "Embedding com dimensão {} (esperado {})",
                values.len(),
                self.dim
            );
        }

        self.cache.lock().insert(text, values.clone());
        Ok(values)
    }

    /// Tenta o endpoint de lote nativo para um batch inteiro.
    async fn embed_batch_native(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = BatchEmbedRequest {
            requests: texts.iter().map(|t| self.single_request(t)).collect(),
        };
        let resp = self
            .post_with_backoff(&self.endpoint("batchEmbedContents"), &body)
            .await?;
        let parsed: BatchEmbedResponse = resp
            .json()
            .await
            .context("Resposta inválida do batch de embeddings")?;
        if parsed.embeddings.len() != texts.len() {
            anyhow::bail!(
                "Batch devolveu {} embeddings para {} textos",
                parsed.embeddings.len(),
                texts.len()
            );
        }
        Ok(parsed.embeddings.into_iter().map(|e| e.values).collect())
    }

    /// Processa um lote: endpoint nativo primeiro; se o lote inteiro
    /// falhar, degrada para tentativas item a item.
    async fn process_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        match self.embed_batch_native(texts).await {
            Ok(vectors) => vectors
                .into_iter()
                .map(|v| if v.len() == self.dim { Some(v) } else { None })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, itens = texts.len(), "Lote de embeddings falhou, tentando item a item");
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    match self.embed_one(text).await {
                        Ok(v) => out.push(Some(v)),
                        Err(item_err) => {
                            tracing::warn!(error = %item_err, "Item de embedding falhou em definitivo");
                            out.push(None);
                        }
                    }
                }
                out
            }
        }
    }

    /// Embeddings para muitos textos, alinhados 1-a-1 com a entrada.
    ///
    /// Posições `None` indicam falha permanente daquele item. Lotes são
    /// processados com concorrência limitada; o `buffered` preserva a
    /// ordem posicional mesmo quando requisições terminam fora de ordem.
    pub async fn embed_many(
        &self,
        texts: &[String],
        on_progress: Option<ProgressFn>,
    ) -> Result<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let total = texts.len();
        let done = AtomicUsize::new(0);

        let batches: Vec<Vec<String>> = texts
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let results: Vec<Vec<Option<Vec<f32>>>> = futures_util::stream::iter(
            batches.into_iter().map(|batch| {
                let done = &done;
                let on_progress = on_progress.clone();
                async move {
                    let out = self.process_batch(&batch).await;
                    let current = done.fetch_add(batch.len(), Ordering::SeqCst) + batch.len();
                    if let Some(cb) = on_progress {
                        cb(EmbedProgress {
                            current,
                            total,
                            percentage: ((current * 100) / total.max(1)) as u8,
                        });
                    }
                    tokio::time::sleep(INTER_BATCH_DELAY).await;
                    out
                }
            }),
        )
        .buffered(self.concurrency)
        .collect()
        .await;

        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A chave do cache normaliza e corta em 300 caracteres.
    #[test]
    fn test_cache_key() {
        let long = "A".repeat(400);
        assert_eq!(QueryCache::key(&long).len(), 300);
        assert_eq!(QueryCache::key("  Falha 204  "), "falha 204");
    }

    /// Descarte por ordem de inserção quando passa da capacidade.
    #[test]
    fn test_cache_eviction() {
        let mut cache = QueryCache::new(2);
        cache.insert("a", vec![1.0]);
        cache.insert("b", vec![2.0]);
        cache.insert("c", vec![3.0]);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    /// Reinserir uma chave existente não duplica a fila de descarte.
    #[test]
    fn test_cache_reinsert() {
        let mut cache = QueryCache::new(2);
        cache.insert("a", vec![1.0]);
        cache.insert("a", vec![9.0]);
        cache.insert("b", vec![2.0]);
        assert_eq!(cache.get("a"), Some(vec![9.0]));
        assert_eq!(cache.order.len(), 2);
    }
}
