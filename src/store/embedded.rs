//! # Store Embutido — Snapshot + Append-Log
//!
//! Backend auto-gerenciado do índice vetorial: três arrays paralelos
//! (`ids`, `documents`/`metadatas`, `embeddings`) mais um mapa por id,
//! tudo atrás de um único `RwLock`.
//!
//! ## Durabilidade
//!
//! ```text
//! data/vectors.json           ← snapshot primário {ids[], documents[], metadatas[], embeddings[]}
//! data/vectors_append.ndjson  ← um StoredRecord JSON por linha, escritas desde o snapshot
//! ```
//!
//! Toda escrita vai **primeiro** para o append-log (com fsync) e só
//! depois para a memória — um crash no meio da escrita recupera o
//! registro completo no próximo load; uma linha truncada é descartada
//! com warning.
//!
//! `compact()` dobra o log no snapshot atomicamente: escreve em arquivo
//! temporário, fsync, rename.
//!
//! ## Load Preguiçoso
//!
//! O load roda em background no startup. Enquanto não termina, toda
//! operação devolve [`StoreError::NotReady`] com o progresso
//! `(carregados / total)` — a camada HTTP traduz para 503.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::bm25::Bm25Index;
use super::{
    brand_matches, cosine_similarity, normalized_source, Chunk, ChunkMetadata, CompactOutcome,
    RemovalOutcome, ScrollPage, SearchHit, SearchOutcome, StoreError, StoreResult, StoreStats,
    StoredRecord, VectorStore,
};

/// Nome do snapshot primário dentro de `DATA_PATH`.
const SNAPSHOT_FILE: &str = "vectors.json";
/// Nome do append-log dentro de `DATA_PATH`.
const APPEND_LOG_FILE: &str = "vectors_append.ndjson";

/// Corpus máximo considerado pela busca BM25.
const BM25_CORPUS_LIMIT: usize = 2000;
/// TTL do cache do índice BM25.
const BM25_CACHE_TTL: Duration = Duration::from_secs(30);

/// Formato do snapshot em disco — arrays paralelos, como exportados.
#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    ids: Vec<String>,
    documents: Vec<String>,
    metadatas: Vec<ChunkMetadata>,
    embeddings: Vec<Vec<f32>>,
}

/// Arrays em memória + índice por id. Protegido por um único RwLock.
#[derive(Default)]
struct Inner {
    ids: Vec<String>,
    documents: Vec<String>,
    metadatas: Vec<ChunkMetadata>,
    embeddings: Vec<Vec<f32>>,
    by_id: HashMap<String, usize>,
    /// Registros escritos no log desde o último snapshot.
    pending_log_records: usize,
}

impl Inner {
    fn upsert(&mut self, rec: StoredRecord) {
        match self.by_id.get(&rec.id) {
            Some(&idx) => {
                self.documents[idx] = rec.document;
                self.metadatas[idx] = rec.metadata;
                self.embeddings[idx] = rec.embedding;
            }
            None => {
                let idx = self.ids.len();
                self.by_id.insert(rec.id.clone(), idx);
                self.ids.push(rec.id);
                self.documents.push(rec.document);
                self.metadatas.push(rec.metadata);
                self.embeddings.push(rec.embedding);
            }
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Fase do load inicial.
enum LoadPhase {
    NotLoaded,
    Loading { loaded: usize, total: usize },
    Ready,
}

/// Backend embutido do índice vetorial.
pub struct EmbeddedStore {
    snapshot_path: PathBuf,
    log_path: PathBuf,
    inner: RwLock<Inner>,
    phase: Mutex<LoadPhase>,
    /// Cache BM25: (chave (brand, limite), índice, mapeamento p/ Inner, criado em).
    bm25_cache: Mutex<Option<Bm25Cache>>,
}

struct Bm25Cache {
    key: (String, usize),
    index: Bm25Index,
    /// Posição no `Inner` de cada documento do corpus BM25.
    positions: Vec<usize>,
    built_at: Instant,
}

impl EmbeddedStore {
    pub fn new(data_path: &Path) -> Self {
        Self {
            snapshot_path: data_path.join(SNAPSHOT_FILE),
            log_path: data_path.join(APPEND_LOG_FILE),
            inner: RwLock::new(Inner::default()),
            phase: Mutex::new(LoadPhase::NotLoaded),
            bm25_cache: Mutex::new(None),
        }
    }

    /// Devolve erro NotReady enquanto o load inicial não terminou.
    fn ensure_ready(&self) -> StoreResult<()> {
        match *self.phase.lock() {
            LoadPhase::Ready => Ok(()),
            LoadPhase::Loading { loaded, total } => {
                Err(StoreError::NotReady(format!("({} / {})", loaded, total)))
            }
            LoadPhase::NotLoaded => Err(StoreError::NotReady("(0 / ?)".into())),
        }
    }

    fn invalidate_bm25(&self) {
        *self.bm25_cache.lock() = None;
    }

    /// Escreve registros no append-log com fsync. Chamado com o write
    /// lock do `Inner` já em mãos — a escrita em disco precede a
    /// inserção em memória.
    fn append_to_log(&self, records: &[StoredRecord]) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent).context("Falha ao criar diretório de dados")?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .context("Falha ao abrir append-log")?;
        let mut buf = Vec::with_capacity(records.len() * 512);
        for rec in records {
            serde_json::to_writer(&mut buf, rec).context("Falha ao serializar registro")?;
            buf.push(b'\n');
        }
        file.write_all(&buf).context("Falha ao escrever no append-log")?;
        file.sync_all().context("Falha no fsync do append-log")?;
        Ok(())
    }

    /// Reescreve o snapshot atomicamente (temp + fsync + rename) e
    /// trunca o log. Chamado com o write lock em mãos.
    fn rewrite_snapshot(&self, inner: &mut Inner) -> Result<usize> {
        if let Some(parent) = self.snapshot_path.parent() {
            std::fs::create_dir_all(parent).context("Falha ao criar diretório de dados")?;
        }
        let snapshot = Snapshot {
            ids: inner.ids.clone(),
            documents: inner.documents.clone(),
            metadatas: inner.metadatas.clone(),
            embeddings: inner.embeddings.clone(),
        };
        let tmp_path = self.snapshot_path.with_extension("json.tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)
                .context("Falha ao criar snapshot temporário")?;
            serde_json::to_writer(&mut tmp, &snapshot)
                .context("Falha ao serializar snapshot")?;
            tmp.sync_all().context("Falha no fsync do snapshot")?;
        }
        std::fs::rename(&tmp_path, &self.snapshot_path)
            .context("Falha ao renomear snapshot")?;
        // Log pode ser truncado agora que o snapshot contém tudo.
        std::fs::write(&self.log_path, b"").context("Falha ao truncar append-log")?;
        let folded = inner.pending_log_records;
        inner.pending_log_records = 0;
        Ok(folded)
    }

    /// Índices candidatos segundo o filtro de marca; devolve também se
    /// a busca caiu para o índice inteiro.
    fn candidate_positions(inner: &Inner, brand_filter: Option<&str>) -> (Vec<usize>, bool) {
        match brand_filter {
            Some(filter) if !filter.trim().is_empty() => {
                let filtered: Vec<usize> = (0..inner.len())
                    .filter(|&i| brand_matches(&inner.metadatas[i], filter))
                    .collect();
                if filtered.is_empty() {
                    ((0..inner.len()).collect(), true)
                } else {
                    (filtered, false)
                }
            }
            _ => ((0..inner.len()).collect(), false),
        }
    }
}

#[async_trait]
impl VectorStore for EmbeddedStore {
    /// Lê snapshot + append-log em background, com progresso observável.
    async fn load(&self) -> StoreResult<()> {
        *self.phase.lock() = LoadPhase::Loading { loaded: 0, total: 0 };

        let snapshot_path = self.snapshot_path.clone();
        let log_path = self.log_path.clone();
        let parsed = tokio::task::spawn_blocking(move || read_disk(&snapshot_path, &log_path))
            .await
            .map_err(|e| anyhow::anyhow!("Load task abortada: {}", e))?;

        let records = match parsed {
            Ok(r) => r,
            Err(e) => {
                // Snapshot corrompido não derruba o serviço: começa vazio.
                tracing::warn!(error = %e, "Falha ao carregar índice do disco, iniciando vazio");
                Vec::new()
            }
        };

        let total = records.len();
        *self.phase.lock() = LoadPhase::Loading { loaded: 0, total };

        {
            let mut inner = self.inner.write();
            for (i, rec) in records.into_iter().enumerate() {
                inner.upsert(rec);
                if i % 500 == 499 {
                    *self.phase.lock() = LoadPhase::Loading { loaded: i + 1, total };
                }
            }
            inner.pending_log_records = 0;
        }

        *self.phase.lock() = LoadPhase::Ready;
        tracing::info!(registros = total, "Índice vetorial carregado");
        Ok(())
    }

    async fn add(&self, chunks: Vec<Chunk>, embeddings: Vec<Vec<f32>>) -> StoreResult<usize> {
        self.ensure_ready()?;
        if chunks.len() != embeddings.len() {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "chunks ({}) e embeddings ({}) desalinhados",
                chunks.len(),
                embeddings.len()
            )));
        }

        let records: Vec<StoredRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(c, e)| StoredRecord {
                id: c.id,
                document: c.content,
                metadata: c.metadata,
                embedding: e,
            })
            .collect();
        let count = records.len();

        let mut inner = self.inner.write();
        // Log primeiro, memória depois.
        self.append_to_log(&records)?;
        for rec in records {
            inner.upsert(rec);
        }
        inner.pending_log_records += count;
        drop(inner);

        self.invalidate_bm25();
        Ok(count)
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        brand_filter: Option<&str>,
    ) -> StoreResult<SearchOutcome> {
        self.ensure_ready()?;
        let inner = self.inner.read();
        let (positions, brand_fallback) = Self::candidate_positions(&inner, brand_filter);

        // Scan paralelo — o collect do rayon preserva a ordem dos índices,
        // então empates de similaridade resolvem por ordem de inserção.
        let mut scored: Vec<(usize, f32)> = positions
            .par_iter()
            .map(|&i| (i, cosine_similarity(query, &inner.embeddings[i])))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let hits = scored
            .into_iter()
            .take(k)
            .map(|(i, similarity)| SearchHit {
                id: inner.ids[i].clone(),
                content: inner.documents[i].clone(),
                metadata: inner.metadatas[i].clone(),
                similarity,
            })
            .collect();

        Ok(SearchOutcome { hits, brand_fallback })
    }

    async fn lexical_search(
        &self,
        text: &str,
        k: usize,
        brand_filter: Option<&str>,
    ) -> StoreResult<Vec<SearchHit>> {
        self.ensure_ready()?;
        let key = (
            brand_filter.unwrap_or("").to_lowercase(),
            BM25_CORPUS_LIMIT,
        );

        let inner = self.inner.read();
        let mut cache = self.bm25_cache.lock();
        let stale = match cache.as_ref() {
            Some(c) => c.key != key || c.built_at.elapsed() > BM25_CACHE_TTL,
            None => true,
        };
        if stale {
            let (positions, _) = Self::candidate_positions(&inner, brand_filter);
            let positions: Vec<usize> = positions.into_iter().take(BM25_CORPUS_LIMIT).collect();
            let index = Bm25Index::build(positions.iter().map(|&i| inner.documents[i].as_str()));
            *cache = Some(Bm25Cache {
                key,
                index,
                positions,
                built_at: Instant::now(),
            });
        }

        let Some(cached) = cache.as_ref() else {
            return Ok(Vec::new());
        };
        let hits = cached
            .index
            .score(text)
            .into_iter()
            .take(k)
            .map(|(pos, score)| {
                let i = cached.positions[pos];
                SearchHit {
                    id: inner.ids[i].clone(),
                    content: inner.documents[i].clone(),
                    metadata: inner.metadatas[i].clone(),
                    similarity: score as f32,
                }
            })
            .collect();
        Ok(hits)
    }

    async fn has_source(&self, name: &str) -> StoreResult<bool> {
        self.ensure_ready()?;
        let inner = self.inner.read();
        // Match exato primeiro.
        if inner.metadatas.iter().any(|m| m.source == name) {
            return Ok(true);
        }
        // Fallback pelo nome normalizado (prefixo de upload fora, lowercase).
        let wanted = normalized_source(name);
        Ok(inner
            .metadatas
            .iter()
            .any(|m| normalized_source(&m.source) == wanted))
    }

    async fn remove_sources(&self, names: &[String]) -> StoreResult<RemovalOutcome> {
        self.ensure_ready()?;
        let normalized: Vec<String> = names.iter().map(|n| normalized_source(n)).collect();
        let target = |meta: &ChunkMetadata| {
            names.iter().any(|n| *n == meta.source)
                || normalized.contains(&normalized_source(&meta.source))
        };

        let mut inner = self.inner.write();
        let before = inner.len();

        let mut kept = Inner::default();
        for i in 0..before {
            if !target(&inner.metadatas[i]) {
                kept.upsert(StoredRecord {
                    id: inner.ids[i].clone(),
                    document: inner.documents[i].clone(),
                    metadata: inner.metadatas[i].clone(),
                    embedding: inner.embeddings[i].clone(),
                });
            }
        }
        let removed = before - kept.len();
        *inner = kept;

        // Remoção reconstrói os arrays; persiste reescrevendo o snapshot.
        self.rewrite_snapshot(&mut inner)?;
        let remaining = inner.len();
        drop(inner);

        self.invalidate_bm25();
        tracing::info!(removidos = removed, restantes = remaining, "Fontes removidas do índice");
        Ok(RemovalOutcome { removed, remaining })
    }

    async fn indexed_sources(&self) -> StoreResult<Vec<String>> {
        self.ensure_ready()?;
        let inner = self.inner.read();
        let mut seen = std::collections::HashSet::new();
        let mut sources = Vec::new();
        for m in &inner.metadatas {
            if seen.insert(m.source.clone()) {
                sources.push(m.source.clone());
            }
        }
        Ok(sources)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.ensure_ready()?;
        Ok(StoreStats {
            total_documents: self.inner.read().len(),
            collection_name: "embedded".into(),
        })
    }

    async fn export_corpus(
        &self,
        limit: usize,
        brand_filter: Option<&str>,
    ) -> StoreResult<Vec<Chunk>> {
        self.ensure_ready()?;
        let inner = self.inner.read();
        let chunks = (0..inner.len())
            .filter(|&i| match brand_filter {
                Some(f) if !f.trim().is_empty() => brand_matches(&inner.metadatas[i], f),
                _ => true,
            })
            .take(limit)
            .map(|i| Chunk {
                id: inner.ids[i].clone(),
                content: inner.documents[i].clone(),
                metadata: inner.metadatas[i].clone(),
            })
            .collect();
        Ok(chunks)
    }

    async fn scroll(&self, cursor: Option<String>, limit: usize) -> StoreResult<ScrollPage> {
        self.ensure_ready()?;
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let inner = self.inner.read();
        let end = (offset + limit).min(inner.len());
        let records = (offset..end)
            .map(|i| StoredRecord {
                id: inner.ids[i].clone(),
                document: inner.documents[i].clone(),
                metadata: inner.metadatas[i].clone(),
                embedding: inner.embeddings[i].clone(),
            })
            .collect();
        let next = if end < inner.len() {
            Some(end.to_string())
        } else {
            None
        };
        Ok(ScrollPage { records, next })
    }

    async fn compact(&self) -> StoreResult<CompactOutcome> {
        self.ensure_ready()?;
        let mut inner = self.inner.write();
        let folded = self.rewrite_snapshot(&mut inner)?;
        let total = inner.len();
        drop(inner);
        tracing::info!(registros = total, dobrados = folded, "Snapshot compactado");
        Ok(CompactOutcome {
            snapshot_records: total,
            folded_from_log: folded,
        })
    }

    async fn clear(&self) -> StoreResult<()> {
        self.ensure_ready()?;
        let mut inner = self.inner.write();
        *inner = Inner::default();
        self.rewrite_snapshot(&mut inner)?;
        drop(inner);
        self.invalidate_bm25();
        tracing::info!("Índice vetorial esvaziado");
        Ok(())
    }

    fn loading_progress(&self) -> Option<String> {
        match *self.phase.lock() {
            LoadPhase::Ready => None,
            LoadPhase::Loading { loaded, total } => Some(format!("({} / {})", loaded, total)),
            LoadPhase::NotLoaded => Some("(0 / ?)".into()),
        }
    }
}

/// Lê snapshot + append-log do disco e devolve os registros na ordem
/// em que devem ser aplicados (snapshot primeiro, log por cima).
fn read_disk(snapshot_path: &Path, log_path: &Path) -> Result<Vec<StoredRecord>> {
    let mut records = Vec::new();

    if snapshot_path.exists() {
        let raw = std::fs::read_to_string(snapshot_path).context("Falha ao ler snapshot")?;
        let snap: Snapshot =
            serde_json::from_str(&raw).context("Falha ao desserializar snapshot")?;
        if snap.ids.len() != snap.documents.len()
            || snap.ids.len() != snap.metadatas.len()
            || snap.ids.len() != snap.embeddings.len()
        {
            anyhow::bail!("Snapshot com arrays desalinhados");
        }
        records.extend(
            snap.ids
                .into_iter()
                .zip(snap.documents)
                .zip(snap.metadatas)
                .zip(snap.embeddings)
                .map(|(((id, document), metadata), embedding)| StoredRecord {
                    id,
                    document,
                    metadata,
                    embedding,
                }),
        );
    }

    if log_path.exists() {
        let raw = std::fs::read_to_string(log_path).context("Falha ao ler append-log")?;
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredRecord>(line) {
                Ok(rec) => records.push(rec),
                Err(e) => {
                    // Linha truncada por crash no meio da escrita.
                    tracing::warn!(linha = lineno + 1, error = %e, "Linha inválida no append-log, descartada");
                }
            }
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChunkType;

    fn chunk(source: &str, idx: usize, content: &str) -> Chunk {
        Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            metadata: ChunkMetadata {
                source: source.to_string(),
                brand_name: None,
                page: Some(1),
                chunk_index: idx,
                chunk_type: ChunkType::Semantic,
                fault_code: None,
                title: source.to_string(),
                num_pages: 1,
                uploaded_at: None,
                reindexed_at: None,
                ocr_used: false,
                ocr_partial: false,
            },
        }
    }

    async fn ready_store(dir: &Path) -> EmbeddedStore {
        let store = EmbeddedStore::new(dir);
        store.load().await.unwrap();
        store
    }

    /// Operações antes do load devolvem NotReady.
    #[tokio::test]
    async fn test_not_ready_before_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::new(dir.path());
        let err = store.stats().await.unwrap_err();
        assert!(matches!(err, StoreError::NotReady(_)));
        assert!(store.loading_progress().is_some());
    }

    /// add → search devolve o chunk mais próximo primeiro, com
    /// similaridades em ordem não-crescente.
    #[tokio::test]
    async fn test_add_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path()).await;

        let chunks = vec![
            chunk("a.pdf", 0, "falha de freio"),
            chunk("b.pdf", 0, "lubrificação de guias"),
        ];
        let embeddings = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]];
        store.add(chunks, embeddings).await.unwrap();

        let out = store.search(&[0.9, 0.1, 0.0], 5, None).await.unwrap();
        assert_eq!(out.hits.len(), 2);
        assert_eq!(out.hits[0].metadata.source, "a.pdf");
        assert!(out.hits[0].similarity >= out.hits[1].similarity);
        assert!(!out.brand_fallback);
        assert!(store.has_source("a.pdf").await.unwrap());
    }

    /// Filtro de marca sem candidatos cai para busca sem filtro e anota.
    #[tokio::test]
    async fn test_brand_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path()).await;
        store
            .add(vec![chunk("OtisGen2.pdf", 0, "texto")], vec![vec![1.0, 0.0]])
            .await
            .unwrap();

        let out = store.search(&[1.0, 0.0], 3, Some("orona")).await.unwrap();
        assert!(out.brand_fallback);
        assert_eq!(out.hits.len(), 1);

        let out = store.search(&[1.0, 0.0], 3, Some("otis")).await.unwrap();
        assert!(!out.brand_fallback);
    }

    /// Os registros sobrevivem a um reload a partir do disco (append-log).
    #[tokio::test]
    async fn test_durability_via_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ready_store(dir.path()).await;
            store
                .add(vec![chunk("m.pdf", 0, "conteúdo")], vec![vec![0.5, 0.5]])
                .await
                .unwrap();
        }
        let reloaded = ready_store(dir.path()).await;
        assert_eq!(reloaded.stats().await.unwrap().total_documents, 1);
        assert!(reloaded.has_source("m.pdf").await.unwrap());
    }

    /// Linha truncada no log (crash simulado) é descartada sem derrubar o load.
    #[tokio::test]
    async fn test_truncated_log_line_recovers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ready_store(dir.path()).await;
            store
                .add(vec![chunk("m.pdf", 0, "ok")], vec![vec![1.0]])
                .await
                .unwrap();
        }
        // Simula crash no meio da escrita da segunda linha.
        let log = dir.path().join(APPEND_LOG_FILE);
        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        f.write_all(b"{\"id\":\"trunc").unwrap();

        let reloaded = ready_store(dir.path()).await;
        assert_eq!(reloaded.stats().await.unwrap().total_documents, 1);
    }

    /// compact() é no-op sobre o conteúdo: export antes == export depois.
    #[tokio::test]
    async fn test_compact_preserves_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path()).await;
        for i in 0..5 {
            store
                .add(
                    vec![chunk("m.pdf", i, &format!("bloco {}", i))],
                    vec![vec![i as f32, 1.0]],
                )
                .await
                .unwrap();
        }
        let antes: Vec<String> = store
            .export_corpus(100, None)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();

        let outcome = store.compact().await.unwrap();
        assert_eq!(outcome.snapshot_records, 5);
        assert_eq!(outcome.folded_from_log, 5);

        // Reload a partir do snapshot (log truncado).
        let reloaded = ready_store(dir.path()).await;
        let depois: Vec<String> = reloaded
            .export_corpus(100, None)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        let a: std::collections::HashSet<_> = antes.into_iter().collect();
        let b: std::collections::HashSet<_> = depois.into_iter().collect();
        assert_eq!(a, b);
    }

    /// remove_sources elimina todos os chunks da fonte e reporta contagens.
    #[tokio::test]
    async fn test_remove_sources() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path()).await;
        store
            .add(
                vec![
                    chunk("a.pdf", 0, "um"),
                    chunk("a.pdf", 1, "dois"),
                    chunk("b.pdf", 0, "três"),
                ],
                vec![vec![1.0], vec![0.5], vec![0.2]],
            )
            .await
            .unwrap();

        let outcome = store.remove_sources(&["a.pdf".to_string()]).await.unwrap();
        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.remaining, 1);
        assert!(!store.has_source("a.pdf").await.unwrap());

        let out = store.search(&[1.0], 10, None).await.unwrap();
        assert!(out.hits.iter().all(|h| h.metadata.source != "a.pdf"));
    }

    /// Duplicata por id sobrescreve em vez de duplicar.
    #[tokio::test]
    async fn test_upsert_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path()).await;
        let mut c = chunk("a.pdf", 0, "versão 1");
        c.id = "fixo".into();
        store.add(vec![c.clone()], vec![vec![1.0]]).await.unwrap();
        c.content = "versão 2".into();
        store.add(vec![c], vec![vec![0.0]]).await.unwrap();

        assert_eq!(store.stats().await.unwrap().total_documents, 1);
        let corpus = store.export_corpus(10, None).await.unwrap();
        assert_eq!(corpus[0].content, "versão 2");
    }

    /// Busca lexical encontra o chunk por termo, mesmo com acentuação diferente.
    #[tokio::test]
    async fn test_lexical_search() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path()).await;
        store
            .add(
                vec![
                    chunk("a.pdf", 0, "procedimento de medição da tensão no conector"),
                    chunk("b.pdf", 0, "tabela de torque dos parafusos"),
                ],
                vec![vec![1.0], vec![0.0]],
            )
            .await
            .unwrap();

        let hits = store.lexical_search("medicao tensao", 5, None).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].metadata.source, "a.pdf");
    }

    /// Scroll pagina o índice inteiro com cursor opaco.
    #[tokio::test]
    async fn test_scroll() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path()).await;
        for i in 0..5 {
            store
                .add(vec![chunk("m.pdf", i, "x")], vec![vec![1.0]])
                .await
                .unwrap();
        }
        let p1 = store.scroll(None, 2).await.unwrap();
        assert_eq!(p1.records.len(), 2);
        let p2 = store.scroll(p1.next.clone(), 2).await.unwrap();
        assert_eq!(p2.records.len(), 2);
        let p3 = store.scroll(p2.next.clone(), 2).await.unwrap();
        assert_eq!(p3.records.len(), 1);
        assert!(p3.next.is_none());
    }
}
