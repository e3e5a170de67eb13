//! # Orquestrador de Ingestão — Upload ao Índice
//!
//! Rege o pipeline por upload, em estágios estritos:
//!
//! ```text
//! Admissão (MIME, teto de tamanho, duplicata)
//!   └── responde IMEDIATAMENTE com taskId; o resto roda em background
//! Extract (status "extracting") — teto supervisório com fallback sem OCR
//! Chunk   — atribuição de marca (parâmetro → pasta → arquivo)
//! Embed   (status "embedding") — progresso por lote
//! Persist (status "saving") — descarta embeddings nulos
//! Done    (progress 100) — registro vive mais 5 min e é coletado
//! ```
//!
//! Depois do `taskId` devolvido, nenhuma falha volta pela resposta
//! HTTP — tudo aparece só em `/api/upload/status/:taskId`.
//!
//! Também moram aqui o **reindex** (regex + marca + dryRun) e o
//! **import em massa** NDJSON (transferência entre deployments, sem
//! re-embeddar).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use crate::brands::detect_brand;
use crate::chunker::{chunk_document, ChunkParams};
use crate::config::Config;
use crate::embedding::{EmbedProgress, EmbeddingClient};
use crate::pdf::{ExtractedDocument, PdfExtractor};
use crate::store::{strip_upload_prefix, Chunk, StoreError, StoredRecord, VectorStore};

/// Tempo que um task terminal permanece consultável antes da coleta.
const TASK_RETENTION: Duration = Duration::from_secs(5 * 60);
/// Intervalo do coletor de tasks terminais.
const GC_INTERVAL: Duration = Duration::from_secs(60);
/// Mínimo de texto aceito no fallback sem OCR do teto supervisório.
const FALLBACK_MIN_CHARS: usize = 30;
/// Lote de escrita do import NDJSON.
const IMPORT_BATCH: usize = 500;

/// Estado de um task de ingestão.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Extracting,
    Embedding,
    Saving,
    Done,
    Error,
}

impl TaskStatus {
    fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }
}

/// Registro efêmero de um upload em processamento.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionTask {
    pub task_id: String,
    pub filename: String,
    pub status: TaskStatus,
    pub message: String,
    pub progress: u8,
    pub pages: usize,
    pub chunks: usize,
    pub started_at: String,
}

struct TaskEntry {
    task: IngestionTask,
    terminal_at: Option<Instant>,
}

/// Resultado da admissão de um upload.
///
/// Os dois braços carregam o nome de fonte visível ao usuário — é a
/// mesma chave que `has_source` consulta, então o cliente pode checar
/// duplicatas com o valor devolvido aqui.
pub enum AdmitOutcome {
    /// Pipeline disparado em background.
    Accepted { task_id: String, filename: String },
    /// Fonte já indexada; arquivo recém-escrito foi apagado.
    Skipped { filename: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexReport {
    pub dry_run: bool,
    pub matched: Vec<String>,
    pub removed_chunks: usize,
    pub added_chunks: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

/// PDF presente no diretório de dados.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskDocument {
    pub name: String,
    pub disk_name: String,
    pub brand: Option<String>,
    pub size_bytes: u64,
}

/// Orquestrador de ingestão.
pub struct Ingestor {
    cfg: Config,
    store: Arc<dyn VectorStore>,
    embedder: Arc<EmbeddingClient>,
    extractor: Arc<PdfExtractor>,
    tasks: Arc<Mutex<HashMap<String, TaskEntry>>>,
}

impl Ingestor {
    pub fn new(
        cfg: Config,
        store: Arc<dyn VectorStore>,
        embedder: Arc<EmbeddingClient>,
        extractor: Arc<PdfExtractor>,
    ) -> Arc<Self> {
        let ingestor = Arc::new(Self {
            cfg,
            store,
            embedder,
            extractor,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        });
        ingestor.clone().spawn_gc();
        ingestor
    }

    /// Coletor periódico de tasks terminais.
    fn spawn_gc(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(GC_INTERVAL);
            loop {
                tick.tick().await;
                let mut tasks = self.tasks.lock();
                tasks.retain(|_, entry| match entry.terminal_at {
                    Some(at) => at.elapsed() < TASK_RETENTION,
                    None => true,
                });
            }
        });
    }

    /// Snapshot de um task para o endpoint de status.
    pub fn task(&self, task_id: &str) -> Option<IngestionTask> {
        self.tasks.lock().get(task_id).map(|e| e.task.clone())
    }

    /// Mutação de task sob o lock do mapa.
    fn update_task(&self, task_id: &str, f: impl FnOnce(&mut IngestionTask)) {
        let mut tasks = self.tasks.lock();
        if let Some(entry) = tasks.get_mut(task_id) {
            f(&mut entry.task);
            if entry.task.status.is_terminal() && entry.terminal_at.is_none() {
                entry.terminal_at = Some(Instant::now());
            }
        }
    }

    /// Admissão de um upload. Persiste em disco, checa duplicata e
    /// dispara o pipeline. Responde antes de qualquer processamento.
    pub async fn admit(
        self: Arc<Self>,
        original_name: &str,
        bytes: Vec<u8>,
        brand_param: Option<String>,
    ) -> Result<AdmitOutcome, StoreError> {
        // Nome único em disco: <millis>-<rand>-<original>. O segmento
        // aleatório reaproveita o gerador de ids (hex minúsculo, então
        // o prefixo continua casando com strip_upload_prefix).
        let millis = Utc::now().timestamp_millis();
        let rand_tag: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(6)
            .collect();
        let disk_name = format!("{}-{}-{}", millis, rand_tag, original_name);

        let dir = match brand_param.as_deref() {
            Some(brand) if !brand.trim().is_empty() => self.cfg.pdf_path.join(brand.trim()),
            _ => self.cfg.pdf_path.clone(),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Falha ao criar diretório de PDFs")?;
        let disk_path = dir.join(&disk_name);
        tokio::fs::write(&disk_path, &bytes)
            .await
            .context("Falha ao gravar PDF em disco")?;

        // Duplicata pelo nome visível: apaga o arquivo novo e pula.
        if self.store.has_source(original_name).await? {
            let _ = tokio::fs::remove_file(&disk_path).await;
            tracing::info!(fonte = %original_name, "Upload pulado: fonte já indexada");
            return Ok(AdmitOutcome::Skipped {
                filename: original_name.to_string(),
            });
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        {
            let mut tasks = self.tasks.lock();
            tasks.insert(
                task_id.clone(),
                TaskEntry {
                    task: IngestionTask {
                        task_id: task_id.clone(),
                        filename: original_name.to_string(),
                        status: TaskStatus::Extracting,
                        message: "Extraindo texto do PDF...".into(),
                        progress: 0,
                        pages: 0,
                        chunks: 0,
                        started_at: Utc::now().to_rfc3339(),
                    },
                    terminal_at: None,
                },
            );
        }

        // Resposta imediata; o pipeline segue em background.
        let ingestor = self.clone();
        let name = original_name.to_string();
        let id = task_id.clone();
        tokio::spawn(async move {
            ingestor
                .run_pipeline(&id, &disk_path, &name, brand_param, false)
                .await;
        });

        Ok(AdmitOutcome::Accepted {
            task_id,
            filename: original_name.to_string(),
        })
    }

    /// Pipeline completo de um documento já em disco.
    ///
    /// `reindex` troca o timestamp gravado nos metadados
    /// (`reindexedAt` em vez de `uploadedAt`).
    async fn run_pipeline(
        self: Arc<Self>,
        task_id: &str,
        disk_path: &Path,
        original_name: &str,
        brand_param: Option<String>,
        reindex: bool,
    ) {
        match self
            .clone()
            .run_pipeline_inner(task_id, disk_path, original_name, brand_param, reindex)
            .await
        {
            Ok((pages, chunks)) => {
                tracing::info!(fonte = %original_name, paginas = pages, chunks, "Ingestão concluída");
            }
            Err(e) => {
                tracing::error!(fonte = %original_name, error = %e, "Ingestão falhou");
                self.update_task(task_id, |t| {
                    t.status = TaskStatus::Error;
                    t.message = format!("Erro: {}", e);
                });
            }
        }
    }

    async fn run_pipeline_inner(
        self: Arc<Self>,
        task_id: &str,
        disk_path: &Path,
        original_name: &str,
        brand_param: Option<String>,
        reindex: bool,
    ) -> Result<(usize, usize)> {
        let bytes = tokio::fs::read(disk_path)
            .await
            .context("Falha ao reler PDF do disco")?;

        // ─── Extract, sob teto supervisório ──────────────────────
        let doc = self.clone().extract_supervised(task_id, bytes).await?;
        let pages = doc.num_pages;
        self.update_task(task_id, |t| {
            t.pages = pages;
            t.progress = 40;
            t.message = format!("Texto extraído: {} páginas", pages);
        });

        // ─── Chunk + marca ───────────────────────────────────────
        let folder = disk_path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());
        let brand_name = detect_brand(brand_param.as_deref(), folder.as_deref(), original_name);

        let now = Utc::now().to_rfc3339();
        let params = ChunkParams {
            source: original_name.to_string(),
            brand_name,
            title: doc
                .info
                .clone()
                .unwrap_or_else(|| original_name.to_string()),
            num_pages: doc.num_pages,
            ocr_used: doc.ocr_used,
            ocr_partial: doc.ocr_partial,
            uploaded_at: (!reindex).then(|| now.clone()),
            reindexed_at: reindex.then(|| now.clone()),
        };
        let chunks = chunk_document(&doc.text, &params);
        if chunks.is_empty() {
            anyhow::bail!("Nenhum chunk gerado a partir do texto extraído");
        }
        let total_chunks = chunks.len();

        // ─── Embed ───────────────────────────────────────────────
        self.update_task(task_id, |t| {
            t.status = TaskStatus::Embedding;
            t.chunks = total_chunks;
            t.message = format!("Gerando embeddings de {} chunks...", total_chunks);
        });

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let ingestor = self.clone();
        let id_for_progress = task_id.to_string();
        let embeddings = self
            .embedder
            .embed_many(
                &texts,
                Some(Arc::new(move |p: EmbedProgress| {
                    ingestor.update_task(&id_for_progress, |t| {
                        // Embedding ocupa a faixa 40–90 do progresso.
                        t.progress = 40 + (p.percentage / 2).min(50);
                        t.message =
                            format!("Embeddings: {} / {} ({}%)", p.current, p.total, p.percentage);
                    });
                })),
            )
            .await?;

        // ─── Persist ─────────────────────────────────────────────
        self.update_task(task_id, |t| {
            t.status = TaskStatus::Saving;
            t.progress = 90;
            t.message = "Gravando no índice...".into();
        });

        let mut kept_chunks = Vec::new();
        let mut kept_embeddings = Vec::new();
        for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
            match embedding {
                Some(e) => {
                    kept_chunks.push(chunk);
                    kept_embeddings.push(e);
                }
                None => {
                    tracing::warn!(indice = chunk.metadata.chunk_index, "Chunk sem embedding descartado");
                }
            }
        }
        if kept_chunks.is_empty() {
            anyhow::bail!("Todos os embeddings falharam");
        }
        let stored = kept_chunks.len();
        self.store
            .add(kept_chunks, kept_embeddings)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        // ─── Done ────────────────────────────────────────────────
        let partial_note = if doc.ocr_partial {
            format!(
                " OCR parcial: {}/{} páginas (timeout).",
                doc.ocr_pages_processed, doc.num_pages
            )
        } else {
            String::new()
        };
        self.update_task(task_id, |t| {
            t.status = TaskStatus::Done;
            t.progress = 100;
            t.chunks = stored;
            t.message = format!(
                "Indexado: {} páginas, {} chunks.{}",
                pages, stored, partial_note
            );
        });

        Ok((pages, stored))
    }

    /// Extração com teto supervisório: no estouro, tenta o caminho sem
    /// OCR antes de desistir.
    async fn extract_supervised(
        self: Arc<Self>,
        task_id: &str,
        bytes: Vec<u8>,
    ) -> Result<ExtractedDocument> {
        let deadline = Duration::from_millis(self.cfg.upload_extract_timeout_ms);
        let ingestor = self.clone();
        let id = task_id.to_string();
        let progress = Arc::new(move |done: usize, total: usize| {
            ingestor.update_task(&id, |t| {
                // OCR ocupa a faixa 10–40 do progresso.
                let pct = 10 + ((done * 30) / total.max(1)) as u8;
                t.progress = pct.min(40);
                t.message = format!("OCR: {} / {} páginas", done, total);
            });
        });

        match tokio::time::timeout(
            deadline,
            self.extractor.extract(bytes.clone(), Some(progress)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = deadline.as_millis() as u64,
                    "Teto supervisório de extração estourou, tentando sem OCR"
                );
                let doc = self.extractor.extract_text_only(bytes).await?;
                if doc.text.trim().chars().count() < FALLBACK_MIN_CHARS {
                    anyhow::bail!("Extração estourou o tempo e o fallback sem OCR rendeu texto insuficiente");
                }
                Ok(doc)
            }
        }
    }

    // ─── Documentos em disco ─────────────────────────────────────

    /// Lista os PDFs no diretório de dados (recursivo, 1 nível de marca).
    pub fn list_documents(&self) -> Vec<DiskDocument> {
        let mut docs = Vec::new();
        collect_pdfs(&self.cfg.pdf_path, None, &mut docs);
        docs.sort_by(|a, b| a.name.cmp(&b.name));
        docs
    }

    /// Apaga todos os PDFs em disco (usado por `/api/clear-all`).
    pub fn delete_all_pdfs(&self) -> Result<usize> {
        let docs = self.list_documents();
        let mut removed = 0usize;
        for doc in &docs {
            let path = match &doc.brand {
                Some(brand) => self.cfg.pdf_path.join(brand).join(&doc.disk_name),
                None => self.cfg.pdf_path.join(&doc.disk_name),
            };
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ─── Reindex ─────────────────────────────────────────────────

    /// Reindexa os PDFs em disco que casam com o regex/marca.
    ///
    /// `dry_run` só reporta o plano. Fora do dry-run, remove os chunks
    /// existentes de cada fonte e roda extract→persist de novo.
    pub async fn reindex(
        self: Arc<Self>,
        include_regex: Option<&str>,
        brand: Option<&str>,
        dry_run: bool,
    ) -> Result<ReindexReport, StoreError> {
        let matcher = match include_regex {
            Some(raw) if !raw.trim().is_empty() => Some(
                regex::RegexBuilder::new(raw)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| StoreError::Backend(anyhow::anyhow!("Regex inválido: {}", e)))?,
            ),
            _ => None,
        };

        let matched: Vec<DiskDocument> = self
            .list_documents()
            .into_iter()
            .filter(|d| {
                matcher.as_ref().map(|re| re.is_match(&d.name)).unwrap_or(true)
            })
            .filter(|d| match brand {
                Some(b) if !b.trim().is_empty() => {
                    let detected =
                        detect_brand(None, d.brand.as_deref(), &d.name).unwrap_or_default();
                    detected.eq_ignore_ascii_case(b.trim())
                        || d.name.to_lowercase().contains(&b.trim().to_lowercase())
                }
                _ => true,
            })
            .collect();

        let names: Vec<String> = matched.iter().map(|d| d.name.clone()).collect();
        if dry_run {
            return Ok(ReindexReport {
                dry_run: true,
                matched: names,
                removed_chunks: 0,
                added_chunks: 0,
            });
        }

        let mut removed_chunks = 0usize;
        let mut added_chunks = 0usize;
        for doc in &matched {
            let outcome = self.store.remove_sources(&[doc.name.clone()]).await?;
            removed_chunks += outcome.removed;

            let disk_path = match &doc.brand {
                Some(brand) => self.cfg.pdf_path.join(brand).join(&doc.disk_name),
                None => self.cfg.pdf_path.join(&doc.disk_name),
            };

            // Task interno para rastrear progresso do reindex também.
            let task_id = uuid::Uuid::new_v4().to_string();
            self.tasks.lock().insert(
                task_id.clone(),
                TaskEntry {
                    task: IngestionTask {
                        task_id: task_id.clone(),
                        filename: doc.name.clone(),
                        status: TaskStatus::Extracting,
                        message: "Reindexando...".into(),
                        progress: 0,
                        pages: 0,
                        chunks: 0,
                        started_at: Utc::now().to_rfc3339(),
                    },
                    terminal_at: None,
                },
            );

            match self
                .clone()
                .run_pipeline_inner(&task_id, &disk_path, &doc.name, doc.brand.clone(), true)
                .await
            {
                Ok((_, chunks)) => {
                    added_chunks += chunks;
                    self.update_task(&task_id, |t| {
                        t.status = TaskStatus::Done;
                        t.progress = 100;
                    });
                }
                Err(e) => {
                    tracing::error!(fonte = %doc.name, error = %e, "Reindex da fonte falhou");
                    self.update_task(&task_id, |t| {
                        t.status = TaskStatus::Error;
                        t.message = format!("Erro: {}", e);
                    });
                }
            }
        }

        Ok(ReindexReport {
            dry_run: false,
            matched: names,
            removed_chunks,
            added_chunks,
        })
    }

    // ─── Import em massa ─────────────────────────────────────────

    /// Carrega registros NDJSON `{id, document, embedding, metadata}`
    /// direto no índice, sem re-embeddar.
    pub async fn import_ndjson(&self, body: &str) -> Result<ImportReport, StoreError> {
        let mut imported = 0usize;
        let mut skipped = 0usize;
        let mut chunks = Vec::new();
        let mut embeddings = Vec::new();

        for line in body.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredRecord>(line) {
                Ok(rec) if !rec.embedding.is_empty() => {
                    chunks.push(Chunk {
                        id: rec.id,
                        content: rec.document,
                        metadata: rec.metadata,
                    });
                    embeddings.push(rec.embedding);
                }
                Ok(_) => skipped += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "Linha de import inválida, pulando");
                    skipped += 1;
                }
            }

            if chunks.len() >= IMPORT_BATCH {
                imported += self
                    .store
                    .add(std::mem::take(&mut chunks), std::mem::take(&mut embeddings))
                    .await?;
            }
        }
        if !chunks.is_empty() {
            imported += self.store.add(chunks, embeddings).await?;
        }

        tracing::info!(importados = imported, pulados = skipped, "Import NDJSON concluído");
        Ok(ImportReport { imported, skipped })
    }
}

/// Varre o diretório de PDFs; subpastas de primeiro nível viram marca.
fn collect_pdfs(dir: &Path, brand: Option<&str>, out: &mut Vec<DiskDocument>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && brand.is_none() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                let owned = name.to_string();
                collect_pdfs(&path, Some(&owned), out);
            }
        } else if path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false)
        {
            let Some(disk_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            out.push(DiskDocument {
                name: strip_upload_prefix(disk_name),
                disk_name: disk_name.to_string(),
                brand: brand.map(|b| b.to_string()),
                size_bytes,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A listagem de disco reconhece subpasta como marca e remove o
    /// prefixo de upload do nome visível.
    #[test]
    fn test_collect_pdfs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Otis")).unwrap();
        std::fs::write(
            dir.path().join("Otis/1733154000123-abc123-Gen2.pdf"),
            b"%PDF",
        )
        .unwrap();
        std::fs::write(dir.path().join("solto.pdf"), b"%PDF").unwrap();
        std::fs::write(dir.path().join("notas.txt"), b"x").unwrap();

        let mut docs = Vec::new();
        collect_pdfs(dir.path(), None, &mut docs);
        docs.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].name, "Gen2.pdf");
        assert_eq!(docs[0].brand.as_deref(), Some("Otis"));
        assert_eq!(docs[1].name, "solto.pdf");
        assert_eq!(docs[1].brand, None);
    }

    /// Status terminais marcam o task para coleta.
    #[test]
    fn test_terminal_status() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Embedding.is_terminal());
    }

    /// O snapshot do task serializa em camelCase para a API.
    #[test]
    fn test_task_wire_format() {
        let task = IngestionTask {
            task_id: "t1".into(),
            filename: "m.pdf".into(),
            status: TaskStatus::Extracting,
            message: String::new(),
            progress: 0,
            pages: 0,
            chunks: 0,
            started_at: Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"taskId\""));
        assert!(json.contains("\"status\":\"extracting\""));
        assert!(json.contains("\"startedAt\""));
    }
}
