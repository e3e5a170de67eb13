//! # Motor de OCR — Pool Compartilhado de Workers
//!
//! Reconhece texto em imagens de páginas usando um pool de N workers
//! (default 4, teto 8), cada um single-threaded por dentro. O pool é
//! inicializado preguiçosamente no primeiro uso, compartilhado entre
//! requisições, e encerrado no shutdown do processo.
//!
//! ## Modos
//!
//! | Modo | Motor | Observação |
//! |------|-------|------------|
//! | `tesseract` (default) | binário `tesseract` do sistema | `por+eng`, `--psm 6`, espaços preservados |
//! | `vision` | modelo de visão | transcrição Markdown literal, sentinela `[PAGINA_ILEGIVEL]` |
//!
//! ## Timeouts
//!
//! ```text
//! por página  → 60 s (default) corre contra o reconhecimento;
//!               perder a corrida = página sem texto, job continua
//! global      → 30 min (default) encerra novos despachos;
//!               páginas já concluídas viram resultado PARCIAL
//! ```
//!
//! Não há cancelamento de páginas já em andamento — o pipeline apenas
//! para de despachar trabalho novo.
//!
//! ## Encerramento
//!
//! `terminate()` limpa a referência compartilhada **antes** do teardown
//! dos workers, para que usuários concorrentes observem "sem pool" em
//! vez de um worker meio-desmontado.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::config::{Config, OcrMode};
use crate::generation::GenerationClient;

/// Prompt do modo de visão: transcrição literal, sem interpretação.
const VISION_PROMPT: &str = "Transcreva o conteúdo desta página de manual técnico em Markdown, \
de forma literal e completa. Preserve tabelas, códigos de falha, números de peça e unidades \
exatamente como aparecem. Não resuma, não interprete, não acrescente nada. \
Se a página for ilegível, responda exatamente [PAGINA_ILEGIVEL].";

/// Sentinela devolvida pelo modo de visão para páginas ilegíveis.
const UNREADABLE_SENTINEL: &str = "[PAGINA_ILEGIVEL]";

/// Capacidade da fila de cada worker.
const WORKER_QUEUE: usize = 8;

/// Imagem rasterizada de uma página, pronta para reconhecimento.
pub struct PageImage {
    pub page_number: u32,
    pub png: Vec<u8>,
}

/// Resultado do reconhecimento de um conjunto de páginas.
#[derive(Debug, Default)]
pub struct OcrOutcome {
    /// Texto por número de página (apenas páginas com texto).
    pub pages: HashMap<u32, String>,
    /// `true` quando o deadline global interrompeu o despacho.
    pub partial: bool,
    /// Páginas efetivamente processadas (com ou sem texto).
    pub pages_processed: usize,
}

pub type OcrProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

struct PageJob {
    png: Vec<u8>,
    reply: oneshot::Sender<Result<String>>,
}

struct OcrPool {
    workers: Vec<mpsc::Sender<PageJob>>,
    next: AtomicUsize,
}

impl OcrPool {
    /// Próximo worker em round-robin.
    fn pick(&self) -> &mpsc::Sender<PageJob> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[i]
    }
}

/// Motor de OCR com pool compartilhado e preguiçoso.
pub struct OcrEngine {
    mode: OcrMode,
    worker_count: usize,
    page_timeout: Duration,
    global_timeout: Duration,
    generator: Arc<GenerationClient>,
    /// Mutex de criação: garante um único pool mesmo sob corrida.
    pool: tokio::sync::Mutex<Option<Arc<OcrPool>>>,
}

impl OcrEngine {
    pub fn new(cfg: &Config, generator: Arc<GenerationClient>) -> Self {
        Self {
            mode: cfg.ocr_mode,
            worker_count: cfg.ocr_workers,
            page_timeout: Duration::from_millis(cfg.ocr_page_timeout_ms),
            global_timeout: Duration::from_millis(cfg.ocr_global_timeout_ms),
            generator,
            pool: tokio::sync::Mutex::new(None),
        }
    }

    /// Devolve o pool, criando-o no primeiro uso.
    async fn pool(&self) -> Arc<OcrPool> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return pool.clone();
        }

        let mut workers = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            let (tx, rx) = mpsc::channel::<PageJob>(WORKER_QUEUE);
            match self.mode {
                OcrMode::Tesseract => spawn_tesseract_worker(worker_id, rx),
                OcrMode::Vision => spawn_vision_worker(worker_id, rx, self.generator.clone()),
            }
            workers.push(tx);
        }
        tracing::info!(workers = self.worker_count, modo = ?self.mode, "Pool de OCR inicializado");

        let pool = Arc::new(OcrPool {
            workers,
            next: AtomicUsize::new(0),
        });
        *guard = Some(pool.clone());
        pool
    }

    /// Encerra o pool compartilhado.
    ///
    /// A referência compartilhada é limpa primeiro; só então os canais
    /// dos workers são derrubados (os loops saem quando o sender some).
    pub async fn terminate(&self) {
        let old = {
            let mut guard = self.pool.lock().await;
            guard.take()
        };
        if let Some(pool) = old {
            drop(pool);
            tracing::info!("Pool de OCR encerrado");
        }
    }

    /// Reconhece um conjunto de páginas, respeitando os dois timeouts.
    pub async fn ocr_pages(
        &self,
        images: Vec<PageImage>,
        on_progress: Option<OcrProgressFn>,
    ) -> OcrOutcome {
        if images.is_empty() {
            return OcrOutcome::default();
        }
        let pool = self.pool().await;
        let total = images.len();
        let deadline = tokio::time::Instant::now() + self.global_timeout;
        let done = AtomicUsize::new(0);

        enum PageResult {
            Text(u32, String),
            Empty,
            AfterDeadline,
        }

        let results: Vec<PageResult> = futures_util::stream::iter(images.into_iter().map(|img| {
            let pool = pool.clone();
            let done = &done;
            let on_progress = on_progress.clone();
            let page_timeout = self.page_timeout;
            async move {
                // Deadline global: páginas ainda não despachadas são abandonadas.
                if tokio::time::Instant::now() >= deadline {
                    return PageResult::AfterDeadline;
                }

                let page_number = img.page_number;
                let (reply_tx, reply_rx) = oneshot::channel();
                let job = PageJob {
                    png: img.png,
                    reply: reply_tx,
                };
                if pool.pick().send(job).await.is_err() {
                    tracing::warn!(pagina = page_number, "Worker de OCR indisponível");
                    return PageResult::Empty;
                }

                let outcome = tokio::time::timeout(page_timeout, reply_rx).await;
                let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(cb) = on_progress {
                    cb(current, total);
                }

                match outcome {
                    Ok(Ok(Ok(text))) if !text.trim().is_empty() => {
                        PageResult::Text(page_number, text)
                    }
                    Ok(Ok(Ok(_))) => PageResult::Empty,
                    Ok(Ok(Err(e))) => {
                        tracing::warn!(pagina = page_number, error = %e, "OCR da página falhou");
                        PageResult::Empty
                    }
                    Ok(Err(_)) => PageResult::Empty,
                    Err(_) => {
                        // Corrida perdida: a página fica sem texto, o job segue.
                        tracing::warn!(pagina = page_number, "Timeout de OCR por página");
                        PageResult::Empty
                    }
                }
            }
        }))
        .buffer_unordered(self.worker_count)
        .collect()
        .await;

        let mut outcome = OcrOutcome::default();
        for r in results {
            match r {
                PageResult::Text(page, text) => {
                    outcome.pages.insert(page, text);
                    outcome.pages_processed += 1;
                }
                PageResult::Empty => outcome.pages_processed += 1,
                PageResult::AfterDeadline => outcome.partial = true,
            }
        }
        if outcome.partial {
            tracing::warn!(
                processadas = outcome.pages_processed,
                total,
                "Deadline global de OCR atingido, resultado parcial"
            );
        }
        outcome
    }
}

/// Worker do modo tesseract: roda o binário do sistema, uma página por vez.
fn spawn_tesseract_worker(worker_id: usize, mut rx: mpsc::Receiver<PageJob>) {
    tokio::spawn(async move {
        tracing::debug!(worker = worker_id, "Worker tesseract iniciado");
        let scratch = std::env::temp_dir().join(format!("manual-chat-ocr-{}", worker_id));
        while let Some(job) = rx.recv().await {
            let result = run_tesseract(&scratch, &job.png).await;
            let _ = job.reply.send(result);
        }
        let _ = std::fs::remove_dir_all(&scratch);
        tracing::debug!(worker = worker_id, "Worker tesseract encerrado");
    });
}

/// Executa o tesseract sobre uma imagem e devolve o texto reconhecido.
///
/// Parâmetros fixos: `por+eng` (manuais bilíngues), `--psm 6` (bloco
/// uniforme — segmentação que lida melhor com tabelas e diagramas) e
/// `preserve_interword_spaces=1`.
async fn run_tesseract(scratch: &std::path::Path, png: &[u8]) -> Result<String> {
    std::fs::create_dir_all(scratch).context("Falha ao criar diretório de trabalho do OCR")?;
    let input = scratch.join(format!("{}.png", uuid::Uuid::new_v4()));
    std::fs::write(&input, png).context("Falha ao escrever imagem temporária")?;

    let output = tokio::process::Command::new("tesseract")
        .arg(&input)
        .arg("stdout")
        .args(["-l", "por+eng", "--psm", "6", "-c", "preserve_interword_spaces=1"])
        .output()
        .await
        .context("Falha ao executar o binário tesseract")?;

    let _ = std::fs::remove_file(&input);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("tesseract saiu com erro: {}", stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Worker do modo visão: envia a página ao modelo com o prompt de
/// transcrição literal.
fn spawn_vision_worker(
    worker_id: usize,
    mut rx: mpsc::Receiver<PageJob>,
    generator: Arc<GenerationClient>,
) {
    tokio::spawn(async move {
        tracing::debug!(worker = worker_id, "Worker de visão iniciado");
        while let Some(job) = rx.recv().await {
            let result = generator
                .generate_vision(VISION_PROMPT, &job.png, "image/png")
                .await
                .map(clean_vision_text);
            let _ = job.reply.send(result);
        }
        tracing::debug!(worker = worker_id, "Worker de visão encerrado");
    });
}

/// Remove a sentinela de ilegibilidade — página ilegível vira texto vazio.
fn clean_vision_text(text: String) -> String {
    if text.contains(UNREADABLE_SENTINEL) {
        String::new()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Páginas ilegíveis no modo visão não rendem texto.
    #[test]
    fn test_vision_sentinel() {
        assert_eq!(clean_vision_text("[PAGINA_ILEGIVEL]".into()), "");
        assert_eq!(clean_vision_text("  [PAGINA_ILEGIVEL]\n".into()), "");
        assert_eq!(clean_vision_text("Texto normal".into()), "Texto normal");
    }

    /// O round-robin distribui os despachos entre todos os workers.
    #[tokio::test]
    async fn test_round_robin() {
        let (tx_a, _rx_a) = mpsc::channel::<PageJob>(1);
        let (tx_b, _rx_b) = mpsc::channel::<PageJob>(1);
        let pool = OcrPool {
            workers: vec![tx_a, tx_b],
            next: AtomicUsize::new(0),
        };
        let first = pool.pick() as *const _;
        let second = pool.pick() as *const _;
        let third = pool.pick() as *const _;
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    /// terminate() é idempotente e limpa a referência compartilhada.
    #[tokio::test]
    async fn test_terminate_clears_pool() {
        let cfg = crate::config::Config::from_env();
        let generator = Arc::new(GenerationClient::new(&cfg));
        let engine = OcrEngine::new(&cfg, generator);
        let _ = engine.pool().await;
        assert!(engine.pool.lock().await.is_some());
        engine.terminate().await;
        assert!(engine.pool.lock().await.is_none());
        engine.terminate().await; // segunda chamada não explode
    }
}
