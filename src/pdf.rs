//! # Extração de PDF — Texto com Ordem de Leitura + OCR Seletivo
//!
//! Este módulo transforma os bytes de um PDF no texto que alimenta o
//! chunker, decidindo página a página se vale a pena pagar OCR.
//!
//! ## Pipeline de Extração
//!
//! ```text
//! bytes do PDF
//!   ├── 1. Passe de texto → glifos com posição (x, y) por página
//!   │      └── ordem de leitura: linhas por y quantizado (passo 2),
//!   │          de cima para baixo; palavras por x crescente
//!   ├── 2. Detecção de páginas fracas (< 120 chars) e documento
//!   │      scan-like (passe falhou ou média < 50 chars/página)
//!   ├── 3. OCR seletivo: rasteriza SÓ as páginas fracas (escala
//!   │      segura, fallback único para 1.0) e roda o pool de OCR
//!   ├── 4. Intercala `--- Página N ---` / `--- Página N (OCR) ---`
//!   └── 5. Normaliza (CRLF→LF, linhas em branco, NBSP, espaços)
//! ```
//!
//! ## Semântica de Falha
//!
//! Arquivo de 0 bytes ou ilegível falha rápido com erro próprio.
//! Falha de OCR cai para o que o passe de texto produziu; menos de
//! 20 caracteres no texto combinado é falha de extração.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use pdf_extract::{MediaBox, OutputDev, OutputError, Transform};
use unicode_normalization::UnicodeNormalization;

use crate::ocr::{OcrEngine, OcrOutcome, OcrProgressFn, PageImage};

/// Página com menos caracteres que isto é "fraca" e candidata a OCR.
const WEAK_PAGE_CHARS: usize = 120;
/// Documento com média de caracteres por página abaixo disto é scan-like.
const SCAN_LIKE_AVG_CHARS: usize = 50;
/// Texto combinado abaixo disto é falha de extração.
const MIN_COMBINED_CHARS: usize = 20;
/// Passo de quantização do eixo y ao agrupar glifos em linhas.
const LINE_QUANT_STEP: f64 = 2.0;

/// Falha de extração, distinguível por classe.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("arquivo PDF vazio (0 bytes)")]
    EmptyFile,
    #[error("PDF ilegível: {0}")]
    Unreadable(String),
    #[error("texto insuficiente após extração ({0} caracteres)")]
    InsufficientText(usize),
}

/// Resultado completo da extração de um documento.
#[derive(Debug)]
pub struct ExtractedDocument {
    /// Texto combinado e normalizado, com marcadores de página.
    pub text: String,
    pub num_pages: usize,
    /// Título declarado no dicionário Info do PDF, se houver.
    pub info: Option<String>,
    pub ocr_used: bool,
    pub ocr_chars: usize,
    /// `true` quando o deadline global de OCR cortou o processamento.
    pub ocr_partial: bool,
    pub ocr_pages_processed: usize,
}

// ─── Passe de texto posicional ───────────────────────────────────

/// Palavra reconstruída com a posição do primeiro glifo.
#[derive(Debug, Clone)]
struct Word {
    x: f64,
    y: f64,
    text: String,
}

/// `OutputDev` que coleta palavras com posição por página, em vez de
/// texto corrido — a ordem de leitura é reconstruída depois.
#[derive(Default)]
struct PositionalDevice {
    pages: Vec<Vec<Word>>,
    current_page: Vec<Word>,
    current_word: String,
    word_origin: Option<(f64, f64)>,
}

impl PositionalDevice {
    fn flush_word(&mut self) {
        if let Some((x, y)) = self.word_origin.take() {
            let text = std::mem::take(&mut self.current_word);
            if !text.trim().is_empty() {
                self.current_page.push(Word { x, y, text });
            }
        } else {
            self.current_word.clear();
        }
    }
}

impl OutputDev for PositionalDevice {
    fn begin_page(
        &mut self,
        _page_num: u32,
        _media_box: &MediaBox,
        _art_box: Option<(f64, f64, f64, f64)>,
    ) -> Result<(), OutputError> {
        self.current_page = Vec::new();
        Ok(())
    }

    fn end_page(&mut self) -> Result<(), OutputError> {
        self.flush_word();
        self.pages.push(std::mem::take(&mut self.current_page));
        Ok(())
    }

    fn output_character(
        &mut self,
        trm: &Transform,
        _width: f64,
        _spacing: f64,
        _font_size: f64,
        char: &str,
    ) -> Result<(), OutputError> {
        if self.word_origin.is_none() {
            self.word_origin = Some((trm.m31, trm.m32));
        }
        self.current_word.push_str(char);
        Ok(())
    }

    fn begin_word(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    fn end_word(&mut self) -> Result<(), OutputError> {
        self.flush_word();
        Ok(())
    }

    fn end_line(&mut self) -> Result<(), OutputError> {
        self.flush_word();
        Ok(())
    }
}

/// Reconstrói o texto de uma página a partir das palavras posicionadas.
///
/// Linhas agrupam por y quantizado (passo 2) e ordenam de cima para
/// baixo (y decrescente — o eixo y do PDF cresce para cima); dentro da
/// linha, palavras por x crescente, unidas com espaço único.
fn assemble_page_text(words: &[Word]) -> String {
    let mut lines: BTreeMap<i64, Vec<&Word>> = BTreeMap::new();
    for w in words {
        let band = (w.y / LINE_QUANT_STEP).round() as i64;
        lines.entry(band).or_default().push(w);
    }

    let mut out = Vec::with_capacity(lines.len());
    for (_, mut line) in lines.into_iter().rev() {
        line.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal));
        let text = line
            .iter()
            .map(|w| w.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !text.is_empty() {
            out.push(text);
        }
    }
    out.join("\n").trim().to_string()
}

/// Passe de texto completo: devolve o texto por página e o título.
///
/// O pdf-extract pode entrar em pânico com PDFs malformados — o passe
/// roda sob `catch_unwind` e o pânico vira erro comum.
fn text_pass(bytes: &[u8]) -> Result<(Vec<String>, Option<String>)> {
    let outcome = std::panic::catch_unwind(|| -> Result<(Vec<String>, Option<String>)> {
        let doc = lopdf::Document::load_mem(bytes).context("Falha ao parsear o PDF")?;
        let title = pdf_title(&doc);
        let mut device = PositionalDevice::default();
        pdf_extract::output_doc(&doc, &mut device)
            .map_err(|e| anyhow::anyhow!("Falha no passe de texto: {:?}", e))?;
        let pages = device.pages.iter().map(|p| assemble_page_text(p)).collect();
        Ok((pages, title))
    });
    match outcome {
        Ok(result) => result,
        Err(_) => anyhow::bail!("Pânico no parser de PDF"),
    }
}

/// Título do dicionário Info, quando presente e legível.
fn pdf_title(doc: &lopdf::Document) -> Option<String> {
    let info = doc.trailer.get(b"Info").ok()?;
    let dict = match info {
        lopdf::Object::Reference(id) => doc.get_object(*id).ok()?.as_dict().ok()?,
        lopdf::Object::Dictionary(d) => d,
        _ => return None,
    };
    match dict.get(b"Title").ok()? {
        lopdf::Object::String(bytes, _) => {
            let title = String::from_utf8_lossy(bytes).trim().to_string();
            (!title.is_empty()).then_some(title)
        }
        _ => None,
    }
}

// ─── Rasterização (pdfium) ───────────────────────────────────────

/// Rasteriza páginas para PNG. `pages = None` rasteriza todas.
/// Devolve também o total de páginas do documento.
fn render_pages_blocking(
    bytes: &[u8],
    pages: Option<&[u32]>,
    scale: f32,
) -> Result<(Vec<PageImage>, usize)> {
    use pdfium_render::prelude::*;

    let bindings = Pdfium::bind_to_system_library()
        .or_else(|_| {
            Pdfium::bind_to_library(&Pdfium::pdfium_platform_library_name_at_path("./"))
        })
        .map_err(|e| anyhow::anyhow!("Biblioteca pdfium indisponível: {:?}", e))?;
    let pdfium = Pdfium::new(bindings);
    let doc = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| anyhow::anyhow!("pdfium não abriu o documento: {:?}", e))?;

    let total = doc.pages().len() as usize;
    let wanted: Vec<u32> = match pages {
        Some(list) => list.to_vec(),
        None => (1..=total as u32).collect(),
    };

    let config = PdfRenderConfig::new().scale_page_by_factor(scale);
    let mut images = Vec::with_capacity(wanted.len());
    for page_number in wanted {
        if page_number == 0 || page_number as usize > total {
            continue;
        }
        let page = doc
            .pages()
            .get((page_number - 1) as u16)
            .map_err(|e| anyhow::anyhow!("Página {} inacessível: {:?}", page_number, e))?;
        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| anyhow::anyhow!("Falha ao rasterizar página {}: {:?}", page_number, e))?;
        let image = bitmap.as_image();
        let mut png = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .context("Falha ao codificar PNG")?;
        images.push(PageImage { page_number, png });
    }
    Ok((images, total))
}

// ─── Normalização ────────────────────────────────────────────────

/// Normaliza o texto combinado: NFC, CRLF→LF, NBSP→espaço, runs de
/// 3+ linhas em branco viram 2, runs de 2+ espaços viram 1.
pub fn normalize_text(text: &str) -> String {
    let nfc: String = text.nfc().collect();
    let mut s = nfc.replace("\r\n", "\n").replace('\u{00A0}', " ");

    static MULTI_SPACE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    static MULTI_BLANK: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let spaces = MULTI_SPACE.get_or_init(|| regex::Regex::new(r"[ \t]{2,}").unwrap());
    let blanks = MULTI_BLANK.get_or_init(|| regex::Regex::new(r"\n{3,}").unwrap());

    s = spaces.replace_all(&s, " ").into_owned();
    s = blanks.replace_all(&s, "\n\n").into_owned();
    s.trim().to_string()
}

// ─── Extrator ────────────────────────────────────────────────────

/// Extrator de PDF com decisão de OCR seletivo.
pub struct PdfExtractor {
    ocr: Arc<OcrEngine>,
    img_scale: f32,
}

impl PdfExtractor {
    pub fn new(ocr: Arc<OcrEngine>, img_scale: f32) -> Self {
        Self {
            ocr,
            img_scale: img_scale.clamp(1.0, 3.0),
        }
    }

    /// Extração completa, com OCR seletivo quando necessário.
    pub async fn extract(
        &self,
        bytes: Vec<u8>,
        on_ocr_progress: Option<OcrProgressFn>,
    ) -> Result<ExtractedDocument> {
        if bytes.is_empty() {
            return Err(ExtractError::EmptyFile.into());
        }

        // Passe de texto em thread blocking (CPU-bound).
        let pass_bytes = bytes.clone();
        let pass = tokio::task::spawn_blocking(move || text_pass(&pass_bytes))
            .await
            .context("Task de extração abortada")?;

        let (pages, info) = match pass {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(error = %e, "Passe de texto falhou, documento tratado como scan");
                (Vec::new(), None)
            }
        };

        let parse_failed = pages.is_empty();
        let total_chars: usize = pages.iter().map(|p| p.chars().count()).sum();
        let avg_chars = total_chars / pages.len().max(1);
        let scan_like = parse_failed || avg_chars < SCAN_LIKE_AVG_CHARS;

        let weak_pages: Vec<u32> = pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.chars().count() < WEAK_PAGE_CHARS)
            .map(|(i, _)| (i + 1) as u32)
            .collect();

        // Texto forte em todas as páginas: não paga OCR.
        if !scan_like && weak_pages.is_empty() {
            let text = normalize_text(&join_pages(&pages, &HashMap::new()));
            return finish(text, pages.len(), info, OcrOutcome::default(), false);
        }

        tracing::info!(
            paginas_fracas = weak_pages.len(),
            scan_like,
            "Acionando OCR seletivo"
        );

        // Rasteriza só as páginas fracas (ou todas, se o parse falhou).
        let targets: Option<Vec<u32>> = if parse_failed {
            None
        } else {
            Some(weak_pages.clone())
        };
        let rendered = self.render_with_fallback(&bytes, targets.as_deref()).await;

        let (images, page_count) = match rendered {
            Ok(ok) => ok,
            Err(e) => {
                // Sem rasterizador, fica o que o passe de texto deu.
                tracing::warn!(error = %e, "Rasterização indisponível, seguindo sem OCR");
                let text = normalize_text(&join_pages(&pages, &HashMap::new()));
                return finish(text, pages.len(), info, OcrOutcome::default(), false);
            }
        };

        let outcome = self.ocr.ocr_pages(images, on_ocr_progress).await;
        let num_pages = if parse_failed { page_count } else { pages.len() };
        let text = if parse_failed {
            // Só OCR: monta as páginas na ordem numérica.
            let mut blocks = Vec::new();
            for page in 1..=num_pages as u32 {
                if let Some(ocr_text) = outcome.pages.get(&page) {
                    blocks.push(format!("--- Página {} (OCR) ---\n{}", page, ocr_text));
                }
            }
            normalize_text(&blocks.join("\n\n"))
        } else {
            normalize_text(&join_pages(&pages, &outcome.pages))
        };

        finish(text, num_pages, info, outcome, true)
    }

    /// Extração sem OCR — fallback do teto supervisório de ingestão.
    pub async fn extract_text_only(&self, bytes: Vec<u8>) -> Result<ExtractedDocument> {
        if bytes.is_empty() {
            return Err(ExtractError::EmptyFile.into());
        }
        let pass = tokio::task::spawn_blocking(move || text_pass(&bytes))
            .await
            .context("Task de extração abortada")?;
        let (pages, info) = pass.map_err(|e| ExtractError::Unreadable(e.to_string()))?;
        let text = normalize_text(&join_pages(&pages, &HashMap::new()));
        finish(text, pages.len(), info, OcrOutcome::default(), false)
    }

    /// Rasteriza na escala configurada; em falha do renderer, um único
    /// fallback automático para escala 1.0.
    async fn render_with_fallback(
        &self,
        bytes: &[u8],
        pages: Option<&[u32]>,
    ) -> Result<(Vec<PageImage>, usize)> {
        let scale = self.img_scale;
        let owned_pages: Option<Vec<u32>> = pages.map(|p| p.to_vec());

        let bytes_a = bytes.to_vec();
        let pages_a = owned_pages.clone();
        let first = tokio::task::spawn_blocking(move || {
            render_pages_blocking(&bytes_a, pages_a.as_deref(), scale)
        })
        .await
        .context("Task de rasterização abortada")?;

        match first {
            Ok(ok) => Ok(ok),
            Err(e) if scale > 1.0 => {
                tracing::warn!(error = %e, escala = scale, "Renderer falhou, tentando escala 1.0");
                let bytes_b = bytes.to_vec();
                tokio::task::spawn_blocking(move || {
                    render_pages_blocking(&bytes_b, owned_pages.as_deref(), 1.0)
                })
                .await
                .context("Task de rasterização abortada")?
            }
            Err(e) => Err(e),
        }
    }
}

/// Junta páginas do passe de texto com blocos de OCR intercalados.
fn join_pages(pages: &[String], ocr: &HashMap<u32, String>) -> String {
    let mut blocks = Vec::with_capacity(pages.len());
    for (i, page_text) in pages.iter().enumerate() {
        let page = (i + 1) as u32;
        match ocr.get(&page) {
            Some(ocr_text) => {
                blocks.push(format!("--- Página {} (OCR) ---\n{}", page, ocr_text));
            }
            None => {
                blocks.push(format!("--- Página {} ---\n{}", page, page_text));
            }
        }
    }
    blocks.join("\n\n")
}

fn finish(
    text: String,
    num_pages: usize,
    info: Option<String>,
    outcome: OcrOutcome,
    ocr_used: bool,
) -> Result<ExtractedDocument> {
    let combined = text.trim().chars().count();
    if combined < MIN_COMBINED_CHARS {
        return Err(ExtractError::InsufficientText(combined).into());
    }
    let ocr_chars = outcome.pages.values().map(|t| t.chars().count()).sum();
    Ok(ExtractedDocument {
        text,
        num_pages,
        info,
        ocr_used,
        ocr_chars,
        ocr_partial: outcome.partial,
        ocr_pages_processed: outcome.pages_processed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(x: f64, y: f64, text: &str) -> Word {
        Word {
            x,
            y,
            text: text.to_string(),
        }
    }

    /// Linhas saem de cima para baixo (y decrescente) e palavras da
    /// esquerda para a direita, mesmo chegando fora de ordem.
    #[test]
    fn test_reading_order() {
        let words = vec![
            word(50.0, 700.0, "de"),
            word(10.0, 720.0, "Manual"),
            word(10.0, 700.0, "Tabela"),
            word(60.0, 720.0, "Elevadores"),
        ];
        let text = assemble_page_text(&words);
        assert_eq!(text, "Manual Elevadores\nTabela de");
    }

    /// Glifos com y quase igual (dentro do passo 2) caem na mesma linha.
    #[test]
    fn test_line_quantization() {
        let words = vec![word(10.0, 700.3, "falha"), word(40.0, 699.8, "204")];
        assert_eq!(assemble_page_text(&words), "falha 204");
    }

    #[test]
    fn test_normalize_text() {
        let raw = "a\r\nb\u{00A0}c\n\n\n\nd   e";
        assert_eq!(normalize_text(raw), "a\nb c\n\nd e");
    }

    /// Arquivo vazio falha rápido com a classe de erro própria.
    #[tokio::test]
    async fn test_empty_file() {
        let cfg = crate::config::Config::from_env();
        let generator = Arc::new(crate::generation::GenerationClient::new(&cfg));
        let ocr = Arc::new(OcrEngine::new(&cfg, generator));
        let extractor = PdfExtractor::new(ocr, 1.5);
        let err = extractor.extract(Vec::new(), None).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::EmptyFile)
        ));
    }

    /// Marcadores de página e intercalação de blocos OCR.
    #[test]
    fn test_join_pages() {
        let pages = vec!["texto forte".to_string(), "".to_string()];
        let mut ocr = HashMap::new();
        ocr.insert(2u32, "texto do scan".to_string());
        let joined = join_pages(&pages, &ocr);
        assert!(joined.contains("--- Página 1 ---\ntexto forte"));
        assert!(joined.contains("--- Página 2 (OCR) ---\ntexto do scan"));
    }

    /// Texto combinado curto demais é falha de extração.
    #[test]
    fn test_insufficient_text() {
        let err = finish("abc".into(), 1, None, OcrOutcome::default(), false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::InsufficientText(_))
        ));
    }
}
