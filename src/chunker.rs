//! # Chunker — Do Texto Extraído às Unidades de Recuperação
//!
//! Divide o texto normalizado (com marcadores `--- Página N ---`) em
//! chunks prontos para embedding. Três famílias por bloco de página:
//!
//! | Família | Tipo | Recorte |
//! |---------|------|---------|
//! | Código de falha | `fault_code` | 2 linhas antes + linha + 4 depois, verbatim |
//! | Semântica | `semantic` | seções por cabeçalho, janela ~1000/200 |
//! | Janela de página | `page_window` | janela deslizante ~1200/220 |
//!
//! A janela de página é uma segunda visão do mesmo conteúdo — captura o
//! que as fronteiras de seção recortaram mal.
//!
//! ## Deduplicação
//!
//! Um set por ingestão guarda a assinatura de prefixo normalizado
//! (lowercase, espaços colapsados, primeiros 240 chars) de cada chunk
//! emitido; chunks posteriores com assinatura repetida são descartados.
//! `chunk_index` é o contador monotônico de emissão, compartilhado
//! pelas três famílias.
//!
//! ## Fallback
//!
//! Se nada acima render chunks, uma única janela deslizante sobre o
//! texto inteiro garante que o documento não fica fora do índice.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::store::{Chunk, ChunkMetadata, ChunkType};

/// Janela das seções semânticas.
const SEMANTIC_SIZE: usize = 1000;
const SEMANTIC_OVERLAP: usize = 200;
/// Janela deslizante por página.
const PAGE_WINDOW_SIZE: usize = 1200;
const PAGE_WINDOW_OVERLAP: usize = 220;
/// Contexto em volta de um código de falha.
const FAULT_LINES_BEFORE: usize = 2;
const FAULT_LINES_AFTER: usize = 4;
/// Conteúdo mínimo de um chunk após normalização.
const MIN_CHUNK_CHARS: usize = 25;
/// Tamanho da assinatura de deduplicação.
const DEDUP_PREFIX_CHARS: usize = 240;

/// Metadados de documento aplicados a todos os chunks de uma ingestão.
pub struct ChunkParams {
    pub source: String,
    pub brand_name: Option<String>,
    pub title: String,
    pub num_pages: usize,
    pub ocr_used: bool,
    pub ocr_partial: bool,
    pub uploaded_at: Option<String>,
    pub reindexed_at: Option<String>,
}

fn re_page_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^--- Página (\d+)( \(OCR\))? ---$").unwrap())
}

fn re_fault_numeric() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{3,4})\s+\p{L}").unwrap())
}

fn re_fault_keyword() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:falha|erro|fault|code|c[óo]digo)\s*[:#-]?\s*([A-Za-z]{0,2}\d{2,4})\b")
            .unwrap()
    })
}

fn re_fault_letter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Z])\s*-?\s*(\d{2,4})\b").unwrap())
}

fn re_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)^(?:
                \d+(?:\.\d+)*[.)]?\s+\S        # 1. / 2.3 / 4) seção enumerada
              | \#{1,6}\s                      # heading markdown
              | (?:CAP[ÍI]TULO|SE[ÇC][ÃA]O|PARTE)\s+\d+
              | ---\ Página\ \d+
            )",
        )
        .unwrap()
    })
}

/// Linha-título em caixa alta: só maiúsculas, ≥ 3 letras, curta.
fn is_caps_title(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.chars().count() > 80 {
        return false;
    }
    let letters: Vec<char> = trimmed.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() >= 3 && letters.iter().all(|c| c.is_uppercase())
}

/// Assinatura de deduplicação: lowercase, espaços colapsados, 240 chars.
fn dedup_signature(content: &str) -> String {
    content
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(DEDUP_PREFIX_CHARS)
        .collect()
}

/// Bloco de página: conteúdo + número + flag de OCR.
struct PageBlock {
    page: Option<u32>,
    ocr: bool,
    content: String,
}

/// Separa o texto nos blocos de página pelos marcadores.
fn split_pages(text: &str) -> Vec<PageBlock> {
    let re = re_page_marker();
    let mut blocks = Vec::new();
    let mut last_end = 0usize;
    let mut pending: Option<(Option<u32>, bool)> = Some((None, false));

    for m in re.captures_iter(text) {
        let whole = m.get(0).unwrap();
        let before = &text[last_end..whole.start()];
        if let Some((page, ocr)) = pending.take() {
            if !before.trim().is_empty() {
                blocks.push(PageBlock {
                    page,
                    ocr,
                    content: before.trim().to_string(),
                });
            }
        }
        let page = m[1].parse::<u32>().ok();
        let ocr = m.get(2).is_some();
        pending = Some((page, ocr));
        last_end = whole.end();
    }

    let tail = &text[last_end..];
    if let Some((page, ocr)) = pending {
        if !tail.trim().is_empty() {
            blocks.push(PageBlock {
                page,
                ocr,
                content: tail.trim().to_string(),
            });
        }
    }
    blocks
}

/// Detecta um código de falha na linha e devolve o código normalizado
/// (maiúsculas, sem espaços internos).
fn fault_code_in_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if let Some(c) = re_fault_numeric().captures(trimmed) {
        return Some(c[1].to_string());
    }
    if let Some(c) = re_fault_keyword().captures(trimmed) {
        return Some(c[1].to_uppercase());
    }
    if let Some(c) = re_fault_letter().captures(trimmed) {
        return Some(format!("{}{}", &c[1], &c[2]));
    }
    None
}

/// Janela deslizante alinhada à fronteira mais próxima (`\n\n`, `\n`,
/// `". "`), olhando para trás dentro da metade final da janela.
fn sliding_windows(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let total = chars.len();
    if total == 0 {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut start = 0usize;
    while start < total {
        let mut end = (start + size).min(total);
        if end < total {
            let start_byte = chars[start].0;
            let end_byte = byte_at(&chars, end, text.len());
            let window = &text[start_byte..end_byte];
            // Procura a última fronteira na segunda metade da janela.
            let floor = window_floor(window, size);
            for boundary in ["\n\n", "\n", ". "] {
                if let Some(pos) = window.rfind(boundary) {
                    if pos >= floor {
                        let cut_byte = start_byte + pos + boundary.len();
                        end = chars
                            .iter()
                            .position(|&(b, _)| b >= cut_byte)
                            .unwrap_or(total);
                        break;
                    }
                }
            }
        }

        let start_byte = chars[start].0;
        let end_byte = byte_at(&chars, end, text.len());
        let piece = text[start_byte..end_byte].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }

        if end >= total {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }
    out
}

fn byte_at(chars: &[(usize, char)], pos: usize, len: usize) -> usize {
    if pos >= chars.len() {
        len
    } else {
        chars[pos].0
    }
}

/// Fronteira não pode cair antes da metade da janela (em bytes,
/// aproximação suficiente para o alinhamento).
fn window_floor(window: &str, size: usize) -> usize {
    (window.len() / 2).min(size / 2)
}

/// Divide um bloco de página em seções por cabeçalhos.
fn split_sections(content: &str) -> Vec<String> {
    let mut sections: Vec<Vec<&str>> = vec![Vec::new()];
    for line in content.lines() {
        let starts_section = re_heading().is_match(line.trim()) || is_caps_title(line);
        if starts_section && !sections.last().map(|s| s.is_empty()).unwrap_or(true) {
            sections.push(Vec::new());
        }
        if let Some(current) = sections.last_mut() {
            current.push(line);
        }
    }
    sections
        .into_iter()
        .map(|lines| lines.join("\n").trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Emissor com dedup e contador de índice compartilhados.
struct Emitter<'a> {
    params: &'a ChunkParams,
    seen: HashSet<String>,
    next_index: usize,
    chunks: Vec<Chunk>,
}

impl<'a> Emitter<'a> {
    fn new(params: &'a ChunkParams) -> Self {
        Self {
            params,
            seen: HashSet::new(),
            next_index: 0,
            chunks: Vec::new(),
        }
    }

    fn emit(
        &mut self,
        content: String,
        chunk_type: ChunkType,
        page: Option<u32>,
        fault_code: Option<String>,
        page_ocr: bool,
    ) {
        if content.trim().chars().count() < MIN_CHUNK_CHARS {
            return;
        }
        let signature = dedup_signature(&content);
        if !self.seen.insert(signature) {
            return;
        }
        let p = self.params;
        self.chunks.push(Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            content,
            metadata: ChunkMetadata {
                source: p.source.clone(),
                brand_name: p.brand_name.clone(),
                page,
                chunk_index: self.next_index,
                chunk_type,
                fault_code,
                title: p.title.clone(),
                num_pages: p.num_pages,
                uploaded_at: p.uploaded_at.clone(),
                reindexed_at: p.reindexed_at.clone(),
                ocr_used: p.ocr_used && page_ocr,
                ocr_partial: p.ocr_partial,
            },
        });
        self.next_index += 1;
    }
}

/// Divide o texto de um documento em chunks das três famílias.
pub fn chunk_document(text: &str, params: &ChunkParams) -> Vec<Chunk> {
    let mut emitter = Emitter::new(params);

    for block in split_pages(text) {
        let lines: Vec<&str> = block.content.lines().collect();

        // ── Família 1: códigos de falha (verbatim) ──
        for (i, line) in lines.iter().enumerate() {
            if let Some(code) = fault_code_in_line(line) {
                let from = i.saturating_sub(FAULT_LINES_BEFORE);
                let to = (i + FAULT_LINES_AFTER + 1).min(lines.len());
                let context = lines[from..to].join("\n");
                emitter.emit(
                    format!("CÓDIGO {}\n{}", code, context),
                    ChunkType::FaultCode,
                    block.page,
                    Some(code),
                    block.ocr,
                );
            }
        }

        // ── Família 2: seções semânticas janeladas ──
        for section in split_sections(&block.content) {
            for window in sliding_windows(&section, SEMANTIC_SIZE, SEMANTIC_OVERLAP) {
                emitter.emit(window, ChunkType::Semantic, block.page, None, block.ocr);
            }
        }

        // ── Família 3: janela deslizante da página inteira ──
        for window in sliding_windows(&block.content, PAGE_WINDOW_SIZE, PAGE_WINDOW_OVERLAP) {
            emitter.emit(window, ChunkType::PageWindow, block.page, None, block.ocr);
        }
    }

    // Fallback: janela única sobre o texto inteiro.
    if emitter.chunks.is_empty() {
        for window in sliding_windows(text, PAGE_WINDOW_SIZE, PAGE_WINDOW_OVERLAP) {
            emitter.emit(window, ChunkType::Fallback, None, None, false);
        }
    }

    tracing::debug!(chunks = emitter.chunks.len(), fonte = %params.source, "Chunking concluído");
    emitter.chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ChunkParams {
        ChunkParams {
            source: "manual.pdf".into(),
            brand_name: None,
            title: "manual.pdf".into(),
            num_pages: 1,
            ocr_used: false,
            ocr_partial: false,
            uploaded_at: None,
            reindexed_at: None,
        }
    }

    /// "Código 204" gera chunk fault_code com o contexto em volta.
    #[test]
    fn test_fault_code_chunk() {
        let text = "--- Página 1 ---\nCódigo 204 Falha de freio. Verificar conector CN3.\nMedir tensão nos pinos 1 e 2.";
        let chunks = chunk_document(text, &params());
        let fault: Vec<_> = chunks
            .iter()
            .filter(|c| c.metadata.chunk_type == ChunkType::FaultCode)
            .collect();
        assert_eq!(fault.len(), 1);
        assert_eq!(fault[0].metadata.fault_code.as_deref(), Some("204"));
        assert!(fault[0].content.starts_with("CÓDIGO 204\n"));
        assert!(fault[0].content.contains("conector CN3"));
        assert_eq!(fault[0].metadata.page, Some(1));
    }

    /// As três formas de código são reconhecidas e normalizadas.
    #[test]
    fn test_fault_code_patterns() {
        assert_eq!(fault_code_in_line("204 Falha de freio"), Some("204".into()));
        assert_eq!(fault_code_in_line("Erro: E21 no inversor"), Some("E21".into()));
        assert_eq!(fault_code_in_line("E - 105 porta aberta"), Some("E105".into()));
        assert_eq!(fault_code_in_line("fault # 0042"), Some("0042".into()));
        assert_eq!(fault_code_in_line("texto comum sem código"), None);
        // Dois dígitos soltos não bastam para a forma numérica.
        assert_eq!(fault_code_in_line("42 parafusos"), None);
    }

    /// chunk_index é monotônico e único dentro da ingestão.
    #[test]
    fn test_chunk_index_unique() {
        let body = "Primeira seção sobre o sistema de tração do elevador. ".repeat(60);
        let text = format!("--- Página 1 ---\n{}", body);
        let chunks = chunk_document(&text, &params());
        assert!(chunks.len() > 1);
        let mut indices: Vec<usize> = chunks.iter().map(|c| c.metadata.chunk_index).collect();
        let len = indices.len();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), len);
        assert_eq!(indices[0], 0);
    }

    /// Conteúdo repetido entre famílias é deduplicado pela assinatura.
    #[test]
    fn test_dedup() {
        // Página curta: a seção semântica e a janela de página produzem
        // exatamente o mesmo recorte — só um sobrevive.
        let text = "--- Página 1 ---\nProcedimento de ajuste do freio eletromagnético do motor.";
        let chunks = chunk_document(text, &params());
        assert_eq!(chunks.len(), 1);
    }

    /// Página que só tem espaços não gera chunk algum.
    #[test]
    fn test_whitespace_page() {
        let text = "--- Página 1 ---\n   \n\t\n";
        let chunks = chunk_document(text, &params());
        assert!(chunks.is_empty());
    }

    /// Janelas respeitam overlap e fronteiras de sentença.
    #[test]
    fn test_sliding_windows() {
        let sentence = "Frase sobre manutenção preventiva de elevadores residenciais. ";
        let text = sentence.repeat(40); // ~2400 chars
        let windows = sliding_windows(&text, 1000, 200);
        assert!(windows.len() >= 2);
        for w in &windows {
            assert!(w.chars().count() <= 1000);
        }
        // Overlap: o começo da segunda janela já apareceu na primeira.
        let head: String = windows[1].chars().take(40).collect();
        assert!(windows[0].contains(head.trim()));
    }

    /// Texto sem marcador de página cai no bloco inicial e ainda chunka.
    #[test]
    fn test_text_without_markers() {
        let text = "Descrição geral do quadro de comando e seus principais módulos eletrônicos.";
        let chunks = chunk_document(text, &params());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.page, None);
    }

    /// Cabeçalhos enumerados e em caixa alta abrem seções novas.
    #[test]
    fn test_split_sections() {
        let content = "1. INTRODUÇÃO\ntexto da introdução\nMANUTENÇÃO GERAL\ntexto de manutenção";
        let sections = split_sections(content);
        assert_eq!(sections.len(), 2);
        assert!(sections[0].starts_with("1. INTRODUÇÃO"));
        assert!(sections[1].starts_with("MANUTENÇÃO GERAL"));
    }

    /// Sem nada aproveitável por página, o fallback janela o texto todo.
    #[test]
    fn test_fallback_marked() {
        // Páginas só com linhas curtíssimas: nenhuma família emite, mas
        // o texto inteiro concatenado passa do mínimo.
        let text = "--- Página 1 ---\nab\n--- Página 2 ---\ncd";
        let chunks = chunk_document(text, &params());
        assert!(chunks.iter().all(|c| c.metadata.chunk_type == ChunkType::Fallback));
        assert_eq!(chunks.len(), 1);
    }
}
