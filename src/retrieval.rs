//! # Retrieval Core — Da Pergunta à Resposta com Fontes
//!
//! Coordena o caminho de consulta inteiro:
//!
//! ```text
//! Pergunta + histórico
//!   ├── 1. Cache de resposta (TTL 5 min; histórico SEMPRE ignora cache)
//!   ├── 2. Sinais: placas (lista canônica) + códigos de erro (regex)
//!   ├── 3. Expansão multi-query: 2 reformulações via LLM (fail-open)
//!   ├── 4. Recuperação paralela + merge por (fonte, chunkIndex), max sim
//!   ├── 5. Threshold 0.55 + diversidade (15 docs, 8 por fonte)
//!   ├── 6. Roteamento de clarificação (seleção vazia, ou termos de
//!   │      hardware sem placa identificada — nunca orientação elétrica
//!   │      genérica sem placa/modelo)
//!   ├── 7. Montagem do prompt guardrail (constante versionada)
//!   ├── 8. Geração + reparo de encoding
//!   └── 9. Resposta {answer, sources, searchTimeMs} + telemetria
//! ```
//!
//! ## Prompt-como-configuração
//!
//! O prompt guardrail vive numa constante única; [`PROMPT_VERSION`]
//! entra na chave do cache de resposta, então editar o prompt invalida
//! as respostas cacheadas.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingClient;
use crate::encoding::repair_encoding;
use crate::generation::GenerationClient;
use crate::store::{SearchHit, StoreError, VectorStore};
use crate::telemetry::{QueryTelemetry, TelemetryRing, TELEMETRY_CAP};

/// Similaridade mínima para um candidato entrar no contexto.
const SIMILARITY_THRESHOLD: f32 = 0.55;
/// Máximo de chunks no contexto final.
const MAX_CONTEXT_DOCS: usize = 15;
/// Teto por fonte — um manual grande não monopoliza o contexto.
const MAX_PER_SOURCE: usize = 8;
/// TTL do cache de respostas.
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Capacidade do cache de respostas.
const CACHE_CAP: usize = 200;
/// Prefixo da pergunta usado na chave do cache.
const CACHE_KEY_PREFIX: usize = 200;
/// Turnos de usuário olhados na extração de sinais.
const SIGNAL_HISTORY_TURNS: usize = 12;
/// Turnos de usuário concatenados na query primária enriquecida.
const PRIMARY_HISTORY_TURNS: usize = 10;
/// Teto de caracteres da query primária enriquecida.
const PRIMARY_QUERY_CHARS: usize = 700;
/// Turnos recentes mostrados ao modelo.
const HISTORY_BLOCK_TURNS: usize = 10;
/// Truncamento das falas do assistente no bloco de histórico.
const ASSISTANT_TRUNCATE: usize = 500;
/// Teto de fontes listadas numa clarificação.
const CLARIFICATION_SOURCES: usize = 20;
/// Teto de códigos de erro extraídos.
const MAX_ERROR_TOKENS: usize = 6;

/// Versão do prompt guardrail — entra na chave do cache.
pub const PROMPT_VERSION: u8 = 3;

/// Prompt guardrail, em constante única versionada.
const SYSTEM_PROMPT: &str = "Você é um assistente técnico de manutenção de elevadores. Responda SEMPRE em português brasileiro.

REGRAS OBRIGATÓRIAS:
1. Use SOMENTE as informações presentes no CONTEXTO abaixo. Se o contexto não cobre a pergunta, diga isso claramente e peça os dados que faltam.
2. NUNCA invente códigos de falha, nomes de placas, conectores, pinos ou valores de tensão que não estejam no contexto.
3. NÃO sugira marcas ou modelos de exemplo entre parênteses.
4. Use exatamente a terminologia que aparece no contexto (se o manual diz \"LCB II\", não escreva \"placa principal\").
5. Lembre-se do que o usuário já disse no HISTÓRICO e não pergunte de novo o que já foi respondido.
6. Cite o procedimento do manual passo a passo quando ele existir no contexto.";

/// Lista canônica de placas reconhecidas nos sinais.
const BOARD_TOKENS: &[&str] = &[
    "LCBII", "LCB", "MCSS", "MCP100", "MCP", "MCB", "RBI", "GMUX", "PLA6001", "DCB", "PIB",
    "GCIOB", "URM", "CAVF", "GDCB",
];

fn re_error_token() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Z]{1,4}\s?-?\s?\d{1,4}|E\s?\d{2,4}|\d{2,4})\b").unwrap()
    })
}

fn re_hardware_terms() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)tens[ãa]o|alimenta|jump|bypass|medi[çc][ãa]o|conector|pino|pinagem|reset|drive|inversor",
        )
        .unwrap()
    })
}

/// Mensagem do histórico de conversa.
#[derive(Clone, Debug, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub text: String,
}

impl HistoryMessage {
    fn is_user(&self) -> bool {
        self.role.eq_ignore_ascii_case("user")
    }
}

/// Atribuição de fonte devolvida junto com a resposta.
#[derive(Clone, Debug, Serialize)]
pub struct SourceAttribution {
    pub source: String,
    pub similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

/// Resposta completa de uma consulta.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceAttribution>,
    pub search_time_ms: u64,
    pub from_cache: bool,
    /// `true` quando a resposta é um pedido de esclarecimento.
    pub clarification: bool,
}

/// Falha visível de uma consulta.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("índice carregando: {0}")]
    NotReady(String),
    #[error("provedor externo falhou: {0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for QueryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotReady(p) => QueryError::NotReady(p),
            StoreError::Backend(e) => QueryError::Internal(e),
        }
    }
}

// ─── Cache de respostas ──────────────────────────────────────────

struct CachedAnswer {
    at: Instant,
    response: QueryResponse,
}

struct ResponseCache {
    map: HashMap<String, CachedAnswer>,
    order: VecDeque<String>,
}

impl ResponseCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<QueryResponse> {
        let entry = self.map.get(key)?;
        (entry.at.elapsed() < CACHE_TTL).then(|| entry.response.clone())
    }

    fn insert(&mut self, key: String, response: QueryResponse) {
        if self
            .map
            .insert(key.clone(), CachedAnswer { at: Instant::now(), response })
            .is_none()
        {
            self.order.push_back(key);
            if self.order.len() > CACHE_CAP {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                }
            }
        }
    }
}

/// Chave do cache: versão do prompt + prefixo normalizado + marca.
fn cache_key(question: &str, brand_filter: Option<&str>) -> String {
    let prefix: String = question
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(CACHE_KEY_PREFIX)
        .collect();
    format!(
        "v{}|{}|{}",
        PROMPT_VERSION,
        prefix,
        brand_filter.unwrap_or("").to_lowercase()
    )
}

// ─── Extração de sinais ──────────────────────────────────────────

/// Placas presentes no texto, por match exato de token contra a lista
/// canônica.
pub fn extract_board_tokens(text: &str) -> Vec<String> {
    let tokens: HashSet<String> = text
        .to_uppercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect();
    BOARD_TOKENS
        .iter()
        .filter(|b| tokens.contains(**b))
        .map(|b| b.to_string())
        .collect()
}

/// Códigos de erro candidatos: maiúsculos, sem espaços internos,
/// deduplicados, comprimento 2–8, no máximo 6.
pub fn extract_error_tokens(text: &str) -> Vec<String> {
    let upper = text.to_uppercase();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cap in re_error_token().captures_iter(&upper) {
        let raw: String = cap[1].chars().filter(|c| !c.is_whitespace()).collect();
        let len = raw.chars().count();
        if (2..=8).contains(&len) && seen.insert(raw.clone()) {
            out.push(raw);
            if out.len() == MAX_ERROR_TOKENS {
                break;
            }
        }
    }
    out
}

/// A pergunta fala de procedimento elétrico/físico?
pub fn has_hardware_terms(text: &str) -> bool {
    re_hardware_terms().is_match(text)
}

/// Query primária enriquecida: últimos turnos de usuário + pergunta +
/// sufixo de sinais, cortada aos últimos 700 caracteres (a pergunta
/// atual fica no fim e sobrevive ao corte).
fn build_primary_query(
    question: &str,
    history: &[HistoryMessage],
    boards: &[String],
    errors: &[String],
) -> String {
    let mut parts: Vec<String> = history
        .iter()
        .filter(|m| m.is_user())
        .rev()
        .take(PRIMARY_HISTORY_TURNS)
        .map(|m| m.text.trim().to_string())
        .collect::<Vec<_>>();
    parts.reverse();
    parts.push(question.trim().to_string());

    let mut enriched = parts.join("\n");
    if !boards.is_empty() {
        enriched.push_str(&format!(" [placas: {}]", boards.join(", ")));
    }
    if !errors.is_empty() {
        enriched.push_str(&format!(" [códigos: {}]", errors.join(", ")));
    }

    let total = enriched.chars().count();
    if total > PRIMARY_QUERY_CHARS {
        enriched.chars().skip(total - PRIMARY_QUERY_CHARS).collect()
    } else {
        enriched
    }
}

/// Candidato após o merge multi-query.
struct Candidate {
    hit: SearchHit,
    similarity: f32,
}

/// Merge por `(fonte, chunkIndex)` mantendo a MAIOR similaridade;
/// empates preservam a ordem de primeira aparição.
fn merge_candidates(result_sets: Vec<Vec<SearchHit>>) -> Vec<Candidate> {
    let mut index: HashMap<(String, usize), usize> = HashMap::new();
    let mut merged: Vec<Candidate> = Vec::new();

    for hits in result_sets {
        for hit in hits {
            let key = (hit.metadata.source.clone(), hit.metadata.chunk_index);
            match index.get(&key) {
                Some(&pos) => {
                    if hit.similarity > merged[pos].similarity {
                        merged[pos].similarity = hit.similarity;
                    }
                }
                None => {
                    index.insert(key, merged.len());
                    merged.push(Candidate {
                        similarity: hit.similarity,
                        hit,
                    });
                }
            }
        }
    }

    // Sort estável: empates ficam na ordem de primeira aparição.
    merged.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

/// Threshold + diversidade: até 15 chunks, no máximo 8 da mesma fonte.
fn select_diverse(candidates: &[Candidate]) -> Vec<&Candidate> {
    let mut per_source: HashMap<&str, usize> = HashMap::new();
    let mut selected = Vec::new();
    for c in candidates {
        if c.similarity < SIMILARITY_THRESHOLD {
            continue;
        }
        let count = per_source.entry(c.hit.metadata.source.as_str()).or_insert(0);
        if *count >= MAX_PER_SOURCE {
            continue;
        }
        *count += 1;
        selected.push(c);
        if selected.len() == MAX_CONTEXT_DOCS {
            break;
        }
    }
    selected
}

// ─── Núcleo ──────────────────────────────────────────────────────

/// Núcleo de recuperação e montagem de resposta.
pub struct RetrievalCore {
    store: Arc<dyn VectorStore>,
    embedder: Arc<EmbeddingClient>,
    generator: Arc<GenerationClient>,
    cache: Mutex<ResponseCache>,
    telemetry: TelemetryRing,
}

impl RetrievalCore {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<EmbeddingClient>,
        generator: Arc<GenerationClient>,
    ) -> Self {
        Self {
            store,
            embedder,
            generator,
            cache: Mutex::new(ResponseCache::new()),
            telemetry: TelemetryRing::new(TELEMETRY_CAP),
        }
    }

    pub fn telemetry_snapshot(&self) -> Vec<QueryTelemetry> {
        self.telemetry.snapshot()
    }

    fn record_telemetry(
        &self,
        question: &str,
        brand_filter: Option<&str>,
        num_queries: usize,
        candidates: usize,
        selected: usize,
        top_similarity: f32,
        sources: Vec<String>,
        cache_hit: bool,
        search_time_ms: u64,
    ) {
        self.telemetry.record(QueryTelemetry {
            timestamp: Utc::now().to_rfc3339(),
            question: question.chars().take(200).collect(),
            brand_filter: brand_filter.map(|b| b.to_string()),
            num_queries,
            candidates,
            selected,
            top_similarity,
            sources,
            cache_hit,
            search_time_ms,
        });
    }

    /// Caminho completo de uma consulta.
    pub async fn answer_question(
        &self,
        question: &str,
        top_k: usize,
        brand_filter: Option<&str>,
        history: &[HistoryMessage],
    ) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        let top_k = top_k.clamp(1, 20);

        // ── 1. Cache (histórico presente sempre ignora) ──
        let key = cache_key(question, brand_filter);
        if history.is_empty() {
            if let Some(mut cached) = self.cache.lock().get(&key) {
                cached.from_cache = true;
                let sources = cached.sources.iter().map(|s| s.source.clone()).collect();
                self.record_telemetry(
                    question,
                    brand_filter,
                    0,
                    0,
                    cached.sources.len(),
                    cached.sources.first().map(|s| s.similarity).unwrap_or(0.0),
                    sources,
                    true,
                    started.elapsed().as_millis() as u64,
                );
                return Ok(cached);
            }
        }

        // ── 2. Sinais da pergunta + últimos turnos de usuário ──
        let signal_text = {
            let mut text: Vec<&str> = history
                .iter()
                .filter(|m| m.is_user())
                .rev()
                .take(SIGNAL_HISTORY_TURNS)
                .map(|m| m.text.as_str())
                .collect();
            text.reverse();
            text.push(question);
            text.join("\n")
        };
        let boards = extract_board_tokens(&signal_text);
        let errors = extract_error_tokens(&signal_text);

        // ── 6 (antecipado). Guarda de hardware: termos elétricos sem
        // placa identificada pedem esclarecimento, com ou sem candidatos. ──
        if has_hardware_terms(question) && boards.is_empty() {
            return self
                .clarification_response(question, brand_filter, &boards, &errors, started)
                .await;
        }

        // ── 3. Expansão multi-query (fail-open) ──
        let primary = build_primary_query(question, history, &boards, &errors);
        let mut queries = vec![primary.clone()];
        match self.expand_queries(&primary).await {
            Ok(mut extra) => queries.append(&mut extra),
            Err(e) => {
                tracing::warn!(error = %e, "Expansão de queries falhou, seguindo só com a primária");
            }
        }

        // ── 4. Recuperação paralela + merge ──
        let searches = queries.iter().map(|q| async {
            let vector = self.embedder.embed_one(q).await?;
            let outcome = self
                .store
                .search(&vector, top_k * 2, brand_filter)
                .await
                .map_err(QueryError::from)?;
            Ok::<_, QueryError>(outcome.hits)
        });
        let results = futures_util::future::join_all(searches).await;

        let mut result_sets = Vec::new();
        let mut first_error: Option<QueryError> = None;
        for r in results {
            match r {
                Ok(hits) => result_sets.push(hits),
                Err(e) => {
                    tracing::warn!(error = %e, "Uma das buscas multi-query falhou");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if result_sets.is_empty() {
            return Err(first_error.unwrap_or_else(|| {
                QueryError::Internal(anyhow::anyhow!("nenhuma busca concluída"))
            }));
        }

        let num_queries = queries.len();
        let candidates = merge_candidates(result_sets);
        let total_candidates = candidates.len();

        // ── 5. Threshold + diversidade ──
        let selected = select_diverse(&candidates);

        // ── 6. Clarificação por seleção vazia ──
        if selected.is_empty() {
            return self
                .clarification_response(question, brand_filter, &boards, &errors, started)
                .await;
        }

        // ── 7. Montagem ──
        let context = selected
            .iter()
            .map(|c| format!("[FONTE: {}]\n{}", c.hit.metadata.source, c.hit.content))
            .collect::<Vec<_>>()
            .join("\n---\n");
        let history_block = build_history_block(history);
        let prompt = format!(
            "{}\n\n### CONTEXTO DOS MANUAIS\n{}\n\n### HISTÓRICO RECENTE\n{}\n\n### PERGUNTA\n{}\n\nResposta:",
            SYSTEM_PROMPT, context, history_block, question
        );

        // ── 8. Geração + reparo ──
        let raw_answer = self
            .generator
            .generate(&prompt)
            .await
            .map_err(|e| QueryError::Upstream(e.to_string()))?;
        let answer = repair_encoding(&raw_answer);

        // ── 9. Resposta, cache e telemetria ──
        let mut sources = Vec::new();
        let mut seen_sources = HashSet::new();
        for c in &selected {
            if seen_sources.insert(c.hit.metadata.source.clone()) {
                sources.push(SourceAttribution {
                    source: c.hit.metadata.source.clone(),
                    similarity: c.similarity,
                    page: c.hit.metadata.page,
                });
            }
        }

        let search_time_ms = started.elapsed().as_millis() as u64;
        let response = QueryResponse {
            answer,
            sources,
            search_time_ms,
            from_cache: false,
            clarification: false,
        };

        if history.is_empty() {
            self.cache.lock().insert(key, response.clone());
        }
        self.record_telemetry(
            question,
            brand_filter,
            num_queries,
            total_candidates,
            selected.len(),
            selected.first().map(|c| c.similarity).unwrap_or(0.0),
            response.sources.iter().map(|s| s.source.clone()).collect(),
            false,
            search_time_ms,
        );

        Ok(response)
    }

    /// Pede exatamente 2 reformulações ao modelo. Regras estritas: sem
    /// entidades inventadas, tokens técnicos preservados.
    async fn expand_queries(&self, primary: &str) -> anyhow::Result<Vec<String>> {
        let prompt = format!(
            "Gere exatamente 2 reformulações da consulta técnica abaixo, uma por linha, sem numeração.\n\
             Regras: não invente marcas, modelos, placas ou códigos que não estão na consulta; \
             preserve tokens técnicos (códigos, siglas) exatamente como escritos; \
             mantenha o idioma original.\n\nConsulta: {}",
            primary
        );
        let raw = self.generator.generate(&prompt).await?;
        let reformulations: Vec<String> = raw
            .lines()
            .map(|l| l.trim().trim_start_matches(['-', '*', '1', '2', '.', ')']).trim())
            .filter(|l| !l.is_empty())
            .take(2)
            .map(|l| l.to_string())
            .collect();
        anyhow::ensure!(!reformulations.is_empty(), "modelo não devolveu reformulações");
        Ok(reformulations)
    }

    /// Resposta de clarificação: lista fontes disponíveis e 2–3
    /// perguntas do catálogo, pulando o que os sinais já trazem.
    async fn clarification_response(
        &self,
        question: &str,
        brand_filter: Option<&str>,
        boards: &[String],
        errors: &[String],
        started: Instant,
    ) -> Result<QueryResponse, QueryError> {
        let all_sources = self.store.indexed_sources().await?;
        let listed: Vec<String> = all_sources.into_iter().take(CLARIFICATION_SOURCES).collect();

        let mut questions = vec!["Qual o modelo do elevador?".to_string()];
        if boards.is_empty() {
            questions.push("Qual a placa envolvida (ex: LCB, MCB, GDCB)?".to_string());
        }
        if errors.is_empty() {
            questions.push("Aparece algum código de erro no display? Qual?".to_string());
        }
        let questions: Vec<String> = questions.into_iter().take(3).collect();

        let mut answer = String::from(
            "Para responder com segurança preciso de mais detalhes — orientação elétrica genérica sem saber a placa e o modelo pode causar dano ao equipamento.\n",
        );
        if !listed.is_empty() {
            answer.push_str(&format!("\nManuais indexados: {}.\n", listed.join(", ")));
        }
        answer.push_str("\nMe diga:\n");
        for q in &questions {
            answer.push_str(&format!("- {}\n", q));
        }

        let search_time_ms = started.elapsed().as_millis() as u64;
        self.record_telemetry(
            question,
            brand_filter,
            0,
            0,
            0,
            0.0,
            Vec::new(),
            false,
            search_time_ms,
        );

        Ok(QueryResponse {
            answer,
            sources: Vec::new(),
            search_time_ms,
            from_cache: false,
            clarification: true,
        })
    }
}

/// Bloco de histórico recente: últimos 10 turnos, falas do assistente
/// truncadas em 500 caracteres.
fn build_history_block(history: &[HistoryMessage]) -> String {
    if history.is_empty() {
        return "(sem histórico)".to_string();
    }
    let start = history.len().saturating_sub(HISTORY_BLOCK_TURNS);
    history[start..]
        .iter()
        .map(|m| {
            if m.is_user() {
                format!("Usuário: {}", m.text.trim())
            } else {
                let truncated: String = m.text.trim().chars().take(ASSISTANT_TRUNCATE).collect();
                format!("Assistente: {}", truncated)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChunkMetadata, ChunkType};

    fn hit(source: &str, index: usize, sim: f32) -> SearchHit {
        SearchHit {
            id: format!("{}-{}", source, index),
            content: format!("conteúdo {}", index),
            metadata: ChunkMetadata {
                source: source.to_string(),
                brand_name: None,
                page: Some(1),
                chunk_index: index,
                chunk_type: ChunkType::Semantic,
                fault_code: None,
                title: String::new(),
                num_pages: 1,
                uploaded_at: None,
                reindexed_at: None,
                ocr_used: false,
                ocr_partial: false,
            },
            similarity: sim,
        }
    }

    /// Tokens de placa saem por match exato — LCBII não vira LCB.
    #[test]
    fn test_board_tokens() {
        let boards = extract_board_tokens("A placa LCBII está com a falha, não a MCB");
        assert!(boards.contains(&"LCBII".to_string()));
        assert!(boards.contains(&"MCB".to_string()));
        assert!(!boards.contains(&"LCB".to_string()));
        assert!(extract_board_tokens("elevador parado no térreo").is_empty());
    }

    /// Códigos de erro: maiúsculos, sem espaço, dedup, teto de 6.
    #[test]
    fn test_error_tokens() {
        let errors = extract_error_tokens("falha e21 e também E 21, além do 204");
        assert!(errors.contains(&"E21".to_string()));
        assert!(errors.contains(&"204".to_string()));
        assert_eq!(errors.iter().filter(|t| *t == "E21").count(), 1);

        let many = extract_error_tokens("10 20 30 40 50 60 70 80");
        assert!(many.len() <= 6);
    }

    #[test]
    fn test_hardware_terms() {
        assert!(has_hardware_terms("preciso jumpear a placa"));
        assert!(has_hardware_terms("qual a tensão de alimentação?"));
        assert!(has_hardware_terms("como faço a medicao no conector"));
        assert!(!has_hardware_terms("qual o significado da falha 204?"));
    }

    /// Merge mantém a maior similaridade e a ordem de primeira aparição
    /// nos empates.
    #[test]
    fn test_merge_candidates() {
        let set_a = vec![hit("a.pdf", 0, 0.70), hit("b.pdf", 1, 0.60)];
        let set_b = vec![hit("a.pdf", 0, 0.90), hit("c.pdf", 2, 0.60)];
        let merged = merge_candidates(vec![set_a, set_b]);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].hit.metadata.source, "a.pdf");
        assert!((merged[0].similarity - 0.90).abs() < 1e-6);
        // Empate 0.60: b.pdf apareceu primeiro.
        assert_eq!(merged[1].hit.metadata.source, "b.pdf");
        assert_eq!(merged[2].hit.metadata.source, "c.pdf");
    }

    /// Threshold 0.55 e teto de 8 por fonte / 15 no total.
    #[test]
    fn test_select_diverse() {
        let mut sets = vec![Vec::new()];
        for i in 0..12 {
            sets[0].push(hit("grande.pdf", i, 0.90 - i as f32 * 0.01));
        }
        for i in 0..5 {
            sets[0].push(hit("pequeno.pdf", i, 0.70));
        }
        sets[0].push(hit("fraco.pdf", 0, 0.40)); // abaixo do threshold

        let candidates = merge_candidates(sets);
        let selected = select_diverse(&candidates);

        let grandes = selected
            .iter()
            .filter(|c| c.hit.metadata.source == "grande.pdf")
            .count();
        assert_eq!(grandes, MAX_PER_SOURCE);
        assert!(selected.len() <= MAX_CONTEXT_DOCS);
        assert!(selected.iter().all(|c| c.similarity >= SIMILARITY_THRESHOLD));
    }

    /// A query primária preserva a pergunta atual quando estoura o teto.
    #[test]
    fn test_primary_query_truncation() {
        let history: Vec<HistoryMessage> = (0..20)
            .map(|i| HistoryMessage {
                role: "user".into(),
                text: format!("turno antigo número {} com bastante texto repetido", i),
            })
            .collect();
        let primary = build_primary_query("qual a falha 204?", &history, &[], &[]);
        assert!(primary.chars().count() <= PRIMARY_QUERY_CHARS);
        assert!(primary.ends_with("qual a falha 204?"));
    }

    /// Sufixo de sinais entra na query primária.
    #[test]
    fn test_primary_query_signals() {
        let primary = build_primary_query(
            "falha na placa",
            &[],
            &["LCB".to_string()],
            &["E21".to_string()],
        );
        assert!(primary.contains("[placas: LCB]"));
        assert!(primary.contains("[códigos: E21]"));
    }

    /// A chave de cache embute a versão do prompt e a marca.
    #[test]
    fn test_cache_key() {
        let a = cache_key("Qual  a falha   204?", Some("Otis"));
        let b = cache_key("qual a falha 204?", Some("otis"));
        assert_eq!(a, b);
        assert!(a.starts_with(&format!("v{}|", PROMPT_VERSION)));
        assert_ne!(cache_key("x", None), cache_key("x", Some("Otis")));
    }

    /// Falas do assistente truncam em 500 chars no bloco de histórico.
    #[test]
    fn test_history_block() {
        let history = vec![
            HistoryMessage {
                role: "user".into(),
                text: "pergunta".into(),
            },
            HistoryMessage {
                role: "assistant".into(),
                text: "r".repeat(900),
            },
        ];
        let block = build_history_block(&history);
        assert!(block.starts_with("Usuário: pergunta"));
        let assistant_line = block.lines().last().unwrap();
        assert!(assistant_line.chars().count() <= ASSISTANT_TRUNCATE + 20);
    }
}
