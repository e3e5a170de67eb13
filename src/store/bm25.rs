//! # BM25 — Busca Lexical sobre o Corpus
//!
//! Ranking BM25 clássico (k1 = 1.5, b = 0.75) usado pela operação
//! `lexicalSearch` dos dois backends. O índice é construído sobre um
//! corpus limitado e cacheado por TTL curto no chamador — este módulo
//! só conhece tokens e scores.
//!
//! ## Tokenização
//!
//! 1. Decompõe em NFD e descarta marcas combinantes (remove acentos);
//! 2. lowercase;
//! 3. split em qualquer caractere não-alfanumérico;
//! 4. descarta tokens com menos de 2 caracteres.
//!
//! Assim "Verificação" e "verificacao" caem no mesmo token.

use std::collections::HashMap;

use unicode_normalization::UnicodeNormalization;

const K1: f64 = 1.5;
const B: f64 = 0.75;

/// Tokeniza texto para indexação/consulta BM25.
pub fn tokenize(text: &str) -> Vec<String> {
    let sem_acentos: String = text
        .nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect();
    sem_acentos
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_string())
        .collect()
}

/// Índice BM25 sobre um corpus já tokenizado.
pub struct Bm25Index {
    /// Frequência de termos por documento.
    doc_terms: Vec<HashMap<String, usize>>,
    /// Comprimento (em tokens) de cada documento.
    doc_lens: Vec<usize>,
    /// Document frequency de cada termo.
    df: HashMap<String, usize>,
    avg_len: f64,
}

impl Bm25Index {
    /// Constrói o índice a partir dos textos do corpus.
    pub fn build<'a, I: IntoIterator<Item = &'a str>>(texts: I) -> Self {
        let mut doc_terms = Vec::new();
        let mut doc_lens = Vec::new();
        let mut df: HashMap<String, usize> = HashMap::new();

        for text in texts {
            let tokens = tokenize(text);
            doc_lens.push(tokens.len());
            let mut tf: HashMap<String, usize> = HashMap::new();
            for t in tokens {
                *tf.entry(t).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *df.entry(term.clone()).or_insert(0) += 1;
            }
            doc_terms.push(tf);
        }

        let n = doc_lens.len().max(1);
        let avg_len = doc_lens.iter().sum::<usize>() as f64 / n as f64;

        Self {
            doc_terms,
            doc_lens,
            df,
            avg_len: avg_len.max(1.0),
        }
    }

    pub fn len(&self) -> usize {
        self.doc_terms.len()
    }

    /// Score BM25 da query contra cada documento do corpus.
    ///
    /// Retorna apenas documentos com score > 0, ordenados decrescente;
    /// empates mantêm a ordem do corpus.
    pub fn score(&self, query: &str) -> Vec<(usize, f64)> {
        let n = self.doc_terms.len();
        if n == 0 {
            return Vec::new();
        }
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut scores = vec![0.0f64; n];
        for term in &query_tokens {
            let Some(&df) = self.df.get(term) else { continue };
            // IDF com a correção +1 padrão (nunca negativo).
            let idf = (((n as f64 - df as f64 + 0.5) / (df as f64 + 0.5)) + 1.0).ln();
            for (i, tf_map) in self.doc_terms.iter().enumerate() {
                let Some(&tf) = tf_map.get(term) else { continue };
                let tf = tf as f64;
                let len_norm = 1.0 - B + B * (self.doc_lens[i] as f64 / self.avg_len);
                scores[i] += idf * (tf * (K1 + 1.0)) / (tf + K1 * len_norm);
            }
        }

        let mut ranked: Vec<(usize, f64)> = scores
            .into_iter()
            .enumerate()
            .filter(|(_, s)| *s > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Acentos somem e tokens curtos são descartados.
    #[test]
    fn test_tokenize() {
        let tokens = tokenize("Verificação do conector CN3 — código 204!");
        assert!(tokens.contains(&"verificacao".to_string()));
        assert!(tokens.contains(&"cn3".to_string()));
        assert!(tokens.contains(&"204".to_string()));
        // "do" tem 2 chars e fica; "—" e "!" somem
        assert!(tokens.contains(&"do".to_string()));
        assert!(!tokens.iter().any(|t| t.len() < 2));
    }

    /// O documento que contém os termos da query ranqueia primeiro.
    #[test]
    fn test_score_ranking() {
        let corpus = [
            "freio de emergência acionado pela placa LCB",
            "procedimento de lubrificação das guias",
            "falha 204 freio verificar conector CN3 freio",
        ];
        let index = Bm25Index::build(corpus.iter().copied());
        let ranked = index.score("falha 204 do freio");
        assert!(!ranked.is_empty());
        assert_eq!(ranked[0].0, 2);
    }

    /// Query sem nenhum termo do corpus produz lista vazia.
    #[test]
    fn test_score_no_match() {
        let index = Bm25Index::build(["manual da porta de pavimento"].iter().copied());
        assert!(index.score("xyzw").is_empty());
        assert!(index.score("").is_empty());
    }
}
