//! # Reparo de Encoding — Mojibake Latin-1
//!
//! Algumas fontes upstream entregam UTF-8 que em algum ponto foi
//! decodificado como Latin-1 ("VerificaÃ§Ã£o"). O reparo reinterpreta
//! os bytes como Latin-1 e re-decodifica como UTF-8, mantendo o
//! resultado **apenas se** o score de mojibake diminuir.
//!
//! O score conta os sintomas clássicos: `Ã`, `Â`, U+FFFD e pontos de
//! controle C1. Pares residuais que a reinterpretação não resolve caem
//! numa tabela ordenada de substituição.

/// Pares residuais, aplicados em ordem (os compostos vêm antes).
const REPLACEMENTS: &[(&str, &str)] = &[
    ("Ã¡", "á"),
    ("Ã¢", "â"),
    ("Ã£", "ã"),
    ("Ã ", "à"),
    ("Ã©", "é"),
    ("Ãª", "ê"),
    ("Ã­", "í"),
    ("Ã³", "ó"),
    ("Ã´", "ô"),
    ("Ãµ", "õ"),
    ("Ãº", "ú"),
    ("Ã§", "ç"),
    ("Ã‰", "É"),
    ("Ã‡", "Ç"),
    ("Ã•", "Õ"),
    ("Â°", "°"),
    ("Âº", "º"),
    ("Âª", "ª"),
];

/// Conta sintomas de mojibake: `Ã`, `Â`, U+FFFD e controles C1.
fn mojibake_score(text: &str) -> usize {
    text.chars()
        .filter(|&c| {
            c == 'Ã' || c == 'Â' || c == '\u{FFFD}' || ('\u{80}'..='\u{9F}').contains(&c)
        })
        .count()
}

/// Reinterpreta como Latin-1 → UTF-8. Só é possível quando todos os
/// code points cabem em um byte.
fn reinterpret_latin1(text: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(text.len());
    for c in text.chars() {
        let v = c as u32;
        if v > 0xFF {
            return None;
        }
        bytes.push(v as u8);
    }
    String::from_utf8(bytes).ok()
}

/// Repara o texto devolvido pelo modelo, se houver mojibake.
pub fn repair_encoding(text: &str) -> String {
    let score_before = mojibake_score(text);
    if score_before == 0 {
        return text.to_string();
    }

    let mut best = text.to_string();
    if let Some(reinterpreted) = reinterpret_latin1(text) {
        if mojibake_score(&reinterpreted) < score_before {
            best = reinterpreted;
        }
    }

    // Tabela ordenada para os pares que sobraram.
    for (from, to) in REPLACEMENTS {
        if best.contains(from) {
            best = best.replace(from, to);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    /// O caso clássico: UTF-8 lido como Latin-1 volta ao original.
    #[test]
    fn test_roundtrip_repair() {
        assert_eq!(repair_encoding("VerificaÃ§Ã£o da tensÃ£o"), "Verificação da tensão");
        assert_eq!(repair_encoding("CÃ³digo 204"), "Código 204");
    }

    /// Texto saudável passa intacto — inclusive acentos legítimos.
    #[test]
    fn test_healthy_text_untouched() {
        let text = "Verificação concluída: nenhum código ativo.";
        assert_eq!(repair_encoding(text), text);
    }

    /// Texto misto (tem chars > U+00FF) cai na tabela de substituição.
    #[test]
    fn test_replacement_table_fallback() {
        let text = "Ver seÃ§Ã£o 3 → detalhes";
        assert_eq!(repair_encoding(text), "Ver seção 3 → detalhes");
    }

    #[test]
    fn test_score() {
        assert_eq!(mojibake_score("abc"), 0);
        assert!(mojibake_score("Ã£Â") >= 2);
    }
}
