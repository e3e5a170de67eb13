//! # Marcas Canônicas — Tabela Fixa de Fabricantes
//!
//! Tabela pequena e fixa de fabricantes de elevadores, usada dos dois
//! lados: na ingestão (atribuir `brandName` aos chunks novos) e na
//! consulta (validar filtros).
//!
//! A atribuição segue a cadeia: parâmetro explícito → nome da pasta →
//! nome do arquivo → `None`.

/// Rótulo canônico e apelidos aceitos (minúsculos).
const CANONICAL_BRANDS: &[(&str, &[&str])] = &[
    ("Otis", &["otis"]),
    ("Orona", &["orona"]),
    ("Schindler", &["schindler", "atlas schindler", "atlas"]),
    ("ThyssenKrupp", &["thyssenkrupp", "thyssen", "tk elevator"]),
    ("Kone", &["kone"]),
    ("Mitsubishi", &["mitsubishi"]),
    ("Hyundai", &["hyundai"]),
    ("Fuji", &["fuji", "fujitec"]),
    ("Villarta", &["villarta"]),
    ("Infolev", &["infolev"]),
];

/// Procura um rótulo canônico dentro de um texto livre (pasta, arquivo).
fn canonical_in(text: &str) -> Option<String> {
    let haystack = text.to_lowercase();
    for (canonical, aliases) in CANONICAL_BRANDS {
        if aliases.iter().any(|a| haystack.contains(a)) {
            return Some((*canonical).to_string());
        }
    }
    None
}

/// Resolve o `brandName` de um documento.
///
/// O parâmetro explícito vence sempre; se bater com a tabela, sai o
/// rótulo canônico, senão sai como veio (trim).
pub fn detect_brand(
    explicit: Option<&str>,
    folder: Option<&str>,
    filename: &str,
) -> Option<String> {
    if let Some(given) = explicit {
        let given = given.trim();
        if !given.is_empty() {
            return Some(canonical_in(given).unwrap_or_else(|| given.to_string()));
        }
    }
    if let Some(folder) = folder {
        if let Some(brand) = canonical_in(folder) {
            return Some(brand);
        }
    }
    canonical_in(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Parâmetro explícito vence pasta e arquivo, canonicalizado.
    #[test]
    fn test_explicit_wins() {
        let brand = detect_brand(Some("otis"), Some("orona"), "schindler.pdf");
        assert_eq!(brand.as_deref(), Some("Otis"));
        // Valor fora da tabela passa como veio.
        let custom = detect_brand(Some("Montele"), None, "x.pdf");
        assert_eq!(custom.as_deref(), Some("Montele"));
    }

    /// Pasta vem antes do nome do arquivo.
    #[test]
    fn test_folder_then_filename() {
        assert_eq!(
            detect_brand(None, Some("manuais/Orona"), "generico.pdf").as_deref(),
            Some("Orona")
        );
        assert_eq!(
            detect_brand(None, Some("uploads"), "Manual-THYSSEN-v2.pdf").as_deref(),
            Some("ThyssenKrupp")
        );
        assert_eq!(detect_brand(None, None, "apostila.pdf"), None);
    }
}
