//! Canonical keys for free-text search terms.

use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const BRAZILIAN_STATES: [&str; 27] = [
    "AC", "AL", "AM", "AP", "BA", "CE", "DF", "ES", "GO", "MA", "MG", "MS", "MT", "PA", "PB",
    "PE", "PI", "PR", "RJ", "RN", "RO", "RR", "RS", "SC", "SE", "SP", "TO",
];

/// Lowercases, strips diacritics and collapses whitespace.
///
/// Total: empty or whitespace-only input yields an empty key.
pub fn normalize_niche(text: &str) -> String {
    let folded: String = text
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn location_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(.+?)\s*-\s*([A-Za-z]{2})\s*$").ok())
        .as_ref()
}

/// Normalizes `"City - ST"` into `"city - st"`.
///
/// Returns `None` for bare city names, unknown state codes, or anything else
/// that does not unambiguously name a city within a state.
pub fn normalize_location(text: &str) -> Option<String> {
    let captures = location_pattern()?.captures(text)?;
    let city = normalize_niche(captures.get(1)?.as_str());
    let state = captures.get(2)?.as_str().to_ascii_uppercase();

    if city.is_empty() || !BRAZILIAN_STATES.contains(&state.as_str()) {
        return None;
    }

    Some(format!("{} - {}", city, state.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn niche_strips_accents_and_spacing() {
        assert_eq!(normalize_niche("  Advocacia   Trabalhista "), "advocacia trabalhista");
        assert_eq!(normalize_niche("Clínica Odontológica"), "clinica odontologica");
        assert_eq!(normalize_niche("AÇAÍ"), "acai");
        assert_eq!(normalize_niche(""), "");
        assert_eq!(normalize_niche(" \t\n"), "");
    }

    #[test]
    fn location_accepts_city_state() {
        assert_eq!(
            normalize_location("São Paulo - SP").as_deref(),
            Some("sao paulo - sp")
        );
        assert_eq!(
            normalize_location("são paulo-sp").as_deref(),
            Some("sao paulo - sp")
        );
        assert_eq!(
            normalize_location("  Belo   Horizonte   -   mg ").as_deref(),
            Some("belo horizonte - mg")
        );
    }

    #[test]
    fn location_keeps_hyphenated_city_names() {
        assert_eq!(
            normalize_location("Embu-Guaçu - SP").as_deref(),
            Some("embu-guacu - sp")
        );
    }

    #[test]
    fn location_rejects_ambiguous_input() {
        assert_eq!(normalize_location("São Paulo"), None);
        assert_eq!(normalize_location("São Paulo - XX"), None);
        assert_eq!(normalize_location(" - SP"), None);
        assert_eq!(normalize_location("São Paulo - SPP"), None);
        assert_eq!(normalize_location(""), None);
    }
}
