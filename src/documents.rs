//! Brazilian document and phone helpers.
//!
//! CNPJ identifies a company, CPF identifies a person. Both are stored as
//! bare digits; formatting punctuation is accepted on input only.

use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use std::sync::OnceLock;

pub const CNPJ_LEN: usize = 14;
pub const CPF_LEN: usize = 11;

/// Keeps ASCII digits only.
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    let rest = sum % 11;
    if rest < 2 {
        0
    } else {
        11 - rest
    }
}

fn all_same(digits: &[u32]) -> bool {
    digits.windows(2).all(|w| w[0] == w[1])
}

/// Validates a CNPJ including both check digits.
pub fn is_valid_cnpj(raw: &str) -> bool {
    let digits: Vec<u32> = digits_only(raw).chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != CNPJ_LEN || all_same(&digits) {
        return false;
    }

    const W1: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    const W2: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

    check_digit(&digits[..12], &W1) == digits[12] && check_digit(&digits[..13], &W2) == digits[13]
}

/// Validates a CPF including both check digits.
pub fn is_valid_cpf(raw: &str) -> bool {
    let digits: Vec<u32> = digits_only(raw).chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != CPF_LEN || all_same(&digits) {
        return false;
    }

    let verifier = |len: usize| -> u32 {
        let sum: u32 = digits[..len]
            .iter()
            .zip((2..=(len as u32 + 1)).rev())
            .map(|(d, w)| d * w)
            .sum();
        (sum * 10 % 11) % 10
    };

    verifier(9) == digits[9] && verifier(10) == digits[10]
}

/// Returns the 14 CNPJ digits when `raw` has exactly that many.
pub fn normalize_cnpj(raw: &str) -> Option<String> {
    let digits = digits_only(raw);
    (digits.len() == CNPJ_LEN).then_some(digits)
}

/// Returns the 11 CPF digits when `raw` has exactly that many.
pub fn normalize_cpf(raw: &str) -> Option<String> {
    let digits = digits_only(raw);
    (digits.len() == CPF_LEN).then_some(digits)
}

fn cnpj_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\d{2}\.?\d{3}\.?\d{3}/?\d{4}-?\d{2}").ok())
        .as_ref()
}

/// Finds the first check-digit-valid CNPJ mentioned in free text.
pub fn extract_cnpj(text: &str) -> Option<String> {
    cnpj_pattern()?
        .find_iter(text)
        .map(|m| digits_only(m.as_str()))
        .find(|candidate| is_valid_cnpj(candidate))
}

/// Validates and normalizes a Brazilian phone number to E.164.
///
/// Uses the phonenumber library (port of Google's libphonenumber).
///
/// # Returns
///
/// * `Some("+5511987654321")` for valid numbers, `None` otherwise.
pub fn normalize_br_phone(raw: &str) -> Option<String> {
    if raw.trim().is_empty() || raw.len() < 8 {
        return None;
    }

    match phonenumber::parse(Some(CountryId::BR), raw) {
        Ok(number) if phonenumber::is_valid(&number) => {
            Some(number.format().mode(Mode::E164).to_string())
        }
        Ok(_) => {
            tracing::debug!("Invalid BR phone number: {}", raw);
            None
        }
        Err(e) => {
            tracing::debug!("Failed to parse BR phone '{}': {:?}", raw, e);
            None
        }
    }
}
