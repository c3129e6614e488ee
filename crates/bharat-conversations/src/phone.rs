//! Phone number normalization to E.164.
//!
//! Pure and deterministic: the same `(raw, hint)` always yields the same
//! result, and normalizing a canonical value yields it unchanged.
//!
//! ```text
//!   "+91 98765-43210"  ─┐
//!   "0091 9876543210"   ├──▶ +919876543210
//!   "09876543210" (+91) │
//!   "9876543210"  (IN) ─┘
//! ```

/// Result of [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    /// E.164 form, `None` when the input is not a plausible number.
    pub canonical: Option<String>,
    /// Calling code with a leading `+` (e.g. `"+91"`), when known.
    pub country_code: Option<String>,
}

impl Normalized {
    fn invalid() -> Self {
        Self { canonical: None, country_code: None }
    }

    pub fn is_valid(&self) -> bool {
        self.canonical.is_some()
    }
}

/// Grouping key for a stored thread: canonical when normalization
/// succeeds, otherwise [`fallback_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneKey {
    pub key: String,
    pub country_code: Option<String>,
    pub normalized: bool,
}

/// National numbering rules for one calling code.
struct Region {
    isos: &'static [&'static str],
    code: &'static str,
    min_len: usize,
    max_len: usize,
    /// Allowed first digits of the national significant number.
    leading: &'static [u8],
    /// National trunk prefix `0` is in use.
    trunk_zero: bool,
}

impl Region {
    fn accepts(&self, national: &str) -> bool {
        let len = national.len();
        len >= self.min_len
            && len <= self.max_len
            && national.bytes().next().is_some_and(|b| self.leading.contains(&b))
    }

    fn canonical(&self, national: &str) -> Normalized {
        Normalized {
            canonical: Some(format!("+{}{}", self.code, national)),
            country_code: Some(format!("+{}", self.code)),
        }
    }
}

const REGIONS: &[Region] = &[
    Region { isos: &["IN"], code: "91", min_len: 10, max_len: 10, leading: b"6789", trunk_zero: true },
    Region { isos: &["US", "CA"], code: "1", min_len: 10, max_len: 10, leading: b"23456789", trunk_zero: false },
    Region { isos: &["GB", "UK"], code: "44", min_len: 9, max_len: 10, leading: b"123578", trunk_zero: true },
    Region { isos: &["AE"], code: "971", min_len: 8, max_len: 9, leading: b"2345679", trunk_zero: true },
    Region { isos: &["SG"], code: "65", min_len: 8, max_len: 8, leading: b"3689", trunk_zero: false },
    Region { isos: &["AU"], code: "61", min_len: 9, max_len: 9, leading: b"23478", trunk_zero: true },
    Region { isos: &["DE"], code: "49", min_len: 6, max_len: 11, leading: b"123456789", trunk_zero: true },
    Region { isos: &["SA"], code: "966", min_len: 8, max_len: 9, leading: b"15", trunk_zero: true },
    Region { isos: &["NP"], code: "977", min_len: 8, max_len: 10, leading: b"123456789", trunk_zero: true },
    Region { isos: &["BD"], code: "880", min_len: 8, max_len: 10, leading: b"123456789", trunk_zero: true },
    Region { isos: &["LK"], code: "94", min_len: 9, max_len: 9, leading: b"123456789", trunk_zero: true },
    Region { isos: &["PK"], code: "92", min_len: 9, max_len: 10, leading: b"123456789", trunk_zero: true },
];

/// E.164 bounds for numbers outside the region table.
const E164_MIN_DIGITS: usize = 8;
const E164_MAX_DIGITS: usize = 15;

/// Resolve a hint such as `"+91"`, `"91"` or `"IN"`.
fn region_for_hint(hint: &str) -> Option<&'static Region> {
    let hint = hint.trim();
    let digits = hint.strip_prefix('+').unwrap_or(hint);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        return REGIONS.iter().find(|r| r.code == digits);
    }
    let upper = hint.to_ascii_uppercase();
    REGIONS.iter().find(|r| r.isos.contains(&upper.as_str()))
}

/// Longest calling code that prefixes `digits`.
fn region_for_international(digits: &str) -> Option<&'static Region> {
    REGIONS
        .iter()
        .filter(|r| digits.starts_with(r.code))
        .max_by_key(|r| r.code.len())
}

fn strip_trunk<'a>(region: &Region, national: &'a str) -> &'a str {
    if region.trunk_zero {
        national.strip_prefix('0').unwrap_or(national)
    } else {
        national
    }
}

/// Strip formatting. Returns `(has_plus, digits)` or `None` for input that
/// contains anything other than digits and separators. A `+` is only
/// accepted before the first digit.
fn clean(raw: &str) -> Option<(bool, String)> {
    let mut plus = false;
    let mut digits = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        match c {
            '0'..='9' => digits.push(c),
            '+' if !plus && digits.is_empty() => plus = true,
            ' ' | '-' | '.' | '(' | ')' | '/' | '\u{a0}' => {}
            _ => return None,
        }
    }
    if digits.is_empty() { None } else { Some((plus, digits)) }
}

fn normalize_international(digits: &str) -> Normalized {
    if let Some(region) = region_for_international(digits) {
        let national = strip_trunk(region, &digits[region.code.len()..]);
        return if region.accepts(national) {
            region.canonical(national)
        } else {
            Normalized::invalid()
        };
    }
    let plausible = (E164_MIN_DIGITS..=E164_MAX_DIGITS).contains(&digits.len()) && !digits.starts_with('0');
    if plausible {
        Normalized { canonical: Some(format!("+{digits}")), country_code: None }
    } else {
        Normalized::invalid()
    }
}

/// Normalize `raw` to E.164 using `hint` as the default country for
/// numbers written without an international prefix.
pub fn normalize(raw: &str, hint: &str) -> Normalized {
    let Some((plus, digits)) = clean(raw) else {
        return Normalized::invalid();
    };
    if digits.len() > E164_MAX_DIGITS + 2 {
        return Normalized::invalid();
    }

    if plus {
        return normalize_international(&digits);
    }
    if let Some(rest) = digits.strip_prefix("00") {
        return normalize_international(rest);
    }

    let Some(region) = region_for_hint(hint) else {
        return Normalized::invalid();
    };

    let national = strip_trunk(region, &digits);
    if region.accepts(national) {
        return region.canonical(national);
    }
    // Written with the calling code but no prefix, e.g. "919876543210".
    if let Some(rest) = digits.strip_prefix(region.code) {
        let rest = strip_trunk(region, rest);
        if region.accepts(rest) {
            return region.canonical(rest);
        }
    }
    Normalized::invalid()
}

/// Grouping key for a number that does not normalize: its digits, or the
/// trimmed input when it has none.
pub fn fallback_key(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() { raw.trim().to_string() } else { digits }
}

/// Key a thread is grouped by.
pub fn phone_key(raw: &str, hint: &str) -> PhoneKey {
    let n = normalize(raw, hint);
    match n.canonical {
        Some(key) => PhoneKey { key, country_code: n.country_code, normalized: true },
        None => PhoneKey { key: fallback_key(raw), country_code: None, normalized: false },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(raw: &str, hint: &str) -> Option<String> {
        normalize(raw, hint).canonical
    }

    #[test]
    fn test_indian_variants_collapse() {
        let expected = Some("+919876543210".to_string());
        for raw in [
            "+919876543210",
            "+91 98765 43210",
            "9876543210",
            "09876543210",
            "919876543210",
            "0091-98765-43210",
            "(+91) 98765.43210",
        ] {
            assert_eq!(canon(raw, "+91"), expected, "{raw}");
        }
        assert_eq!(canon("9876543210", "IN"), expected);
        assert_eq!(canon("9876543210", "91"), expected);
        assert_eq!(normalize("9876543210", "+91").country_code.as_deref(), Some("+91"));
    }

    #[test]
    fn test_other_regions() {
        assert_eq!(canon("(415) 555-2671", "US").as_deref(), Some("+14155552671"));
        assert_eq!(canon("020 7946 0958", "GB").as_deref(), Some("+442079460958"));
        assert_eq!(canon("+44 (0)20 7946 0958", "IN").as_deref(), Some("+442079460958"));
        assert_eq!(canon("050 123 4567", "AE").as_deref(), Some("+971501234567"));
        assert_eq!(canon("9123 4567", "SG").as_deref(), Some("+6591234567"));
        assert_eq!(canon("0412 345 678", "+61").as_deref(), Some("+61412345678"));
        assert_eq!(canon("0300 1234567", "PK").as_deref(), Some("+923001234567"));
    }

    #[test]
    fn test_unknown_code_accepted_as_e164() {
        let n = normalize("+86 138 0013 8000", "+91");
        assert_eq!(n.canonical.as_deref(), Some("+8613800138000"));
        assert!(n.country_code.is_none());
    }

    #[test]
    fn test_implausible_inputs() {
        for raw in ["", "   ", "abc", "12345", "+91 12345", "98765x43210", "5876543210", "+0123456789"] {
            assert!(!normalize(raw, "+91").is_valid(), "{raw}");
        }
        // National form without a usable hint.
        assert!(!normalize("9876543210", "").is_valid());
        assert!(!normalize("9876543210", "ZZ").is_valid());
    }

    #[test]
    fn test_idempotent_over_samples() {
        let samples = [
            "+919876543210", "09876543210", "919876543210", "0044 20 7946 0958",
            "4155552671", "+14155552671", "050 123 4567", "+971 4 123 4567",
            "+8613800138000", "0300-1234567", "+977 9841234567", "01712345678",
            "+94 77 123 4567", "030 1234567", "+966 50 123 4567", "61234567",
        ];
        for hint in ["+91", "US", "AE", "DE", "BD", "SG"] {
            for raw in samples {
                let first = normalize(raw, hint);
                if let Some(c) = &first.canonical {
                    assert_eq!(normalize(c, hint), first, "{raw} with {hint}");
                }
            }
        }
    }

    #[test]
    fn test_fallback_key() {
        assert_eq!(fallback_key(" 12-345 "), "12345");
        assert_eq!(fallback_key("  unknown "), "unknown");

        let k = phone_key("12345", "+91");
        assert!(!k.normalized);
        assert_eq!(k.key, "12345");
        let k = phone_key("9876543210", "+91");
        assert!(k.normalized);
        assert_eq!(k.key, "+919876543210");
    }
}
