//! Text and coordinate normalization shared by grouping, proposals and the
//! coordinate-repair job. Everything here is pure.

use once_cell::sync::Lazy;
use regex::Regex;

/// Values that mean "no street" when typed into an address line.
const PLACEHOLDERS: &[&str] = &["", "n/a", "na", "none", "unknown", "null", "-", "--"];

/// Corporate-entity suffixes, compared after punctuation is dropped.
const COMPANY_SUFFIXES: &[&str] = &[
    "inc",
    "incorporated",
    "corp",
    "corporation",
    "llc",
    "ltd",
    "co",
    "company",
];

/// Postal state codes kept upper-case when re-capitalizing street lines. Codes
/// that double as everyday words ("in", "or", "me", ...) are left out.
const STATE_CODES: &[&str] = &[
    "ak", "az", "ar", "ca", "ct", "dc", "fl", "ga", "ia", "il", "ks", "ky", "mi", "mn", "ms",
    "mt", "nc", "nd", "ne", "nh", "nj", "nm", "nv", "ny", "ri", "sc", "sd", "tn", "tx", "ut",
    "va", "vt", "wa", "wi", "wv", "wy",
];

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static NAME_PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s&-]").unwrap());

static COUNTY_ROAD: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bC\.?\s*R\b\.?",
        r"(?i)\bCo\.?\s*Rd\b\.?",
        r"(?i)\bCty\.?\s*Rd\b\.?",
        r"(?i)\bCounty\s+Rd\b\.?",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Trim and collapse internal whitespace runs to single spaces.
pub fn norm_ws(s: &str) -> String {
    WHITESPACE.replace_all(s.trim(), " ").into_owned()
}

/// Whitespace-normalized value, with blank strings treated as absent.
pub fn normalize_value(v: Option<&str>) -> Option<String> {
    let t = norm_ws(v?);
    if t.is_empty() { None } else { Some(t) }
}

/// Canonical form of an organization name: lower-cased, punctuation dropped
/// (word characters, `&` and `-` survive), corporate suffixes removed as whole tokens.
pub fn normalize_name(name: &str) -> String {
    let lowered = norm_ws(name).to_lowercase();
    let stripped = NAME_PUNCTUATION.replace_all(&lowered, "");
    stripped
        .split_whitespace()
        .filter(|token| !COMPANY_SUFFIXES.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when the names are different strings with the same canonical form.
pub fn names_differ_only_trivially(a: &str, b: &str) -> bool {
    let (a, b) = (norm_ws(a), norm_ws(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let na = normalize_name(&a);
    !na.is_empty() && na == normalize_name(&b)
}

pub fn is_placeholder(s: &str) -> bool {
    PLACEHOLDERS.contains(&norm_ws(s).to_lowercase().as_str())
}

/// Canonical street line: placeholders become empty, rural-road abbreviations
/// (`CR`, `C.R.`, `Co Rd`, `Cty Rd`, `County Rd`) become `County Road`.
pub fn normalize_street(s: &str) -> String {
    let mut x = norm_ws(s);
    if is_placeholder(&x) {
        return String::new();
    }
    for pattern in COUNTY_ROAD.iter() {
        x = pattern.replace_all(&x, "County Road ").into_owned();
    }
    norm_ws(&x)
}

/// Heuristic for a street line that cannot be delivered to: a placeholder, or a
/// short bare word with no house or road number.
pub fn looks_like_unusable_street(s: &str) -> bool {
    let t = normalize_street(s).to_lowercase();
    if is_placeholder(&t) {
        return true;
    }
    let has_digit = t.chars().any(|c| c.is_ascii_digit());
    !has_digit && t.chars().count() < 6
}

/// Word-by-word capitalization of a street line; state codes stay upper-case.
pub fn capitalize_street(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            if STATE_CODES.contains(&lower.as_str()) {
                word.to_uppercase()
            } else {
                capitalize_word(&lower)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize_word(lower: &str) -> String {
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Fold two free-text values without losing information: empty yields the other,
/// containment (case-insensitive) yields the longer, otherwise both are kept
/// under a visible separator. Values are trimmed but otherwise left intact.
pub fn combine(a: Option<&str>, b: Option<&str>) -> Option<String> {
    let a = a.map(str::trim).filter(|s| !s.is_empty());
    let b = b.map(str::trim).filter(|s| !s.is_empty());
    match (a, b) {
        (None, None) => None,
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (Some(a), Some(b)) => {
            if a == b {
                return Some(a.to_string());
            }
            let (al, bl) = (a.to_lowercase(), b.to_lowercase());
            if bl.contains(&al) {
                Some(b.to_string())
            } else if al.contains(&bl) {
                Some(a.to_string())
            } else {
                Some(format!("{a}\n\n---\n\n{b}"))
            }
        }
    }
}

/// Missing, out of range, or sitting on "null island".
pub fn is_implausible_coordinate(lat: Option<f64>, lon: Option<f64>) -> bool {
    let (Some(lat), Some(lon)) = (lat, lon) else {
        return true;
    };
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return true;
    }
    lat.abs() < 0.0001 && lon.abs() < 0.0001
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_ws_collapses_runs() {
        assert_eq!(norm_ws("  hello   world  "), "hello world");
        assert_eq!(norm_ws("a\t\nb"), "a b");
        assert_eq!(norm_ws(""), "");
    }

    #[test]
    fn normalize_value_blank_is_none() {
        assert_eq!(normalize_value(None), None);
        assert_eq!(normalize_value(Some("  test  ")), Some("test".to_string()));
        assert_eq!(normalize_value(Some("   ")), None);
    }

    #[test]
    fn corporate_suffixes_collapse() {
        assert_eq!(normalize_name("ABC Corp."), "abc");
        assert_eq!(normalize_name("ABC Inc."), "abc");
        assert_eq!(normalize_name("Test LLC"), "test");
        assert_eq!(normalize_name("ACME, L.L.C."), "acme");
        assert_eq!(normalize_name("Acme LLC"), "acme");
        assert_eq!(normalize_name(""), "");
    }

    #[test]
    fn ampersand_and_hyphen_survive() {
        assert_eq!(normalize_name("Smith & Sons Co."), "smith & sons");
        assert_eq!(normalize_name("Farm-Way  Company"), "farm-way");
        assert_eq!(normalize_name("Company & Co."), "&");
    }

    #[test]
    fn trivial_name_difference() {
        assert!(names_differ_only_trivially("Acme LLC", "ACME, L.L.C."));
        assert!(!names_differ_only_trivially("Acme LLC", "Acme Feed LLC"));
        assert!(!names_differ_only_trivially("", "Acme"));
    }

    #[test]
    fn county_road_expansion() {
        assert!(normalize_street("123 C.R. 10").contains("County Road 10"));
        assert_eq!(normalize_street("123 C.R. 10"), "123 County Road 10");
        assert_eq!(normalize_street("Co. Rd. 5"), "County Road 5");
        assert_eq!(normalize_street("Cty Rd 20"), "County Road 20");
        assert_eq!(normalize_street("4410 cr 12"), "4410 County Road 12");
        assert_eq!(normalize_street("9 County Rd 7"), "9 County Road 7");
    }

    #[test]
    fn county_road_leaves_words_alone() {
        assert_eq!(normalize_street("12 Creek Rd"), "12 Creek Rd");
        assert_eq!(normalize_street("100 Corral Dr"), "100 Corral Dr");
    }

    #[test]
    fn placeholders_become_empty() {
        assert_eq!(normalize_street(""), "");
        assert_eq!(normalize_street("n/a"), "");
        assert_eq!(normalize_street(" Unknown "), "");
        assert_eq!(normalize_street("--"), "");
    }

    #[test]
    fn unusable_street_heuristic() {
        assert!(looks_like_unusable_street("none"));
        assert!(looks_like_unusable_street("Main"));
        assert!(!looks_like_unusable_street("Main Street"));
        assert!(!looks_like_unusable_street("12 A"));
    }

    #[test]
    fn street_capitalization_keeps_state_codes() {
        assert_eq!(capitalize_street("123 county road 10"), "123 County Road 10");
        assert_eq!(capitalize_street("500 MAIN st topeka ks"), "500 Main St Topeka KS");
    }

    #[test]
    fn combine_rules() {
        assert_eq!(combine(Some("a"), Some("b")), Some("a\n\n---\n\nb".to_string()));
        assert_eq!(combine(Some("a"), None), Some("a".to_string()));
        assert_eq!(combine(None, Some("b")), Some("b".to_string()));
        assert_eq!(combine(Some("a"), Some("a")), Some("a".to_string()));
        assert_eq!(combine(None, Some("  ")), None);
        let folded = combine(Some("a\n\n---\n\nb"), Some("c")).unwrap();
        assert_eq!(folded, "a\n\n---\n\nb\n\n---\n\nc");
        assert_eq!(
            combine(Some("East gate"), Some("Use the east gate after 5pm")),
            Some("Use the east gate after 5pm".to_string())
        );
    }

    #[test]
    fn coordinate_sanity() {
        assert!(is_implausible_coordinate(None, Some(1.0)));
        assert!(is_implausible_coordinate(Some(0.0), Some(0.0)));
        assert!(is_implausible_coordinate(Some(91.0), Some(10.0)));
        assert!(is_implausible_coordinate(Some(38.0), Some(-181.0)));
        assert!(!is_implausible_coordinate(Some(39.05), Some(-95.68)));
    }
}
