//! `${key}` substitution of workflow properties into operation
//! configuration, and evaluation of execute/skip conditions.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

/// Regex pattern matching `${key}` placeholders.
const PLACEHOLDER_PATTERN: &str = r"\$\{([^}]+)\}";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN).expect("valid regex"));

/// Replace every `${key}` in `text` with the matching property.
///
/// Placeholders without a matching property are left as-is.
pub fn substitute(text: &str, properties: &BTreeMap<String, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &regex::Captures| {
            let key = caps[1].trim();
            match properties.get(key) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Apply [`substitute`] to every value of a configuration map.
pub fn resolve_configuration(
    configuration: &BTreeMap<String, String>,
    properties: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    configuration
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, properties)))
        .collect()
}

/// Keys referenced by placeholders in `text`, in order of appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// Whether an execute or skip condition, after substitution, reads as true.
///
/// Only a case-insensitive `true` counts; unresolved placeholders do not.
pub fn condition_holds(condition: &str, properties: &BTreeMap<String, String>) -> bool {
    substitute(condition, properties)
        .trim()
        .eq_ignore_ascii_case("true")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_keys() {
        let p = props(&[("profile", "hd"), ("lang", "en")]);
        assert_eq!(substitute("encode-${profile}-${lang}", &p), "encode-hd-en");
    }

    #[test]
    fn leaves_unknown_keys() {
        let p = props(&[("profile", "hd")]);
        assert_eq!(substitute("${profile}/${missing}", &p), "hd/${missing}");
    }

    #[test]
    fn resolves_whole_configuration() {
        let config = props(&[("target", "${flavor}/work"), ("fixed", "x")]);
        let resolved = resolve_configuration(&config, &props(&[("flavor", "presenter")]));
        assert_eq!(resolved["target"], "presenter/work");
        assert_eq!(resolved["fixed"], "x");
    }

    #[test]
    fn lists_placeholders() {
        assert_eq!(placeholders("${a} and ${ b }"), vec!["a", "b"]);
    }

    #[test]
    fn conditions() {
        let p = props(&[("publish", "TRUE"), ("archive", "no")]);
        assert!(condition_holds("${publish}", &p));
        assert!(!condition_holds("${archive}", &p));
        assert!(!condition_holds("${unset}", &p));
        assert!(condition_holds(" true ", &p));
    }
}
