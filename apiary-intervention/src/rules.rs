//! Intervention trigger rules
//!
//! A pure predicate over a persona's trait tree and a destination URL,
//! used by upstream flows to decide whether a command should pause for an
//! operator before it runs. Traits are free-form; matching is by key name,
//! case-insensitive, and recurses through nested `interventionRules`
//! mappings and sequences.

use serde_json::Value;
use url::Url;

use apiary_bus::Persona;
use apiary_common::params;

/// Affirmative flags that force an intervention outright
const FLAG_KEYS: [&str; 6] = [
    "requireintervention",
    "requiresintervention",
    "alwaysrequireintervention",
    "manualreview",
    "manual_review",
    "forceintervention",
];

const DOMAIN_KEYS: [&str; 5] = ["domain", "domains", "host", "hosts", "interventiondomains"];
const PATH_KEYS: [&str; 3] = ["path", "paths", "interventionpaths"];
const KEYWORD_KEYS: [&str; 4] = ["keyword", "keywords", "contains", "interventionkeywords"];
const RULES_KEY: &str = "interventionrules";

/// Whether this persona wants an operator in the loop for this URL
#[must_use]
pub fn check_for_intervention(url: &str, persona: &Persona) -> bool {
    let target = UrlParts::parse(url);
    matches_rules(&persona.traits, &target)
}

struct UrlParts {
    full: String,
    host: String,
    path: String,
}

impl UrlParts {
    fn parse(url: &str) -> Self {
        let full = url.to_lowercase();
        match Url::parse(url) {
            Ok(parsed) => Self {
                host: parsed.host_str().unwrap_or_default().to_lowercase(),
                path: parsed.path().to_lowercase(),
                full,
            },
            Err(_) => Self {
                full,
                host: String::new(),
                path: String::new(),
            },
        }
    }
}

fn matches_rules(value: &Value, url: &UrlParts) -> bool {
    match value {
        Value::Object(map) => map.iter().any(|(key, v)| key_matches(key, v, url)),
        Value::Array(items) => items.iter().any(|item| matches_rules(item, url)),
        _ => false,
    }
}

fn key_matches(key: &str, value: &Value, url: &UrlParts) -> bool {
    let key = key.to_lowercase();

    if FLAG_KEYS.contains(&key.as_str()) {
        return params::is_truthy(value);
    }

    if DOMAIN_KEYS.contains(&key.as_str()) {
        return params::string_values(value)
            .iter()
            .any(|domain| url.host.ends_with(&domain.to_lowercase()));
    }

    if PATH_KEYS.contains(&key.as_str()) {
        return params::string_values(value)
            .iter()
            .any(|fragment| url.path.contains(&fragment.to_lowercase()));
    }

    if KEYWORD_KEYS.contains(&key.as_str()) {
        return params::string_values(value)
            .iter()
            .any(|keyword| url.full.contains(&keyword.to_lowercase()));
    }

    if key == RULES_KEY {
        return matches_rules(value, url);
    }

    false
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn persona(traits: Value) -> Persona {
        Persona {
            id: "p1".to_string(),
            traits,
        }
    }

    #[test]
    fn test_affirmative_flags() {
        for key in [
            "requireIntervention",
            "requiresIntervention",
            "alwaysRequireIntervention",
            "manualReview",
            "manual_review",
            "forceIntervention",
        ] {
            let persona = persona(json!({key: true}));
            assert!(
                check_for_intervention("https://example.com", &persona),
                "{key} should trigger"
            );
        }
    }

    #[test]
    fn test_flag_value_forms() {
        assert!(check_for_intervention(
            "https://example.com",
            &persona(json!({"manualReview": "TRUE"}))
        ));
        assert!(check_for_intervention(
            "https://example.com",
            &persona(json!({"manualReview": 1}))
        ));
        assert!(!check_for_intervention(
            "https://example.com",
            &persona(json!({"manualReview": "false"}))
        ));
        assert!(!check_for_intervention(
            "https://example.com",
            &persona(json!({"manualReview": 0}))
        ));
    }

    #[test]
    fn test_domain_suffix_match() {
        let persona = persona(json!({"interventionDomains": ["bank.example.com"]}));
        assert!(check_for_intervention(
            "https://login.bank.example.com/auth",
            &persona
        ));
        assert!(!check_for_intervention("https://example.com", &persona));
    }

    #[test]
    fn test_path_and_keyword_match() {
        let persona = persona(json!({
            "paths": ["/checkout"],
            "keywords": ["captcha"],
        }));
        assert!(check_for_intervention(
            "https://shop.example.com/Checkout/step1",
            &persona
        ));
        assert!(check_for_intervention(
            "https://example.com/?challenge=CAPTCHA",
            &persona
        ));
        assert!(!check_for_intervention("https://example.com/cart", &persona));
    }

    #[test]
    fn test_nested_rules_recurse() {
        let persona = persona(json!({
            "interventionRules": [
                {"domains": ["secure.example.com"]},
                {"interventionRules": {"keywords": ["2fa"]}},
            ],
        }));
        assert!(check_for_intervention(
            "https://secure.example.com/",
            &persona
        ));
        assert!(check_for_intervention("https://example.com/2fa", &persona));
        assert!(!check_for_intervention("https://example.com/", &persona));
    }

    #[test]
    fn test_single_string_values() {
        let persona = persona(json!({"host": "example.com"}));
        assert!(check_for_intervention("https://shop.example.com", &persona));
    }

    #[test]
    fn test_unrelated_traits_do_not_trigger() {
        let persona = persona(json!({"locale": "en-US", "timezone": "UTC"}));
        assert!(!check_for_intervention("https://example.com", &persona));
    }
}
