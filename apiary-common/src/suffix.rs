//! Public-suffix index for registrable-domain (eTLD+1) derivation
//!
//! Parses a public-suffix list (exact rules, `*.` wildcards, `!`
//! exceptions) and answers the question "which part of this host is the
//! site?". Rate limiting keys on the answer, so two hosts under the same
//! registrable domain share one budget.
//!
//! # Matching
//!
//! Labels are walked right-to-left; the longest matching rule wins, an
//! exception rule beats everything and shortens the suffix by one label.
//! The registrable domain is the matched suffix plus one more label.
//!
//! ```text
//! host: shop.example.co.uk
//! rule: co.uk           → suffix = co.uk
//! registrable domain    → example.co.uk
//! ```

use std::collections::HashSet;

use url::{Host, Url};

use crate::Domain;

/// Environment variable naming an external public-suffix list file.
pub const PUBLIC_SUFFIX_LIST_PATH: &str = "PUBLIC_SUFFIX_LIST_PATH";

/// An external list is only trusted when it looks like the real thing.
const MIN_LIST_LINES: usize = 100;

/// Index over public-suffix rules
#[derive(Debug, Default)]
pub struct PublicSuffixIndex {
    /// Exact rules, e.g. `co.uk`
    exact: HashSet<String>,
    /// Wildcard rules, stored without the leading `*.` (rule `*.ck` → `ck`)
    wildcards: HashSet<String>,
    /// Exception rules, stored without the leading `!` (rule `!www.ck` → `www.ck`)
    exceptions: HashSet<String>,
}

impl PublicSuffixIndex {
    /// Build an index from public-suffix list lines
    ///
    /// Comment lines (`//`) and blank lines are skipped; anything after the
    /// first whitespace on a line is ignored, matching the list format.
    pub fn from_rules<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut index = Self::default();

        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }

            let rule = line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase();

            if let Some(exception) = rule.strip_prefix('!') {
                index.exceptions.insert(exception.to_string());
            } else if let Some(base) = rule.strip_prefix("*.") {
                index.wildcards.insert(base.to_string());
            } else if !rule.is_empty() {
                index.exact.insert(rule);
            }
        }

        index
    }

    /// Build an index from `PUBLIC_SUFFIX_LIST_PATH`, or the fallback set
    ///
    /// The external file must contain at least 100 non-empty lines to be
    /// accepted; otherwise (and when the variable is unset) the minimal
    /// fallback rules are used and a warning is logged.
    #[must_use]
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var(PUBLIC_SUFFIX_LIST_PATH) {
            match std::fs::read_to_string(&path) {
                Ok(contents) => {
                    let non_empty = contents.lines().filter(|l| !l.trim().is_empty()).count();
                    if non_empty >= MIN_LIST_LINES {
                        tracing::info!(path = %path, rules = non_empty, "Loaded public suffix list");
                        return Self::from_rules(contents.lines());
                    }
                    tracing::warn!(
                        path = %path,
                        lines = non_empty,
                        "Public suffix list too small, using fallback rules"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path,
                        error = %e,
                        "Failed to read public suffix list, using fallback rules"
                    );
                }
            }
        } else {
            tracing::warn!("No public suffix list configured, using fallback rules");
        }

        Self::fallback()
    }

    /// Minimal built-in rule set used when no list is available
    #[must_use]
    pub fn fallback() -> Self {
        Self::from_rules(["com", "net", "org", "uk", "co.uk"])
    }

    /// Derive the registrable domain (eTLD+1) for a URL or bare host
    ///
    /// Hosts are lower-cased and punycode-encoded before matching. Inputs
    /// that are not DNS names (IP literals, unparseable strings) come back
    /// unchanged; empty or whitespace-only input yields `None`.
    #[must_use]
    pub fn registrable_domain(&self, input: &str) -> Option<Domain> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        let host = match normalise_host(input) {
            Normalised::Name(host) => host,
            Normalised::Verbatim(other) => return Some(Domain::new(other)),
        };

        let labels: Vec<&str> = host.trim_end_matches('.').split('.').collect();
        if labels.iter().any(|l| l.is_empty()) {
            return Some(Domain::new(input));
        }

        let suffix_len = self.suffix_length(&labels);
        if suffix_len >= labels.len() {
            // The host is itself a public suffix.
            return None;
        }

        Some(Domain::new(
            labels[labels.len() - suffix_len - 1..].join("."),
        ))
    }

    /// Number of labels covered by the prevailing rule
    fn suffix_length(&self, labels: &[&str]) -> usize {
        let n = labels.len();

        // Exception rules win outright and subtract one label.
        for k in (1..=n).rev() {
            if self.exceptions.contains(&labels[n - k..].join(".")) {
                return k - 1;
            }
        }

        let mut best = 0;
        for k in 1..=n {
            let candidate = labels[n - k..].join(".");
            if self.exact.contains(&candidate) {
                best = k;
            }
            if k >= 2 && self.wildcards.contains(&labels[n - (k - 1)..].join(".")) {
                best = best.max(k);
            }
        }

        // Implicit `*` rule: an unknown TLD is still a public suffix.
        if best == 0 { 1 } else { best }
    }
}

enum Normalised {
    /// A DNS name, lower-cased and punycode-encoded
    Name(String),
    /// Not a DNS name; returned to the caller unchanged
    Verbatim(String),
}

/// Extract a normalised host from a URL or bare-host input
fn normalise_host(input: &str) -> Normalised {
    if input.contains("://") {
        return match Url::parse(input) {
            Ok(url) => match url.host() {
                Some(Host::Domain(domain)) => Normalised::Name(domain.to_string()),
                Some(host) => Normalised::Verbatim(host.to_string()),
                None => Normalised::Verbatim(input.to_string()),
            },
            Err(_) => Normalised::Verbatim(input.to_string()),
        };
    }

    // Bare host, possibly with a path tail.
    let bare = input.split(['/', '?', '#']).next().unwrap_or(input);
    match Host::parse(bare) {
        Ok(Host::Domain(domain)) => Normalised::Name(domain),
        _ => Normalised::Verbatim(input.to_string()),
    }
}
