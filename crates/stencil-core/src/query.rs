//! Advanced search query syntax.
//!
//! Supported forms:
//! - `router switch` - every term must match
//! - `router OR switch`, `router | switch` - any term may match
//! - `"server rack"` - quoted phrase
//! - `-legacy`, `!legacy`, `NOT legacy` - exclusion
//! - `manufacturer:Cisco`, `category:"network device"` - property match

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A query split into its logical parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    /// Terms that must all match.
    pub all: Vec<String>,

    /// Terms of which at least one must match (set when the query uses OR).
    pub any: Vec<String>,

    /// Terms that exclude a row when found in its shape or stencil name.
    pub exclude: Vec<String>,

    /// Property name (lowercased) to value substring.
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, PartialEq)]
struct Token {
    text: String,
    quoted: bool,
}

impl ParsedQuery {
    /// Parse a query string.
    pub fn parse(query: &str) -> Self {
        let tokens = tokenize(query);
        let mut parsed = Self::default();
        let mut positive = Vec::new();
        let mut uses_or = false;
        let mut negate_next = false;

        for token in tokens {
            if !token.quoted {
                let upper = token.text.to_uppercase();
                if upper == "OR" || token.text == "|" {
                    uses_or = true;
                    continue;
                }
                if upper == "NOT" {
                    negate_next = true;
                    continue;
                }
            }

            if negate_next {
                negate_next = false;
                push_unique(&mut parsed.exclude, token.text);
                continue;
            }

            if !token.quoted {
                if let Some(rest) = token.text.strip_prefix(['-', '!']) {
                    if !rest.is_empty() {
                        push_unique(&mut parsed.exclude, rest.to_string());
                    }
                    continue;
                }
                if let Some((key, value)) = split_property(&token.text) {
                    parsed.properties.insert(key, value);
                    continue;
                }
            }

            if !token.text.is_empty() {
                push_unique(&mut positive, token.text);
            }
        }

        positive.retain(|t| !parsed.exclude.contains(t));
        if uses_or {
            parsed.any = positive;
        } else {
            parsed.all = positive;
        }
        parsed
    }
}

fn push_unique(terms: &mut Vec<String>, term: String) {
    if !terms.contains(&term) {
        terms.push(term);
    }
}

/// `key:value` where key is a word; value keeps its original case.
fn split_property(text: &str) -> Option<(String, String)> {
    let (key, value) = text.split_once(':')?;
    let valid_key = !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_');
    if valid_key && !value.is_empty() {
        Some((key.to_lowercase(), value.to_string()))
    } else {
        None
    }
}

/// Split on whitespace, keeping double-quoted runs together. A quote inside a
/// token (`category:"network device"`) joins the quoted run onto that token.
fn tokenize(query: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    for c in query.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                if current.is_empty() {
                    quoted = true;
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    tokens.push(Token {
                        text: std::mem::take(&mut current),
                        quoted,
                    });
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(Token {
            text: current,
            quoted,
        });
    }

    tokens.retain(|t| !t.text.is_empty());
    tokens
}

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
    fn test_and_terms() {
        let q = ParsedQuery::parse("router switch");
        assert_eq!(q.all, vec!["router", "switch"]);
        assert!(q.any.is_empty());
    }

    #[test]
    fn test_phrase() {
        let q = ParsedQuery::parse(r#""server rack""#);
        assert_eq!(q.all, vec!["server rack"]);
    }

    #[test]
    fn test_or_forms() {
        assert_eq!(ParsedQuery::parse("router OR switch").any, vec!["router", "switch"]);
        assert_eq!(ParsedQuery::parse("router | switch").any, vec!["router", "switch"]);
        assert_eq!(ParsedQuery::parse("router or switch").any, vec!["router", "switch"]);
    }

    #[test]
    fn test_exclusions() {
        assert_eq!(ParsedQuery::parse("cloud -azure").exclude, vec!["azure"]);
        assert_eq!(ParsedQuery::parse("!legacy").exclude, vec!["legacy"]);
        let q = ParsedQuery::parse("server NOT dell");
        assert_eq!(q.all, vec!["server"]);
        assert_eq!(q.exclude, vec!["dell"]);
    }

    #[test]
    fn test_properties() {
        let q = ParsedQuery::parse("manufacturer:Cisco");
        assert!(q.all.is_empty() && q.any.is_empty());
        assert_eq!(q.properties, props(&[("manufacturer", "Cisco")]));

        let q = ParsedQuery::parse(r#"Category:"network device""#);
        assert_eq!(q.properties, props(&[("category", "network device")]));
    }

    #[test]
    fn test_combined() {
        let q = ParsedQuery::parse("router OR switch -legacy manufacturer:Cisco");
        assert!(q.all.is_empty());
        assert_eq!(q.any, vec!["router", "switch"]);
        assert_eq!(q.exclude, vec!["legacy"]);
        assert_eq!(q.properties, props(&[("manufacturer", "Cisco")]));
    }

    #[test]
    fn test_blank() {
        let q = ParsedQuery::parse("   ");
        assert!(q.all.is_empty() && q.any.is_empty());
        assert!(ParsedQuery::parse("-").exclude.is_empty());
    }
}
