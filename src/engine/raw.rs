//! Raw TextMate grammar documents
//!
//! These types mirror the `.tmLanguage.json` format one to one and carry no
//! behaviour besides (de)serialization. [`Grammar::compile`] turns a
//! [`RawGrammar`] into the rule arena used by the tokenizer.
//!
//! Object order matters in two places: `repository` and `injections` are
//! kept as ordered lists so that injection declaration order survives the
//! round trip.
//!
//! [`Grammar::compile`]: super::grammar::Grammar::compile

use super::error::GrammarError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A grammar as written in a `.tmLanguage.json` file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawGrammar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_line_match: Option<String>,
    #[serde(default)]
    pub patterns: Vec<RawRule>,
    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    pub repository: Vec<(String, RawRule)>,
    /// Selector → rule, applied to this grammar's own scopes
    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    pub injections: Vec<(String, RawRule)>,
    /// Where this grammar injects itself when listed as an injector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_selector: Option<String>,
}

impl RawGrammar {
    /// Parse a grammar from TextMate JSON
    pub fn from_json(json: &str) -> Result<Self, GrammarError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the grammar back to TextMate JSON
    pub fn to_json(&self) -> Result<String, GrammarError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Scope name, or `MissingScopeName` if the document has none
    pub fn scope(&self) -> Result<&str, GrammarError> {
        self.scope_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(GrammarError::MissingScopeName)
    }
}

/// A single rule entry
///
/// Which keys are present decides the rule kind: `include` makes a reference,
/// `match` a match rule, `begin` with `end` or `while` a region rule and
/// anything else a pattern group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_name: Option<String>,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captures: Option<RawCaptures>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_captures: Option<RawCaptures>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_captures: Option<RawCaptures>,
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub while_captures: Option<RawCaptures>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns: Option<Vec<RawRule>>,
    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    pub repository: Vec<(String, RawRule)>,
    #[serde(
        default,
        deserialize_with = "bool_or_int",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub apply_end_pattern_last: bool,
}

impl RawRule {
    /// A rule that only includes another one
    pub fn include(reference: impl Into<String>) -> Self {
        RawRule {
            include: Some(reference.into()),
            ..Default::default()
        }
    }

    /// A match rule with a scope name
    pub fn matching(pattern: impl Into<String>, name: impl Into<String>) -> Self {
        RawRule {
            match_: Some(pattern.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Capture specifications
///
/// Grammars write captures as an object keyed by group number. The array
/// form is also accepted: element `k` describes group `k + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCaptures {
    Map(BTreeMap<String, RawRule>),
    List(Vec<RawRule>),
}

impl RawCaptures {
    /// Group number → rule, or the offending key when one is not a number
    pub fn entries(&self) -> Result<Vec<(usize, &RawRule)>, String> {
        match self {
            RawCaptures::Map(map) => map
                .iter()
                .map(|(key, rule)| {
                    key.trim()
                        .parse::<usize>()
                        .map(|group| (group, rule))
                        .map_err(|_| key.clone())
                })
                .collect(),
            RawCaptures::List(list) => Ok(list
                .iter()
                .enumerate()
                .map(|(k, rule)| (k + 1, rule))
                .collect()),
        }
    }
}

/// `applyEndPatternLast` appears both as `true` and as `1`
fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrInt {
        Bool(bool),
        Int(i64),
    }

    Ok(match BoolOrInt::deserialize(deserializer)? {
        BoolOrInt::Bool(b) => b,
        BoolOrInt::Int(i) => i != 0,
    })
}

/// JSON objects as ordered `(key, value)` lists
mod ordered_map {
    use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
    use serde::ser::{Serialize, Serializer};
    use std::fmt;
    use std::marker::PhantomData;

    pub fn serialize<S, V>(entries: &[(String, V)], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        struct OrderedVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
            type Value = Vec<(String, V)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_grammar() {
        let raw = RawGrammar::from_json(
            r#"{
                "scopeName": "source.demo",
                "patterns": [{ "match": "\\d+", "name": "constant.numeric" }]
            }"#,
        )
        .unwrap();

        assert_eq!(raw.scope().unwrap(), "source.demo");
        assert_eq!(raw.patterns.len(), 1);
        assert_eq!(raw.patterns[0].match_.as_deref(), Some("\\d+"));
    }

    #[test]
    fn test_repository_order_is_kept() {
        let raw = RawGrammar::from_json(
            r#"{
                "scopeName": "source.demo",
                "repository": {
                    "zeta": { "match": "z" },
                    "alpha": { "match": "a" },
                    "mid": { "match": "m" }
                }
            }"#,
        )
        .unwrap();

        let keys: Vec<&str> = raw.repository.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_captures_object_and_array() {
        let rule: RawRule = serde_json::from_str(
            r#"{ "match": "(a)(b)", "captures": { "2": { "name": "b" }, "1": { "name": "a" } } }"#,
        )
        .unwrap();
        let entries = rule.captures.as_ref().unwrap().entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 1);

        let rule: RawRule = serde_json::from_str(
            r#"{ "match": "(a)(b)", "captures": [{ "name": "a" }, { "name": "b" }] }"#,
        )
        .unwrap();
        let entries = rule.captures.as_ref().unwrap().entries().unwrap();
        assert_eq!(entries[0].0, 1);
        assert_eq!(entries[1].1.name.as_deref(), Some("b"));
    }

    #[test]
    fn test_non_numeric_capture_key() {
        let rule: RawRule =
            serde_json::from_str(r#"{ "match": "a", "captures": { "x": { "name": "a" } } }"#)
                .unwrap();
        assert_eq!(rule.captures.unwrap().entries().unwrap_err(), "x");
    }

    #[test]
    fn test_apply_end_pattern_last_forms() {
        let a: RawRule = serde_json::from_str(r#"{ "applyEndPatternLast": 1 }"#).unwrap();
        let b: RawRule = serde_json::from_str(r#"{ "applyEndPatternLast": true }"#).unwrap();
        let c: RawRule = serde_json::from_str(r#"{ "applyEndPatternLast": 0 }"#).unwrap();
        assert!(a.apply_end_pattern_last);
        assert!(b.apply_end_pattern_last);
        assert!(!c.apply_end_pattern_last);
    }

    #[test]
    fn test_missing_scope_name() {
        let raw = RawGrammar::from_json(r#"{ "patterns": [] }"#).unwrap();
        assert_eq!(raw.scope(), Err(GrammarError::MissingScopeName));
    }

    #[test]
    fn test_json_round_trip_keeps_injections() {
        let json = r##"{
            "scopeName": "text.demo",
            "injections": { "L:text.demo": { "patterns": [{ "include": "#x" }] } },
            "repository": { "x": { "match": "x", "name": "x" } }
        }"##;
        let raw = RawGrammar::from_json(json).unwrap();
        let again = RawGrammar::from_json(&raw.to_json().unwrap()).unwrap();
        assert_eq!(raw, again);
        assert_eq!(again.injections[0].0, "L:text.demo");
    }
}
