//! Textual policy mini-language:
//!
//! ```text
//! [AGGREGATE] SOURCE <table> [SINK <table>] CONSTRAINT <expr>
//!     ON FAIL <REMOVE|KILL|INVALIDATE|LLM> [DESCRIPTION <text>]
//! ```
//!
//! Keywords are case-insensitive, clauses may appear in any order after the
//! leading AGGREGATE marker, and whitespace is insignificant.

use std::collections::BTreeMap;

use crate::error::{DfcError, Result};
use crate::policy::{AggregatePolicy, Policy, ResolutionKind, RowPolicy};

const KEYWORDS: &[&str] = &["SOURCE", "SINK", "CONSTRAINT", "DESCRIPTION"];
const ON_FAIL: &str = "ON FAIL";

pub fn parse_policy(text: &str) -> Result<Policy> {
    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(DfcError::PolicySyntax("empty policy definition".into()));
    }
    let aggregate = tokens[0].eq_ignore_ascii_case("AGGREGATE");
    if aggregate {
        tokens.remove(0);
    }

    let mut clauses: BTreeMap<&'static str, Vec<&str>> = BTreeMap::new();
    let mut current: Option<&'static str> = None;
    let mut index = 0;
    while index < tokens.len() {
        let word = tokens[index];
        if let Some(keyword) = KEYWORDS.iter().find(|k| word.eq_ignore_ascii_case(k)) {
            current = Some(keyword);
            clauses.entry(keyword).or_default();
            index += 1;
            continue;
        }
        if word.eq_ignore_ascii_case("ON")
            && tokens
                .get(index + 1)
                .is_some_and(|next| next.eq_ignore_ascii_case("FAIL"))
        {
            current = Some(ON_FAIL);
            clauses.entry(ON_FAIL).or_default();
            index += 2;
            continue;
        }
        match current.and_then(|clause| clauses.get_mut(clause)) {
            Some(words) => words.push(word),
            None => {
                return Err(DfcError::PolicySyntax(format!(
                    "unexpected token '{word}' before any policy keyword"
                )));
            }
        }
        index += 1;
    }

    let clause_text = |name: &str| clauses.get(name).map(|words| words.join(" "));
    let source = clause_text("SOURCE");
    let sink = clause_text("SINK");
    let constraint = clause_text("CONSTRAINT")
        .filter(|c| !c.is_empty())
        .ok_or_else(|| DfcError::PolicySyntax("policy is missing a CONSTRAINT clause".into()))?;
    let resolution_word = clause_text(ON_FAIL)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| DfcError::PolicySyntax("policy is missing an ON FAIL clause".into()))?;
    let resolution = ResolutionKind::parse(&resolution_word)?;
    let description = clause_text("DESCRIPTION")
        .map(|text| strip_quotes(&text))
        .filter(|text| !text.is_empty());

    if aggregate {
        Ok(Policy::Aggregate(AggregatePolicy::new(
            source.as_deref(),
            sink.as_deref(),
            &constraint,
            resolution,
            description.as_deref(),
        )?))
    } else {
        Ok(Policy::Row(RowPolicy::new(
            source.as_deref(),
            sink.as_deref(),
            &constraint,
            resolution,
            description.as_deref(),
        )?))
    }
}

fn strip_quotes(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}
