//! Query compilation and evaluation.
//!
//! A `SearchQuery` is compiled once per search: bounds validated, dates
//! converted to ticks, roots normalized into key form and the text input
//! resolved into a match mode. Wildcards are only interpreted when
//! `use_regex` is off and the text actually contains one; the compiled
//! wildcard regex is reused for the duration of the query.

mod evaluate;

pub use evaluate::{EvalOutput, QueryEvaluator};

use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};

use crate::error::{Result, SearchError};
use crate::options::SearchQuery;
use crate::record::normalize_key;

/// How a search terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Every candidate was considered.
    Complete,
    /// The `max_results` cap stopped the search.
    Truncated,
    /// The per-query timeout expired; collected entries remain valid.
    TimedOut,
    /// The caller cancelled; collected entries remain valid.
    Cancelled,
}

/// Resolved text-matching strategy for a query.
#[derive(Debug)]
pub(crate) enum TextMode {
    /// Empty search text: every record passes (listing mode).
    All,
    /// Plain substring, invariant case.
    SubstringCi(String),
    /// Plain substring, ordinal case.
    SubstringCs(String),
    /// `*`/`?` pattern compiled to an anchored regex, with a direct
    /// wildcard matcher as the fallback when compilation is refused.
    Wildcard { regex: Option<Regex>, pattern: String },
    /// Explicit regular expression.
    Regex(Regex),
}

/// A validated, pre-resolved query.
#[derive(Debug)]
pub struct CompiledQuery {
    pub(crate) query: SearchQuery,
    pub(crate) text: TextMode,
    /// Wildcard patterns without a separator match the name; with one they
    /// match the full path.
    pub(crate) wildcard_on_name: bool,
    pub(crate) base_key: Option<String>,
    pub(crate) excluded: Vec<String>,
    pub(crate) extension: Option<String>,
    pub(crate) created_bounds: (Option<i64>, Option<i64>),
    pub(crate) modified_bounds: (Option<i64>, Option<i64>),
    pub(crate) deadline: Option<Instant>,
}

impl CompiledQuery {
    pub fn compile(query: SearchQuery) -> Result<Self> {
        query.validate()?;

        let text = compile_text(&query)?;
        let wildcard_on_name = !query.search_text.contains(['/', '\\']);
        let base_key = query
            .base_path
            .as_ref()
            .map(|p| normalize_key(&p.to_string_lossy()));
        let excluded = query.excluded_paths.iter().map(|p| normalize_key(p)).collect();
        let extension = query.normalized_extension();
        let created_bounds = (
            query.min_created_date.map(date_to_ticks),
            query.max_created_date.map(date_to_ticks),
        );
        let modified_bounds = (
            query.min_modified_date.map(date_to_ticks),
            query.max_modified_date.map(date_to_ticks),
        );
        let deadline = query.timeout.map(|timeout| Instant::now() + timeout);

        Ok(Self {
            query,
            text,
            wildcard_on_name,
            base_key,
            excluded,
            extension,
            created_bounds,
            modified_bounds,
            deadline,
        })
    }

    pub(crate) fn deadline_expired(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

fn compile_text(query: &SearchQuery) -> Result<TextMode> {
    let text = query.search_text.as_str();
    if text.is_empty() {
        return Ok(TextMode::All);
    }

    if query.use_regex {
        let regex = RegexBuilder::new(text)
            .case_insensitive(!query.case_sensitive)
            .build()
            .map_err(|error| SearchError::InvalidQuery(format!("bad regex: {error}")))?;
        return Ok(TextMode::Regex(regex));
    }

    if text.contains(['*', '?']) {
        let regex = RegexBuilder::new(&wildcard_to_regex(text))
            .case_insensitive(!query.case_sensitive)
            .build()
            .ok();
        return Ok(TextMode::Wildcard {
            regex,
            pattern: text.to_string(),
        });
    }

    if query.case_sensitive {
        Ok(TextMode::SubstringCs(text.to_string()))
    } else {
        Ok(TextMode::SubstringCi(text.to_string()))
    }
}

/// Translates a `*`/`?` pattern to an anchored regex.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

fn date_to_ticks(date: DateTime<Utc>) -> i64 {
    date.timestamp_micros().saturating_mul(10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_text_is_listing_mode() {
        let compiled = CompiledQuery::compile(SearchQuery::default()).unwrap();
        assert!(matches!(compiled.text, TextMode::All));
    }

    #[test]
    fn plain_text_is_substring() {
        let compiled = CompiledQuery::compile(SearchQuery::text("report")).unwrap();
        assert!(matches!(compiled.text, TextMode::SubstringCi(_)));

        let query = SearchQuery {
            case_sensitive: true,
            ..SearchQuery::text("report")
        };
        let compiled = CompiledQuery::compile(query).unwrap();
        assert!(matches!(compiled.text, TextMode::SubstringCs(_)));
    }

    #[test]
    fn wildcards_compile_to_anchored_regex() {
        let compiled = CompiledQuery::compile(SearchQuery::text("x?.log")).unwrap();
        let TextMode::Wildcard { regex, .. } = &compiled.text else {
            panic!("expected wildcard mode");
        };
        let regex = regex.as_ref().unwrap();
        assert!(regex.is_match("x1.log"));
        assert!(regex.is_match("X2.LOG"));
        assert!(!regex.is_match("x12.log"));
        assert!(!regex.is_match("prefix-x1.log"));
    }

    #[test]
    fn wildcard_without_star_is_not_regex_mode() {
        let compiled = CompiledQuery::compile(SearchQuery::text("a.b")).unwrap();
        // A dot is not a wildcard; it must match literally.
        assert!(matches!(compiled.text, TextMode::SubstringCi(_)));
    }

    #[test]
    fn explicit_regex_compiles() {
        let query = SearchQuery {
            use_regex: true,
            ..SearchQuery::text(r"^user.*\.cs$")
        };
        let compiled = CompiledQuery::compile(query).unwrap();
        let TextMode::Regex(regex) = &compiled.text else {
            panic!("expected regex mode");
        };
        assert!(regex.is_match("UserServiceTests.cs"));
    }

    #[test]
    fn bad_regex_is_invalid_query() {
        let query = SearchQuery {
            use_regex: true,
            ..SearchQuery::text("([unclosed")
        };
        assert!(matches!(
            CompiledQuery::compile(query),
            Err(SearchError::InvalidQuery(_))
        ));
    }

    #[test]
    fn base_path_normalized() {
        let compiled =
            CompiledQuery::compile(SearchQuery::text("").with_base_path("C:\\Src\\")).unwrap();
        assert_eq!(compiled.base_key.as_deref(), Some("c:/src"));
    }

    #[test]
    fn deadline_reflects_timeout() {
        let compiled = CompiledQuery::compile(
            SearchQuery::text("x").with_timeout(Duration::from_secs(3600)),
        )
        .unwrap();
        assert!(!compiled.deadline_expired());

        let compiled =
            CompiledQuery::compile(SearchQuery::text("x").with_timeout(Duration::ZERO)).unwrap();
        assert!(compiled.deadline_expired());
    }
}
