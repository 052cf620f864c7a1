use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use vfs::{query, SearchMode};

use crate::error::VfsError;

/// One file-level search result. No line numbers; the front end re-opens
/// the file to highlight matches.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SearchHit {
    pub file: String,
    pub full_path: String,
    pub size_bytes: i64,
    pub modified_time: DateTime<Utc>,
    pub content_type: String,
}

/// A compiled query: either a token list or a regular expression.
pub enum CompiledQuery {
    Tokens(Vec<String>),
    Pattern(regex::Regex),
}

/// Compile `query` for the given mode. An empty query means "every
/// non-empty text row in scope" and compiles to the regex `.`.
pub fn compile(query: &str, mode: SearchMode) -> Result<CompiledQuery, VfsError> {
    if query.trim().is_empty() {
        let re = RegexBuilder::new(".")
            .build()
            .map_err(|e| VfsError::BadArgument(e.to_string()))?;
        return Ok(CompiledQuery::Pattern(re));
    }
    match mode {
        SearchMode::Regex => {
            let re = RegexBuilder::new(query)
                .build()
                .map_err(|e| VfsError::BadArgument(format!("invalid regex: {}", e)))?;
            Ok(CompiledQuery::Pattern(re))
        }
        SearchMode::MatchAny | SearchMode::MatchAll => {
            let tokens = query::tokenize(query)
                .into_iter()
                .map(|t| t.to_lowercase())
                .collect();
            Ok(CompiledQuery::Tokens(tokens))
        }
    }
}

/// Apply a compiled query to one row's text content.
pub fn matches(compiled: &CompiledQuery, mode: SearchMode, content: &str) -> bool {
    match compiled {
        CompiledQuery::Pattern(re) => re.is_match(content),
        CompiledQuery::Tokens(tokens) => {
            if tokens.is_empty() {
                return true;
            }
            let haystack = content.to_lowercase();
            match mode {
                SearchMode::MatchAll => tokens.iter().all(|t| haystack.contains(t.as_str())),
                _ => tokens.iter().any(|t| haystack.contains(t.as_str())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_matches_everything() {
        let q = compile("", SearchMode::MatchAll).unwrap();
        assert!(matches(&q, SearchMode::MatchAll, "anything"));
    }

    #[test]
    fn match_any_vs_all() {
        let q = compile("python java", SearchMode::MatchAny).unwrap();
        assert!(matches(&q, SearchMode::MatchAny, "I like Python"));
        let q = compile("python java", SearchMode::MatchAll).unwrap();
        assert!(!matches(&q, SearchMode::MatchAll, "I like Python"));
        assert!(matches(&q, SearchMode::MatchAll, "Java and python"));
    }

    #[test]
    fn phrase_tokens() {
        let q = compile(r#""programming language""#, SearchMode::MatchAll).unwrap();
        assert!(matches(
            &q,
            SearchMode::MatchAll,
            "JavaScript programming language"
        ));
        assert!(!matches(&q, SearchMode::MatchAll, "programming a language"));
    }

    #[test]
    fn regex_mode() {
        let q = compile("(SQL|CSS)", SearchMode::Regex).unwrap();
        assert!(matches(&q, SearchMode::Regex, "HTML CSS"));
        assert!(!matches(&q, SearchMode::Regex, "plain text"));
    }

    #[test]
    fn bad_regex_rejected() {
        assert!(compile("(unclosed", SearchMode::Regex).is_err());
    }
}
