//! Search query tokenization, shared by the search operator and any
//! caller that echoes a user query into a multi-term filter.

/// Break a query into tokens.
///
/// When the query contains `"`, each quoted phrase is one token and the
/// remaining fragments are whitespace-split. Otherwise the whole query is
/// whitespace-split. Empty tokens are dropped.
pub fn tokenize(query: &str) -> Vec<String> {
    if !query.contains('"') {
        return query
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
    }

    let mut tokens = Vec::new();
    let mut rest = query;
    while let Some(open) = rest.find('"') {
        for frag in rest[..open].split_whitespace() {
            tokens.push(frag.to_string());
        }
        let after = &rest[open + 1..];
        match after.find('"') {
            Some(close) => {
                let phrase = &after[..close];
                if !phrase.trim().is_empty() {
                    tokens.push(phrase.to_string());
                }
                rest = &after[close + 1..];
            }
            None => {
                // Unbalanced quote: treat the tail as plain fragments.
                for frag in after.split_whitespace() {
                    tokens.push(frag.to_string());
                }
                rest = "";
            }
        }
    }
    for frag in rest.split_whitespace() {
        tokens.push(frag.to_string());
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_split() {
        assert_eq!(tokenize("foo  bar baz"), vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn empty() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn quoted_phrases() {
        assert_eq!(
            tokenize(r#"alpha "two words" beta"#),
            vec!["alpha", "two words", "beta"]
        );
    }

    #[test]
    fn only_phrase() {
        assert_eq!(tokenize(r#""programming language""#), vec!["programming language"]);
    }

    #[test]
    fn unbalanced_quote() {
        assert_eq!(tokenize(r#"a "b c"#), vec!["a", "b", "c"]);
    }
}
