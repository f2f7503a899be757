use std::collections::HashSet;

use super::error::{Error, Result};

lazy_static::lazy_static! {
    static ref WORD_REGEX: regex::Regex =
        regex::Regex::new(r"[\p{L}\p{N}_]+").expect("Cant create a regex");
    static ref QUERY_REGEX: regex::Regex =
        regex::Regex::new(r#""(?P<phrase>[^"]*)"|(?P<neg>-)?(?P<word>[^\s"]+)"#).expect("Cant create a regex");
}

pub fn tokenize(text: &str) -> HashSet<String> {
    WORD_REGEX
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchTerms {
    pub terms: Vec<String>,
    pub negated: Vec<String>,
    pub phrases: Vec<String>,
}

impl SearchTerms {
    pub fn parse(query: &str) -> Result<Self> {
        let mut res = SearchTerms::default();
        for c in QUERY_REGEX.captures_iter(query) {
            if let Some(phrase) = c.name("phrase") {
                let phrase = phrase.as_str().trim().to_lowercase();
                if !phrase.is_empty() {
                    res.phrases.push(phrase);
                }
                continue;
            }
            let negated = c.name("neg").is_some();
            let word = c.name("word").map(|w| w.as_str()).unwrap_or_default();
            for token in WORD_REGEX.find_iter(word) {
                let token = token.as_str().to_lowercase();
                let list = if negated {
                    &mut res.negated
                } else {
                    &mut res.terms
                };
                if !list.contains(&token) {
                    list.push(token);
                }
            }
        }

        if res.terms.is_empty() && res.phrases.is_empty() {
            return Err(Error::EmptySearch);
        }
        Ok(res)
    }

    /// Tokens a candidate document must contain at least one of.
    pub fn candidate_tokens(&self) -> HashSet<String> {
        let mut tokens = self.terms.iter().cloned().collect::<HashSet<_>>();
        for phrase in &self.phrases {
            tokens.extend(tokenize(phrase));
        }
        tokens
    }

    pub fn matches(&self, text: &str) -> bool {
        self.score(text).is_some()
    }

    /// Relevance of `text`, or `None` when it does not match. Each distinct
    /// term found counts one, each phrase counts two.
    pub fn score(&self, text: &str) -> Option<f64> {
        let tokens = tokenize(text);
        if self.negated.iter().any(|n| tokens.contains(n)) {
            return None;
        }
        let lower = text.to_lowercase();
        if !self.phrases.iter().all(|p| lower.contains(p.as_str())) {
            return None;
        }
        let hits = self.terms.iter().filter(|t| tokens.contains(*t)).count();
        if hits == 0 && self.phrases.is_empty() {
            return None;
        }
        Some(hits as f64 + 2.0 * self.phrases.len() as f64)
    }
}
