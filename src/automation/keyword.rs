//! Keyword matching for inbound message text.
//!
//! A keyword rule matches when any of its keywords matches (first hit wins).
//! Whole-word keywords compile to a `\b...\b` regex over the escaped keyword,
//! so metacharacters in user input are literal.

use regex::Regex;
use tracing::{debug, warn};

use crate::automation::rule::{Keyword, MatchType, Rule, RuleKind};

/// Does a single keyword match `text`?
pub fn keyword_matches(keyword: &Keyword, text: &str) -> bool {
    if keyword.text.is_empty() {
        return false;
    }

    let (haystack, needle) = if keyword.case_sensitive {
        (text.to_string(), keyword.text.clone())
    } else {
        (text.to_lowercase(), keyword.text.to_lowercase())
    };

    match keyword.match_type {
        MatchType::Is => haystack == needle,
        MatchType::Contains => haystack.contains(&needle),
        MatchType::StartsWith => haystack.starts_with(&needle),
        MatchType::Word => match word_pattern(&needle) {
            Ok(re) => re.is_match(&haystack),
            Err(e) => {
                warn!(keyword = %keyword.text, "Invalid word pattern: {}", e);
                false
            }
        },
    }
}

/// Returns the first keyword of `keywords` that matches `text`.
pub fn first_match<'a>(keywords: &'a [Keyword], text: &str) -> Option<&'a Keyword> {
    keywords.iter().find(|kw| keyword_matches(kw, text))
}

/// Does `rule` match `text`? Trigger-kind rules never match message text.
pub fn matches(text: &str, rule: &Rule) -> bool {
    let RuleKind::Keyword { keywords } = &rule.kind else {
        return false;
    };
    match first_match(keywords, text) {
        Some(kw) => {
            debug!(
                rule = %rule.name,
                keyword = %kw.text,
                match_type = kw.match_type.as_str(),
                "Message matched keyword"
            );
            true
        }
        None => false,
    }
}

fn word_pattern(needle: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"\b{}\b", regex::escape(needle)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(text: &str, match_type: MatchType) -> Keyword {
        Keyword::new(text, match_type)
    }

    #[test]
    fn is_requires_exact_text() {
        assert!(keyword_matches(&kw("oi", MatchType::Is), "OI"));
        assert!(!keyword_matches(&kw("oi", MatchType::Is), "oi tudo bem"));
    }

    #[test]
    fn contains_and_starts_with() {
        assert!(keyword_matches(&kw("preço", MatchType::Contains), "Qual o PREÇO?"));
        assert!(keyword_matches(&kw("quero", MatchType::StartsWith), "Quero comprar"));
        assert!(!keyword_matches(&kw("comprar", MatchType::StartsWith), "Quero comprar"));
    }

    #[test]
    fn case_sensitive_keywords() {
        let keyword = kw("PIX", MatchType::Contains).case_sensitive();
        assert!(keyword_matches(&keyword, "pagar com PIX"));
        assert!(!keyword_matches(&keyword, "pagar com pix"));
    }

    #[test]
    fn word_requires_boundaries() {
        let keyword = kw("oi", MatchType::Word);
        assert!(keyword_matches(&keyword, "oi, tudo bem?"));
        assert!(keyword_matches(&keyword, "ei OI"));
        assert!(!keyword_matches(&keyword, "oitenta reais"));
        assert!(!keyword_matches(&keyword, "boi"));
    }

    #[test]
    fn word_escapes_metacharacters() {
        let keyword = kw("a.b", MatchType::Word);
        assert!(keyword_matches(&keyword, "see a.b now"));
        assert!(!keyword_matches(&keyword, "see axb now"));

        for raw in ["c++", "(promo)", "[x]", "$10", "a*b", "what?", r"\d"] {
            // must not panic on any metacharacter
            let _ = keyword_matches(&kw(raw, MatchType::Word), "text with c++ and (promo)");
        }
        assert!(keyword_matches(&kw("a*b", MatchType::Word), "x a*b y"));
        assert!(!keyword_matches(&kw("a*b", MatchType::Word), "x aab y"));
    }

    #[test]
    fn rule_uses_or_semantics() {
        let rule = Rule::keyword(
            "acct",
            "greeting",
            vec![kw("oi", MatchType::Contains), kw("ola", MatchType::Contains)],
        );
        assert!(matches("me diga ola", &rule));
        assert!(!matches("bom dia", &rule));
    }

    #[test]
    fn first_match_short_circuits_in_order() {
        let keywords = vec![kw("bom", MatchType::Contains), kw("dia", MatchType::Contains)];
        assert_eq!(first_match(&keywords, "bom dia").unwrap().text, "bom");
    }

    #[test]
    fn rule_without_keywords_never_matches() {
        let rule = Rule::keyword("acct", "empty", vec![]);
        assert!(!matches("anything", &rule));
    }

    #[test]
    fn empty_keyword_never_matches() {
        assert!(!keyword_matches(&kw("", MatchType::Contains), "anything"));
    }

    #[test]
    fn trigger_rule_never_matches_text() {
        let rule = Rule::trigger(
            "acct",
            "won",
            crate::automation::trigger::TriggerCondition::DealWon,
        );
        assert!(!matches("ganho", &rule));
    }
}
