use std::fmt::Write as _;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::labels::normalize;
use crate::ranker::RankedCandidate;
use crate::remote::chat::ChatModel;
use crate::settings::DomainRule;

/// How many ranked candidates the model gets to see.
pub const TOP_N: usize = 5;
pub const UNMATCHED_TOKEN: &str = "UNMATCHED";
const LEGACY_UNMATCHED_TOKEN: &str = "UNMAPPED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "header", rename_all = "snake_case")]
pub enum Decision {
    Matched(String),
    Unmatched,
}

impl Decision {
    pub fn header(&self) -> Option<&str> {
        match self {
            Decision::Matched(h) => Some(h),
            Decision::Unmatched => None,
        }
    }

    pub fn label(&self) -> &str {
        self.header().unwrap_or(UNMATCHED_TOKEN)
    }
}

pub struct Adjudicator<'a> {
    model: &'a dyn ChatModel,
    rules: &'a [DomainRule],
}

impl<'a> Adjudicator<'a> {
    pub fn new(model: &'a dyn ChatModel, rules: &'a [DomainRule]) -> Self {
        Self { model, rules }
    }

    /// Pick one of the top candidates for `source_label`, or none.
    ///
    /// Domain rules are consulted first and win over similarity. Otherwise the
    /// model chooses; an empty, malformed or off-list reply is `Unmatched`.
    /// Only a transport failure after retries is an error.
    pub fn decide(&self, source_label: &str, ranked: &[RankedCandidate]) -> Result<Decision> {
        let offered = &ranked[..ranked.len().min(TOP_N)];
        if offered.is_empty() {
            return Ok(Decision::Unmatched);
        }

        if let Some(header) = apply_domain_rules(self.rules, source_label, offered) {
            info!(source_label, header = %header, "matched by domain rule");
            return Ok(Decision::Matched(header));
        }

        let prompt = build_prompt(source_label, offered, self.rules);
        let reply = self.model.complete(&prompt)?;
        let decision = parse_reply(&reply, offered);
        debug!(source_label, reply = %reply, decision = decision.label(), "adjudicated");
        Ok(decision)
    }
}

/// Normalized words of `text`; punctuation separates words, so `401(k)` and
/// `401 k` both read as `401k`.
fn words(text: &str) -> Vec<String> {
    let spaced: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    normalize(&spaced).split_whitespace().map(String::from).collect()
}

/// Rule tokens match whole words only: `roth` is not found in `brothers`.
fn rule_applies(rule: &DomainRule, label_words: &[String]) -> bool {
    let has = |token: &String| {
        let phrase = words(token);
        !phrase.is_empty() && label_words.windows(phrase.len()).any(|w| w == phrase.as_slice())
    };
    !rule.all_of.is_empty() && rule.all_of.iter().all(has) && !rule.none_of.iter().any(has)
}

/// First rule whose tokens match the label and whose target is on offer.
fn apply_domain_rules(
    rules: &[DomainRule],
    source_label: &str,
    offered: &[RankedCandidate],
) -> Option<String> {
    let label_words = words(source_label);
    rules
        .iter()
        .filter(|rule| rule_applies(rule, &label_words))
        .find_map(|rule| find_candidate(offered, &rule.target))
}

fn find_candidate(offered: &[RankedCandidate], text: &str) -> Option<String> {
    let key = normalize(text);
    offered
        .iter()
        .find(|c| normalize(&c.header) == key)
        .map(|c| c.header.clone())
}

pub fn build_prompt(source_label: &str, offered: &[RankedCandidate], rules: &[DomainRule]) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are normalizing account names across brokerage data.\n\n");
    let _ = writeln!(prompt, "Incoming account name from a positions export: \"{source_label}\"");
    prompt.push_str("Candidate spreadsheet account headers, most similar first:\n");
    for c in offered {
        let _ = writeln!(prompt, "- {} (score={:.3})", c.header, c.score);
    }
    prompt.push_str("\nRules:\n");
    prompt.push_str("- Prefer a semantic match over string similarity.\n");
    for rule in rules {
        let mut line = format!("- An account name containing {}", rule.all_of.join(" and "));
        if !rule.none_of.is_empty() {
            let _ = write!(line, " but not {}", rule.none_of.join(" or "));
        }
        let _ = writeln!(prompt, "{line} maps to \"{}\".", rule.target);
    }
    let _ = writeln!(
        prompt,
        "- If no candidate fits, reply with exactly {UNMATCHED_TOKEN}.\n\
         - Reply with only the header text, no other words."
    );
    prompt
}

/// Strip quotes and whitespace, then accept the reply only if it names an
/// offered candidate.
fn parse_reply(reply: &str, offered: &[RankedCandidate]) -> Decision {
    let text = reply
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c.is_whitespace());
    if text.is_empty()
        || text.eq_ignore_ascii_case(UNMATCHED_TOKEN)
        || text.eq_ignore_ascii_case(LEGACY_UNMATCHED_TOKEN)
    {
        return Decision::Unmatched;
    }
    match find_candidate(offered, text) {
        Some(header) => Decision::Matched(header),
        None => Decision::Unmatched,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedModel;
    use super::*;
    use crate::settings::default_domain_rules;

    fn ranked(pairs: &[(&str, f64)]) -> Vec<RankedCandidate> {
        pairs
            .iter()
            .map(|(h, s)| RankedCandidate {
                header: h.to_string(),
                score: *s,
            })
            .collect()
    }

    #[test]
    fn test_401k_rule_beats_model_and_similarity() {
        let rules = default_domain_rules();
        let model = ScriptedModel::replying("BrokerageLink Roth");
        let adj = Adjudicator::new(&model, &rules);
        let candidates = ranked(&[("BrokerageLink", 0.9), ("BrokerageLink Roth", 0.4)]);
        assert_eq!(
            adj.decide("401K", &candidates).unwrap(),
            Decision::Matched("BrokerageLink".to_string())
        );
        assert!(model.prompts.borrow().is_empty());
    }

    #[test]
    fn test_roth_401k_rule() {
        let rules = default_domain_rules();
        let model = ScriptedModel::replying("BrokerageLink");
        let adj = Adjudicator::new(&model, &rules);
        let candidates = ranked(&[("BrokerageLink", 0.9), ("BrokerageLink Roth", 0.8)]);
        assert_eq!(
            adj.decide("Fidelity 401 k ROTH", &candidates).unwrap(),
            Decision::Matched("BrokerageLink Roth".to_string())
        );
    }

    #[test]
    fn test_rule_tokens_match_whole_words() {
        let rules = default_domain_rules();
        let model = ScriptedModel::replying("BrokerageLink Roth");
        let adj = Adjudicator::new(&model, &rules);
        let candidates = ranked(&[("BrokerageLink", 0.9), ("BrokerageLink Roth", 0.8)]);
        assert_eq!(
            adj.decide("Smith Brothers 401k", &candidates).unwrap(),
            Decision::Matched("BrokerageLink".to_string())
        );
        assert_eq!(
            adj.decide("Acme 401(k) - Roth", &candidates).unwrap(),
            Decision::Matched("BrokerageLink Roth".to_string())
        );
        assert!(model.prompts.borrow().is_empty());
    }

    #[test]
    fn test_words_split_on_punctuation() {
        assert_eq!(words("Acme 401(k)-Roth"), vec!["acme", "401k", "roth"]);
        assert_eq!(words("  "), Vec::<String>::new());
    }

    #[test]
    fn test_rule_target_not_offered_falls_through_to_model() {
        let rules = default_domain_rules();
        let model = ScriptedModel::replying("Retirement");
        let adj = Adjudicator::new(&model, &rules);
        let candidates = ranked(&[("Retirement", 0.7), ("Joint", 0.2)]);
        assert_eq!(
            adj.decide("401K", &candidates).unwrap(),
            Decision::Matched("Retirement".to_string())
        );
        assert_eq!(model.prompts.borrow().len(), 1);
    }

    #[test]
    fn test_only_top_five_offered() {
        let model = ScriptedModel::replying("H6");
        let adj = Adjudicator::new(&model, &[]);
        let candidates = ranked(&[
            ("H1", 0.9),
            ("H2", 0.8),
            ("H3", 0.7),
            ("H4", 0.6),
            ("H5", 0.5),
            ("H6", 0.4),
        ]);
        assert_eq!(adj.decide("x", &candidates).unwrap(), Decision::Unmatched);
        let prompt = &model.prompts.borrow()[0];
        assert!(prompt.contains("H5 (score=0.500)"));
        assert!(!prompt.contains("H6"));
    }

    #[test]
    fn test_reply_quotes_are_stripped() {
        let candidates = ranked(&[("Joint WROS", 0.8)]);
        assert_eq!(
            parse_reply("\"Joint WROS\"", &candidates),
            Decision::Matched("Joint WROS".to_string())
        );
        assert_eq!(
            parse_reply("  'joint  wros' \n", &candidates),
            Decision::Matched("Joint WROS".to_string())
        );
    }

    #[test]
    fn test_unmatched_and_malformed_replies() {
        let candidates = ranked(&[("Joint WROS", 0.8)]);
        assert_eq!(parse_reply("UNMATCHED", &candidates), Decision::Unmatched);
        assert_eq!(parse_reply("\"UNMAPPED\"", &candidates), Decision::Unmatched);
        assert_eq!(parse_reply("", &candidates), Decision::Unmatched);
        assert_eq!(
            parse_reply("I think it is probably Joint WROS", &candidates),
            Decision::Unmatched
        );
    }

    #[test]
    fn test_no_candidates_is_unmatched() {
        let model = ScriptedModel::replying("anything");
        let adj = Adjudicator::new(&model, &[]);
        assert_eq!(adj.decide("x", &[]).unwrap(), Decision::Unmatched);
    }

    #[test]
    fn test_transport_failure_is_error() {
        let model = ScriptedModel::failing("connection refused");
        let adj = Adjudicator::new(&model, &[]);
        assert!(adj.decide("x", &ranked(&[("H", 0.1)])).is_err());
    }

    #[test]
    fn test_prompt_lists_rules() {
        let rules = default_domain_rules();
        let prompt = build_prompt("Roth IRA", &ranked(&[("Roth IRA", 0.99)]), &rules);
        assert!(prompt.contains("\"Roth IRA\""));
        assert!(prompt.contains("401k and roth maps to \"BrokerageLink Roth\""));
        assert!(prompt.contains("401k but not roth maps to \"BrokerageLink\""));
        assert!(prompt.contains(UNMATCHED_TOKEN));
    }
}
