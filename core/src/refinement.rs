//! Refinement Controller: issue extraction from a critic review, and the
//! bounded `S0 / Iterate(n) / Converged(reason)` convergence state
//! machine. The actual builder→critic re-invocation loop lives in
//! `chain.rs`; this module owns the pure decision logic so it is testable
//! without an LLM connector.

use crate::config::RefinementConfig;
use regex::Regex;

/// Refinement state, named to mirror spec §4.10 exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefinementState {
    Initial,
    Iterate(usize),
    Converged { reason: String, detail: Option<String> },
}

/// Count the number of contiguous blocks in `review` that contain a
/// critical keyword or match one of the configured issue regex patterns.
/// Blocks are separated by blank lines, matching how the Consensus
/// Merger renders per-critic sections.
pub fn count_issues(review: &str, config: &RefinementConfig) -> usize {
    let patterns: Vec<Regex> = config.issue_patterns.iter().filter_map(|p| Regex::new(p).ok()).collect();

    review
        .split("\n\n")
        .filter(|block| {
            let lower = block.to_lowercase();
            let has_keyword = config.critical_keywords.iter().any(|kw| lower.contains(kw.as_str()));
            let has_pattern = patterns.iter().any(|re| re.is_match(block));
            has_keyword || has_pattern
        })
        .count()
}

/// Extract only the blocks `count_issues` flagged as critical, joined back
/// together. Used to build the refinement prompt (spec §4.10 step 1: feed
/// the builder "original prompt + extracted critical issues + fix
/// instruction", not the full, unfiltered review).
pub fn extract_issues(review: &str, config: &RefinementConfig) -> String {
    let patterns: Vec<Regex> = config.issue_patterns.iter().filter_map(|p| Regex::new(p).ok()).collect();

    review
        .split("\n\n")
        .filter(|block| {
            let lower = block.to_lowercase();
            let has_keyword = config.critical_keywords.iter().any(|kw| lower.contains(kw.as_str()));
            let has_pattern = patterns.iter().any(|re| re.is_match(block));
            has_keyword || has_pattern
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Decide the next state given the current state and the freshly
/// computed issue count for that iteration's review.
pub fn next_state(current: &RefinementState, issues: usize, previous_issues: Option<usize>, config: &RefinementConfig) -> RefinementState {
    match current {
        RefinementState::Initial => {
            if issues >= 1 {
                RefinementState::Iterate(1)
            } else {
                RefinementState::Converged { reason: "no_issues".to_string(), detail: None }
            }
        }
        RefinementState::Iterate(n) => {
            if issues == 0 {
                return RefinementState::Converged { reason: "success".to_string(), detail: None };
            }
            if let Some(prev) = previous_issues {
                if issues >= prev {
                    return RefinementState::Converged {
                        reason: "no_progress".to_string(),
                        detail: Some(format!("{prev}->{issues}")),
                    };
                }
            }
            if *n < config.max_iterations {
                RefinementState::Iterate(n + 1)
            } else {
                RefinementState::Converged { reason: "max_iterations".to_string(), detail: None }
            }
        }
        RefinementState::Converged { .. } => current.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config() -> RefinementConfig {
        let mut critical_keywords = HashSet::new();
        critical_keywords.insert("security".to_string());
        RefinementConfig {
            enabled: true,
            max_iterations: 3,
            critical_keywords,
            issue_patterns: vec![r"(?i)\bcritical\b".to_string()],
            reselect_critics_each_iteration: true,
        }
    }

    #[test]
    fn counts_blocks_with_critical_keyword() {
        let review = "## security\nThere is a security hole here.\n\n## style\nLooks fine.";
        assert_eq!(count_issues(review, &config()), 1);
    }

    #[test]
    fn extract_issues_keeps_only_flagged_blocks() {
        let review = "## security\nThere is a security hole here.\n\n## style\nLooks fine.";
        let extracted = extract_issues(review, &config());
        assert_eq!(extracted, "## security\nThere is a security hole here.");
    }

    #[test]
    fn extract_issues_is_empty_when_nothing_is_flagged() {
        let review = "## style\nLooks fine.\n\n## naming\nAll good.";
        assert_eq!(extract_issues(review, &config()), "");
    }

    #[test]
    fn counts_blocks_matching_issue_pattern() {
        let review = "## perf\nThis is a CRITICAL bottleneck.\n\n## style\nfine";
        assert_eq!(count_issues(review, &config()), 1);
    }

    #[test]
    fn initial_with_zero_issues_converges_immediately() {
        let state = next_state(&RefinementState::Initial, 0, None, &config());
        assert!(matches!(state, RefinementState::Converged { reason, .. } if reason == "no_issues"));
    }

    #[test]
    fn initial_with_issues_starts_iterating() {
        let state = next_state(&RefinementState::Initial, 2, None, &config());
        assert_eq!(state, RefinementState::Iterate(1));
    }

    #[test]
    fn zero_issues_mid_loop_is_success() {
        let state = next_state(&RefinementState::Iterate(1), 0, Some(2), &config());
        assert!(matches!(state, RefinementState::Converged { reason, .. } if reason == "success"));
    }

    #[test]
    fn no_progress_when_issues_do_not_decrease() {
        let state = next_state(&RefinementState::Iterate(1), 3, Some(2), &config());
        assert!(matches!(state, RefinementState::Converged { reason, .. } if reason == "no_progress"));
    }

    #[test]
    fn keeps_iterating_while_progress_is_made_and_under_max() {
        let state = next_state(&RefinementState::Iterate(1), 1, Some(2), &config());
        assert_eq!(state, RefinementState::Iterate(2));
    }

    #[test]
    fn stops_at_max_iterations() {
        let state = next_state(&RefinementState::Iterate(3), 1, Some(2), &config());
        assert!(matches!(state, RefinementState::Converged { reason, .. } if reason == "max_iterations"));
    }
}
