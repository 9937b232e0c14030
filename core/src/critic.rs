//! Critic Selector: keyword-relevance scoring with min/max cardinality
//! and a configured fallback.

use crate::config::CriticConfig;
use crate::protocol::{SelectedCritic, SelectionLog};

/// Select the critics that should run for `(prompt, builder_output)`.
pub fn select(prompt: &str, builder_output: &str, config: &CriticConfig) -> SelectionLog {
    if !config.dynamic_selection_enabled {
        let selected = config
            .critics
            .iter()
            .map(|c| SelectedCritic { name: c.name.clone(), score: 0, from_fallback: false })
            .collect();
        return SelectionLog { selected, skipped: Vec::new() };
    }

    let haystack = format!("{prompt} {builder_output}").to_lowercase();

    let scored: Vec<(usize, &str, u32)> = config
        .critics
        .iter()
        .enumerate()
        .map(|(order, c)| (order, c.name.as_str(), score_critic(&haystack, &c.keywords)))
        .collect();

    let mut selected: Vec<SelectedCritic> = scored
        .iter()
        .filter(|(_, _, score)| *score > 0)
        .map(|(_, name, score)| SelectedCritic { name: name.to_string(), score: *score, from_fallback: false })
        .collect();
    // Order by score descending, then by configured order.
    selected.sort_by(|a, b| {
        let score_cmp = b.score.cmp(&a.score);
        if score_cmp != std::cmp::Ordering::Equal {
            return score_cmp;
        }
        let a_order = config.critics.iter().position(|c| c.name == a.name).unwrap_or(usize::MAX);
        let b_order = config.critics.iter().position(|c| c.name == b.name).unwrap_or(usize::MAX);
        a_order.cmp(&b_order)
    });

    let mut skipped: Vec<String> = config
        .critics
        .iter()
        .filter(|c| !selected.iter().any(|s| s.name == c.name))
        .map(|c| c.name.clone())
        .collect();

    if selected.len() < config.min_critics {
        for name in &config.fallback_critics {
            if selected.len() >= config.min_critics {
                break;
            }
            if selected.iter().any(|s| &s.name == name) {
                continue;
            }
            selected.push(SelectedCritic { name: name.clone(), score: 0, from_fallback: true });
            skipped.retain(|s| s != name);
        }
    }

    if selected.len() > config.max_critics {
        let overflow: Vec<String> = selected[config.max_critics..].iter().map(|s| s.name.clone()).collect();
        selected.truncate(config.max_critics);
        skipped.extend(overflow);
    }

    SelectionLog { selected, skipped }
}

/// Build a [`SelectionLog`] from a fixed list of critic names, bypassing
/// keyword scoring entirely. Used by the Refinement Controller when
/// `reselect_critics_each_iteration` is `false` to pin the initial
/// iteration's selection across subsequent iterations.
pub fn pinned(names: &[String]) -> SelectionLog {
    SelectionLog {
        selected: names
            .iter()
            .map(|name| SelectedCritic { name: name.clone(), score: 0, from_fallback: false })
            .collect(),
        skipped: Vec::new(),
    }
}

fn score_critic(haystack: &str, keywords: &std::collections::HashSet<String>) -> u32 {
    let haystack = haystack.to_lowercase();
    keywords.iter().map(|kw| haystack.matches(kw.as_str()).count() as u32).sum()
}
