//! Reconciling a freshly fetched rule ordering with a previously known one.
//!
//! The server is free to return rules in a different order than the one the
//! caller last wrote. For exact-match rules the order carries no meaning, so
//! showing the server's order would only produce diff noise. For prefix and
//! suffix rules the order decides which rule wins, so it is never touched.

use std::collections::HashMap;

use crate::rule::Rule;

/// True when the non-exact rules of `a` and `b` appear in the same relative
/// order. Exact rules are skipped on both sides, so extra or missing exact
/// rules never make two orderings unequal.
pub fn semantically_equal_ordering(a: &[Rule], b: &[Rule]) -> bool {
    let mut a_idx = 0;
    let mut b_idx = 0;

    while a_idx < a.len() && b_idx < b.len() {
        if a[a_idx].is_exact_match() {
            a_idx += 1;
            continue;
        }
        if b[b_idx].is_exact_match() {
            b_idx += 1;
            continue;
        }

        if a[a_idx].metric != b[b_idx].metric {
            return false;
        }

        a_idx += 1;
        b_idx += 1;
    }

    true
}

/// Reorder `upstream` to follow `state` wherever that cannot change which
/// rule matches which metric.
///
/// The output always holds exactly the rules of `upstream` (field values
/// included). Rules known to `state` come first, in `state` order; rules
/// only present upstream follow in upstream order. If the non-exact rules
/// are ordered differently in the two inputs, `upstream` is returned as is.
pub fn align_upstream_with_state(state: &[Rule], upstream: &[Rule]) -> Vec<Rule> {
    if !semantically_equal_ordering(state, upstream) {
        return upstream.to_vec();
    }

    let mut remaining: HashMap<&str, &Rule> =
        upstream.iter().map(|rule| (rule.key(), rule)).collect();
    let mut output = Vec::with_capacity(upstream.len());

    for rule in state {
        if let Some(upstream_rule) = remaining.remove(rule.key()) {
            output.push(upstream_rule.clone());
        }
    }

    for rule in upstream {
        if remaining.remove(rule.key()).is_some() {
            output.push(rule.clone());
        }
    }

    output
}

/// Deterministic order for desired configurations: exact rules first, then
/// prefix, then suffix, each group sorted by metric. Equal keys keep their
/// input order.
///
/// Grouping goes by decoded [`MatchType`](crate::rule::MatchType), not the
/// raw wire string, so a rule with an empty match type and one with
/// `"exact"` fall in the same group and are ordered only by metric between
/// themselves.
pub fn stable_sort_rules(mut rules: Vec<Rule>) -> Vec<Rule> {
    rules.sort_by(|a, b| {
        a.match_type
            .cmp(&b.match_type)
            .then_with(|| a.metric.cmp(&b.metric))
    });
    rules
}
