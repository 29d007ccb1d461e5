// SPDX-License-Identifier: MIT

//! Best-label-match selection of a blueprint for an intent.

use crds::{ClusterDelivery, ClusterSupplyChain, Selector, SelectorOperator};
use std::collections::BTreeMap;

/// Anything that selects intents by labels and is identified by name.
pub trait Selectable {
    fn selector(&self) -> &Selector;
    fn name(&self) -> String;
}

impl Selectable for ClusterSupplyChain {
    fn selector(&self) -> &Selector {
        &self.spec.selector
    }
    fn name(&self) -> String {
        crate::name_or_default(&self.metadata)
    }
}

impl Selectable for ClusterDelivery {
    fn selector(&self) -> &Selector {
        &self.spec.selector
    }
    fn name(&self) -> String {
        crate::name_or_default(&self.metadata)
    }
}

#[derive(Debug)]
pub enum BestMatch<'a, T> {
    Best(&'a T),
    None,
    /// Several blueprints tie at the highest selector cardinality.
    Ambiguous(Vec<String>),
}

pub fn matches(selector: &Selector, labels: &BTreeMap<String, String>) -> bool {
    for (key, value) in &selector.match_labels {
        if labels.get(key) != Some(value) {
            return false;
        }
    }
    for requirement in &selector.match_expressions {
        let found = labels.get(&requirement.key);
        let ok = match requirement.operator {
            SelectorOperator::In => found.is_some_and(|v| requirement.values.contains(v)),
            SelectorOperator::NotIn => !found.is_some_and(|v| requirement.values.contains(v)),
            SelectorOperator::Exists => found.is_some(),
            SelectorOperator::DoesNotExist => found.is_none(),
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Pick the single blueprint with the most specific matching selector.
/// Blueprints are compared by name; two identically shaped blueprints with
/// different names are two matches and tie-break to `Ambiguous`.
pub fn select_best<'a, T: Selectable>(
    labels: &BTreeMap<String, String>,
    candidates: &'a [T],
) -> BestMatch<'a, T> {
    let matching: Vec<&T> = candidates
        .iter()
        .filter(|c| matches(c.selector(), labels))
        .collect();
    let Some(max) = matching.iter().map(|c| c.selector().cardinality()).max() else {
        return BestMatch::None;
    };
    let best: Vec<&T> = matching
        .into_iter()
        .filter(|c| c.selector().cardinality() == max)
        .collect();
    match best.as_slice() {
        [single] => BestMatch::Best(single),
        _ => BestMatch::Ambiguous(best.iter().map(|c| c.name()).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{ClusterSupplyChainSpec, SelectorRequirement};

    fn chain(name: &str, labels: &[(&str, &str)], expressions: Vec<SelectorRequirement>) -> ClusterSupplyChain {
        ClusterSupplyChain::new(
            name,
            ClusterSupplyChainSpec {
                selector: Selector {
                    match_labels: labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    match_expressions: expressions,
                },
                resources: vec![],
                service_account_ref: None,
            },
        )
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn most_specific_selector_wins() {
        let chains = vec![
            chain("broad", &[("app", "web")], vec![]),
            chain("narrow", &[("app", "web"), ("tier", "frontend")], vec![]),
        ];
        let intent = labels(&[("app", "web"), ("tier", "frontend")]);
        match select_best(&intent, &chains) {
            BestMatch::Best(c) => assert_eq!(c.name(), "narrow"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ties_at_max_cardinality_are_ambiguous() {
        let chains = vec![
            chain("one", &[("app", "web")], vec![]),
            chain("two", &[("app", "web")], vec![]),
        ];
        match select_best(&labels(&[("app", "web")]), &chains) {
            BestMatch::Ambiguous(names) => {
                assert_eq!(names, vec!["one".to_string(), "two".to_string()])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn no_match_when_no_selector_holds() {
        let chains = vec![chain("one", &[("app", "web")], vec![])];
        assert!(matches!(
            select_best(&labels(&[("app", "api")]), &chains),
            BestMatch::None
        ));
    }

    #[test]
    fn expressions_count_toward_specificity() {
        let chains = vec![
            chain("labels-only", &[("app", "web")], vec![]),
            chain(
                "with-expression",
                &[("app", "web")],
                vec![SelectorRequirement {
                    key: "tier".to_string(),
                    operator: SelectorOperator::Exists,
                    values: vec![],
                }],
            ),
        ];
        let intent = labels(&[("app", "web"), ("tier", "frontend")]);
        match select_best(&intent, &chains) {
            BestMatch::Best(c) => assert_eq!(c.name(), "with-expression"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let chains = vec![
            chain("a", &[("app", "web")], vec![]),
            chain("b", &[("app", "web"), ("env", "prod")], vec![]),
        ];
        let intent = labels(&[("app", "web"), ("env", "prod")]);
        for _ in 0..3 {
            match select_best(&intent, &chains) {
                BestMatch::Best(c) => assert_eq!(c.name(), "b"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
