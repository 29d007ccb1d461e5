// SPDX-License-Identifier: MIT

//! Accumulates conditions during a reconcile and finalises the canonical
//! ordered set, deriving the top-level ready condition and detecting
//! observable change against the prior status.

use crds::Condition;
use k8s_openapi::chrono::Utc;

pub const TRUE: &str = "True";
pub const FALSE: &str = "False";
pub const UNKNOWN: &str = "Unknown";

pub fn condition(type_: &str, status: &str, reason: &str, message: Option<String>) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message,
        last_transition_time: None,
    }
}

pub struct ConditionManager {
    ready_type: &'static str,
    required: Vec<&'static str>,
    previous: Vec<Condition>,
    accumulated: Vec<Condition>,
}

impl ConditionManager {
    pub fn new(ready_type: &'static str, required: &[&'static str], previous: &[Condition]) -> Self {
        Self {
            ready_type,
            required: required.to_vec(),
            previous: previous.to_vec(),
            accumulated: Vec::new(),
        }
    }

    /// Append a condition; a later condition of the same type wins.
    pub fn add_positive(&mut self, condition: Condition) {
        self.accumulated.retain(|c| c.type_ != condition.type_);
        self.accumulated.push(condition);
    }

    /// Sort by type, derive the ready condition and stamp transition times.
    /// The `changed` flag ignores timestamps so unchanged reconciles do not
    /// churn the status.
    pub fn finalize(mut self) -> (Vec<Condition>, bool) {
        let ready = self.derive_ready();
        self.accumulated.push(ready);
        self.accumulated.sort_by(|a, b| a.type_.cmp(&b.type_));

        let mut changed = self.accumulated.len() != self.previous.len();
        for condition in &mut self.accumulated {
            let prior = self.previous.iter().find(|p| p.type_ == condition.type_);
            match prior {
                Some(prior) if same_observable(prior, condition) => {
                    condition.last_transition_time = prior.last_transition_time.clone();
                }
                _ => {
                    changed = true;
                    condition.last_transition_time = Some(Utc::now().to_rfc3339());
                }
            }
        }
        (self.accumulated, changed)
    }

    fn derive_ready(&self) -> Condition {
        for required in &self.required {
            if !self.accumulated.iter().any(|c| c.type_ == *required) {
                return condition(
                    self.ready_type,
                    UNKNOWN,
                    "MissingSubCondition",
                    Some(format!("condition [{required}] was not reported")),
                );
            }
        }
        if let Some(first_false) = self.accumulated.iter().find(|c| c.status == FALSE) {
            return Condition {
                type_: self.ready_type.to_string(),
                status: FALSE.to_string(),
                reason: first_false.reason.clone(),
                message: first_false.message.clone(),
                last_transition_time: None,
            };
        }
        if self.accumulated.iter().all(|c| c.status == TRUE) {
            return condition(self.ready_type, TRUE, "Ready", None);
        }
        let first_unknown = self.accumulated.iter().find(|c| c.status == UNKNOWN);
        Condition {
            type_: self.ready_type.to_string(),
            status: UNKNOWN.to_string(),
            reason: first_unknown.and_then(|c| c.reason.clone()),
            message: first_unknown.and_then(|c| c.message.clone()),
            last_transition_time: None,
        }
    }
}

fn same_observable(a: &Condition, b: &Condition) -> bool {
    a.status == b.status && a.reason == b.reason && a.message == b.message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_true_derives_ready_true() {
        let mut manager = ConditionManager::new("Ready", &["SupplyChainReady", "ResourcesSubmitted"], &[]);
        manager.add_positive(condition("SupplyChainReady", TRUE, "Ready", None));
        manager.add_positive(condition("ResourcesSubmitted", TRUE, "ResourceSubmissionComplete", None));
        let (conditions, changed) = manager.finalize();
        assert!(changed);
        let ready = conditions.iter().find(|c| c.type_ == "Ready").unwrap();
        assert_eq!(ready.status, TRUE);
        // sorted by type
        let types: Vec<&str> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["Ready", "ResourcesSubmitted", "SupplyChainReady"]);
    }

    #[test]
    fn missing_required_condition_derives_unknown() {
        let mut manager = ConditionManager::new("Ready", &["SupplyChainReady", "ResourcesSubmitted"], &[]);
        manager.add_positive(condition("SupplyChainReady", TRUE, "Ready", None));
        let (conditions, _) = manager.finalize();
        let ready = conditions.iter().find(|c| c.type_ == "Ready").unwrap();
        assert_eq!(ready.status, UNKNOWN);
    }

    #[test]
    fn first_false_supplies_reason_and_message() {
        let mut manager = ConditionManager::new("Ready", &["SupplyChainReady", "ResourcesSubmitted"], &[]);
        manager.add_positive(condition("SupplyChainReady", TRUE, "Ready", None));
        manager.add_positive(condition(
            "ResourcesSubmitted",
            FALSE,
            "MissingValueAtPath",
            Some("waiting on $.status.artifact.url".to_string()),
        ));
        let (conditions, _) = manager.finalize();
        let ready = conditions.iter().find(|c| c.type_ == "Ready").unwrap();
        assert_eq!(ready.status, FALSE);
        assert_eq!(ready.reason.as_deref(), Some("MissingValueAtPath"));
        assert!(ready.message.as_deref().unwrap().contains("$.status.artifact.url"));
    }

    #[test]
    fn last_writer_wins_per_type() {
        let mut manager = ConditionManager::new("Ready", &[], &[]);
        manager.add_positive(condition("ResourcesSubmitted", FALSE, "TemplateStampFailure", None));
        manager.add_positive(condition("ResourcesSubmitted", TRUE, "ResourceSubmissionComplete", None));
        let (conditions, _) = manager.finalize();
        let submitted = conditions.iter().find(|c| c.type_ == "ResourcesSubmitted").unwrap();
        assert_eq!(submitted.status, TRUE);
    }

    #[test]
    fn unchanged_set_reports_no_change_and_keeps_timestamps() {
        let mut first = ConditionManager::new("Ready", &["ResourcesSubmitted"], &[]);
        first.add_positive(condition("ResourcesSubmitted", TRUE, "ResourceSubmissionComplete", None));
        let (previous, changed) = first.finalize();
        assert!(changed);
        let stamped = previous[0].last_transition_time.clone();
        assert!(stamped.is_some());

        let mut second = ConditionManager::new("Ready", &["ResourcesSubmitted"], &previous);
        second.add_positive(condition("ResourcesSubmitted", TRUE, "ResourceSubmissionComplete", None));
        let (conditions, changed) = second.finalize();
        assert!(!changed);
        assert_eq!(conditions[0].last_transition_time, stamped);
    }
}
