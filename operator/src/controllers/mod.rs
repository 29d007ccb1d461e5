// SPDX-License-Identifier: MIT

//! Per-intent-kind reconcilers: load the intent, match a blueprint, realize,
//! track stamped kinds and write back an accurate condition set.

pub mod deliverable;
pub mod runnable;
pub mod workload;

use crds::Condition;
use log::info;

use crate::conditions::{condition, FALSE, TRUE, UNKNOWN};
use crate::errors::RealizeError;
use crate::ControllerError;

pub const READY: &str = "Ready";
pub const SUPPLY_CHAIN_READY: &str = "SupplyChainReady";
pub const DELIVERY_READY: &str = "DeliveryReady";
pub const RUN_TEMPLATE_READY: &str = "RunTemplateReady";
pub const RESOURCES_SUBMITTED: &str = "ResourcesSubmitted";
pub const TEMPLATES_READY: &str = "TemplatesReady";
pub const SERVICE_ACCOUNT_SECRET_FOUND: &str = "ServiceAccountSecretFound";

pub fn unhandled(err: impl Into<anyhow::Error>) -> ControllerError {
    ControllerError(err.into())
}

pub fn realize_error_reason(err: &RealizeError) -> &'static str {
    match err {
        RealizeError::GetTemplate { .. } | RealizeError::GetRunTemplate { .. } => {
            "TemplateObjectRetrievalFailure"
        }
        RealizeError::Stamp { .. } | RealizeError::ResolveSelector { .. } => "TemplateStampFailure",
        RealizeError::ApplyStampedObject { .. } => "StampedObjectRejectedByAPIServer",
        RealizeError::RetrieveOutput { .. } => "MissingValueAtPath",
        RealizeError::OrderResources(_) => "ResourceOrderingFailure",
        RealizeError::ListCreatedObjects { .. } => "FailedToListCreatedObjects",
    }
}

/// Map a realization failure to the `ResourcesSubmitted` contributor.
pub fn realize_error_condition(err: &RealizeError) -> Condition {
    condition(
        RESOURCES_SUBMITTED,
        FALSE,
        realize_error_reason(err),
        Some(format!("{err}")),
    )
}

/// A failed template lookup also marks the `TemplatesReady` contributor.
pub fn templates_not_ready_condition(err: &RealizeError) -> Option<Condition> {
    matches!(err, RealizeError::GetTemplate { .. }).then(|| {
        condition(
            TEMPLATES_READY,
            FALSE,
            "TemplateObjectRetrievalFailure",
            Some(format!("{err}")),
        )
    })
}

/// Handled errors surface a condition and wait for a watch to fire; anything
/// else is returned to the runtime for backoff.
pub fn is_handled(err: &RealizeError) -> bool {
    match err {
        RealizeError::GetTemplate { .. }
        | RealizeError::GetRunTemplate { .. }
        | RealizeError::Stamp { .. }
        | RealizeError::ResolveSelector { .. }
        | RealizeError::RetrieveOutput { .. }
        | RealizeError::OrderResources(_) => true,
        RealizeError::ApplyStampedObject { .. } => err.is_forbidden(),
        RealizeError::ListCreatedObjects { .. } => false,
    }
}

pub fn submitted_condition() -> Condition {
    condition(RESOURCES_SUBMITTED, TRUE, "ResourceSubmissionComplete", None)
}

pub fn unknown_error_condition(err: &anyhow::Error) -> Condition {
    condition(RESOURCES_SUBMITTED, UNKNOWN, "UnknownError", Some(format!("{err:#}")))
}

pub fn secret_not_found_condition(err: &crate::errors::SecretLookupError) -> Condition {
    condition(
        SERVICE_ACCOUNT_SECRET_FOUND,
        FALSE,
        "ServiceAccountSecretNotFound",
        Some(format!("{err}")),
    )
}

/// The effective service account for an intent: its own, else the blueprint's
/// reference (empty ref namespace means the intent's namespace), else
/// `default`.
pub fn effective_service_account(
    intent_account: Option<&str>,
    blueprint_ref: Option<&crds::ServiceAccountRef>,
    intent_namespace: &str,
) -> (String, String) {
    if let Some(name) = intent_account {
        return (name.to_string(), intent_namespace.to_string());
    }
    if let Some(reference) = blueprint_ref {
        let namespace = reference
            .namespace
            .clone()
            .unwrap_or_else(|| intent_namespace.to_string());
        return (reference.name.clone(), namespace);
    }
    ("default".to_string(), intent_namespace.to_string())
}

pub fn log_reconcile_outcome(kind: &str, name: &str, err: Option<&RealizeError>) {
    match err {
        None => info!("{kind} [{name}] realized"),
        Some(e) => info!("{kind} [{name}] realization incomplete: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::StampError;

    fn forbidden() -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        })
    }

    fn server_error() -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        })
    }

    #[test]
    fn forbidden_apply_is_handled_other_api_errors_are_not() {
        let apply = |source| RealizeError::ApplyStampedObject {
            resource: "src".to_string(),
            namespace: "dev".to_string(),
            name: "repo".to_string(),
            source,
        };
        assert!(is_handled(&apply(forbidden())));
        assert!(!is_handled(&apply(server_error())));
        let cond = realize_error_condition(&apply(forbidden()));
        assert_eq!(cond.reason.as_deref(), Some("StampedObjectRejectedByAPIServer"));
        assert_eq!(cond.status, FALSE);
    }

    #[test]
    fn missing_output_condition_carries_the_path() {
        let err = RealizeError::RetrieveOutput {
            resource: "src".to_string(),
            object: "repo".to_string(),
            source: crate::templates::ExtractError::MissingValue {
                path: "$.status.artifact.url".to_string(),
                problem: "key [artifact] not found".to_string(),
            },
        };
        assert!(is_handled(&err));
        let cond = realize_error_condition(&err);
        assert_eq!(cond.reason.as_deref(), Some("MissingValueAtPath"));
        assert!(cond.message.as_deref().unwrap().contains("$.status.artifact.url"));
    }

    #[test]
    fn stamp_failures_are_handled() {
        let err = RealizeError::Stamp {
            resource: "src".to_string(),
            source: StampError::MissingTypeMeta,
        };
        assert!(is_handled(&err));
        assert_eq!(
            realize_error_condition(&err).reason.as_deref(),
            Some("TemplateStampFailure")
        );
    }

    #[test]
    fn blueprint_service_account_fallback_respects_namespaces() {
        let reference = crds::ServiceAccountRef {
            name: "builder".to_string(),
            namespace: Some("platform".to_string()),
        };
        assert_eq!(
            effective_service_account(Some("own"), Some(&reference), "dev"),
            ("own".to_string(), "dev".to_string())
        );
        assert_eq!(
            effective_service_account(None, Some(&reference), "dev"),
            ("builder".to_string(), "platform".to_string())
        );
        let unscoped = crds::ServiceAccountRef {
            name: "builder".to_string(),
            namespace: None,
        };
        assert_eq!(
            effective_service_account(None, Some(&unscoped), "dev"),
            ("builder".to_string(), "dev".to_string())
        );
        assert_eq!(
            effective_service_account(None, None, "dev"),
            ("default".to_string(), "dev".to_string())
        );
    }
}
