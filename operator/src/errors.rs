// SPDX-License-Identifier: MIT

//! The error taxonomy realization can surface. The reconcilers map each
//! variant to a condition and decide whether the controller runtime should
//! requeue (unhandled) or wait for a watch to fire (handled).

use crds::TemplateRef;
use thiserror::Error;

use crate::stamp::StampError;
use crate::templates::ExtractError;

#[derive(Debug, Error)]
pub enum RealizeError {
    #[error("get template [{}] for resource [{resource}]: {source}", .template_ref.name)]
    GetTemplate {
        template_ref: TemplateRef,
        resource: String,
        #[source]
        source: kube::Error,
    },

    #[error("get run template [{name}]: {source}")]
    GetRunTemplate {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("stamp object for resource [{resource}]: {source}")]
    Stamp {
        resource: String,
        #[source]
        source: StampError,
    },

    #[error("apply object [{namespace}/{name}] for resource [{resource}]: {source}")]
    ApplyStampedObject {
        resource: String,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("retrieve output for resource [{resource}] from stamped object [{object}]: {source}")]
    RetrieveOutput {
        resource: String,
        object: String,
        #[source]
        source: ExtractError,
    },

    #[error("no stamped object matches selector for runnable [{runnable}]")]
    ResolveSelector { runnable: String },

    #[error(transparent)]
    OrderResources(#[from] crate::dag::WalkError),

    #[error("list objects created for runnable [{runnable}]: {source}")]
    ListCreatedObjects {
        runnable: String,
        #[source]
        source: kube::Error,
    },
}

impl RealizeError {
    /// Forbidden applies surface a condition but must not trigger backoff.
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            RealizeError::ApplyStampedObject {
                source: kube::Error::Api(ae),
                ..
            } if ae.code == 403
        )
    }

    /// The JSONPath behind a missing output, for diagnostics.
    pub fn json_path(&self) -> Option<&str> {
        match self {
            RealizeError::RetrieveOutput { source, .. } => source.path(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SecretLookupError {
    #[error("service account [{namespace}/{name}] not found: {source}")]
    ServiceAccountNotFound {
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("no token secret for service account [{namespace}/{name}]")]
    TokenSecretNotFound { name: String, namespace: String },
    #[error("list secrets in [{namespace}]: {source}")]
    ListSecrets {
        namespace: String,
        #[source]
        source: kube::Error,
    },
}
