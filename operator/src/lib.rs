// SPDX-License-Identifier: MIT

use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use log::{error, info, warn};
use std::fmt::{Debug, Display};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod conditions;
pub mod controllers;
pub mod dag;
pub mod errors;
pub mod eval;
pub mod mapper;
pub mod realize;
pub mod repository;
pub mod selector;
pub mod stamp;
pub mod templates;
pub mod track;
pub mod watches;

/// Error a reconciler hands back to the controller runtime. Handled failures
/// become conditions and never reach this type; anything wrapped here is
/// requeued with backoff.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ControllerError(#[from] pub anyhow::Error);

pub fn controller_error_policy<K, C>(_obj: Arc<K>, err: &ControllerError, _ctx: Arc<C>) -> Action {
    error!("reconcile failed, requeueing: {err:#}");
    Action::requeue(Duration::from_secs(10))
}

/// Terminal logger for a controller's output stream.
pub async fn controller_info<T: Debug, E: Display>(res: Result<T, E>) {
    match res {
        Ok(o) => info!("reconciled {o:?}"),
        Err(e) => warn!("reconcile error: {e}"),
    }
}

pub fn name_or_default(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_else(|| "<unnamed>".to_string())
}
