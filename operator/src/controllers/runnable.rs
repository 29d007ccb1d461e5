// SPDX-License-Identifier: MIT

use crds::{Runnable, RunnableStatus};
use futures_util::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Config};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    effective_service_account, is_handled, realize_error_reason, secret_not_found_condition,
    unhandled, unknown_error_condition, READY, RUN_TEMPLATE_READY,
};
use crate::conditions::{condition, ConditionManager, FALSE, TRUE};
use crate::errors::RealizeError;
use crate::eval::Evaluator;
use crate::realize::realize_runnable;
use crate::repository::{ClientBuilder, Repository};
use crate::track::DynamicTracker;
use crate::ControllerError;

pub struct Context {
    pub repo: Repository,
    pub client_builder: Arc<dyn ClientBuilder>,
    pub evaluator: Arc<dyn Evaluator>,
    pub tracker: DynamicTracker<Runnable>,
}

pub fn launch(client: Client, base: Config) -> tokio::task::JoinHandle<()> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    crate::watches::runnable_watches(client.clone(), tx.clone());
    let ctx = Arc::new(Context {
        repo: Repository::new(client.clone()),
        client_builder: Arc::new(crate::repository::TokenClientBuilder::new(base)),
        evaluator: Arc::new(crate::eval::PathEvaluator),
        tracker: DynamicTracker::new(client.clone(), tx),
    });
    let runnables: Api<Runnable> = Api::all(client);
    tokio::spawn(
        Controller::new(runnables, watcher::Config::default())
            .reconcile_on(UnboundedReceiverStream::new(rx))
            .run(reconcile, crate::controller_error_policy, ctx)
            .for_each(crate::controller_info),
    )
}

pub async fn reconcile(
    runnable: Arc<Runnable>,
    ctx: Arc<Context>,
) -> Result<Action, ControllerError> {
    let name = crate::name_or_default(&runnable.metadata);
    let namespace = runnable.metadata.namespace.clone().unwrap_or_default();
    let previous = runnable.status.clone().unwrap_or_default();
    let mut manager = ConditionManager::new(READY, &[RUN_TEMPLATE_READY], &previous.conditions);

    let (sa_name, sa_namespace) = effective_service_account(
        runnable.spec.service_account_name.as_deref(),
        None,
        &namespace,
    );
    let secret = match ctx.repo.service_account_secret(&sa_name, &sa_namespace).await {
        Ok(secret) => secret,
        Err(e) => {
            manager.add_positive(secret_not_found_condition(&e));
            return complete(&ctx, &runnable, manager, BTreeMap::new(), None).await;
        }
    };
    let stamp_client = match ctx.client_builder.build(&secret) {
        Ok(client) => client,
        Err(e) => {
            manager.add_positive(unknown_error_condition(&e));
            return complete(&ctx, &runnable, manager, BTreeMap::new(), Some(unhandled(e))).await;
        }
    };

    let mut unhandled_error = None;
    let mut outputs = previous.outputs.clone();
    match realize_runnable(&ctx.repo, &stamp_client, ctx.evaluator.as_ref(), &runnable).await {
        Ok(realization) => {
            manager.add_positive(condition(RUN_TEMPLATE_READY, TRUE, "Ready", None));
            outputs = realization.outputs;
            if let Some(stamped) = &realization.stamped {
                if let Err(e) = ctx.tracker.watch(stamped) {
                    unhandled_error = Some(unhandled(e));
                }
            }
        }
        Err(err) => {
            manager.add_positive(runnable_error_condition(&err));
            if !is_handled(&err) {
                unhandled_error = Some(unhandled(err));
            }
        }
    }

    log::info!("runnable [{name}] reconciled");
    complete(&ctx, &runnable, manager, outputs, unhandled_error).await
}

fn runnable_error_condition(err: &RealizeError) -> crds::Condition {
    condition(
        RUN_TEMPLATE_READY,
        FALSE,
        realize_error_reason(err),
        Some(format!("{err}")),
    )
}

async fn complete(
    ctx: &Context,
    runnable: &Runnable,
    manager: ConditionManager,
    outputs: BTreeMap<String, Value>,
    error: Option<ControllerError>,
) -> Result<Action, ControllerError> {
    let name = crate::name_or_default(&runnable.metadata);
    let namespace = runnable.metadata.namespace.clone().unwrap_or_default();
    let previous = runnable.status.clone().unwrap_or_default();
    let generation = runnable.metadata.generation.unwrap_or_default();

    let (conditions, changed) = manager.finalize();
    if changed || previous.observed_generation != generation || previous.outputs != outputs {
        let status = RunnableStatus {
            observed_generation: generation.max(previous.observed_generation),
            conditions,
            outputs,
        };
        let api: Api<Runnable> = Api::namespaced(ctx.repo.client(), &namespace);
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await
        .map_err(unhandled)?;
    }

    match error {
        Some(e) => Err(e),
        None => Ok(Action::await_change()),
    }
}
