// SPDX-License-Identifier: MIT

use crds::{Deliverable, DeliverableStatus, RealizedResource};
use futures_util::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Config};
use serde_json::json;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::workload::realized_resources;
use super::{
    effective_service_account, is_handled, log_reconcile_outcome, realize_error_condition,
    secret_not_found_condition, submitted_condition, unhandled, unknown_error_condition,
    DELIVERY_READY, READY, RESOURCES_SUBMITTED,
};
use crate::conditions::{condition, ConditionManager, FALSE, TRUE};
use crate::eval::Evaluator;
use crate::realize::{Blueprint, ChainRealizer, IntentContext};
use crate::repository::{ClientBuilder, Repository};
use crate::selector::{select_best, BestMatch};
use crate::track::DynamicTracker;
use crate::ControllerError;

pub struct Context {
    pub repo: Repository,
    pub client_builder: Arc<dyn ClientBuilder>,
    pub evaluator: Arc<dyn Evaluator>,
    pub tracker: DynamicTracker<Deliverable>,
}

pub fn launch(client: Client, base: Config) -> tokio::task::JoinHandle<()> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    crate::watches::deliverable_watches(client.clone(), tx.clone());
    let ctx = Arc::new(Context {
        repo: Repository::new(client.clone()),
        client_builder: Arc::new(crate::repository::TokenClientBuilder::new(base)),
        evaluator: Arc::new(crate::eval::PathEvaluator),
        tracker: DynamicTracker::new(client.clone(), tx),
    });
    let deliverables: Api<Deliverable> = Api::all(client);
    tokio::spawn(
        Controller::new(deliverables, watcher::Config::default())
            .reconcile_on(UnboundedReceiverStream::new(rx))
            .run(reconcile, crate::controller_error_policy, ctx)
            .for_each(crate::controller_info),
    )
}

pub async fn reconcile(
    deliverable: Arc<Deliverable>,
    ctx: Arc<Context>,
) -> Result<Action, ControllerError> {
    let namespace = deliverable.metadata.namespace.clone().unwrap_or_default();
    let previous = deliverable.status.clone().unwrap_or_default();
    let mut manager = ConditionManager::new(
        READY,
        &[DELIVERY_READY, RESOURCES_SUBMITTED],
        &previous.conditions,
    );

    let deliveries = ctx.repo.deliveries().await.map_err(unhandled)?;
    let labels = deliverable.metadata.labels.clone().unwrap_or_default();
    let delivery = match select_best(&labels, &deliveries) {
        BestMatch::Best(delivery) => delivery,
        BestMatch::None => {
            manager.add_positive(condition(
                DELIVERY_READY,
                FALSE,
                "DeliveryNotFound",
                Some(format!(
                    "no delivery found where full selector is satisfied by labels: {labels:?}"
                )),
            ));
            return complete(&ctx, &deliverable, manager, Vec::new(), None).await;
        }
        BestMatch::Ambiguous(names) => {
            manager.add_positive(condition(
                DELIVERY_READY,
                FALSE,
                "MultipleMatches",
                Some(format!(
                    "more than one delivery selected the deliverable: {names:?}"
                )),
            ));
            return complete(&ctx, &deliverable, manager, Vec::new(), None).await;
        }
    };
    manager.add_positive(condition(DELIVERY_READY, TRUE, "Ready", None));
    let blueprint = Blueprint::from_delivery(delivery);

    let (sa_name, sa_namespace) = effective_service_account(
        deliverable.spec.service_account_name.as_deref(),
        blueprint.service_account_ref.as_ref(),
        &namespace,
    );
    let secret = match ctx.repo.service_account_secret(&sa_name, &sa_namespace).await {
        Ok(secret) => secret,
        Err(e) => {
            manager.add_positive(secret_not_found_condition(&e));
            return complete(&ctx, &deliverable, manager, Vec::new(), None).await;
        }
    };
    let stamp_client = match ctx.client_builder.build(&secret) {
        Ok(client) => client,
        Err(e) => {
            manager.add_positive(unknown_error_condition(&e));
            return complete(&ctx, &deliverable, manager, Vec::new(), Some(unhandled(e))).await;
        }
    };

    let intent = IntentContext::deliverable(&deliverable).map_err(unhandled)?;
    let realizer = ChainRealizer {
        repo: &ctx.repo,
        stamp_client,
        evaluator: ctx.evaluator.as_ref(),
    };
    let (slots, first_error) = realizer.realize(&intent, &blueprint).await;
    log_reconcile_outcome("deliverable", &intent.name, first_error.as_ref());

    let mut unhandled_error = None;
    match first_error {
        None => manager.add_positive(submitted_condition()),
        Some(err) => {
            manager.add_positive(realize_error_condition(&err));
            if let Some(templates) = super::templates_not_ready_condition(&err) {
                manager.add_positive(templates);
            }
            if !is_handled(&err) {
                unhandled_error = Some(unhandled(err));
            }
        }
    }

    for slot in &slots {
        if let Some(stamped) = &slot.stamped {
            if let Err(e) = ctx.tracker.watch(stamped) {
                unhandled_error.get_or_insert(unhandled(e));
            }
        }
    }

    let resources = realized_resources(&slots);
    complete(&ctx, &deliverable, manager, resources, unhandled_error).await
}

async fn complete(
    ctx: &Context,
    deliverable: &Deliverable,
    manager: ConditionManager,
    resources: Vec<RealizedResource>,
    error: Option<ControllerError>,
) -> Result<Action, ControllerError> {
    let name = crate::name_or_default(&deliverable.metadata);
    let namespace = deliverable.metadata.namespace.clone().unwrap_or_default();
    let previous = deliverable.status.clone().unwrap_or_default();
    let generation = deliverable.metadata.generation.unwrap_or_default();

    let (conditions, changed) = manager.finalize();
    if changed || previous.observed_generation != generation || previous.resources != resources {
        let status = DeliverableStatus {
            observed_generation: generation.max(previous.observed_generation),
            conditions,
            resources,
        };
        let api: Api<Deliverable> = Api::namespaced(ctx.repo.client(), &namespace);
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
