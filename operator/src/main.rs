// SPDX-License-Identifier: MIT

use kube::{Client, Config};
use log::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::infer().await?;
    let client = Client::try_from(config.clone())?;

    let workloads = operator::controllers::workload::launch(client.clone(), config.clone());
    let deliverables = operator::controllers::deliverable::launch(client.clone(), config.clone());
    let runnables = operator::controllers::runnable::launch(client, config);
    info!("controllers started");

    let (w, d, r) = tokio::join!(workloads, deliverables, runnables);
    w?;
    d?;
    r?;
    Ok(())
}
