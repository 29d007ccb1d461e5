// SPDX-License-Identifier: MIT

//! Typed cluster lookups the realizer depends on, plus the impersonating
//! client seam.

use crds::{
    ClusterConfigTemplate, ClusterDelivery, ClusterDeploymentTemplate, ClusterImageTemplate,
    ClusterRunTemplate, ClusterSourceTemplate, ClusterSupplyChain, ClusterTemplate, TemplateRef,
};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::ListParams;
use kube::{Api, Client, Config};

use crate::errors::SecretLookupError;

#[derive(Clone)]
pub struct Repository {
    client: Client,
}

impl Repository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Resolve a blueprint resource's template reference to its model.
    pub async fn template(
        &self,
        template_ref: &TemplateRef,
    ) -> Result<crate::templates::TemplateModel, kube::Error> {
        use crate::templates::TemplateModel;
        let name = &template_ref.name;
        match template_ref.kind.as_str() {
            "ClusterImageTemplate" => {
                let api: Api<ClusterImageTemplate> = Api::all(self.client.clone());
                Ok(TemplateModel::Image(api.get(name).await?))
            }
            "ClusterConfigTemplate" => {
                let api: Api<ClusterConfigTemplate> = Api::all(self.client.clone());
                Ok(TemplateModel::Config(api.get(name).await?))
            }
            "ClusterTemplate" => {
                let api: Api<ClusterTemplate> = Api::all(self.client.clone());
                Ok(TemplateModel::Plain(api.get(name).await?))
            }
            "ClusterDeploymentTemplate" => {
                let api: Api<ClusterDeploymentTemplate> = Api::all(self.client.clone());
                Ok(TemplateModel::Deployment(api.get(name).await?))
            }
            // An empty kind defaults to the source template, the most common slot.
            "" | "ClusterSourceTemplate" => {
                let api: Api<ClusterSourceTemplate> = Api::all(self.client.clone());
                Ok(TemplateModel::Source(api.get(name).await?))
            }
            other => Err(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("unrecognized template kind [{other}]"),
                reason: "BadRequest".to_string(),
                code: 400,
            })),
        }
    }

    pub async fn run_template(&self, name: &str) -> Result<ClusterRunTemplate, kube::Error> {
        let api: Api<ClusterRunTemplate> = Api::all(self.client.clone());
        api.get(name).await
    }

    pub async fn supply_chains(&self) -> Result<Vec<ClusterSupplyChain>, kube::Error> {
        let api: Api<ClusterSupplyChain> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn deliveries(&self) -> Result<Vec<ClusterDelivery>, kube::Error> {
        let api: Api<ClusterDelivery> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Find the token secret backing a service account: referenced secrets
    /// first, then any token-typed secret annotated with the account's name.
    pub async fn service_account_secret(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Secret, SecretLookupError> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account =
            accounts
                .get(name)
                .await
                .map_err(|source| SecretLookupError::ServiceAccountNotFound {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    source,
                })?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        for reference in account.secrets.unwrap_or_default() {
            let Some(secret_name) = reference.name else {
                continue;
            };
            if let Ok(secret) = secrets.get(&secret_name).await {
                if is_token_secret(&secret) {
                    return Ok(secret);
                }
            }
        }

        let listed = secrets
            .list(&ListParams::default())
            .await
            .map_err(|source| SecretLookupError::ListSecrets {
                namespace: namespace.to_string(),
                source,
            })?;
        listed
            .items
            .into_iter()
            .find(|secret| {
                is_token_secret(secret)
                    && secret
                        .metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get("kubernetes.io/service-account.name"))
                        .is_some_and(|owner| owner == name)
            })
            .ok_or_else(|| SecretLookupError::TokenSecretNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }
}

fn is_token_secret(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some("kubernetes.io/service-account-token")
}

/// Builds a client authenticated as the intent's service account, so stamped
/// objects are applied with the permissions the developer granted.
pub trait ClientBuilder: Send + Sync {
    fn build(&self, secret: &Secret) -> anyhow::Result<Client>;
}

pub struct TokenClientBuilder {
    base: Config,
}

impl TokenClientBuilder {
    pub fn new(base: Config) -> Self {
        Self { base }
    }
}

impl ClientBuilder for TokenClientBuilder {
    fn build(&self, secret: &Secret) -> anyhow::Result<Client> {
        let token = secret
            .data
            .as_ref()
            .and_then(|data| data.get("token"))
            .ok_or_else(|| anyhow::anyhow!("secret has no token key"))?;
        let token = String::from_utf8(token.0.clone())?;
        let mut config = self.base.clone();
        config.auth_info = kube::config::AuthInfo {
            token: Some(token.into()),
            ..Default::default()
        };
        Ok(Client::try_from(config)?)
    }
}
