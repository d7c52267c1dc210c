//! Storage collaborators: the Wallet resource store and per-fullnode
//! keystores
//!
//! The controller core talks to these seams only; the kube-backed
//! implementations below map Kubernetes failure modes onto the operator's
//! error taxonomy. Conflicts are surfaced, never retried here, so the
//! controller runtime's requeue stays the single retry path.

use crate::crd::{Wallet, WalletStatus};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use std::collections::BTreeMap;

/// Persistence for the Wallet resource itself.
#[async_trait]
pub trait WalletResources: Send + Sync {
    /// Replace the wallet, carrying its resourceVersion so a concurrent
    /// writer surfaces as a conflict.
    async fn persist_spec(&self, wallet: &Wallet) -> Result<()>;

    /// Record observed deployment progress. The operator is the only status
    /// writer.
    async fn persist_status(&self, name: &str, status: &WalletStatus) -> Result<()>;
}

/// Write access to the wallet keystore of each fullnode.
#[async_trait]
pub trait FullnodeKeystores: Send + Sync {
    /// Upsert the exported material under the wallet's address in the named
    /// fullnode's keystore.
    async fn put_wallet(&self, fullnode: &str, address: &str, exported: &str) -> Result<()>;
}

/// Name of the Secret holding a fullnode's wallets.
pub fn keystore_secret_name(fullnode: &str) -> String {
    format!("{fullnode}-wallets")
}

/// Wallet resource store backed by the Kubernetes API.
pub struct KubeWallets {
    api: Api<Wallet>,
}

impl KubeWallets {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl WalletResources for KubeWallets {
    async fn persist_spec(&self, wallet: &Wallet) -> Result<()> {
        let name = wallet.name_any();
        match self.api.replace(&name, &PostParams::default(), wallet).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                Err(OperatorError::ResourceConflict(name))
            }
            Err(e) => Err(OperatorError::KubeApi(e)),
        }
    }

    async fn persist_status(&self, name: &str, status: &WalletStatus) -> Result<()> {
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        self.api
            .patch_status(name, &PatchParams::default(), &patch)
            .await
            .map_err(OperatorError::KubeApi)?;
        Ok(())
    }
}

/// Fullnode keystores backed by `{fullnode}-wallets` Secrets.
///
/// Entries go in through `stringData`; the API server folds them into the
/// Secret's binary `data` map, so existing wallets are preserved.
pub struct SecretKeystores {
    api: Api<Secret>,
}

impl SecretKeystores {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl FullnodeKeystores for SecretKeystores {
    async fn put_wallet(&self, fullnode: &str, address: &str, exported: &str) -> Result<()> {
        let secret_name = keystore_secret_name(fullnode);

        let mut secret = match self.api.get(&secret_name).await {
            Ok(s) => s,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                return Err(OperatorError::KeystoreUnavailable {
                    fullnode: fullnode.to_string(),
                    reason: format!("Secret {secret_name} not found"),
                });
            }
            // Any other lookup failure also makes this keystore unusable for
            // the rest of the pass.
            Err(e) => {
                return Err(OperatorError::KeystoreUnavailable {
                    fullnode: fullnode.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        secret
            .string_data
            .get_or_insert_with(BTreeMap::new)
            .insert(address.to_string(), exported.to_string());

        match self
            .api
            .replace(&secret_name, &PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                Err(OperatorError::KeystoreConflict(fullnode.to_string()))
            }
            Err(e) => Err(OperatorError::KubeApi(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystore_secret_naming() {
        assert_eq!(keystore_secret_name("node0"), "node0-wallets");
    }
}
