//! Kubernetes controller for Wallet resources

use crate::crd::{Wallet, WalletPhase, WalletSpec, WalletStatus};
use crate::error::{OperatorError, Result};
use crate::keys::{ensure_key_material, KeyEngine};
use crate::stores::{FullnodeKeystores, KubeWallets, SecretKeystores, WalletResources};
use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
    Client, ResourceExt,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Controller context
pub struct Context {
    pub client: Client,
    pub keys: Arc<dyn KeyEngine>,
}

/// Run the Wallet controller
pub async fn run_wallet_controller(
    client: Client,
    namespace: String,
    keys: Arc<dyn KeyEngine>,
) -> Result<()> {
    let ctx = Arc::new(Context {
        client: client.clone(),
        keys,
    });

    let wallets: Api<Wallet> = if namespace.is_empty() {
        Api::all(client)
    } else {
        Api::namespaced(client, &namespace)
    };

    info!("Starting Wallet controller");

    Controller::new(wallets, WatcherConfig::default())
        .run(reconcile_wallet, wallet_error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("Reconciled wallet: {:?}", o),
                Err(e) => error!("Wallet reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Reconcile a Wallet resource
async fn reconcile_wallet(wallet: Arc<Wallet>, ctx: Arc<Context>) -> Result<Action> {
    let name = wallet.name_any();
    let namespace = wallet.namespace().unwrap_or_else(|| "default".to_string());

    info!("Reconciling Wallet {}/{}", namespace, name);

    let resources = KubeWallets::new(ctx.client.clone(), &namespace);
    let keystores = SecretKeystores::new(ctx.client.clone(), &namespace);

    let phase = sync_wallet(&wallet, &resources, &keystores, ctx.keys.as_ref()).await?;
    debug!("Wallet {}/{} is {:?}", namespace, name, phase);

    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Bring one wallet in line with its spec: provision key material if needed,
/// then fan the exported form out to every undeployed fullnode.
///
/// Deployment progress is recorded after every keystore write, so a failure
/// mid-fan-out loses at most one fullnode's worth of bookkeeping; the
/// keystore upsert is idempotent, so replaying it on the next pass is
/// harmless.
pub async fn sync_wallet(
    wallet: &Wallet,
    resources: &dyn WalletResources,
    keystores: &dyn FullnodeKeystores,
    keys: &dyn KeyEngine,
) -> Result<WalletPhase> {
    let name = wallet.name_any();
    let mut spec = wallet.spec.clone();
    let mut deployed = wallet
        .status
        .clone()
        .unwrap_or_default()
        .deployed_fullnodes;

    if wallet_phase(&spec, &deployed) == WalletPhase::Complete {
        debug!("Wallet {} is already fully deployed", name);
        return Ok(WalletPhase::Complete);
    }

    if ensure_key_material(&mut spec, keys)? {
        info!("Wallet {} provisioned with address {}", name, spec.address);
        let mut updated = wallet.clone();
        updated.spec = spec.clone();
        resources.persist_spec(&updated).await?;
    }

    for fullnode in undeployed_fullnodes(&spec.fullnodes, &deployed) {
        keystores
            .put_wallet(&fullnode, &spec.address, &spec.exported)
            .await?;
        deployed.push(fullnode.clone());
        resources
            .persist_status(
                &name,
                &WalletStatus {
                    deployed_fullnodes: deployed.clone(),
                },
            )
            .await?;
        info!("Wallet {} deployed to fullnode {}", name, fullnode);
    }

    Ok(WalletPhase::Complete)
}

/// Derive the reconciliation state from field contents.
pub fn wallet_phase(spec: &WalletSpec, deployed: &[String]) -> WalletPhase {
    if spec.exported.is_empty() {
        WalletPhase::Unprovisioned
    } else if spec.address.is_empty() {
        WalletPhase::AddressPending
    } else if !is_fully_deployed(&spec.fullnodes, deployed) {
        WalletPhase::Deploying
    } else {
        WalletPhase::Complete
    }
}

/// True when every fullnode in the spec has received the wallet. Containment
/// only: entries for fullnodes no longer in the spec are ignored, not pruned.
pub fn is_fully_deployed(fullnodes: &[String], deployed: &[String]) -> bool {
    fullnodes.iter().all(|n| deployed.iter().any(|d| d == n))
}

/// Fullnodes still waiting for the wallet, in spec order, duplicates
/// dropped. Safe to recompute every pass.
pub fn undeployed_fullnodes(fullnodes: &[String], deployed: &[String]) -> Vec<String> {
    let mut pending: Vec<String> = Vec::new();
    for fullnode in fullnodes {
        if deployed.iter().any(|d| d == fullnode) || pending.iter().any(|p| p == fullnode) {
            continue;
        }
        pending.push(fullnode.clone());
    }
    pending
}

fn wallet_error_policy(wallet: Arc<Wallet>, error: &OperatorError, _ctx: Arc<Context>) -> Action {
    error!(
        "Error reconciling wallet {}: {:?}",
        wallet.name_any(),
        error
    );
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{decode_key_info, encode_key_info, KeyType, LocalKeyEngine};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemWallets {
        spec_writes: Mutex<Vec<WalletSpec>>,
        status_writes: Mutex<Vec<Vec<String>>>,
    }

    impl MemWallets {
        fn spec_writes(&self) -> Vec<WalletSpec> {
            self.spec_writes.lock().unwrap().clone()
        }

        fn status_writes(&self) -> Vec<Vec<String>> {
            self.status_writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WalletResources for MemWallets {
        async fn persist_spec(&self, wallet: &Wallet) -> Result<()> {
            self.spec_writes.lock().unwrap().push(wallet.spec.clone());
            Ok(())
        }

        async fn persist_status(&self, _name: &str, status: &WalletStatus) -> Result<()> {
            self.status_writes
                .lock()
                .unwrap()
                .push(status.deployed_fullnodes.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemKeystores {
        missing: BTreeSet<String>,
        entries: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    }

    impl MemKeystores {
        fn with_missing(fullnodes: &[&str]) -> Self {
            Self {
                missing: fullnodes.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn entries(&self) -> BTreeMap<String, BTreeMap<String, String>> {
            self.entries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FullnodeKeystores for MemKeystores {
        async fn put_wallet(&self, fullnode: &str, address: &str, exported: &str) -> Result<()> {
            if self.missing.contains(fullnode) {
                return Err(OperatorError::KeystoreUnavailable {
                    fullnode: fullnode.to_string(),
                    reason: "Secret not found".to_string(),
                });
            }
            self.entries
                .lock()
                .unwrap()
                .entry(fullnode.to_string())
                .or_default()
                .insert(address.to_string(), exported.to_string());
            Ok(())
        }
    }

    fn wallet(spec: WalletSpec, deployed: &[&str]) -> Wallet {
        let mut w = Wallet::new("treasury", spec);
        w.status = Some(WalletStatus {
            deployed_fullnodes: deployed.iter().map(|s| s.to_string()).collect(),
        });
        w
    }

    fn spec(key_type: &str, address: &str, exported: &str, fullnodes: &[&str]) -> WalletSpec {
        WalletSpec {
            key_type: key_type.to_string(),
            address: address.to_string(),
            exported: exported.to_string(),
            fullnodes: fullnodes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fully_deployed_is_set_containment() {
        assert!(is_fully_deployed(&[], &[]));
        assert!(is_fully_deployed(&names(&["a"]), &names(&["a"])));
        assert!(is_fully_deployed(&names(&["a", "b"]), &names(&["b", "a"])));
        assert!(!is_fully_deployed(&names(&["a", "b"]), &names(&["a"])));
        // Stale status entries do not block completeness.
        assert!(is_fully_deployed(&names(&["a"]), &names(&["a", "gone"])));
        // Duplicates in the spec do not affect the result.
        assert!(is_fully_deployed(&names(&["a", "a"]), &names(&["a"])));
    }

    #[test]
    fn undeployed_preserves_order_and_drops_duplicates() {
        assert_eq!(
            undeployed_fullnodes(&names(&["c", "a", "b", "a"]), &names(&["b"])),
            names(&["c", "a"])
        );
        assert!(undeployed_fullnodes(&names(&["a"]), &names(&["a"])).is_empty());
    }

    #[test]
    fn phase_derivation_is_exhaustive() {
        let cases = [
            (spec("", "", "", &["a"]), vec![], WalletPhase::Unprovisioned),
            (
                spec("bls", "", "abcd", &["a"]),
                vec![],
                WalletPhase::AddressPending,
            ),
            (
                spec("bls", "0x1", "abcd", &["a"]),
                vec![],
                WalletPhase::Deploying,
            ),
            (
                spec("bls", "0x1", "abcd", &["a"]),
                names(&["a"]),
                WalletPhase::Complete,
            ),
            (spec("bls", "0x1", "abcd", &[]), vec![], WalletPhase::Complete),
        ];
        for (s, deployed, expected) in cases {
            assert_eq!(wallet_phase(&s, &deployed), expected);
        }
    }

    // Fresh wallet with two fullnodes: generates bls material, writes both
    // keystores, records progress after each write.
    #[tokio::test]
    async fn generates_and_fans_out() {
        let w = wallet(spec("", "", "", &["nodeA", "nodeB"]), &[]);
        let resources = MemWallets::default();
        let keystores = MemKeystores::default();

        let phase = sync_wallet(&w, &resources, &keystores, &LocalKeyEngine)
            .await
            .unwrap();
        assert_eq!(phase, WalletPhase::Complete);

        let specs = resources.spec_writes();
        assert_eq!(specs.len(), 1);
        let written = &specs[0];
        assert_eq!(written.key_type, "bls");
        assert!(!written.address.is_empty());
        assert_eq!(
            decode_key_info(&written.exported).unwrap().key_type,
            KeyType::Bls
        );

        let entries = keystores.entries();
        for fullnode in ["nodeA", "nodeB"] {
            assert_eq!(
                entries[fullnode][&written.address], written.exported,
                "fullnode {fullnode} missing the wallet"
            );
        }

        // Status persisted once per fullnode, growing monotonically.
        assert_eq!(
            resources.status_writes(),
            vec![names(&["nodeA"]), names(&["nodeA", "nodeB"])]
        );
    }

    // Imported key with no address and no fullnodes: address is back-filled,
    // nothing is written to any keystore.
    #[tokio::test]
    async fn backfills_address_for_imported_key() {
        let engine = LocalKeyEngine;
        let (info, address) = engine.generate(KeyType::Secp256k1).unwrap();
        let exported = encode_key_info(&info).unwrap();

        let w = wallet(spec("secp256k1", "", &exported, &[]), &[]);
        let resources = MemWallets::default();
        let keystores = MemKeystores::default();

        let phase = sync_wallet(&w, &resources, &keystores, &engine)
            .await
            .unwrap();
        assert_eq!(phase, WalletPhase::Complete);

        let specs = resources.spec_writes();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].address, address);
        assert_eq!(specs[0].exported, exported);

        assert!(keystores.entries().is_empty());
        assert!(resources.status_writes().is_empty());
    }

    // Partial fan-out failure: progress up to the failing fullnode is
    // committed, the rest is left for the next pass.
    #[tokio::test]
    async fn partial_fanout_commits_progress_then_fails() {
        let engine = LocalKeyEngine;
        let (info, address) = engine.generate(KeyType::Bls).unwrap();
        let exported = encode_key_info(&info).unwrap();

        let w = wallet(spec("bls", &address, &exported, &["nodeA", "nodeB"]), &[]);
        let resources = MemWallets::default();
        let keystores = MemKeystores::with_missing(&["nodeB"]);

        let err = sync_wallet(&w, &resources, &keystores, &engine)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OperatorError::KeystoreUnavailable { ref fullnode, .. } if fullnode == "nodeB"
        ));

        assert!(keystores.entries().contains_key("nodeA"));
        assert!(!keystores.entries().contains_key("nodeB"));
        assert_eq!(resources.status_writes(), vec![names(&["nodeA"])]);

        // Retry pass with nodeA recorded: only nodeB is written.
        let w = wallet(spec("bls", &address, &exported, &["nodeA", "nodeB"]), &["nodeA"]);
        let resources = MemWallets::default();
        let keystores = MemKeystores::default();

        sync_wallet(&w, &resources, &keystores, &engine)
            .await
            .unwrap();
        assert!(!keystores.entries().contains_key("nodeA"));
        assert!(keystores.entries().contains_key("nodeB"));
        assert_eq!(resources.status_writes(), vec![names(&["nodeA", "nodeB"])]);
    }

    // Unsupported key type: the error surfaces and nothing is persisted.
    #[tokio::test]
    async fn unsupported_key_type_mutates_nothing() {
        let w = wallet(spec("rsa", "", "", &["nodeA"]), &[]);
        let resources = MemWallets::default();
        let keystores = MemKeystores::default();

        let err = sync_wallet(&w, &resources, &keystores, &LocalKeyEngine)
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::UnsupportedKeyType(_)));

        assert!(resources.spec_writes().is_empty());
        assert!(resources.status_writes().is_empty());
        assert!(keystores.entries().is_empty());
    }

    // Fully deployed wallet: no collaborator call of any kind.
    #[tokio::test]
    async fn complete_wallet_is_a_noop() {
        let w = wallet(
            spec("bls", "0xabc", "deadbeef", &["nodeA", "nodeB"]),
            &["nodeA", "nodeB"],
        );
        let resources = MemWallets::default();
        let keystores = MemKeystores::default();

        let phase = sync_wallet(&w, &resources, &keystores, &LocalKeyEngine)
            .await
            .unwrap();
        assert_eq!(phase, WalletPhase::Complete);

        assert!(resources.spec_writes().is_empty());
        assert!(resources.status_writes().is_empty());
        assert!(keystores.entries().is_empty());
    }

    // Pre-provisioned material is never regenerated while fan-out proceeds.
    #[tokio::test]
    async fn existing_material_is_never_regenerated() {
        let engine = LocalKeyEngine;
        let (info, address) = engine.generate(KeyType::Secp256k1).unwrap();
        let exported = encode_key_info(&info).unwrap();

        let w = wallet(spec("secp256k1", &address, &exported, &["nodeA"]), &[]);
        let resources = MemWallets::default();
        let keystores = MemKeystores::default();

        sync_wallet(&w, &resources, &keystores, &engine)
            .await
            .unwrap();

        // No spec write: the keypair fields were already complete.
        assert!(resources.spec_writes().is_empty());
        assert_eq!(keystores.entries()["nodeA"][&address], exported);
    }
}
