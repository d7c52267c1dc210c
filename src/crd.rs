//! Custom Resource Definitions for wallet management

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Wallet is a keypair replicated into the wallet keystore of every fullnode
/// listed in its spec.
///
/// A Wallet created with an empty `exported` field asks the operator to
/// generate a keypair; a Wallet created with pre-existing exported material
/// is left untouched apart from back-filling a missing address.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "wallet.fullnode.dev",
    version = "v1alpha1",
    kind = "Wallet",
    namespaced,
    status = "WalletStatus",
    shortname = "wlt",
    printcolumn = r#"{"name":"KeyType","type":"string","jsonPath":".spec.keyType"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.address"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WalletSpec {
    /// Signature scheme: "secp256k1" or "bls". Empty means "default to bls
    /// when the keypair is generated".
    #[serde(default)]
    pub key_type: String,

    /// Derived public address. Empty until computed; never recomputed once
    /// set.
    #[serde(default)]
    pub address: String,

    /// Hex-encoded serialized key material. Empty until generated; supplying
    /// a value up front imports an externally created wallet.
    #[serde(default)]
    pub exported: String,

    /// Fullnodes whose wallet keystores must receive the exported material.
    /// Order fixes the fan-out order; duplicates carry no meaning.
    #[serde(default)]
    pub fullnodes: Vec<String>,
}

/// Observed state of a Wallet. Written only by the operator.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WalletStatus {
    /// Fullnodes confirmed to hold the exported material under the wallet's
    /// address. Grows monotonically.
    #[serde(default)]
    pub deployed_fullnodes: Vec<String>,
}

/// Reconciliation state of a Wallet, inferred from field contents.
///
/// The wire schema stays the four optional spec/status fields; this enum only
/// exists so the controller can match on the state exhaustively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalletPhase {
    /// No key material yet (`exported` empty).
    Unprovisioned,
    /// Key material present but no derived address.
    AddressPending,
    /// Keypair complete, one or more fullnodes still undeployed.
    Deploying,
    /// Every fullnode in the spec holds the wallet.
    Complete,
}
