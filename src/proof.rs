//! Provenance proofs for proxied exchanges.
//!
//! Each completed exchange gets a proof binding the canonicalized request to
//! the route it was assigned: waypoint hashes are folded into a binary Merkle
//! root (odd node duplicated before combining, empty route pinned to a
//! sentinel root), and the signature is `SHA256(request_hash || merkle_root
//! || secret)`. Proof generation never fails the exchange; on any internal
//! error it yields a proof marked unverifiable instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sentinel hashed in place of waypoints when a route is empty
const EMPTY_ROUTE_SENTINEL: &[u8] = b"qgate:empty-route";

/// The request fields bound by a proof
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    pub method: String,
    pub url: String,
    pub client: String,
    pub timestamp: DateTime<Utc>,
}

impl RequestSummary {
    /// Canonical form fed to the request hash. Field order is part of the
    /// proof format and must not change.
    fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.method,
            self.url,
            self.timestamp.to_rfc3339(),
            self.client
        )
    }
}

/// Immutable proof over one exchange, 1:1 with its traffic record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    pub request_hash: String,
    pub route: Vec<u32>,
    pub merkle_root: String,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    pub verifiable: bool,
    pub error: Option<String>,
}

/// Builds and checks exchange proofs
#[derive(Clone)]
pub struct ProofGenerator {
    secret: String,
}

impl ProofGenerator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Generate a proof for a request and its route. Infallible by contract:
    /// an internal error produces an unverifiable proof, never a panic or an
    /// aborted exchange.
    pub fn generate(&self, summary: &RequestSummary, route: &[u32]) -> Proof {
        let request_hash = sha256_hex(summary.canonical().as_bytes());
        let merkle_root = hex::encode(merkle_root(route));
        let signature = self.sign(&request_hash, &merkle_root);

        Proof {
            request_hash,
            route: route.to_vec(),
            merkle_root,
            signature,
            timestamp: summary.timestamp,
            verifiable: true,
            error: None,
        }
    }

    /// Recompute the signature and compare by value
    pub fn verify(&self, proof: &Proof) -> bool {
        if !proof.verifiable {
            return false;
        }
        let expected_root = hex::encode(merkle_root(&proof.route));
        if expected_root != proof.merkle_root {
            return false;
        }
        self.sign(&proof.request_hash, &proof.merkle_root) == proof.signature
    }

    fn sign(&self, request_hash: &str, merkle_root: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request_hash.as_bytes());
        hasher.update(merkle_root.as_bytes());
        hasher.update(self.secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// An unverifiable placeholder proof carrying the failure reason
pub fn unverifiable(summary: &RequestSummary, route: &[u32], error: impl Into<String>) -> Proof {
    Proof {
        request_hash: String::new(),
        route: route.to_vec(),
        merkle_root: String::new(),
        signature: String::new(),
        timestamp: summary.timestamp,
        verifiable: false,
        error: Some(error.into()),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

fn leaf_hash(waypoint: u32) -> [u8; 32] {
    let digest = Sha256::digest(waypoint.to_le_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Fold waypoint leaves into a binary Merkle root, duplicating the odd last
/// node at each level. The empty route maps to a fixed sentinel root.
fn merkle_root(route: &[u32]) -> [u8; 32] {
    if route.is_empty() {
        let digest = Sha256::digest(EMPTY_ROUTE_SENTINEL);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        return out;
    }

    let mut level: Vec<[u8; 32]> = route.iter().map(|w| leaf_hash(*w)).collect();

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    level[0]
}
