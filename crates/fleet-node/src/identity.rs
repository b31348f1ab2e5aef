//! Node identity.
//!
//! The node ID is the libp2p [`PeerId`] of an Ed25519 keypair. A non-zero
//! seed derives the secret deterministically so test fleets get stable IDs
//! across restarts; a zero seed loads the persisted key, generating it on
//! first run.

use libp2p::PeerId;
use libp2p::identity::Keypair;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const KEY_FILE: &str = "identity.key";
const SEED_DOMAIN: &[u8] = b"fleetnet-identity";

/// Errors building the node identity. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid identity key material: {0}")]
    Decode(#[from] libp2p::identity::DecodingError),
}

/// The node's keypair together with its derived ID.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl NodeIdentity {
    /// Derive or load the identity for `seed` under `home`.
    pub fn load_or_create(seed: u64, home: &Path) -> Result<Self, IdentityError> {
        let path = home.join(KEY_FILE);
        let keypair = if seed != 0 {
            let keypair = keypair_from_seed(seed)?;
            write_key(&path, &keypair)?;
            keypair
        } else if path.exists() {
            let bytes = std::fs::read(&path).map_err(|source| IdentityError::Io {
                path: path.clone(),
                source,
            })?;
            Keypair::from_protobuf_encoding(&bytes)?
        } else {
            let keypair = Keypair::generate_ed25519();
            write_key(&path, &keypair)?;
            info!(path = %path.display(), "generated new node identity");
            keypair
        };
        Ok(Self::from_keypair(keypair))
    }

    /// Wrap an existing keypair.
    #[must_use]
    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    #[must_use]
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Directory for this identity's replicated storage.
    #[must_use]
    pub fn data_dir(&self, home: &Path) -> PathBuf {
        home.join(self.peer_id.to_string())
    }
}

/// Deterministic Ed25519 keypair for a non-zero seed.
pub fn keypair_from_seed(seed: u64) -> Result<Keypair, IdentityError> {
    let mut hasher = Sha256::new();
    hasher.update(SEED_DOMAIN);
    hasher.update(seed.to_le_bytes());
    let secret: [u8; 32] = hasher.finalize().into();
    Ok(Keypair::ed25519_from_bytes(secret)?)
}

fn write_key(path: &Path, keypair: &Keypair) -> Result<(), IdentityError> {
    let io_err = |source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let bytes = keypair.to_protobuf_encoding()?;
    std::fs::write(path, bytes).map_err(io_err)
}
