//! Pure types and algorithms for the stampd anchoring
//! engine: batch aggregation, inclusion proofs, batch states and the shared
//! error code catalogue. No I/O lives here.

pub mod constants;
pub mod error;
mod hash;
pub mod merkle;
pub mod state;

pub use constants::DIGEST_BYTES;
pub use error::{AggregateError, ErrorCode};
pub use hash::{sha256, sha256_pair};
pub use merkle::{merkle_proof, merkle_root, AggregateTree, InclusionProof, ProofStep, Side};
pub use state::BatchState;
