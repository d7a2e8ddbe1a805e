//! Anonymous voting: ballot credentials, election status, vote casting and
//! the offline submission queue.

pub mod caster;
pub mod credentials;
pub mod elections;
pub mod offline_queue;

pub use caster::{
    credential_hash, derive_vote_token, AnonymousVoteCaster, CastVote, CastVoteRequest, VoteStatus,
    VOTE_TOKEN_NAMESPACE,
};
pub use credentials::{BallotCredential, CredentialStatus, CredentialStore};
pub use elections::{ElectionDirectory, ElectionStatus, StaticElectionDirectory};
pub use offline_queue::{OfflineVoteQueue, QueueEntry, QueuedBallot, SyncOutcome, SyncResult};
