//! Durable store of in-flight consensus artifacts
//!
//! Rows are keyed by `height (be u64) ‖ round (be u32)` and, for votes,
//! `‖ validator_index (be u32)`, so a column family scan yields them in
//! protocol order. The protocol state record lives under a fixed key.

use crate::{ColumnFamily, DbError, DbResult, KeyValueDB, SharedDatabase, WriteBatch};
use chain_core::{codec, ConsensusStateData, Height, Proposal, Round, ValidatorIndex, Vote, VoteKind};
use tracing::debug;

const STATE_KEY: &[u8] = b"state";

/// Persistence contract used by the consensus engine for crash recovery
pub trait ConsensusStorage: Send + Sync {
    /// Overwrite the protocol state record
    fn save_state(&self, state: &ConsensusStateData) -> DbResult<()>;

    fn get_state(&self) -> DbResult<Option<ConsensusStateData>>;

    /// Idempotent upsert of proposals
    fn save_proposals(&self, proposals: &[Proposal]) -> DbResult<()>;

    /// Idempotent upsert of prevotes
    fn save_prevotes(&self, prevotes: &[Vote]) -> DbResult<()>;

    /// Idempotent upsert of precommits
    fn save_precommits(&self, precommits: &[Vote]) -> DbResult<()>;

    /// Write state and all artifacts in one atomic batch
    fn save_all(
        &self,
        state: &ConsensusStateData,
        proposals: &[Proposal],
        prevotes: &[Vote],
        precommits: &[Vote],
    ) -> DbResult<()>;

    fn get_proposals(&self) -> DbResult<Vec<Proposal>>;

    fn get_prevotes(&self) -> DbResult<Vec<Vote>>;

    fn get_precommits(&self) -> DbResult<Vec<Vote>>;

    /// Remove the artifacts of heights up to and including `height`
    /// together with the state record
    fn prune_through(&self, height: Height) -> DbResult<()>;

    /// Remove every artifact and the state record
    fn clear(&self) -> DbResult<()>;
}

fn round_key(height: Height, round: Round) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(&round.to_be_bytes());
    key
}

fn key_height(key: &[u8]) -> Option<Height> {
    let prefix: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(Height::from_be_bytes(prefix))
}

fn vote_key(height: Height, round: Round, index: ValidatorIndex) -> DbResult<Vec<u8>> {
    let index = u32::try_from(index)
        .map_err(|_| DbError::Other(format!("validator index {index} out of key range")))?;
    let mut key = round_key(height, round);
    key.extend_from_slice(&index.to_be_bytes());
    Ok(key)
}

/// [`ConsensusStorage`] over any [`KeyValueDB`] backend
#[derive(Clone)]
pub struct ConsensusStore {
    db: SharedDatabase,
}

impl ConsensusStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    fn stage_proposals(batch: &mut WriteBatch, proposals: &[Proposal]) -> DbResult<()> {
        for proposal in proposals {
            batch.put(
                ColumnFamily::Proposals,
                &round_key(proposal.height, proposal.round),
                &codec::encode(proposal)?,
            );
        }
        Ok(())
    }

    fn stage_votes(
        batch: &mut WriteBatch,
        cf: ColumnFamily,
        kind: VoteKind,
        votes: &[Vote],
    ) -> DbResult<()> {
        for vote in votes {
            if vote.kind != kind {
                return Err(DbError::Other(format!(
                    "{} stored in {} column family",
                    vote.kind, cf
                )));
            }
            batch.put(
                cf,
                &vote_key(vote.height, vote.round, vote.validator_index)?,
                &codec::encode(vote)?,
            );
        }
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> DbResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.db.write(batch)
    }

    fn load_votes(&self, cf: ColumnFamily, kind: VoteKind) -> DbResult<Vec<Vote>> {
        let mut votes = Vec::new();
        for (key, value) in self.db.iter(cf)? {
            let vote: Vote = codec::decode(&value).map_err(|e| corruption(cf, e))?;
            if vote.kind != kind || vote_key(vote.height, vote.round, vote.validator_index)? != key
            {
                return Err(corruption(cf, "row key does not match its vote"));
            }
            votes.push(vote);
        }
        Ok(votes)
    }
}

fn corruption(cf: ColumnFamily, reason: impl ToString) -> DbError {
    DbError::Corruption {
        cf: cf.name().to_string(),
        reason: reason.to_string(),
    }
}

impl ConsensusStorage for ConsensusStore {
    fn save_state(&self, state: &ConsensusStateData) -> DbResult<()> {
        self.db
            .put(ColumnFamily::Consensus, STATE_KEY, &codec::encode(state)?)
    }

    fn get_state(&self) -> DbResult<Option<ConsensusStateData>> {
        match self.db.get(ColumnFamily::Consensus, STATE_KEY)? {
            Some(bytes) => Ok(Some(
                codec::decode(&bytes).map_err(|e| corruption(ColumnFamily::Consensus, e))?,
            )),
            None => Ok(None),
        }
    }

    fn save_proposals(&self, proposals: &[Proposal]) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        Self::stage_proposals(&mut batch, proposals)?;
        self.write_batch(batch)
    }

    fn save_prevotes(&self, prevotes: &[Vote]) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        Self::stage_votes(&mut batch, ColumnFamily::Prevotes, VoteKind::Prevote, prevotes)?;
        self.write_batch(batch)
    }

    fn save_precommits(&self, precommits: &[Vote]) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        Self::stage_votes(
            &mut batch,
            ColumnFamily::Precommits,
            VoteKind::Precommit,
            precommits,
        )?;
        self.write_batch(batch)
    }

    fn save_all(
        &self,
        state: &ConsensusStateData,
        proposals: &[Proposal],
        prevotes: &[Vote],
        precommits: &[Vote],
    ) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        Self::stage_proposals(&mut batch, proposals)?;
        Self::stage_votes(&mut batch, ColumnFamily::Prevotes, VoteKind::Prevote, prevotes)?;
        Self::stage_votes(
            &mut batch,
            ColumnFamily::Precommits,
            VoteKind::Precommit,
            precommits,
        )?;
        batch.put(ColumnFamily::Consensus, STATE_KEY, &codec::encode(state)?);
        debug!(
            "Persisting consensus state at {}/{} ({} proposals, {} prevotes, {} precommits)",
            state.height,
            state.round,
            proposals.len(),
            prevotes.len(),
            precommits.len()
        );
        self.db.write(batch)
    }

    fn get_proposals(&self) -> DbResult<Vec<Proposal>> {
        let cf = ColumnFamily::Proposals;
        let mut proposals = Vec::new();
        for (key, value) in self.db.iter(cf)? {
            let proposal: Proposal = codec::decode(&value).map_err(|e| corruption(cf, e))?;
            if round_key(proposal.height, proposal.round) != key {
                return Err(corruption(cf, "row key does not match its proposal"));
            }
            proposals.push(proposal);
        }
        Ok(proposals)
    }

    fn get_prevotes(&self) -> DbResult<Vec<Vote>> {
        self.load_votes(ColumnFamily::Prevotes, VoteKind::Prevote)
    }

    fn get_precommits(&self) -> DbResult<Vec<Vote>> {
        self.load_votes(ColumnFamily::Precommits, VoteKind::Precommit)
    }

    fn prune_through(&self, height: Height) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        for cf in [
            ColumnFamily::Proposals,
            ColumnFamily::Prevotes,
            ColumnFamily::Precommits,
        ] {
            for (key, _) in self.db.iter(cf)? {
                if key_height(&key).map_or(true, |h| h <= height) {
                    batch.delete(cf, &key);
                }
            }
        }
        batch.delete(ColumnFamily::Consensus, STATE_KEY);
        debug!(
            "Pruning {} consensus rows through height {}",
            batch.len(),
            height
        );
        self.db.write(batch)
    }

    fn clear(&self) -> DbResult<()> {
        self.db.clear(ColumnFamily::consensus())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DatabaseConfig, MemoryDatabase};
    use chain_core::{BlsKeyPair, Hash, LockState, Step};
    use std::sync::Arc;

    fn prevote(height: Height, round: Round, index: usize) -> Vote {
        let key = BlsKeyPair::from_seed(format!("v{index}").as_bytes()).unwrap();
        Vote::signed(
            VoteKind::Prevote,
            height,
            round,
            Some(Hash::digest(b"block")),
            index,
            &key,
        )
        .unwrap()
    }

    fn state(height: Height, round: Round) -> ConsensusStateData {
        let mut lock = LockState::default();
        lock.lock(round, Hash::digest(b"block"));
        ConsensusStateData {
            height,
            round,
            step: Step::Precommit,
            lock,
        }
    }

    #[test]
    fn test_save_prevotes_is_idempotent() {
        let db = Arc::new(MemoryDatabase::new());
        let store = ConsensusStore::new(db.clone());
        let votes = vec![prevote(1, 0, 0), prevote(1, 0, 1)];

        store.save_prevotes(&votes).unwrap();
        store.save_prevotes(&votes).unwrap();
        store.save_prevotes(&votes[..1]).unwrap();

        assert_eq!(db.len(ColumnFamily::Prevotes), 2);
        assert_eq!(store.get_prevotes().unwrap(), votes);
    }

    #[test]
    fn test_votes_come_back_in_key_order() {
        let store = ConsensusStore::new(Arc::new(MemoryDatabase::new()));
        store
            .save_prevotes(&[prevote(2, 0, 1), prevote(1, 3, 2), prevote(1, 3, 0)])
            .unwrap();

        let loaded: Vec<_> = store
            .get_prevotes()
            .unwrap()
            .iter()
            .map(|v| (v.height, v.round, v.validator_index))
            .collect();
        assert_eq!(loaded, vec![(1, 3, 0), (1, 3, 2), (2, 0, 1)]);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let store = ConsensusStore::new(Arc::new(MemoryDatabase::new()));
        assert!(store.save_precommits(&[prevote(1, 0, 0)]).is_err());
    }

    #[test]
    fn test_state_overwrite_and_clear() {
        let store = ConsensusStore::new(Arc::new(MemoryDatabase::new()));
        assert!(store.get_state().unwrap().is_none());

        store.save_state(&state(10, 1)).unwrap();
        store.save_state(&state(10, 2)).unwrap();
        assert_eq!(store.get_state().unwrap(), Some(state(10, 2)));

        store.save_prevotes(&[prevote(10, 2, 0)]).unwrap();
        store.clear().unwrap();
        assert!(store.get_state().unwrap().is_none());
        assert!(store.get_prevotes().unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_later_heights() {
        let db = Arc::new(MemoryDatabase::new());
        let store = ConsensusStore::new(db.clone());
        store
            .save_all(
                &state(1, 3),
                &[],
                &[prevote(1, 0, 0), prevote(1, 3, 1), prevote(2, 0, 2)],
                &[],
            )
            .unwrap();

        store.prune_through(1).unwrap();
        assert!(store.get_state().unwrap().is_none());
        assert_eq!(store.get_prevotes().unwrap(), vec![prevote(2, 0, 2)]);
        assert_eq!(db.len(ColumnFamily::Prevotes), 1);

        store.prune_through(2).unwrap();
        assert!(store.get_prevotes().unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_row_reported() {
        let db = Arc::new(MemoryDatabase::new());
        db.put(ColumnFamily::Consensus, STATE_KEY, &[0xde, 0xad]).unwrap();
        db.put(ColumnFamily::Prevotes, &vote_key(1, 0, 0).unwrap(), b"junk")
            .unwrap();
        let store = ConsensusStore::new(db);

        assert!(matches!(store.get_state(), Err(DbError::Corruption { .. })));
        assert!(matches!(store.get_prevotes(), Err(DbError::Corruption { .. })));
    }

    #[test]
    fn test_rocksdb_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DatabaseConfig::new(dir.path());
        {
            let store = ConsensusStore::new(Arc::new(Database::open(&config).unwrap()));
            store
                .save_all(&state(10, 2), &[], &[prevote(10, 2, 3)], &[])
                .unwrap();
        }

        let store = ConsensusStore::new(Arc::new(Database::open(&config).unwrap()));
        assert_eq!(store.get_state().unwrap(), Some(state(10, 2)));
        assert_eq!(store.get_prevotes().unwrap(), vec![prevote(10, 2, 3)]);
    }
}
