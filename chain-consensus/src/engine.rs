//! Round-based BFT consensus engine
//!
//! Each height runs rounds of propose, prevote and precommit. A prevote
//! quorum for the round's proposal locks it and triggers a precommit; a
//! precommit quorum produces a [`Commit`] that is verified and handed to the
//! canonical chain. Timeouts and rejected commits move on to the next round.
//!
//! Incoming messages are buffered into their [`RoundState`](crate::RoundState)
//! without waiting for the engine. Protocol transitions run one at a time
//! under the handler lock.

use crate::aggregator::VoteAggregator;
use crate::commit_state::{CommitState, ProcessableUnit};
use crate::config::ConsensusConfig;
use crate::error::VoteError;
use crate::evidence::{EquivocationEvidence, Misbehaviour, MisbehaviourTracker};
use crate::proposer::ProposerSelector;
use crate::repository::{RoundStateRepository, SharedRoundState};
use crate::round_state::RoundStep;
use crate::scheduler::{now_millis, Scheduler, TimeoutEvent, TimeoutKind};
use crate::traits::{BlockBuilder, Broadcaster};
use crate::validator_set::{StaticValidatorSet, ValidatorSet, ValidatorSetProvider};
use crate::verifier::BlockVerificationPipeline;
use crate::worker::CryptoWorkerPool;
use crate::{ConsensusError, ConsensusResult};
use chain_core::{
    AggregatedSignature, Block, BlockId, Bls12381, BlsPublicKey, Commit, ConsensusSignature,
    ConsensusStateData, Height, LockState, Proposal, Round, Signer, Step, Timestamp,
    ValidatorIndex, Vote, VoteKind,
};
use chain_db::ConsensusStorage;
use chain_state::ChainStore;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Consensus events
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// Protocol state restored or initialised
    Bootstrapped { height: Height, round: Round },
    /// New round started
    RoundStarted {
        height: Height,
        round: Round,
        proposer: ValidatorIndex,
    },
    /// Proposal of the current round taken into account
    ProposalAccepted {
        height: Height,
        round: Round,
        block_id: BlockId,
    },
    /// Block decided and handed to the chain
    Committed { commit: Commit },
    /// Precommit quorum reached but the block failed verification
    CommitRejected {
        height: Height,
        round: Round,
        reason: String,
    },
    /// Misbehaviour detected
    MisbehaviourDetected { misbehaviour: Misbehaviour },
}

/// Outcome of feeding a message to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorResult {
    /// Stored and processed
    Accepted,
    /// Stale, out of range or already known; nothing changed
    Skipped,
}

/// Height-wide protocol variables, guarded by the handler lock
#[derive(Debug)]
struct EngineState {
    height: Height,
    round: Round,
    step: Step,
    lock: LockState,
    did_majority_prevote: bool,
    did_majority_precommit: bool,
    round_start: Timestamp,
    validators: Arc<ValidatorSet>,
}

impl EngineState {
    fn is_current(&self, height: Height, round: Round) -> bool {
        self.height == height && self.round == round
    }

    fn data(&self) -> ConsensusStateData {
        ConsensusStateData {
            height: self.height,
            round: self.round,
            step: self.step,
            lock: self.lock.clone(),
        }
    }
}

type WorkQueue = VecDeque<(Height, Round)>;

/// BFT consensus engine
pub struct ConsensusEngine {
    config: ConsensusConfig,
    validators: Arc<dyn ValidatorSetProvider>,
    selector: Arc<dyn ProposerSelector>,
    chain: Arc<dyn ChainStore>,
    storage: Arc<dyn ConsensusStorage>,
    block_builder: Arc<dyn BlockBuilder>,
    broadcaster: Arc<dyn Broadcaster>,
    local_keys: Vec<(BlsPublicKey, Arc<dyn Signer>)>,
    repository: RoundStateRepository,
    scheduler: Scheduler,
    workers: CryptoWorkerPool,
    pipeline: Arc<BlockVerificationPipeline>,
    state: tokio::sync::Mutex<EngineState>,
    /// (height, round) mirrored outside the handler lock for message intake
    position: parking_lot::Mutex<(Height, Round)>,
    pending: parking_lot::Mutex<HashSet<(Height, Round)>>,
    tracker: parking_lot::Mutex<MisbehaviourTracker>,
    running: AtomicBool,
    disposed: AtomicBool,
    event_sender: Option<mpsc::UnboundedSender<ConsensusEvent>>,
}

impl ConsensusEngine {
    /// Create an engine for the validators in `config`. `local_keys` are the
    /// consensus keys this node signs with; keys outside the active set are
    /// ignored. The returned receiver must be driven with
    /// [`ConsensusEngine::run_timeouts`].
    pub fn new(
        config: ConsensusConfig,
        chain: Arc<dyn ChainStore>,
        storage: Arc<dyn ConsensusStorage>,
        block_builder: Arc<dyn BlockBuilder>,
        broadcaster: Arc<dyn Broadcaster>,
        local_keys: Vec<Arc<dyn Signer>>,
    ) -> ConsensusResult<(Self, mpsc::UnboundedReceiver<TimeoutEvent>)> {
        config.validate()?;

        let validator_set = config.to_validator_set()?;
        let local_keys: Vec<_> = local_keys
            .into_iter()
            .map(|signer| (signer.public_key(), signer))
            .collect();
        let local_indices: Vec<_> = local_keys
            .iter()
            .filter_map(|(key, _)| validator_set.index_of_consensus_key(key))
            .collect();
        if local_indices.is_empty() {
            info!("Local node is not a validator");
        } else {
            info!("Local node is validator {:?}", local_indices);
        }

        let validators: Arc<dyn ValidatorSetProvider> =
            Arc::new(StaticValidatorSet::new(validator_set));
        let selector = config.proposer_policy.selector();
        let signature: Arc<dyn ConsensusSignature> = Arc::new(Bls12381);
        let pipeline = Arc::new(BlockVerificationPipeline::standard(
            chain.clone(),
            selector.clone(),
            config.timeouts,
            VoteAggregator::new(signature.clone()),
        ));
        let workers =
            CryptoWorkerPool::new(config.crypto_workers, config.worker_queue_depth, signature)?;
        let (scheduler, timeouts) = Scheduler::new(config.timeouts);
        let repository = RoundStateRepository::new(validators.clone(), selector.clone());

        let height = chain.last_block().height() + 1;
        let state = EngineState {
            height,
            round: 0,
            step: Step::Propose,
            lock: LockState::default(),
            did_majority_prevote: false,
            did_majority_precommit: false,
            round_start: 0,
            validators: validators.active_validators(height)?,
        };
        let tracker = MisbehaviourTracker::new(config.missed_proposal_threshold);

        let engine = Self {
            config,
            validators,
            selector,
            chain,
            storage,
            block_builder,
            broadcaster,
            local_keys,
            repository,
            scheduler,
            workers,
            pipeline,
            state: tokio::sync::Mutex::new(state),
            position: parking_lot::Mutex::new((height, 0)),
            pending: parking_lot::Mutex::new(HashSet::new()),
            tracker: parking_lot::Mutex::new(tracker),
            running: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            event_sender: None,
        };
        Ok((engine, timeouts))
    }

    /// Set event sender for notifications
    pub fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<ConsensusEvent>) {
        self.event_sender = Some(sender);
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn repository(&self) -> &RoundStateRepository {
        &self.repository
    }

    /// Send event notification
    fn send_event(&self, event: ConsensusEvent) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event) {
                warn!("Failed to send consensus event: {}", e);
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Restore protocol state from storage. Stored artifacts are only used
    /// when they belong to the height right above the chain tip; anything
    /// else is discarded. Must run before [`ConsensusEngine::start`].
    pub async fn bootstrap(&self) -> ConsensusResult<()> {
        let mut st = self.state.lock().await;
        let expected = self.chain.last_block().height() + 1;

        match self.storage.get_state()? {
            Some(data) if data.height == expected => {
                let keep = |height: Height| height >= expected;
                let proposals = self
                    .storage
                    .get_proposals()?
                    .into_iter()
                    .filter(|p| keep(p.height))
                    .collect();
                let prevotes = self
                    .storage
                    .get_prevotes()?
                    .into_iter()
                    .filter(|v| keep(v.height))
                    .collect();
                let precommits = self
                    .storage
                    .get_precommits()?
                    .into_iter()
                    .filter(|v| keep(v.height))
                    .collect();
                self.repository
                    .restore(proposals, prevotes, precommits, Some(&data))?;

                st.height = data.height;
                st.round = data.round;
                st.step = data.step;
                st.lock = data.lock;
            }
            stored => {
                if let Some(data) = stored {
                    warn!(
                        "Skipping state restore, stored height is {} but should be {}",
                        data.height, expected
                    );
                }
                self.storage.clear()?;
                self.repository.clear();

                st.height = expected;
                st.round = 0;
                st.step = Step::Propose;
                st.lock = LockState::default();
            }
        }

        st.validators = self.validators.active_validators(st.height)?;
        *self.position.lock() = (st.height, st.round);
        info!("Completed consensus bootstrap for {}/{}", st.height, st.round);
        self.send_event(ConsensusEvent::Bootstrapped {
            height: st.height,
            round: st.round,
        });
        Ok(())
    }

    /// Enter the bootstrapped round and replay the earlier rounds of the
    /// height, in case they already hold a decision
    pub async fn start(&self) -> ConsensusResult<()> {
        let mut st = self.state.lock().await;
        let mut queue = WorkQueue::new();

        let (round, step) = (st.round, st.step);
        self.start_round(&mut st, round, &mut queue)?;
        // Votes cast before a restart are not cast again
        st.step = step;
        self.save_state(&st)?;
        for earlier in 0..round {
            queue.push_back((st.height, earlier));
        }
        self.running.store(true, Ordering::SeqCst);
        self.drain(&mut st, &mut queue).await
    }

    /// Stop timers, finish the in-flight transition and flush live rounds
    pub async fn dispose(&self) -> ConsensusResult<()> {
        self.scheduler.clear();
        self.disposed.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.persist().await?;
        info!("Consensus engine disposed");
        Ok(())
    }

    /// Write every live round state of the current height and the protocol
    /// state in one batch
    pub async fn persist(&self) -> ConsensusResult<()> {
        let st = self.state.lock().await;
        let mut proposals = Vec::new();
        let mut prevotes = Vec::new();
        let mut precommits = Vec::new();
        for round_state in self.repository.round_states() {
            let round_state = round_state.lock();
            if round_state.height() < st.height {
                continue;
            }
            proposals.extend(round_state.proposal().cloned());
            prevotes.extend(round_state.prevotes().votes().cloned());
            precommits.extend(round_state.precommits().votes().cloned());
        }

        self.storage
            .save_all(&st.data(), &proposals, &prevotes, &precommits)?;
        debug!(
            "Persisted {} proposals, {} prevotes and {} precommits",
            proposals.len(),
            prevotes.len(),
            precommits.len()
        );
        Ok(())
    }

    /// Current protocol state
    pub async fn state(&self) -> ConsensusStateData {
        self.state.lock().await.data()
    }

    /// Proposal held for (height, round)
    pub fn get_proposal(&self, height: Height, round: Round) -> Option<Proposal> {
        self.repository
            .existing(height, round)
            .and_then(|round_state| round_state.lock().proposal().cloned())
    }

    /// Equivocations recorded so far
    pub fn evidence(&self) -> Vec<EquivocationEvidence> {
        self.tracker.lock().evidence().to_vec()
    }

    pub fn missed_proposals(&self, validator_index: ValidatorIndex) -> u64 {
        self.tracker.lock().missed_proposals(validator_index)
    }

    /// Active set for a message at (height, round), or `Stale` when the
    /// message is outside the window the engine buffers
    fn admit(&self, height: Height, round: Round) -> ConsensusResult<Arc<ValidatorSet>> {
        let stale = ConsensusError::Stale { height, round };
        if !self.running.load(Ordering::SeqCst) {
            return Err(stale);
        }

        let (current_height, current_round) = *self.position.lock();
        let lookahead = self.config.max_round_lookahead;
        let in_window = if height == current_height {
            round <= current_round.saturating_add(lookahead)
        } else {
            height == current_height + 1 && round <= lookahead
        };
        if !in_window {
            return Err(stale);
        }
        self.validators.active_validators(height)
    }

    /// Verify and buffer a proposal, then run the protocol for its round
    pub async fn on_proposal(&self, proposal: Proposal) -> ConsensusResult<ProcessorResult> {
        let (height, round) = (proposal.height, proposal.round);
        let validators = match self.admit(height, round) {
            Ok(validators) => validators,
            Err(ConsensusError::Stale { .. }) => {
                debug!("Skipping proposal {}/{}", height, round);
                return Ok(ProcessorResult::Skipped);
            }
            Err(e) => return Err(e),
        };

        let expected = self.selector.validator_index(height, round, validators.len());
        if proposal.validator_index != expected {
            return Err(ConsensusError::Malformed(format!(
                "proposal {}/{} signed by validator {}, proposer is {}",
                height, round, proposal.validator_index, expected
            )));
        }
        let proposer = validators.get(expected).ok_or_else(|| {
            ConsensusError::Malformed(format!("proposer {} is not in the active set", expected))
        })?;

        let valid = self
            .workers
            .verify(
                proposal.signing_message()?,
                proposal.signature.clone(),
                proposer.consensus_public_key.clone(),
            )
            .await?;
        if !valid {
            return Err(ConsensusError::SignatureInvalid(format!(
                "proposal {}/{} from validator {}",
                height, round, expected
            )));
        }

        // A re-proposal keeps the generator of the round it was first proposed in
        if proposal.valid_round.is_none()
            && proposal.block.header.generator_public_key != proposer.wallet_public_key
        {
            return Err(ConsensusError::Malformed(format!(
                "proposal {}/{} block generator is not the proposer",
                height, round
            )));
        }

        let round_state = self.repository.get_round_state(height, round)?;
        let added = round_state.lock().set_proposal(proposal.clone());
        match added {
            Ok(true) => {}
            Ok(false) => return Ok(ProcessorResult::Skipped),
            Err(e) => {
                if matches!(e, ConsensusError::Equivocation { .. }) {
                    warn!("Validator {} proposed twice at {}/{}", expected, height, round);
                }
                return Err(e);
            }
        }
        self.storage
            .save_proposals(std::slice::from_ref(&proposal))?;

        self.handle(height, round).await?;
        Ok(ProcessorResult::Accepted)
    }

    pub async fn on_prevote(&self, vote: Vote) -> ConsensusResult<ProcessorResult> {
        self.on_vote(VoteKind::Prevote, vote).await
    }

    pub async fn on_precommit(&self, vote: Vote) -> ConsensusResult<ProcessorResult> {
        self.on_vote(VoteKind::Precommit, vote).await
    }

    async fn on_vote(&self, kind: VoteKind, vote: Vote) -> ConsensusResult<ProcessorResult> {
        if vote.kind != kind {
            return Err(ConsensusError::Malformed(format!(
                "{} delivered as {}",
                vote.kind, kind
            )));
        }

        let (height, round) = (vote.height, vote.round);
        let validators = match self.admit(height, round) {
            Ok(validators) => validators,
            Err(ConsensusError::Stale { .. }) => {
                debug!("Skipping {} {}/{}", kind, height, round);
                return Ok(ProcessorResult::Skipped);
            }
            Err(e) => return Err(e),
        };
        let voter = validators.get(vote.validator_index).ok_or_else(|| {
            ConsensusError::Malformed(format!(
                "{} from unknown validator {}",
                kind, vote.validator_index
            ))
        })?;

        let round_state = self.repository.get_round_state(height, round)?;
        let known = round_state.lock().votes(kind).get(vote.validator_index) == Some(&vote);
        if known {
            return Ok(ProcessorResult::Skipped);
        }

        let valid = self
            .workers
            .verify(
                vote.signing_message()?,
                vote.signature.clone(),
                voter.consensus_public_key.clone(),
            )
            .await?;
        if !valid {
            return Err(ConsensusError::SignatureInvalid(format!(
                "{} {}/{} from validator {}",
                kind, height, round, vote.validator_index
            )));
        }

        let added = round_state.lock().add_vote(vote.clone());
        match added {
            Ok(true) => {}
            Ok(false) => return Ok(ProcessorResult::Skipped),
            Err(VoteError::Equivocation(evidence)) => {
                warn!(
                    "Validator {} sent conflicting {}s at {}/{}",
                    evidence.validator_index, kind, height, round
                );
                let validator_index = evidence.validator_index;
                let detected = self.tracker.lock().record_equivocation(*evidence);
                if let Some(misbehaviour) = detected {
                    self.send_event(ConsensusEvent::MisbehaviourDetected { misbehaviour });
                }
                return Err(ConsensusError::Equivocation {
                    validator_index,
                    height,
                    round,
                });
            }
            Err(e) => return Err(e.into()),
        }
        self.save_votes(kind, std::slice::from_ref(&vote))?;

        self.handle(height, round).await?;
        Ok(ProcessorResult::Accepted)
    }

    /// Run the protocol for (height, round) under the handler lock. A caller
    /// that finds the round already queued returns immediately; the queued
    /// run sees its message.
    async fn handle(&self, height: Height, round: Round) -> ConsensusResult<()> {
        if !self.pending.lock().insert((height, round)) {
            return Ok(());
        }
        let mut st = self.state.lock().await;
        self.pending.lock().remove(&(height, round));

        let mut queue = WorkQueue::from([(height, round)]);
        self.drain(&mut st, &mut queue).await
    }

    async fn drain(&self, st: &mut EngineState, queue: &mut WorkQueue) -> ConsensusResult<()> {
        while let Some((height, round)) = queue.pop_front() {
            if self.is_disposed() {
                break;
            }
            if height < st.height {
                continue;
            }
            if let Some(round_state) = self.repository.existing(height, round) {
                self.process_round(st, &round_state, queue).await?;
            }
        }
        Ok(())
    }

    async fn process_round(
        &self,
        st: &mut EngineState,
        round_state: &SharedRoundState,
        queue: &mut WorkQueue,
    ) -> ConsensusResult<()> {
        self.process_proposal(st, round_state).await;

        self.on_proposal_received(st, round_state, queue).await?;
        self.on_proposal_locked(st, round_state, queue).await?;
        self.on_majority_prevote(st, round_state, queue).await?;
        self.on_majority_prevote_any(st, round_state);
        self.on_majority_prevote_null(st, round_state, queue).await?;
        self.on_majority_precommit_any(st, round_state);
        self.on_majority_precommit(st, round_state, queue).await?;
        self.on_minority_with_higher_round(st, round_state, queue)
    }

    /// Evaluate the round's proposal once, recording the outcome as the
    /// round's processor result
    async fn process_proposal(&self, st: &EngineState, round_state: &SharedRoundState) {
        let candidate = {
            let round_state = round_state.lock();
            if round_state.processor_result().is_some() || round_state.height() != st.height {
                return;
            }
            match round_state.proposal() {
                Some(proposal) => proposal.clone(),
                None => return,
            }
        };

        let (height, round) = (candidate.height, candidate.round);
        let accepted = match self.evaluate_proposal(st, candidate).await {
            Ok(()) => true,
            Err(e) => {
                info!("Proposal {}/{} is invalid: {}", height, round, e);
                false
            }
        };
        round_state.lock().set_processor_result(accepted);
    }

    async fn evaluate_proposal(&self, st: &EngineState, proposal: Proposal) -> ConsensusResult<()> {
        let block_id = proposal.block_id()?;
        if !proposal.block.validate()? {
            return Err(ConsensusError::Malformed(format!(
                "block {} fails structural validation",
                block_id.short()
            )));
        }

        let parent = self.chain.last_block();
        if proposal.block.height() != st.height || proposal.block.header.parent_hash != parent.id()? {
            return Err(ConsensusError::Malformed(format!(
                "block {} does not extend the chain tip",
                block_id.short()
            )));
        }

        // A fresh block carries its proposal round; a re-proposed one keeps
        // the round it was first proposed in
        let block_round = proposal.block.header.round;
        let max_block_round = proposal.valid_round.unwrap_or(proposal.round);
        if block_round > max_block_round
            || (proposal.valid_round.is_none() && block_round != proposal.round)
        {
            return Err(ConsensusError::Malformed(format!(
                "block round {} does not match proposal round {}",
                block_round, proposal.round
            )));
        }

        if let Some(valid_round) = proposal.valid_round {
            if valid_round >= proposal.round {
                return Err(ConsensusError::Malformed(format!(
                    "valid round {} is not below round {}",
                    valid_round, proposal.round
                )));
            }
            if let Some(lock_proof) = &proposal.lock_proof {
                let message = Vote::signing_message_for(
                    VoteKind::Prevote,
                    proposal.height,
                    valid_round,
                    Some(block_id),
                )?;
                self.verify_certificate(lock_proof, message, &st.validators)
                    .await?;
            }
        }

        let mut unit = CommitState::for_proposal(
            proposal.block,
            parent,
            st.validators.clone(),
            self.chain.wallet_snapshot(),
        );
        let pipeline = self.pipeline.clone();
        tokio::task::spawn_blocking(move || pipeline.verify_block(&mut unit))
            .await
            .map_err(|e| ConsensusError::Other(format!("verification task failed: {e}")))?
    }

    async fn verify_certificate(
        &self,
        certificate: &AggregatedSignature,
        message: Vec<u8>,
        validators: &ValidatorSet,
    ) -> ConsensusResult<()> {
        let keys = VoteAggregator::participants(certificate, validators)?;
        let valid = self
            .workers
            .verify_aggregate(message, certificate.signature.clone(), keys)
            .await?;
        if valid {
            Ok(())
        } else {
            Err(ConsensusError::SignatureInvalid(format!(
                "certificate signed by {} does not verify",
                certificate.bitmask
            )))
        }
    }

    async fn on_proposal_received(
        &self,
        st: &mut EngineState,
        round_state: &SharedRoundState,
        queue: &mut WorkQueue,
    ) -> ConsensusResult<()> {
        let (height, round, proposer, view) = {
            let rs = round_state.lock();
            let view = rs
                .proposal()
                .filter(|p| p.valid_round.is_none())
                .and_then(|_| rs.block_id())
                .map(|id| (id, rs.processor_result() == Some(true)));
            (rs.height(), rs.round(), rs.proposer(), view)
        };
        let Some((block_id, valid)) = view else {
            return Ok(());
        };
        if st.step != Step::Propose || !st.is_current(height, round) {
            return Ok(());
        }

        st.step = Step::Prevote;
        info!(
            "Received proposal {}/{} blockId: {}",
            height,
            round,
            block_id.short()
        );
        self.tracker.lock().reset_missed_proposals(proposer);
        self.send_event(ConsensusEvent::ProposalAccepted {
            height,
            round,
            block_id,
        });

        let value = (valid && st.lock.allows_prevote(&block_id, None)).then_some(block_id);
        self.cast_votes(st, VoteKind::Prevote, value, queue).await
    }

    async fn on_proposal_locked(
        &self,
        st: &mut EngineState,
        round_state: &SharedRoundState,
        queue: &mut WorkQueue,
    ) -> ConsensusResult<()> {
        let (height, round, proposer, view) = {
            let rs = round_state.lock();
            let view = rs
                .proposal()
                .filter(|p| p.lock_proof.is_some())
                .and_then(|p| p.valid_round)
                .filter(|valid_round| *valid_round < rs.round())
                .zip(rs.block_id())
                .map(|(valid_round, id)| (valid_round, id, rs.processor_result() == Some(true)));
            (rs.height(), rs.round(), rs.proposer(), view)
        };
        let Some((valid_round, block_id, valid)) = view else {
            return Ok(());
        };
        if st.step != Step::Propose || !st.is_current(height, round) {
            return Ok(());
        }

        st.step = Step::Prevote;
        info!(
            "Received proposal {}/{} with locked blockId: {} from round {}",
            height,
            round,
            block_id.short(),
            valid_round
        );
        self.tracker.lock().reset_missed_proposals(proposer);
        self.send_event(ConsensusEvent::ProposalAccepted {
            height,
            round,
            block_id,
        });

        let value =
            (valid && st.lock.allows_prevote(&block_id, Some(valid_round))).then_some(block_id);
        self.cast_votes(st, VoteKind::Prevote, value, queue).await
    }

    /// Polka for the round's proposal: lock and precommit it, or only
    /// remember it as the valid value when already past prevoting
    async fn on_majority_prevote(
        &self,
        st: &mut EngineState,
        round_state: &SharedRoundState,
        queue: &mut WorkQueue,
    ) -> ConsensusResult<()> {
        let (height, round, polka) = {
            let rs = round_state.lock();
            let polka = rs
                .block_id()
                .filter(|_| rs.has_prevote_quorum_for_proposal())
                .filter(|_| rs.processor_result() == Some(true));
            (rs.height(), rs.round(), polka)
        };
        let Some(block_id) = polka else {
            return Ok(());
        };
        if st.did_majority_prevote || st.step == Step::Propose || !st.is_current(height, round) {
            return Ok(());
        }

        info!(
            "Received +2/3 prevotes for {}/{} blockId: {}",
            height,
            round,
            block_id.short()
        );
        st.did_majority_prevote = true;

        if st.step == Step::Prevote {
            if !st.lock.allows_precommit(&block_id, round) {
                warn!(
                    "Not precommitting {} at {}/{}: locked on {:?} since round {:?}",
                    block_id.short(),
                    height,
                    round,
                    st.lock.locked_value.map(|id| id.short()),
                    st.lock.locked_round
                );
                return Ok(());
            }
            st.lock.lock(round, block_id);
            round_state.lock().set_lock_state(st.lock.clone());
            st.step = Step::Precommit;
            self.cast_votes(st, VoteKind::Precommit, Some(block_id), queue)
                .await
        } else {
            st.lock.observe_polka(round, block_id);
            round_state.lock().set_lock_state(st.lock.clone());
            self.save_state(st)
        }
    }

    fn on_majority_prevote_any(&self, st: &EngineState, round_state: &SharedRoundState) {
        let (height, round, quorum) = {
            let rs = round_state.lock();
            (rs.height(), rs.round(), rs.prevotes().has_quorum_any())
        };
        if !quorum || st.step != Step::Prevote || !st.is_current(height, round) {
            return;
        }
        if self.scheduler.schedule_prevote(height, round) {
            debug!("Received +2/3 prevotes for {}/{} for any value", height, round);
        }
    }

    async fn on_majority_prevote_null(
        &self,
        st: &mut EngineState,
        round_state: &SharedRoundState,
        queue: &mut WorkQueue,
    ) -> ConsensusResult<()> {
        let (height, round, quorum) = {
            let rs = round_state.lock();
            (rs.height(), rs.round(), rs.prevotes().has_quorum_for(None))
        };
        if !quorum || st.step != Step::Prevote || !st.is_current(height, round) {
            return Ok(());
        }

        info!("Received +2/3 prevotes for {}/{} blockId: null", height, round);
        st.step = Step::Precommit;
        self.cast_votes(st, VoteKind::Precommit, None, queue).await
    }

    fn on_majority_precommit_any(&self, st: &EngineState, round_state: &SharedRoundState) {
        let (height, round, quorum) = {
            let rs = round_state.lock();
            (rs.height(), rs.round(), rs.precommits().has_quorum_any())
        };
        if !quorum || !st.is_current(height, round) {
            return;
        }
        if self.scheduler.schedule_precommit(height, round) {
            debug!("Received +2/3 precommits for {}/{} for any value", height, round);
        }
    }

    /// Precommit quorum for a proposal at any round of the current height
    async fn on_majority_precommit(
        &self,
        st: &mut EngineState,
        round_state: &SharedRoundState,
        queue: &mut WorkQueue,
    ) -> ConsensusResult<()> {
        let (height, round, decided) = {
            let rs = round_state.lock();
            let decided = rs
                .block_id()
                .filter(|_| rs.has_precommit_quorum_for_proposal())
                .map(|id| (id, rs.processor_result() == Some(true)));
            (rs.height(), rs.round(), decided)
        };
        let Some((block_id, valid)) = decided else {
            return Ok(());
        };
        if st.did_majority_precommit || height != st.height {
            return Ok(());
        }
        if !valid {
            debug!(
                "Block {} on {}/{} received +2/3 precommits but is invalid",
                block_id.short(),
                height,
                round
            );
            return Ok(());
        }

        st.did_majority_precommit = true;

        info!(
            "Received +2/3 precommits for {}/{} blockId: {}",
            height,
            round,
            block_id.short()
        );
        self.commit(st, round_state, block_id, queue).await
    }

    async fn commit(
        &self,
        st: &mut EngineState,
        round_state: &SharedRoundState,
        block_id: BlockId,
        queue: &mut WorkQueue,
    ) -> ConsensusResult<()> {
        let (height, round, block, signers) = {
            let rs = round_state.lock();
            let block = rs
                .block()
                .cloned()
                .ok_or_else(|| ConsensusError::Other("decided round has no block".into()))?;
            let signers = rs.precommits().signers_of(Some(block_id)).ok_or_else(|| {
                ConsensusError::Other("decided round has no matching precommits".into())
            })?;
            (rs.height(), rs.round(), block, signers)
        };

        let (bitmask, signatures) = signers;
        let commit = Commit {
            height,
            round,
            block_id,
            certificate: AggregatedSignature {
                bitmask,
                signature: self.workers.aggregate(signatures).await?,
            },
        };

        let mut unit = CommitState::new(
            commit,
            block,
            self.chain.last_block(),
            st.validators.clone(),
            self.chain.wallet_snapshot(),
        );
        let pipeline = self.pipeline.clone();
        let (unit, verdict) = tokio::task::spawn_blocking(move || {
            let verdict = pipeline.verify(&mut unit);
            (unit, verdict)
        })
        .await
        .map_err(|e| ConsensusError::Other(format!("verification task failed: {e}")))?;

        if let Err(e) = verdict {
            warn!("Commit for {}/{} rejected: {}", height, round, e);
            round_state.lock().set_processor_result(false);
            self.send_event(ConsensusEvent::CommitRejected {
                height,
                round,
                reason: e.to_string(),
            });
            let next = st.round.max(round) + 1;
            return self.start_round(st, next, queue);
        }

        let (commit, block, wallets) = unit.into_parts();
        let commit = commit.ok_or_else(|| ConsensusError::Other("commit state lost its certificate".into()))?;
        self.chain
            .commit(&commit, &block, wallets)
            .map_err(|e| ConsensusError::CommitFailed(e.to_string()))?;
        round_state.lock().advance(RoundStep::Decided)?;

        self.storage.prune_through(height)?;
        self.repository.prune_below(height + 1);
        self.tracker.lock().prune_below(height.saturating_sub(EVIDENCE_HEIGHTS));
        self.send_event(ConsensusEvent::Committed { commit });

        st.height = height + 1;
        st.lock = LockState::default();
        st.validators = self.validators.active_validators(st.height)?;
        self.start_round(st, 0, queue)
    }

    /// More than a third of the power is already at a later round
    fn on_minority_with_higher_round(
        &self,
        st: &mut EngineState,
        round_state: &SharedRoundState,
        queue: &mut WorkQueue,
    ) -> ConsensusResult<()> {
        let (height, round, minority) = {
            let rs = round_state.lock();
            (rs.height(), rs.round(), rs.has_minority_prevotes_or_precommits())
        };
        if !minority || height != st.height || round <= st.round {
            return Ok(());
        }

        info!("Skipping from round {} to {} at height {}", st.round, round, height);
        self.start_round(st, round, queue)
    }

    fn start_round(&self, st: &mut EngineState, round: Round, queue: &mut WorkQueue) -> ConsensusResult<()> {
        st.round = round;
        st.step = Step::Propose;
        st.did_majority_prevote = false;
        st.did_majority_precommit = false;
        st.round_start = now_millis();
        *self.position.lock() = (st.height, round);

        self.scheduler.clear();
        if self.is_disposed() {
            return Ok(());
        }

        let round_state = self.repository.get_round_state(st.height, round)?;
        let proposer = round_state.lock().proposer();
        info!(
            ">> Starting new round: {}/{} with proposer: {}",
            st.height, round, proposer
        );
        self.send_event(ConsensusEvent::RoundStarted {
            height: st.height,
            round,
            proposer,
        });

        let at = self.block_timestamp(st);
        self.scheduler.schedule_block_prepare(st.height, round, at);
        self.save_state(st)?;
        queue.push_back((st.height, round));
        Ok(())
    }

    /// Timestamp of a block proposed in the current round. Never below the
    /// minimal timestamp the verification pipeline enforces.
    fn block_timestamp(&self, st: &EngineState) -> Timestamp {
        let parent = self.chain.last_block().header.timestamp;
        self.scheduler
            .next_block_timestamp(parent, st.round_start)
            .max(self.scheduler.minimal_timestamp(parent, st.round))
    }

    /// Build, store, broadcast and buffer the proposal of a local proposer.
    /// The valid value is re-proposed with its prevote certificate.
    async fn propose(&self, st: &mut EngineState, queue: &mut WorkQueue) -> ConsensusResult<()> {
        let (height, round) = (st.height, st.round);
        let round_state = self.repository.get_round_state(height, round)?;
        let (proposer, has_proposal) = {
            let rs = round_state.lock();
            (rs.proposer(), rs.proposal().is_some())
        };
        if has_proposal {
            return Ok(());
        }
        let Some(signer) = self.local_signer(&st.validators, proposer) else {
            return Ok(());
        };

        let (block, valid_round, lock_proof) = match self.valid_value_proposal(st).await? {
            Some((block, valid_round, lock_proof)) => {
                info!(
                    "Proposing valid block {}/{} from round {} with blockId: {}",
                    height,
                    round,
                    valid_round,
                    block.id()?.short()
                );
                (block, Some(valid_round), Some(lock_proof))
            }
            None => {
                let generator = st
                    .validators
                    .get(proposer)
                    .map(|v| v.wallet_public_key.clone())
                    .ok_or_else(|| ConsensusError::Other(format!("no validator {}", proposer)))?;
                let block = self.block_builder.build_block(
                    &self.chain.last_block(),
                    round,
                    self.block_timestamp(st),
                    &generator,
                )?;
                info!(
                    "Proposing new block {}/{} with blockId: {}",
                    height,
                    round,
                    block.id()?.short()
                );
                (block, None, None)
            }
        };

        let message = Proposal::signing_message_for(height, round, valid_round, block.id()?)?;
        let proposal = Proposal {
            height,
            round,
            valid_round,
            block,
            lock_proof,
            validator_index: proposer,
            signature: self.workers.sign(signer, message).await?,
        };

        self.storage
            .save_proposals(std::slice::from_ref(&proposal))?;
        round_state.lock().set_proposal(proposal.clone())?;
        self.broadcaster.broadcast_proposal(&proposal);
        queue.push_back((height, round));
        Ok(())
    }

    /// Block and prevote certificate of the valid value, when this node
    /// still holds both
    async fn valid_value_proposal(
        &self,
        st: &EngineState,
    ) -> ConsensusResult<Option<(Block, Round, AggregatedSignature)>> {
        let (Some(valid_value), Some(valid_round)) = (st.lock.valid_value, st.lock.valid_round) else {
            return Ok(None);
        };
        let Some(earlier) = self.repository.snapshot_round(st.height, valid_round) else {
            return Ok(None);
        };
        let Some(block) = earlier
            .block()
            .filter(|_| earlier.block_id() == Some(valid_value))
            .cloned()
        else {
            return Ok(None);
        };
        let Some((bitmask, signatures)) = earlier.prevotes().signers_of(Some(valid_value)) else {
            return Ok(None);
        };

        let lock_proof = AggregatedSignature {
            bitmask,
            signature: self.workers.aggregate(signatures).await?,
        };
        Ok(Some((block, valid_round, lock_proof)))
    }

    fn local_signer(&self, validators: &ValidatorSet, index: ValidatorIndex) -> Option<Arc<dyn Signer>> {
        let key = &validators.get(index)?.consensus_public_key;
        self.local_keys
            .iter()
            .find(|(local, _)| local == key)
            .map(|(_, signer)| signer.clone())
    }

    fn local_validators(&self, validators: &ValidatorSet) -> Vec<(ValidatorIndex, Arc<dyn Signer>)> {
        let mut local: Vec<_> = self
            .local_keys
            .iter()
            .filter_map(|(key, signer)| {
                validators
                    .index_of_consensus_key(key)
                    .map(|index| (index, signer.clone()))
            })
            .collect();
        local.sort_by_key(|(index, _)| *index);
        local
    }

    /// Sign `kind` votes for `value` with every local validator that has not
    /// voted in the current round, then persist before broadcasting them
    async fn cast_votes(
        &self,
        st: &mut EngineState,
        kind: VoteKind,
        value: Option<BlockId>,
        queue: &mut WorkQueue,
    ) -> ConsensusResult<()> {
        let (height, round) = (st.height, st.round);
        let round_state = self.repository.get_round_state(height, round)?;

        let mut votes = Vec::new();
        for (index, signer) in self.local_validators(&st.validators) {
            let voted = round_state.lock().votes(kind).has_vote(index);
            if voted {
                continue;
            }
            let message = Vote::signing_message_for(kind, height, round, value)?;
            votes.push(Vote {
                kind,
                height,
                round,
                block_id: value,
                validator_index: index,
                signature: self.workers.sign(signer, message).await?,
            });
        }
        if votes.is_empty() {
            return Ok(());
        }

        {
            let mut rs = round_state.lock();
            for vote in &votes {
                rs.add_vote(vote.clone())?;
            }
            let step = match kind {
                VoteKind::Prevote => RoundStep::Prevoted,
                VoteKind::Precommit => RoundStep::Precommitted,
            };
            if rs.step() < step {
                rs.advance(step)?;
            }
        }

        self.save_votes(kind, &votes)?;
        self.save_state(st)?;
        for vote in &votes {
            match kind {
                VoteKind::Prevote => self.broadcaster.broadcast_prevote(vote),
                VoteKind::Precommit => self.broadcaster.broadcast_precommit(vote),
            }
        }

        info!(
            "Sent {} {} for {}/{} blockId: {}",
            votes.len(),
            kind,
            height,
            round,
            value.map_or_else(|| "null".to_string(), |id| id.short())
        );
        queue.push_back((height, round));
        Ok(())
    }

    fn save_votes(&self, kind: VoteKind, votes: &[Vote]) -> ConsensusResult<()> {
        match kind {
            VoteKind::Prevote => self.storage.save_prevotes(votes)?,
            VoteKind::Precommit => self.storage.save_precommits(votes)?,
        }
        Ok(())
    }

    fn save_state(&self, st: &EngineState) -> ConsensusResult<()> {
        self.storage.save_state(&st.data())?;
        Ok(())
    }

    /// Dispatch a fired timer
    pub async fn handle_timeout(&self, event: TimeoutEvent) -> ConsensusResult<()> {
        let TimeoutEvent {
            kind,
            height,
            round,
        } = event;
        match kind {
            TimeoutKind::BlockPrepare => self.on_timeout_block_prepare(height, round).await,
            TimeoutKind::Propose => self.on_timeout_propose(height, round).await,
            TimeoutKind::Prevote => self.on_timeout_prevote(height, round).await,
            TimeoutKind::Precommit => self.on_timeout_precommit(height, round).await,
        }
    }

    /// Feed fired timers to the engine until it is disposed. Stops on a
    /// fatal error.
    pub async fn run_timeouts(self: Arc<Self>, mut timeouts: mpsc::UnboundedReceiver<TimeoutEvent>) {
        while let Some(event) = timeouts.recv().await {
            if self.is_disposed() {
                break;
            }
            if let Err(e) = self.handle_timeout(event).await {
                if e.is_fatal() {
                    error!("Consensus halted on {:?} timeout: {}", event.kind, e);
                    break;
                }
                warn!("{:?} timeout handling failed: {}", event.kind, e);
            }
        }
        debug!("Timeout loop finished");
    }

    /// Block time reached: start the propose stage and propose when local
    pub async fn on_timeout_block_prepare(&self, height: Height, round: Round) -> ConsensusResult<()> {
        let mut st = self.state.lock().await;
        if self.is_disposed() || !st.is_current(height, round) {
            return Ok(());
        }

        self.scheduler.schedule_propose(height, round);
        let mut queue = WorkQueue::new();
        self.propose(&mut st, &mut queue).await?;
        self.drain(&mut st, &mut queue).await
    }

    pub async fn on_timeout_propose(&self, height: Height, round: Round) -> ConsensusResult<()> {
        let mut st = self.state.lock().await;
        if self.is_disposed() || st.step != Step::Propose || !st.is_current(height, round) {
            return Ok(());
        }

        info!("Timeout to propose {}/{} expired", height, round);
        let round_state = self.repository.get_round_state(height, round)?;
        let (proposer, missing) = {
            let rs = round_state.lock();
            (rs.proposer(), rs.proposal().is_none())
        };
        if missing {
            let offline = self.tracker.lock().record_missed_proposal(proposer);
            if let Some(misbehaviour) = offline {
                warn!("Proposer {} keeps missing its rounds", proposer);
                self.send_event(ConsensusEvent::MisbehaviourDetected { misbehaviour });
            }
        }

        st.step = Step::Prevote;
        let mut queue = WorkQueue::new();
        self.cast_votes(&mut st, VoteKind::Prevote, None, &mut queue)
            .await?;
        self.drain(&mut st, &mut queue).await
    }

    pub async fn on_timeout_prevote(&self, height: Height, round: Round) -> ConsensusResult<()> {
        let mut st = self.state.lock().await;
        if self.is_disposed() || st.step != Step::Prevote || !st.is_current(height, round) {
            return Ok(());
        }

        info!("Timeout to prevote {}/{} expired", height, round);
        st.step = Step::Precommit;
        let mut queue = WorkQueue::new();
        self.cast_votes(&mut st, VoteKind::Precommit, None, &mut queue)
            .await?;
        self.drain(&mut st, &mut queue).await
    }

    pub async fn on_timeout_precommit(&self, height: Height, round: Round) -> ConsensusResult<()> {
        let mut st = self.state.lock().await;
        if self.is_disposed() || !st.is_current(height, round) {
            return Ok(());
        }

        info!("Timeout to precommit {}/{} expired", height, round);
        let mut queue = WorkQueue::new();
        self.start_round(&mut st, round + 1, &mut queue)?;
        self.drain(&mut st, &mut queue).await
    }
}

/// Heights of equivocation evidence kept behind the tip
const EVIDENCE_HEIGHTS: Height = 100;

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusEngine")
            .field("position", &*self.position.lock())
            .field("repository", &self.repository)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}
