//! Shared harness for the engine integration tests
#![allow(dead_code)]

use chain_consensus::scheduler::minimal_timestamp;
use chain_consensus::{
    BlockBuilder, Broadcaster, ConsensusConfig, ConsensusEngine, ConsensusEvent, ConsensusService,
    EmptyBlockBuilder, TimeoutConfig, ValidatorConfig,
};
use chain_core::{
    codec, AggregatedSignature, Block, BlockId, BlsKeyPair, BlsSignature, Commit, Height,
    Proposal, Round, Signer, ValidatorBitmask, ValidatorIndex, Vote, VoteKind, WalletKeyPair,
};
use chain_db::{ConsensusStore, MemoryDatabase, SharedDatabase};
use chain_state::{ChainStore, MemoryChainStore, MemoryWalletRepository};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

pub const VALIDATORS: usize = 4;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn consensus_key(i: ValidatorIndex) -> BlsKeyPair {
    BlsKeyPair::from_seed(format!("consensus-{i}").as_bytes()).unwrap()
}

pub fn signer(i: ValidatorIndex) -> Arc<dyn Signer> {
    Arc::new(consensus_key(i))
}

pub fn wallet_key(i: ValidatorIndex) -> WalletKeyPair {
    WalletKeyPair::from_seed(format!("wallet-{i}").as_bytes()).unwrap()
}

pub fn validator_config(i: ValidatorIndex) -> ValidatorConfig {
    let wallet = wallet_key(i);
    ValidatorConfig {
        address: wallet.address().unwrap().to_string(),
        consensus_public_key: consensus_key(i).public_key().to_hex(),
        wallet_public_key: wallet.public_key().to_hex(),
        voting_power: 1,
    }
}

pub fn config(timeouts: TimeoutConfig) -> ConsensusConfig {
    ConsensusConfig::new((0..VALIDATORS).map(validator_config).collect()).with_timeouts(timeouts)
}

/// Proposals go out almost immediately; the next height waits a minute
pub fn fast_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        block_time: 60_000,
        block_prepare_time: 50,
        stage_timeout: 2_000,
        stage_timeout_increase: 1_000,
    }
}

/// No timer fires while a test runs
pub fn idle_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        block_time: 1_000,
        block_prepare_time: 600_000,
        stage_timeout: 600_000,
        stage_timeout_increase: 1_000,
    }
}

pub fn genesis_chain() -> Arc<MemoryChainStore> {
    let genesis = Block::genesis(wallet_key(0).public_key().clone(), 0);
    Arc::new(MemoryChainStore::new(
        genesis,
        Arc::new(MemoryWalletRepository::new()),
    ))
}

/// Chain of empty blocks up to `height`, one `block_time` apart
pub fn chain_at(height: Height, timeouts: &TimeoutConfig) -> Arc<MemoryChainStore> {
    let chain = genesis_chain();
    for h in 1..=height {
        let parent = chain.last_block();
        let generator = wallet_key(0);
        let block = EmptyBlockBuilder
            .build_block(
                &parent,
                0,
                parent.header.timestamp + timeouts.block_time,
                generator.public_key(),
            )
            .unwrap();
        let commit = Commit {
            height: h,
            round: 0,
            block_id: block.id().unwrap(),
            certificate: AggregatedSignature {
                bitmask: ValidatorBitmask::from_indices(VALIDATORS, 0..VALIDATORS),
                signature: BlsSignature::from_bytes(&[0u8; 96]),
            },
        };
        chain
            .commit(&commit, &block, chain.wallet_snapshot())
            .unwrap();
    }
    chain
}

pub fn memory_storage() -> Arc<ConsensusStore> {
    let db: SharedDatabase = Arc::new(MemoryDatabase::new());
    Arc::new(ConsensusStore::new(db))
}

/// Empty block on the chain tip by the round-robin proposer of `round`, at
/// the earliest timestamp the pipeline accepts
pub fn block_for(chain: &MemoryChainStore, round: Round, timeouts: &TimeoutConfig) -> Block {
    let parent = chain.last_block();
    let proposer = round as usize % VALIDATORS;
    EmptyBlockBuilder
        .build_block(
            &parent,
            round,
            minimal_timestamp(timeouts, parent.header.timestamp, round),
            wallet_key(proposer).public_key(),
        )
        .unwrap()
}

pub fn signed_proposal(height: Height, round: Round, block: Block) -> Proposal {
    let proposer = round as usize % VALIDATORS;
    let message = Proposal::signing_message_for(height, round, None, block.id().unwrap()).unwrap();
    Proposal {
        height,
        round,
        valid_round: None,
        block,
        lock_proof: None,
        validator_index: proposer,
        signature: consensus_key(proposer).sign(&message),
    }
}

pub fn signed_vote(
    kind: VoteKind,
    height: Height,
    round: Round,
    block_id: Option<BlockId>,
    index: ValidatorIndex,
) -> Vote {
    Vote::signed(kind, height, round, block_id, index, &consensus_key(index)).unwrap()
}

/// Broadcaster that keeps everything it is asked to send
#[derive(Default)]
pub struct Recorder {
    proposals: Mutex<Vec<Proposal>>,
    prevotes: Mutex<Vec<Vote>>,
    precommits: Mutex<Vec<Vote>>,
}

impl Recorder {
    pub fn proposals(&self) -> Vec<Proposal> {
        self.proposals.lock().clone()
    }

    pub fn prevotes(&self) -> Vec<Vote> {
        self.prevotes.lock().clone()
    }

    pub fn precommits(&self) -> Vec<Vote> {
        self.precommits.lock().clone()
    }
}

impl Broadcaster for Recorder {
    fn broadcast_proposal(&self, proposal: &Proposal) {
        self.proposals.lock().push(proposal.clone());
    }

    fn broadcast_prevote(&self, vote: &Vote) {
        self.prevotes.lock().push(vote.clone());
    }

    fn broadcast_precommit(&self, vote: &Vote) {
        self.precommits.lock().push(vote.clone());
    }
}

#[derive(Clone)]
enum Message {
    Proposal(Vec<u8>),
    Prevote(Vec<u8>),
    Precommit(Vec<u8>),
}

/// In-process network delivering encoded messages to every other node
#[derive(Default)]
pub struct Router {
    engines: RwLock<Vec<Weak<ConsensusEngine>>>,
}

impl Router {
    pub fn attach(&self, engine: &Arc<ConsensusEngine>) {
        self.engines.write().push(Arc::downgrade(engine));
    }

    pub fn port(self: &Arc<Self>, from: usize) -> Arc<RouterPort> {
        Arc::new(RouterPort {
            from,
            router: self.clone(),
        })
    }

    fn deliver(&self, from: usize, message: Message) {
        for (to, engine) in self.engines.read().iter().enumerate() {
            if to == from {
                continue;
            }
            let Some(engine) = engine.upgrade() else {
                continue;
            };
            let message = message.clone();
            tokio::spawn(async move {
                let service = ConsensusService::new(engine);
                match message {
                    Message::Proposal(bytes) => service.proposal(&bytes).await,
                    Message::Prevote(bytes) => service.prevote(&bytes).await,
                    Message::Precommit(bytes) => service.precommit(&bytes).await,
                }
            });
        }
    }
}

/// Broadcaster of one node on the [`Router`]
pub struct RouterPort {
    from: usize,
    router: Arc<Router>,
}

impl Broadcaster for RouterPort {
    fn broadcast_proposal(&self, proposal: &Proposal) {
        let bytes = codec::encode(proposal).unwrap();
        self.router.deliver(self.from, Message::Proposal(bytes));
    }

    fn broadcast_prevote(&self, vote: &Vote) {
        let bytes = codec::encode(vote).unwrap();
        self.router.deliver(self.from, Message::Prevote(bytes));
    }

    fn broadcast_precommit(&self, vote: &Vote) {
        let bytes = codec::encode(vote).unwrap();
        self.router.deliver(self.from, Message::Precommit(bytes));
    }
}

pub struct Node {
    pub engine: Arc<ConsensusEngine>,
    pub service: ConsensusService,
    pub events: mpsc::UnboundedReceiver<ConsensusEvent>,
}

/// Build and bootstrap an engine; timers are driven by a spawned task.
/// The engine is not started.
pub async fn bootstrap_node(
    config: ConsensusConfig,
    chain: Arc<MemoryChainStore>,
    storage: Arc<ConsensusStore>,
    broadcaster: Arc<dyn Broadcaster>,
    keys: Vec<Arc<dyn Signer>>,
) -> Node {
    let (mut engine, timeouts) = ConsensusEngine::new(
        config,
        chain,
        storage,
        Arc::new(EmptyBlockBuilder),
        broadcaster,
        keys,
    )
    .unwrap();
    let (sender, events) = mpsc::unbounded_channel();
    engine.set_event_sender(sender);

    let engine = Arc::new(engine);
    engine.bootstrap().await.unwrap();
    tokio::spawn(engine.clone().run_timeouts(timeouts));

    Node {
        service: ConsensusService::new(engine.clone()),
        engine,
        events,
    }
}

/// Next commit announced by the engine
pub async fn wait_for_commit(events: &mut mpsc::UnboundedReceiver<ConsensusEvent>) -> Commit {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await {
                Some(ConsensusEvent::Committed { commit }) => return commit,
                Some(_) => continue,
                None => panic!("engine dropped its event channel"),
            }
        }
    })
    .await
    .expect("no commit within 20s")
}
