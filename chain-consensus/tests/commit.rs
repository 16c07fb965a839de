mod common;

use chain_consensus::{Broadcaster, ConsensusEvent};
use chain_core::{Block, Step};
use chain_db::ConsensusStorage;
use chain_state::ChainStore;
use common::*;
use std::sync::Arc;

#[tokio::test]
async fn test_single_node_holding_every_key_commits() {
    init_tracing();
    let chain = genesis_chain();
    let storage = memory_storage();
    let recorder = Arc::new(Recorder::default());
    let mut node = bootstrap_node(
        config(fast_timeouts()),
        chain.clone(),
        storage.clone(),
        recorder.clone(),
        (0..VALIDATORS).map(signer).collect(),
    )
    .await;
    node.engine.start().await.unwrap();

    let commit = wait_for_commit(&mut node.events).await;
    assert_eq!(commit.height, 1);
    assert_eq!(commit.round, 0);
    assert_eq!(commit.certificate.bitmask.to_string(), "1111");

    let tip: Block = chain.last_block();
    assert_eq!(tip.height(), 1);
    assert_eq!(tip.id().unwrap(), commit.block_id);
    assert_eq!(chain.last_commit(), Some(commit.clone()));

    let state = node.engine.state().await;
    assert_eq!((state.height, state.round), (2, 0));
    assert_eq!(state.step, Step::Propose);
    assert!(!state.lock.is_locked());

    // Artifacts of the decided height are gone from storage and memory
    assert!(storage.get_proposals().unwrap().iter().all(|p| p.height >= 2));
    assert!(storage.get_prevotes().unwrap().iter().all(|v| v.height >= 2));
    assert!(storage.get_precommits().unwrap().iter().all(|v| v.height >= 2));
    assert_eq!(storage.get_state().unwrap().unwrap().height, 2);
    assert!(node.engine.repository().rounds_at(1).is_empty());

    assert_eq!(recorder.proposals().len(), 1);
    assert_eq!(recorder.proposals()[0].validator_index, 0);
    assert_eq!(recorder.prevotes().len(), VALIDATORS);
    assert_eq!(recorder.precommits().len(), VALIDATORS);
    assert!(recorder
        .precommits()
        .iter()
        .all(|v| v.block_id == Some(commit.block_id)));

    node.engine.dispose().await.unwrap();
}

#[tokio::test]
async fn test_commit_is_announced_after_round_events() {
    init_tracing();
    let mut node = bootstrap_node(
        config(fast_timeouts()),
        genesis_chain(),
        memory_storage(),
        Arc::new(Recorder::default()),
        (0..VALIDATORS).map(signer).collect(),
    )
    .await;
    node.engine.start().await.unwrap();
    wait_for_commit(&mut node.events).await;
    node.engine.dispose().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = node.events.try_recv() {
        seen.push(event);
    }
    // Round 0 of the next height was entered after the commit
    assert!(seen.iter().any(|e| matches!(
        e,
        ConsensusEvent::RoundStarted {
            height: 2,
            round: 0,
            ..
        }
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_network_of_four_nodes_agrees_on_first_block() {
    init_tracing();
    let router = Arc::new(Router::default());
    let mut nodes = Vec::new();
    let mut chains = Vec::new();
    for i in 0..VALIDATORS {
        let chain = genesis_chain();
        let port: Arc<dyn Broadcaster> = router.port(i);
        let node = bootstrap_node(
            config(fast_timeouts()),
            chain.clone(),
            memory_storage(),
            port,
            vec![signer(i)],
        )
        .await;
        router.attach(&node.engine);
        nodes.push(node);
        chains.push(chain);
    }
    for node in &nodes {
        node.engine.start().await.unwrap();
    }

    let mut commits = Vec::new();
    for node in &mut nodes {
        commits.push(wait_for_commit(&mut node.events).await);
    }

    let block_id = commits[0].block_id;
    for (commit, chain) in commits.iter().zip(&chains) {
        assert_eq!(commit.height, 1);
        assert_eq!(commit.block_id, block_id);
        assert!(commit.certificate.bitmask.count_ones() >= 3);
        assert_eq!(chain.last_block().id().unwrap(), block_id);
    }

    for node in &nodes {
        node.engine.dispose().await.unwrap();
    }
}
