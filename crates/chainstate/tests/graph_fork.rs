mod common;

use std::sync::Arc;

use common::{build_chain, insert, make_block, open_graph, EASY_BITS, HARD_BITS};
use exploder_chainstate::{ChainError, InsertKind};
use exploder_parser::model::ChainId;
use exploder_storage::memory::MemoryStore;
use primitive_types::U256;

#[test]
fn first_block_becomes_main_root() {
    let store = Arc::new(MemoryStore::new());
    let mut graph = open_graph(&store, true);
    let block = make_block(None, 0, EASY_BITS, &[]);
    let outcome = insert(&mut graph, &block);

    assert_eq!(outcome.kind, InsertKind::Genesis);
    assert_eq!(outcome.block.height, 0);
    assert_eq!(outcome.block.chain, ChainId::MAIN);
    assert_eq!(outcome.block.chainwork, block.work);
    assert_eq!(outcome.block.chainwork, U256::from(2u8));
    assert_eq!(graph.tip().map(|tip| tip.hash), Some(block.hash()));
}

#[test]
fn linear_chain_heights_and_work_increase() {
    let store = Arc::new(MemoryStore::new());
    let mut graph = open_graph(&store, true);
    let hashes = build_chain(&mut graph, 6);

    for (height, hash) in hashes.iter().enumerate() {
        let record = graph.block(hash).expect("read").expect("block");
        assert_eq!(record.height, height as u32);
        assert_eq!(record.chain, ChainId::MAIN);
        assert_eq!(record.chainwork, U256::from(2 * (height as u64 + 1)));
        assert_eq!(record.nextblockhash, hashes.get(height + 1).copied());
        let by_height = graph
            .block_at_height(height as u32)
            .expect("read")
            .expect("indexed");
        assert_eq!(by_height.hash, *hash);
    }
    assert_eq!(graph.height(), Some(5));
}

#[test]
fn fork_off_non_tip_block_stays_on_side_branch() {
    let store = Arc::new(MemoryStore::new());
    let mut graph = open_graph(&store, true);
    let hashes = build_chain(&mut graph, 4);

    let fork = make_block(Some(hashes[1]), 100, EASY_BITS, &[]);
    let outcome = insert(&mut graph, &fork);
    assert_eq!(outcome.kind, InsertKind::NewFork);
    assert!(!outcome.reconverged);
    assert_eq!(outcome.fork_point, Some(hashes[1]));
    assert_ne!(outcome.block.chain, ChainId::MAIN);
    assert_eq!(outcome.block.height, 2);
    assert_eq!(graph.tip().map(|tip| tip.hash), Some(hashes[3]));

    let growth = make_block(Some(fork.hash()), 101, EASY_BITS, &[]);
    let outcome = insert(&mut graph, &growth);
    assert_eq!(outcome.kind, InsertKind::SideGrowth);
    let side_id = graph.block(&fork.hash()).expect("read").expect("fork").chain;
    assert_eq!(outcome.block.chain, side_id);
    let parent = graph.block(&fork.hash()).expect("read").expect("fork");
    assert_eq!(parent.nextblockhash, Some(growth.hash()));
    // The MAIN parent keeps its MAIN successor.
    let main_parent = graph.block(&hashes[1]).expect("read").expect("main");
    assert_eq!(main_parent.nextblockhash, Some(hashes[2]));
}

#[test]
fn heavier_fork_replaces_the_tip() {
    let store = Arc::new(MemoryStore::new());
    let mut graph = open_graph(&store, true);
    let hashes = build_chain(&mut graph, 3);
    let (b, c) = (hashes[1], hashes[2]);

    let d = make_block(Some(b), 50, HARD_BITS, &[]);
    let outcome = insert(&mut graph, &d);
    assert!(outcome.reconverged);
    assert_eq!(outcome.fork_point, Some(b));
    assert_eq!(outcome.block.chain, ChainId::MAIN);
    assert_eq!(outcome.block.height, 2);
    assert_eq!(graph.tip().map(|tip| tip.hash), Some(d.hash()));

    let c_record = graph.block(&c).expect("read").expect("c");
    assert_ne!(c_record.chain, ChainId::MAIN);
    assert_eq!(
        graph.block_at_height(2).expect("read").map(|block| block.hash),
        Some(d.hash())
    );
    let b_record = graph.block(&b).expect("read").expect("b");
    assert_eq!(b_record.nextblockhash, Some(d.hash()));
}

#[test]
fn long_fork_reconverges_once_it_outweighs_main() {
    let store = Arc::new(MemoryStore::new());
    let mut graph = open_graph(&store, true);
    let main = build_chain(&mut graph, 11);

    let mut fork = Vec::new();
    let mut prev = main[5];
    for nonce in 106..=110 {
        let block = make_block(Some(prev), nonce, EASY_BITS, &[]);
        let outcome = insert(&mut graph, &block);
        assert!(!outcome.reconverged, "fork at nonce {nonce} must not win yet");
        prev = block.hash();
        fork.push(prev);
    }
    // Equal work never switches branches.
    assert_eq!(graph.tip().map(|tip| tip.hash), Some(main[10]));
    let fork_id = graph.block(&fork[0]).expect("read").expect("fork").chain;

    let winner = make_block(Some(prev), 111, EASY_BITS, &[]);
    let outcome = insert(&mut graph, &winner);
    fork.push(winner.hash());
    assert!(outcome.reconverged);
    assert_eq!(outcome.fork_point, Some(main[5]));
    assert_eq!(graph.tip().map(|tip| tip.hash), Some(winner.hash()));
    assert_eq!(graph.height(), Some(11));

    for (offset, hash) in fork.iter().enumerate() {
        let record = graph.block(hash).expect("read").expect("fork block");
        assert_eq!(record.chain, ChainId::MAIN);
        assert_eq!(record.height, 6 + offset as u32);
        assert_eq!(
            graph
                .block_at_height(record.height)
                .expect("read")
                .map(|block| block.hash),
            Some(*hash)
        );
    }

    let demoted_id = graph.block(&main[6]).expect("read").expect("b6").chain;
    assert_ne!(demoted_id, ChainId::MAIN);
    assert_ne!(demoted_id, fork_id);
    for hash in &main[6..=10] {
        assert_eq!(graph.block(hash).expect("read").expect("demoted").chain, demoted_id);
    }
    let b5 = graph.block(&main[5]).expect("read").expect("b5");
    assert_eq!(b5.nextblockhash, Some(fork[0]));
}

#[test]
fn reinserting_a_known_block_is_rejected_without_changes() {
    let store = Arc::new(MemoryStore::new());
    let mut graph = open_graph(&store, true);
    let hashes = build_chain(&mut graph, 3);
    graph.flush().expect("flush");

    let again = make_block(Some(hashes[0]), 1, EASY_BITS, &[]);
    assert!(matches!(
        graph.insert_block(&again),
        Err(ChainError::DuplicateBlock(hash)) if hash == hashes[1]
    ));
    assert_eq!(graph.cache().pending_len(), 0);

    let mut reopened = open_graph(&store, true);
    assert_eq!(reopened.tip().map(|tip| tip.hash), Some(hashes[2]));
    assert!(matches!(
        reopened.insert_block(&again),
        Err(ChainError::DuplicateBlock(_))
    ));
}

#[test]
fn unknown_parent_is_an_orphan() {
    let store = Arc::new(MemoryStore::new());
    let mut graph = open_graph(&store, true);
    build_chain(&mut graph, 2);
    let orphan = make_block(Some([0xab; 32]), 9, EASY_BITS, &[]);
    assert!(matches!(
        graph.insert_block(&orphan),
        Err(ChainError::OrphanBlock(parent)) if parent == [0xab; 32]
    ));
    assert!(!graph.contains(&orphan.hash()).expect("read"));
}

#[test]
fn rewind_demotes_blocks_above_the_common_block() {
    let store = Arc::new(MemoryStore::new());
    let mut graph = open_graph(&store, true);
    let hashes = build_chain(&mut graph, 5);

    assert_eq!(graph.rewind_to(&hashes[2]).expect("rewind"), 2);
    let tip = graph.tip().expect("tip").clone();
    assert_eq!(tip.hash, hashes[2]);
    assert_eq!(tip.nextblockhash, None);
    let side = graph.block(&hashes[3]).expect("read").expect("b3").chain;
    assert_ne!(side, ChainId::MAIN);
    assert_eq!(graph.block(&hashes[4]).expect("read").expect("b4").chain, side);
    assert!(graph.block_at_height(3).expect("read").is_none());

    // Rewinding to the tip is a no-op.
    assert_eq!(graph.rewind_to(&hashes[2]).expect("rewind"), 0);

    let replacement = make_block(Some(hashes[2]), 30, EASY_BITS, &[]);
    let outcome = insert(&mut graph, &replacement);
    assert_eq!(outcome.kind, InsertKind::Extension);
    assert_eq!(outcome.block.height, 3);
}

#[test]
fn reopen_restores_tip_and_side_counter() {
    let store = Arc::new(MemoryStore::new());
    let used = {
        let mut graph = open_graph(&store, true);
        let hashes = build_chain(&mut graph, 3);
        let fork = make_block(Some(hashes[0]), 70, EASY_BITS, &[]);
        let used = insert(&mut graph, &fork).block.chain;
        graph.flush().expect("flush");
        used
    };
    let graph = open_graph(&store, true);
    assert_eq!(graph.height(), Some(2));
    assert!(graph.next_side_id() > used);
}

#[test]
fn discard_drops_unflushed_blocks() {
    let store = Arc::new(MemoryStore::new());
    let mut graph = open_graph(&store, true);
    let hashes = build_chain(&mut graph, 2);
    graph.flush().expect("flush");

    let pending = make_block(Some(hashes[1]), 2, EASY_BITS, &[]);
    insert(&mut graph, &pending);
    graph.discard().expect("discard");
    assert_eq!(graph.tip().map(|tip| tip.hash), Some(hashes[1]));
    assert!(!graph.contains(&pending.hash()).expect("read"));
    insert(&mut graph, &pending);
}
