//! Branch overtake: a heavier side branch becomes the best chain and the
//! UTXO set is repositioned onto it, plus restart behavior over the same
//! store.

mod common;

use std::sync::Arc;

use arbor_chainstate::params::ChainParams;

use common::{coinbase_outpoint, harness, harness_on, mine, AcceptAll};

#[test]
fn side_branch_overtake_repositions_utxo_set() {
    let genesis = mine([0u8; 32], 1_000, 0);
    let a1 = mine(genesis.hash(), 1_060, 1);
    let a2 = mine(a1.hash(), 1_120, 2);
    let a3 = mine(a2.hash(), 1_180, 3);
    let b2 = mine(a1.hash(), 1_130, 12);
    let b3 = mine(b2.hash(), 1_190, 13);
    let b4 = mine(b3.hash(), 1_250, 14);

    let params = ChainParams::new(genesis.hash());
    let h = harness(params, Arc::new(AcceptAll));

    // Assemble the A branch first.
    h.insert_headers(&[genesis.header, a1.header, a2.header, a3.header]);
    for (priority, block) in [&genesis, &a1, &a2, &a3].into_iter().enumerate() {
        h.pending.store_block(block, priority as i64).unwrap();
    }
    let summary = h.assembler.run_pass().unwrap();
    assert_eq!(summary.blocks_processed, 4);
    let head = h.headers.head_block_id().unwrap().unwrap();
    assert_eq!(h.headers.hash(head).unwrap().unwrap(), a3.hash());
    assert!(h.utxo.find(&coinbase_outpoint(&a3)).unwrap().is_some());

    // The B branch forks below the A tip and accumulates more header work.
    h.insert_headers(&[b2.header, b3.header, b4.header]);
    for (priority, block) in [&b2, &b3, &b4].into_iter().enumerate() {
        h.pending.store_block(block, priority as i64).unwrap();
    }
    let summary = h.assembler.run_pass().unwrap();
    assert_eq!(summary.blocks_processed, 3);

    let head = h.headers.head_block_id().unwrap().unwrap();
    assert_eq!(h.headers.hash(head).unwrap().unwrap(), b4.hash());

    // Abandoned branch outputs are gone; the new branch's are present.
    assert!(h.utxo.find(&coinbase_outpoint(&a2)).unwrap().is_none());
    assert!(h.utxo.find(&coinbase_outpoint(&a3)).unwrap().is_none());
    let shared = h.utxo.find(&coinbase_outpoint(&a1)).unwrap().unwrap();
    assert_eq!(shared.height, 1);
    for (block, height) in [(&b2, 2u32), (&b3, 3), (&b4, 4)] {
        let entry = h.utxo.find(&coinbase_outpoint(block)).unwrap().unwrap();
        assert_eq!(entry.height, height);
    }
    assert!(h.utxo.is_consistent());
}

#[test]
fn restart_preserves_committed_state() {
    let genesis = mine([0u8; 32], 1_000, 0);
    let b1 = mine(genesis.hash(), 1_060, 1);
    let b2 = mine(b1.hash(), 1_120, 2);
    let params = ChainParams::new(genesis.hash());

    let store = {
        let h = harness(params.clone(), Arc::new(AcceptAll));
        h.insert_headers(&[genesis.header, b1.header, b2.header]);
        for (priority, block) in [&genesis, &b1, &b2].into_iter().enumerate() {
            h.pending.store_block(block, priority as i64).unwrap();
        }
        let summary = h.assembler.run_pass().unwrap();
        assert_eq!(summary.blocks_processed, 3);
        assert_eq!(h.utxo.committed_height().unwrap(), 2);
        Arc::clone(&h.store)
    };

    // A fresh component stack over the same store resumes where it left off.
    let h = harness_on(store, params, Arc::new(AcceptAll));
    assert_eq!(h.utxo.committed_height().unwrap(), 2);
    assert_eq!(h.utxo.staged_height(), 2);

    let head = h.headers.head_block_id().unwrap().unwrap();
    assert_eq!(h.headers.hash(head).unwrap().unwrap(), b2.hash());
    assert_eq!(h.headers.height(head).unwrap(), Some(2));

    for (block, height) in [(&b1, 1u32), (&b2, 2)] {
        let entry = h.utxo.find(&coinbase_outpoint(block)).unwrap().unwrap();
        assert_eq!(entry.height, height);
    }

    // Nothing left to assemble.
    let summary = h.assembler.run_pass().unwrap();
    assert_eq!(summary.blocks_processed, 0);
}
