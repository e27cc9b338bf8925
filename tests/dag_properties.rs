mod common;

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use common::TestDag;
use phantomdag::{DagParams, ErrorCode, Hash};

/// A random DAG: most blocks merge a few tips, some fork off an older block.
fn random_dag(t: &TestDag, seed: u64, blocks: usize) -> Vec<Hash> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut all = vec![t.genesis()];
    for _ in 0..blocks {
        let parents = if rng.gen_bool(0.2) {
            vec![*all.choose(&mut rng).unwrap()]
        } else {
            let tips = t.dag.tip_hashes();
            let count = rng.gen_range(1..=tips.len().min(3));
            tips.choose_multiple(&mut rng, count).copied().collect()
        };
        let mut parents = parents;
        parents.sort();
        all.push(t.add_block(&parents, Vec::new()));
    }
    all
}

fn check_invariants(t: &TestDag, all: &[Hash]) {
    let genesis = t.genesis();
    for hash in all {
        let parents = t.dag.header_by_hash(hash).unwrap().parent_hashes;
        if *hash == genesis {
            assert!(parents.is_empty());
            assert_eq!(t.dag.blue_score_by_hash(hash), Some(0));
            continue;
        }

        for parent in &parents {
            assert!(t.dag.is_ancestor_of(parent, hash).unwrap());
            assert!(!t.dag.is_ancestor_of(hash, parent).unwrap());
            assert!(t.dag.children_of(parent).unwrap().contains(hash));
        }

        // heaviest parent, ties to the smaller hash
        let selected = t.dag.selected_parent_of(hash).unwrap();
        let best = parents
            .iter()
            .copied()
            .max_by(|a, b| {
                let (sa, sb) = (t.dag.blue_score_by_hash(a).unwrap(), t.dag.blue_score_by_hash(b).unwrap());
                sa.cmp(&sb).then(b.cmp(a))
            })
            .unwrap();
        assert_eq!(selected, best);

        let blues = t.dag.blues_of(hash).unwrap();
        assert_eq!(blues[0], selected);
        assert_eq!(
            t.dag.blue_score_by_hash(hash).unwrap(),
            t.dag.blue_score_by_hash(&selected).unwrap() + blues.len() as u64
        );
        assert!(blues.len() <= t.params.k as usize + 1);
    }

    // the selected chain runs from the selected tip down to genesis
    let mut seen = HashSet::new();
    let mut current = t.dag.selected_tip_hash();
    while let Some(parent) = t.dag.selected_parent_of(&current) {
        assert!(t.dag.is_in_selected_parent_chain(&current));
        assert!(seen.insert(current));
        current = parent;
    }
    assert_eq!(current, genesis);

    let tips = t.dag.tip_hashes();
    for tip in &tips {
        assert!(t.dag.children_of(tip).unwrap().is_empty());
    }
    assert_eq!(t.dag.block_count(), all.len() as u64);
    assert_eq!(t.dag.utxo_commitment(), t.dag.utxo_snapshot().multiset().hash());
}

#[test]
fn test_random_dag_invariants() {
    for seed in 0..3 {
        let t = TestDag::simnet();
        let all = random_dag(&t, seed, 40);
        check_invariants(&t, &all);
    }
}

#[test]
fn test_random_dag_small_k() {
    let mut params = DagParams::simnet();
    params.k = 2;
    let t = TestDag::with_params(params);
    let all = random_dag(&t, 7, 40);
    check_invariants(&t, &all);
}

#[test]
fn test_reprocessing_is_rejected() {
    let t = TestDag::simnet();
    let all = random_dag(&t, 11, 15);
    let commitment = t.dag.utxo_commitment();
    let tips = t.dag.tip_hashes();

    for hash in all.iter().skip(1) {
        let block = t.dag.block_by_hash(hash).unwrap().unwrap();
        let err = t.process(block).unwrap_err();
        assert_eq!(err.rule_code(), Some(ErrorCode::DuplicateBlock));
    }
    assert_eq!(t.dag.utxo_commitment(), commitment);
    assert_eq!(t.dag.tip_hashes(), tips);
}

#[test]
fn test_subsidy_supply_matches_utxo() {
    let t = TestDag::simnet();
    let all = random_dag(&t, 3, 25);

    // every coinbase output in the virtual utxo pays one accepted blue
    let supply: u64 = t.dag.utxo_snapshot().iter().map(|(_, entry)| entry.amount).sum();
    let minted = supply / t.params.subsidy(0);
    assert_eq!(supply % t.params.subsidy(0), 0);
    assert!(minted as usize <= all.len());
}
