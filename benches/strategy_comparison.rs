//! Comparison benchmarks: lock-coupling single operations vs batch
//! rounds vs `Mutex<BTreeMap>`.
//!
//! The global-mutex map is the baseline a concurrent B+ tree has to
//! beat; the two native strategies are measured over the same shuffled
//! key sets so ordering effects cannot favour either side.
//!
//! Run with: `cargo bench --bench strategy_comparison`

#![expect(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use divan::{black_box, Bencher};
use palmtree::{BpTree, Key, Query};
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn main() {
    divan::main();
}

const N: usize = 20_000;
const THREADS: &[usize] = &[1, 2, 4, 8];

fn shuffled_keys(n: usize, seed: u64) -> Vec<Key> {
    let mut keys: Vec<Key> = (0..u64::try_from(n).unwrap()).collect();
    keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
    keys
}

fn stripe(keys: &[Key], threads: usize, index: usize) -> impl Iterator<Item = Key> + '_ {
    keys.iter().skip(index).step_by(threads).copied()
}

// =============================================================================
// 01: INSERT THROUGHPUT
// =============================================================================

#[divan::bench_group(name = "01_insert")]
mod insert {
    use super::*;

    #[divan::bench(args = THREADS)]
    fn lock_coupling(bencher: Bencher, threads: usize) {
        let keys = shuffled_keys(N, 1);
        bencher.bench_local(|| {
            let tree = BpTree::new();
            std::thread::scope(|s| {
                for t in 0..threads {
                    let tree = &tree;
                    let keys = &keys;
                    s.spawn(move || {
                        for k in stripe(keys, threads, t) {
                            tree.insert(k, &k.to_be_bytes()).unwrap();
                        }
                    });
                }
            });
            black_box(tree.len())
        });
    }

    #[divan::bench(args = THREADS)]
    fn batch_round(bencher: Bencher, threads: usize) {
        let keys = shuffled_keys(N, 1);
        bencher.bench_local(|| {
            let mut tree = BpTree::new();
            let mut batch: Vec<Query> = keys
                .iter()
                .map(|&k| Query::insert(k, k.to_be_bytes()))
                .collect();
            tree.palm(&mut batch, threads).unwrap();
            black_box(tree.len())
        });
    }

    #[divan::bench(args = THREADS)]
    fn mutex_btreemap(bencher: Bencher, threads: usize) {
        let keys = shuffled_keys(N, 1);
        bencher.bench_local(|| {
            let map = Mutex::new(BTreeMap::new());
            std::thread::scope(|s| {
                for t in 0..threads {
                    let map = &map;
                    let keys = &keys;
                    s.spawn(move || {
                        for k in stripe(keys, threads, t) {
                            map.lock().unwrap().insert(k, k.to_be_bytes());
                        }
                    });
                }
            });
            black_box(map.lock().unwrap().len())
        });
    }
}

// =============================================================================
// 02: FIND THROUGHPUT ON A PREBUILT TREE
// =============================================================================

#[divan::bench_group(name = "02_find")]
mod find {
    use super::*;

    #[divan::bench(args = THREADS)]
    fn lock_coupling(bencher: Bencher, threads: usize) {
        let keys = shuffled_keys(N, 2);
        let tree = BpTree::new();
        for &k in &keys {
            tree.insert(k, &k.to_be_bytes()).unwrap();
        }
        bencher.bench_local(|| {
            std::thread::scope(|s| {
                for t in 0..threads {
                    let tree = &tree;
                    let keys = &keys;
                    s.spawn(move || {
                        let mut hits = 0usize;
                        for k in stripe(keys, threads, t) {
                            if tree.find(k).is_ok() {
                                hits += 1;
                            }
                        }
                        black_box(hits)
                    });
                }
            });
        });
    }

    #[divan::bench(args = THREADS)]
    fn batch_round(bencher: Bencher, threads: usize) {
        let keys = shuffled_keys(N, 2);
        let mut tree = BpTree::new();
        for &k in &keys {
            tree.insert(k, &k.to_be_bytes()).unwrap();
        }
        bencher.bench_local(|| {
            let mut batch: Vec<Query> = keys.iter().map(|&k| Query::find(k)).collect();
            let results = tree.palm(&mut batch, threads).unwrap();
            black_box(results.iter().map(Vec::len).sum::<usize>())
        });
    }

    #[divan::bench(args = THREADS)]
    fn mutex_btreemap(bencher: Bencher, threads: usize) {
        let keys = shuffled_keys(N, 2);
        let map = Mutex::new(BTreeMap::new());
        for &k in &keys {
            map.lock().unwrap().insert(k, k.to_be_bytes());
        }
        bencher.bench_local(|| {
            std::thread::scope(|s| {
                for t in 0..threads {
                    let map = &map;
                    let keys = &keys;
                    s.spawn(move || {
                        let mut hits = 0usize;
                        for k in stripe(keys, threads, t) {
                            if map.lock().unwrap().contains_key(&k) {
                                hits += 1;
                            }
                        }
                        black_box(hits)
                    });
                }
            });
        });
    }
}

// =============================================================================
// 03: MIXED WORKLOAD
// =============================================================================

#[divan::bench_group(name = "03_mixed")]
mod mixed {
    use super::*;

    fn mixed_queries(keys: &[Key]) -> Vec<Query> {
        keys.iter()
            .enumerate()
            .map(|(i, &k)| match i % 4 {
                0 => Query::delete(k),
                1 | 2 => Query::insert(k, k.to_be_bytes()),
                _ => Query::find(k),
            })
            .collect()
    }

    #[divan::bench(args = THREADS)]
    fn lock_coupling(bencher: Bencher, threads: usize) {
        let keys = shuffled_keys(N, 3);
        bencher.bench_local(|| {
            let tree = BpTree::new();
            for &k in keys.iter().take(N / 2) {
                tree.insert(k, &k.to_be_bytes()).unwrap();
            }
            std::thread::scope(|s| {
                for t in 0..threads {
                    let tree = &tree;
                    let keys = &keys;
                    s.spawn(move || {
                        for (i, k) in stripe(keys, threads, t).enumerate() {
                            match i % 4 {
                                0 => {
                                    tree.delete(k).unwrap();
                                }
                                1 | 2 => {
                                    tree.insert(k, &k.to_be_bytes()).unwrap();
                                }
                                _ => {
                                    let _ = tree.find(k);
                                }
                            }
                        }
                    });
                }
            });
            black_box(tree.len())
        });
    }

    #[divan::bench(args = THREADS)]
    fn batch_round(bencher: Bencher, threads: usize) {
        let keys = shuffled_keys(N, 3);
        bencher.bench_local(|| {
            let mut tree = BpTree::new();
            for &k in keys.iter().take(N / 2) {
                tree.insert(k, &k.to_be_bytes()).unwrap();
            }
            let mut batch = mixed_queries(&keys);
            tree.palm(&mut batch, threads).unwrap();
            black_box(tree.len())
        });
    }
}
