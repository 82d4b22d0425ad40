use crate::config::{BRANCH_BITS, COORD_MAX, LEAF_SIZE, MAX_RANGE_QUERY_SIZE};
use crate::geometry::{BoundingBox, Coord, Metric, Point};
use crate::heap::{assert_nearest, BoundedHeap, Scored};
use crate::morton::{check_match, coord_to_key, next_branch, prune_tail, split};
use crate::node::{NodeKind, NodeRef};
use crate::storage::{TrieStorage, ROOT};
use crate::{Config, Coordinator};

use proptest::prelude::*;
use std::collections::HashMap;

/// Check the structure below branch `idx` and return its point count.
fn validate_branch(s: &TrieStorage, idx: u32) -> usize {
    let b = s.load_branch(idx).unwrap();
    assert_eq!(b.height % BRANCH_BITS, 0, "branch {idx} height {} not whole levels", b.height);
    assert_eq!(prune_tail(b.key, b.height), b.key, "branch {idx} key has bits below its height");

    let mut points = 0usize;
    for (slot, child) in b.children.iter().enumerate() {
        match child.kind() {
            None => {}
            Some(NodeKind::Branch) => {
                let c = s.load_branch(child.index()).unwrap();
                assert_eq!(c.parent, Some(idx), "branch back-reference");
                assert!(c.height > b.height, "child branch must be deeper");
                assert!(check_match(c.key, b.key, b.height), "child prefix must extend parent");
                assert_eq!(next_branch(c.key, b.height), slot, "child branch in wrong slot");
                assert!(c.bbox.is_within(&b.bbox), "child box escapes parent box");
                points += validate_branch(s, child.index());
            }
            Some(NodeKind::Leaf) => {
                let l = s.load_leaf(child.index()).unwrap();
                assert_eq!(l.parent, Some(idx), "leaf back-reference");
                assert!((1..=LEAF_SIZE).contains(&l.len), "leaf holds {} points", l.len);
                assert!(l.height >= b.height);
                assert!(l.bbox.is_within(&b.bbox), "leaf box escapes parent box");
                for p in l.points() {
                    assert_eq!(p.key, coord_to_key(&p.coord));
                    assert!(check_match(p.key, b.key, b.height));
                    assert_eq!(next_branch(p.key, b.height), slot, "point in wrong slot");
                    assert!(check_match(p.key, l.key, l.height), "point outside leaf prefix");
                    assert!(l.bbox.contains_point(&p.coord));
                }
                points += l.len;
            }
        }
    }

    if points < MAX_RANGE_QUERY_SIZE as usize {
        assert_eq!(b.subtree_size, points as i64, "small subtree count must be exact");
    } else {
        assert!(b.subtree_size <= points as i64, "subtree count overshoots");
    }
    points
}

fn validate_trie(s: &TrieStorage) -> usize {
    let root = s.load_branch(ROOT).unwrap();
    assert_eq!(root.height, 0);
    assert_eq!(root.parent, None);
    assert_eq!(root.bbox, BoundingBox::domain());
    validate_branch(s, ROOT)
}

/// One search round, then one insert per target, the way a shard sees it.
fn insert_round(s: &TrieStorage, coords: &[Coord]) {
    let mut points: Vec<Point> = coords.iter().map(|c| Point::new(*c)).collect();
    points.sort_by_key(|p| p.key);
    let targets: Vec<NodeRef> = points.iter().map(|p| s.locate(p.key, true).unwrap()).collect();
    let mut groups: Vec<(NodeRef, Vec<Point>)> = Vec::new();
    let mut index: HashMap<NodeRef, usize> = HashMap::new();
    for (p, t) in points.iter().zip(targets) {
        let g = *index.entry(t).or_insert_with(|| {
            groups.push((t, Vec::new()));
            groups.len() - 1
        });
        groups[g].1.push(*p);
    }
    for (target, group) in groups {
        s.insert_batch(target, &group).unwrap();
    }
}

fn ranked(coords: &[Coord], center: &Coord, metric: Metric) -> Vec<Scored<Point>> {
    let mut all: Vec<Scored<Point>> = coords
        .iter()
        .map(|c| Scored {
            distance: metric.distance(c, center),
            item: Point::new(*c),
        })
        .collect();
    all.sort();
    all
}

fn coord_strategy() -> impl Strategy<Value = Coord> + Clone {
    prop::array::uniform3(0..=COORD_MAX)
}

/// Points packed into a small cube, so keys share long prefixes.
fn clustered_strategy(max: usize) -> impl Strategy<Value = Vec<Coord>> {
    (0..=COORD_MAX - (1 << 18)).prop_flat_map(move |base| {
        prop::collection::vec(
            prop::array::uniform3(0i64..1 << 18).prop_map(move |o| [base + o[0], base + o[1], base + o[2]]),
            0..=max,
        )
    })
}

fn box_strategy() -> impl Strategy<Value = BoundingBox> {
    (coord_strategy(), coord_strategy()).prop_map(|(a, b)| BoundingBox::new(a, b))
}

fn metric_strategy() -> impl Strategy<Value = Metric> {
    prop_oneof![
        Just(Metric::Chebyshev),
        Just(Metric::Manhattan),
        Just(Metric::SquaredEuclidean),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_trie_invariants(
        batches in prop::collection::vec(prop::collection::vec(coord_strategy(), 0..=300), 1..=4),
        cluster in clustered_strategy(400),
    ) {
        let s = TrieStorage::new(0, 1 << 12, 1 << 14).unwrap();
        let mut total = 0;
        for batch in batches.iter().chain(std::iter::once(&cluster)) {
            insert_round(&s, batch);
            total += batch.len();
            prop_assert_eq!(validate_trie(&s), total);
        }
        for c in batches.iter().flatten().chain(&cluster) {
            let key = coord_to_key(c);
            let node = s.locate(key, true).unwrap();
            prop_assert!(node.is_leaf());
            let leaf = s.leaf_meta(node.index()).unwrap();
            prop_assert!(check_match(key, leaf.key, leaf.height));
            prop_assert_eq!(s.key_search(key).unwrap(), Some(key));
        }
    }

    #[test]
    fn prop_box_queries_match_brute_force(
        coords in prop::collection::vec(coord_strategy(), 0..=800),
        cluster in clustered_strategy(300),
        boxes in prop::collection::vec(box_strategy(), 1..=20),
    ) {
        let s = TrieStorage::new(0, 1 << 12, 1 << 14).unwrap();
        insert_round(&s, &coords);
        insert_round(&s, &cluster);
        let all: Vec<Coord> = coords.iter().chain(&cluster).copied().collect();
        for q in &boxes {
            let expected = all.iter().filter(|c| q.contains_point(c)).count();
            prop_assert_eq!(s.box_count(q).unwrap(), expected as u64);
            let mut got: Vec<Coord> = s.box_fetch(q, usize::MAX).unwrap().points.iter().map(|p| p.coord).collect();
            let mut want: Vec<Coord> = all.iter().filter(|c| q.contains_point(c)).copied().collect();
            got.sort();
            want.sort();
            prop_assert_eq!(got, want);
        }
    }

    #[test]
    fn prop_split_covers_box(q in box_strategy(), probes in prop::collection::vec(prop::array::uniform3(0.0f64..=1.0), 1..=64)) {
        let (key_min, key_max) = q.key_range();
        let (litmax, bigmin) = split(key_min, key_max);
        prop_assert!(key_min <= litmax && bigmin <= key_max);
        if key_min != key_max {
            prop_assert!(litmax < bigmin);
        }
        for t in probes {
            let p: Coord = std::array::from_fn(|d| {
                q.min[d] + ((q.max[d] - q.min[d]) as f64 * t[d]) as i64
            });
            let key = coord_to_key(&p);
            prop_assert!(key <= litmax || key >= bigmin, "key {key:#x} falls in the gap");
        }
    }

    #[test]
    fn prop_heap_keeps_smallest(entries in prop::collection::vec((0i64..1_000, any::<u32>()), 0..=200), cap in 0usize..=40) {
        let mut heap = BoundedHeap::new(cap);
        for (d, v) in &entries {
            heap.enqueue(*d, *v);
            prop_assert!(heap.len() <= cap);
        }
        let mut ranked: Vec<Scored<u32>> = entries.iter().map(|&(distance, item)| Scored { distance, item }).collect();
        ranked.sort();
        assert_nearest(&heap.into_sorted_vec(), &ranked, cap);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_sharded_knn_matches_brute_force(
        shards in 1usize..=9,
        metric in metric_strategy(),
        coords in prop::collection::vec(coord_strategy(), 1..=600),
        cluster in clustered_strategy(200),
        centers in prop::collection::vec(coord_strategy(), 1..=10),
        k in 1usize..=20,
    ) {
        let config = Config::default()
            .with_shards(shards)
            .with_workers(2)
            .with_capacity(1 << 11, 1 << 12)
            .with_metric(metric);
        let index = Coordinator::new(config).unwrap();
        index.insert(&coords).unwrap();
        index.insert(&cluster).unwrap();
        let all: Vec<Coord> = coords.iter().chain(&cluster).copied().collect();
        let mut queries = centers.clone();
        queries.extend(cluster.first().copied());
        let found = index.knn(&queries, k).unwrap();
        for (center, got) in queries.iter().zip(found) {
            assert_nearest(&got, &ranked(&all, center, metric), k);
        }
    }
}

/// Visit every insert order of `coords`, swapping in place between visits.
fn each_insert_order(coords: &[Coord], mut visit: impl FnMut(&[Coord])) {
    let mut order = coords.to_vec();
    let mut swaps = vec![0usize; order.len()];
    visit(&order);
    let mut i = 1;
    while i < order.len() {
        if swaps[i] < i {
            let j = if i % 2 == 0 { 0 } else { swaps[i] };
            order.swap(j, i);
            visit(&order);
            swaps[i] += 1;
            i = 1;
        } else {
            swaps[i] = 0;
            i += 1;
        }
    }
}

#[test]
fn exhaustive_insert_order_small_set() {
    let top = 1i64 << 30;
    let coords: Vec<Coord> = vec![
        [1, 1, 1],
        [1, 1, 2],
        [5, 5, 5],
        [top, 0, 0],
        [top, top, top],
        [top + (1 << 12), top, top],
    ];

    let mut orders = 0;
    each_insert_order(&coords, |order| {
        orders += 1;
        let s = TrieStorage::new(0, 64, 64).unwrap();
        for c in order {
            insert_round(&s, std::slice::from_ref(c));
        }
        assert_eq!(validate_trie(&s), coords.len());
        let near = BoundingBox::new([0, 0, 0], [2, 2, 2]);
        assert_eq!(s.box_count(&near).unwrap(), 2);

        // The two close points share a leaf.
        let a = s.locate(coord_to_key(&[1, 1, 1]), true).unwrap();
        let b = s.locate(coord_to_key(&[1, 1, 2]), true).unwrap();
        assert!(a.is_leaf() && a.same_node(b));
    });
    assert_eq!(orders, 720);
}

#[test]
fn exhaustive_batch_splits_small_set() {
    // Every way to cut a fixed key-sorted run into two consecutive rounds.
    let coords: Vec<Coord> = (0..40i64).map(|i| [i << 14, (i % 3) << 20, 0]).collect();
    for cut in 0..=coords.len() {
        let s = TrieStorage::new(0, 64, 64).unwrap();
        insert_round(&s, &coords[..cut]);
        insert_round(&s, &coords[cut..]);
        assert_eq!(validate_trie(&s), coords.len());
        assert_eq!(s.box_count(&BoundingBox::domain()).unwrap(), coords.len() as u64);
    }
}
