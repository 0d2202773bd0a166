use basalt_patricia::{KeyHash, MemoryNodeStore, PatriciaTree, RootHash, ValueHash};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn tree_over(entries: &[(KeyHash, ValueHash)]) -> PatriciaTree<MemoryNodeStore> {
    let mut tree = PatriciaTree::new(MemoryNodeStore::new());
    for (key, value) in entries {
        tree.update(key, *value).unwrap();
    }
    tree
}

#[test]
fn thousand_random_keys_commit_to_the_same_root_in_any_order() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xba5a17);
    let mut entries: Vec<(KeyHash, ValueHash)> = (0..1000)
        .map(|_| {
            let key: [u8; 32] = rng.gen();
            let value: [u8; 32] = rng.gen();
            (KeyHash(key), ValueHash(value))
        })
        .collect();

    entries.shuffle(&mut rng);
    let first = tree_over(&entries);

    entries.shuffle(&mut rng);
    let second = tree_over(&entries);

    assert_ne!(first.root(), RootHash::EMPTY);
    assert_eq!(first.root(), second.root());

    let (probe_key, probe_value) = entries[0];
    assert_eq!(first.get(&probe_key).unwrap(), Some(probe_value));
    let proof = second.prove(&probe_key).unwrap();
    assert_eq!(proof.verify(first.root()).unwrap(), Some(probe_value));
}

#[test]
fn interleaved_removals_match_a_fresh_tree_over_the_survivors() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let entries: Vec<(KeyHash, ValueHash)> = (0..200)
        .map(|_| (KeyHash(rng.gen()), ValueHash(rng.gen())))
        .collect();

    let mut tree = tree_over(&entries);
    for (key, _) in &entries[100..] {
        tree.remove(key).unwrap();
    }

    let survivors = tree_over(&entries[..100]);
    assert_eq!(tree.root(), survivors.root());
}

proptest! {
    // The root commits to the final key/value set, whatever the update order.
    #[test]
    fn root_depends_only_on_the_final_set(
        tags in proptest::collection::btree_map(any::<u16>(), any::<u8>(), 1..64),
        seed in any::<u64>(),
    ) {
        let entries: Vec<(KeyHash, ValueHash)> = tags
            .iter()
            .map(|(tag, value)| (KeyHash::with(tag.to_le_bytes()), ValueHash::with([*value])))
            .collect();

        let mut shuffled = entries.clone();
        shuffled.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));

        prop_assert_eq!(tree_over(&entries).root(), tree_over(&shuffled).root());
    }
}
