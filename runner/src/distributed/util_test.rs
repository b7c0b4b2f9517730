use super::util::{env_usize, round_robin};

#[test]
pub fn round_robin_partitions_exactly() {
    for len in 0..25usize {
        for nodes in 1..7usize {
            let items = (0..len).collect::<Vec<_>>();
            let shards = (0..nodes)
                .map(|rank| round_robin(items.clone(), rank, nodes))
                .collect::<Vec<_>>();

            assert_eq!(shards.iter().map(Vec::len).sum::<usize>(), len);

            // element i sits in shard i % nodes at position i / nodes
            for item in items.iter() {
                assert_eq!(shards[item % nodes][item / nodes], *item);
            }
        }
    }
}

#[test]
pub fn round_robin_takes_every_nth() {
    let items = vec!["a", "b", "c", "d", "e"];

    assert_eq!(round_robin(items.clone(), 0, 2), vec!["a", "c", "e"]);
    assert_eq!(round_robin(items.clone(), 1, 2), vec!["b", "d"]);
    assert_eq!(round_robin(items.clone(), 4, 5), vec!["e"]);
    assert_eq!(round_robin(items, 0, 1), vec!["a", "b", "c", "d", "e"]);
}

#[test]
pub fn env_usize_skips_missing_variables() {
    assert_eq!(env_usize(&["STAGESWEEP_TEST_NEVER_SET_VARIABLE"]), None);
    assert_eq!(env_usize(&[]), None);
}
