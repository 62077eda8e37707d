//! Concurrent allocation stress tests

use blockspace::{DataSpaceManager, SpaceConfig};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const BLOCK: u64 = 16 * 1024;

fn config() -> SpaceConfig {
    SpaceConfig::default()
        .with_file_block_size(BLOCK as u32)
        .with_unit_size(64)
        .with_directory_capacity(32)
        .with_max_free_ranges(8)
}

fn assert_disjoint(mut ranges: Vec<(u64, u64)>) {
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping ranges {:?}", pair);
    }
}

#[test]
fn test_8_threads_allocating_and_releasing() {
    let dir = TempDir::new().unwrap();
    let spaces = Arc::new(DataSpaceManager::create(dir.path().join("data.bsp"), &config()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let spaces = Arc::clone(&spaces);
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let space = spaces.get_new_table_space_id();
                let mut kept = Vec::new();

                for i in 0..200 {
                    let size = rng.gen_range(1..2 * BLOCK);
                    let position = spaces.get_file_position(space, size).unwrap();

                    if i % 2 == 0 {
                        spaces.release(space, position, size).unwrap();
                    } else {
                        kept.push((space, position, size));
                    }
                }
                kept
            })
        })
        .collect();

    let mut live = Vec::new();
    for handle in handles {
        live.extend(handle.join().unwrap());
    }

    assert_disjoint(
        live.iter()
            .map(|&(_, position, size)| (position, position + (size + 63) / 64 * 64))
            .collect(),
    );

    for &(space, position, _) in &live {
        let entry = spaces.block_entry((position / BLOCK) as u32).unwrap().unwrap();
        assert_eq!(entry.space_id, space);
    }

    assert!(spaces.check_directory_bitmaps().unwrap().is_empty());
    assert!(spaces.check_directory_spaces().unwrap().is_empty());
}

#[test]
fn test_concurrent_drop_and_reuse() {
    let dir = TempDir::new().unwrap();
    let spaces = Arc::new(DataSpaceManager::create(dir.path().join("data.bsp"), &config()).unwrap());
    let dropped = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let spaces = Arc::clone(&spaces);
            let dropped = Arc::clone(&dropped);
            std::thread::spawn(move || {
                for _ in 0..20 {
                    let space = spaces.get_new_table_space_id();
                    let blocks = rand::random::<u32>() % 3 + 1;
                    spaces.get_file_blocks(space, blocks).unwrap();
                    spaces.get_file_position(space, 100).unwrap();
                    spaces.free_table_space(space).unwrap();
                    dropped.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 80);

    // Every table block was handed back
    let stats = spaces.stats().unwrap();
    assert_eq!(stats.blocks_per_space.len(), 1);
    assert_eq!(stats.empty_blocks as usize, spaces.free_block_indices().len());
    assert!(stats.empty_blocks > 0);
}

#[test]
fn test_new_space_ids_are_unique_across_threads() {
    let dir = TempDir::new().unwrap();
    let spaces = Arc::new(DataSpaceManager::create(dir.path().join("data.bsp"), &config()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let spaces = Arc::clone(&spaces);
            std::thread::spawn(move || {
                (0..100)
                    .map(|_| spaces.get_new_table_space_id())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids: Vec<i32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 800);
    assert!(ids.iter().all(|id| id % 2 == 0 && *id >= 4));
}
