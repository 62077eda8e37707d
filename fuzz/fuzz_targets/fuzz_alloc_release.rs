#![no_main]
use blockspace::{DataSpaceManager, SpaceConfig};
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};

#[derive(Debug, Arbitrary)]
enum SpaceOp {
    Alloc { space: u8, size: u16 },
    Release { pick: u16 },
    Blocks { space: u8, count: u8 },
    Flush { space: u8 },
    Drop { space: u8 },
}

fn space_id(selector: u8) -> i32 {
    4 + 2 * (selector % 4) as i32
}

// Random operation sequences must never produce overlapping live ranges or
// an inconsistent directory
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<SpaceOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };
    let max_free_ranges = match u.int_in_range(0..=3u8) {
        Ok(n) => n as usize * 4,
        Err(_) => 0,
    };

    let dir = match tempfile::TempDir::new() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let config = SpaceConfig::default()
        .with_file_block_size(4096)
        .with_unit_size(32)
        .with_directory_capacity(8)
        .with_root_capacity(512)
        .with_max_free_ranges(max_free_ranges);
    let spaces = match DataSpaceManager::create(dir.path().join("fuzz.bsp"), &config) {
        Ok(spaces) => spaces,
        Err(_) => return,
    };

    let mut live: Vec<(i32, u64, u64)> = Vec::new();
    for op in ops.into_iter().take(256) {
        match op {
            SpaceOp::Alloc { space, size } => {
                let space = space_id(space);
                let position = spaces.get_file_position(space, size as u64).unwrap();
                live.push((space, position, size as u64));
            }
            SpaceOp::Release { pick } => {
                if !live.is_empty() {
                    let (space, position, size) = live.swap_remove(pick as usize % live.len());
                    spaces.release(space, position, size).unwrap();
                }
            }
            SpaceOp::Blocks { space, count } => {
                let space = space_id(space);
                let count = count % 4 + 1;
                let position = spaces.get_file_blocks(space, count as u32).unwrap();
                live.push((space, position, count as u64 * 4096));
            }
            SpaceOp::Flush { space } => {
                spaces.flush_table_space(space_id(space)).unwrap();
            }
            SpaceOp::Drop { space } => {
                let space = space_id(space);
                spaces.free_table_space(space).unwrap();
                live.retain(|&(owner, _, _)| owner != space);
            }
        }
    }

    let mut ranges: Vec<(u64, u64)> = live
        .iter()
        .map(|&(_, position, size)| (position, position + (size.max(1) + 31) / 32 * 32))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping ranges {:?}", pair);
    }

    assert!(spaces.check_directory_bitmaps().unwrap().is_empty());
    assert!(spaces.check_directory_spaces().unwrap().is_empty());
});
