#![no_main]
use blockspace::{DataSpaceManager, SpaceConfig};
use libfuzzer_sys::fuzz_target;
use std::io::{Seek, SeekFrom, Write};

// Damaged directory bytes must surface as errors, never as panics
fuzz_target!(|input: &[u8]| {
    if input.len() < 4 {
        return;
    }

    let dir = match tempfile::TempDir::new() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let path = dir.path().join("fuzz.bsp");
    let config = SpaceConfig::default()
        .with_file_block_size(4096)
        .with_unit_size(32)
        .with_directory_capacity(8)
        .with_root_capacity(64);

    {
        let spaces = match DataSpaceManager::create(&path, &config) {
            Ok(spaces) => spaces,
            Err(_) => return,
        };
        for space in [4, 6] {
            let _ = spaces.get_file_position(space, 700);
        }
        let _ = spaces.close();
    }

    // Splice the input over the directory block
    let offset = 4096 + u16::from_le_bytes([input[0], input[1]]) as u64 % 4096;
    if let Ok(mut file) = std::fs::OpenOptions::new().write(true).open(&path) {
        let _ = file.seek(SeekFrom::Start(offset));
        let _ = file.write_all(&input[2..]);
    }

    if let Ok(spaces) = DataSpaceManager::open(&path, &config) {
        let _ = spaces.check_directory_spaces();
        let _ = spaces.check_directory_bitmaps();
        let _ = spaces.stats();
        let _ = spaces.close();
    }
});
