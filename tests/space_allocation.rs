//! End-to-end allocation, release and reuse scenarios

use blockspace::{DataSpaceManager, SpaceConfig, SpaceError, SPACE_ID_DEFAULT, SPACE_ID_DIRECTORY, SPACE_ID_EMPTY};
use tempfile::TempDir;

const BLOCK: u64 = 64 * 1024;

fn config() -> SpaceConfig {
    SpaceConfig::default()
        .with_file_block_size(BLOCK as u32)
        .with_unit_size(64)
}

#[test]
fn test_first_allocation_gets_a_new_block() {
    let dir = TempDir::new().unwrap();
    let spaces = DataSpaceManager::create(dir.path().join("data.bsp"), &config()).unwrap();
    assert_eq!(spaces.units_per_block(), 1024);

    let position = spaces.get_file_position(4, 640).unwrap();
    assert_eq!(position, 2 * BLOCK);

    let entry = spaces.block_entry(2).unwrap().unwrap();
    assert_eq!(entry.space_id, 4);
    assert_eq!(entry.free_units, 1014);
    assert_eq!(entry.trailing_free_units, 1014);

    // The next allocation continues the cursor
    assert_eq!(spaces.get_file_position(4, 100).unwrap(), 2 * BLOCK + 640);
    assert_eq!(spaces.block_entry(2).unwrap().unwrap().free_units, 1012);
}

#[test]
fn test_released_block_becomes_empty_and_is_reused() {
    let dir = TempDir::new().unwrap();
    let spaces = DataSpaceManager::create(dir.path().join("data.bsp"), &config()).unwrap();

    let position = spaces.get_file_position(4, 640).unwrap();
    spaces.release(4, position, 640).unwrap();
    assert!(spaces.free_block_indices().is_empty());

    assert!(spaces.flush_table_space(4).unwrap());
    let entry = spaces.block_entry(2).unwrap().unwrap();
    assert_eq!(entry.space_id, SPACE_ID_EMPTY);
    assert_eq!(entry.free_units, 1024);
    assert_eq!(spaces.free_block_indices(), vec![2]);

    let size = spaces.file_free_pos();
    let reused = spaces.get_file_position(7, 640).unwrap();
    assert_eq!(reused, 2 * BLOCK);
    assert_eq!(spaces.file_free_pos(), size);
    assert_eq!(spaces.block_entry(2).unwrap().unwrap().space_id, 7);
    assert!(spaces.free_block_indices().is_empty());
}

#[test]
fn test_write_through_release_without_free_list() {
    let dir = TempDir::new().unwrap();
    let spaces = DataSpaceManager::create(
        dir.path().join("data.bsp"),
        &config().with_max_free_ranges(0),
    )
    .unwrap();

    let position = spaces.get_file_position(4, 640).unwrap();
    spaces.release(4, position, 640).unwrap();
    assert_eq!(spaces.free_block_indices(), vec![2]);
}

#[test]
fn test_state_survives_close_and_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.bsp");

    let (free, cursor, default_cursor) = {
        let spaces = DataSpaceManager::create(&path, &config()).unwrap();
        spaces.get_file_position(4, 640).unwrap();
        spaces.get_file_position(6, 640).unwrap();
        spaces.get_file_position(SPACE_ID_DEFAULT, 128).unwrap();
        spaces.free_table_space(6).unwrap();

        let free = spaces.free_block_indices();
        let cursor = spaces.table_space(4).unwrap().cursor;
        let default_cursor = spaces.table_space(SPACE_ID_DEFAULT).unwrap().cursor;
        spaces.close().unwrap();
        (free, cursor, default_cursor)
    };
    assert_eq!(free, vec![3]);

    let spaces = DataSpaceManager::open(&path, &config()).unwrap();
    assert_eq!(spaces.free_block_indices(), free);
    assert_eq!(spaces.get_table_space(4).unwrap().cursor, cursor);
    assert_eq!(spaces.table_space(SPACE_ID_DEFAULT).unwrap().cursor, default_cursor);
    assert!(spaces.check_directory_bitmaps().unwrap().is_empty());
    assert!(spaces.check_directory_spaces().unwrap().is_empty());
}

#[test]
fn test_whole_blocks_round_trip() {
    let dir = TempDir::new().unwrap();
    let spaces = DataSpaceManager::create(dir.path().join("data.bsp"), &config()).unwrap();

    let a = spaces.get_new_table_space_id();
    let start = spaces.get_file_blocks(a, 3).unwrap();
    let first = (start / BLOCK) as u32;
    for index in first..first + 3 {
        let entry = spaces.block_entry(index).unwrap().unwrap();
        assert_eq!(entry.space_id, a);
        assert_eq!(entry.free_units, 0);
    }

    spaces.free_table_space(a).unwrap();
    assert_eq!(spaces.free_block_indices(), vec![first, first + 1, first + 2]);

    let size = spaces.file_free_pos();
    let b = spaces.get_new_table_space_id();
    assert_eq!(spaces.get_file_blocks(b, 2).unwrap(), start);
    assert_eq!(spaces.free_block_indices(), vec![first + 2]);

    // A longer run than any free one extends the file
    let c = spaces.get_new_table_space_id();
    let extended = spaces.get_file_blocks(c, 2).unwrap();
    assert_eq!(extended, size);
    assert_eq!(spaces.file_free_pos(), size + 2 * BLOCK);
    assert_eq!(spaces.free_block_indices(), vec![first + 2]);
}

#[test]
fn test_free_table_space_edge_cases() {
    let dir = TempDir::new().unwrap();
    let spaces = DataSpaceManager::create(dir.path().join("data.bsp"), &config()).unwrap();

    assert!(matches!(
        spaces.free_table_space(SPACE_ID_EMPTY),
        Err(SpaceError::InvalidSpaceId(0))
    ));
    assert!(spaces.free_table_space(-1).is_err());

    // Reserved spaces are never dropped
    spaces.free_table_space(SPACE_ID_DIRECTORY).unwrap();
    spaces.free_table_space(SPACE_ID_DEFAULT).unwrap();
    assert_eq!(spaces.block_entry(0).unwrap().unwrap().space_id, SPACE_ID_DEFAULT);
    assert_eq!(spaces.block_entry(1).unwrap().unwrap().space_id, SPACE_ID_DIRECTORY);

    // Unknown space: nothing to do, twice
    spaces.free_table_space(40).unwrap();
    spaces.free_table_space(40).unwrap();
    assert!(spaces.free_block_indices().is_empty());
}

#[test]
fn test_space_id_validation_and_sequence() {
    let dir = TempDir::new().unwrap();
    let spaces = DataSpaceManager::create(dir.path().join("data.bsp"), &config()).unwrap();

    assert_eq!(spaces.get_new_table_space_id(), 4);
    assert_eq!(spaces.get_new_table_space_id(), 6);

    assert!(matches!(
        spaces.get_file_position(SPACE_ID_DIRECTORY, 64),
        Err(SpaceError::InvalidSpaceId(1))
    ));
    assert!(matches!(
        spaces.release(0, 4096, 64),
        Err(SpaceError::InvalidSpaceId(0))
    ));

    // Using an id directly moves the sequence past it
    spaces.get_file_position(13, 64).unwrap();
    assert_eq!(spaces.get_new_table_space_id(), 14);
}

#[test]
fn test_default_space_uses_first_block() {
    let dir = TempDir::new().unwrap();
    let spaces = DataSpaceManager::create(dir.path().join("data.bsp"), &config()).unwrap();

    let position = spaces.get_file_position(SPACE_ID_DEFAULT, 64).unwrap();
    assert_eq!(position, 4096);
    assert_eq!(spaces.file_free_pos(), 2 * BLOCK);
}

#[test]
fn test_invalid_geometry_is_rejected() {
    let dir = TempDir::new().unwrap();
    let result = DataSpaceManager::create(
        dir.path().join("data.bsp"),
        &config().with_unit_size(48),
    );
    assert!(matches!(result, Err(SpaceError::InvalidConfig(_))));
}

#[test]
fn test_open_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        DataSpaceManager::open(dir.path().join("missing.bsp"), &config()),
        Err(SpaceError::Io(_))
    ));
}

#[test]
fn test_config_from_toml() {
    let config = SpaceConfig::from_toml_str(
        r#"
        file_block_size = 65536
        unit_size = 64
        max_free_ranges = 4
        "#,
    )
    .unwrap();

    let dir = TempDir::new().unwrap();
    let spaces = DataSpaceManager::create(dir.path().join("data.bsp"), &config).unwrap();
    assert_eq!(spaces.units_per_block(), 1024);
    assert_eq!(spaces.get_table_space(4).unwrap().pending_ranges, 0);
}
