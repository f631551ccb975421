//! Tests for WAL replay
//!
//! These tests verify:
//! - Checksum mismatches abort replay under every policy
//! - Torn tails fail under Strict and are cut back under TruncateTorn
//! - A torn record followed by more data is never truncated
//! - LSNs must strictly increase across segments

use std::fs::{self, OpenOptions};
use std::io::Write;

use shardkv::config::ReplayPolicy;
use shardkv::error::KvError;
use shardkv::protocol::Command;
use shardkv::wal::{
    list_segments, replay_segments, segment_path, ReadFault, SegmentReader, Wal, HEADER_SIZE,
};

use super::{collect, open_wal, set_commands, setup_temp_dir, wal_config};

const LARGE: u64 = 16 * 1024 * 1024;

// =============================================================================
// Helper Functions
// =============================================================================

fn write_commands(dir: &std::path::PathBuf, commands: &[Command]) {
    let wal = open_wal(dir, wal_config(LARGE, ReplayPolicy::Strict));
    for cmd in commands {
        wal.log_command(cmd).unwrap();
    }
    wal.close().unwrap();
}

fn replay(dir: &std::path::Path, policy: ReplayPolicy) -> shardkv::Result<(Vec<Command>, shardkv::wal::ReplayStats)> {
    let mut commands = Vec::new();
    let stats = replay_segments(dir, policy, &mut |_, cmd| {
        commands.push(cmd);
        Ok(())
    })?;
    Ok((commands, stats))
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_checksum_mismatch_is_fatal() {
    let (_temp, dir) = setup_temp_dir();
    write_commands(&dir, &set_commands(0..3));

    let path = segment_path(&dir, 1);
    let mut bytes = fs::read(&path).unwrap();
    bytes[HEADER_SIZE + 2] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    for policy in [ReplayPolicy::Strict, ReplayPolicy::TruncateTorn] {
        let err = replay(&dir, policy).unwrap_err();
        assert!(matches!(err, KvError::WalCorruption(_)), "{:?}", err);
    }
}

#[test]
fn test_corruption_in_later_record_stops_replay() {
    let (_temp, dir) = setup_temp_dir();
    let commands = set_commands(0..3);
    write_commands(&dir, &commands);

    let path = segment_path(&dir, 1);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    let mut seen = 0;
    let err = replay_segments(&dir, ReplayPolicy::Strict, &mut |_, _| {
        seen += 1;
        Ok(())
    })
    .unwrap_err();
    assert!(matches!(err, KvError::WalCorruption(_)));
    assert_eq!(seen, 2);
}

// =============================================================================
// Torn Tail Tests
// =============================================================================

#[test]
fn test_torn_tail_fails_under_strict() {
    let (_temp, dir) = setup_temp_dir();
    write_commands(&dir, &set_commands(0..3));

    let mut file = OpenOptions::new().append(true).open(segment_path(&dir, 1)).unwrap();
    file.write_all(&[0xAB; 5]).unwrap();

    let err = replay(&dir, ReplayPolicy::Strict).unwrap_err();
    assert!(matches!(err, KvError::WalCorruption(_)));
}

#[test]
fn test_torn_tail_truncated_under_policy() {
    let (_temp, dir) = setup_temp_dir();
    let commands = set_commands(0..3);
    write_commands(&dir, &commands);

    let path = segment_path(&dir, 1);
    let clean_len = fs::metadata(&path).unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    // A header promising more body than exists
    file.write_all(&[0, 0, 0, 0, 0, 0, 0, 64, 1, 2, 3]).unwrap();
    drop(file);

    let (replayed, stats) = replay(&dir, ReplayPolicy::TruncateTorn).unwrap();
    assert_eq!(replayed, commands);
    assert!(stats.was_truncated);
    assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);

    // Clean afterwards, even under Strict
    let (_, stats) = replay(&dir, ReplayPolicy::Strict).unwrap();
    assert!(!stats.was_truncated);
}

#[test]
fn test_torn_record_before_more_data_is_fatal() {
    let (_temp, dir) = setup_temp_dir();
    write_commands(&dir, &set_commands(0..2));

    let path = segment_path(&dir, 1);
    let len = fs::metadata(&path).unwrap().len();
    OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

    // Segment 2 holds later data
    write_commands(&dir, &set_commands(5..6));

    let err = replay(&dir, ReplayPolicy::TruncateTorn).unwrap_err();
    assert!(matches!(err, KvError::WalCorruption(_)));
}

#[test]
fn test_torn_tail_with_empty_newer_segment_is_truncated() {
    let (_temp, dir) = setup_temp_dir();
    write_commands(&dir, &set_commands(0..2));

    let path = segment_path(&dir, 1);
    let len = fs::metadata(&path).unwrap().len();
    OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

    // A restart opens an empty segment 2 before replaying
    let wal = open_wal(&dir, wal_config(LARGE, ReplayPolicy::TruncateTorn));
    let replayed = collect(&wal).unwrap();
    assert_eq!(replayed, set_commands(0..1));
}

// =============================================================================
// Ordering Tests
// =============================================================================

#[test]
fn test_lsn_regression_is_fatal() {
    let (_temp, dir) = setup_temp_dir();

    // Two writers that never replayed: both start at lsn 1
    write_commands(&dir, &set_commands(0..3));
    write_commands(&dir, &set_commands(3..4));

    let err = replay(&dir, ReplayPolicy::Strict).unwrap_err();
    assert!(matches!(err, KvError::WalCorruption(_)));
}

#[test]
fn test_empty_log_replays_nothing() {
    let (_temp, dir) = setup_temp_dir();
    let (replayed, stats) = replay(&dir, ReplayPolicy::Strict).unwrap();
    assert!(replayed.is_empty());
    assert_eq!(stats.segments, 0);
    assert_eq!(stats.last_lsn, 0);
}

#[test]
fn test_callback_error_aborts_replay() {
    let (_temp, dir) = setup_temp_dir();
    write_commands(&dir, &set_commands(0..3));

    let err = replay_segments(&dir, ReplayPolicy::Strict, &mut |lsn, _| {
        if lsn == 2 {
            Err(KvError::Internal("stop".into()))
        } else {
            Ok(())
        }
    })
    .unwrap_err();
    assert!(matches!(err, KvError::Internal(_)));
}

// =============================================================================
// Reader Tests
// =============================================================================

#[test]
fn test_segment_reader_positions() {
    let (_temp, dir) = setup_temp_dir();
    write_commands(&dir, &set_commands(0..2));

    let (_, path) = &list_segments(&dir).unwrap()[0];
    let total = fs::metadata(path).unwrap().len();
    let mut reader = SegmentReader::open(path).unwrap();

    let first = reader.next_entry().unwrap().unwrap();
    assert_eq!(first.lsn, 1);
    assert_eq!(first.command().unwrap(), set_commands(0..1)[0]);
    let second = reader.next_entry().unwrap().unwrap();
    assert_eq!(second.lsn, 2);
    assert_eq!(reader.position(), total);
    assert!(reader.next_entry().unwrap().is_none());
}

#[test]
fn test_oversized_length_is_torn_not_allocated() {
    let (_temp, dir) = setup_temp_dir();
    write_commands(&dir, &set_commands(0..2));

    let (_, path) = &list_segments(&dir).unwrap()[0];
    let second_at = {
        let mut reader = SegmentReader::open(path).unwrap();
        reader.next_entry().unwrap().unwrap();
        reader.position() as usize
    };

    // Length field of the second record claims 4 GiB
    let mut bytes = fs::read(path).unwrap();
    bytes[second_at + 4..second_at + HEADER_SIZE].copy_from_slice(&u32::MAX.to_be_bytes());
    fs::write(path, bytes).unwrap();

    let mut reader = SegmentReader::open(path).unwrap();
    assert_eq!(reader.next_entry().unwrap().unwrap().lsn, 1);
    match reader.next_entry() {
        Err(ReadFault::Torn { offset }) => assert_eq!(offset, second_at as u64),
        other => panic!("expected torn record, got {:?}", other),
    }
}
