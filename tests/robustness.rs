//! Robustness tests for edge cases and error conditions.
//!
//! These tests verify that tblocker handles damaged state and hostile input gracefully.

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use tblocker::clock::ManualClock;
use tblocker::store::{BlockStore, STORE_FILE};
use tblocker::watcher::LineParser;
use tblocker::TblockerError;
use tempfile::TempDir;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()))
}

/// A corrupt store file is reported, never silently discarded
#[test]
fn test_corrupt_store_is_persistence_error() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(STORE_FILE), "{\"10.0.0.1\": [").unwrap();

    let err = match BlockStore::open(dir.path(), clock()) {
        Ok(_) => panic!("corrupt store opened"),
        Err(e) => e,
    };
    assert!(matches!(
        err.downcast_ref::<TblockerError>(),
        Some(TblockerError::Persistence(_))
    ));
}

/// An empty or whitespace-only file is an empty store
#[test]
fn test_blank_store_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(STORE_FILE), "  \n").unwrap();

    let store = BlockStore::open(dir.path(), clock()).unwrap();
    assert!(store.is_empty());
}

/// The storage directory is created on demand
#[test]
fn test_store_creates_missing_directory() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("a").join("b");

    let store = BlockStore::open(&nested, clock()).unwrap();
    store.add("10.0.0.1", "alice", Duration::minutes(10)).unwrap();
    assert!(nested.join(STORE_FILE).exists());
}

/// No temporary files are left behind after many writes
#[test]
fn test_store_leaves_no_temp_files() {
    let dir = TempDir::new().unwrap();
    let store = BlockStore::open(dir.path(), clock()).unwrap();

    for i in 0..20 {
        store
            .add(&format!("10.0.0.{}", i), "alice", Duration::minutes(10))
            .unwrap();
    }
    for i in 0..10 {
        store.remove(&format!("10.0.0.{}", i)).unwrap();
    }

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(files, vec![std::ffi::OsString::from(STORE_FILE)]);

    let reopened = BlockStore::open(dir.path(), clock()).unwrap();
    assert_eq!(reopened.len(), 10);
}

/// Expired entries survive a restart so they can still be unblocked
#[test]
fn test_expired_entries_reload() {
    let dir = TempDir::new().unwrap();
    let clock = clock();
    {
        let store = BlockStore::open(dir.path(), clock.clone()).unwrap();
        store.add("10.0.0.1", "alice", Duration::minutes(1)).unwrap();
    }

    clock.advance(Duration::minutes(5));
    let store = BlockStore::open(dir.path(), clock.clone()).unwrap();
    assert_eq!(store.len(), 1);
    assert!(!store.is_blocked("10.0.0.1"));
    assert_eq!(store.expired(store.now()).len(), 1);
}

/// Garbage and truncated log lines never panic the parser
#[test]
fn test_parser_hostile_lines() {
    let parser = LineParser::new("TORRENT");
    let lines = [
        "",
        "[",
        "]",
        "][TORRENT",
        "[TORRENT]",
        "[TORRENT] from ",
        "[TORRENT] from tcp:",
        "[TORRENT] from tcp:[",
        "[TORRENT] from tcp:[::1",
        "[TORRENT] from 999.1.1.1:80 email: x",
        "[TORRENT] from 10.0.0.1:80 email: ",
        "from 10.0.0.1:80 [TORRENT] email:",
    ];

    for line in lines {
        assert!(parser.parse(line).is_none(), "parsed: {:?}", line);
    }
}

/// Tag matching is on whole words only
#[test]
fn test_parser_tag_boundaries() {
    let parser = LineParser::new("TORRENT");
    assert!(!parser.has_tag("from 10.0.0.1:1 [in >> NOTTORRENT] email: a"));
    assert!(!parser.has_tag("from 10.0.0.1:1 [TORRENT-ish] email: a"));
    assert!(!parser.has_tag("from 10.0.0.1:1 TORRENT email: a"));
    assert!(parser.has_tag("from 10.0.0.1:1 [in >> TORRENT] email: a"));
    assert!(parser.has_tag("from 10.0.0.1:1 [TORRENT] email: a"));
}

/// IP parsing edge cases
#[test]
fn test_ip_parsing_edge_cases() {
    use tblocker::enforcer::parse_ip;

    assert!(parse_ip("0.0.0.0").is_ok());
    assert!(parse_ip("::1").is_ok());
    assert!(parse_ip(" 10.0.0.1 ").is_ok());

    for bad in ["256.0.0.0", "1.2.3", "1.2.3.4.5", "", "hello", "10.0.0.0/8"] {
        let err = parse_ip(bad).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TblockerError>(),
            Some(TblockerError::InvalidIp(_))
        ));
    }
}
