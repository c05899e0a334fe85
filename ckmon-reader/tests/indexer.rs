// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multi-file indexing: occurrences, live monitors, identity cards and
//! filtered random-access reads.

use ckmon_common::{DateTimeStamp, LogLevel, TagSet};
use ckmon_format::{EntryKind, LogEntry, LogWriter, MulticastInfo};
use ckmon_reader::{IndexError, LogIndexer};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

static CLOCK: AtomicI64 = AtomicI64::new(1_000_000);

fn tick() -> DateTimeStamp {
    DateTimeStamp::new(CLOCK.fetch_add(10, Ordering::SeqCst), 0)
}

/// Builds well-chained multicast entries for one monitor.
struct Emitter {
    id: String,
    prev_kind: Option<EntryKind>,
    prev_time: DateTimeStamp,
    depth: u32,
}

impl Emitter {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            prev_kind: None,
            prev_time: DateTimeStamp::UNKNOWN,
            depth: 0,
        }
    }

    fn advance(&mut self, kind: EntryKind, depth: u32) -> (DateTimeStamp, MulticastInfo) {
        let time = tick();
        let info = MulticastInfo {
            monitor_id: self.id.clone(),
            prev_kind: self.prev_kind,
            prev_time: self.prev_time,
            group_depth: depth,
        };
        self.prev_kind = Some(kind);
        self.prev_time = time;
        (time, info)
    }

    fn line(&mut self, tags: &str, text: &str) -> LogEntry {
        let (time, info) = self.advance(EntryKind::Line, self.depth);
        LogEntry::line(LogLevel::Info, TagSet::new(tags), text, time).with_multicast(info)
    }

    fn open(&mut self, text: &str) -> LogEntry {
        let (time, info) = self.advance(EntryKind::OpenGroup, self.depth);
        self.depth += 1;
        LogEntry::open_group(LogLevel::Info, TagSet::EMPTY, text, time).with_multicast(info)
    }

    fn close(&mut self) -> LogEntry {
        let (time, info) = self.advance(EntryKind::CloseGroup, self.depth);
        self.depth -= 1;
        let mut entry = LogEntry::close_group(LogLevel::Info, time, vec![]);
        entry.multicast = Some(info);
        entry
    }
}

fn write_file(path: &Path, entries: &[LogEntry]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = LogWriter::new(std::io::BufWriter::new(file)).unwrap();
    for entry in entries {
        writer.write_entry(entry).unwrap();
    }
    writer.close().unwrap();
}

#[test]
fn test_indexes_monitors_across_files() {
    let dir = tempfile::tempdir().unwrap();
    let file_a = dir.path().join("a.ckmon");
    let file_b = dir.path().join("b.ckmon");

    let mut m1 = Emitter::new("m1");
    let mut m2 = Emitter::new("m2");
    write_file(
        &file_a,
        &[
            m1.line("Sql", "m1 first"),
            m2.line("", "m2 only"),
            m1.line("Sql|Startup", "m1 second"),
        ],
    );
    let mut m3 = Emitter::new("m3");
    write_file(
        &file_b,
        &[m1.line("", "m1 in b"), m3.line("", "m3 only")],
    );

    let indexer = LogIndexer::new();
    let a = indexer.add_file(&file_a);
    let b = indexer.add_file(&file_b);

    assert_eq!(indexer.monitor_count(), 3);
    let summary_a = a.summary().unwrap();
    assert_eq!(summary_a.total_entry_count, 3);
    assert_eq!(summary_a.stream_version, ckmon_format::CURRENT_STREAM_VERSION);
    assert!(!summary_a.bad_end_of_file);
    assert!(a.is_valid_file() && b.is_valid_file());

    let m1_indexed = indexer.monitor("m1").unwrap();
    assert_eq!(m1_indexed.files().len(), 2);
    let m2_indexed = indexer.monitor("m2").unwrap();
    assert_eq!(m2_indexed.files().len(), 1);

    // Occurrence offsets bound the monitor's entries within one file.
    let occ = a.occurrence("m1").unwrap();
    assert!(occ.first_offset() < occ.last_offset());
    assert!(occ.first_entry_time() < occ.last_entry_time());

    // Global window covers both files.
    assert_eq!(
        indexer.first_entry_time(),
        Some(summary_a.first_entry_time.unwrap())
    );
    assert_eq!(
        indexer.last_entry_time(),
        Some(b.summary().unwrap().last_entry_time.unwrap())
    );

    // Tag histogram counts atoms.
    assert_eq!(m1_indexed.tag_count("Sql"), 2);
    assert_eq!(m1_indexed.tag_count("Startup"), 1);
    assert_eq!(m1_indexed.tag_count("Nope"), 0);
}

#[test]
fn test_monitor_appeared_fires_exactly_once_across_threads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("many.ckmon");
    let mut entries = Vec::new();
    for i in 0..20 {
        let mut e = Emitter::new(&format!("monitor-{i}"));
        entries.push(e.line("", "hello"));
        entries.push(e.line("", "world"));
    }
    write_file(&path, &entries);

    let indexer = LogIndexer::new();
    let seen: &'static Mutex<HashMap<String, u32>> =
        Box::leak(Box::new(Mutex::new(HashMap::new())));
    indexer.on_live_monitor_appeared(move |monitor| {
        *seen.lock()
            .unwrap()
            .entry(monitor.monitor_id().to_string())
            .or_default() += 1;
    });

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                indexer.add_file(&path);
            });
        }
    });

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 20);
    assert!(seen.values().all(|&count| count == 1), "{seen:?}");
    // The file was scanned once: entry counts are not multiplied.
    let file = indexer.file(&path).unwrap();
    assert_eq!(file.summary().unwrap().total_entry_count, 40);
    assert_eq!(indexer.files().len(), 1);
}

#[test]
fn test_group_depths_at_extrema() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("depths.ckmon");
    let mut m = Emitter::new("m1");
    let open = m.open("g");
    let inner = m.line("", "inside");
    write_file(&path, &[open, inner]);

    let indexer = LogIndexer::new();
    indexer.add_file(&path);
    let monitor = indexer.monitor("m1").unwrap();
    let (first_time, first_depth) = monitor.first_entry().unwrap();
    let (last_time, last_depth) = monitor.last_entry().unwrap();
    assert!(first_time < last_time);
    // OpenGroup encodes its pre-increment depth; the line inside sits at 1.
    assert_eq!(first_depth, 0);
    assert_eq!(last_depth, 1);
}

#[test]
fn test_identity_card_full_then_update() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.ckmon");
    let mut m = Emitter::new("m1");
    let plain = m.line("", "before any card");
    let full = m.line("IdentityCardFull", "AppName: backend\nVersion: 1");
    let update = m.line("IdentityCardUpdate", "Version: 2\nUser: svc");
    write_file(&path, &[plain, full, update]);

    let indexer = LogIndexer::new();
    indexer.add_file(&path);
    let card = indexer.monitor("m1").unwrap().identity_card().unwrap();
    assert_eq!(card.get("AppName"), Some("backend"));
    assert_eq!(card.get("Version"), Some("2"));
    assert_eq!(card.get("User"), Some("svc"));
}

#[test]
fn test_identity_card_update_alone_materializes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity-update.ckmon");
    let mut m = Emitter::new("m1");
    let update = m.line("IdentityCardUpdate", "User: first");
    write_file(&path, &[update]);

    let indexer = LogIndexer::new();
    indexer.add_file(&path);
    let card = indexer.monitor("m1").unwrap().identity_card().unwrap();
    assert_eq!(card.get("User"), Some("first"));
}

#[test]
fn test_filtered_reads_by_offset_and_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reads.ckmon");
    let mut m1 = Emitter::new("m1");
    let mut noise = Emitter::new("noise");
    let first = m1.line("", "first");
    let mid_noise = noise.line("", "between");
    let second = m1.line("", "second");
    let second_time = second.time;
    write_file(&path, &[first, mid_noise, second]);

    let indexer = LogIndexer::new();
    let file = indexer.add_file(&path);
    let occ = file.occurrence("m1").unwrap();

    let mut from_start = occ.read_from_offset(occ.first_offset()).unwrap();
    assert_eq!(from_start.current().unwrap().text.as_deref(), Some("first"));
    assert!(from_start.move_next());
    assert_eq!(from_start.current().unwrap().text.as_deref(), Some("second"));
    assert!(!from_start.move_next());

    let from_last = occ.read_from_offset(occ.last_offset()).unwrap();
    assert_eq!(from_last.current().unwrap().text.as_deref(), Some("second"));

    let from_time = occ.read_from_time(second_time).unwrap();
    assert_eq!(from_time.current().unwrap().text.as_deref(), Some("second"));

    let past_end = occ.read_from_time(DateTimeStamp::new(second_time.ticks_utc + 1, 0));
    assert!(matches!(past_end, Err(IndexError::NoEntry(_))));
}

#[test]
fn test_truncated_file_keeps_partial_results() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.ckmon");
    let mut m = Emitter::new("m1");
    write_file(&path, &[m.line("", "kept"), m.line("", "also kept")]);
    // Strip the zero terminator.
    let mut bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.pop(), Some(0));
    std::fs::write(&path, &bytes).unwrap();

    let indexer = LogIndexer::new();
    let file = indexer.add_file(&path);
    let summary = file.summary().unwrap();
    assert!(summary.bad_end_of_file);
    assert!(summary.error.is_none());
    assert_eq!(summary.total_entry_count, 2);
    assert!(indexer.monitor("m1").is_some());
}

#[test]
fn test_unreadable_file_is_flagged_but_retained() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nope.ckmon");
    std::fs::write(&path, b"garbage").unwrap();

    let indexer = LogIndexer::new();
    let file = indexer.add_file(&path);
    assert!(!file.is_valid_file());
    assert!(file.summary().unwrap().error.is_some());
    assert_eq!(indexer.files().len(), 1);
    assert_eq!(indexer.monitor_count(), 0);
}

#[test]
fn test_gzip_file_is_indexed_transparently() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let plain_path = dir.path().join("plain.ckmon");
    let mut m = Emitter::new("m1");
    write_file(&plain_path, &[m.line("", "compressed entry")]);

    let gz_path = dir.path().join("packed.ckmon");
    let plain = std::fs::read(&plain_path).unwrap();
    let mut encoder =
        GzEncoder::new(std::fs::File::create(&gz_path).unwrap(), Compression::default());
    encoder.write_all(&plain).unwrap();
    encoder.finish().unwrap();

    let indexer = LogIndexer::new();
    let file = indexer.add_file(&gz_path);
    assert!(file.is_valid_file());
    assert_eq!(file.summary().unwrap().total_entry_count, 1);
    let occ = file.occurrence("m1").unwrap();
    let cursor = occ.read_from_offset(occ.first_offset()).unwrap();
    assert_eq!(
        cursor.current().unwrap().text.as_deref(),
        Some("compressed entry")
    );
}
