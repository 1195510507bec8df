//! Glob discovery and fair line polling over many files

use crate::record;
use crate::engine::RecordSink;
use crate::source::file_watcher::FileWatcher;
use glob::glob;
use seahash::SeaHasher;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type HashMapSea<K, V> = HashMap<K, V, BuildHasherDefault<SeaHasher>>;

/// `FileServer` cooperatively schedules reads over a set of discovered
/// files, parsing lines into `Record`s and pushing them at a `RecordSink`.
/// Discovery is by glob and must poll -- no event notification is used --
/// so a newly created file starts being followed within one discovery
/// interval, from its then-current end.
///
/// Scheduling aims to be fair: a busy file gives up its turn after
/// `max_lines_read` lines so quiet files still get read promptly. Files that
/// roll faster than the poll loop can turn around will lose lines; that is
/// the known cost of the polling design.
pub struct FileServer {
    patterns: Vec<String>,
    discover_interval: Duration,
    max_lines_read: usize,
}

impl FileServer {
    /// Make a FileServer watching `patterns`, re-globbing every
    /// `discover_interval`.
    pub fn new(
        patterns: Vec<String>,
        discover_interval: Duration,
        max_lines_read: usize,
    ) -> FileServer {
        FileServer {
            patterns,
            discover_interval,
            max_lines_read,
        }
    }

    fn discover(&self, fp_map: &mut HashMapSea<PathBuf, FileWatcher>) {
        for pattern in &self.patterns {
            let entries = match glob(pattern) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("could not read glob pattern {}: {}", pattern, e);
                    continue;
                }
            };
            for entry in entries {
                let path = match entry {
                    Ok(path) => path,
                    Err(_) => continue,
                };
                if fp_map.contains_key(&path) {
                    continue;
                }
                match FileWatcher::new(path.clone()) {
                    Ok(watcher) => {
                        info!("following {:?}", path);
                        fp_map.insert(path, watcher);
                    }
                    Err(e) => warn!("could not follow {:?}: {}", path, e),
                }
            }
        }
    }

    /// Run the polling loop forever, feeding `sink`.
    ///
    /// We want to avoid burning up users' CPUs. To do this we sleep after
    /// reading lines out of files, but we want to be responsive as well. A
    /// `backoff_cap` decides how long any given loop waits: it doubles every
    /// time no line was read, up to a hard cap, and snaps back to the
    /// minimum as soon as lines flow again.
    pub fn run(&mut self, sink: Arc<dyn RecordSink>) {
        let mut fp_map: HashMapSea<PathBuf, FileWatcher> = Default::default();
        let mut fp_map_alt: HashMapSea<PathBuf, FileWatcher> = Default::default();

        let mut buffer = String::new();
        let mut backoff_cap: usize = 1;
        let mut last_discover: Option<Instant> = None;

        loop {
            let discover_due = last_discover
                .map_or(true, |then| then.elapsed() >= self.discover_interval);
            if discover_due {
                self.discover(&mut fp_map);
                last_discover = Some(Instant::now());
            }

            let mut global_lines_read: usize = 0;
            for (path, mut watcher) in fp_map.drain() {
                let mut lines_read: usize = 0;
                while let Ok(sz) = watcher.read_line(&mut buffer) {
                    if sz == 0 {
                        break;
                    }
                    lines_read += 1;
                    if let Some(rec) = record::parse_line(&buffer) {
                        sink.handle(&rec);
                    }
                    buffer.clear();
                    if lines_read > self.max_lines_read {
                        break;
                    }
                }
                buffer.clear();
                // a dead watcher's file has disappeared; drop it here and
                // let discovery pick the path back up if it returns
                if watcher.dead() {
                    info!("stopped following {:?}", path);
                } else {
                    fp_map_alt.insert(path, watcher);
                }
                global_lines_read = global_lines_read.saturating_add(lines_read);
            }
            // live watchers were drained into fp_map_alt; swap them back so
            // the next pass reads from them again
            mem::swap(&mut fp_map, &mut fp_map_alt);

            if global_lines_read == 0 {
                backoff_cap = backoff_cap.saturating_mul(2).min(2_048);
            } else {
                backoff_cap = 1;
            }
            let backoff = backoff_cap.saturating_sub(global_lines_read);
            thread::sleep(Duration::from_millis(backoff as u64));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::Record;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::sync::Mutex;
    use tempdir::TempDir;

    struct VecSink {
        records: Mutex<Vec<Record>>,
    }

    impl VecSink {
        fn new() -> VecSink {
            VecSink {
                records: Mutex::new(Vec::new()),
            }
        }
    }

    impl RecordSink for VecSink {
        fn handle(&self, record: &Record) {
            self.records.lock().unwrap().push(record.clone());
        }
    }

    fn append(path: &std::path::Path, lines: &str) {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open for append");
        f.write_all(lines.as_bytes()).expect("append");
    }

    #[test]
    fn follows_discovered_files_from_their_end() {
        let dir = TempDir::new("file-server").expect("tempdir");
        let path = dir.path().join("access.log");
        append(&path, r#"{"vhost":"old"}"#);
        append(&path, "\n");

        let sink = Arc::new(VecSink::new());
        let run_sink: Arc<dyn RecordSink> = Arc::clone(&sink) as Arc<dyn RecordSink>;
        let pattern = dir
            .path()
            .join("*.log")
            .to_str()
            .expect("pattern should be utf8")
            .to_string();
        let mut server = FileServer::new(vec![pattern], Duration::from_millis(100), 1_000);
        thread::spawn(move || server.run(run_sink));

        // give discovery a moment, then append live traffic
        thread::sleep(Duration::from_millis(500));
        append(&path, "{\"vhost\":\"a\"}\nnot json\n{\"vhost\":\"b\"}\n");

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let records = sink.records.lock().unwrap();
                if records.len() >= 2 {
                    assert_eq!(records[0].get("vhost"), "a");
                    assert_eq!(records[1].get("vhost"), "b");
                    // the pre-existing line was never read
                    assert!(records.iter().all(|r| r.get("vhost") != "old"));
                    break;
                }
            }
            assert!(Instant::now() < deadline, "records never arrived");
            thread::sleep(Duration::from_millis(50));
        }
    }
}
