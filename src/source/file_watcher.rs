//! Tailing one log file across rotations

use std::fs;
use std::io;
use std::io::BufRead;
use std::io::Seek;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

/// Follows a single log file by polling, reading line at a time and
/// swapping to the replacement once log rotation moves the original aside.
/// The caller never sees the swap: rotation is noticed by comparing the
/// (device, inode) pair currently behind the path against the pair the open
/// handle was created from.
///
/// A `FileWatcher` tracks only one file; `FileServer` owns the set of
/// watchers and clears away those whose file has disappeared for good.
pub struct FileWatcher {
    /// The path this watcher follows.
    pub path: PathBuf,
    reader: Option<io::BufReader<fs::File>>,
    file_id: Option<(u64, u64)>,
    reopen: bool,
}

impl FileWatcher {
    /// Create a new `FileWatcher` primed at the _end_ of the file: only
    /// lines appended after this point are read, which is what a telemetry
    /// agent joining a busy log wants. A path that does not exist yet is
    /// fine; the watcher picks the file up from its start when it appears.
    pub fn new(path: PathBuf) -> io::Result<FileWatcher> {
        match fs::File::open(&path) {
            Ok(f) => {
                let mut rdr = io::BufReader::new(f);
                rdr.seek(io::SeekFrom::End(0))?;
                let metadata = fs::metadata(&path)?;
                let file_id = (metadata.dev(), metadata.ino());
                Ok(FileWatcher {
                    path,
                    reader: Some(rdr),
                    file_id: Some(file_id),
                    reopen: false,
                })
            }
            Err(e) => match e.kind() {
                io::ErrorKind::NotFound => Ok(FileWatcher {
                    path,
                    reader: None,
                    file_id: None,
                    reopen: false,
                }),
                _ => Err(e),
            },
        }
    }

    fn file_id(&self) -> Option<(u64, u64)> {
        fs::metadata(&self.path)
            .ok()
            .map(|metadata| (metadata.dev(), metadata.ino()))
    }

    fn open_at_start(&mut self) {
        if let Ok(f) = fs::File::open(&self.path) {
            self.reader = Some(io::BufReader::new(f));
            self.file_id = self.file_id();
            debug!("switched to new file for {:?}", self.path);
        } else {
            self.reader = None;
            self.file_id = None;
        }
        self.reopen = false;
    }

    /// A watcher is dead once its file has disappeared. Dead watchers are
    /// dropped by the server; the path may be rediscovered later as a fresh
    /// watcher.
    pub fn dead(&self) -> bool {
        self.reader.is_none() && self.file_id.is_none()
    }

    /// Read a single line into `buffer`, without its trailing newline.
    ///
    /// Returns the number of bytes read; 0 means no complete progress was
    /// made and the caller should move on. A rotation -- the path now naming
    /// a different inode -- is noticed after the old handle runs dry and the
    /// replacement is read from its start.
    pub fn read_line(&mut self, buffer: &mut String) -> io::Result<usize> {
        if self.reopen && self.file_id() != self.file_id {
            self.open_at_start();
        }
        if let Some(ref mut reader) = self.reader {
            match reader.read_line(buffer) {
                Ok(0) => {
                    self.reopen = true;
                    Ok(0)
                }
                Ok(sz) => {
                    while buffer.ends_with('\n') || buffer.ends_with('\r') {
                        buffer.pop();
                    }
                    Ok(sz)
                }
                Err(e) => {
                    if let io::ErrorKind::NotFound = e.kind() {
                        self.reopen = true;
                    }
                    Err(e)
                }
            }
        } else {
            self.open_at_start();
            Ok(0)
        }
    }
}
