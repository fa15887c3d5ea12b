/*
 * Copyright (C) 2025 The Arbor Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Container std streams. Each of stdin/stdout/stderr is described by an
//! outside path (absolute, or relative to the container's working
//! directory), a byte limit and rotation. Rotation keeps the newest half
//! of the limit so a chatty task cannot fill the work directory.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use crate::arbor::util::error::{ArborError, Result};

#[derive(Debug, Clone)]
pub struct StdStream {
    /// 0, 1 or 2.
    pub fd: i32,
    /// Absolute path, or a file name placed into the work directory.
    pub outside: String,
    pub limit: u64,
}

impl StdStream {
    pub fn new(fd: i32, outside: &str, limit: u64) -> Self {
        Self {
            fd,
            outside: outside.to_string(),
            limit,
        }
    }

    pub fn path(&self, work_dir: &Path) -> PathBuf {
        let outside = Path::new(&self.outside);
        if outside.is_absolute() {
            outside.to_path_buf()
        } else {
            work_dir.join(outside)
        }
    }

    fn is_managed(&self, work_dir: &Path) -> bool {
        // only files inside the work dir are created, rotated and removed
        self.path(work_dir).starts_with(work_dir)
    }

    /// Opens (creating if managed) the stream target for the child.
    /// stdin opens read-only, the output streams append.
    pub fn open(&self, work_dir: &Path, uid: Uid, gid: Gid) -> Result<File> {
        let path = self.path(work_dir);
        let file = if self.fd == 0 {
            OpenOptions::new().read(true).open(&path)
        } else if self.is_managed(work_dir) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path);
            if file.is_ok() {
                let _ = nix::unistd::chown(&path, Some(uid), Some(gid));
            }
            file
        } else {
            OpenOptions::new().append(true).open(&path)
        };
        file.map_err(|err| {
            ArborError::from(err).wrap(format!("open stream {}", path.display()))
        })
    }

    /// Shrinks the file to the newest `limit / 2` bytes once it crosses
    /// the limit. No-op for unmanaged paths such as /dev/null.
    pub fn rotate(&self, work_dir: &Path) -> Result<()> {
        if self.fd == 0 || self.limit == 0 || !self.is_managed(work_dir) {
            return Ok(());
        }
        let path = self.path(work_dir);
        let Ok(meta) = std::fs::metadata(&path) else {
            return Ok(());
        };
        if meta.len() <= self.limit {
            return Ok(());
        }

        let keep = self.limit / 2;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| ArborError::from(err).wrap(format!("rotate {}", path.display())))?;
        let mut tail = Vec::with_capacity(keep as usize);
        file.seek(SeekFrom::End(-(keep as i64)))
            .and_then(|_| file.read_to_end(&mut tail))
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(&tail))
            .map_err(|err| ArborError::from(err).wrap(format!("rotate {}", path.display())))?;
        file.set_len(tail.len() as u64)
            .map_err(|err| ArborError::from(err).wrap(format!("rotate {}", path.display())))?;
        Ok(())
    }

    /// Reads up to `limit` trailing bytes for the stdout/stderr data
    /// read-outs. An absent stream reads as empty.
    pub fn read_tail(&self, work_dir: &Path) -> String {
        if self.fd == 0 {
            return String::new();
        }
        let path = self.path(work_dir);
        let Ok(mut file) = File::open(&path) else {
            return String::new();
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let start = len.saturating_sub(self.limit.max(1));
        let mut text = String::new();
        let _ = file.seek(SeekFrom::Start(start));
        let _ = file.read_to_string(&mut text);
        text
    }

    pub fn remove(&self, work_dir: &Path) {
        if self.fd == 0 || !self.is_managed(work_dir) {
            return;
        }
        let _ = std::fs::remove_file(self.path(work_dir));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uid() -> Uid {
        Uid::current()
    }

    fn gid() -> Gid {
        Gid::current()
    }

    #[test]
    fn relative_path_lands_in_work_dir() {
        let temp = TempDir::new().unwrap();
        let stream = StdStream::new(1, "stdout", 1024);
        assert_eq!(stream.path(temp.path()), temp.path().join("stdout"));
        assert!(stream.is_managed(temp.path()));

        let null = StdStream::new(0, "/dev/null", 0);
        assert_eq!(null.path(temp.path()), PathBuf::from("/dev/null"));
        assert!(!null.is_managed(temp.path()));
    }

    #[test]
    fn rotation_keeps_the_tail() {
        let temp = TempDir::new().unwrap();
        let stream = StdStream::new(1, "stdout", 100);
        let mut file = stream.open(temp.path(), uid(), gid()).unwrap();
        file.write_all(&vec![b'a'; 200]).unwrap();
        file.write_all(b"tail-marker").unwrap();
        drop(file);

        stream.rotate(temp.path()).unwrap();
        let len = std::fs::metadata(stream.path(temp.path())).unwrap().len();
        assert_eq!(len, 50);
        assert!(stream.read_tail(temp.path()).ends_with("tail-marker"));
    }

    #[test]
    fn rotation_skips_small_files() {
        let temp = TempDir::new().unwrap();
        let stream = StdStream::new(2, "stderr", 1024);
        let mut file = stream.open(temp.path(), uid(), gid()).unwrap();
        file.write_all(b"short").unwrap();
        drop(file);

        stream.rotate(temp.path()).unwrap();
        assert_eq!(stream.read_tail(temp.path()), "short");
    }

    #[test]
    fn missing_stream_reads_empty() {
        let temp = TempDir::new().unwrap();
        let stream = StdStream::new(1, "stdout", 1024);
        assert_eq!(stream.read_tail(temp.path()), "");
        stream.remove(temp.path());
    }
}
