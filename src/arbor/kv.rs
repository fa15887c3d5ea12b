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

//! Persistent key-value nodes, one per container id, on a tmpfs-backed
//! directory. A node is a text map of `key = value` lines. Persistence
//! across reboot is explicitly not required; the directory only has to
//! survive daemon restarts.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoKind, Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::warn;

use crate::arbor::util::error::{ArborError, Result};

/// Store root plus the advisory lock that keeps two daemons from sharing
/// one state directory. The lock is held for the lifetime of the store.
pub struct KvStore {
    root: PathBuf,
    _lock: File,
}

impl KvStore {
    pub fn open(root: &Path, lock_path: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .map_err(|err| ArborError::from(err).wrap("create key-value directory"))?;

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| ArborError::from(err).wrap("create lock directory"))?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(lock_path)
            .map_err(|err| ArborError::from(err).wrap("open key-value lock"))?;
        lock.try_lock_exclusive().map_err(|err| {
            ArborError::from(err).wrap("key-value directory is locked by another daemon")
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node(&self, id: u32) -> KvNode {
        KvNode {
            path: self.root.join(id.to_string()),
        }
    }

    /// Ids of every stored node, sorted ascending so parents restore
    /// before their children.
    pub fn list_ids(&self) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == IoKind::NotFound => return Ok(ids),
            Err(err) => return Err(ArborError::from(err).wrap("list key-value nodes")),
        };
        for entry in entries {
            let entry = entry.map_err(ArborError::from)?;
            let name = entry.file_name();
            match name.to_string_lossy().parse::<u32>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(
                    "unexpected entry in key-value directory: {}",
                    name.to_string_lossy()
                ),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn dump_all(&self) -> Result<String> {
        let mut out = String::new();
        for id in self.list_ids()? {
            let node = self.node(id);
            out.push_str(&format!("node {}\n", id));
            match node.load() {
                Ok(map) => {
                    for (key, value) in map {
                        out.push_str(&format!("  {} = {}\n", key, value));
                    }
                }
                Err(err) => out.push_str(&format!("  <unreadable: {}>\n", err)),
            }
        }
        Ok(out)
    }
}

/// One container's snapshot file.
pub struct KvNode {
    path: PathBuf,
}

impl KvNode {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Writes the full map atomically: temp file in the same directory,
    /// then rename over the node.
    pub fn save(&self, data: &BTreeMap<String, String>) -> Result<()> {
        let mut text = String::new();
        for (key, value) in data {
            if value.contains('\n') {
                return Err(ArborError::invalid_data(format!(
                    "key-value entry {} contains a newline",
                    key
                )));
            }
            text.push_str(key);
            text.push_str(" = ");
            text.push_str(value);
            text.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)
            .map_err(|err| ArborError::from(err).wrap("create key-value node"))?;
        file.write_all(text.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|err| ArborError::from(err).wrap("write key-value node"))?;
        fs::rename(&tmp, &self.path)
            .map_err(|err| ArborError::from(err).wrap("commit key-value node"))?;
        Ok(())
    }

    pub fn load(&self) -> Result<BTreeMap<String, String>> {
        let mut text = String::new();
        File::open(&self.path)
            .and_then(|mut file| file.read_to_string(&mut text))
            .map_err(|err| ArborError::from(err).wrap("read key-value node"))?;

        let mut data = BTreeMap::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            match line.split_once(" = ") {
                Some((key, value)) => {
                    data.insert(key.to_string(), value.to_string());
                }
                None => {
                    return Err(ArborError::invalid_data(format!(
                        "malformed key-value line: {}",
                        line
                    )))
                }
            }
        }
        Ok(data)
    }

    /// Idempotent removal. The node is deleted last during destroy so a
    /// crash mid-teardown leaves a restorable record.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoKind::NotFound => Ok(()),
            Err(err) => Err(ArborError::from(err).wrap("remove key-value node")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> KvStore {
        KvStore::open(&temp.path().join("kv"), &temp.path().join("kv.lock")).expect("open store")
    }

    #[test]
    fn save_load_round_trip() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);

        let mut map = BTreeMap::new();
        map.insert("id".to_string(), "17".to_string());
        map.insert("name".to_string(), "web/backend".to_string());
        map.insert("state".to_string(), "stopped".to_string());
        map.insert("command".to_string(), "/bin/sleep 3".to_string());

        let node = store.node(17);
        node.save(&map).expect("save");
        assert_eq!(node.load().expect("load"), map);
    }

    #[test]
    fn ids_are_sorted_for_parent_first_restore() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        for id in [12, 4, 9] {
            store.node(id).save(&BTreeMap::new()).expect("save");
        }
        assert_eq!(store.list_ids().expect("list"), vec![4, 9, 12]);
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let node = store.node(5);
        node.save(&BTreeMap::new()).expect("save");
        node.remove().expect("first remove");
        node.remove().expect("second remove");
        assert!(!node.exists());
    }

    #[test]
    fn values_keep_equals_signs() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let mut map = BTreeMap::new();
        map.insert("env".to_string(), "A=1;B=x = y".to_string());
        let node = store.node(2);
        node.save(&map).expect("save");
        assert_eq!(node.load().expect("load")["env"], "A=1;B=x = y");
    }

    #[test]
    fn embedded_newline_is_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let mut map = BTreeMap::new();
        map.insert("resolv_conf".to_string(), "a\nb".to_string());
        assert!(store.node(3).save(&map).is_err());
    }

    #[test]
    fn second_store_cannot_take_the_lock() {
        let temp = TempDir::new().expect("tempdir");
        let _first = store(&temp);
        assert!(
            KvStore::open(&temp.path().join("kv"), &temp.path().join("kv.lock")).is_err(),
            "lock should be exclusive"
        );
    }
}
