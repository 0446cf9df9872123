//! Persistent records: one file per entity under a store directory, holding
//! `name=value` lines. Writes go through a temp file and rename so a record
//! is always either the old or the new version, never a torn one.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};

/// Encode an entity name into a flat file name ('/' is common in container
/// names and cannot appear in a path component).
fn encode(name: &str) -> String {
    name.replace('%', "%25").replace('/', "%2F")
}

fn decode(name: &str) -> String {
    name.replace("%2F", "/").replace("%25", "%")
}

#[derive(Debug)]
pub struct KvStore {
    root: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct KvRecord {
    pub name: String,
    pub values: BTreeMap<String, String>,
}

impl KvRecord {
    pub fn new(name: &str) -> Self {
        KvRecord {
            name: name.to_string(),
            values: BTreeMap::new(),
        }
    }

    pub fn set<T: ToString>(&mut self, key: &str, value: T) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }
}

impl KvStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .map_err(|e| Error::from(e).context(format!("create {}", root.display())))?;
        Ok(KvStore {
            root: root.to_path_buf(),
        })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(encode(name))
    }

    /// Write the whole record atomically.
    pub fn save(&self, record: &KvRecord) -> Result<()> {
        let path = self.record_path(&record.name);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for (key, value) in &record.values {
                if value.contains('\n') {
                    return Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("record value for {} contains a newline", key),
                    ));
                }
                writeln!(file, "{}={}", key, value)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<KvRecord> {
        let path = self.record_path(name);
        let text = fs::read_to_string(&path)
            .map_err(|e| Error::from(e).context(format!("load {}", path.display())))?;
        let mut record = KvRecord::new(name);
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let mut split = line.splitn(2, '=');
            let key = split.next().unwrap_or("");
            // Unknown or malformed lines are ignored on load.
            if let Some(value) = split.next() {
                record.values.insert(key.to_string(), value.to_string());
            }
        }
        Ok(record)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e).context(format!("remove {}", path.display()))),
        }
    }

    /// Names of every record in the store. Leftover temp files are dropped.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = vec![];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.ends_with(".tmp") {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            names.push(decode(&file_name));
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path()).unwrap();

        let mut rec = KvRecord::new("a/b");
        rec.set("command", "sleep 1000");
        rec.set("_id", 4);
        store.save(&rec).unwrap();

        let loaded = store.load("a/b").unwrap();
        assert_eq!(loaded.get("command"), Some("sleep 1000"));
        assert_eq!(loaded.get("_id"), Some("4"));
        assert_eq!(store.list().unwrap(), vec!["a/b".to_string()]);

        store.remove("a/b").unwrap();
        assert!(store.list().unwrap().is_empty());
        store.remove("a/b").unwrap();
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("x"), "good=1\njunk-without-equals\n").unwrap();
        let rec = store.load("x").unwrap();
        assert_eq!(rec.get("good"), Some("1"));
        assert_eq!(rec.values.len(), 1);
    }

    #[test]
    fn names_survive_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        for name in &["a", "a/b", "a/b/c", "we%ird"] {
            let rec = KvRecord::new(name);
            store.save(&rec).unwrap();
        }
        let mut names = store.list().unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "a/b", "a/b/c", "we%ird"]);
    }
}
