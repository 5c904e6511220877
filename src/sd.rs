//! Prometheus file-based service discovery files.
//!
//! Every registered key owns one `<application>-<environment>.json` file in the
//! discovery directory, holding a single target group. Files are only ever
//! replaced through a rename so the collector polling the directory sees either
//! the previous or the next version, never a partial one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::registry::Key;

const FILE_SUFFIX: &str = ".json";
const TEMP_PREFIX: &str = ".file-sd-";
const TEMP_SUFFIX: &str = ".tmp";

// struct representing one Prometheus file SD target group
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(crate = "rocket::serde")]
pub struct TargetGroup {
    pub(crate) targets: Vec<String>,
    pub(crate) labels: BTreeMap<String, String>,
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("malformed discovery file {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct DiscoveryDir {
    path: PathBuf,
}

impl DiscoveryDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DiscoveryDir { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_path(&self, key: &Key) -> PathBuf {
        self.path.join(file_name(key))
    }

    /// Creates the directory if needed, checks that files can be created in it
    /// and clears temporary files left behind by an interrupted write.
    pub fn prepare(&self) -> Result<(), WriteError> {
        fs::create_dir_all(&self.path)?;
        tempfile::tempfile_in(&self.path)?;

        for dir_entry in fs::read_dir(&self.path)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
                warn!("Removing stale temporary file {}", name);
                fs::remove_file(dir_entry.path())?;
            }
        }

        Ok(())
    }

    /// Atomically replaces the file of `key` with `group`.
    pub fn write(&self, key: &Key, group: &TargetGroup) -> Result<(), WriteError> {
        let contents = serde_json::to_vec(&[group])?;
        let target = self.file_path(key);

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.path)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|err| err.error)?;

        sync_committed(&self.path);
        debug!("Wrote {} ({} bytes)", target.display(), contents.len());

        Ok(())
    }

    /// Removes the file of `key`. A file that is already gone is not an error.
    pub fn remove(&self, key: &Key) -> Result<(), WriteError> {
        let target = self.file_path(key);

        match fs::remove_file(&target) {
            Ok(()) => {
                sync_committed(&self.path);
                debug!("Removed {}", target.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads back every file this service wrote, skipping anything that does
    /// not follow the `<application>-<environment>.json` naming.
    pub fn load(&self) -> Result<Vec<(Key, TargetGroup)>, WriteError> {
        let mut groups = Vec::new();

        for dir_entry in fs::read_dir(&self.path)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(key) = name.to_str().and_then(key_from_file_name) else {
                debug!("Ignoring {:?} in discovery directory", name);
                continue;
            };

            let path = dir_entry.path();
            let contents = fs::read(&path)?;
            let mut list: Vec<TargetGroup> =
                serde_json::from_slice(&contents).map_err(|err| WriteError::Malformed {
                    path: path.clone(),
                    reason: err.to_string(),
                })?;

            match list.len() {
                0 => continue,
                1 => groups.extend(list.pop().map(|group| (key, group))),
                n => {
                    return Err(WriteError::Malformed {
                        path,
                        reason: format!("expected a single target group, found {}", n),
                    })
                }
            }
        }

        Ok(groups)
    }
}

// Called once a rename or unlink has happened. The change is already visible
// to readers, so a failed sync must not be reported as a failed write.
fn sync_committed(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|file| file.sync_all()) {
        warn!("Could not sync directory {}: {}", dir.display(), err);
    }
}

fn file_name(key: &Key) -> String {
    format!("{}-{}{}", key.application(), key.environment(), FILE_SUFFIX)
}

fn key_from_file_name(name: &str) -> Option<Key> {
    let (application, environment) = name.strip_suffix(FILE_SUFFIX)?.split_once('-')?;
    Key::new(application, environment).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn group(targets: &[&str], labels: &[(&str, &str)]) -> TargetGroup {
        TargetGroup {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn key(application: &str, environment: &str) -> Key {
        Key::new(application, environment).unwrap()
    }

    #[test]
    fn file_names_round_trip_to_keys() {
        let key = key("app_1", "prod");
        assert_eq!(file_name(&key), "app_1-prod.json");
        assert_eq!(key_from_file_name("app_1-prod.json"), Some(key));

        assert_eq!(key_from_file_name("app.json"), None);
        assert_eq!(key_from_file_name("app-prod.yml"), None);
        assert_eq!(key_from_file_name("a-b-c.json"), None);
        assert_eq!(key_from_file_name(".file-sd-abc.tmp"), None);
    }

    #[test]
    fn write_produces_a_single_element_list() {
        let dir = tempfile::tempdir().unwrap();
        let sd = DiscoveryDir::new(dir.path());
        sd.prepare().unwrap();

        let key = key("app", "env");
        let data = group(&["host:1"], &[("env", "env"), ("job", "app")]);
        sd.write(&key, &data).unwrap();

        let contents = fs::read_to_string(sd.file_path(&key)).unwrap();
        assert_eq!(
            contents,
            r#"[{"targets":["host:1"],"labels":{"env":"env","job":"app"}}]"#
        );
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn remove_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let sd = DiscoveryDir::new(dir.path());

        let key = key("app", "env");
        sd.remove(&key).unwrap();

        sd.write(&key, &group(&["host:1"], &[])).unwrap();
        sd.remove(&key).unwrap();
        assert!(!sd.file_path(&key).exists());
    }

    #[test]
    fn write_fails_when_directory_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let sd = DiscoveryDir::new(dir.path().join("missing"));

        let result = sd.write(&key("app", "env"), &group(&["host:1"], &[]));
        assert!(matches!(result, Err(WriteError::Io(_))));
    }

    #[test]
    fn directory_sync_failure_does_not_undo_a_write() {
        let dir = tempfile::tempdir().unwrap();
        let sd = DiscoveryDir::new(dir.path());
        let key = key("app", "env");
        sd.write(&key, &group(&["host:1"], &[])).unwrap();

        sync_committed(&dir.path().join("missing"));
        assert!(sd.file_path(&key).exists());

        sd.remove(&key).unwrap();
        assert!(!sd.file_path(&key).exists());
    }

    #[test]
    fn prepare_creates_directory_and_clears_stale_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sd");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(".file-sd-abc123.tmp"), "[{").unwrap();
        fs::write(path.join("other.json"), "[]").unwrap();

        DiscoveryDir::new(&path).prepare().unwrap();

        let names: Vec<_> = fs::read_dir(&path)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["other.json".to_string()]);

        let fresh = dir.path().join("fresh");
        DiscoveryDir::new(&fresh).prepare().unwrap();
        assert!(fresh.is_dir());
    }

    #[test]
    fn load_reads_own_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let sd = DiscoveryDir::new(dir.path());

        sd.write(&key("app", "env"), &group(&["host:1"], &[("job", "app")]))
            .unwrap();
        fs::write(dir.path().join("empty-list.json"), "[]").unwrap();
        fs::write(dir.path().join("foreign.json"), "not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let loaded = sd.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, key("app", "env"));
        assert_eq!(loaded[0].1.targets, vec!["host:1".to_string()]);
    }

    #[test]
    fn load_rejects_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let sd = DiscoveryDir::new(dir.path());

        fs::write(dir.path().join("app-env.json"), "[{\"targets\": [").unwrap();
        assert!(matches!(sd.load(), Err(WriteError::Malformed { .. })));

        let two = r#"[{"targets":[],"labels":{}},{"targets":[],"labels":{}}]"#;
        fs::write(dir.path().join("app-env.json"), two).unwrap();
        assert!(matches!(sd.load(), Err(WriteError::Malformed { .. })));
    }

    #[test]
    fn readers_never_observe_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let sd = DiscoveryDir::new(dir.path());
        let key = key("app", "env");
        sd.write(&key, &group(&["host:0"], &[])).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let done = done.clone();
            let path = sd.file_path(&key);
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    let contents = fs::read(&path).unwrap();
                    let list: Vec<TargetGroup> = serde_json::from_slice(&contents).unwrap();
                    assert_eq!(list.len(), 1);
                }
            })
        };

        let writers: Vec<_> = (0..4)
            .map(|n| {
                let sd = sd.clone();
                let key = key.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        let targets: Vec<String> =
                            (0..=i).map(|p| format!("host{}:{}", n, p + 1)).collect();
                        let refs: Vec<&str> = targets.iter().map(String::as_str).collect();
                        sd.write(&key, &group(&refs, &[("job", "app")])).unwrap();
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }
}
