use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::gaps::gap_tracker::GapState;

/// Persistence of gap state across connections, keyed by station name
#[cfg_attr(test, automock)]
pub trait GapStateStore: Send + Sync {
    fn load(&self, station: &str) -> anyhow::Result<Option<GapState>>;
    fn store(&self, station: &str, state: &GapState) -> anyhow::Result<()>;
    fn remove(&self, station: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryGapStore {
    states: Mutex<FxHashMap<String, GapState>>,
}

impl InMemoryGapStore {
    pub fn new() -> InMemoryGapStore {
        InMemoryGapStore::default()
    }
}

impl GapStateStore for InMemoryGapStore {
    fn load(&self, station: &str) -> anyhow::Result<Option<GapState>> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Ok(states.get(station).cloned())
    }

    fn store(&self, station: &str, state: &GapState) -> anyhow::Result<()> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(station.to_string(), state.clone());
        Ok(())
    }

    fn remove(&self, station: &str) -> anyhow::Result<()> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(station);
        Ok(())
    }
}

/// Stores each station's gap state as `<station>.yaml` in a directory. Files are written to a
///  temporary file first and then renamed, so a crash does not leave a truncated state file behind.
#[derive(Debug, Clone)]
pub struct YamlFileGapStore {
    dir: PathBuf,
}

impl YamlFileGapStore {
    pub fn new(dir: impl AsRef<Path>) -> anyhow::Result<YamlFileGapStore> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating gap state directory {:?}", dir))?;
        Ok(YamlFileGapStore { dir })
    }

    fn path(&self, station: &str) -> anyhow::Result<PathBuf> {
        if station.is_empty() || !station.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            bail!("station name {:?} cannot be used as a file name", station);
        }
        Ok(self.dir.join(format!("{}.yaml", station)))
    }
}

impl GapStateStore for YamlFileGapStore {
    fn load(&self, station: &str) -> anyhow::Result<Option<GapState>> {
        let path = self.path(station)?;
        let yaml = match fs::read_to_string(&path) {
            Ok(yaml) => yaml,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading gap state {:?}", path)),
        };
        let state = serde_yaml_ng::from_str(&yaml)
            .with_context(|| format!("parsing gap state {:?}", path))?;
        Ok(Some(state))
    }

    fn store(&self, station: &str, state: &GapState) -> anyhow::Result<()> {
        let path = self.path(station)?;
        let tmp_path = self.dir.join(format!(".{}.yaml.tmp", station));

        let yaml = serde_yaml_ng::to_string(state)?;
        fs::write(&tmp_path, yaml)
            .with_context(|| format!("writing gap state {:?}", tmp_path))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming {:?} to {:?}", tmp_path, path))?;
        debug!("stored gap state for station {} in {:?}", station, path);
        Ok(())
    }

    fn remove(&self, station: &str) -> anyhow::Result<()> {
        let path = self.path(station)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing gap state {:?}", path)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaps::gap_tracker::{GapRecord, GapTracker};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_dir() -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        std::env::temp_dir().join(format!("cd11-gap-store-{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::SeqCst)))
    }

    fn state() -> GapState {
        GapState {
            min: 1,
            max: u64::MAX,
            gaps: vec![GapRecord { start: 3, end: 3, modified_millis: 1_600_000_000_000 }],
        }
    }

    fn check_store(store: &dyn GapStateStore) {
        assert_eq!(store.load("STA01").unwrap(), None);

        store.store("STA01", &state()).unwrap();
        assert_eq!(store.load("STA01").unwrap(), Some(state()));
        assert_eq!(store.load("STA02").unwrap(), None);

        let tracker = GapTracker::from_state(&store.load("STA01").unwrap().unwrap()).unwrap();
        assert_eq!(tracker.gaps(), vec![(3, 3)]);

        store.remove("STA01").unwrap();
        assert_eq!(store.load("STA01").unwrap(), None);
        store.remove("STA01").unwrap();
    }

    #[test]
    fn test_in_memory() {
        check_store(&InMemoryGapStore::new());
    }

    #[test]
    fn test_yaml_file() {
        let dir = temp_dir();
        check_store(&YamlFileGapStore::new(&dir).unwrap());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_yaml_file_survives_new_instance() {
        let dir = temp_dir();
        YamlFileGapStore::new(&dir).unwrap().store("STA01", &state()).unwrap();
        assert_eq!(YamlFileGapStore::new(&dir).unwrap().load("STA01").unwrap(), Some(state()));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_yaml_file_corrupt() {
        let dir = temp_dir();
        let store = YamlFileGapStore::new(&dir).unwrap();
        fs::write(dir.join("STA01.yaml"), "min: [").unwrap();
        assert!(store.load("STA01").is_err());
        fs::remove_dir_all(dir).ok();
    }

    #[rstest]
    #[case::empty("")]
    #[case::path_separator("../STA")]
    #[case::space("ST A")]
    fn test_yaml_file_invalid_station(#[case] station: &str) {
        let dir = temp_dir();
        let store = YamlFileGapStore::new(&dir).unwrap();
        assert!(store.store(station, &state()).is_err());
        fs::remove_dir_all(dir).ok();
    }
}
