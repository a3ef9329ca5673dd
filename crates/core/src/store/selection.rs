use anyhow::Context;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Scope of a remembered selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Scenario(String),
    Run(String),
}

impl ScopeKey {
    pub fn scenario(deal_id: impl Into<String>) -> Self {
        Self::Scenario(deal_id.into())
    }

    pub fn run(fund_id: impl Into<String>) -> Self {
        Self::Run(fund_id.into())
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scenario(deal_id) => write!(f, "scenario:{deal_id}"),
            Self::Run(fund_id) => write!(f, "run:{fund_id}"),
        }
    }
}

/// Last-viewed scenario per deal and run per fund.
///
/// Plain key-value storage: ids are not checked against anything. Callers resolve
/// them with [`resolve_selection`]. When opened on a file every change is written
/// through; losing that file only loses the remembered selections.
#[derive(Debug, Default)]
pub struct SelectionStore {
    entries: RwLock<BTreeMap<String, String>>,
    path: Option<PathBuf>,
}

impl SelectionStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => match serde_json::from_str::<BTreeMap<String, String>>(&text) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "selection state unreadable; starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read selection state {}", path.display()))
            }
        };

        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
        })
    }

    pub fn get(&self, key: &ScopeKey) -> Option<String> {
        self.read().get(&key.to_string()).cloned()
    }

    pub fn set(&self, key: &ScopeKey, id: impl Into<String>) {
        let mut entries = self.write();
        entries.insert(key.to_string(), id.into());
        self.flush(&entries);
    }

    pub fn clear(&self, key: &ScopeKey) {
        let mut entries = self.write();
        if entries.remove(&key.to_string()).is_some() {
            self.flush(&entries);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn flush(&self, entries: &BTreeMap<String, String>) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        if let Err(err) = write_atomic(path, entries) {
            tracing::warn!(path = %path.display(), error = %err, "failed to persist selection state");
        }
    }
}

fn write_atomic(path: &Path, entries: &BTreeMap<String, String>) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {} failed", dir.display()))?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), entries).context("serialize selection state failed")?;
    tmp.as_file_mut()
        .flush()
        .context("flush selection state failed")?;
    tmp.persist(path)
        .with_context(|| format!("persist {} failed", path.display()))?;
    Ok(())
}

/// The remembered item if it is still in `items`, otherwise the first item.
pub fn resolve_selection<'a, T>(
    stored: Option<&str>,
    items: &'a [T],
    id_of: impl Fn(&T) -> &str,
) -> Option<&'a T> {
    stored
        .and_then(|id| items.iter().find(|item| id_of(item) == id))
        .or_else(|| items.first())
}
