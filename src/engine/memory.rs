//! In-process engine for tests and dry runs

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use super::{CommitOptions, CreateOptions, EngineClient, EngineResult, StartOptions};
use crate::container::ObservedContainer;
use crate::error::EngineError;

/// One call received by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub op: &'static str,
    /// Empty for calls that don't address a container
    pub id: String,
}

#[derive(Debug, Clone)]
struct Entry {
    container: ObservedContainer,
    create_options: Option<CreateOptions>,
    files: BTreeMap<String, Vec<u8>>,
    exit_code: i64,
}

#[derive(Default)]
struct State {
    // creation order, like the engine's own listing
    entries: Vec<Entry>,
    journal: Vec<EngineCall>,
    commits: Vec<(String, CommitOptions)>,
    failing: Vec<&'static str>,
}

/// Thread-safe engine keeping containers in memory
#[derive(Clone, Default)]
pub struct InMemoryEngine {
    state: Arc<RwLock<State>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a container as if the engine already knew it
    pub fn insert(&self, container: ObservedContainer) {
        self.state.write().entries.push(Entry {
            container,
            create_options: None,
            files: BTreeMap::new(),
            exit_code: 0,
        });
    }

    /// Place a file inside a container for `copy` and `export`
    pub fn put_file(&self, id: &str, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> EngineResult<()> {
        let mut state = self.state.write();
        let entry = find_mut(&mut state.entries, id)?;
        entry.files.insert(path.into(), contents.into());
        Ok(())
    }

    pub fn set_exit_code(&self, id: &str, code: i64) -> EngineResult<()> {
        let mut state = self.state.write();
        find_mut(&mut state.entries, id)?.exit_code = code;
        Ok(())
    }

    /// Make the next call of `op` fail as if the engine were unreachable
    pub fn fail_next(&self, op: &'static str) {
        self.state.write().failing.push(op);
    }

    pub fn container(&self, id: &str) -> Option<ObservedContainer> {
        self.state
            .read()
            .entries
            .iter()
            .find(|e| e.container.id == id)
            .map(|e| e.container.clone())
    }

    pub fn containers(&self) -> Vec<ObservedContainer> {
        self.state.read().entries.iter().map(|e| e.container.clone()).collect()
    }

    pub fn create_options(&self, id: &str) -> Option<CreateOptions> {
        self.state
            .read()
            .entries
            .iter()
            .find(|e| e.container.id == id)
            .and_then(|e| e.create_options.clone())
    }

    pub fn commits(&self) -> Vec<(String, CommitOptions)> {
        self.state.read().commits.clone()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.read().journal.clone()
    }

    /// Operations that change state, in order; list/get are left out
    pub fn mutations(&self) -> Vec<&'static str> {
        self.state
            .read()
            .journal
            .iter()
            .map(|c| c.op)
            .filter(|op| !matches!(*op, "list" | "get"))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.write().journal.clear();
    }

    fn record(&self, op: &'static str, id: &str) -> EngineResult<()> {
        let mut state = self.state.write();
        state.journal.push(EngineCall { op, id: id.to_string() });
        if let Some(pos) = state.failing.iter().position(|f| *f == op) {
            state.failing.remove(pos);
            return Err(EngineError::Unavailable(format!("injected failure for {}", op)));
        }
        Ok(())
    }

    fn update<T>(&self, id: &str, f: impl FnOnce(&mut Entry) -> EngineResult<T>) -> EngineResult<T> {
        let mut state = self.state.write();
        f(find_mut(&mut state.entries, id)?)
    }
}

fn find_mut<'a>(entries: &'a mut [Entry], id: &str) -> EngineResult<&'a mut Entry> {
    entries
        .iter_mut()
        .find(|e| e.container.id == id)
        .ok_or_else(|| EngineError::NotFound(id.to_string()))
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl EngineClient for InMemoryEngine {
    fn list_all(&self) -> EngineResult<Vec<String>> {
        self.record("list", "")?;
        Ok(self.state.read().entries.iter().map(|e| e.container.id.clone()).collect())
    }

    fn get(&self, id: &str) -> EngineResult<ObservedContainer> {
        self.record("get", id)?;
        self.container(id).ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn create(&self, options: &CreateOptions) -> EngineResult<String> {
        self.record("create", "")?;
        let mut state = self.state.write();

        if let Some(name) = &options.name {
            if state.entries.iter().any(|e| &e.container.name == name) {
                return Err(EngineError::Conflict(format!("name '{}' is already in use", name)));
            }
        }

        let id = new_id();
        state.entries.push(Entry {
            container: ObservedContainer {
                id: id.clone(),
                image_id: format!("sha256:{}", new_id()),
                image_name: options.image.clone(),
                command: options.cmd.as_ref().map(|c| c.join(" ")).unwrap_or_default(),
                name: options.name.clone().unwrap_or_else(|| format!("c-{}", &id[..8])),
                created: Some(Utc::now()),
                running: false,
                ghost: false,
            },
            create_options: Some(options.clone()),
            files: BTreeMap::new(),
            exit_code: 0,
        });
        Ok(id)
    }

    fn start(&self, id: &str, _options: &StartOptions) -> EngineResult<()> {
        self.record("start", id)?;
        self.update(id, |e| {
            if e.container.ghost {
                return Err(EngineError::Conflict(format!("container {} is a ghost", id)));
            }
            e.container.running = true;
            Ok(())
        })
    }

    fn stop(&self, id: &str, _timeout: Duration) -> EngineResult<()> {
        self.record("stop", id)?;
        self.update(id, |e| {
            e.container.running = false;
            Ok(())
        })
    }

    fn kill(&self, id: &str) -> EngineResult<()> {
        self.record("kill", id)?;
        self.update(id, |e| {
            e.container.running = false;
            Ok(())
        })
    }

    fn restart(&self, id: &str) -> EngineResult<()> {
        self.record("restart", id)?;
        self.update(id, |e| {
            e.container.running = true;
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> EngineResult<()> {
        self.record("delete", id)?;
        let mut state = self.state.write();
        let entry = find_mut(&mut state.entries, id)?;
        if entry.container.running && !entry.container.ghost {
            return Err(EngineError::Conflict(format!("container {} is running", id)));
        }
        state.entries.retain(|e| e.container.id != id);
        Ok(())
    }

    fn wait(&self, id: &str) -> EngineResult<i64> {
        self.record("wait", id)?;
        self.update(id, |e| {
            e.container.running = false;
            Ok(e.exit_code)
        })
    }

    fn commit(&self, id: &str, options: &CommitOptions) -> EngineResult<String> {
        self.record("commit", id)?;
        let mut state = self.state.write();
        find_mut(&mut state.entries, id)?;
        state.commits.push((id.to_string(), options.clone()));
        Ok(format!("sha256:{}", new_id()))
    }

    fn export(&self, id: &str) -> EngineResult<Box<dyn Read + Send>> {
        self.record("export", id)?;
        self.update(id, |e| {
            let bytes: Vec<u8> = e.files.values().flatten().copied().collect();
            Ok(Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>)
        })
    }

    fn copy(&self, id: &str, path: &str) -> EngineResult<Box<dyn Read + Send>> {
        self.record("copy", id)?;
        self.update(id, |e| {
            e.files
                .get(path)
                .map(|bytes| Box::new(Cursor::new(bytes.clone())) as Box<dyn Read + Send>)
                .ok_or_else(|| EngineError::NotFound(format!("{}:{}", id, path)))
        })
    }
}
