//! # Extension chains
//!
//! An [`ExtensionChain`] is an ordered list of hooks applied to every subject
//! of some kind (projects, the application) when the subject is set up. Hooks may be
//! appended at any time: a hook appended after some subjects were already set up is
//! delivered to those subjects immediately. Every hook reaches every subject exactly
//! once, in append order.
//!
//! Deliveries to one subject are serialized: while a thread runs hooks for a subject,
//! other threads delivering to the same subject wait for it to finish.

use crate::core::{
    commons::lock,
    error::{EngineError, EngineResult},
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

/// A subject hooks can be delivered to, identified by a stable key.
pub trait Extensible: Send + Sync {
    /// Uniquely identifies the subject within one chain.
    fn extension_key(&self) -> String;
}

/// A hook run once per subject.
pub type ExtensionHook<S> = Arc<dyn Fn(&Arc<S>) -> anyhow::Result<()> + Send + Sync>;

struct Entry<S> {
    label: String,
    hook: ExtensionHook<S>,
    delivered: HashSet<String>,
}

struct ChainState<S> {
    entries: Vec<Entry<S>>,
    known: Vec<Arc<S>>,
    // subject key -> thread currently running hooks for it
    delivering: HashMap<String, ThreadId>,
}

/// Ordered hooks with retroactive, exactly-once delivery.
pub struct ExtensionChain<S> {
    name: String,
    state: Mutex<ChainState<S>>,
    idle: Condvar,
}

impl<S: Extensible> ExtensionChain<S> {
    /// An empty chain; `name` identifies it in logs and errors.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ChainState {
                entries: Vec::new(),
                known: Vec::new(),
                delivering: HashMap::new(),
            }),
            idle: Condvar::new(),
        }
    }

    /// The chain's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a hook and delivers it to every subject already set up.
    ///
    /// # Errors
    /// The first failure of the retroactive deliveries, as `EngineError::Extension`.
    /// Delivery to the remaining subjects still happens. The hook stays on the chain
    /// and is retried for subjects it failed on the next time they are applied.
    pub fn append<F>(&self, label: impl Into<String>, hook: F) -> EngineResult<()>
    where
        F: Fn(&Arc<S>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let label = label.into();
        let known = {
            let mut state = lock(&self.state);
            state.entries.push(Entry {
                label: label.clone(),
                hook: Arc::new(hook),
                delivered: HashSet::new(),
            });
            state.known.clone()
        };
        log::debug!(
            "Extension chain '{}': appended '{}', {} subject(s) already set up",
            self.name,
            label,
            known.len()
        );
        let mut first_error = None;
        for subject in &known {
            if let Err(e) = self.deliver_pending(subject) {
                log::warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Sets up `subject`: records it and runs every hook it has not received yet.
    /// Returns once every hook on the chain has been delivered to it.
    ///
    /// # Errors
    /// `EngineError::Extension` for the first hook that fails; later hooks are not run.
    pub fn apply(&self, subject: &Arc<S>) -> EngineResult<()> {
        {
            let mut state = lock(&self.state);
            let key = subject.extension_key();
            if !state.known.iter().any(|known| known.extension_key() == key) {
                state.known.push(Arc::clone(subject));
            }
        }
        self.deliver_pending(subject)
    }

    /// Stops tracking the subject with `key`; later appends skip it.
    pub fn forget(&self, key: &str) {
        let mut state = lock(&self.state);
        state.known.retain(|known| known.extension_key() != key);
        for entry in &mut state.entries {
            entry.delivered.remove(key);
        }
    }

    /// Number of hooks on the chain.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    /// Returns `true` if no hook was appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subjects set up through this chain.
    pub fn subject_count(&self) -> usize {
        lock(&self.state).known.len()
    }

    /// Delivers hooks one at a time, in append order, without holding the lock while
    /// a hook runs. Only one thread delivers to a subject at a time. A delivery is
    /// reserved before its hook runs, so a hook re-applying its own subject skips it;
    /// a failed delivery is released again.
    fn deliver_pending(&self, subject: &Arc<S>) -> EngineResult<()> {
        let key = subject.extension_key();
        let claimed = self.claim(&key);
        let _release = scopeguard::guard((), |()| {
            if claimed {
                lock(&self.state).delivering.remove(&key);
                self.idle.notify_all();
            }
        });
        loop {
            let next = {
                let mut state = lock(&self.state);
                state
                    .entries
                    .iter_mut()
                    .enumerate()
                    .find(|(_, entry)| !entry.delivered.contains(&key))
                    .map(|(index, entry)| {
                        entry.delivered.insert(key.clone());
                        (index, entry.label.clone(), Arc::clone(&entry.hook))
                    })
            };
            let Some((index, label, hook)) = next else {
                return Ok(());
            };

            log::trace!("Extension chain '{}': '{}' -> {}", self.name, label, key);
            if let Err(source) = hook(subject) {
                if let Some(entry) = lock(&self.state).entries.get_mut(index) {
                    entry.delivered.remove(&key);
                }
                return Err(EngineError::Extension {
                    chain: self.name.clone(),
                    subject: key.clone(),
                    source,
                });
            }
        }
    }

    /// Waits until no other thread is delivering to `key`, then marks this thread as
    /// the one delivering. Returns `false` if this thread already was.
    fn claim(&self, key: &str) -> bool {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        loop {
            match state.delivering.get(key).copied() {
                Some(owner) if owner == me => return false,
                Some(_) => {
                    state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                None => {
                    state.delivering.insert(key.to_string(), me);
                    return true;
                }
            }
        }
    }
}

impl<S> fmt::Debug for ExtensionChain<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ExtensionChain")
            .field("name", &self.name)
            .field(
                "hooks",
                &state.entries.iter().map(|e| e.label.as_str()).collect::<Vec<_>>(),
            )
            .field("subjects", &state.known.len())
            .finish()
    }
}
