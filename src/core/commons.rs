// src/core/commons.rs

use crate::constants::TASK_SEPARATOR;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panic inside an action or hook poisons whatever lock it held. The engine state
// behind those locks stays consistent (every mutation is a single insert/remove), so
// the guard is recovered instead of propagating the panic to unrelated callers.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Joins name segments with `separator`, skipping empty segments.
pub fn join_name<S: AsRef<str>>(segments: &[S], separator: &str) -> String {
    segments
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Qualifies `name` with every prefix of `scope`, most specific first.
///
/// `candidates("compile", ["foo", "bar"], ":")` yields
/// `["foo:bar:compile", "foo:compile", "compile"]`.
pub fn scoped_candidates<S: AsRef<str>>(name: &str, scope: &[S], separator: &str) -> Vec<String> {
    let mut candidates = Vec::with_capacity(scope.len() + 1);
    for n in (0..=scope.len()).rev() {
        let mut segments: Vec<&str> = scope.iter().take(n).map(AsRef::as_ref).collect();
        segments.push(name);
        let candidate = join_name(&segments, separator);
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

/// Splits a task reference into its effective scope and bare name.
///
/// A leading `:` anchors the name at the top level; every leading `^` drops one
/// level from the end of `scope`.
pub fn split_task_reference<'a>(name: &'a str, scope: &[String]) -> (Vec<String>, &'a str) {
    if let Some(absolute) = name.strip_prefix(TASK_SEPARATOR) {
        return (Vec::new(), absolute);
    }
    let mut effective: Vec<String> = scope.to_vec();
    let mut rest = name;
    while let Some(stripped) = rest.strip_prefix('^') {
        effective.pop();
        rest = stripped;
    }
    (effective, rest)
}
