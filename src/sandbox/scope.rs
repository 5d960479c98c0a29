//! Scope model shared by the evaluator and the tool registry.
//!
//! The live objects stay inside the Python worker. What the Rust side owns is an
//! explicit key-value store describing them: the [`BaselineScope`] manifest reported
//! once at worker start, and the [`TurnContext`] threaded from turn to turn.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// Transportable encoding of one binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContextValue {
    /// `None`, `bool`, `int` (i64 range), finite `float` or `str`, carried by value.
    Json { value: serde_json::Value },
    /// A module, looked up again by its dotted name.
    Module { name: String },
    /// Any other object; it lives in the object store of worker `owner`.
    Handle {
        id: u64,
        owner: u32,
        #[serde(rename = "type")]
        type_name: String,
        repr: String,
    },
}

impl ContextValue {
    pub fn json(value: impl Into<serde_json::Value>) -> Self {
        Self::Json {
            value: value.into(),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json { value } => Some(value),
            _ => None,
        }
    }

    pub fn owner(&self) -> Option<u32> {
        match self {
            Self::Handle { owner, .. } => Some(*owner),
            _ => None,
        }
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json { value } => write!(f, "{value}"),
            Self::Module { name } => write!(f, "<module '{name}'>"),
            Self::Handle { type_name, repr, .. } => write!(f, "{repr} ({type_name})"),
        }
    }
}

/// Bindings accumulated by earlier turns.
///
/// Callers keep ownership; the evaluator works on a clone and hands back a
/// replacement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnContext {
    entries: BTreeMap<String, ContextValue>,
}

impl TurnContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ContextValue> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ContextValue) -> Option<ContextValue> {
        self.entries.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<ContextValue> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContextValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Drops handles that belong to any worker other than `owner` and returns
    /// their names.
    pub fn retain_owned_by(&mut self, owner: u32) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, v)| v.owner().is_some_and(|o| o != owner))
            .map(|(k, _)| k.clone())
            .collect();
        for name in &stale {
            self.entries.remove(name);
        }
        stale
    }

    /// Drops every handle; used when no worker is alive to own them.
    pub fn without_handles(&self) -> (Self, Vec<String>) {
        let mut kept = self.clone();
        let dropped = kept.retain_owned_by(0);
        (kept, dropped)
    }
}

impl FromIterator<(String, ContextValue)> for TurnContext {
    fn from_iter<T: IntoIterator<Item = (String, ContextValue)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingKind {
    Module,
    Type,
    Callable,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BaselineEntry {
    pub name: String,
    pub kind: BindingKind,
}

/// A configured library that failed to import at worker start.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MissingModule {
    pub alias: String,
    pub module: String,
    pub error: String,
}

/// Names every snippet starts with. Built once and never modified.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BaselineScope {
    entries: BTreeMap<String, BindingKind>,
    missing: Vec<MissingModule>,
    python_version: String,
}

impl BaselineScope {
    pub fn new(
        entries: impl IntoIterator<Item = BaselineEntry>,
        missing: Vec<MissingModule>,
        python_version: impl Into<String>,
    ) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.name, e.kind)).collect(),
            missing,
            python_version: python_version.into(),
        }
    }

    pub fn get(&self, name: &str) -> Option<BindingKind> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names_of_kind(&self, kind: BindingKind) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |(_, k)| **k == kind)
            .map(|(name, _)| name.as_str())
    }

    pub fn missing(&self) -> &[MissingModule] {
        &self.missing
    }

    pub fn python_version(&self) -> &str {
        &self.python_version
    }

    fn same_names(&self, other: &Self) -> bool {
        self.entries.keys().eq(other.entries.keys())
    }
}

/// Compares a restarted worker's manifest with the first one.
pub(crate) fn baseline_matches(first: &BaselineScope, restarted: &BaselineScope) -> bool {
    first.same_names(restarted)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Binding<'a> {
    Baseline(BindingKind),
    Context(&'a ContextValue),
}

/// Baseline plus a private copy of the turn context; context names win.
#[derive(Debug, Clone)]
pub struct PreparedScope {
    baseline: Arc<BaselineScope>,
    overrides: TurnContext,
}

impl PreparedScope {
    pub fn resolve(&self, name: &str) -> Option<Binding<'_>> {
        if let Some(value) = self.overrides.get(name) {
            return Some(Binding::Context(value));
        }
        self.baseline.get(name).map(Binding::Baseline)
    }

    pub fn baseline(&self) -> &BaselineScope {
        &self.baseline
    }

    pub fn overrides(&self) -> &TurnContext {
        &self.overrides
    }

    pub fn into_overrides(self) -> TurnContext {
        self.overrides
    }
}

pub fn prepare_scope(baseline: &Arc<BaselineScope>, turn_context: &TurnContext) -> PreparedScope {
    PreparedScope {
        baseline: Arc::clone(baseline),
        overrides: turn_context.clone(),
    }
}
