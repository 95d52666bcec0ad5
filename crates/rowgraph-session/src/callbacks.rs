//! Association callbacks and the dispatcher that runs them.
//!
//! Mutations (add / remove / set) run their before-hooks in declared order.
//! A hook returning [`HookOutcome::Veto`] stops the mutation; the dispatcher
//! then raises a hook-failure error or reports `false`, depending on
//! [`HookFailureMode`]. After-hooks run once the mutation has happened and
//! cannot veto. After-load hooks receive the resolved association value.

use crate::association::AssociationDescriptor;
use rowgraph_core::error::AssociationErrorKind;
use rowgraph_core::{AssociationValue, Error, Record, RecordRef, Result};
use std::fmt;
use std::sync::Arc;

/// Result of a before-hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Let the mutation proceed.
    Continue,
    /// Stop the mutation.
    Veto,
}

/// Hook run before a mutation. Receives the owner and the target record
/// (`None` when a to-one association is being cleared).
pub type BeforeHook = Arc<dyn Fn(&Record, Option<&RecordRef>) -> HookOutcome + Send + Sync>;

/// Hook run after a mutation.
pub type AfterHook = Arc<dyn Fn(&Record, Option<&RecordRef>) + Send + Sync>;

/// Hook run after an association has been resolved (lazily or eagerly).
pub type LoadHook = Arc<dyn Fn(&Record, &AssociationValue) + Send + Sync>;

/// What a vetoed mutation reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookFailureMode {
    /// Return `Error::Association` with kind `HookFailed`.
    #[default]
    Raise,
    /// Return `Ok(false)`.
    ReturnFalse,
}

/// The mutation a hook list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Add,
    Remove,
    Set,
}

impl MutationKind {
    /// Lowercase name for messages.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Add => "add",
            MutationKind::Remove => "remove",
            MutationKind::Set => "set",
        }
    }
}

/// Ordered hook lists for one association.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub before_add: Vec<BeforeHook>,
    pub after_add: Vec<AfterHook>,
    pub before_remove: Vec<BeforeHook>,
    pub after_remove: Vec<AfterHook>,
    pub before_set: Vec<BeforeHook>,
    pub after_set: Vec<AfterHook>,
    pub after_load: Vec<LoadHook>,
}

impl Callbacks {
    fn before(&self, kind: MutationKind) -> &[BeforeHook] {
        match kind {
            MutationKind::Add => &self.before_add,
            MutationKind::Remove => &self.before_remove,
            MutationKind::Set => &self.before_set,
        }
    }

    fn after(&self, kind: MutationKind) -> &[AfterHook] {
        match kind {
            MutationKind::Add => &self.after_add,
            MutationKind::Remove => &self.after_remove,
            MutationKind::Set => &self.after_set,
        }
    }

    /// Check if no hook of any kind is registered.
    pub fn is_empty(&self) -> bool {
        self.before_add.is_empty()
            && self.after_add.is_empty()
            && self.before_remove.is_empty()
            && self.after_remove.is_empty()
            && self.before_set.is_empty()
            && self.after_set.is_empty()
            && self.after_load.is_empty()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("before_add", &self.before_add.len())
            .field("after_add", &self.after_add.len())
            .field("before_remove", &self.before_remove.len())
            .field("after_remove", &self.after_remove.len())
            .field("before_set", &self.before_set.len())
            .field("after_set", &self.after_set.len())
            .field("after_load", &self.after_load.len())
            .finish()
    }
}

/// Runs association hooks around mutations and loads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackDispatcher {
    mode: HookFailureMode,
}

impl CallbackDispatcher {
    /// Create a dispatcher with the given veto reporting mode.
    pub fn new(mode: HookFailureMode) -> Self {
        Self { mode }
    }

    /// The configured veto reporting mode.
    pub fn mode(&self) -> HookFailureMode {
        self.mode
    }

    /// Run `mutation` wrapped in the association's hooks.
    ///
    /// Returns `Ok(true)` when the mutation happened, `Ok(false)` when a
    /// before-hook vetoed it in [`HookFailureMode::ReturnFalse`] mode.
    /// Read-only associations are rejected before any hook runs.
    pub fn dispatch<F>(
        &self,
        descriptor: &AssociationDescriptor,
        kind: MutationKind,
        owner: &RecordRef,
        target: Option<&RecordRef>,
        mutation: F,
    ) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        if descriptor.read_only {
            return Err(Error::association(
                AssociationErrorKind::ReadOnly,
                owner.type_name(),
                descriptor.name,
                format!("cannot {} on a read-only association", kind.as_str()),
            ));
        }

        for (position, hook) in descriptor.callbacks.before(kind).iter().enumerate() {
            if hook(owner, target) == HookOutcome::Veto {
                tracing::debug!(
                    owner = %owner.label(),
                    association = descriptor.name,
                    mutation = kind.as_str(),
                    hook = position,
                    "Before-hook vetoed mutation"
                );
                return match self.mode {
                    HookFailureMode::Raise => Err(Error::association(
                        AssociationErrorKind::HookFailed,
                        owner.type_name(),
                        descriptor.name,
                        format!("before_{} hook vetoed the mutation", kind.as_str()),
                    )),
                    HookFailureMode::ReturnFalse => Ok(false),
                };
            }
        }

        mutation()?;

        for hook in descriptor.callbacks.after(kind) {
            hook(owner, target);
        }
        Ok(true)
    }

    /// Run after-load hooks for one resolved owner.
    pub fn after_load(
        &self,
        descriptor: &AssociationDescriptor,
        owner: &Record,
        value: &AssociationValue,
    ) {
        for hook in &descriptor.callbacks.after_load {
            hook(owner, value);
        }
    }
}
