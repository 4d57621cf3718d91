//! The interface mods implement and the handle they get back from the loader

use crate::error::{HookError, LoadError, PatchError};
use crate::hook::{HookId, HookManager};
use crate::journal::{Journal, Severity};
use crate::patch::{PatchId, PatchManager};
use std::fmt::Display;
use void_core::ModId;

/// Behavior of a loaded mod
///
/// Native binaries are wrapped in an adapter implementing this trait;
/// statically linked mods can implement it directly.
pub trait ModInterface {
    /// Called once after the mod is constructed
    ///
    /// Hooks installed here stay disabled until the mod enables them. On error
    /// the mod is not published: its hooks and patches are removed and it is
    /// dropped without [`unload`](Self::unload).
    fn setup(&mut self, ctx: &mut ModContext<'_>) -> Result<(), LoadError>;

    /// Called when the mod is enabled again after being disabled
    fn enable(&mut self, _ctx: &mut ModContext<'_>) {}

    /// Called when the mod is disabled, explicitly or because a dependency went away
    fn disable(&mut self, _ctx: &mut ModContext<'_>) {}

    /// Called right before the mod is dropped, after its hooks and patches are gone
    fn unload(&mut self) {}
}

/// Everything a mod may touch, scoped to that mod
///
/// Hooks and patches created through a context are owned by its mod and are
/// removed when the mod unloads. Failures are returned to the mod and also
/// recorded in the journal.
pub struct ModContext<'a> {
    owner: &'a ModId,
    hooks: &'a mut HookManager,
    patches: &'a mut PatchManager,
    journal: &'a mut Journal,
}

impl<'a> ModContext<'a> {
    pub fn new(
        owner: &'a ModId,
        hooks: &'a mut HookManager,
        patches: &'a mut PatchManager,
        journal: &'a mut Journal,
    ) -> Self {
        Self {
            owner,
            hooks,
            patches,
            journal,
        }
    }

    /// ID of the mod this context belongs to
    pub fn id(&self) -> &ModId {
        self.owner
    }

    // ========== Hooks ==========

    /// Redirect `address` to `detour`; the hook starts disabled
    pub fn add_hook(&mut self, address: usize, detour: usize) -> Result<HookId, HookError> {
        let result = self.hooks.install(self.owner, address, detour);
        self.report("install hook", result)
    }

    pub fn enable_hook(&mut self, id: HookId) -> Result<(), HookError> {
        let result = self
            .hooks
            .owned(id, self.owner)
            .map(|_| ())
            .and_then(|()| self.hooks.enable(id));
        self.report("enable hook", result)
    }

    pub fn disable_hook(&mut self, id: HookId) -> Result<(), HookError> {
        let result = self
            .hooks
            .owned(id, self.owner)
            .map(|_| ())
            .and_then(|()| self.hooks.disable(id));
        self.report("disable hook", result)
    }

    pub fn remove_hook(&mut self, id: HookId) -> Result<(), HookError> {
        let result = self
            .hooks
            .owned(id, self.owner)
            .map(|_| ())
            .and_then(|()| self.hooks.remove(id).map(|_| ()));
        self.report("remove hook", result)
    }

    /// Hooks owned by this mod
    pub fn hooks(&self) -> Vec<HookId> {
        self.hooks.owned_by(self.owner)
    }

    // ========== Patches ==========

    /// Overwrite the bytes at `address`
    pub fn patch(&mut self, address: usize, bytes: &[u8]) -> Result<PatchId, PatchError> {
        let result = self.patches.apply(self.owner, address, bytes);
        self.report("apply patch", result)
    }

    /// Overwrite the bytes at `address` if they currently equal `expected`
    pub fn replace(&mut self, address: usize, expected: &[u8], bytes: &[u8]) -> Result<PatchId, PatchError> {
        let result = self.patches.replace(self.owner, address, expected, bytes);
        self.report("replace bytes", result)
    }

    /// Restore the original bytes of a patch
    pub fn unpatch(&mut self, id: PatchId) -> Result<(), PatchError> {
        let result = self
            .patches
            .owned(id, self.owner)
            .map(|_| ())
            .and_then(|()| self.patches.restore(id).map(|_| ()));
        self.report("restore patch", result)
    }

    /// Patches owned by this mod
    pub fn patches(&self) -> Vec<PatchId> {
        self.patches.owned_by(self.owner)
    }

    // ========== Journal ==========

    pub fn log(&mut self, severity: Severity, message: impl Into<String>) {
        self.journal.record(severity, Some(self.owner), message);
    }

    fn report<T, E: Display>(&mut self, action: &str, result: Result<T, E>) -> Result<T, E> {
        if let Err(e) = &result {
            self.journal
                .record(Severity::Error, Some(self.owner), format!("Failed to {}: {}", action, e));
        }
        result
    }
}
