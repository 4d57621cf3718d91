//! Mod registry
//!
//! Owns every known mod, pending or active, and drives them through their
//! lifecycle. Every mutation of the mod population ends with a settle: the
//! dependency states are refreshed, active mods whose required dependencies
//! went away are disabled (and re-enabled when they come back), and ready
//! pending mods are activated one at a time until nothing changes.

use crate::config::LoaderConfig;
use crate::context::{ModContext, ModInterface};
use crate::error::{LoadError, Result};
use crate::hook::HookManager;
use crate::journal::{Journal, Severity};
use crate::manifest::{self, ModDescriptor};
use crate::package::{ModPackage, MANIFEST_FILE};
use crate::patch::PatchManager;
use crate::provision::{BinaryProvisioner, NativeProvisioner, PlatformHandle, Provisioned};
use crate::resolve::{self, ResolveEntry, ResolveState};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use void_core::ModId;

/// A discovered mod waiting for its required dependencies
#[derive(Debug, Clone)]
pub struct PendingMod {
    descriptor: ModDescriptor,
}

impl PendingMod {
    pub fn descriptor(&self) -> &ModDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &ModId {
        &self.descriptor.id
    }
}

impl ResolveEntry for PendingMod {
    fn descriptor(&self) -> &ModDescriptor {
        &self.descriptor
    }

    fn descriptor_mut(&mut self) -> &mut ModDescriptor {
        &mut self.descriptor
    }
}

/// Why an active mod is disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisableCause {
    /// Disabled through [`ModRegistry::set_enabled`]; stays disabled until enabled again
    Explicit,
    /// A required dependency stopped being loaded; re-enabled when it is back
    Dependencies,
}

/// A loaded mod
pub struct ActiveMod {
    descriptor: ModDescriptor,
    enabled: bool,
    disable_cause: Option<DisableCause>,
    /// Active mods declaring a dependency on this one
    dependents: BTreeSet<ModId>,
    // Dropped before `handle`
    instance: Option<Box<dyn ModInterface>>,
    handle: PlatformHandle,
}

impl ActiveMod {
    pub fn descriptor(&self) -> &ModDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &ModId {
        &self.descriptor.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disable_cause(&self) -> Option<DisableCause> {
        self.disable_cause
    }

    pub fn dependents(&self) -> &BTreeSet<ModId> {
        &self.dependents
    }

    pub fn handle(&self) -> &PlatformHandle {
        &self.handle
    }
}

impl ResolveEntry for ActiveMod {
    fn descriptor(&self) -> &ModDescriptor {
        &self.descriptor
    }

    fn descriptor_mut(&mut self) -> &mut ModDescriptor {
        &mut self.descriptor
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl fmt::Debug for ActiveMod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveMod")
            .field("id", &self.descriptor.id)
            .field("version", &self.descriptor.version)
            .field("enabled", &self.enabled)
            .field("disable_cause", &self.disable_cause)
            .field("dependents", &self.dependents)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Result of discovering a mod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverOutcome {
    /// The mod is now active
    Activated(ModId),
    /// The mod waits for its required dependencies
    Deferred(ModId),
    /// The package was already known
    Skipped,
}

/// Central registry of pending and active mods
pub struct ModRegistry {
    config: LoaderConfig,
    provisioner: Box<dyn BinaryProvisioner>,
    pending: Vec<PendingMod>,
    /// In activation order
    active: Vec<ActiveMod>,
    hooks: HookManager,
    patches: PatchManager,
    journal: Journal,
    tracked_paths: HashSet<PathBuf>,
    reported_cycles: HashSet<Vec<ModId>>,
    reported_mismatches: HashSet<(ModId, ModId)>,
    shut_down: bool,
}

impl ModRegistry {
    pub fn new(
        config: LoaderConfig,
        provisioner: Box<dyn BinaryProvisioner>,
        hooks: HookManager,
        patches: PatchManager,
    ) -> Self {
        Self {
            config,
            provisioner,
            pending: Vec::new(),
            active: Vec::new(),
            hooks,
            patches,
            journal: Journal::new(),
            tracked_paths: HashSet::new(),
            reported_cycles: HashSet::new(),
            reported_mismatches: HashSet::new(),
            shut_down: false,
        }
    }

    /// Registry loading real binaries into the current process
    pub fn native(config: LoaderConfig) -> Self {
        let provisioner = NativeProvisioner::new(config.staging_path());
        Self::new(config, Box::new(provisioner), HookManager::native(), PatchManager::native())
    }

    // ========== Lifecycle ==========

    /// Prepare the directory layout and load everything in the mods directory
    ///
    /// Returns the number of mods activated.
    pub fn setup(&mut self) -> Result<usize> {
        self.config.create_directories()?;
        self.config.purge_staging()?;
        log::info!("Mod loader ready, base directory {}", self.config.base_dir.display());
        self.update_mods()
    }

    /// Discover packages in the mods directory that are not known yet
    ///
    /// Failures are recorded in the journal and do not stop the scan. Returns
    /// the number of mods activated.
    pub fn update_mods(&mut self) -> Result<usize> {
        let mods_dir = self.config.mods_path();
        let mut packages: Vec<PathBuf> = std::fs::read_dir(&mods_dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| self.config.is_package(path) || path.join(MANIFEST_FILE).is_file())
            .collect();
        packages.sort();

        let before = self.active.len();
        for path in packages {
            if self.tracked_paths.contains(&path) {
                continue;
            }
            let descriptor = match read_descriptor(&path) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    self.journal
                        .record(Severity::Error, None, format!("Unable to load {}: {}", path.display(), e));
                    continue;
                }
            };
            match self.discover_descriptor(descriptor) {
                Ok(DiscoverOutcome::Deferred(id)) => {
                    log::debug!("'{}' waits for dependencies: {:?}", id, self.unmet_dependencies(&id));
                }
                Ok(_) => {}
                Err(LoadError::DuplicateId(id)) => {
                    let message = format!("Unable to load {}: {}", path.display(), LoadError::DuplicateId(id.clone()));
                    self.journal.record(Severity::Error, Some(&id), message);
                }
                // Activation failures are journaled where they happen
                Err(e) => log::debug!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(self.active.len().saturating_sub(before))
    }

    /// Unload every mod, newest first, and clear the staging directory
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        while let Some(active) = self.active.pop() {
            self.teardown(active);
        }
        self.pending.clear();
        self.tracked_paths.clear();
        if let Err(e) = self.config.purge_staging() {
            log::warn!("Failed to purge staging directory: {}", e);
        }
        log::info!("Mod loader shut down");
    }

    // ========== Discovery ==========

    /// Read, validate and register the package at `path`
    pub fn discover(&mut self, path: impl AsRef<Path>) -> Result<DiscoverOutcome> {
        let path = path.as_ref();
        if self.tracked_paths.contains(path) {
            log::debug!("Skipping already known package {}", path.display());
            return Ok(DiscoverOutcome::Skipped);
        }

        let descriptor = read_descriptor(path)?;
        self.discover_descriptor(descriptor)
    }

    /// Register an already validated descriptor
    pub fn discover_descriptor(&mut self, descriptor: ModDescriptor) -> Result<DiscoverOutcome> {
        let id = descriptor.id.clone();
        if self.contains(&id) {
            return Err(LoadError::DuplicateId(id));
        }
        if !descriptor.package_path.as_os_str().is_empty() {
            self.tracked_paths.insert(descriptor.package_path.clone());
        }

        log::info!("Discovered '{}' {}", id, descriptor.version);
        self.pending.push(PendingMod { descriptor });

        let mut failures = self.settle();
        if let Some(index) = failures.iter().position(|(failed, _)| failed == &id) {
            return Err(failures.swap_remove(index).1);
        }
        if self.get(&id).is_some() {
            Ok(DiscoverOutcome::Activated(id))
        } else {
            Ok(DiscoverOutcome::Deferred(id))
        }
    }

    /// Drop a pending mod, e.g. because its package was removed
    pub fn forget(&mut self, id: &ModId) -> Result<ModDescriptor> {
        let index = self
            .pending
            .iter()
            .position(|pending| pending.id() == id)
            .ok_or_else(|| LoadError::NotPending(id.clone()))?;
        let PendingMod { descriptor } = self.pending.remove(index);
        self.tracked_paths.remove(&descriptor.package_path);
        self.settle();
        Ok(descriptor)
    }

    // ========== Activation ==========

    /// Activate a pending mod whose required dependencies are all loaded
    pub fn activate(&mut self, id: &ModId) -> Result<&ActiveMod> {
        self.refresh();
        self.activate_pending(id)?;
        self.settle();
        self.get(id).ok_or_else(|| LoadError::NotActive(id.clone()))
    }

    fn activate_pending(&mut self, id: &ModId) -> Result<()> {
        let index = self
            .pending
            .iter()
            .position(|pending| pending.id() == id)
            .ok_or_else(|| LoadError::NotPending(id.clone()))?;
        if !self.pending[index].descriptor.is_ready() {
            return Err(LoadError::UnresolvedDependencies {
                id: id.clone(),
                missing: self.pending[index].descriptor.unmet_dependencies(),
            });
        }

        let PendingMod { descriptor } = self.pending.remove(index);
        let Provisioned { instance, handle } = match self.provisioner.provision(&descriptor) {
            Ok(provisioned) => provisioned,
            Err(e) => {
                self.journal
                    .record(Severity::Error, Some(id), format!("Failed to load: {}", e));
                return Err(e);
            }
        };

        let mut active = ActiveMod {
            enabled: descriptor.is_ready(),
            descriptor,
            disable_cause: None,
            dependents: BTreeSet::new(),
            instance: Some(instance),
            handle,
        };

        let setup = match active.instance.as_mut() {
            Some(instance) => {
                let mut ctx = ModContext::new(&active.descriptor.id, &mut self.hooks, &mut self.patches, &mut self.journal);
                let result = instance.setup(&mut ctx);
                if result.is_ok() && !active.enabled {
                    instance.disable(&mut ctx);
                }
                result
            }
            None => Ok(()),
        };
        if let Err(e) = setup {
            self.release_owned(id);
            drop(active);
            self.journal
                .record(Severity::Error, Some(id), format!("Failed to load: {}", e));
            return Err(e);
        }

        if !active.enabled {
            active.disable_cause = Some(DisableCause::Dependencies);
            for error in self.hooks.suspend_owner(id) {
                self.journal.record(Severity::Warning, Some(id), error.to_string());
            }
        }

        log::info!(
            "Activated '{}' {} ({} hooks, {} patches)",
            id,
            active.descriptor.version,
            self.hooks.owned_by(id).len(),
            self.patches.owned_by(id).len()
        );
        self.active.push(active);
        self.relink();
        Ok(())
    }

    /// Run refreshes, enable/disable cascades and activations to a fixed point
    ///
    /// Activation failures are journaled and returned.
    fn settle(&mut self) -> Vec<(ModId, LoadError)> {
        let limit = 4 * (self.pending.len() + self.active.len() + 1);
        self.settle_within(limit)
    }

    /// [`settle`](Self::settle) giving up after `limit` steps
    fn settle_within(&mut self, limit: usize) -> Vec<(ModId, LoadError)> {
        let mut failures = Vec::new();
        let mut steps = 0;

        loop {
            self.refresh();
            if steps >= limit {
                log::warn!("Mod states did not settle after {} steps", steps);
                self.journal.record(
                    Severity::Critical,
                    None,
                    format!(
                        "Mod states did not settle after {} steps, {} mods still pending",
                        steps,
                        self.pending.len()
                    ),
                );
                break;
            }
            steps += 1;

            if self.sync_enabled_states() {
                continue;
            }

            let ready = self
                .pending
                .iter()
                .find(|pending| pending.descriptor.is_ready())
                .map(|pending| pending.id().clone());
            let Some(id) = ready else {
                break;
            };
            if let Err(e) = self.activate_pending(&id) {
                failures.push((id, e));
            }
        }

        self.relink();
        failures
    }

    /// Recompute dependency states and report new cycles and version mismatches
    fn refresh(&mut self) {
        let report = resolve::refresh_all(&mut self.pending, &mut self.active, self.config.version_policy);

        let cycles: HashSet<Vec<ModId>> = report.cycles.into_iter().collect();
        for cycle in cycles.difference(&self.reported_cycles) {
            let mut path = cycle.clone();
            path.extend(cycle.first().cloned());
            let error = LoadError::DependencyCycle(path);
            self.journal.record(Severity::Error, cycle.first(), error.to_string());
        }
        self.reported_cycles = cycles;

        let mismatches: HashSet<(ModId, ModId)> = report.version_mismatches.into_iter().collect();
        for (owner, target) in mismatches.difference(&self.reported_mismatches) {
            let wanted = self
                .descriptor(owner)
                .and_then(|descriptor| descriptor.dependency(target))
                .map(|dep| dep.min_version);
            let found = self.descriptor(target).map(|descriptor| descriptor.version);
            if let (Some(wanted), Some(found)) = (wanted, found) {
                self.journal.record(
                    Severity::Warning,
                    Some(owner),
                    format!("Wants '{}' {} or newer, found {}", target, wanted, found),
                );
            }
        }
        self.reported_mismatches = mismatches;
    }

    /// Disable or re-enable one active mod whose dependencies changed
    fn sync_enabled_states(&mut self) -> bool {
        for index in 0..self.active.len() {
            let active = &self.active[index];
            let ready = active.descriptor.is_ready();
            if active.enabled && !ready {
                let missing = active.descriptor.unmet_dependencies();
                let id = active.descriptor.id.clone();
                self.disable_at(index, DisableCause::Dependencies);
                self.journal.record(
                    Severity::Warning,
                    Some(&id),
                    format!("Disabled, required dependencies unavailable: {:?}", missing),
                );
                return true;
            }
            if !active.enabled && ready && active.disable_cause == Some(DisableCause::Dependencies) {
                let id = active.descriptor.id.clone();
                self.enable_at(index);
                self.journal
                    .record(Severity::Notice, Some(&id), "Re-enabled, dependencies are back");
                return true;
            }
        }
        false
    }

    fn disable_at(&mut self, index: usize, cause: DisableCause) {
        let Self {
            active,
            hooks,
            patches,
            journal,
            ..
        } = self;
        let Some(active) = active.get_mut(index) else {
            return;
        };
        for error in hooks.suspend_owner(&active.descriptor.id) {
            journal.record(Severity::Warning, Some(&active.descriptor.id), error.to_string());
        }
        let mut ctx = ModContext::new(&active.descriptor.id, hooks, patches, journal);
        if let Some(instance) = active.instance.as_mut() {
            instance.disable(&mut ctx);
        }
        active.enabled = false;
        active.disable_cause = Some(cause);
    }

    fn enable_at(&mut self, index: usize) {
        let Self {
            active,
            hooks,
            patches,
            journal,
            ..
        } = self;
        let Some(active) = active.get_mut(index) else {
            return;
        };
        for error in hooks.resume_owner(&active.descriptor.id) {
            journal.record(Severity::Warning, Some(&active.descriptor.id), error.to_string());
        }
        let mut ctx = ModContext::new(&active.descriptor.id, hooks, patches, journal);
        if let Some(instance) = active.instance.as_mut() {
            instance.enable(&mut ctx);
        }
        active.enabled = true;
        active.disable_cause = None;
    }

    /// Rebuild every active mod's set of active dependents
    fn relink(&mut self) {
        let links: Vec<(ModId, ModId)> = self
            .active
            .iter()
            .flat_map(|dependent| {
                dependent
                    .descriptor
                    .dependencies
                    .iter()
                    .filter(|dep| dep.loaded_ref.is_some())
                    .map(move |dep| (dep.target.clone(), dependent.descriptor.id.clone()))
            })
            .collect();
        for active in &mut self.active {
            active.dependents = links
                .iter()
                .filter(|(target, _)| target == &active.descriptor.id)
                .map(|(_, dependent)| dependent.clone())
                .collect();
        }
    }

    // ========== Enable / Unload ==========

    /// Enable or disable an active mod
    pub fn set_enabled(&mut self, id: &ModId, enabled: bool) -> Result<()> {
        let index = self.active_index(id).ok_or_else(|| LoadError::NotActive(id.clone()))?;
        let active = &mut self.active[index];

        if enabled {
            if active.enabled {
                return Ok(());
            }
            if !active.descriptor.is_ready() {
                return Err(LoadError::UnresolvedDependencies {
                    id: id.clone(),
                    missing: active.descriptor.unmet_dependencies(),
                });
            }
            self.enable_at(index);
            log::info!("Enabled '{}'", id);
        } else {
            if !active.enabled {
                active.disable_cause = Some(DisableCause::Explicit);
                return Ok(());
            }
            self.disable_at(index, DisableCause::Explicit);
            log::info!("Disabled '{}'", id);
        }

        self.settle();
        Ok(())
    }

    /// Unload an active mod, removing its hooks and restoring its patches
    pub fn unload(&mut self, id: &ModId) -> Result<()> {
        let index = self.active_index(id).ok_or_else(|| LoadError::NotActive(id.clone()))?;
        let active = self.active.remove(index);
        self.tracked_paths.remove(&active.descriptor.package_path);
        self.teardown(active);
        self.settle();
        Ok(())
    }

    fn teardown(&mut self, mut active: ActiveMod) {
        let id = active.descriptor.id.clone();
        let (hooks, patches) = self.release_owned(&id);
        if let Some(mut instance) = active.instance.take() {
            instance.unload();
        }
        drop(active);
        log::info!("Unloaded '{}' ({} hooks, {} patches removed)", id, hooks, patches);
    }

    /// Remove the hooks and restore the patches of `id`, journaling failures
    fn release_owned(&mut self, id: &ModId) -> (usize, usize) {
        let (hooks, errors) = self.hooks.remove_owned(id);
        for error in errors {
            self.journal
                .record(Severity::Warning, Some(id), format!("Hook released while still active: {}", error));
        }

        let patches = self.patches.owned_by(id).len();
        for (patch, error) in self.patches.restore_owned(id) {
            self.journal.record(
                Severity::Critical,
                Some(id),
                format!(
                    "Could not restore {} bytes at {:#x}, memory left patched: {}",
                    patch.len(),
                    patch.address,
                    error
                ),
            );
        }
        (hooks, patches)
    }

    // ========== Queries ==========

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn get(&self, id: &ModId) -> Option<&ActiveMod> {
        self.active.iter().find(|active| active.id() == id)
    }

    pub fn get_pending(&self, id: &ModId) -> Option<&PendingMod> {
        self.pending.iter().find(|pending| pending.id() == id)
    }

    /// Active mods in activation order
    pub fn active_mods(&self) -> &[ActiveMod] {
        &self.active
    }

    pub fn pending_mods(&self) -> &[PendingMod] {
        &self.pending
    }

    pub fn contains(&self, id: &ModId) -> bool {
        self.get(id).is_some() || self.get_pending(id).is_some()
    }

    /// Active and enabled
    pub fn is_loaded(&self, id: &ModId) -> bool {
        self.get(id).map_or(false, |active| active.enabled)
    }

    /// State a dependency on `id` would currently have
    pub fn state_of(&self, id: &ModId) -> ResolveState {
        if let Some(active) = self.get(id) {
            return if active.enabled {
                ResolveState::Loaded
            } else {
                ResolveState::Disabled
            };
        }
        match self.get_pending(id) {
            Some(pending) => resolve::classify(
                &pending.descriptor,
                &self.pending,
                &self.active,
                self.config.version_policy,
            ),
            None => ResolveState::Unloaded,
        }
    }

    /// Required dependencies of a known mod that are not loaded
    pub fn unmet_dependencies(&self, id: &ModId) -> Vec<ModId> {
        self.descriptor(id)
            .map(ModDescriptor::unmet_dependencies)
            .unwrap_or_default()
    }

    fn descriptor(&self, id: &ModId) -> Option<&ModDescriptor> {
        self.get(id)
            .map(|active| &active.descriptor)
            .or_else(|| self.get_pending(id).map(|pending| &pending.descriptor))
    }

    fn active_index(&self, id: &ModId) -> Option<usize> {
        self.active.iter().position(|active| active.id() == id)
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    pub fn patches(&self) -> &PatchManager {
        &self.patches
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }
}

/// Open the package at `path` and validate its manifest
fn read_descriptor(path: &Path) -> Result<ModDescriptor> {
    let document = ModPackage::open(path)?.manifest()?;
    manifest::validate(&document, path).map_err(|source| LoadError::Validation {
        path: path.to_path_buf(),
        source,
    })
}

impl Drop for ModRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ModRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModRegistry")
            .field("config", &self.config)
            .field("active", &self.active.iter().map(ActiveMod::id).collect::<Vec<_>>())
            .field("pending", &self.pending.iter().map(PendingMod::id).collect::<Vec<_>>())
            .field("hooks", &self.hooks)
            .field("patches", &self.patches)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::UnsupportedBackend;
    use crate::provision::FactoryProvisioner;
    use void_core::version;

    struct Quiet;

    impl ModInterface for Quiet {
        fn setup(&mut self, _ctx: &mut ModContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn registry(dir: &Path) -> ModRegistry {
        let mut provisioner = FactoryProvisioner::new();
        for id in ["a", "b"] {
            provisioner.register(id, |_| Ok(Box::new(Quiet) as Box<dyn ModInterface>));
        }
        ModRegistry::new(
            LoaderConfig::with_base_dir(dir),
            Box::new(provisioner),
            HookManager::new(Box::new(UnsupportedBackend)),
            PatchManager::native(),
        )
    }

    #[test]
    fn test_settle_step_limit_is_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path());
        registry.pending.push(PendingMod {
            descriptor: ModDescriptor::new("b", version!(1, 0, 0)).depends_on("a", version!(1, 0, 0), true),
        });
        registry.pending.push(PendingMod {
            descriptor: ModDescriptor::new("a", version!(1, 0, 0)),
        });

        assert!(registry.settle_within(1).is_empty());
        assert!(registry.is_loaded(&ModId::new("a")));
        assert!(registry.get_pending(&ModId::new("b")).is_some());
        assert!(registry
            .journal()
            .filter(&[Severity::Critical])
            .any(|entry| entry.message.contains("did not settle") && entry.message.contains("1 mods still pending")));

        assert!(registry.settle().is_empty());
        assert!(registry.is_loaded(&ModId::new("b")));
    }
}
