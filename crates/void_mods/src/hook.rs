//! Code hooks
//!
//! A hook redirects execution at an address to a mod-supplied detour. The
//! [`HookManager`] tracks every hook, its owner and whether it is active;
//! the actual code rewriting is done by a [`HookBackend`].

use crate::error::HookError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use void_core::ModId;

/// Unique identifier for an installed hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(u64);

impl HookId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Backend-specific handle of a detour
pub type HookToken = u64;

/// Platform primitive that rewrites code
pub trait HookBackend {
    /// Create a detour from `address` to `detour`, initially inactive
    fn install(&mut self, address: usize, detour: usize) -> Result<HookToken, HookError>;

    /// Activate or deactivate a detour
    fn set_enabled(&mut self, token: HookToken, enabled: bool) -> Result<(), HookError>;

    /// Free a detour; it is already inactive
    fn release(&mut self, token: HookToken);
}

/// An installed hook
#[derive(Debug, Clone)]
pub struct Hook {
    pub id: HookId,
    pub address: usize,
    pub detour: usize,
    pub owner: ModId,
    token: HookToken,
    enabled: bool,
    /// Was enabled when its owner was suspended
    suspended: bool,
}

impl Hook {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }
}

/// Registry of every hook installed by mods
pub struct HookManager {
    backend: Box<dyn HookBackend>,
    hooks: BTreeMap<HookId, Hook>,
    by_address: HashMap<usize, HookId>,
    next_id: u64,
}

impl HookManager {
    pub fn new(backend: Box<dyn HookBackend>) -> Self {
        Self {
            backend,
            hooks: BTreeMap::new(),
            by_address: HashMap::new(),
            next_id: 1,
        }
    }

    /// Manager using the detour backend of this platform
    pub fn native() -> Self {
        Self::new(default_backend())
    }

    /// Install a hook for `owner`, left disabled
    ///
    /// Hooking an address the same owner already hooks returns the existing
    /// hook.
    pub fn install(&mut self, owner: &ModId, address: usize, detour: usize) -> Result<HookId, HookError> {
        if let Some(existing) = self.by_address.get(&address).and_then(|id| self.hooks.get(id)) {
            if &existing.owner != owner {
                return Err(HookError::AddressConflict {
                    address,
                    owner: existing.owner.clone(),
                });
            }
            if existing.detour != detour {
                log::warn!(
                    "Mod '{}' hooked {:#x} again with a different detour, keeping the first",
                    owner,
                    address
                );
            }
            return Ok(existing.id);
        }

        let token = self.backend.install(address, detour)?;
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.hooks.insert(
            id,
            Hook {
                id,
                address,
                detour,
                owner: owner.clone(),
                token,
                enabled: false,
                suspended: false,
            },
        );
        self.by_address.insert(address, id);
        log::debug!("Mod '{}' installed hook {} at {:#x}", owner, id, address);
        Ok(id)
    }

    pub fn enable(&mut self, id: HookId) -> Result<(), HookError> {
        self.set_enabled(id, true)
    }

    pub fn disable(&mut self, id: HookId) -> Result<(), HookError> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&mut self, id: HookId, enabled: bool) -> Result<(), HookError> {
        let hook = self.hooks.get_mut(&id).ok_or(HookError::NotFound(id))?;
        hook.suspended = false;
        if hook.enabled == enabled {
            return Ok(());
        }
        self.backend.set_enabled(hook.token, enabled)?;
        hook.enabled = enabled;
        Ok(())
    }

    /// Disable if needed and release a hook
    pub fn remove(&mut self, id: HookId) -> Result<Hook, HookError> {
        let (hook, disable_error) = self.take(id)?;
        if let Some(e) = disable_error {
            log::warn!("Released hook {} while still active: {}", id, e);
        }
        Ok(hook)
    }

    /// Release a hook even if disabling it fails, returning that failure
    fn take(&mut self, id: HookId) -> Result<(Hook, Option<HookError>), HookError> {
        let mut hook = self.hooks.remove(&id).ok_or(HookError::NotFound(id))?;
        self.by_address.remove(&hook.address);
        let mut disable_error = None;
        if hook.enabled {
            disable_error = self.backend.set_enabled(hook.token, false).err();
            hook.enabled = false;
        }
        self.backend.release(hook.token);
        log::debug!("Removed hook {} of '{}' at {:#x}", id, hook.owner, hook.address);
        Ok((hook, disable_error))
    }

    /// Disable every enabled hook of `owner`, remembering which were active
    pub fn suspend_owner(&mut self, owner: &ModId) -> Vec<HookError> {
        let mut errors = Vec::new();
        for hook in self.hooks.values_mut().filter(|hook| &hook.owner == owner) {
            if !hook.enabled {
                continue;
            }
            match self.backend.set_enabled(hook.token, false) {
                Ok(()) => {
                    hook.enabled = false;
                    hook.suspended = true;
                }
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    /// Re-enable the hooks [`suspend_owner`](Self::suspend_owner) disabled
    pub fn resume_owner(&mut self, owner: &ModId) -> Vec<HookError> {
        let mut errors = Vec::new();
        for hook in self.hooks.values_mut().filter(|hook| &hook.owner == owner) {
            if !hook.suspended {
                continue;
            }
            match self.backend.set_enabled(hook.token, true) {
                Ok(()) => {
                    hook.enabled = true;
                    hook.suspended = false;
                }
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    /// Remove every hook of `owner`
    ///
    /// Returns how many were removed, plus the failures to disable them
    /// before release.
    pub fn remove_owned(&mut self, owner: &ModId) -> (usize, Vec<HookError>) {
        let owned = self.owned_by(owner);
        let mut errors = Vec::new();
        for id in &owned {
            match self.take(*id) {
                Ok((_, None)) => {}
                Ok((_, Some(e))) | Err(e) => errors.push(e),
            }
        }
        (owned.len(), errors)
    }

    /// Look up a hook that must belong to `caller`
    pub fn owned(&self, id: HookId, caller: &ModId) -> Result<&Hook, HookError> {
        let hook = self.hooks.get(&id).ok_or(HookError::NotFound(id))?;
        if &hook.owner != caller {
            return Err(HookError::NotOwner {
                hook: id,
                caller: caller.clone(),
            });
        }
        Ok(hook)
    }

    pub fn get(&self, id: HookId) -> Option<&Hook> {
        self.hooks.get(&id)
    }

    pub fn at_address(&self, address: usize) -> Option<&Hook> {
        self.by_address.get(&address).and_then(|id| self.hooks.get(id))
    }

    /// Hooks of `owner` in installation order
    pub fn owned_by(&self, owner: &ModId) -> Vec<HookId> {
        self.hooks
            .values()
            .filter(|hook| &hook.owner == owner)
            .map(|hook| hook.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hook> {
        self.hooks.values()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for HookManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookManager")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Detour backend of this platform
pub fn default_backend() -> Box<dyn HookBackend> {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        Box::new(DetourBackend::new())
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        Box::new(UnsupportedBackend)
    }
}

/// Inline detours through `retour`
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[derive(Default)]
pub struct DetourBackend {
    detours: HashMap<HookToken, (usize, retour::RawDetour)>,
    next_token: HookToken,
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl DetourBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl HookBackend for DetourBackend {
    fn install(&mut self, address: usize, detour: usize) -> Result<HookToken, HookError> {
        // Safety: the mod vouches that both addresses are functions with the same ABI
        let raw = unsafe { retour::RawDetour::new(address as *const (), detour as *const ()) }
            .map_err(|e| HookError::InstallFailed {
                address,
                reason: e.to_string(),
            })?;
        let token = self.next_token;
        self.next_token += 1;
        self.detours.insert(token, (address, raw));
        Ok(token)
    }

    fn set_enabled(&mut self, token: HookToken, enabled: bool) -> Result<(), HookError> {
        let (address, raw) = self.detours.get(&token).ok_or_else(|| HookError::ToggleFailed {
            address: 0,
            reason: format!("unknown detour token {}", token),
        })?;
        // Safety: the detour was created by `install` and is still alive
        let result = unsafe {
            if enabled {
                raw.enable()
            } else {
                raw.disable()
            }
        };
        result.map_err(|e| HookError::ToggleFailed {
            address: *address,
            reason: e.to_string(),
        })
    }

    fn release(&mut self, token: HookToken) {
        self.detours.remove(&token);
    }
}

/// Backend for targets without a detour implementation
#[derive(Debug, Default)]
pub struct UnsupportedBackend;

impl HookBackend for UnsupportedBackend {
    fn install(&mut self, _address: usize, _detour: usize) -> Result<HookToken, HookError> {
        Err(HookError::Unsupported)
    }

    fn set_enabled(&mut self, _token: HookToken, _enabled: bool) -> Result<(), HookError> {
        Err(HookError::Unsupported)
    }

    fn release(&mut self, _token: HookToken) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// token -> (address, active)
    type Detours = Rc<RefCell<HashMap<HookToken, (usize, bool)>>>;

    #[derive(Default)]
    struct FakeBackend {
        detours: Detours,
        next: HookToken,
        fail_toggle: Rc<Cell<bool>>,
    }

    impl HookBackend for FakeBackend {
        fn install(&mut self, address: usize, _detour: usize) -> Result<HookToken, HookError> {
            if address == 0 {
                return Err(HookError::InstallFailed { address, reason: "null".into() });
            }
            self.next += 1;
            self.detours.borrow_mut().insert(self.next, (address, false));
            Ok(self.next)
        }

        fn set_enabled(&mut self, token: HookToken, enabled: bool) -> Result<(), HookError> {
            if self.fail_toggle.get() {
                return Err(HookError::ToggleFailed { address: 0, reason: "locked".into() });
            }
            let mut detours = self.detours.borrow_mut();
            let entry = detours.get_mut(&token).unwrap();
            entry.1 = enabled;
            Ok(())
        }

        fn release(&mut self, token: HookToken) {
            self.detours.borrow_mut().remove(&token);
        }
    }

    fn manager() -> (HookManager, Detours) {
        let backend = FakeBackend::default();
        let detours = backend.detours.clone();
        (HookManager::new(Box::new(backend)), detours)
    }

    #[test]
    fn test_install_starts_disabled() {
        let (mut hooks, detours) = manager();
        let owner = ModId::new("a");
        let id = hooks.install(&owner, 0x1000, 0x2000).unwrap();
        assert!(!hooks.get(id).unwrap().is_enabled());
        assert_eq!(detours.borrow().values().next(), Some(&(0x1000, false)));

        hooks.enable(id).unwrap();
        assert!(hooks.get(id).unwrap().is_enabled());
        assert!(detours.borrow().values().all(|d| d.1));
        hooks.disable(id).unwrap();
        assert!(detours.borrow().values().all(|d| !d.1));
    }

    #[test]
    fn test_address_conflict_and_idempotence() {
        let (mut hooks, _) = manager();
        let a = ModId::new("a");
        let b = ModId::new("b");
        let id = hooks.install(&a, 0x1000, 0x2000).unwrap();
        assert_eq!(hooks.install(&ModId::new("A"), 0x1000, 0x2000).unwrap(), id);
        assert_eq!(hooks.len(), 1);
        assert_eq!(
            hooks.install(&b, 0x1000, 0x3000).unwrap_err(),
            HookError::AddressConflict { address: 0x1000, owner: a }
        );
    }

    #[test]
    fn test_install_failure() {
        let (mut hooks, _) = manager();
        assert!(matches!(
            hooks.install(&ModId::new("a"), 0, 0x2000),
            Err(HookError::InstallFailed { .. })
        ));
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_remove_disables_first() {
        let (mut hooks, detours) = manager();
        let id = hooks.install(&ModId::new("a"), 0x1000, 0x2000).unwrap();
        hooks.enable(id).unwrap();
        let removed = hooks.remove(id).unwrap();
        assert!(!removed.is_enabled());
        assert!(detours.borrow().is_empty());
        assert!(hooks.at_address(0x1000).is_none());
        assert_eq!(hooks.remove(id).unwrap_err(), HookError::NotFound(id));
    }

    #[test]
    fn test_toggle_failure_keeps_state() {
        let backend = FakeBackend::default();
        backend.fail_toggle.set(true);
        let mut hooks = HookManager::new(Box::new(backend));
        let id = hooks.install(&ModId::new("a"), 0x1000, 0x2000).unwrap();
        assert!(matches!(hooks.enable(id), Err(HookError::ToggleFailed { .. })));
        assert!(!hooks.get(id).unwrap().is_enabled());
    }

    #[test]
    fn test_suspend_resume_only_restores_active_hooks() {
        let (mut hooks, _) = manager();
        let a = ModId::new("a");
        let on = hooks.install(&a, 0x1000, 0x2000).unwrap();
        let off = hooks.install(&a, 0x1100, 0x2100).unwrap();
        let other = hooks.install(&ModId::new("b"), 0x1200, 0x2200).unwrap();
        hooks.enable(on).unwrap();
        hooks.enable(other).unwrap();

        assert!(hooks.suspend_owner(&a).is_empty());
        assert!(!hooks.get(on).unwrap().is_enabled());
        assert!(hooks.get(on).unwrap().is_suspended());
        assert!(hooks.get(other).unwrap().is_enabled());

        assert!(hooks.resume_owner(&a).is_empty());
        assert!(hooks.get(on).unwrap().is_enabled());
        assert!(!hooks.get(off).unwrap().is_enabled());
    }

    #[test]
    fn test_remove_owned() {
        let (mut hooks, detours) = manager();
        let a = ModId::new("a");
        hooks.install(&a, 0x1000, 0x2000).unwrap();
        let second = hooks.install(&a, 0x1100, 0x2100).unwrap();
        hooks.install(&ModId::new("b"), 0x1200, 0x2200).unwrap();
        hooks.enable(second).unwrap();

        let (removed, errors) = hooks.remove_owned(&a);
        assert_eq!(removed, 2);
        assert!(errors.is_empty());
        assert_eq!(hooks.len(), 1);
        assert_eq!(detours.borrow().len(), 1);
        assert!(hooks.owned_by(&a).is_empty());
    }

    #[test]
    fn test_remove_owned_reports_disable_failures() {
        let backend = FakeBackend::default();
        let fail_toggle = backend.fail_toggle.clone();
        let detours = backend.detours.clone();
        let mut hooks = HookManager::new(Box::new(backend));
        let a = ModId::new("a");
        let on = hooks.install(&a, 0x1000, 0x2000).unwrap();
        hooks.install(&a, 0x1100, 0x2100).unwrap();
        hooks.enable(on).unwrap();

        fail_toggle.set(true);
        let (removed, errors) = hooks.remove_owned(&a);
        assert_eq!(removed, 2);
        assert!(matches!(errors.as_slice(), [HookError::ToggleFailed { .. }]));
        assert!(hooks.is_empty());
        assert!(detours.borrow().is_empty());
    }

    #[test]
    fn test_ownership_check() {
        let (mut hooks, _) = manager();
        let id = hooks.install(&ModId::new("a"), 0x1000, 0x2000).unwrap();
        assert!(hooks.owned(id, &ModId::new("a")).is_ok());
        assert!(matches!(
            hooks.owned(id, &ModId::new("b")),
            Err(HookError::NotOwner { .. })
        ));
    }

    #[test]
    fn test_unsupported_backend() {
        let mut hooks = HookManager::new(Box::new(UnsupportedBackend));
        assert_eq!(
            hooks.install(&ModId::new("a"), 0x1000, 0x2000).unwrap_err(),
            HookError::Unsupported
        );
    }
}
