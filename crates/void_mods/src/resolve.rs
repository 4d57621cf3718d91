//! Dependency resolution
//!
//! The resolver recomputes the state of every declared dependency from
//! scratch whenever the mod population changes. References between mods are
//! plain [`ModId`]s looked up in the pending and active sets, so a mod that
//! leaves a set simply stops being found on the next refresh.
//!
//! Pending mods are walked depth-first along required dependencies. Reaching
//! a mod that is still on the walk stack means the required dependencies form
//! a cycle; every mod on it stays [`ResolveState::Unresolved`] and the cycle is
//! reported instead of being followed forever.

use crate::config::VersionPolicy;
use crate::manifest::{DependencyRequirement, ModDescriptor};
use std::collections::{HashMap, HashSet};
use void_core::{ModId, VersionInfo};

/// Resolution state of a single dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResolveState {
    /// Not looked at yet
    #[default]
    Unloaded,
    /// Target unknown, or pending with unmet required dependencies
    Unresolved,
    /// Target pending and able to activate
    Resolved,
    /// Target active and enabled
    Loaded,
    /// Target active but disabled
    Disabled,
}

impl ResolveState {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolveState::Unloaded => "unloaded",
            ResolveState::Unresolved => "unresolved",
            ResolveState::Resolved => "resolved",
            ResolveState::Loaded => "loaded",
            ResolveState::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for ResolveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mod as seen by the resolver
pub trait ResolveEntry {
    fn descriptor(&self) -> &ModDescriptor;

    fn descriptor_mut(&mut self) -> &mut ModDescriptor;

    /// Pending mods are never enabled
    fn is_enabled(&self) -> bool {
        false
    }
}

impl ResolveEntry for ModDescriptor {
    fn descriptor(&self) -> &ModDescriptor {
        self
    }

    fn descriptor_mut(&mut self) -> &mut ModDescriptor {
        self
    }
}

/// Outcome of [`refresh_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    /// Cycles of required dependencies, each rotated to start at its smallest ID
    pub cycles: Vec<Vec<ModId>>,
    /// `(dependent, dependency)` pairs whose found version is too old
    pub version_mismatches: Vec<(ModId, ModId)>,
    /// Whether any requirement changed
    pub changed: bool,
}

/// Recompute every requirement of every pending and active mod
pub fn refresh_all<P: ResolveEntry, A: ResolveEntry>(
    pending: &mut [P],
    active: &mut [A],
    policy: VersionPolicy,
) -> ResolveReport {
    let mut resolver = Resolver::new(pending, active, policy);
    let pending_ids: Vec<ModId> = pending.iter().map(|p| p.descriptor().id.clone()).collect();
    for id in &pending_ids {
        resolver.pending_status(id);
    }

    let cycle_edges: HashSet<(ModId, ModId)> = resolver
        .cycles
        .iter()
        .flat_map(|cycle| {
            cycle
                .iter()
                .zip(cycle.iter().cycle().skip(1))
                .map(|(from, to)| (from.clone(), to.clone()))
        })
        .collect();

    let mut report = ResolveReport::default();
    let descriptors = pending
        .iter_mut()
        .map(|p| p.descriptor_mut())
        .chain(active.iter_mut().map(|a| a.descriptor_mut()));
    for descriptor in descriptors {
        let owner = descriptor.id.clone();
        for requirement in &mut descriptor.dependencies {
            let link = resolver.link(&requirement.target, requirement.min_version);
            let in_cycle = cycle_edges.contains(&(owner.clone(), requirement.target.clone()));
            if link.version_mismatch {
                report
                    .version_mismatches
                    .push((owner.clone(), requirement.target.clone()));
            }
            report.changed |= link.apply(requirement, in_cycle);
        }
    }

    report.cycles = resolver.cycles;
    report
}

/// State a requirement on `descriptor` would get if it were pending
///
/// Pure: nothing in `pending` or `active` is modified.
pub fn classify<P: ResolveEntry, A: ResolveEntry>(
    descriptor: &ModDescriptor,
    pending: &[P],
    active: &[A],
    policy: VersionPolicy,
) -> ResolveState {
    let mut resolver = Resolver::new(pending, active, policy);
    if resolver.active.contains_key(&descriptor.id) {
        return if resolver.active[&descriptor.id].enabled {
            ResolveState::Loaded
        } else {
            ResolveState::Disabled
        };
    }
    let required: Vec<(ModId, VersionInfo)> = descriptor
        .dependencies
        .iter()
        .filter(|dep| dep.required)
        .map(|dep| (dep.target.clone(), dep.min_version))
        .collect();
    resolver.mark.insert(descriptor.id.clone(), Mark::Visiting);
    resolver.stack.push(descriptor.id.clone());
    let resolved = required.iter().all(|(target, min_version)| {
        matches!(
            resolver.link(target, *min_version).state,
            ResolveState::Resolved | ResolveState::Loaded
        )
    });
    if resolved {
        ResolveState::Resolved
    } else {
        ResolveState::Unresolved
    }
}

struct ActiveInfo {
    version: VersionInfo,
    enabled: bool,
}

struct PendingInfo {
    version: VersionInfo,
    required: Vec<(ModId, VersionInfo)>,
}

#[derive(Clone, Copy)]
enum Mark {
    Visiting,
    Done(ResolveState),
}

struct Link {
    state: ResolveState,
    loaded: bool,
    pending: bool,
    version_mismatch: bool,
}

impl Link {
    fn apply(&self, requirement: &mut DependencyRequirement, in_cycle: bool) -> bool {
        let target = &requirement.target;
        let loaded_ref = self.loaded.then(|| target.clone());
        let pending_ref = self.pending.then(|| target.clone());
        let changed = requirement.state != self.state
            || requirement.loaded_ref != loaded_ref
            || requirement.pending_ref != pending_ref
            || requirement.version_mismatch != self.version_mismatch
            || requirement.in_cycle != in_cycle;

        requirement.state = self.state;
        requirement.loaded_ref = loaded_ref;
        requirement.pending_ref = pending_ref;
        requirement.version_mismatch = self.version_mismatch;
        requirement.in_cycle = in_cycle;
        changed
    }
}

struct Resolver {
    active: HashMap<ModId, ActiveInfo>,
    pending: HashMap<ModId, PendingInfo>,
    policy: VersionPolicy,
    mark: HashMap<ModId, Mark>,
    stack: Vec<ModId>,
    cycles: Vec<Vec<ModId>>,
}

impl Resolver {
    fn new<P: ResolveEntry, A: ResolveEntry>(pending: &[P], active: &[A], policy: VersionPolicy) -> Self {
        let active = active
            .iter()
            .map(|entry| {
                let descriptor = entry.descriptor();
                let info = ActiveInfo {
                    version: descriptor.version,
                    enabled: entry.is_enabled(),
                };
                (descriptor.id.clone(), info)
            })
            .collect();
        let pending = pending
            .iter()
            .map(|entry| {
                let descriptor = entry.descriptor();
                let info = PendingInfo {
                    version: descriptor.version,
                    required: descriptor
                        .dependencies
                        .iter()
                        .filter(|dep| dep.required)
                        .map(|dep| (dep.target.clone(), dep.min_version))
                        .collect(),
                };
                (descriptor.id.clone(), info)
            })
            .collect();

        Self {
            active,
            pending,
            policy,
            mark: HashMap::new(),
            stack: Vec::new(),
            cycles: Vec::new(),
        }
    }

    /// Resolve a reference to `target`
    fn link(&mut self, target: &ModId, min_version: VersionInfo) -> Link {
        let (mut state, version, loaded, pending) = if let Some(info) = self.active.get(target) {
            let state = if info.enabled {
                ResolveState::Loaded
            } else {
                ResolveState::Disabled
            };
            (state, Some(info.version), true, false)
        } else if let Some(version) = self.pending.get(target).map(|info| info.version) {
            (self.pending_status(target), Some(version), false, true)
        } else {
            (ResolveState::Unresolved, None, false, false)
        };

        let version_mismatch = version.map_or(false, |found| !found.satisfies(&min_version));
        if version_mismatch && self.policy == VersionPolicy::Strict {
            state = ResolveState::Unresolved;
        }

        Link {
            state,
            loaded,
            pending,
            version_mismatch,
        }
    }

    /// Whether a pending mod could activate once its pending dependencies do
    fn pending_status(&mut self, id: &ModId) -> ResolveState {
        match self.mark.get(id) {
            Some(Mark::Done(state)) => return *state,
            Some(Mark::Visiting) => {
                self.record_cycle(id);
                return ResolveState::Unresolved;
            }
            None => {}
        }

        let required = match self.pending.get(id) {
            Some(info) => info.required.clone(),
            None => return ResolveState::Unresolved,
        };

        self.mark.insert(id.clone(), Mark::Visiting);
        self.stack.push(id.clone());
        let mut resolved = true;
        for (target, min_version) in &required {
            let link = self.link(target, *min_version);
            if !matches!(link.state, ResolveState::Resolved | ResolveState::Loaded) {
                resolved = false;
            }
        }
        self.stack.pop();

        let state = if resolved {
            ResolveState::Resolved
        } else {
            ResolveState::Unresolved
        };
        self.mark.insert(id.clone(), Mark::Done(state));
        state
    }

    fn record_cycle(&mut self, id: &ModId) {
        let Some(start) = self.stack.iter().position(|entry| entry == id) else {
            return;
        };
        let mut cycle = self.stack[start..].to_vec();
        if let Some(min) = cycle
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.cmp(b.1))
            .map(|(index, _)| index)
        {
            cycle.rotate_left(min);
        }
        if !self.cycles.contains(&cycle) {
            self.cycles.push(cycle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use void_core::version;

    struct Active(ModDescriptor, bool);

    impl ResolveEntry for Active {
        fn descriptor(&self) -> &ModDescriptor {
            &self.0
        }

        fn descriptor_mut(&mut self) -> &mut ModDescriptor {
            &mut self.0
        }

        fn is_enabled(&self) -> bool {
            self.1
        }
    }

    fn desc(id: &str) -> ModDescriptor {
        ModDescriptor::new(id, version!(1, 0, 0))
    }

    fn state(mods: &[ModDescriptor], owner: &str, target: &str) -> ResolveState {
        mods.iter()
            .find(|m| m.id.matches(owner))
            .and_then(|m| m.dependency(&ModId::new(target)))
            .map(|dep| dep.state)
            .unwrap_or(ResolveState::Unloaded)
    }

    #[test]
    fn test_missing_target_is_unresolved() {
        let mut pending = vec![desc("b").depends_on("a", VersionInfo::ZERO, true)];
        let report = refresh_all(&mut pending, &mut Vec::<Active>::new(), VersionPolicy::Soft);
        assert!(report.changed);
        assert_eq!(state(&pending, "b", "a"), ResolveState::Unresolved);
        assert!(!pending[0].is_ready());
    }

    #[test]
    fn test_active_target() {
        let mut pending = vec![
            desc("b").depends_on("a", VersionInfo::ZERO, true),
            desc("c").depends_on("d", VersionInfo::ZERO, true),
        ];
        let mut active = vec![Active(desc("a"), true), Active(desc("d"), false)];
        refresh_all(&mut pending, &mut active, VersionPolicy::Soft);

        assert_eq!(state(&pending, "b", "a"), ResolveState::Loaded);
        assert_eq!(pending[0].dependencies[0].loaded_ref, Some(ModId::new("a")));
        assert!(pending[0].is_ready());
        assert_eq!(state(&pending, "c", "d"), ResolveState::Disabled);
        assert!(!pending[1].is_ready());
    }

    #[test]
    fn test_pending_chain() {
        // c -> b -> a, with a pending and dependency free
        let mut pending = vec![
            desc("c").depends_on("b", VersionInfo::ZERO, true),
            desc("b").depends_on("a", VersionInfo::ZERO, true),
            desc("a"),
        ];
        refresh_all(&mut pending, &mut Vec::<Active>::new(), VersionPolicy::Soft);
        assert_eq!(state(&pending, "c", "b"), ResolveState::Resolved);
        assert_eq!(state(&pending, "b", "a"), ResolveState::Resolved);
        assert_eq!(pending[0].dependencies[0].pending_ref, Some(ModId::new("b")));
        assert!(pending[2].is_ready());
        assert!(!pending[0].is_ready());
    }

    #[test]
    fn test_optional_dependency_never_blocks() {
        let mut pending = vec![desc("b").depends_on("missing", VersionInfo::ZERO, false)];
        refresh_all(&mut pending, &mut Vec::<Active>::new(), VersionPolicy::Soft);
        assert_eq!(state(&pending, "b", "missing"), ResolveState::Unresolved);
        assert!(pending[0].is_ready());
    }

    #[test]
    fn test_cycle_detected() {
        let mut pending = vec![
            desc("b").depends_on("a", VersionInfo::ZERO, true),
            desc("a").depends_on("b", VersionInfo::ZERO, true),
            desc("c").depends_on("a", VersionInfo::ZERO, true),
        ];
        let report = refresh_all(&mut pending, &mut Vec::<Active>::new(), VersionPolicy::Soft);

        assert_eq!(report.cycles, vec![vec![ModId::new("a"), ModId::new("b")]]);
        assert_eq!(state(&pending, "a", "b"), ResolveState::Unresolved);
        assert_eq!(state(&pending, "b", "a"), ResolveState::Unresolved);
        assert_eq!(state(&pending, "c", "a"), ResolveState::Unresolved);
        assert!(pending[0].dependencies[0].in_cycle);
        assert!(pending[1].dependencies[0].in_cycle);
        assert!(!pending[2].dependencies[0].in_cycle);
    }

    #[test]
    fn test_optional_cycle_is_not_a_cycle() {
        let mut pending = vec![
            desc("a").depends_on("b", VersionInfo::ZERO, false),
            desc("b").depends_on("a", VersionInfo::ZERO, false),
        ];
        let report = refresh_all(&mut pending, &mut Vec::<Active>::new(), VersionPolicy::Soft);
        assert!(report.cycles.is_empty());
        assert_eq!(state(&pending, "a", "b"), ResolveState::Resolved);
        assert!(pending.iter().all(|m| m.is_ready()));
    }

    #[test]
    fn test_version_policy() {
        let make = || {
            (
                vec![desc("b").depends_on("a", version!(2, 0, 0), true)],
                vec![Active(desc("a"), true)],
            )
        };

        let (mut pending, mut active) = make();
        let report = refresh_all(&mut pending, &mut active, VersionPolicy::Soft);
        assert_eq!(report.version_mismatches, vec![(ModId::new("b"), ModId::new("a"))]);
        assert_eq!(state(&pending, "b", "a"), ResolveState::Loaded);
        assert!(pending[0].dependencies[0].version_mismatch);

        let (mut pending, mut active) = make();
        refresh_all(&mut pending, &mut active, VersionPolicy::Strict);
        assert_eq!(state(&pending, "b", "a"), ResolveState::Unresolved);
        assert!(!pending[0].is_ready());
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let mut pending = vec![
            desc("c").depends_on("b", VersionInfo::ZERO, true),
            desc("b").depends_on("a", version!(3, 0, 0), true),
            desc("x").depends_on("y", VersionInfo::ZERO, true),
            desc("y").depends_on("x", VersionInfo::ZERO, true),
        ];
        let mut active = vec![Active(desc("a"), true)];
        let first = refresh_all(&mut pending, &mut active, VersionPolicy::Soft);
        assert!(first.changed);
        let snapshot = pending.iter().map(|m| m.dependencies.clone()).collect::<Vec<_>>();

        let second = refresh_all(&mut pending, &mut active, VersionPolicy::Soft);
        assert!(!second.changed);
        assert_eq!(second.cycles, first.cycles);
        let after = pending.iter().map(|m| m.dependencies.clone()).collect::<Vec<_>>();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn test_stale_references_cleared() {
        let mut pending = vec![desc("b").depends_on("a", VersionInfo::ZERO, true)];
        let mut active = vec![Active(desc("a"), true)];
        refresh_all(&mut pending, &mut active, VersionPolicy::Soft);
        assert!(pending[0].dependencies[0].loaded_ref.is_some());

        active.clear();
        refresh_all(&mut pending, &mut active, VersionPolicy::Soft);
        let dep = &pending[0].dependencies[0];
        assert_eq!(dep.state, ResolveState::Unresolved);
        assert!(dep.loaded_ref.is_none());
        assert!(dep.pending_ref.is_none());
    }

    #[test]
    fn test_classify_is_pure() {
        let pending = vec![desc("a")];
        let candidate = desc("b").depends_on("a", VersionInfo::ZERO, true);
        let empty: Vec<Active> = Vec::new();
        assert_eq!(
            classify(&candidate, &pending, &empty, VersionPolicy::Soft),
            ResolveState::Resolved
        );
        assert_eq!(pending[0].dependencies.len(), 0);

        let orphan = desc("c").depends_on("z", VersionInfo::ZERO, true);
        assert_eq!(
            classify(&orphan, &pending, &empty, VersionPolicy::Soft),
            ResolveState::Unresolved
        );
    }
}
