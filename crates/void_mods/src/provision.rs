//! Turning a descriptor into a running mod instance
//!
//! [`NativeProvisioner`] extracts the binary from the package when needed,
//! loads it with `libloading` and resolves its entry points.
//! [`FactoryProvisioner`] builds mods linked into the host itself.

use crate::context::ModInterface;
use crate::error::LoadError;
use crate::ffi;
use crate::manifest::ModDescriptor;
use crate::package::{self, ModPackage};
use libloading::Library;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use void_core::ModId;

/// A provisioned mod: its behavior plus the resources keeping it alive
pub struct Provisioned {
    pub instance: Box<dyn ModInterface>,
    pub handle: PlatformHandle,
}

/// Loads the code behind a descriptor
pub trait BinaryProvisioner {
    fn provision(&mut self, descriptor: &ModDescriptor) -> Result<Provisioned, LoadError>;
}

/// Loaded library of a mod, plus its staged copy if one was extracted
///
/// Dropping the handle unloads the library and deletes the staged file. The
/// mod instance must be dropped first.
#[derive(Default)]
pub struct PlatformHandle {
    library: Option<Library>,
    staged: Option<PathBuf>,
}

impl PlatformHandle {
    /// Handle owning nothing, for in-process mods
    pub fn none() -> Self {
        Self::default()
    }

    pub fn library(&self) -> Option<&Library> {
        self.library.as_ref()
    }

    pub fn staged_path(&self) -> Option<&Path> {
        self.staged.as_deref()
    }
}

impl Drop for PlatformHandle {
    fn drop(&mut self) {
        if let Some(library) = self.library.take() {
            if let Err(e) = library.close() {
                log::warn!("Failed to unload mod library: {}", e);
            }
        }
        if let Some(staged) = self.staged.take() {
            if let Err(e) = std::fs::remove_file(&staged) {
                log::warn!("Failed to delete staged binary {}: {}", staged.display(), e);
            }
        }
    }
}

impl fmt::Debug for PlatformHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformHandle")
            .field("loaded", &self.library.is_some())
            .field("staged", &self.staged)
            .finish()
    }
}

/// Loads mod binaries from packages with the platform's dynamic loader
#[derive(Debug, Clone)]
pub struct NativeProvisioner {
    staging_dir: PathBuf,
}

impl NativeProvisioner {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }
}

impl BinaryProvisioner for NativeProvisioner {
    fn provision(&mut self, descriptor: &ModDescriptor) -> Result<Provisioned, LoadError> {
        let id = &descriptor.id;
        let name = &descriptor.binary_name;
        let mut package = ModPackage::open(&descriptor.package_path)?;

        let staging = package::child_path(&self.staging_dir, id.as_str())
            .map_err(|e| LoadError::binary_load_failed(id, &descriptor.package_path, e.to_string()))?;
        let (binary, staged) = package
            .materialize(name, &staging)
            .map_err(|e| LoadError::binary_load_failed(id, &descriptor.package_path, e.to_string()))?
            .ok_or_else(|| {
                LoadError::binary_load_failed(
                    id,
                    &descriptor.package_path,
                    format!("package has no binary named '{}'", name),
                )
            })?;

        let mut handle = PlatformHandle {
            library: None,
            staged: staged.then(|| binary.clone()),
        };

        // Safety: loading a mod runs its initializers; mods are trusted code
        let library = unsafe { Library::new(&binary) }
            .map_err(|e| LoadError::binary_load_failed(id, &binary, e.to_string()))?;
        let library = handle.library.insert(library);

        // Safety: `handle` outlives the instance, the registry drops them in that order
        let instance = unsafe { ffi::instantiate(library, id, &binary)? };
        log::info!("Loaded binary of '{}' from {}", id, binary.display());
        Ok(Provisioned { instance, handle })
    }
}

/// Constructor of an in-process mod
pub type ModFactory = Box<dyn FnMut(&ModDescriptor) -> Result<Box<dyn ModInterface>, String>>;

/// Provisions mods from registered constructors, by ID
///
/// IDs without a factory go to the fallback provisioner, if any.
#[derive(Default)]
pub struct FactoryProvisioner {
    factories: HashMap<ModId, ModFactory>,
    fallback: Option<Box<dyn BinaryProvisioner>>,
}

impl FactoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisioner falling back to `fallback` for unknown IDs
    pub fn with_fallback(fallback: Box<dyn BinaryProvisioner>) -> Self {
        Self {
            factories: HashMap::new(),
            fallback: Some(fallback),
        }
    }

    /// Register a constructor, replacing any previous one for `id`
    pub fn register<F>(&mut self, id: impl Into<ModId>, factory: F) -> &mut Self
    where
        F: FnMut(&ModDescriptor) -> Result<Box<dyn ModInterface>, String> + 'static,
    {
        self.factories.insert(id.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, id: &ModId) -> bool {
        self.factories.contains_key(id)
    }
}

impl BinaryProvisioner for FactoryProvisioner {
    fn provision(&mut self, descriptor: &ModDescriptor) -> Result<Provisioned, LoadError> {
        let Some(factory) = self.factories.get_mut(&descriptor.id) else {
            return match self.fallback.as_mut() {
                Some(fallback) => fallback.provision(descriptor),
                None => Err(LoadError::binary_load_failed(
                    &descriptor.id,
                    &descriptor.package_path,
                    "no factory registered",
                )),
            };
        };

        let instance = factory(descriptor)
            .map_err(|reason| LoadError::binary_load_failed(&descriptor.id, &descriptor.package_path, reason))?;
        Ok(Provisioned {
            instance,
            handle: PlatformHandle::none(),
        })
    }
}

impl fmt::Debug for FactoryProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryProvisioner")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModContext;
    use crate::package::MANIFEST_FILE;
    use void_core::version;

    struct Noop;

    impl ModInterface for Noop {
        fn setup(&mut self, _ctx: &mut ModContext<'_>) -> Result<(), LoadError> {
            Ok(())
        }
    }

    #[test]
    fn test_factory_provisioner() {
        let mut provisioner = FactoryProvisioner::new();
        provisioner
            .register("good", |_| Ok(Box::new(Noop) as Box<dyn ModInterface>))
            .register("bad", |_| Err("refused".to_string()));

        let good = ModDescriptor::new("GOOD", version!(1, 0, 0));
        let provisioned = provisioner.provision(&good).unwrap();
        assert!(provisioned.handle.library().is_none());

        let bad = ModDescriptor::new("bad", version!(1, 0, 0));
        assert!(matches!(
            provisioner.provision(&bad),
            Err(LoadError::BinaryLoadFailed { reason, .. }) if reason == "refused"
        ));

        let unknown = ModDescriptor::new("unknown", version!(1, 0, 0));
        assert!(matches!(provisioner.provision(&unknown), Err(LoadError::BinaryLoadFailed { .. })));
    }

    #[test]
    fn test_native_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"{}").unwrap();
        let descriptor = ModDescriptor::new("m", version!(1, 0, 0)).with_package_path(dir.path());

        let mut provisioner = NativeProvisioner::new(dir.path().join("temp"));
        assert!(matches!(
            provisioner.provision(&descriptor),
            Err(LoadError::BinaryLoadFailed { .. })
        ));
    }

    #[test]
    fn test_native_rejects_non_library() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = ModDescriptor::new("m", version!(1, 0, 0)).with_package_path(dir.path());
        descriptor.binary_name = "not_a_library.bin".to_string();
        std::fs::write(dir.path().join(&descriptor.binary_name), b"definitely not code").unwrap();

        let mut provisioner = NativeProvisioner::new(dir.path().join("temp"));
        assert!(matches!(
            provisioner.provision(&descriptor),
            Err(LoadError::BinaryLoadFailed { .. })
        ));
    }

    #[test]
    fn test_native_refuses_to_stage_outside_staging_dir() {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        std::fs::create_dir_all(&victim).unwrap();
        std::fs::write(victim.join("mod.so"), b"precious user data").unwrap();

        let package = dir.path().join("mods").join("evil.vmod");
        std::fs::create_dir_all(package.parent().unwrap()).unwrap();
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&package).unwrap());
        zip.start_file("mod.so", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"not a library").unwrap();
        zip.finish().unwrap();

        let mut descriptor = ModDescriptor::new(ModId::new(".."), version!(1, 0, 0)).with_package_path(&package);
        descriptor.binary_name = "mod.so".to_string();
        let mut provisioner = NativeProvisioner::new(dir.path().join("temp"));
        assert!(matches!(
            provisioner.provision(&descriptor),
            Err(LoadError::BinaryLoadFailed { .. })
        ));

        descriptor.id = ModId::new("evil");
        descriptor.binary_name = "../../victim/mod.so".to_string();
        assert!(matches!(
            provisioner.provision(&descriptor),
            Err(LoadError::BinaryLoadFailed { .. })
        ));

        assert_eq!(std::fs::read(victim.join("mod.so")).unwrap(), b"precious user data");
    }

    #[test]
    fn test_handle_removes_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("mod.so");
        std::fs::write(&staged, b"x").unwrap();
        drop(PlatformHandle {
            library: None,
            staged: Some(staged.clone()),
        });
        assert!(!staged.exists());
    }
}
