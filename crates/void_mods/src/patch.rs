//! Byte patches
//!
//! A patch overwrites a byte range with new bytes of the same length. The
//! original bytes are read before anything is written and are the only thing
//! restore ever writes back.

use crate::error::PatchError;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::ops::Range;
use void_core::ModId;

/// Unique identifier for an applied patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatchId(u64);

impl PatchId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw access to the memory patches are applied to
pub trait MemoryAccess {
    /// Fill `buf` with the bytes at `address`
    fn read(&mut self, address: usize, buf: &mut [u8]) -> io::Result<()>;

    /// Write all of `bytes` at `address` in one operation
    fn write(&mut self, address: usize, bytes: &[u8]) -> io::Result<()>;
}

/// Memory of the current process
///
/// On Linux this goes through `/proc/self/mem`, which also writes to
/// read-only code pages. Other platforms report `Unsupported`.
#[derive(Debug, Default)]
pub struct ProcessMemory {
    #[cfg(target_os = "linux")]
    file: Option<std::fs::File>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(target_os = "linux")]
    fn file(&mut self) -> io::Result<&std::fs::File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/proc/self/mem")?,
        };
        Ok(&*self.file.insert(file))
    }
}

#[cfg(target_os = "linux")]
impl MemoryAccess for ProcessMemory {
    fn read(&mut self, address: usize, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file()?.read_exact_at(buf, address as u64)
    }

    fn write(&mut self, address: usize, bytes: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        let written = self.file()?.write_at(bytes, address as u64)?;
        if written != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", written, bytes.len()),
            ));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl MemoryAccess for ProcessMemory {
    fn read(&mut self, _address: usize, _buf: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "process memory access is not supported"))
    }

    fn write(&mut self, _address: usize, _bytes: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "process memory access is not supported"))
    }
}

/// An applied patch
#[derive(Debug, Clone)]
pub struct Patch {
    pub id: PatchId,
    pub address: usize,
    pub owner: ModId,
    original: Vec<u8>,
    bytes: Vec<u8>,
}

impl Patch {
    /// Bytes that were in memory before the patch
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    /// Bytes the patch wrote
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn range(&self) -> Range<usize> {
        self.address..self.address + self.bytes.len()
    }
}

/// Registry of every patch applied by mods
pub struct PatchManager {
    memory: Box<dyn MemoryAccess>,
    patches: BTreeMap<PatchId, Patch>,
    next_id: u64,
}

impl PatchManager {
    pub fn new(memory: Box<dyn MemoryAccess>) -> Self {
        Self {
            memory,
            patches: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Manager patching the current process
    pub fn native() -> Self {
        Self::new(Box::new(ProcessMemory::new()))
    }

    /// Overwrite memory at `address` with `bytes`
    pub fn apply(&mut self, owner: &ModId, address: usize, bytes: &[u8]) -> Result<PatchId, PatchError> {
        self.write_patch(owner, address, None, bytes)
    }

    /// Like [`apply`](Self::apply), but only if memory currently holds `expected`
    pub fn replace(
        &mut self,
        owner: &ModId,
        address: usize,
        expected: &[u8],
        bytes: &[u8],
    ) -> Result<PatchId, PatchError> {
        if expected.len() != bytes.len() {
            return Err(PatchError::LengthMismatch {
                expected: expected.len(),
                found: bytes.len(),
            });
        }
        self.write_patch(owner, address, Some(expected), bytes)
    }

    fn write_patch(
        &mut self,
        owner: &ModId,
        address: usize,
        expected: Option<&[u8]>,
        bytes: &[u8],
    ) -> Result<PatchId, PatchError> {
        let len = bytes.len();
        if len == 0 {
            return Err(PatchError::Empty { address });
        }
        let end = address.checked_add(len).ok_or_else(|| PatchError::ReadFailed {
            address,
            len,
            reason: "range wraps the address space".to_string(),
        })?;
        if let Some(existing) = self
            .patches
            .values()
            .find(|patch| patch.address < end && address < patch.range().end)
        {
            return Err(PatchError::Overlap {
                address,
                len,
                existing: existing.id,
            });
        }

        let mut original = vec![0; len];
        self.memory
            .read(address, &mut original)
            .map_err(|e| PatchError::ReadFailed {
                address,
                len,
                reason: e.to_string(),
            })?;
        if let Some(expected) = expected {
            if original != expected {
                return Err(PatchError::UnexpectedBytes { address });
            }
        }

        if let Err(e) = self.memory.write(address, bytes) {
            if let Err(rollback) = self.memory.write(address, &original) {
                log::error!(
                    "Failed to roll back partial patch at {:#x}: {}",
                    address,
                    rollback
                );
            }
            return Err(PatchError::WriteFailed {
                address,
                len,
                reason: e.to_string(),
            });
        }

        let id = PatchId(self.next_id);
        self.next_id += 1;
        self.patches.insert(
            id,
            Patch {
                id,
                address,
                owner: owner.clone(),
                original,
                bytes: bytes.to_vec(),
            },
        );
        log::debug!("Mod '{}' patched {} bytes at {:#x} ({})", owner, len, address, id);
        Ok(id)
    }

    /// Write the original bytes back and forget the patch
    ///
    /// On failure the patch stays registered so the restore can be retried.
    pub fn restore(&mut self, id: PatchId) -> Result<Patch, PatchError> {
        let patch = self.patches.get(&id).ok_or(PatchError::NotFound(id))?;
        self.memory
            .write(patch.address, &patch.original)
            .map_err(|e| PatchError::WriteFailed {
                address: patch.address,
                len: patch.original.len(),
                reason: e.to_string(),
            })?;
        let patch = self.patches.remove(&id).ok_or(PatchError::NotFound(id))?;
        log::debug!("Restored patch {} of '{}' at {:#x}", id, patch.owner, patch.address);
        Ok(patch)
    }

    /// Restore every patch of `owner` in the order they were applied
    ///
    /// Patches that cannot be restored are dropped anyway and returned with
    /// their error.
    pub fn restore_owned(&mut self, owner: &ModId) -> Vec<(Patch, PatchError)> {
        let mut failed = Vec::new();
        for id in self.owned_by(owner) {
            if let Err(e) = self.restore(id) {
                if let Some(patch) = self.patches.remove(&id) {
                    failed.push((patch, e));
                }
            }
        }
        failed
    }

    /// Look up a patch that must belong to `caller`
    pub fn owned(&self, id: PatchId, caller: &ModId) -> Result<&Patch, PatchError> {
        let patch = self.patches.get(&id).ok_or(PatchError::NotFound(id))?;
        if &patch.owner != caller {
            return Err(PatchError::NotOwner {
                patch: id,
                caller: caller.clone(),
            });
        }
        Ok(patch)
    }

    pub fn get(&self, id: PatchId) -> Option<&Patch> {
        self.patches.get(&id)
    }

    /// Patches of `owner` in application order
    pub fn owned_by(&self, owner: &ModId) -> Vec<PatchId> {
        self.patches
            .values()
            .filter(|patch| &patch.owner == owner)
            .map(|patch| patch.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Patch> {
        self.patches.values()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

impl fmt::Debug for PatchManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchManager")
            .field("patches", &self.patches.len())
            .finish()
    }
}
