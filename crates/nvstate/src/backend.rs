//! On-disk backends behind the store: one file per named blob in a state
//! directory, or one backing file with a slot directory.
//!
//! Both variants write through a temporary file, `fsync` when asked, and
//! rename into place so that a crash never leaves a torn blob behind.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::BlobName;
use crate::NvError;

/// Lockfile kept inside the state directory.
pub(crate) const LOCKFILE_NAME: &str = ".lock";

const LOCK_BACKOFF_START: Duration = Duration::from_millis(10);
const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(160);

/// Backend variant, fixed at configuration time.
#[derive(Debug)]
pub(crate) enum Backend {
    Dir(DirBackend),
    File(FileBackend),
}

impl Backend {
    pub fn from_uri(
        uri: &str,
        tpm_number: u32,
        mode: u32,
        do_fsync: bool,
    ) -> Result<Self, NvError> {
        if let Some(path) = uri.strip_prefix("dir://") {
            Ok(Backend::Dir(DirBackend::new(PathBuf::from(path), tpm_number, mode, do_fsync)))
        } else if let Some(path) = uri.strip_prefix("file://") {
            Ok(Backend::File(FileBackend::new(PathBuf::from(path), mode, do_fsync)))
        } else {
            Err(NvError::BadParameter(format!("unsupported backend uri '{uri}'")))
        }
    }

    pub fn check_access(&self) -> Result<(), NvError> {
        match self {
            Backend::Dir(b) => b.check_access(),
            Backend::File(b) => b.check_access(),
        }
    }

    pub fn load(&self, name: BlobName) -> Result<Vec<u8>, NvError> {
        match self {
            Backend::Dir(b) => b.load(name),
            Backend::File(b) => b.load(name),
        }
    }

    pub fn store(&self, name: BlobName, data: &[u8]) -> Result<(), NvError> {
        match self {
            Backend::Dir(b) => b.store(name, data),
            Backend::File(b) => b.store(name, data),
        }
    }

    pub fn delete(&self, name: BlobName, must_exist: bool) -> Result<(), NvError> {
        match self {
            Backend::Dir(b) => b.delete(name, must_exist),
            Backend::File(b) => b.delete(name, must_exist),
        }
    }

    pub fn lock(&mut self, retries: u32) -> Result<(), NvError> {
        match self {
            Backend::Dir(b) => b.lock(retries),
            Backend::File(b) => b.lock(retries),
        }
    }

    pub fn unlock(&mut self) {
        match self {
            Backend::Dir(b) => b.lock = None,
            Backend::File(b) => b.lock = None,
        }
    }

    pub fn is_locked(&self) -> bool {
        match self {
            Backend::Dir(b) => b.lock.is_some(),
            Backend::File(b) => b.lock.is_some(),
        }
    }

    pub fn backup_current(&self, name: BlobName) -> Result<(), NvError> {
        match self {
            Backend::Dir(b) => b.backup_current(name),
            Backend::File(_) => {
                Err(NvError::Fail("single-file backend does not keep backups".into()))
            }
        }
    }

    pub fn restore_backup(&self, name: BlobName) -> Result<(), NvError> {
        match self {
            Backend::Dir(b) => b.restore_backup(name),
            Backend::File(_) => {
                Err(NvError::Fail("single-file backend does not keep backups".into()))
            }
        }
    }
}

/// Acquire an exclusive advisory lock without blocking. The lock is released
/// when the file handle drops.
fn flock_exclusive_nb(file: &File) -> std::io::Result<()> {
    #[allow(unsafe_code)]
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn flock_with_retries(file: &File, retries: u32) -> Result<(), NvError> {
    let mut backoff = LOCK_BACKOFF_START;
    let mut attempt = 0u32;
    loop {
        match flock_exclusive_nb(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if attempt >= retries {
                    return Err(NvError::Fail("storage is locked by another process".into()));
                }
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
                attempt += 1;
            }
            Err(e) => return Err(NvError::Io(e)),
        }
    }
}

fn access_rw(path: &Path, also_exec: bool) -> Result<(), NvError> {
    let c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| NvError::BadParameter("path contains NUL".into()))?;
    let mut mode = libc::R_OK | libc::W_OK;
    if also_exec {
        mode |= libc::X_OK;
    }
    #[allow(unsafe_code)]
    let rc = unsafe { libc::access(c.as_ptr(), mode) };
    if rc == 0 {
        Ok(())
    } else {
        Err(NvError::Fail(format!("no read/write access to {}", path.display())))
    }
}

/// Write `data` to `path` via a sibling temp file and an atomic rename.
/// A failed write unlinks the temp file instead of leaving torn state.
fn write_atomic(path: &Path, data: &[u8], mode: u32, do_fsync: bool) -> Result<(), NvError> {
    let tmp = temp_sibling(path);
    let res = (|| -> Result<(), NvError> {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        file.write_all(data)?;
        file.set_permissions(Permissions::from_mode(mode))?;
        if do_fsync {
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
        return res;
    }
    if do_fsync {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// One file per blob under a state directory.
#[derive(Debug)]
pub(crate) struct DirBackend {
    dir: PathBuf,
    tpm_number: u32,
    mode: u32,
    do_fsync: bool,
    lock: Option<File>,
}

impl DirBackend {
    fn new(dir: PathBuf, tpm_number: u32, mode: u32, do_fsync: bool) -> Self {
        DirBackend { dir, tpm_number, mode, do_fsync, lock: None }
    }

    /// Rooted file name for a blob: `<dir>/tpm-<NN>.<name>`.
    fn path_for(&self, name: BlobName) -> PathBuf {
        self.dir.join(format!("tpm-{:02x}.{}", self.tpm_number, name.as_str()))
    }

    fn backup_path_for(&self, name: BlobName) -> PathBuf {
        let mut p = self.path_for(name).into_os_string();
        p.push(".bak");
        PathBuf::from(p)
    }

    fn check_access(&self) -> Result<(), NvError> {
        if !self.dir.is_dir() {
            return Err(NvError::Fail(format!(
                "state directory {} does not exist",
                self.dir.display()
            )));
        }
        access_rw(&self.dir, true)
    }

    fn load(&self, name: BlobName) -> Result<Vec<u8>, NvError> {
        match fs::read(self.path_for(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(NvError::Retry),
            Err(e) => Err(NvError::Io(e)),
        }
    }

    fn store(&self, name: BlobName, data: &[u8]) -> Result<(), NvError> {
        write_atomic(&self.path_for(name), data, self.mode, self.do_fsync)
    }

    fn delete(&self, name: BlobName, must_exist: bool) -> Result<(), NvError> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !must_exist => Ok(()),
            Err(e) => Err(NvError::Io(e)),
        }
    }

    fn lock(&mut self, retries: u32) -> Result<(), NvError> {
        if self.lock.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(LOCKFILE_NAME))?;
        flock_with_retries(&file, retries)?;
        self.lock = Some(file);
        Ok(())
    }

    /// Move the current blob aside as `<file>.bak` before it is replaced.
    fn backup_current(&self, name: BlobName) -> Result<(), NvError> {
        let current = self.path_for(name);
        match fs::rename(&current, self.backup_path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NvError::Io(e)),
        }
    }

    /// Swap the current blob and its backup. Calling twice reverts the swap.
    fn restore_backup(&self, name: BlobName) -> Result<(), NvError> {
        let current = self.path_for(name);
        let backup = self.backup_path_for(name);
        if !backup.exists() {
            return Err(NvError::Fail(format!("no backup for {}", name.as_str())));
        }
        let mut stash = current.clone().into_os_string();
        stash.push(".swp");
        let stash = PathBuf::from(stash);

        let have_current = current.exists();
        if have_current {
            fs::rename(&current, &stash)?;
        }
        fs::rename(&backup, &current)?;
        if have_current {
            fs::rename(&stash, &backup)?;
        }
        Ok(())
    }
}

// Single-file container layout:
//   magic "NVSF" | version u8 | reserved [u8;3] | 3 x (offset u32 BE, len u32 BE)
// Slot order is permall, volatilestate, savestate. len 0 marks an empty slot.
const FILE_MAGIC: [u8; 4] = *b"NVSF";
const FILE_VERSION: u8 = 1;
const SLOT_COUNT: usize = 3;
const FILE_HEADER_LEN: usize = 8 + SLOT_COUNT * 8;

/// All blobs in one backing file.
#[derive(Debug)]
pub(crate) struct FileBackend {
    path: PathBuf,
    mode: u32,
    do_fsync: bool,
    lock: Option<File>,
}

impl FileBackend {
    fn new(path: PathBuf, mode: u32, do_fsync: bool) -> Self {
        FileBackend { path, mode, do_fsync, lock: None }
    }

    fn slot(name: BlobName) -> usize {
        match name {
            BlobName::PermAll => 0,
            BlobName::VolatileState => 1,
            BlobName::SaveState => 2,
        }
    }

    fn check_access(&self) -> Result<(), NvError> {
        if self.path.exists() {
            access_rw(&self.path, false)
        } else {
            let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
            access_rw(parent, true)
        }
    }

    fn read_slots(&self) -> Result<Option<[Vec<u8>; SLOT_COUNT]>, NvError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(NvError::Io(e)),
        };
        if raw.len() < FILE_HEADER_LEN || raw[0..4] != FILE_MAGIC {
            return Err(NvError::BadParameter("not a state container file".into()));
        }
        if raw[4] != FILE_VERSION {
            return Err(NvError::BadVersion { required: raw[4], supported: FILE_VERSION });
        }
        let mut slots: [Vec<u8>; SLOT_COUNT] = Default::default();
        for (i, slot) in slots.iter_mut().enumerate() {
            let at = 8 + i * 8;
            let off = u32::from_be_bytes(raw[at..at + 4].try_into().expect("4 bytes")) as usize;
            let len =
                u32::from_be_bytes(raw[at + 4..at + 8].try_into().expect("4 bytes")) as usize;
            if len == 0 {
                continue;
            }
            let end = off.checked_add(len).filter(|&e| e <= raw.len()).ok_or_else(|| {
                NvError::BadParameter("state container slot out of bounds".into())
            })?;
            *slot = raw[off..end].to_vec();
        }
        Ok(Some(slots))
    }

    fn write_slots(&self, slots: &[Vec<u8>; SLOT_COUNT]) -> Result<(), NvError> {
        let total: usize = FILE_HEADER_LEN + slots.iter().map(Vec::len).sum::<usize>();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&FILE_MAGIC);
        out.push(FILE_VERSION);
        out.extend_from_slice(&[0u8; 3]);
        let mut off = FILE_HEADER_LEN as u32;
        for slot in slots {
            if slot.is_empty() {
                out.extend_from_slice(&[0u8; 8]);
            } else {
                out.extend_from_slice(&off.to_be_bytes());
                out.extend_from_slice(&(slot.len() as u32).to_be_bytes());
                off += slot.len() as u32;
            }
        }
        for slot in slots {
            out.extend_from_slice(slot);
        }
        write_atomic(&self.path, &out, self.mode, self.do_fsync)
    }

    fn load(&self, name: BlobName) -> Result<Vec<u8>, NvError> {
        let Some(slots) = self.read_slots()? else {
            return Err(NvError::Retry);
        };
        let data = &slots[Self::slot(name)];
        if data.is_empty() {
            return Err(NvError::Retry);
        }
        Ok(data.clone())
    }

    fn store(&self, name: BlobName, data: &[u8]) -> Result<(), NvError> {
        let mut slots = self.read_slots()?.unwrap_or_default();
        slots[Self::slot(name)] = data.to_vec();
        self.write_slots(&slots)
    }

    fn delete(&self, name: BlobName, must_exist: bool) -> Result<(), NvError> {
        let mut slots = match self.read_slots()? {
            Some(slots) => slots,
            None if !must_exist => return Ok(()),
            None => return Err(NvError::Fail("state container file missing".into())),
        };
        if slots[Self::slot(name)].is_empty() && must_exist {
            return Err(NvError::Fail(format!("no {} slot to delete", name.as_str())));
        }
        slots[Self::slot(name)] = Vec::new();
        self.write_slots(&slots)
    }

    fn lock(&mut self, retries: u32) -> Result<(), NvError> {
        if self.lock.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        flock_with_retries(&file, retries)?;
        self.lock = Some(file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_backend_load_missing_is_retry() {
        let dir = tempfile::tempdir().unwrap();
        let b = DirBackend::new(dir.path().to_path_buf(), 0, 0o640, false);
        assert!(matches!(b.load(BlobName::PermAll), Err(NvError::Retry)));
        // First-boot probe must not create the file.
        assert!(!b.path_for(BlobName::PermAll).exists());
    }

    #[test]
    fn dir_backend_store_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let b = DirBackend::new(dir.path().to_path_buf(), 0, 0o640, true);
        b.store(BlobName::PermAll, b"abc").unwrap();
        assert_eq!(b.load(BlobName::PermAll).unwrap(), b"abc");
        let mode = fs::metadata(b.path_for(BlobName::PermAll)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        b.delete(BlobName::PermAll, true).unwrap();
        assert!(matches!(b.load(BlobName::PermAll), Err(NvError::Retry)));
        b.delete(BlobName::PermAll, false).unwrap();
        assert!(b.delete(BlobName::PermAll, true).is_err());
    }

    #[test]
    fn dir_backend_filename_layout() {
        let dir = tempfile::tempdir().unwrap();
        let b = DirBackend::new(dir.path().to_path_buf(), 0x2a, 0o640, false);
        assert!(b.path_for(BlobName::SaveState).ends_with("tpm-2a.savestate"));
    }

    #[test]
    fn backup_swap_and_revert() {
        let dir = tempfile::tempdir().unwrap();
        let b = DirBackend::new(dir.path().to_path_buf(), 0, 0o640, false);
        b.store(BlobName::PermAll, b"old").unwrap();
        b.backup_current(BlobName::PermAll).unwrap();
        b.store(BlobName::PermAll, b"new").unwrap();

        b.restore_backup(BlobName::PermAll).unwrap();
        assert_eq!(b.load(BlobName::PermAll).unwrap(), b"old");
        b.restore_backup(BlobName::PermAll).unwrap();
        assert_eq!(b.load(BlobName::PermAll).unwrap(), b"new");
    }

    #[test]
    fn file_backend_slots_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let b = FileBackend::new(path, 0o600, false);
        assert!(matches!(b.load(BlobName::PermAll), Err(NvError::Retry)));

        b.store(BlobName::PermAll, b"perm").unwrap();
        b.store(BlobName::VolatileState, b"vol").unwrap();
        assert_eq!(b.load(BlobName::PermAll).unwrap(), b"perm");
        assert_eq!(b.load(BlobName::VolatileState).unwrap(), b"vol");
        assert!(matches!(b.load(BlobName::SaveState), Err(NvError::Retry)));

        b.store(BlobName::PermAll, b"perm2").unwrap();
        assert_eq!(b.load(BlobName::PermAll).unwrap(), b"perm2");
        assert_eq!(b.load(BlobName::VolatileState).unwrap(), b"vol");

        b.delete(BlobName::VolatileState, true).unwrap();
        assert!(matches!(b.load(BlobName::VolatileState), Err(NvError::Retry)));
    }

    #[test]
    fn lockfile_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = DirBackend::new(dir.path().to_path_buf(), 0, 0o640, false);
        let mut b = DirBackend::new(dir.path().to_path_buf(), 0, 0o640, false);
        a.lock(0).unwrap();
        assert!(b.lock(1).is_err());
        a.lock = None;
        b.lock(0).unwrap();
    }
}
