//! Successor spawn with positional descriptor inheritance.
//!
//! The child gets stdin, stdout and stderr at 0-2 and one descriptor per
//! manifest record from slot 3 on. In the parent every record is first
//! duplicated close-on-exec *above* the slot range; in the forked child each
//! duplicate is `dup2`-ed onto its slot, which clears close-on-exec for the
//! slot only. Sources never overlap targets, so the order of the `dup2`
//! calls does not matter.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::fcntl::{FcntlArg, fcntl};

use crate::error::{MoltError, Result};
use crate::record::Registry;
use crate::types::{ResourceKind, slot_for_index};

/// Suffix Linux appends to `/proc/self/exe` once the binary was replaced.
const DELETED_SUFFIX: &str = " (deleted)";

/// Everything needed to re-execute the current program.
#[derive(Debug, Clone)]
pub struct ProcessImage {
    executable: PathBuf,
    args: Vec<OsString>,
    cwd: PathBuf,
    env: Vec<(OsString, OsString)>,
}

impl ProcessImage {
    /// Captures the current executable, arguments (without argv\[0\]),
    /// working directory and environment.
    ///
    /// `manifest_var` is dropped from the captured environment so a stale
    /// manifest never reaches the next successor.
    ///
    /// # Errors
    /// Returns `SpawnFailed` if the executable or working directory cannot
    /// be resolved.
    pub fn current(manifest_var: &str) -> Result<Self> {
        let executable = std::env::current_exe()
            .map_err(|e| MoltError::spawn_failed(format!("cannot resolve executable: {e}")))?;
        let cwd = std::env::current_dir().map_err(|e| {
            MoltError::spawn_failed(format!("cannot resolve working directory: {e}"))
        })?;

        Ok(Self {
            executable: strip_deleted(executable),
            args: std::env::args_os().skip(1).collect(),
            cwd,
            env: std::env::vars_os()
                .filter(|(key, _)| key.as_os_str() != manifest_var)
                .collect(),
        })
    }

    /// Creates an image for an explicit executable with an empty argument
    /// list and environment, running in the current directory.
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            cwd: PathBuf::from("."),
            env: Vec::new(),
        }
    }

    /// Replaces the argument list.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Adds one environment entry.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Path of the executable.
    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Arguments passed after argv\[0\].
    #[must_use]
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Working directory of the child.
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Environment of the child, before the manifest entry is added.
    #[must_use]
    pub fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }
}

fn strip_deleted(path: PathBuf) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_suffix(DELETED_SUFFIX)) {
        Some(stripped) => PathBuf::from(stripped),
        None => path,
    }
}

/// Descriptors prepared for one spawn, keyed by their child slot.
#[derive(Debug)]
pub struct ChildFdTable {
    entries: Vec<(i32, OwnedFd)>,
}

impl ChildFdTable {
    /// Duplicates every registered descriptor for the child, in manifest
    /// order.
    ///
    /// # Errors
    /// Returns `ListenerConversionFailed` if a listener cannot be duplicated
    /// and `Io` for files. Nothing is spawned with a partial table.
    pub fn build(registry: &Registry) -> Result<Self> {
        let floor = slot_for_index(registry.len());
        let mut entries = Vec::with_capacity(registry.len());

        for (index, entry) in registry.entries().iter().enumerate() {
            let dup = dup_above(entry.fd.as_fd(), floor).map_err(|e| match entry.record.kind {
                ResourceKind::NetworkListener => {
                    MoltError::conversion(entry.record.key(), e)
                }
                ResourceKind::PlainFile => MoltError::Io(e),
            })?;
            entries.push((slot_for_index(index), dup));
        }

        Ok(Self { entries })
    }

    /// Returns the child slots in order.
    pub fn slots(&self) -> impl Iterator<Item = i32> + '_ {
        self.entries.iter().map(|(slot, _)| *slot)
    }

    /// Returns the descriptor prepared for `slot`.
    #[must_use]
    pub fn get(&self, slot: i32) -> Option<BorrowedFd<'_>> {
        self.entries
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, fd)| fd.as_fd())
    }

    /// Returns the number of inherited descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is inherited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the table, returning `(slot, descriptor)` pairs.
    #[must_use]
    pub fn into_entries(self) -> Vec<(i32, OwnedFd)> {
        self.entries
    }

    /// `(source, slot)` pairs for the child's `dup2` calls.
    fn raw_pairs(&self) -> Vec<(RawFd, RawFd)> {
        self.entries
            .iter()
            .map(|(slot, fd)| (fd.as_raw_fd(), *slot))
            .collect()
    }
}

/// Duplicates `fd` close-on-exec at the lowest free number `>= floor`.
fn dup_above(fd: BorrowedFd<'_>, floor: RawFd) -> io::Result<OwnedFd> {
    let raw = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(floor))?;
    // SAFETY: fcntl just returned this descriptor; nothing else owns it.
    #[allow(unsafe_code)]
    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
    Ok(owned)
}

/// One spawn: the encoded manifest and the descriptors it describes.
#[derive(Debug)]
pub struct SpawnRequest {
    /// Name of the environment variable carrying the manifest.
    pub manifest_var: String,
    /// Encoded manifest.
    pub manifest: String,
    /// Descriptors for slots 3 and up.
    pub fds: ChildFdTable,
}

/// Creates successor processes.
pub trait Spawner: Send + Sync {
    /// Launches a successor and returns its pid without waiting on it.
    ///
    /// # Errors
    /// Returns `SpawnFailed` if the process cannot be created.
    fn spawn(&self, request: SpawnRequest) -> Result<u32>;
}

/// Spawner that re-executes a [`ProcessImage`].
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    image: ProcessImage,
}

impl ProcessSpawner {
    /// Creates a spawner for `image`.
    #[must_use]
    pub fn new(image: ProcessImage) -> Self {
        Self { image }
    }

    /// Image that will be executed.
    #[must_use]
    pub fn image(&self) -> &ProcessImage {
        &self.image
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<u32> {
        let image = &self.image;
        let mut cmd = tokio::process::Command::new(&image.executable);
        cmd.args(&image.args)
            .current_dir(&image.cwd)
            .env_clear()
            .envs(image.env.iter().map(|(k, v)| (k, v)))
            .env(&request.manifest_var, &request.manifest)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        let pairs = request.fds.raw_pairs();
        // SAFETY: the hook runs between fork and exec and only calls dup2,
        // which is async-signal-safe. Every source stays open in the parent
        // until spawn() returns.
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(move || {
                for &(source, slot) in &pairs {
                    if libc::dup2(source, slot) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            MoltError::spawn_failed(format!("{}: {e}", image.executable.display()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| MoltError::spawn_failed("successor exited before reporting a pid"))?;

        // Dropping the handle leaves reaping to tokio's orphan queue.
        drop(child);
        drop(request.fds);
        Ok(pid)
    }
}
