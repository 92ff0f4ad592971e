//! Successor-side reconstruction of inherited resources.
//!
//! Record `i` of the manifest is bound to descriptor slot `3 + i`. A slot
//! that is closed, of the wrong kind, or otherwise unusable is logged and
//! dropped; the remaining records are still bound.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, SockType, SockaddrLike, SockaddrStorage, getsockname, getsockopt, sockopt,
};
use nix::sys::stat::fstat;

use crate::error::{MoltError, Result};
use crate::manifest::Manifest;
use crate::record::ResourceRecord;
use crate::types::{FIRST_INHERITED_FD, ResourceKind, Transport};

/// Source of the descriptors a successor inherited at exec.
pub trait InheritedFds: Send {
    /// Takes ownership of the descriptor at `slot`.
    ///
    /// # Errors
    /// Returns an error if the slot is not open or was already taken.
    fn take(&mut self, slot: RawFd) -> io::Result<OwnedFd>;
}

static PROCESS_FDS_CLAIMED: AtomicBool = AtomicBool::new(false);

/// The real descriptor table of this process.
///
/// Only one instance can ever be claimed per process, so no slot is adopted
/// twice.
#[derive(Debug)]
pub struct ProcessFds {
    _private: (),
}

impl ProcessFds {
    /// Claims the inherited descriptor table. Returns `None` if it was
    /// already claimed.
    #[must_use]
    pub fn claim() -> Option<Self> {
        if PROCESS_FDS_CLAIMED.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self { _private: () })
        }
    }
}

impl InheritedFds for ProcessFds {
    fn take(&mut self, slot: RawFd) -> io::Result<OwnedFd> {
        adopt_slot(slot)
    }
}

/// Adopts the descriptor at `slot` if it survived an exec.
///
/// A descriptor inherited through exec has close-on-exec cleared by the
/// `dup2` onto its slot; everything this process opened itself has it set.
/// A slot with the flag set is refused without taking ownership.
fn adopt_slot(slot: RawFd) -> io::Result<OwnedFd> {
    if slot < FIRST_INHERITED_FD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("slot {slot} is a standard stream"),
        ));
    }
    // EBADF here means the predecessor passed fewer descriptors than records.
    let flags = FdFlag::from_bits_truncate(fcntl(slot, FcntlArg::F_GETFD)?);
    if flags.contains(FdFlag::FD_CLOEXEC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("slot {slot} is close-on-exec, so it was not inherited"),
        ));
    }
    // SAFETY: the slot is open and was not opened by this process (its
    // close-on-exec flag is clear), and the single ProcessFds instance hands
    // each slot out once, since manifest slots are distinct.
    #[allow(unsafe_code)]
    let fd = unsafe { OwnedFd::from_raw_fd(slot) };
    fcntl(slot, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(fd)
}

/// Listener rebuilt from an inherited descriptor.
#[derive(Debug)]
pub enum InheritedListener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix-domain stream listener.
    Unix(UnixListener),
}

impl InheritedListener {
    /// Transport of the listener.
    #[must_use]
    pub const fn transport(&self) -> Transport {
        match self {
            Self::Tcp(_) => Transport::Tcp,
            Self::Unix(_) => Transport::Unix,
        }
    }

    /// Returns the TCP listener, if this is one.
    #[must_use]
    pub fn into_tcp(self) -> Option<TcpListener> {
        match self {
            Self::Tcp(listener) => Some(listener),
            Self::Unix(_) => None,
        }
    }

    /// Returns the Unix listener, if this is one.
    #[must_use]
    pub fn into_unix(self) -> Option<UnixListener> {
        match self {
            Self::Unix(listener) => Some(listener),
            Self::Tcp(_) => None,
        }
    }
}

/// Handle rebuilt from an inherited descriptor.
#[derive(Debug)]
pub enum InheritedHandle {
    /// Regular file.
    File(File),
    /// Stream listener.
    Listener(InheritedListener),
}

/// One bound record.
#[derive(Debug)]
pub struct InheritedResource {
    record: ResourceRecord,
    slot: RawFd,
    handle: InheritedHandle,
}

impl InheritedResource {
    /// Record as reconstructed; listener names reflect the received socket.
    #[must_use]
    pub fn record(&self) -> &ResourceRecord {
        &self.record
    }

    /// Slot the descriptor was inherited at.
    #[must_use]
    pub const fn slot(&self) -> RawFd {
        self.slot
    }

    /// The live handle.
    #[must_use]
    pub fn handle(&self) -> &InheritedHandle {
        &self.handle
    }
}

/// Inherited resources, keyed by listener address and by file name.
#[derive(Debug, Default)]
pub struct Inheritance {
    listeners: HashMap<String, InheritedResource>,
    files: HashMap<String, InheritedResource>,
    failures: Vec<MoltError>,
}

impl Inheritance {
    /// Binds every record of `manifest` to its slot in `fds`.
    ///
    /// Failures are logged and kept in [`failures`](Self::failures); the
    /// failed record is left out.
    pub fn bind(manifest: &Manifest, fds: &mut dyn InheritedFds) -> Self {
        let mut inheritance = Self::default();

        for (slot, record) in manifest.slots() {
            match bind_record(record, slot, fds) {
                Ok(resource) => {
                    tracing::info!(
                        slot,
                        name = %resource.record.name,
                        key = %resource.record.key(),
                        "inherited resource"
                    );
                    let key = resource.record.key().to_string();
                    let map = match resource.record.kind {
                        ResourceKind::NetworkListener => &mut inheritance.listeners,
                        ResourceKind::PlainFile => &mut inheritance.files,
                    };
                    map.insert(key, resource);
                }
                Err(err) => {
                    tracing::warn!(slot, error = %err, "dropping inherited resource");
                    inheritance.failures.push(err);
                }
            }
        }

        inheritance
    }

    /// Bound listener for `address`.
    #[must_use]
    pub fn listener(&self, address: &str) -> Option<&InheritedResource> {
        self.listeners.get(address)
    }

    /// Bound file for `name`.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<&InheritedResource> {
        self.files.get(name)
    }

    /// Removes and returns the listener for `address`.
    pub fn take_listener(&mut self, address: &str) -> Option<InheritedListener> {
        match self.listeners.remove(address)?.handle {
            InheritedHandle::Listener(listener) => Some(listener),
            InheritedHandle::File(_) => None,
        }
    }

    /// Removes and returns the TCP listener for `address`.
    ///
    /// A Unix listener under that address is left in place.
    pub fn take_tcp_listener(&mut self, address: &str) -> Option<TcpListener> {
        if self.listener(address)?.transport() != Some(Transport::Tcp) {
            return None;
        }
        self.take_listener(address).and_then(InheritedListener::into_tcp)
    }

    /// Removes and returns the Unix listener for `address`.
    ///
    /// A TCP listener under that address is left in place.
    pub fn take_unix_listener(&mut self, address: &str) -> Option<UnixListener> {
        if self.listener(address)?.transport() != Some(Transport::Unix) {
            return None;
        }
        self.take_listener(address).and_then(InheritedListener::into_unix)
    }

    /// Removes and returns the file for `name`.
    pub fn take_file(&mut self, name: &str) -> Option<File> {
        match self.files.remove(name)?.handle {
            InheritedHandle::File(file) => Some(file),
            InheritedHandle::Listener(_) => None,
        }
    }

    /// Addresses of listeners not yet taken.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.listeners.keys().map(String::as_str)
    }

    /// Names of files not yet taken.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Records that could not be bound.
    #[must_use]
    pub fn failures(&self) -> &[MoltError] {
        &self.failures
    }

    /// Number of bound resources not yet taken.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len() + self.files.len()
    }

    /// Returns true if every bound resource was taken.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes everything that was not taken and returns how many were closed.
    pub fn release(self) -> usize {
        let left = self.len();
        for key in self.addresses().chain(self.file_names()) {
            tracing::debug!(key, "closing unclaimed inherited resource");
        }
        left
    }
}

impl InheritedResource {
    fn transport(&self) -> Option<Transport> {
        match self.handle() {
            InheritedHandle::Listener(listener) => Some(listener.transport()),
            InheritedHandle::File(_) => None,
        }
    }
}

/// What an inherited descriptor turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    RegularFile,
    Listener(Transport),
    Other(&'static str),
}

fn classify(fd: &OwnedFd) -> io::Result<SlotKind> {
    let raw = fd.as_raw_fd();
    let stat = fstat(raw)?;
    let format = stat.st_mode & libc::S_IFMT;

    if format == libc::S_IFREG {
        return Ok(SlotKind::RegularFile);
    }
    if format != libc::S_IFSOCK {
        return Ok(SlotKind::Other("not a socket or regular file"));
    }
    if getsockopt(fd, sockopt::SockType)? != SockType::Stream {
        return Ok(SlotKind::Other("not a stream socket"));
    }
    if !getsockopt(fd, sockopt::AcceptConn)? {
        return Ok(SlotKind::Other("socket is not listening"));
    }

    let addr: SockaddrStorage = getsockname(raw)?;
    Ok(match addr.family() {
        Some(AddressFamily::Inet | AddressFamily::Inet6) => SlotKind::Listener(Transport::Tcp),
        Some(AddressFamily::Unix) => SlotKind::Listener(Transport::Unix),
        _ => SlotKind::Other("unsupported address family"),
    })
}

fn bind_record(
    record: &ResourceRecord,
    slot: RawFd,
    fds: &mut dyn InheritedFds,
) -> Result<InheritedResource> {
    let fd = fds
        .take(slot)
        .map_err(|e| MoltError::bind(slot, &record.name, e))?;
    let kind = classify(&fd).map_err(|e| MoltError::bind(slot, &record.name, e))?;

    let (record, handle) = match (record.kind, kind) {
        (ResourceKind::PlainFile, SlotKind::RegularFile) => {
            (record.clone(), InheritedHandle::File(File::from(fd)))
        }
        (ResourceKind::NetworkListener, SlotKind::Listener(Transport::Tcp)) => {
            let listener = TcpListener::from(fd);
            let name = listener
                .local_addr()
                .map(|addr| format!("tcp:{addr}"))
                .unwrap_or_else(|_| record.name.clone());
            (
                ResourceRecord { name, ..record.clone() },
                InheritedHandle::Listener(InheritedListener::Tcp(listener)),
            )
        }
        (ResourceKind::NetworkListener, SlotKind::Listener(_)) => {
            let listener = UnixListener::from(fd);
            let name = listener
                .local_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| format!("unix:{}", p.display())))
                .unwrap_or_else(|| record.name.clone());
            (
                ResourceRecord { name, ..record.clone() },
                InheritedHandle::Listener(InheritedListener::Unix(listener)),
            )
        }
        (expected, found) => {
            return Err(MoltError::bind(
                slot,
                &record.name,
                format!("expected {expected:?}, found {found:?}"),
            ));
        }
    };

    Ok(InheritedResource { record, slot, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mocks::SlotMap;

    #[test]
    fn test_bind_tcp_listener_by_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let manifest = Manifest::new(vec![ResourceRecord::listener("tcp:old", ":9090")]);
        let mut fds = SlotMap::new().with(3, OwnedFd::from(listener));

        let mut inheritance = Inheritance::bind(&manifest, &mut fds);
        assert!(inheritance.failures().is_empty());

        let resource = inheritance.listener(":9090").unwrap();
        assert_eq!(resource.slot(), 3);
        assert_eq!(resource.record().name, format!("tcp:{addr}"));

        let listener = inheritance.take_tcp_listener(":9090").unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);
        assert!(inheritance.is_empty());
    }

    #[test]
    fn test_bind_unix_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let manifest = Manifest::new(vec![ResourceRecord::listener("unix:old", "api")]);
        let mut fds = SlotMap::new().with(3, OwnedFd::from(listener));

        let mut inheritance = Inheritance::bind(&manifest, &mut fds);
        assert!(inheritance.take_tcp_listener("api").is_none());
        assert!(inheritance.take_unix_listener("api").is_some());
    }

    #[test]
    fn test_bind_file_by_name() {
        let file = tempfile::tempfile().unwrap();
        let manifest = Manifest::new(vec![ResourceRecord::file("/var/log/app.log")]);
        let mut fds = SlotMap::new().with(3, OwnedFd::from(file));

        let mut inheritance = Inheritance::bind(&manifest, &mut fds);
        let resource = inheritance.file("/var/log/app.log").unwrap();
        assert!(matches!(resource.handle(), InheritedHandle::File(_)));
        assert!(inheritance.take_file("/var/log/app.log").is_some());
        assert!(inheritance.take_file("/var/log/app.log").is_none());
    }

    #[test]
    fn test_missing_slot_drops_only_that_record() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let manifest = Manifest::new(vec![
            ResourceRecord::listener("tcp:a", ":1"),
            ResourceRecord::listener("tcp:b", ":2"),
        ]);
        // Slot 3 missing, slot 4 present.
        let mut fds = SlotMap::new().with(4, OwnedFd::from(listener));

        let inheritance = Inheritance::bind(&manifest, &mut fds);
        assert!(inheritance.listener(":1").is_none());
        assert_eq!(inheritance.listener(":2").unwrap().slot(), 4);
        assert_eq!(inheritance.failures().len(), 1);
        assert!(matches!(
            inheritance.failures()[0],
            MoltError::ResourceBindFailed { slot: 3, .. }
        ));
    }

    #[test]
    fn test_kind_mismatch_is_bind_failure() {
        let file = tempfile::tempfile().unwrap();
        let manifest = Manifest::new(vec![ResourceRecord::listener("tcp:a", ":1")]);
        let mut fds = SlotMap::new().with(3, OwnedFd::from(file));

        let inheritance = Inheritance::bind(&manifest, &mut fds);
        assert!(inheritance.is_empty());
        assert_eq!(inheritance.failures().len(), 1);
    }

    #[test]
    fn test_datagram_slot_rejected() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let manifest = Manifest::new(vec![ResourceRecord::listener("udp:a", ":53")]);
        let mut fds = SlotMap::new().with(3, OwnedFd::from(socket));

        let inheritance = Inheritance::bind(&manifest, &mut fds);
        assert!(inheritance.listener(":53").is_none());
        assert_eq!(inheritance.failures().len(), 1);
    }

    #[test]
    fn test_connected_streams_are_not_listeners() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let manifest = Manifest::new(vec![ResourceRecord::listener("tcp:a", ":9090")]);
        let mut fds = SlotMap::new().with(3, OwnedFd::from(stream));

        let mut inheritance = Inheritance::bind(&manifest, &mut fds);
        assert!(inheritance.take_tcp_listener(":9090").is_none());
        assert_eq!(inheritance.failures().len(), 1);
        assert!(matches!(
            inheritance.failures()[0],
            MoltError::ResourceBindFailed { slot: 3, .. }
        ));

        let (end, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        let manifest = Manifest::new(vec![ResourceRecord::listener("unix:a", "api")]);
        let mut fds = SlotMap::new().with(3, OwnedFd::from(end));

        let mut inheritance = Inheritance::bind(&manifest, &mut fds);
        assert!(inheritance.take_unix_listener("api").is_none());
        assert_eq!(inheritance.failures().len(), 1);
    }

    #[test]
    fn test_adopt_refuses_own_descriptor() {
        // Files opened by std are close-on-exec.
        let file = tempfile::tempfile().unwrap();
        let raw = file.as_raw_fd();

        let err = adopt_slot(raw).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        // Still open and still ours.
        assert!(fcntl(raw, FcntlArg::F_GETFD).is_ok());
        assert!(file.metadata().is_ok());
    }

    #[test]
    fn test_adopt_inherited_descriptor_sets_cloexec() {
        use std::os::fd::IntoRawFd;

        let file = tempfile::tempfile().unwrap();
        fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty())).unwrap();
        let raw = file.into_raw_fd();

        let fd = adopt_slot(raw).unwrap();
        assert_eq!(fd.as_raw_fd(), raw);
        let flags = FdFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_release_counts_unclaimed() {
        let a = TcpListener::bind("127.0.0.1:0").unwrap();
        let b = TcpListener::bind("127.0.0.1:0").unwrap();
        let manifest = Manifest::new(vec![
            ResourceRecord::listener("tcp:a", ":1"),
            ResourceRecord::listener("tcp:b", ":2"),
        ]);
        let mut fds = SlotMap::new()
            .with(3, OwnedFd::from(a))
            .with(4, OwnedFd::from(b));

        let mut inheritance = Inheritance::bind(&manifest, &mut fds);
        let kept = inheritance.take_listener(":1");
        assert!(kept.is_some());
        assert_eq!(inheritance.release(), 1);
    }

    #[test]
    fn test_process_fds_claimed_once() {
        let first = ProcessFds::claim();
        let second = ProcessFds::claim();
        assert!(first.is_none() || second.is_none());
        if let Some(mut fds) = first.or(second) {
            assert!(fds.take(1).is_err());
            assert!(fds.take(-1).is_err());
        }
    }
}
