//! Resource records and the registry of inheritable descriptors.
//!
//! A [`Registry`] owns a duplicate of every registered descriptor, so the
//! caller keeps its own listener or file and serves on it as usual. The
//! duplicates are what a successor receives, and what the predecessor closes
//! at the end of its shutdown.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MoltError, Result};
use crate::manifest::Manifest;
use crate::types::{ResourceKind, Transport, slot_for_index};

/// Metadata describing one inheritable resource.
///
/// Only `name`, `kind` and `address` cross the process boundary; the
/// descriptor itself is recovered from its slot position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Path for plain files, descriptive name for listeners.
    pub name: String,

    /// Resource kind.
    pub kind: ResourceKind,

    /// Bind address, set for listeners only.
    #[serde(rename = "addr", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl ResourceRecord {
    /// Creates a plain file record.
    #[must_use]
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::PlainFile,
            address: None,
        }
    }

    /// Creates a listener record.
    #[must_use]
    pub fn listener(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::NetworkListener,
            address: Some(address.into()),
        }
    }

    /// Lookup key on the successor side: the address for listeners, the
    /// name for files.
    #[must_use]
    pub fn key(&self) -> &str {
        match self.kind {
            ResourceKind::NetworkListener => self.address.as_deref().unwrap_or(&self.name),
            ResourceKind::PlainFile => &self.name,
        }
    }
}

/// Capability of a socket to be handed to a successor as a plain descriptor.
///
/// Every implementor exposes its transport; only stream transports pass
/// registration.
pub trait InheritableListener {
    /// Transport of the underlying socket.
    fn transport(&self) -> Transport;

    /// Borrowed OS descriptor of the socket.
    fn descriptor(&self) -> BorrowedFd<'_>;

    /// Local address, formatted for record names.
    fn local_name(&self) -> Option<String>;
}

macro_rules! impl_inet_listener {
    ($($ty:ty => $transport:expr),* $(,)?) => {
        $(
            impl InheritableListener for $ty {
                fn transport(&self) -> Transport {
                    $transport
                }

                fn descriptor(&self) -> BorrowedFd<'_> {
                    self.as_fd()
                }

                fn local_name(&self) -> Option<String> {
                    self.local_addr().ok().map(|addr| addr.to_string())
                }
            }
        )*
    };
}

macro_rules! impl_unix_listener {
    ($($ty:ty => $transport:expr),* $(,)?) => {
        $(
            impl InheritableListener for $ty {
                fn transport(&self) -> Transport {
                    $transport
                }

                fn descriptor(&self) -> BorrowedFd<'_> {
                    self.as_fd()
                }

                fn local_name(&self) -> Option<String> {
                    self.local_addr()
                        .ok()
                        .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
                }
            }
        )*
    };
}

impl_inet_listener! {
    std::net::TcpListener => Transport::Tcp,
    std::net::UdpSocket => Transport::Udp,
    tokio::net::TcpListener => Transport::Tcp,
    tokio::net::UdpSocket => Transport::Udp,
}

impl_unix_listener! {
    std::os::unix::net::UnixListener => Transport::Unix,
    std::os::unix::net::UnixDatagram => Transport::UnixDatagram,
    tokio::net::UnixListener => Transport::Unix,
    tokio::net::UnixDatagram => Transport::UnixDatagram,
}

/// Handle to a registered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle {
    index: usize,
}

impl RecordHandle {
    /// Position of the record in the manifest.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Descriptor slot the record occupies in a successor.
    #[must_use]
    pub const fn slot(&self) -> i32 {
        slot_for_index(self.index)
    }
}

/// A record together with the registry's own duplicate of its descriptor.
#[derive(Debug)]
pub(crate) struct Registered {
    pub(crate) record: ResourceRecord,
    pub(crate) fd: OwnedFd,
}

/// Ordered set of resources to hand to the next successor.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<Registered>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open regular file under its path.
    ///
    /// # Errors
    /// `UnsupportedResourceKind` if the descriptor is not a regular file,
    /// `DuplicateResource` if the path is already registered.
    pub fn register_file(&mut self, file: &File, path: impl AsRef<Path>) -> Result<RecordHandle> {
        let name = path.as_ref().display().to_string();
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(MoltError::unsupported(format!(
                "{name} is not a regular file"
            )));
        }
        if self.find(&ResourceRecord::file(name.clone())).is_some() {
            return Err(MoltError::DuplicateResource(name));
        }

        let fd = file.as_fd().try_clone_to_owned()?;
        let handle = self.push(ResourceRecord::file(name), fd);
        tracing::debug!(slot = handle.slot(), "registered file for inheritance");
        Ok(handle)
    }

    /// Registers a listening socket under `address`.
    ///
    /// # Errors
    /// `UnsupportedResourceKind` for datagram transports or an empty
    /// address, `DuplicateResource` if the address is taken,
    /// `ListenerConversionFailed` if the descriptor cannot be duplicated.
    pub fn register_listener<L>(
        &mut self,
        listener: &L,
        address: impl Into<String>,
    ) -> Result<RecordHandle>
    where
        L: InheritableListener + ?Sized,
    {
        let address = address.into();
        let transport = listener.transport();
        if !transport.is_stream() {
            return Err(MoltError::unsupported(format!(
                "{} socket for {address} cannot be inherited",
                transport.label()
            )));
        }
        if address.is_empty() {
            return Err(MoltError::unsupported("listener address must not be empty"));
        }

        let name = format!(
            "{}:{}",
            transport.label(),
            listener.local_name().unwrap_or_else(|| address.clone())
        );
        let record = ResourceRecord::listener(name, address.clone());
        if self.find(&record).is_some() {
            return Err(MoltError::DuplicateResource(address));
        }

        let fd = listener
            .descriptor()
            .try_clone_to_owned()
            .map_err(|e| MoltError::conversion(&address, e))?;
        let handle = self.push(record, fd);
        tracing::debug!(
            address = %address,
            slot = handle.slot(),
            "registered listener for inheritance"
        );
        Ok(handle)
    }

    /// Returns the registered records in manifest order.
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.entries.iter().map(|entry| &entry.record)
    }

    /// Builds the manifest describing the current registrations.
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        Manifest::new(self.records().cloned().collect())
    }

    /// Returns the number of registered resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Closes every registered descriptor and returns how many were closed.
    ///
    /// Only the registry's duplicates are closed; listeners the caller still
    /// holds stay open until the caller drops them.
    pub fn close_all(&mut self) -> usize {
        let closed = self.entries.len();
        self.entries.clear();
        if closed > 0 {
            tracing::debug!(closed, "released registered descriptors");
        }
        closed
    }

    pub(crate) fn entries(&self) -> &[Registered] {
        &self.entries
    }

    fn find(&self, record: &ResourceRecord) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| {
                entry.record.kind == record.kind && entry.record.key() == record.key()
            })
    }

    fn push(&mut self, record: ResourceRecord, fd: OwnedFd) -> RecordHandle {
        let index = self.entries.len();
        self.entries.push(Registered { record, fd });
        RecordHandle { index }
    }
}
