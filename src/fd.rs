//! Typed file descriptors.
//!
//! Descriptors are small integers tagged at the type level by kind, so the
//! submission API cannot accept a file where a socket is required. A typed
//! descriptor widens implicitly into [`AnyFd`]; there is no narrowing.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::os::fd::RawFd;

/// A raw descriptor tagged with a kind marker.
///
/// Negative values are the "invalid" sentinel, produced e.g. by a failed
/// asynchronous open. Check with [`TypedFd::is_valid`] before use.
pub struct TypedFd<K> {
    raw: RawFd,
    _kind: PhantomData<K>,
}

/// Kind marker for [`AnyFd`].
pub enum AnyKind {}
/// Kind marker for [`Socket`].
pub enum SocketKind {}
/// Kind marker for [`File`].
pub enum FileKind {}

/// A descriptor of any kind. Close operations accept these.
pub type AnyFd = TypedFd<AnyKind>;
/// A socket descriptor.
pub type Socket = TypedFd<SocketKind>;
/// A file descriptor.
pub type File = TypedFd<FileKind>;

impl<K> TypedFd<K> {
    pub const fn new(raw: RawFd) -> Self {
        TypedFd {
            raw,
            _kind: PhantomData,
        }
    }

    /// The invalid sentinel.
    pub const INVALID: Self = Self::new(-1);

    /// The underlying OS descriptor value.
    pub fn raw(&self) -> RawFd {
        self.raw
    }

    /// Whether this descriptor refers to an OS resource (`raw >= 0`).
    pub fn is_valid(&self) -> bool {
        self.raw >= 0
    }
}

impl File {
    pub const STDIN: File = File::new(0);
    pub const STDOUT: File = File::new(1);
    pub const STDERR: File = File::new(2);
}

impl From<Socket> for AnyFd {
    fn from(fd: Socket) -> AnyFd {
        AnyFd::new(fd.raw)
    }
}

impl From<File> for AnyFd {
    fn from(fd: File) -> AnyFd {
        AnyFd::new(fd.raw)
    }
}

// Manual impls: derived ones would put bounds on the phantom kind parameter.
impl<K> Clone for TypedFd<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for TypedFd<K> {}

impl<K> PartialEq for TypedFd<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K> Eq for TypedFd<K> {}

impl<K> PartialOrd for TypedFd<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for TypedFd<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<K> Hash for TypedFd<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K> fmt::Debug for TypedFd<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd({})", self.raw)
    }
}

impl<K> fmt::Display for TypedFd<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_sentinel() {
        assert!(Socket::new(3).is_valid());
        assert!(!Socket::new(-1).is_valid());
        assert!(!File::INVALID.is_valid());
    }

    #[test]
    fn widening_preserves_value() {
        let socket = Socket::new(7);
        let any: AnyFd = socket.into();
        assert_eq!(any.raw(), 7);

        let file = File::new(4);
        let any: AnyFd = file.into();
        assert_eq!(any.raw(), 4);
    }

    #[test]
    fn ordering_compares_raw_values() {
        let a = Socket::new(1);
        let b = Socket::new(2);
        assert!(a < b);
        assert_eq!(a, Socket::new(1));
    }

    #[test]
    fn stdio_constants() {
        assert_eq!(File::STDIN.raw(), 0);
        assert_eq!(File::STDOUT.raw(), 1);
        assert_eq!(File::STDERR.raw(), 2);
    }
}
