//! Passing listening sockets across process replacement.
//!
//! # Responsibilities
//! - Expose a listener's OS descriptor for handoff
//! - Attach to a descriptor inherited from a predecessor
//! - Install descriptors at fixed numbers in a spawned successor
//!
//! # Platform Support
//! Unix only. Elsewhere every operation reports
//! [`ServerError::DescriptorInheritanceUnsupported`] and the coordinator
//! falls back to a hard restart: the predecessor closes its sockets before
//! the successor binds new ones, leaving a short window where connections
//! are refused.

use std::net::TcpListener;
use std::process::Command;

use crate::error::ServerError;

/// OS-level socket handle as carried in the FdMap.
pub type Descriptor = i32;

/// First descriptor number handed to a successor (after stdio).
pub const FIRST_INHERITED: Descriptor = 3;

/// Whether this build can hand sockets to a successor.
pub const fn inheritance_supported() -> bool {
    cfg!(unix)
}

/// A listener whose socket can outlive the process that bound it.
pub trait InheritableListener: Sized {
    /// Descriptor to pass to a successor.
    fn descriptor(&self) -> Result<Descriptor, ServerError>;

    /// Take ownership of an inherited, already bound socket.
    fn attach(descriptor: Descriptor) -> std::io::Result<Self>;
}

#[cfg(unix)]
impl InheritableListener for TcpListener {
    fn descriptor(&self) -> Result<Descriptor, ServerError> {
        use std::os::fd::AsRawFd;
        Ok(self.as_raw_fd())
    }

    fn attach(descriptor: Descriptor) -> std::io::Result<Self> {
        use std::os::fd::FromRawFd;

        if descriptor < FIRST_INHERITED {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("descriptor {descriptor} is reserved for stdio"),
            ));
        }
        sys::ensure_stream_socket(descriptor)?;
        sys::set_cloexec(descriptor)?;
        // SAFETY: the descriptor was inherited for this purpose, is open and
        // is a stream socket; nothing else in this process owns it.
        Ok(unsafe { TcpListener::from_raw_fd(descriptor) })
    }
}

#[cfg(not(unix))]
impl InheritableListener for TcpListener {
    fn descriptor(&self) -> Result<Descriptor, ServerError> {
        Err(ServerError::DescriptorInheritanceUnsupported)
    }

    fn attach(_descriptor: Descriptor) -> std::io::Result<Self> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "descriptor inheritance is not supported on this platform",
        ))
    }
}

/// Arrange for `sources` to appear as descriptors 3, 4, ... in the child
/// spawned by `cmd`. Returns the child-side numbers in order.
#[cfg(unix)]
pub fn install(cmd: &mut Command, sources: &[Descriptor]) -> Vec<Descriptor> {
    use std::os::unix::process::CommandExt;

    let targets: Vec<Descriptor> = (0..sources.len())
        .map(|i| FIRST_INHERITED + i as Descriptor)
        .collect();
    // Parking slots above every target, so no dup2 clobbers a pending source.
    let floor = FIRST_INHERITED + sources.len() as Descriptor;
    let mut plan: Vec<(Descriptor, Descriptor)> = sources.iter().copied().zip(targets.iter().copied()).collect();

    // SAFETY: the closure only calls async-signal-safe functions (fcntl, dup2)
    // and does not allocate.
    unsafe {
        cmd.pre_exec(move || {
            for (source, _) in plan.iter_mut() {
                let parked = libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, floor);
                if parked < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                *source = parked;
            }
            for (parked, target) in plan.iter() {
                // dup2 clears close-on-exec on the target.
                if libc::dup2(*parked, *target) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    targets
}

#[cfg(not(unix))]
pub fn install(_cmd: &mut Command, _sources: &[Descriptor]) -> Vec<Descriptor> {
    Vec::new()
}

/// Close an inherited descriptor that no configured listener claims.
#[cfg(unix)]
pub fn release(descriptor: Descriptor) {
    if descriptor < FIRST_INHERITED {
        return;
    }
    // SAFETY: the descriptor was inherited and is owned by nothing else.
    if unsafe { libc::close(descriptor) } < 0 {
        tracing::warn!(descriptor, error = %std::io::Error::last_os_error(), "Failed to close inherited descriptor");
    }
}

#[cfg(not(unix))]
pub fn release(_descriptor: Descriptor) {}

#[cfg(unix)]
mod sys {
    use super::Descriptor;

    pub(super) fn ensure_stream_socket(fd: Descriptor) -> std::io::Result<()> {
        let mut kind: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: `kind` and `len` are valid for writes of the sizes given.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_TYPE,
                &mut kind as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if kind != libc::SOCK_STREAM {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("descriptor {fd} is not a stream socket"),
            ));
        }
        Ok(())
    }

    pub(super) fn set_cloexec(fd: Descriptor) -> std::io::Result<()> {
        // SAFETY: plain descriptor flag manipulation.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, IntoRawFd};

    #[test]
    fn test_attach_rejects_stdio_and_files() {
        assert!(TcpListener::attach(1).is_err());

        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        assert!(TcpListener::attach(fd).is_err());
        drop(file);
    }

    #[test]
    fn test_attach_same_socket() {
        let original = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = original.local_addr().unwrap();
        let dup = original.try_clone().unwrap();
        let fd = dup.into_raw_fd();

        let attached = TcpListener::attach(fd).unwrap();
        assert_eq!(attached.local_addr().unwrap(), addr);
        assert_eq!(attached.descriptor().unwrap(), fd);
    }
}
