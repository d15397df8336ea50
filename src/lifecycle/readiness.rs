//! Successor-to-predecessor readiness channel.
//!
//! The predecessor creates a pipe and hands the write end to the successor
//! as its last inherited descriptor (`--control-fd`). Once every server is
//! Running, the successor writes [`READY_LINE`] and closes its end. EOF
//! without that line means the successor died first.

use std::io::{BufRead, BufReader, PipeReader};
use std::time::Duration;

use crate::error::ServerError;
use crate::net::inherit::Descriptor;

pub const READY_LINE: &str = "ready";

/// Successor side.
#[derive(Debug)]
pub struct ReadinessNotifier {
    control: Option<std::fs::File>,
}

impl ReadinessNotifier {
    /// Nothing to notify: this process was not spawned by a predecessor.
    pub fn none() -> Self {
        Self { control: None }
    }

    /// Take ownership of the inherited control descriptor.
    #[cfg(unix)]
    pub fn from_descriptor(descriptor: Descriptor) -> std::io::Result<Self> {
        use std::os::fd::FromRawFd;

        if descriptor < crate::net::inherit::FIRST_INHERITED {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("control descriptor {descriptor} is reserved for stdio"),
            ));
        }
        // SAFETY: F_GETFD/F_SETFD only touch descriptor flags; failure means
        // the descriptor is not open.
        let flags = unsafe { libc::fcntl(descriptor, libc::F_GETFD) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(descriptor, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: open, inherited for this purpose, owned by nothing else.
        let control = unsafe { std::fs::File::from_raw_fd(descriptor) };
        Ok(Self { control: Some(control) })
    }

    #[cfg(not(unix))]
    pub fn from_descriptor(_descriptor: Descriptor) -> std::io::Result<Self> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "control descriptors are not supported on this platform",
        ))
    }

    /// Report readiness and close the channel.
    pub fn notify(mut self) -> std::io::Result<()> {
        use std::io::Write;

        if let Some(mut control) = self.control.take() {
            control.write_all(format!("{READY_LINE}\n").as_bytes())?;
            control.flush()?;
            tracing::info!("Readiness reported to predecessor");
        }
        Ok(())
    }
}

/// Predecessor side: wait for the ready line, bounded by `timeout`.
pub async fn wait_ready(reader: PipeReader, timeout: Duration) -> Result<(), ServerError> {
    let read = tokio::task::spawn_blocking(move || {
        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).map(|_| line)
    });

    match tokio::time::timeout(timeout, read).await {
        Err(_) => Err(ServerError::Successor(format!(
            "no readiness report within {}s",
            timeout.as_secs_f64()
        ))),
        Ok(Err(e)) => Err(ServerError::Successor(format!("readiness reader failed: {e}"))),
        Ok(Ok(Err(e))) => Err(ServerError::Successor(format!("readiness channel failed: {e}"))),
        Ok(Ok(Ok(line))) if line.trim() == READY_LINE => Ok(()),
        Ok(Ok(Ok(line))) if line.is_empty() => Err(ServerError::Successor(
            "successor exited before reporting ready".into(),
        )),
        Ok(Ok(Ok(line))) => Err(ServerError::Successor(format!(
            "unexpected readiness report `{}`",
            line.trim()
        ))),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    #[tokio::test]
    async fn test_ready_line() {
        let (reader, writer) = std::io::pipe().unwrap();
        let notifier = ReadinessNotifier::from_descriptor(writer.into_raw_fd()).unwrap();
        notifier.notify().unwrap();
        wait_ready(reader, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_and_timeout() {
        let (reader, writer) = std::io::pipe().unwrap();
        drop(writer);
        let err = wait_ready(reader, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("exited before"));

        let (reader, _writer) = std::io::pipe().unwrap();
        let err = wait_ready(reader, Duration::from_millis(50)).await.unwrap_err();
        assert!(err.to_string().contains("no readiness report"));
    }

    #[test]
    fn test_rejects_stdio() {
        assert!(ReadinessNotifier::from_descriptor(2).is_err());
        ReadinessNotifier::none().notify().unwrap();
    }
}
