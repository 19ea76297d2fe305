//! # Unmount Protocol
//!
//! The two-process commit/abort handshake (§4.7, §6) between the in-kernel
//! filesystem-destroy callback (the daemon side) and the out-of-band unmount
//! driver. The two sides never share memory; they coordinate entirely
//! through a pair of named POSIX message queues.

use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use posixmq::{OpenOptions, PosixMq};

use crate::error::{ProtocolError, WimError, WimResult};

/// The daemon waits at most this long for the driver's request (§4.7 step 2).
pub const DAEMON_WAIT: Duration = Duration::from_secs(3);
/// The driver waits at most this long for the daemon's reply (§4.7 step 6).
pub const DRIVER_WAIT: Duration = Duration::from_secs(600);

const MAX_MSG_LEN: usize = 16;
const QUEUE_CAPACITY: usize = 4;
const MESSAGE_PRIORITY: u32 = 1;

/// Derives the pair of message-queue names from a mount point's basename
/// (§4.7, §6): forward slashes replaced with underscores, trailing slashes
/// stripped.
pub fn queue_names(mount_point: &Path) -> (String, String) {
    let raw = mount_point.to_string_lossy();
    let trimmed = raw.trim_end_matches('/');
    let basename = trimmed.rsplit('/').next().unwrap_or(trimmed).replace('/', "_");
    (
        format!("/{basename}wimlib-unmount-to-daemon-mq"),
        format!("/{basename}daemon-to-unmount-mq"),
    )
}

fn open_queue(name: &str) -> WimResult<PosixMq> {
    OpenOptions::readwrite()
        .create()
        .mode(0o600)
        .max_msg_len(MAX_MSG_LEN)
        .capacity(QUEUE_CAPACITY)
        .open(name)
        .map_err(|_| WimError::Protocol(ProtocolError::Queue))
}

/// Best-effort queue removal; both sides attempt this on their way out, so
/// whichever side closes last is the one that actually unlinks it from the
/// namespace (§4.7: "Both queues are unlinked... by whichever side closes
/// last").
fn unlink_queue(name: &str) {
    let _ = posixmq::remove_queue(name);
}

/// Receives one message on `mq`, giving up after `timeout`. `posixmq`'s
/// blocking `recv` has no built-in deadline, so the wait is done on a
/// helper thread and bounded with a channel.
fn recv_with_timeout(mq: PosixMq, timeout: Duration) -> Option<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = vec![0u8; MAX_MSG_LEN];
        let result = mq.recv(&mut buf).map(|(len, _priority)| buf[..len].to_vec());
        let _ = tx.send(result.ok());
    });
    rx.recv_timeout(timeout).ok().flatten()
}

/// Request sent by the driver to the daemon (§4.7 step 1): whether to
/// commit, and whether to verify integrity afterwards.
#[derive(Debug, Clone, Copy)]
pub struct CommitRequest {
    pub commit: bool,
    pub check_integrity: bool,
}

/// Daemon side of the handshake, run from the filesystem-destroy callback.
pub struct DaemonSide {
    to_daemon: String,
    daemon_to_unmount: String,
}

impl DaemonSide {
    pub fn new(mount_point: &Path) -> Self {
        let (to_daemon, daemon_to_unmount) = queue_names(mount_point);
        Self { to_daemon, daemon_to_unmount }
    }

    /// Opens both queues and waits up to `DAEMON_WAIT` for the driver's
    /// request. On timeout, assumes "do not commit" and the caller should
    /// log the failure (§4.7 step 2).
    pub fn wait_for_request(&self) -> WimResult<Option<CommitRequest>> {
        let mq = open_queue(&self.to_daemon)?;
        // Pre-open the reply queue too, so a driver that raced ahead and is
        // already waiting on it finds it present.
        let _reply = open_queue(&self.daemon_to_unmount)?;
        match recv_with_timeout(mq, DAEMON_WAIT) {
            Some(bytes) if bytes.len() >= 2 => Ok(Some(CommitRequest {
                commit: bytes[0] != 0,
                check_integrity: bytes[1] != 0,
            })),
            _ => {
                log::warn!("unmount handshake timed out waiting for driver request; discarding changes");
                Ok(None)
            }
        }
    }

    /// Sends the 1-byte status reply (§4.7 step 5) and unlinks both queues.
    pub fn send_status(&self, status: u8) -> WimResult<()> {
        let mq = open_queue(&self.daemon_to_unmount)?;
        mq.send(MESSAGE_PRIORITY, &[status])
            .map_err(|_| WimError::Protocol(ProtocolError::Queue))?;
        unlink_queue(&self.to_daemon);
        unlink_queue(&self.daemon_to_unmount);
        Ok(())
    }
}

/// Driver side of the handshake, run by the out-of-band unmount binary
/// after it has successfully invoked the OS-level unmount command.
pub struct DriverSide {
    to_daemon: String,
    daemon_to_unmount: String,
}

impl DriverSide {
    pub fn new(mount_point: &Path) -> Self {
        let (to_daemon, daemon_to_unmount) = queue_names(mount_point);
        Self { to_daemon, daemon_to_unmount }
    }

    /// Sends the commit request (§4.7 step 1).
    pub fn send_request(&self, request: CommitRequest) -> WimResult<()> {
        let mq = open_queue(&self.to_daemon)?;
        let msg = [request.commit as u8, request.check_integrity as u8];
        mq.send(MESSAGE_PRIORITY, &msg)
            .map_err(|_| WimError::Protocol(ProtocolError::Queue))
    }

    /// Waits up to `DRIVER_WAIT` for the daemon's status byte (§4.7 step
    /// 6). On timeout, returns a timeout error without a verdict.
    pub fn wait_for_status(&self) -> WimResult<u8> {
        let mq = open_queue(&self.daemon_to_unmount)?;
        match recv_with_timeout(mq, DRIVER_WAIT) {
            Some(bytes) if !bytes.is_empty() => {
                unlink_queue(&self.to_daemon);
                unlink_queue(&self.daemon_to_unmount);
                Ok(bytes[0])
            }
            _ => Err(WimError::Protocol(ProtocolError::Timeout)),
        }
    }
}
