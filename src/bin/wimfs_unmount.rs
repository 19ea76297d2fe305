//! # wimfs-unmount
//!
//! Out-of-band driver for the unmount handshake (§4.7, §6). Invokes the
//! OS-level `fusermount -u` to tear down the kernel mount, then exchanges
//! the commit request/status messages with the daemon's `destroy` callback
//! over the named queues `unmount.rs` defines.

use std::process::Command;

use clap::Parser;

use wimfs::error::ProtocolError;
use wimfs::options::UnmountOptions;
use wimfs::unmount::{CommitRequest, DriverSide};

/// Status byte the daemon reports back meaning the commit (or discard)
/// completed without error (§4.7 step 5).
const STATUS_OK: u8 = 0;

fn run_fusermount(options: &UnmountOptions) -> Result<(), ProtocolError> {
    let status = Command::new("fusermount")
        .arg("-u")
        .arg(&options.mount_point)
        .status()
        .map_err(|_| ProtocolError::Fusermount)?;
    if status.success() {
        Ok(())
    } else {
        Err(ProtocolError::Fusermount)
    }
}

fn main() {
    let options = UnmountOptions::parse();
    env_logger::init();

    run_fusermount(&options).expect("fusermount failed");

    let driver = DriverSide::new(&options.mount_point);
    driver
        .send_request(CommitRequest {
            commit: options.commit,
            check_integrity: options.check_integrity,
        })
        .expect("failed to send the commit request to the daemon");

    match driver.wait_for_status() {
        Ok(STATUS_OK) => {
            log::info!("unmount complete");
        }
        Ok(status) => {
            panic!("daemon reported commit failure (status {status})");
        }
        Err(e) => {
            panic!("unmount handshake failed: {e}");
        }
    }
}
