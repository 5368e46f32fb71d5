#![forbid(unsafe_code)]

//! Privilege checks for the batch server.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use tracing::warn;

/// Fails fast when `process` is started as root, unless `allow_root` is set.
/// The server runs untrusted URLs through an external downloader and writes
/// under a shared temp root, so it belongs under an unprivileged account.
pub fn ensure_not_root(process: &str, allow_root: bool) -> Result<()> {
    check_uid(process, Uid::current(), allow_root)
}

fn check_uid(process: &str, uid: Uid, allow_root: bool) -> Result<()> {
    if !uid.is_root() {
        return Ok(());
    }
    if allow_root {
        warn!(process, "running as root because --allow-root was given");
        return Ok(());
    }
    bail!("{process} must not be run as root; use an unprivileged account or pass --allow-root");
}
