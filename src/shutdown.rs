//! Process-wide shutdown flag driven by SIGTERM/SIGINT.
//!
//! The handler only stores into an atomic; the supervisor and worker loops
//! poll the flag with a short timeout.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Raise the shutdown flag on SIGINT, SIGTERM or SIGHUP and return it.
///
/// Can only be called once per process.
pub fn install() -> Result<&'static AtomicBool, ctrlc::Error> {
    ctrlc::set_handler(|| SHUTDOWN.store(true, Ordering::SeqCst))?;
    Ok(&SHUTDOWN)
}

/// Have the kernel send SIGTERM to this process when its parent exits, so
/// workers do not outlive a supervisor that was killed outright.
#[cfg(target_os = "linux")]
pub fn exit_with_parent() -> nix::Result<()> {
    nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGTERM)
}

#[cfg(not(target_os = "linux"))]
pub fn exit_with_parent() -> nix::Result<()> {
    Ok(())
}
