//! Process spawning helpers.
//!
//! Encoder and probe binaries are console programs; when the engine is
//! embedded in a GUI shell on Windows each invocation would otherwise
//! flash a console window. This module centralizes the creation flags
//! that suppress that, and the niceness applied to encode processes so
//! they do not starve playback.

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Apply platform-specific flags to a tokio process command.
pub fn configure_command(cmd: &mut tokio::process::Command) {
    #[cfg(target_os = "windows")]
    {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    let _ = cmd;
}

/// Lower the scheduling priority of a spawned encode process.
///
/// Best effort: failures are ignored, the job still runs at normal
/// priority.
pub fn renice(pid: Option<u32>) {
    #[cfg(target_os = "linux")]
    if let Some(pid) = pid {
        unsafe {
            libc_setpriority(pid);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = pid;
}

#[cfg(target_os = "linux")]
unsafe fn libc_setpriority(pid: u32) {
    // PRIO_PROCESS = 0, niceness 10
    extern "C" {
        fn setpriority(which: i32, who: u32, prio: i32) -> i32;
    }
    let _ = setpriority(0, pid, 10);
}
