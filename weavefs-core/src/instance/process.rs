//! OS process liveness checks used to prune registered processes.

/// Returns true if a process with this id is currently running.
#[cfg(unix)]
pub fn is_process_alive(process_id: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(process_id) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only performs the existence and permission checks.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Returns true if a process with this id is currently running.
#[cfg(windows)]
pub fn is_process_alive(process_id: u32) -> bool {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    const STILL_ACTIVE: u32 = 259;

    if process_id == 0 {
        return false;
    }
    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, process_id) else {
            return false;
        };
        let mut exit_code = 0u32;
        let alive = GetExitCodeProcess(handle, &mut exit_code).is_ok() && exit_code == STILL_ACTIVE;
        let _ = CloseHandle(handle);
        alive
    }
}

/// Returns true if a process with this id is currently running.
#[cfg(not(any(unix, windows)))]
pub fn is_process_alive(_process_id: u32) -> bool {
    true
}
