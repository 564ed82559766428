//! Language-level and OS-level thread priorities.
//!
//! `Priority` is the coarse class a thread is created with and is only
//! recorded on the worker identity. The OS priority is a Linux nice value
//! applied to the thread itself when its body starts.

use std::io;

pub const THREAD_PRIORITY_DEFAULT: i32 = 0;
pub const THREAD_PRIORITY_LOWEST: i32 = 19;
pub const THREAD_PRIORITY_BACKGROUND: i32 = 10;
pub const THREAD_PRIORITY_FOREGROUND: i32 = -2;
pub const THREAD_PRIORITY_DISPLAY: i32 = -4;
pub const THREAD_PRIORITY_URGENT_DISPLAY: i32 = -8;
pub const THREAD_PRIORITY_AUDIO: i32 = -16;
pub const THREAD_PRIORITY_URGENT_AUDIO: i32 = -19;
pub const THREAD_PRIORITY_MORE_FAVORABLE: i32 = -1;
pub const THREAD_PRIORITY_LESS_FAVORABLE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Realtime = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

pub fn is_valid_os_priority(priority: i32) -> bool {
    (THREAD_PRIORITY_URGENT_AUDIO..=THREAD_PRIORITY_LOWEST).contains(&priority)
}

/// Nice value of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_os_priority() -> io::Result<i32> {
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        // -1 is a legal nice value, so errno has to be checked explicitly
        *libc::__errno_location() = 0;
        let value = libc::getpriority(libc::PRIO_PROCESS, tid);
        if value == -1 && *libc::__errno_location() != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn current_os_priority() -> io::Result<i32> {
    Ok(THREAD_PRIORITY_DEFAULT)
}

/// Sets the nice value of the calling thread only.
#[cfg(target_os = "linux")]
pub fn set_current_os_priority(priority: i32) -> io::Result<()> {
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        if libc::setpriority(libc::PRIO_PROCESS, tid, priority) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_current_os_priority(_priority: i32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Realtime < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert!(Priority::Low < Priority::Background);
    }

    #[test]
    fn test_os_priority_range() {
        assert!(is_valid_os_priority(THREAD_PRIORITY_DEFAULT));
        assert!(is_valid_os_priority(THREAD_PRIORITY_BACKGROUND));
        assert!(is_valid_os_priority(THREAD_PRIORITY_URGENT_AUDIO));
        assert!(!is_valid_os_priority(20));
        assert!(!is_valid_os_priority(-20));
    }

    #[test]
    fn test_lowering_own_priority() {
        // lowering is always permitted, raising may need privileges
        std::thread::spawn(|| {
            let before = current_os_priority().unwrap();
            let target = (before + 1).min(THREAD_PRIORITY_LOWEST);
            set_current_os_priority(target).unwrap();
            if cfg!(target_os = "linux") {
                assert_eq!(current_os_priority().unwrap(), target);
            }
        })
        .join()
        .unwrap();
    }
}
