//! Environment variable names agreed on by the supervisor and the
//! interceptor, and the naming conventions derived from them.

/// Path prefix of the supervisor's AF_UNIX socket pool. The interceptor
/// connects to `$FB_SOCKET` + `"0"`.
pub const FB_SOCKET: &str = "FB_SOCKET";

/// Name of a POSIX shared resource. The interceptor does not use it itself,
/// it only restores the value in the environment of children if the
/// application changed it.
pub const FB_SEMAPHORE: &str = "FB_SEMAPHORE";

/// Colon-separated list of path prefixes under which `open()` does not wait
/// for an acknowledgment from the supervisor.
pub const FB_SYSTEM_LOCATIONS: &str = "FB_SYSTEM_LOCATIONS";

/// If set to `1`, the interceptor emits marker `open()` calls around every
/// intercepted call so the interception shows up in strace/ltrace output.
pub const FB_INSERT_TRACE_MARKERS: &str = "FB_INSERT_TRACE_MARKERS";

pub const LD_PRELOAD: &str = "LD_PRELOAD";
pub const LD_LIBRARY_PATH: &str = "LD_LIBRARY_PATH";

/// File name of the preloaded interceptor library, as it appears in
/// `LD_PRELOAD` and in the loaded-library list reported at handshake.
pub const INTERCEPTOR_SO: &str = "libquickbuild_interceptor.so";

/// Marker path prefix used for the trace-marker `open()` calls.
pub const TRACE_MARKER_PREFIX: &str = "/QUICKBUILD   ###   ";

/// Maximum length of a shared memory object name the interceptor composes,
/// including the terminating NUL.
pub const SHMQ_NAME_MAX: usize = 64;

/// Compose the shared memory object name for a process's message queue into
/// `buf`, without allocating. Returns the length written (excluding the
/// terminating NUL that is also placed).
///
/// The name has the form `/qb-<pid>-<seq>`; `seq` disambiguates the queues a
/// single pid creates across re-connects.
pub fn format_shmq_name(buf: &mut [u8; SHMQ_NAME_MAX], pid: i32, seq: u32) -> usize {
    let mut pos = 0;
    for b in b"/qb-" {
        buf[pos] = *b;
        pos += 1;
    }
    pos += format_u64(&mut buf[pos..], pid as u64);
    buf[pos] = b'-';
    pos += 1;
    pos += format_u64(&mut buf[pos..], seq as u64);
    buf[pos] = 0;
    pos
}

/// Format a decimal number into `buf` without allocating. Returns the number
/// of bytes written.
pub fn format_u64(buf: &mut [u8], mut value: u64) -> usize {
    let mut tmp = [0u8; 20];
    let mut n = 0;
    loop {
        tmp[n] = b'0' + (value % 10) as u8;
        value /= 10;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in 0..n {
        buf[i] = tmp[n - 1 - i];
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shmq_name_is_nul_terminated_and_unique_per_seq() {
        let mut buf = [0u8; SHMQ_NAME_MAX];
        let len = format_shmq_name(&mut buf, 1234, 0);
        assert_eq!(&buf[..len], b"/qb-1234-0");
        assert_eq!(buf[len], 0);

        let mut buf2 = [0u8; SHMQ_NAME_MAX];
        let len2 = format_shmq_name(&mut buf2, 1234, 7);
        assert_eq!(&buf2[..len2], b"/qb-1234-7");
    }

    #[test]
    fn format_u64_handles_zero_and_large_values() {
        let mut buf = [0u8; 20];
        assert_eq!(format_u64(&mut buf, 0), 1);
        assert_eq!(buf[0], b'0');
        let n = format_u64(&mut buf, 9876543210);
        assert_eq!(&buf[..n], b"9876543210");
    }
}
