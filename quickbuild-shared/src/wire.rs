//! The message set exchanged between the interceptor and the supervisor.
//!
//! Interceptor → supervisor messages describe one intercepted libc call
//! each; supervisor → interceptor messages are the handshake response, pipe
//! and popen fd replies, and bare acks. Tags are assigned by declaration
//! order starting at 1.

crate::fbb_schema! {
    // Handshake. First message on every fresh connection; the supervisor
    // answers with scproc_resp carrying the same ack id.
    message scproc_query {
        required pid: i32,
        required ppid: i32,
        string cwd: str,
        strings arg: str,
        strings env_var: str,
        string_opt executable: str,
        strings libs: str,
        string_opt shmq_name: str,
    }
    message scproc_resp {
        required shortcut: bool,
        optional exit_status: i32,
        optional debug_flags: i32,
    }

    // Process lifecycle.
    message exec {
        string_opt file: str,
        optional fd: i32,
        optional dirfd: i32,
        strings arg: str,
        strings env: str,
        optional with_p: bool,
        string_opt path: str,
        required utime_u: i64,
        required stime_u: i64,
    }
    message exec_failed {
        required error_no: i32,
    }
    message fork_parent {
        required pid: i32,
    }
    message fork_child {
        required pid: i32,
        required ppid: i32,
        string_opt shmq_name: str,
    }
    message exit {
        required exit_status: i32,
        required utime_u: i64,
        required stime_u: i64,
    }
    message posix_spawn {
        string file: str,
        strings arg: str,
        strings env: str,
        strings file_actions: str,
        required is_spawnp: bool,
    }
    message posix_spawn_parent {
        required pid: i32,
        strings arg: str,
    }
    message posix_spawn_failed {
        strings arg: str,
        required error_no: i32,
    }
    message system {
        string cmd: str,
    }
    message system_ret {
        string_opt cmd: str,
        required ret: i32,
        optional error_no: i32,
    }
    message popen {
        string cmd: str,
        required type_flags: i32,
    }
    message popen_parent {
        required fd: i32,
    }
    message popen_fd { }
    message popen_failed {
        required error_no: i32,
    }

    // File descriptor operations.
    message pre_open {
        optional dirfd: i32,
        string pathname: str,
    }
    message open {
        optional dirfd: i32,
        string pathname: str,
        required flags: i32,
        optional mode: u32,
        optional ret: i32,
        optional error_no: i32,
        required pre_open_sent: bool,
    }
    message close {
        required fd: i32,
        optional error_no: i32,
    }
    message close_range {
        required first: u32,
        required last: u32,
        required flags: i32,
        optional error_no: i32,
    }
    message dup3 {
        required oldfd: i32,
        required newfd: i32,
        optional flags: i32,
        optional ret: i32,
        optional error_no: i32,
    }
    message read_from_inherited {
        required fd: i32,
        required is_pread: bool,
    }
    message write_to_inherited {
        required fd: i32,
        required is_pwrite: bool,
    }
    message seek_in_inherited {
        required fd: i32,
        required modify_offset: bool,
    }
    message recvmsg_scm_rights {
        required cloexec: bool,
        scalars fds: i32,
    }
    message pipe_request {
        optional flags: i32,
    }
    message pipe_created {
        optional error_no: i32,
    }
    message pipe_fds {
        optional fd0: i32,
        optional fd1: i32,
        optional error_no: i32,
    }
    message fcntl {
        required fd: i32,
        required cmd: i32,
        optional arg: i32,
        string_opt string_arg: str,
        optional ret: i32,
        optional error_no: i32,
    }
    message ioctl {
        required fd: i32,
        required cmd: u64,
        optional ret: i32,
        optional error_no: i32,
    }

    // Path and loader observations.
    message readlink {
        optional dirfd: i32,
        string pathname: str,
        string_opt ret_target: str,
        optional error_no: i32,
    }
    message dlopen {
        string_opt filename: str,
        string_opt absolute_filename: str,
        required error: bool,
    }
    message la_objsearch {
        string name: str,
        string_opt ret_name: str,
    }
    message la_objopen {
        string name: str,
    }

    // Generic and diagnostic.
    message gen_call {
        string call: str,
        optional error_no: i32,
    }
    message fb_error {
        string msg: str,
    }
    message fb_debug {
        string msg: str,
    }

    // An empty ack'd message that flushes prior shmq traffic before a
    // socket send.
    message barrier { }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fbb::{FbbBuilder, StrArraySource};

    #[test]
    fn tags_start_at_one_and_are_dense() {
        assert_eq!(TAG_UNUSED, 0);
        assert_eq!(scproc_query::TAG, 1);
        assert_eq!(scproc_resp::TAG, 2);
        assert_eq!(barrier::TAG, TAG_NEXT - 1);
    }

    #[test]
    fn tag_name_resolves_known_and_unknown_tags() {
        assert_eq!(tag_name(open::TAG), "open");
        assert_eq!(tag_name(barrier::TAG), "barrier");
        assert_eq!(tag_name(0), "unknown");
        assert_eq!(tag_name(TAG_NEXT), "unknown");
    }

    #[test]
    fn scproc_query_roundtrip() {
        let arg: &[&str] = &["cc", "-c", "main.c"];
        let mut b = scproc_query::Builder::new();
        b.set_pid(4242);
        b.set_ppid(1);
        b.set_cwd("/src/project");
        b.set_arg(StrArraySource::Strs(arg));
        b.set_env_var(StrArraySource::Strs(&[]));
        b.set_libs(StrArraySource::Strs(&["/lib/libc.so.6"]));
        b.set_shmq_name("/qb-4242-0");

        let len = b.measure();
        let mut buf = vec![0u8; len];
        assert_eq!(b.serialize_into(&mut buf), len);
        assert_eq!(len % 8, 0);

        let v = scproc_query::View::from_bytes(&buf);
        assert_eq!(v.pid(), 4242);
        assert_eq!(v.ppid(), 1);
        assert_eq!(v.cwd(), b"/src/project");
        assert_eq!(v.arg_count(), 3);
        assert_eq!(v.arg_at(0), b"cc");
        assert_eq!(v.arg_at(2), b"main.c");
        // Present-but-empty array, distinguished from an absent one.
        assert!(v.has_env_var());
        assert_eq!(v.env_var_count(), 0);
        assert!(!v.has_executable());
        assert_eq!(v.shmq_name(), Some(&b"/qb-4242-0"[..]));
    }

    #[test]
    fn optional_scalars_track_presence() {
        let mut b = scproc_resp::Builder::new();
        b.set_shortcut(false);
        b.set_debug_flags(3);

        let mut buf = vec![0u8; b.measure()];
        b.serialize_into(&mut buf);

        let v = scproc_resp::View::from_bytes(&buf);
        assert!(!v.shortcut());
        assert!(!v.has_exit_status());
        assert!(v.has_debug_flags());
        assert_eq!(v.debug_flags(), 3);
        assert_eq!(v.exit_status_or(-1), -1);
        assert_eq!(v.debug_flags_or(-1), 3);
    }

    #[test]
    fn scalar_arrays_roundtrip() {
        let fds = [3, 4, 17];
        let mut b = recvmsg_scm_rights::Builder::new();
        b.set_cloexec(true);
        b.set_fds(&fds);

        let mut buf = vec![0u8; b.measure()];
        b.serialize_into(&mut buf);

        let v = recvmsg_scm_rights::View::from_bytes(&buf);
        assert!(v.cloexec());
        assert_eq!(v.fds_count(), 3);
        assert_eq!(v.fds_at(0), 3);
        assert_eq!(v.fds_at(2), 17);
    }

    #[test]
    fn empty_message_serializes_to_header_only() {
        let b = barrier::Builder::new();
        let len = b.measure();
        assert_eq!(len, 8);
        let mut buf = vec![0u8; len];
        b.serialize_into(&mut buf);
        let v = barrier::View::from_bytes(&buf);
        assert_eq!(v.tag(), barrier::TAG);
    }

    #[test]
    fn any_view_dispatches_on_tag() {
        let mut b = close::Builder::new();
        b.set_fd(7);
        let mut buf = vec![0u8; b.measure()];
        b.serialize_into(&mut buf);

        match AnyView::parse(&buf) {
            Some(AnyView::Close(v)) => assert_eq!(v.fd(), 7),
            other => panic!(
                "wrong variant: {:?}",
                other.map(|v| v.name()).unwrap_or("none")
            ),
        }

        let bogus = [0xffu8; 16];
        assert!(AnyView::parse(&bogus).is_none());
    }

    #[test]
    fn exec_message_carries_argv_env_and_rusage() {
        let argv: &[&[u8]] = &[b"make", b"-j8"];
        let envp: &[&[u8]] = &[b"PATH=/usr/bin", b"HOME=/root"];
        let mut b = exec::Builder::new();
        b.set_file("/usr/bin/make");
        b.set_arg(StrArraySource::Slices(argv));
        b.set_env(StrArraySource::Slices(envp));
        b.set_with_p(true);
        b.set_path("/usr/bin:/bin");
        b.set_utime_u(123_456);
        b.set_stime_u(7_890);

        let mut buf = vec![0u8; b.measure()];
        b.serialize_into(&mut buf);

        let v = exec::View::from_bytes(&buf);
        assert_eq!(v.file(), Some(&b"/usr/bin/make"[..]));
        assert!(!v.has_fd());
        let args: Vec<&[u8]> = v.arg_iter().collect();
        assert_eq!(args, argv);
        let envs: Vec<&[u8]> = v.env_iter().collect();
        assert_eq!(envs, envp);
        assert_eq!(v.utime_u(), 123_456);
        assert_eq!(v.stime_u(), 7_890);
    }
}
