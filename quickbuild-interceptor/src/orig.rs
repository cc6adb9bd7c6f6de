//! Access to the original libc entry points the wrappers shadow.
//!
//! Every function this library exports must reach the real implementation
//! through `dlsym(RTLD_NEXT, ...)`; going through the `libc` crate would
//! resolve back to our own exported symbol. The resolved pointer is cached
//! in a relaxed atomic, so after the first call the lookup is a single load
//! and the path is async-signal-safe.

use core::sync::atomic::{AtomicUsize, Ordering};
use libc::c_char;

/// Resolve `name` through `RTLD_NEXT`, caching the result in `cell`.
pub fn resolve(cell: &AtomicUsize, name: &'static [u8]) -> usize {
    let mut p = cell.load(Ordering::Relaxed);
    if p == 0 {
        debug_assert_eq!(name.last(), Some(&0u8));
        p = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) } as usize;
        cell.store(p, Ordering::Relaxed);
    }
    p
}

/// Define `orig_<name>` functions that call the real libc implementation.
macro_rules! ic_orig_fns {
    ( $( fn $name:ident ( $( $arg:ident : $ty:ty ),* $(,)? ) -> $ret:ty; )* ) => {
        ::paste::paste! { $(
            static [<ORIG_ $name:upper>]: ::core::sync::atomic::AtomicUsize =
                ::core::sync::atomic::AtomicUsize::new(0);

            pub unsafe fn [<orig_ $name>]( $( $arg : $ty ),* ) -> $ret {
                let p = $crate::orig::resolve(
                    &[<ORIG_ $name:upper>],
                    concat!(stringify!($name), "\0").as_bytes(),
                );
                debug_assert!(p != 0, concat!("dlsym failed for ", stringify!($name)));
                let f: unsafe extern "C" fn( $( $ty ),* ) -> $ret = ::core::mem::transmute(p);
                f( $( $arg ),* )
            }
        )* }
    };
}

pub(crate) use ic_orig_fns;

pub mod fns {
    use libc::{
        c_char, c_int, c_long, c_uint, c_ulong, c_void, mode_t, off_t, pid_t,
        posix_spawn_file_actions_t, posix_spawnattr_t, sighandler_t, size_t, ssize_t, FILE,
    };

    super::ic_orig_fns! {
        fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int;
        fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int;
        fn creat(path: *const c_char, mode: mode_t) -> c_int;
        fn close(fd: c_int) -> c_int;
        fn close_range(first: c_uint, last: c_uint, flags: c_int) -> c_int;
        fn closefrom(lowfd: c_int) -> ();
        fn dup(oldfd: c_int) -> c_int;
        fn dup2(oldfd: c_int, newfd: c_int) -> c_int;
        fn dup3(oldfd: c_int, newfd: c_int, flags: c_int) -> c_int;
        fn pipe2(pipefd: *mut c_int, flags: c_int) -> c_int;

        fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t;
        fn pread(fd: c_int, buf: *mut c_void, count: size_t, offset: off_t) -> ssize_t;
        fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t;
        fn preadv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int, offset: off_t) -> ssize_t;
        fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t;
        fn pwrite(fd: c_int, buf: *const c_void, count: size_t, offset: off_t) -> ssize_t;
        fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t;
        fn pwritev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int, offset: off_t) -> ssize_t;
        fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t;

        fn lseek(fd: c_int, offset: off_t, whence: c_int) -> off_t;
        fn fseek(stream: *mut FILE, offset: c_long, whence: c_int) -> c_int;
        fn fseeko(stream: *mut FILE, offset: off_t, whence: c_int) -> c_int;
        fn ftell(stream: *mut FILE) -> c_long;
        fn ftello(stream: *mut FILE) -> off_t;
        fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int;
        fn ioctl(fd: c_int, request: c_ulong, argp: *mut c_void) -> c_int;
        fn readlink(path: *const c_char, buf: *mut c_char, bufsiz: size_t) -> ssize_t;
        fn readlinkat(dirfd: c_int, path: *const c_char, buf: *mut c_char, bufsiz: size_t) -> ssize_t;

        fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int;
        fn connect(fd: c_int, addr: *const libc::sockaddr, len: libc::socklen_t) -> c_int;

        fn execve(path: *const c_char, argv: *const *const c_char, envp: *const *const c_char) -> c_int;
        fn execvpe(file: *const c_char, argv: *const *const c_char, envp: *const *const c_char) -> c_int;
        fn fexecve(fd: c_int, argv: *const *const c_char, envp: *const *const c_char) -> c_int;
        fn fork() -> pid_t;

        fn posix_spawn(
            pid: *mut pid_t,
            path: *const c_char,
            file_actions: *const posix_spawn_file_actions_t,
            attrp: *const posix_spawnattr_t,
            argv: *const *const c_char,
            envp: *const *const c_char,
        ) -> c_int;
        fn posix_spawnp(
            pid: *mut pid_t,
            file: *const c_char,
            file_actions: *const posix_spawn_file_actions_t,
            attrp: *const posix_spawnattr_t,
            argv: *const *const c_char,
            envp: *const *const c_char,
        ) -> c_int;
        fn posix_spawn_file_actions_init(fa: *mut posix_spawn_file_actions_t) -> c_int;
        fn posix_spawn_file_actions_destroy(fa: *mut posix_spawn_file_actions_t) -> c_int;
        fn posix_spawn_file_actions_addopen(
            fa: *mut posix_spawn_file_actions_t,
            fd: c_int,
            path: *const c_char,
            flags: c_int,
            mode: mode_t,
        ) -> c_int;
        fn posix_spawn_file_actions_addclose(fa: *mut posix_spawn_file_actions_t, fd: c_int) -> c_int;
        fn posix_spawn_file_actions_adddup2(
            fa: *mut posix_spawn_file_actions_t,
            oldfd: c_int,
            newfd: c_int,
        ) -> c_int;

        fn system(cmd: *const c_char) -> c_int;
        fn popen(cmd: *const c_char, mode: *const c_char) -> *mut FILE;
        fn pclose(stream: *mut FILE) -> c_int;

        fn signal(signum: c_int, handler: sighandler_t) -> sighandler_t;
        fn sigaction(
            signum: c_int,
            act: *const libc::sigaction,
            oldact: *mut libc::sigaction,
        ) -> c_int;

        fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void;

        fn chdir(path: *const c_char) -> c_int;
        fn fchdir(fd: c_int) -> c_int;

        fn exit(status: c_int) -> ();
        fn _exit(status: c_int) -> ();
        fn quick_exit(status: c_int) -> ();
    }

    // `_Exit` spelled out by hand: the generated cache name would collide
    // with `_exit`'s under case folding.
    static ORIG_CAP_EXIT: ::core::sync::atomic::AtomicUsize =
        ::core::sync::atomic::AtomicUsize::new(0);

    #[allow(non_snake_case)]
    pub unsafe fn orig__Exit(status: c_int) {
        let p = crate::orig::resolve(&ORIG_CAP_EXIT, b"_Exit\0");
        debug_assert!(p != 0, "dlsym failed for _Exit");
        let f: unsafe extern "C" fn(c_int) = ::core::mem::transmute(p);
        f(status)
    }
}
