//! Process-wide interceptor state and supervisor communication.
//!
//! Initialization runs exactly once, triggered either by the library
//! constructor or by the first intercepted call. It creates this process's
//! shared-memory queue, connects the control socket, and performs the
//! `scproc_query` / `scproc_resp` handshake; a `shortcut` answer terminates
//! the process right here with the cached exit status.
//!
//! Message routing: everything goes over the shmq (the hot path, in FIFO
//! order) except messages that carry or chase file descriptors, and
//! messages sent before the queue is attached; those use the socket.
//! Acknowledgments always arrive on the socket.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::ffi::{CStr, CString};
use std::sync::OnceLock;

use libc::{c_char, c_int, c_void};
use quickbuild_shared::env as names;
use quickbuild_shared::fbb::{CStrArray, FbbBuilder, StrArraySource};
use quickbuild_shared::{frame, shmq, wire};

use crate::lock::{IC_GLOBAL_LOCK, IC_SYSTEM_POPEN_LOCK};
use crate::orig::fns::*;
use crate::{envfix, fdstate, tls};

/// Master switch; cleared when the environment tells us to stand down or
/// initialization cannot reach a supervisor.
pub static INTERCEPTING_ENABLED: AtomicBool = AtomicBool::new(true);

const INIT_NONE: u8 = 0;
const INIT_RUNNING: u8 = 1;
const INIT_DONE: u8 = 2;
const INIT_FAILED: u8 = 3;
static INIT_STATE: AtomicU8 = AtomicU8::new(INIT_NONE);
static INIT_TID: AtomicI32 = AtomicI32::new(0);

/// Connection file descriptor to the supervisor.
pub static FB_SV_CONN: AtomicI32 = AtomicI32::new(-1);

/// Stored pid. When `getpid()` disagrees, we missed a fork.
pub static IC_PID: AtomicI32 = AtomicI32::new(0);

/// Debugging flags granted by the supervisor in `scproc_resp`.
pub static DEBUG_FLAGS: AtomicI32 = AtomicI32::new(0);

/// Emit marker open() calls visible in strace/ltrace output.
pub static INSERT_TRACE_MARKERS: AtomicBool = AtomicBool::new(false);

static NEXT_ACK_ID: AtomicU32 = AtomicU32::new(1);
static SHMQ_SEQ: AtomicU32 = AtomicU32::new(0);

static FB_SOCKET_VALUE: OnceLock<CString> = OnceLock::new();
static CONN_PATH: OnceLock<CString> = OnceLock::new();
static FB_SEMAPHORE_VALUE: OnceLock<Option<CString>> = OnceLock::new();
static LD_LIBRARY_PATH_INITIAL: OnceLock<Option<CString>> = OnceLock::new();
static SYSTEM_LOCATIONS: OnceLock<Vec<Vec<u8>>> = OnceLock::new();

struct ShmqCell(UnsafeCell<Option<shmq::Writer>>);
// Written at init and in the at-fork child (both single-threaded moments);
// otherwise mutated only with the global lock or inside a danger zone.
unsafe impl Sync for ShmqCell {}
static SHMQ: ShmqCell = ShmqCell(UnsafeCell::new(None));

struct NameCell(UnsafeCell<([u8; names::SHMQ_NAME_MAX], usize)>);
unsafe impl Sync for NameCell {}
static SHMQ_NAME: NameCell = NameCell(UnsafeCell::new(([0; names::SHMQ_NAME_MAX], 0)));

static RUSAGE_BASE_UTIME: AtomicI64 = AtomicI64::new(0);
static RUSAGE_BASE_STIME: AtomicI64 = AtomicI64::new(0);

pub fn conn_fd() -> c_int {
    FB_SV_CONN.load(Ordering::Relaxed)
}

pub fn next_ack_id() -> u32 {
    NEXT_ACK_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

pub fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e }
}

/// Abort with a tagged diagnostic. The supervisor's view of the build is
/// inconsistent once a core channel failed, so there is nothing gentler to
/// do.
pub fn fb_abort(msg: &str) -> ! {
    unsafe {
        let tag = b"quickbuild-interceptor: ";
        libc::write(2, tag.as_ptr() as *const c_void, tag.len());
        libc::write(2, msg.as_ptr() as *const c_void, msg.len());
        libc::write(2, b"\n".as_ptr() as *const c_void, 1);
        libc::abort()
    }
}

/// Ensure initialization ran. Returns false while this thread is itself
/// inside the initializer (its libc calls pass through uninstrumented) and
/// when interception is off for the process.
pub fn ic_load() -> bool {
    loop {
        match INIT_STATE.load(Ordering::Acquire) {
            INIT_DONE => return true,
            INIT_FAILED => return false,
            INIT_RUNNING => {
                if INIT_TID.load(Ordering::Relaxed) == unsafe { libc::gettid() } {
                    return false;
                }
                unsafe { libc::sched_yield() };
            }
            _ => {
                if INIT_STATE
                    .compare_exchange(
                        INIT_NONE,
                        INIT_RUNNING,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    INIT_TID.store(unsafe { libc::gettid() }, Ordering::Relaxed);
                    let ok = unsafe { ic_init() };
                    if !ok {
                        INTERCEPTING_ENABLED.store(false, Ordering::Relaxed);
                    }
                    INIT_STATE.store(
                        if ok { INIT_DONE } else { INIT_FAILED },
                        Ordering::Release,
                    );
                    return ok;
                }
            }
        }
    }
}

/// Fast per-call check: interception is on and ready, and we are not
/// re-entering from our own initializer.
pub fn intercepting() -> bool {
    INTERCEPTING_ENABLED.load(Ordering::Relaxed) && ic_load()
}

// ---------------------------------------------------------------------------
// Trace markers

fn marker_open(parts: &[&[u8]]) {
    let saved = errno();
    let mut buf = [0u8; 256];
    let mut pos = 0;
    for part in [names::TRACE_MARKER_PREFIX.as_bytes()].iter().chain(parts) {
        let n = part.len().min(buf.len() - 1 - pos);
        buf[pos..pos + n].copy_from_slice(&part[..n]);
        pos += n;
    }
    buf[pos] = 0;
    unsafe {
        // The path doesn't exist; the point is its appearance in strace.
        orig_open(buf.as_ptr() as *const c_char, 0, 0);
    }
    set_errno(saved);
}

pub fn insert_debug_msg(msg: &str) {
    if INSERT_TRACE_MARKERS.load(Ordering::Relaxed) {
        marker_open(&[msg.as_bytes()]);
    }
}

pub fn insert_begin_marker(name: &str) {
    if INSERT_TRACE_MARKERS.load(Ordering::Relaxed) {
        marker_open(&[b"intercept-begin: ", name.as_bytes()]);
    }
}

pub fn insert_end_marker(name: &str) {
    if INSERT_TRACE_MARKERS.load(Ordering::Relaxed) {
        marker_open(&[b"intercept-end: ", name.as_bytes()]);
    }
}

// ---------------------------------------------------------------------------
// Global lock

/// Grab the global lock unless this thread already holds it (e.g. a signal
/// handler interrupted the critical section it is re-entering).
pub fn grab_global_lock(i_locked: &mut bool, name: &'static str) {
    tls::danger_zone_enter();
    let held = tls::IC_TLS.with(|t| t.has_global_lock.get());
    if !held {
        IC_GLOBAL_LOCK.lock();
        tls::IC_TLS.with(|t| {
            t.has_global_lock.set(true);
            t.intercept_on.set(name.as_ptr());
        });
        *i_locked = true;
    }
    tls::danger_zone_leave();
}

pub fn release_global_lock() {
    tls::danger_zone_enter();
    IC_GLOBAL_LOCK.unlock();
    tls::IC_TLS.with(|t| {
        t.has_global_lock.set(false);
        t.intercept_on.set(core::ptr::null());
    });
    tls::danger_zone_leave();
}

// ---------------------------------------------------------------------------
// Message sending

fn shmq_write(msg: &dyn FbbBuilder, ack_id: u32) {
    unsafe {
        let slot = &mut *SHMQ.0.get();
        let Some(writer) = slot.as_mut() else {
            fb_abort("message queue used before initialization")
        };
        let len = msg.measure();
        match writer.new_message(ack_id, len) {
            Ok(span) => {
                msg.serialize_into(span);
            }
            Err(_) => fb_abort("shared memory queue failure"),
        }
        writer.add_message();
    }
}

/// Wait for the bare ack with the given id on the socket.
pub fn wait_ack(expected: u32) {
    match frame::recv_frame_header(conn_fd()) {
        Ok((len, ack)) => {
            if len != 0 || ack != expected {
                fb_abort("ack mismatch from supervisor");
            }
        }
        Err(_) => fb_abort("supervisor connection lost"),
    }
}

/// Enqueue on the shmq, no ack. Safe from signal handlers.
pub fn send_msg_shmq(msg: &dyn FbbBuilder) {
    tls::danger_zone_enter();
    shmq_write(msg, 0);
    tls::danger_zone_leave();
}

/// Enqueue on the shmq and block until the supervisor acks on the socket.
pub fn send_msg_shmq_and_ack(msg: &dyn FbbBuilder) {
    tls::danger_zone_enter();
    let ack = next_ack_id();
    shmq_write(msg, ack);
    wait_ack(ack);
    tls::danger_zone_leave();
}

/// Send on the socket, no ack.
pub fn send_msg_socket(msg: &dyn FbbBuilder) {
    tls::danger_zone_enter();
    if frame::send_frame(conn_fd(), msg, 0).is_err() {
        fb_abort("supervisor connection lost");
    }
    tls::danger_zone_leave();
}

/// Send on the socket and block for the ack.
pub fn send_msg_socket_and_ack(msg: &dyn FbbBuilder) {
    tls::danger_zone_enter();
    let ack = next_ack_id();
    if frame::send_frame(conn_fd(), msg, ack).is_err() {
        fb_abort("supervisor connection lost");
    }
    wait_ack(ack);
    tls::danger_zone_leave();
}

pub fn shmq_is_empty() -> bool {
    unsafe {
        (*SHMQ.0.get())
            .as_mut()
            .map(|w| w.queue_is_empty())
            .unwrap_or(true)
    }
}

/// Flush the shmq before an ordering-sensitive socket send: an empty ack'd
/// message whose ack proves the supervisor consumed everything before it.
pub fn send_barrier_if_queue_nonempty() {
    if !shmq_is_empty() {
        let b = wire::barrier::Builder::new();
        send_msg_shmq_and_ack(&b);
    }
}

// ---------------------------------------------------------------------------
// rusage accounting

fn current_rusage() -> (i64, i64) {
    let mut ru: libc::rusage = unsafe { core::mem::zeroed() };
    unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) };
    (
        ru.ru_utime.tv_sec as i64 * 1_000_000 + ru.ru_utime.tv_usec as i64,
        ru.ru_stime.tv_sec as i64 * 1_000_000 + ru.ru_stime.tv_usec as i64,
    )
}

/// Restart the per-exec CPU accounting window.
pub fn reset_rusage() {
    let (u, s) = current_rusage();
    RUSAGE_BASE_UTIME.store(u, Ordering::Relaxed);
    RUSAGE_BASE_STIME.store(s, Ordering::Relaxed);
}

/// CPU time spent since the last exec (or process start).
pub fn rusage_since_exec() -> (i64, i64) {
    let (u, s) = current_rusage();
    (
        u - RUSAGE_BASE_UTIME.load(Ordering::Relaxed),
        s - RUSAGE_BASE_STIME.load(Ordering::Relaxed),
    )
}

/// Total CPU time, for the final `exit` report.
pub fn rusage_total() -> (i64, i64) {
    current_rusage()
}

// ---------------------------------------------------------------------------
// Paths and env

/// Whether `path` falls under one of the `FB_SYSTEM_LOCATIONS` prefixes,
/// i.e. open() there skips waiting for a supervisor ack.
pub fn is_path_at_system_locations(path: &[u8]) -> bool {
    SYSTEM_LOCATIONS
        .get()
        .map(|locs| locs.iter().any(|prefix| path.starts_with(&prefix[..])))
        .unwrap_or(false)
}

/// The environment contract children must satisfy.
pub fn fixup_spec() -> envfix::FixupSpec<'static> {
    envfix::FixupSpec {
        fb_socket: FB_SOCKET_VALUE.get().map(|c| c.to_bytes()),
        fb_semaphore: FB_SEMAPHORE_VALUE
            .get()
            .and_then(|o| o.as_ref())
            .map(|c| c.to_bytes()),
        insert_trace_markers: INSERT_TRACE_MARKERS.load(Ordering::Relaxed),
        ld_library_path: LD_LIBRARY_PATH_INITIAL
            .get()
            .and_then(|o| o.as_ref())
            .map(|c| c.to_bytes()),
        preload_so: names::INTERCEPTOR_SO.as_bytes(),
    }
}

// ---------------------------------------------------------------------------
// Exit reporting

/// Report the exit status and resource usage. May run more than once when
/// several threads race to exit; the supervisor copes.
pub fn handle_exit(status: c_int) {
    if !INTERCEPTING_ENABLED.load(Ordering::Relaxed)
        || INIT_STATE.load(Ordering::Acquire) != INIT_DONE
    {
        return;
    }

    let mut i_locked = false;
    grab_global_lock(&mut i_locked, "handle_exit");

    let (utime_u, stime_u) = rusage_total();
    let mut msg = wire::exit::Builder::new();
    msg.set_exit_status(status);
    msg.set_utime_u(utime_u);
    msg.set_stime_u(stime_u);
    send_msg_shmq_and_ack(&msg);

    if i_locked {
        release_global_lock();
    }
}

extern "C" fn on_exit_handler(status: c_int, _arg: *mut c_void) {
    insert_debug_msg("on_exit_handler-begin");
    handle_exit(status);
    insert_debug_msg("on_exit_handler-end");
}

unsafe fn register_on_exit() {
    // on_exit() takes the exit status, which atexit() would not give us.
    let p = libc::dlsym(libc::RTLD_DEFAULT, b"on_exit\0".as_ptr() as *const c_char);
    if !p.is_null() {
        let on_exit: unsafe extern "C" fn(
            extern "C" fn(c_int, *mut c_void),
            *mut c_void,
        ) -> c_int = core::mem::transmute(p);
        on_exit(on_exit_handler, core::ptr::null_mut());
    }
}

// ---------------------------------------------------------------------------
// Connection and queue setup

unsafe fn connect_supervisor() -> Result<c_int, ()> {
    let conn = orig_socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
    if conn < 0 {
        return Err(());
    }
    let mut addr: libc::sockaddr_un = core::mem::zeroed();
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let path = CONN_PATH.get().ok_or(())?.to_bytes();
    if path.len() >= addr.sun_path.len() {
        orig_close(conn);
        return Err(());
    }
    for (i, b) in path.iter().enumerate() {
        addr.sun_path[i] = *b as c_char;
    }
    let ret = orig_connect(
        conn,
        &addr as *const libc::sockaddr_un as *const libc::sockaddr,
        core::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
    );
    if ret != 0 {
        orig_close(conn);
        return Err(());
    }
    Ok(conn)
}

unsafe fn create_shmq(pid: i32) -> Result<(), ()> {
    let mut name = [0u8; names::SHMQ_NAME_MAX];
    let seq = SHMQ_SEQ.fetch_add(1, Ordering::Relaxed);
    let len = names::format_shmq_name(&mut name, pid, seq);
    let cname = CStr::from_bytes_with_nul(&name[..len + 1]).map_err(|_| ())?;
    let writer = shmq::Writer::create(cname).map_err(|_| ())?;
    *SHMQ.0.get() = Some(writer);
    *SHMQ_NAME.0.get() = (name, len);
    Ok(())
}

/// The name of this process's queue, as sent in the handshake.
pub fn shmq_name() -> ([u8; names::SHMQ_NAME_MAX], usize) {
    unsafe { *SHMQ_NAME.0.get() }
}

// ---------------------------------------------------------------------------
// Initialization and the at-fork child path

fn getenv_cstring(name: &str) -> Option<CString> {
    let cname = [name.as_bytes(), b"\0"].concat();
    let p = unsafe { libc::getenv(cname.as_ptr() as *const c_char) };
    if p.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(p) }.to_owned())
    }
}

fn store_system_locations() {
    let mut locations: Vec<Vec<u8>> = Vec::new();
    if let Some(raw) = getenv_cstring(names::FB_SYSTEM_LOCATIONS) {
        for prefix in raw.to_bytes().split(|b| *b == b':') {
            if !prefix.is_empty() {
                locations.push(prefix.to_vec());
            }
        }
    }
    let _ = SYSTEM_LOCATIONS.set(locations);
}

unsafe extern "C" fn shared_libs_cb(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let libs = &mut *(data as *mut Vec<Vec<u8>>);
    let name = (*info).dlpi_name;
    if name.is_null() {
        return 0;
    }
    let bytes = CStr::from_ptr(name).to_bytes();
    if bytes.is_empty()
        || bytes.ends_with(names::INTERCEPTOR_SO.as_bytes())
        || bytes == b"linux-vdso.so.1"
    {
        return 0;
    }
    libs.push(bytes.to_vec());
    0
}

unsafe fn ic_init() -> bool {
    if getenv_cstring(names::FB_INSERT_TRACE_MARKERS).is_some() {
        INSERT_TRACE_MARKERS.store(true, Ordering::Relaxed);
    }
    store_system_locations();

    // Without a supervisor socket in the environment, stand down quietly:
    // the process is not part of an observed build.
    let Some(sock_value) = getenv_cstring(names::FB_SOCKET) else {
        return false;
    };
    let mut conn_path = sock_value.to_bytes().to_vec();
    conn_path.push(b'0');
    let _ = FB_SOCKET_VALUE.set(sock_value);
    let _ = CONN_PATH.set(CString::new(conn_path).expect("socket path with NUL"));
    let _ = FB_SEMAPHORE_VALUE.set(getenv_cstring(names::FB_SEMAPHORE));
    let _ = LD_LIBRARY_PATH_INITIAL.set(getenv_cstring(names::LD_LIBRARY_PATH));

    insert_debug_msg("initialization-begin");

    let pid = libc::getpid();
    IC_PID.store(pid, Ordering::Relaxed);

    if create_shmq(pid).is_err() {
        fb_abort("cannot create the shared memory queue");
    }
    let conn = match connect_supervisor() {
        Ok(fd) => fd,
        Err(()) => fb_abort("cannot connect to the supervisor"),
    };
    FB_SV_CONN.store(conn, Ordering::Relaxed);

    libc::pthread_atfork(None, None, Some(atfork_child_handler));
    register_on_exit();
    reset_rusage();

    // Identify ourselves and wait for the verdict.
    let (argv, envp) = envfix::get_argv_env();

    let mut cwd_buf = [0u8; 4096];
    let cwd_len = if libc::getcwd(cwd_buf.as_mut_ptr() as *mut c_char, cwd_buf.len()).is_null()
    {
        0
    } else {
        libc::strlen(cwd_buf.as_ptr() as *const c_char)
    };

    // A sorted, filtered copy of the environment; our own plumbing
    // variables are not part of the process's fingerprint.
    let mut env_entries: Vec<&[u8]> = Vec::new();
    let mut i = 0;
    loop {
        let entry = *envp.add(i);
        if entry.is_null() {
            break;
        }
        let bytes = CStr::from_ptr(entry).to_bytes();
        if !bytes.starts_with(b"FB_SOCKET=") && !bytes.starts_with(b"FB_SYSTEM_LOCATIONS=") {
            env_entries.push(bytes);
        }
        i += 1;
    }
    env_entries.sort_unstable();

    let mut exe_buf = [0u8; 4096];
    let exe_len = orig_readlink(
        b"/proc/self/exe\0".as_ptr() as *const c_char,
        exe_buf.as_mut_ptr() as *mut c_char,
        exe_buf.len() - 1,
    );

    let mut libs: Vec<Vec<u8>> = Vec::new();
    libc::dl_iterate_phdr(Some(shared_libs_cb), &mut libs as *mut _ as *mut c_void);
    let lib_refs: Vec<&[u8]> = libs.iter().map(|v| &v[..]).collect();

    let (name_buf, name_len) = shmq_name();

    let mut query = wire::scproc_query::Builder::new();
    query.set_pid(pid);
    query.set_ppid(libc::getppid());
    query.set_cwd(&cwd_buf[..cwd_len]);
    query.set_arg(StrArraySource::CArray(CStrArray::new(argv)));
    query.set_env_var(StrArraySource::Slices(&env_entries));
    if exe_len > 0 {
        query.set_executable(&exe_buf[..exe_len as usize]);
    }
    query.set_libs(StrArraySource::Slices(&lib_refs));
    query.set_shmq_name(&name_buf[..name_len]);

    let ack = next_ack_id();
    if frame::send_frame(conn, &query, ack).is_err() {
        fb_abort("cannot send the handshake");
    }

    let mut resp_buf = [0u8; 512];
    let (resp_ack, resp_len) = match frame::recv_frame_into(conn, &mut resp_buf) {
        Ok(r) => r,
        Err(_) => fb_abort("no handshake response"),
    };
    if resp_ack != ack {
        fb_abort("handshake ack mismatch");
    }
    let resp = wire::scproc_resp::View::from_bytes(&resp_buf[..resp_len]);
    DEBUG_FLAGS.store(resp.debug_flags_or(0), Ordering::Relaxed);

    if resp.shortcut() {
        // The supervisor replays this process from its cache; we are done
        // before the application ever ran.
        insert_debug_msg("shortcut by the supervisor, exiting");
        orig__exit(resp.exit_status());
        libc::abort();
    }

    insert_debug_msg("initialization-end");
    true
}

/// Runs first among at-fork child handlers: re-initialize the locks and
/// per-thread state, build a fresh queue and connection, and introduce this
/// process to the supervisor before any other interceptor code can run in
/// the child.
pub unsafe extern "C" fn atfork_child_handler() {
    if INIT_STATE.load(Ordering::Acquire) != INIT_DONE
        || !INTERCEPTING_ENABLED.load(Ordering::Relaxed)
    {
        return;
    }

    // The pre-fork lock holder does not exist in this process.
    IC_GLOBAL_LOCK.reinit();
    IC_SYSTEM_POPEN_LOCK.reinit();
    tls::reset_after_fork();
    fdstate::reset_all_for_fork();

    let pid = unsafe { libc::getpid() };
    IC_PID.store(pid, Ordering::Relaxed);
    insert_debug_msg("launched via fork()");

    unsafe {
        *SHMQ.0.get() = None;
        if create_shmq(pid).is_err() {
            fb_abort("cannot create the child's shared memory queue");
        }
        orig_close(conn_fd());
        match connect_supervisor() {
            Ok(fd) => FB_SV_CONN.store(fd, Ordering::Relaxed),
            Err(()) => fb_abort("cannot reconnect to the supervisor"),
        }
    }

    let (name_buf, name_len) = shmq_name();
    let mut msg = wire::fork_child::Builder::new();
    msg.set_pid(pid);
    msg.set_ppid(unsafe { libc::getppid() });
    msg.set_shmq_name(&name_buf[..name_len]);
    send_msg_socket_and_ack(&msg);
}

/// Take the system/popen serialization lock.
pub fn system_popen_lock() {
    IC_SYSTEM_POPEN_LOCK.lock();
}

pub fn system_popen_unlock() {
    IC_SYSTEM_POPEN_LOCK.unlock();
}
