//! Environment recovery and fixup.
//!
//! The interceptor must re-inject its own variables (`LD_PRELOAD`,
//! `LD_LIBRARY_PATH`, `FB_SOCKET`, `FB_SEMAPHORE`,
//! `FB_INSERT_TRACE_MARKERS`) into the environment of every exec'd child if
//! the application dropped or mangled them, otherwise the child escapes
//! observation. `get_argv_env` recovers the original argv without reading
//! /proc, by walking back from `__environ`.

use std::ffi::CStr;

use libc::c_char;
use quickbuild_shared::env as names;

extern "C" {
    static mut environ: *mut *mut c_char;
}

/// The process's current environment array.
pub unsafe fn environ_ptr() -> *const *const c_char {
    environ as *const *const c_char
}

/// Point the global environment at a rebuilt array, returning the previous
/// one for [`restore_environ`]. Used around calls like system() and popen()
/// that pick up `environ` themselves.
pub unsafe fn swap_environ(new: *const *const c_char) -> *mut *mut c_char {
    let old = environ;
    environ = new as *mut *mut c_char;
    old
}

pub unsafe fn restore_environ(old: *mut *mut c_char) {
    environ = old;
}

/// Recover argv and envp of the process.
///
/// argv is NULL-terminated and directly precedes envp on the initial
/// process stack; right below argv sits argc. Walk backwards until the
/// counted number of arguments matches the word that would be argc.
pub unsafe fn get_argv_env() -> (*const *const c_char, *const *const c_char) {
    let env = environ as *const *const c_char;
    debug_assert!((*env.offset(-1)).is_null());

    let mut argc_guess: usize = 0;
    let mut arg = *env.offset(-2);
    while argc_guess != arg as usize {
        argc_guess += 1;
        arg = *env.offset(-2 - argc_guess as isize);
    }

    let argv = env.offset(-1 - argc_guess as isize);
    (argv, env)
}

/// The values the child environment must end up carrying.
#[derive(Default)]
pub struct FixupSpec<'a> {
    pub fb_socket: Option<&'a [u8]>,
    pub fb_semaphore: Option<&'a [u8]>,
    pub insert_trace_markers: bool,
    /// The initial `LD_LIBRARY_PATH` captured at startup, which must stay
    /// reachable in the child.
    pub ld_library_path: Option<&'a [u8]>,
    /// File name of the preloaded library.
    pub preload_so: &'a [u8],
}

/// Like `getenv()`, but from a caller-supplied NULL-terminated array.
pub unsafe fn getenv_from<'e>(env: *const *const c_char, name: &[u8]) -> Option<&'e [u8]> {
    let mut i = 0;
    loop {
        let entry = *env.add(i);
        if entry.is_null() {
            return None;
        }
        let bytes = CStr::from_ptr(entry).to_bytes();
        if bytes.len() > name.len() && &bytes[..name.len()] == name && bytes[name.len()] == b'='
        {
            return Some(&*core::ptr::slice_from_raw_parts(
                entry.add(name.len() + 1) as *const u8,
                bytes.len() - name.len() - 1,
            ));
        }
        i += 1;
    }
}

/// Whether `value` lists `so` as one of its `LD_PRELOAD` entries, bounded
/// by the start/end of the string or a `:`/` ` separator.
fn preload_mentions(value: &[u8], so: &[u8]) -> bool {
    if so.is_empty() {
        return true;
    }
    let mut start = 0;
    while start + so.len() <= value.len() {
        if let Some(pos) = find(&value[start..], so) {
            let loc = start + pos;
            let end = loc + so.len();
            let begins_ok = loc == 0 || value[loc - 1] == b':' || value[loc - 1] == b' ';
            let ends_ok = end == value.len() || value[end] == b':' || value[end] == b' ';
            if begins_ok && ends_ok {
                return true;
            }
            start = loc + 1;
        } else {
            return false;
        }
    }
    false
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

/// Whether `env` deviates from `spec` in any way that matters.
/// `FB_SYSTEM_LOCATIONS` is not checked: it only affects performance, not
/// correctness, in the child.
pub unsafe fn env_needs_fixup(env: *const *const c_char, spec: &FixupSpec) -> bool {
    let markers = getenv_from(env, names::FB_INSERT_TRACE_MARKERS.as_bytes());
    match (markers, spec.insert_trace_markers) {
        (None, false) => {}
        (Some(v), true) if v == b"1" => {}
        _ => return true,
    }

    if let Some(want) = spec.fb_socket {
        if getenv_from(env, names::FB_SOCKET.as_bytes()) != Some(want) {
            return true;
        }
    }
    if let Some(want) = spec.fb_semaphore {
        if getenv_from(env, names::FB_SEMAPHORE.as_bytes()) != Some(want) {
            return true;
        }
    }
    if let Some(want) = spec.ld_library_path {
        match getenv_from(env, names::LD_LIBRARY_PATH.as_bytes()) {
            Some(v) if contains(v, want) => {}
            _ => return true,
        }
    }
    match getenv_from(env, names::LD_PRELOAD.as_bytes()) {
        Some(v) if preload_mentions(v, spec.preload_so) => {}
        _ => return true,
    }
    false
}

/// A rebuilt environment. Unchanged entries are referenced in place;
/// rewritten ones are owned here. Valid as long as both this struct and the
/// original array live, which covers the send-message-then-exec window.
pub struct FixedEnv {
    // Owns the rewritten entries the pointer array references.
    _storage: Vec<Box<[u8]>>,
    ptrs: Vec<*const c_char>,
}

impl FixedEnv {
    pub fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }
}

fn own_entry(storage: &mut Vec<Box<[u8]>>, ptrs: &mut Vec<*const c_char>, entry: Vec<u8>) {
    let mut entry = entry;
    entry.push(0);
    let boxed = entry.into_boxed_slice();
    ptrs.push(boxed.as_ptr() as *const c_char);
    storage.push(boxed);
}

/// Rebuild `env` so it satisfies `spec`. Entries other than the five
/// special variables are carried over by pointer.
pub unsafe fn env_fixup(env: *const *const c_char, spec: &FixupSpec) -> FixedEnv {
    let mut storage: Vec<Box<[u8]>> = Vec::new();
    let mut ptrs: Vec<*const c_char> = Vec::new();

    let special: [&[u8]; 5] = [
        names::FB_SOCKET.as_bytes(),
        names::FB_SEMAPHORE.as_bytes(),
        names::FB_INSERT_TRACE_MARKERS.as_bytes(),
        names::LD_PRELOAD.as_bytes(),
        names::LD_LIBRARY_PATH.as_bytes(),
    ];

    let mut i = 0;
    loop {
        let entry = *env.add(i);
        if entry.is_null() {
            break;
        }
        let bytes = CStr::from_ptr(entry).to_bytes();
        let is_special = special.iter().any(|name| {
            bytes.len() > name.len() && &bytes[..name.len()] == *name && bytes[name.len()] == b'='
        });
        if !is_special {
            ptrs.push(entry);
        }
        i += 1;
    }

    if let Some(v) = spec.fb_socket {
        let mut e = Vec::with_capacity(names::FB_SOCKET.len() + 1 + v.len());
        e.extend_from_slice(names::FB_SOCKET.as_bytes());
        e.push(b'=');
        e.extend_from_slice(v);
        own_entry(&mut storage, &mut ptrs, e);
    }
    if let Some(v) = spec.fb_semaphore {
        let mut e = Vec::new();
        e.extend_from_slice(names::FB_SEMAPHORE.as_bytes());
        e.push(b'=');
        e.extend_from_slice(v);
        own_entry(&mut storage, &mut ptrs, e);
    }
    if spec.insert_trace_markers {
        own_entry(
            &mut storage,
            &mut ptrs,
            format!("{}=1", names::FB_INSERT_TRACE_MARKERS).into_bytes(),
        );
    }

    // LD_PRELOAD: keep the application's list, prepending ourselves when
    // missing.
    let orig_preload = getenv_from(env, names::LD_PRELOAD.as_bytes());
    let mut e = Vec::new();
    e.extend_from_slice(names::LD_PRELOAD.as_bytes());
    e.push(b'=');
    match orig_preload {
        Some(v) if preload_mentions(v, spec.preload_so) => e.extend_from_slice(v),
        Some(v) if !v.is_empty() => {
            e.extend_from_slice(spec.preload_so);
            e.push(b':');
            e.extend_from_slice(v);
        }
        _ => e.extend_from_slice(spec.preload_so),
    }
    own_entry(&mut storage, &mut ptrs, e);

    // LD_LIBRARY_PATH: keep the application's value, appending the startup
    // value when it went missing.
    let orig_llp = getenv_from(env, names::LD_LIBRARY_PATH.as_bytes());
    match (orig_llp, spec.ld_library_path) {
        (None, None) => {}
        (Some(v), None) => {
            let mut e = Vec::new();
            e.extend_from_slice(names::LD_LIBRARY_PATH.as_bytes());
            e.push(b'=');
            e.extend_from_slice(v);
            own_entry(&mut storage, &mut ptrs, e);
        }
        (orig, Some(want)) => {
            let mut e = Vec::new();
            e.extend_from_slice(names::LD_LIBRARY_PATH.as_bytes());
            e.push(b'=');
            match orig {
                Some(v) if contains(v, want) => e.extend_from_slice(v),
                Some(v) if !v.is_empty() => {
                    e.extend_from_slice(v);
                    e.push(b':');
                    e.extend_from_slice(want);
                }
                _ => e.extend_from_slice(want),
            }
            own_entry(&mut storage, &mut ptrs, e);
        }
    }

    ptrs.push(core::ptr::null());
    FixedEnv {
        _storage: storage,
        ptrs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    struct FakeEnv {
        _owned: Vec<CString>,
        ptrs: Vec<*const c_char>,
    }

    impl FakeEnv {
        fn new(entries: &[&str]) -> FakeEnv {
            let owned: Vec<CString> =
                entries.iter().map(|e| CString::new(*e).unwrap()).collect();
            let mut ptrs: Vec<*const c_char> = owned.iter().map(|c| c.as_ptr()).collect();
            ptrs.push(core::ptr::null());
            FakeEnv {
                _owned: owned,
                ptrs,
            }
        }

        fn as_ptr(&self) -> *const *const c_char {
            self.ptrs.as_ptr()
        }
    }

    fn spec<'a>() -> FixupSpec<'a> {
        FixupSpec {
            fb_socket: Some(b"/tmp/qb/sock"),
            fb_semaphore: None,
            insert_trace_markers: false,
            ld_library_path: None,
            preload_so: b"libquickbuild_interceptor.so",
        }
    }

    fn collect(fixed: &FixedEnv) -> Vec<String> {
        let mut out = Vec::new();
        let mut p = fixed.as_ptr();
        unsafe {
            while !(*p).is_null() {
                out.push(
                    CStr::from_ptr(*p).to_string_lossy().into_owned(),
                );
                p = p.add(1);
            }
        }
        out
    }

    #[test]
    fn untouched_environment_needs_no_fixup() {
        let env = FakeEnv::new(&[
            "PATH=/usr/bin",
            "FB_SOCKET=/tmp/qb/sock",
            "LD_PRELOAD=libquickbuild_interceptor.so",
        ]);
        assert!(!unsafe { env_needs_fixup(env.as_ptr(), &spec()) });
    }

    #[test]
    fn dropped_preload_is_detected_and_restored() {
        let env = FakeEnv::new(&["PATH=/usr/bin", "FB_SOCKET=/tmp/qb/sock"]);
        let s = spec();
        assert!(unsafe { env_needs_fixup(env.as_ptr(), &s) });

        let fixed = unsafe { env_fixup(env.as_ptr(), &s) };
        let entries = collect(&fixed);
        assert!(entries.contains(&"PATH=/usr/bin".to_string()));
        assert!(entries.contains(&"LD_PRELOAD=libquickbuild_interceptor.so".to_string()));
        assert!(entries.contains(&"FB_SOCKET=/tmp/qb/sock".to_string()));
    }

    #[test]
    fn foreign_preload_entries_are_kept() {
        let env = FakeEnv::new(&[
            "FB_SOCKET=/tmp/qb/sock",
            "LD_PRELOAD=libasan.so",
        ]);
        let s = spec();
        assert!(unsafe { env_needs_fixup(env.as_ptr(), &s) });
        let fixed = unsafe { env_fixup(env.as_ptr(), &s) };
        let entries = collect(&fixed);
        assert!(entries
            .contains(&"LD_PRELOAD=libquickbuild_interceptor.so:libasan.so".to_string()));
    }

    #[test]
    fn preload_mention_respects_separators() {
        let so = b"libquickbuild_interceptor.so";
        assert!(preload_mentions(b"libquickbuild_interceptor.so", so));
        assert!(preload_mentions(b"a.so:libquickbuild_interceptor.so", so));
        assert!(preload_mentions(b"libquickbuild_interceptor.so b.so", so));
        assert!(!preload_mentions(b"xlibquickbuild_interceptor.so", so));
        assert!(!preload_mentions(b"libquickbuild_interceptor.so.1", so));
    }

    #[test]
    fn changed_socket_value_is_rewritten() {
        let env = FakeEnv::new(&[
            "FB_SOCKET=/somewhere/else",
            "LD_PRELOAD=libquickbuild_interceptor.so",
        ]);
        let s = spec();
        assert!(unsafe { env_needs_fixup(env.as_ptr(), &s) });
        let fixed = unsafe { env_fixup(env.as_ptr(), &s) };
        let entries = collect(&fixed);
        assert!(entries.contains(&"FB_SOCKET=/tmp/qb/sock".to_string()));
        assert!(!entries.iter().any(|e| e.contains("/somewhere/else")));
    }

    #[test]
    fn library_path_keeps_app_value_and_appends_initial() {
        let env = FakeEnv::new(&[
            "FB_SOCKET=/tmp/qb/sock",
            "LD_PRELOAD=libquickbuild_interceptor.so",
            "LD_LIBRARY_PATH=/opt/app/lib",
        ]);
        let mut s = spec();
        s.ld_library_path = Some(b"/opt/toolchain/lib");
        assert!(unsafe { env_needs_fixup(env.as_ptr(), &s) });
        let fixed = unsafe { env_fixup(env.as_ptr(), &s) };
        let entries = collect(&fixed);
        assert!(entries
            .contains(&"LD_LIBRARY_PATH=/opt/app/lib:/opt/toolchain/lib".to_string()));
    }

    #[test]
    fn trace_marker_flag_roundtrips() {
        let env = FakeEnv::new(&[
            "FB_SOCKET=/tmp/qb/sock",
            "LD_PRELOAD=libquickbuild_interceptor.so",
        ]);
        let mut s = spec();
        s.insert_trace_markers = true;
        assert!(unsafe { env_needs_fixup(env.as_ptr(), &s) });
        let fixed = unsafe { env_fixup(env.as_ptr(), &s) };
        assert!(collect(&fixed).contains(&"FB_INSERT_TRACE_MARKERS=1".to_string()));
    }
}
