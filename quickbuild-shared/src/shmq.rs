//! Shared memory based message queue.
//!
//! One-way queue between exactly one writer and exactly one reader, living
//! in separate processes. The writer side is initialized first, creates the
//! POSIX shared memory object and keeps its fd to grow the backing file; the
//! reader maps the object and immediately unlinks it. There is no upper
//! limit on the queue's size, the mapping doubles on demand via
//! `mremap(MREMAP_MAYMOVE)`.
//!
//! Layout: a global header, then alternating message header (`len`,
//! `ack_id`), payload padded to 8 bytes, and a next-message pointer holding
//! the offset of the following message or -1 at the queue's end. Excluding
//! the global header there is always exactly one more pointer than message;
//! the pointers at both ends of the queue are valid. The global header's
//! `tail_location` is the only field the reader ever writes: it names the
//! offset of the pointer to the reader's next message, telling the writer
//! which byte ranges may be reused.
//!
//! The writer allocates from at most three contiguous chunks. The possible
//! layouts and their transitions:
//!
//! ```text
//! state 1:  GH | .. chunk[0] ..                 one chunk
//! state 2:  GH | chunk[1] .. chunk[0] ..        new data wrapped in front
//! state 3:  GH | chunk[1] .. chunk[0] chunk[2]  middle chunk is the oldest
//! state 4:  GH | .. chunk[0] .. chunk[1] ..     oldest consumed, two left
//! ```
//!
//! 1→2 when a message is placed right after the global header in front of
//! the existing data; 2→3 when the gap between the two chunks is too small
//! and a chunk is started after the old data; 3→4→1 and 2→1 as the reader
//! consumes whole chunks. `chunk[0]` is always the stream's tail.
//!
//! Writer operations are used from signal handlers, so the whole writer
//! path relies only on async-signal-safe calls; `mremap` is assumed to be
//! one on the supported systems. Publishing a message is a release store of
//! the previous next-pointer; the reader pairs it with an acquire load.

use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::fbb::roundup8;

/// Initial size of the shared mapping. Grown by doubling.
pub const SHMQ_INITIAL_SIZE: usize = 4096;

/// Global header: `tail_location` plus padding, so writer-updated bytes sit
/// on a separate cache line half.
const GLOBAL_HEADER_SIZE: usize = 8;
/// Message header: `i32 len`, `u32 ack_id`.
const MESSAGE_HEADER_SIZE: usize = 8;
/// Next-message pointer: `i32`, padded to 8.
const NEXT_POINTER_SIZE: usize = 8;

/// Overall space occupied by one message: header, padded body, trailing
/// next-message pointer.
fn message_overall_size(len: i32) -> i32 {
    (MESSAGE_HEADER_SIZE + roundup8(len as usize) + NEXT_POINTER_SIZE) as i32
}

#[derive(Clone, Copy, Default)]
struct Chunk {
    tail: i32,
    head: i32,
}

fn mmap_shared(fd: RawFd, size: usize) -> io::Result<*mut u8> {
    let buf = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if buf == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(buf as *mut u8)
}

fn mremap_grow(buf: *mut u8, old_size: usize, new_size: usize) -> io::Result<*mut u8> {
    let new_buf = unsafe {
        libc::mremap(
            buf as *mut libc::c_void,
            old_size,
            new_size,
            libc::MREMAP_MAYMOVE,
        )
    };
    if new_buf == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(new_buf as *mut u8)
}

unsafe fn atomic_i32(buf: *mut u8, off: i32) -> &'static AtomicI32 {
    &*(buf.add(off as usize) as *const AtomicI32)
}

/// The producing end of a queue.
pub struct Writer {
    size: usize,
    buf: *mut u8,
    fd: RawFd,
    /// The layout's state, 1..=4.
    state: usize,
    next_state: usize,
    /// The intervals occupied by unconsumed data plus the trailing pointer.
    /// Exactly `nr_chunks()` entries are live, `chunks[0]` is the stream's
    /// tail.
    chunks: [Chunk; 3],
    next_message_location: i32,
    next_message_len: i32,
    next_message_ack: u32,
}

// The raw mapping is only touched through &mut self (or by the reader
// process, which the protocol accounts for).
unsafe impl Send for Writer {}

impl Writer {
    /// Create the shared memory object and initialize an empty queue.
    /// `name` must begin with `/` and not exist yet.
    pub fn create(name: &CStr) -> io::Result<Writer> {
        assert_eq!(name.to_bytes().first(), Some(&b'/'));
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o666,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ftruncate(fd, SHMQ_INITIAL_SIZE as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let buf = match mmap_shared(fd, SHMQ_INITIAL_SIZE) {
            Ok(buf) => buf,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        let writer = Writer {
            size: SHMQ_INITIAL_SIZE,
            buf,
            fd,
            state: 1,
            next_state: 0,
            chunks: [
                Chunk {
                    tail: GLOBAL_HEADER_SIZE as i32,
                    head: (GLOBAL_HEADER_SIZE + NEXT_POINTER_SIZE) as i32,
                },
                Chunk::default(),
                Chunk::default(),
            ],
            next_message_location: -1,
            next_message_len: -1,
            next_message_ack: 0,
        };
        unsafe {
            // The queue starts empty: the pointer right after the global
            // header is the tail, and holds -1.
            atomic_i32(buf, GLOBAL_HEADER_SIZE as i32).store(-1, Ordering::Relaxed);
            atomic_i32(buf, 0).store(GLOBAL_HEADER_SIZE as i32, Ordering::Release);
        }
        Ok(writer)
    }

    fn nr_chunks(&self) -> usize {
        const NR: [usize; 5] = [0, 1, 2, 3, 2];
        NR[self.state]
    }

    fn tail_location(&self) -> i32 {
        unsafe { atomic_i32(self.buf, 0).load(Ordering::Acquire) }
    }

    /// Free up the area already consumed by the reader.
    fn advance_tail(&mut self) {
        let tail = self.tail_location();

        while tail < self.chunks[0].tail || tail >= self.chunks[0].head {
            // The stream's tail left chunk[0] entirely: drop it and shift
            // the rest down, following transitions 2->1 and 3->4->1.
            self.chunks[0] = self.chunks[1];
            self.chunks[1] = self.chunks[2];
            const OLD_TO_NEW_STATE: [usize; 5] = [0, 0, 1, 4, 1];
            self.state = OLD_TO_NEW_STATE[self.state];
            assert!(self.state != 0);
        }
        // Maybe advance the tail within the tail chunk.
        self.chunks[0].tail = tail;
        assert!(self.chunks[0].head - self.chunks[0].tail >= NEXT_POINTER_SIZE as i32);
    }

    /// Find room for a message of the given size. Ignores any message
    /// currently under construction, so it serves both placing a new
    /// message and relocating a growing one.
    fn find_place_for_message(&mut self, len: i32) -> io::Result<()> {
        let overall_size = message_overall_size(len);

        if self.state == 1 && overall_size <= self.chunks[0].tail - GLOBAL_HEADER_SIZE as i32 {
            // State 1 -> 2 transition.
            self.next_message_location = GLOBAL_HEADER_SIZE as i32;
            self.next_state = 2;
        } else if self.state == 2
            && overall_size > self.chunks[0].tail - self.chunks[1].head
        {
            // State 2 -> 3 transition.
            self.next_message_location = self.chunks[0].head;
            self.next_state = 3;
        } else {
            // No state change, append to the head chunk.
            self.next_message_location = self.chunks[self.nr_chunks() - 1].head;
            self.next_state = self.state;
        }
        self.next_message_len = len;

        // The message's place is known; make sure the shm is big enough.
        let ensure_size = self.next_message_location as usize + overall_size as usize;
        if self.size < ensure_size {
            let old_size = self.size;
            let mut new_size = self.size;
            while new_size < ensure_size {
                new_size *= 2;
            }
            if unsafe { libc::ftruncate(self.fd, new_size as libc::off_t) } != 0 {
                return Err(io::Error::last_os_error());
            }
            self.buf = mremap_grow(self.buf, old_size, new_size)?;
            self.size = new_size;
        }
        Ok(())
    }

    /// Reserve room for a message of `len` payload bytes, to be constructed
    /// in place in the returned span. Must alternate with
    /// [`add_message`](Self::add_message).
    pub fn new_message(&mut self, ack_id: u32, len: usize) -> io::Result<&mut [u8]> {
        assert!(self.next_state == 0, "new_message/add_message must alternate");

        self.advance_tail();
        self.find_place_for_message(len as i32)?;
        self.next_message_ack = ack_id;

        let body = self.next_message_location as usize + MESSAGE_HEADER_SIZE;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.buf.add(body), len) })
    }

    /// Grow or shrink the message currently under construction, relocating
    /// it if it no longer fits in place.
    pub fn resize_message(&mut self, new_len: usize) -> io::Result<&mut [u8]> {
        assert!(self.next_state != 0, "no message under construction");

        let new_len = new_len as i32;
        if new_len > self.next_message_len {
            // See where the grown message would be placed now, then move it
            // there, header included.
            let old_location = self.next_message_location;
            let old_len = self.next_message_len;

            self.advance_tail();
            self.find_place_for_message(new_len)?;

            unsafe {
                libc::memmove(
                    self.buf.add(self.next_message_location as usize) as *mut libc::c_void,
                    self.buf.add(old_location as usize) as *const libc::c_void,
                    roundup8(MESSAGE_HEADER_SIZE + old_len as usize),
                );
            }
        } else {
            self.next_message_len = new_len;
        }

        let body = self.next_message_location as usize + MESSAGE_HEADER_SIZE;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.buf.add(body), new_len as usize) })
    }

    /// Add the constructed message to the queue, publishing it to the
    /// reader.
    pub fn add_message(&mut self) {
        assert!(self.next_state != 0, "new_message/add_message must alternate");

        let loc = self.next_message_location;
        let len = self.next_message_len;

        unsafe {
            // Message header: len, ack_id.
            atomic_i32(self.buf, loc).store(len, Ordering::Relaxed);
            atomic_i32(self.buf, loc + 4).store(self.next_message_ack as i32, Ordering::Relaxed);
            // The new queue end.
            let end_ptr = loc + (MESSAGE_HEADER_SIZE + roundup8(len as usize)) as i32;
            atomic_i32(self.buf, end_ptr).store(-1, Ordering::Relaxed);
            // Link it up from the previous message; this release store is
            // what makes the message visible to the reader.
            let prev_ptr = self.chunks[self.nr_chunks() - 1].head - NEXT_POINTER_SIZE as i32;
            atomic_i32(self.buf, prev_ptr).store(loc, Ordering::Release);
        }

        // Adjust the state and the chunks.
        if self.next_state != self.state {
            // 1->2 starting chunk[1], or 2->3 starting chunk[2].
            self.chunks[self.state] = Chunk {
                tail: loc,
                head: loc + message_overall_size(len),
            };
        } else {
            let last = self.nr_chunks() - 1;
            self.chunks[last].head += message_overall_size(len);
        }
        self.state = self.next_state;

        self.next_state = 0;
        self.next_message_location = -1;
        self.next_message_len = -1;
    }

    /// Whether every message added so far has been consumed by the reader.
    pub fn queue_is_empty(&mut self) -> bool {
        self.advance_tail();
        self.state == 1
            && self.chunks[0].head - self.chunks[0].tail == NEXT_POINTER_SIZE as i32
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.buf as *mut libc::c_void, self.size);
            // The writer keeps the fd open to ftruncate() the backing file;
            // release it now.
            libc::close(self.fd);
        }
    }
}

/// The consuming end of a queue.
pub struct Reader {
    size: usize,
    buf: *mut u8,
    tail_message_peeked: bool,
}

unsafe impl Send for Reader {}

impl Reader {
    /// Map the object the writer created, then unlink it so the name is
    /// gone as soon as both ends hold their mappings.
    pub fn attach(name: &CStr) -> io::Result<Reader> {
        assert_eq!(name.to_bytes().first(), Some(&b'/'));
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let buf = mmap_shared(fd, SHMQ_INITIAL_SIZE);
        // Unlike the writer, the reader does not need the fd any further.
        unsafe { libc::close(fd) };
        let buf = buf?;
        unsafe { libc::shm_unlink(name.as_ptr()) };
        Ok(Reader {
            size: SHMQ_INITIAL_SIZE,
            buf,
            tail_message_peeked: false,
        })
    }

    fn ensure_mapped(&mut self, needed: usize) -> io::Result<()> {
        if self.size < needed {
            let old_size = self.size;
            let mut new_size = self.size;
            while new_size < needed {
                new_size *= 2;
            }
            self.buf = mremap_grow(self.buf, old_size, new_size)?;
            self.size = new_size;
        }
        Ok(())
    }

    /// Access the message at the queue's tail without removing it. Returns
    /// `None` if the queue is empty. The span stays valid until
    /// [`discard_tail`](Self::discard_tail).
    pub fn peek_tail(&mut self) -> io::Result<Option<(u32, &[u8])>> {
        let tail_location = unsafe { atomic_i32(self.buf, 0).load(Ordering::Relaxed) };
        assert!(tail_location % 8 == 0);

        let header_location =
            unsafe { atomic_i32(self.buf, tail_location).load(Ordering::Acquire) };
        if header_location < 0 {
            return Ok(None);
        }
        assert!(header_location >= GLOBAL_HEADER_SIZE as i32);
        assert!(header_location % 8 == 0);
        self.tail_message_peeked = true;

        // Maybe the message header is not mapped on this side yet.
        self.ensure_mapped(header_location as usize + MESSAGE_HEADER_SIZE)?;

        let len = unsafe { atomic_i32(self.buf, header_location).load(Ordering::Relaxed) };
        let ack = unsafe {
            atomic_i32(self.buf, header_location + 4).load(Ordering::Relaxed) as u32
        };

        // Maybe the body or the following pointer is not mapped yet.
        self.ensure_mapped(header_location as usize + message_overall_size(len) as usize)?;

        let body = unsafe {
            std::slice::from_raw_parts(
                self.buf
                    .add(header_location as usize + MESSAGE_HEADER_SIZE),
                len as usize,
            )
        };
        Ok(Some((ack, body)))
    }

    /// Discard the message at the queue's tail, returning its storage to
    /// the writer. Must be preceded by a successful peek of this message,
    /// which guarantees the area is mapped.
    pub fn discard_tail(&mut self) {
        assert!(self.tail_message_peeked);
        self.tail_message_peeked = false;

        let tail_location = unsafe { atomic_i32(self.buf, 0).load(Ordering::Relaxed) };
        assert!(tail_location % 8 == 0);

        let message_location =
            unsafe { atomic_i32(self.buf, tail_location).load(Ordering::Relaxed) };
        assert!(message_location >= GLOBAL_HEADER_SIZE as i32);
        assert!(message_location % 8 == 0);

        let len = unsafe { atomic_i32(self.buf, message_location).load(Ordering::Relaxed) };

        // Point the global header at this message's trailing pointer. The
        // release pairs with the writer's acquire of the tail, ordering our
        // reads of the body before the writer's reuse of the area.
        let new_tail =
            message_location + (MESSAGE_HEADER_SIZE + roundup8(len as usize)) as i32;
        unsafe { atomic_i32(self.buf, 0).store(new_tail, Ordering::Release) };
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.buf as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::sync::atomic::AtomicU32;

    fn unique_name() -> CString {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        CString::new(format!("/qb-shmq-test-{}-{}", std::process::id(), seq)).unwrap()
    }

    fn pair() -> (Writer, Reader) {
        let name = unique_name();
        let writer = Writer::create(&name).unwrap();
        let reader = Reader::attach(&name).unwrap();
        (writer, reader)
    }

    fn push(writer: &mut Writer, ack: u32, payload: &[u8]) {
        let span = writer.new_message(ack, payload.len()).unwrap();
        span.copy_from_slice(payload);
        writer.add_message();
    }

    fn pop(reader: &mut Reader) -> Option<(u32, Vec<u8>)> {
        let got = reader
            .peek_tail()
            .unwrap()
            .map(|(ack, body)| (ack, body.to_vec()));
        if got.is_some() {
            reader.discard_tail();
        }
        got
    }

    #[test]
    fn empty_queue_peeks_none() {
        let (_writer, mut reader) = pair();
        assert!(reader.peek_tail().unwrap().is_none());
    }

    #[test]
    fn delivers_messages_in_order_and_grows_past_initial_size() {
        let (mut writer, mut reader) = pair();

        let small = vec![0x11u8; 7];
        let big: Vec<u8> = (0..4097u32).map(|i| (i % 251) as u8).collect();
        let tiny = vec![0x33u8; 3];

        push(&mut writer, 0, &small);
        push(&mut writer, 0, &big);
        push(&mut writer, 0, &tiny);

        assert_eq!(pop(&mut reader).unwrap().1, small);
        assert_eq!(pop(&mut reader).unwrap().1, big);
        assert_eq!(pop(&mut reader).unwrap().1, tiny);
        assert!(pop(&mut reader).is_none());
    }

    #[test]
    fn ack_ids_travel_with_the_message() {
        let (mut writer, mut reader) = pair();
        push(&mut writer, 41, b"x");
        push(&mut writer, 42, b"");
        assert_eq!(pop(&mut reader).unwrap().0, 41);
        let (ack, body) = pop(&mut reader).unwrap();
        assert_eq!(ack, 42);
        assert!(body.is_empty());
    }

    #[test]
    fn wraparound_reuses_consumed_space() {
        let (mut writer, mut reader) = pair();

        // Fill most of the initial mapping, consume, refill several times.
        // Payload sized so a handful of messages exceed 4096 bytes and the
        // writer has to wrap in front of the live data (states 2/3/4).
        let payload = vec![0xabu8; 900];
        let mut expected = Vec::new();
        for round in 0..20u32 {
            push(&mut writer, round, &payload);
            expected.push(round);
            if round % 3 == 2 {
                for want in expected.drain(..) {
                    let (ack, body) = pop(&mut reader).unwrap();
                    assert_eq!(ack, want);
                    assert_eq!(body, payload);
                }
            }
        }
        for want in expected.drain(..) {
            let (ack, body) = pop(&mut reader).unwrap();
            assert_eq!(ack, want);
            assert_eq!(body, payload);
        }
        assert!(pop(&mut reader).is_none());
        assert!(writer.queue_is_empty());
    }

    #[test]
    fn interleaved_producer_consumer_preserves_content() {
        let (mut writer, mut reader) = pair();
        let mut next_write = 0u32;
        let mut next_read = 0u32;

        // A scripted interleaving that drives the writer through all four
        // allocator states: bursts of writes with partial reads in between.
        for (writes, reads) in [(5, 2), (4, 4), (6, 1), (2, 8), (7, 7)] {
            for _ in 0..writes {
                let payload = vec![(next_write % 256) as u8; 64 + (next_write as usize % 300)];
                push(&mut writer, next_write, &payload);
                next_write += 1;
            }
            for _ in 0..reads {
                if next_read == next_write {
                    break;
                }
                let (ack, body) = pop(&mut reader).unwrap();
                assert_eq!(ack, next_read);
                assert_eq!(body.len(), 64 + (next_read as usize % 300));
                assert!(body.iter().all(|&b| b == (next_read % 256) as u8));
                next_read += 1;
            }
        }
        while next_read < next_write {
            let (ack, _) = pop(&mut reader).unwrap();
            assert_eq!(ack, next_read);
            next_read += 1;
        }
        assert!(writer.queue_is_empty());
    }

    #[test]
    fn resize_grows_a_message_under_construction() {
        let (mut writer, mut reader) = pair();

        let span = writer.new_message(0, 16).unwrap();
        span[..16].copy_from_slice(b"0123456789abcdef");
        let span = writer.resize_message(6000).unwrap();
        assert_eq!(&span[..16], b"0123456789abcdef");
        span[16..].fill(0x7e);
        writer.add_message();

        let (_, body) = pop(&mut reader).unwrap();
        assert_eq!(body.len(), 6000);
        assert_eq!(&body[..16], b"0123456789abcdef");
        assert!(body[16..].iter().all(|&b| b == 0x7e));
    }

    #[test]
    fn resize_can_shrink_in_place() {
        let (mut writer, mut reader) = pair();
        let span = writer.new_message(0, 100).unwrap();
        span.fill(0x55);
        let span = writer.resize_message(10).unwrap();
        assert_eq!(span.len(), 10);
        writer.add_message();
        let (_, body) = pop(&mut reader).unwrap();
        assert_eq!(body, vec![0x55u8; 10]);
    }

    #[test]
    fn queue_is_empty_tracks_the_reader() {
        let (mut writer, mut reader) = pair();
        assert!(writer.queue_is_empty());
        push(&mut writer, 0, b"ping");
        assert!(!writer.queue_is_empty());
        pop(&mut reader).unwrap();
        assert!(writer.queue_is_empty());
    }
}
