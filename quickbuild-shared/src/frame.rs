//! Framing used on the control socket (and inside the shmq message
//! headers): `u32 payload_length || u32 ack_id || payload`, all host-endian.
//! A zero-length payload is a bare ack; sending and receiving that form is
//! async-signal-safe (fixed 8-byte buffer, no allocation).

use std::io;
use std::os::unix::io::RawFd;

use crate::fbb::{put_u32, FbbBuilder};

/// Size of the frame header: payload length plus ack id.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Frames up to this payload size are serialized into a stack buffer when
/// sending; larger ones take a heap buffer.
pub const INLINE_FRAME_MAX: usize = 4096;

/// Write the whole buffer, retrying on EINTR.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::Error::from_raw_os_error(libc::EPIPE));
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Fill the whole buffer, retrying on EINTR. EOF before the buffer is full
/// is an error; the peer never truncates a frame.
pub fn read_exact(fd: RawFd, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed mid-frame",
            ));
        }
        let consumed = n as usize;
        buf = &mut buf[consumed..];
    }
    Ok(())
}

/// Send a bare ack frame (header only). Async-signal-safe.
pub fn send_empty_frame(fd: RawFd, ack_id: u32) -> io::Result<()> {
    let mut hdr = [0u8; FRAME_HEADER_SIZE];
    put_u32(&mut hdr, 4, ack_id);
    write_all(fd, &hdr)
}

/// Serialize `msg` and send it as one frame. Uses a stack buffer for small
/// messages; spills to the heap for large ones (argv/env-carrying messages),
/// which is fine because those paths never run under a signal handler.
pub fn send_frame(fd: RawFd, msg: &dyn FbbBuilder, ack_id: u32) -> io::Result<()> {
    let len = msg.measure();
    if len <= INLINE_FRAME_MAX {
        let mut buf = [0u8; FRAME_HEADER_SIZE + INLINE_FRAME_MAX];
        put_u32(&mut buf, 0, len as u32);
        put_u32(&mut buf, 4, ack_id);
        msg.serialize_into(&mut buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len]);
        write_all(fd, &buf[..FRAME_HEADER_SIZE + len])
    } else {
        let mut buf = vec![0u8; FRAME_HEADER_SIZE + len];
        put_u32(&mut buf, 0, len as u32);
        put_u32(&mut buf, 4, ack_id);
        msg.serialize_into(&mut buf[FRAME_HEADER_SIZE..]);
        write_all(fd, &buf)
    }
}

/// Read one frame header. Returns `(payload_length, ack_id)`.
pub fn recv_frame_header(fd: RawFd) -> io::Result<(u32, u32)> {
    let mut hdr = [0u8; FRAME_HEADER_SIZE];
    read_exact(fd, &mut hdr)?;
    let len = u32::from_ne_bytes(hdr[0..4].try_into().unwrap());
    let ack = u32::from_ne_bytes(hdr[4..8].try_into().unwrap());
    Ok((len, ack))
}

/// Read one frame into a caller-provided buffer, without allocating.
/// Returns `(ack_id, payload_length)`; the payload occupies the front of
/// `buf`. Errors if the payload does not fit.
pub fn recv_frame_into(fd: RawFd, buf: &mut [u8]) -> io::Result<(u32, usize)> {
    let (len, ack) = recv_frame_header(fd)?;
    let len = len as usize;
    if len > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame larger than the receive buffer",
        ));
    }
    read_exact(fd, &mut buf[..len])?;
    Ok((ack, len))
}

/// A received frame with an owned, 8-aligned payload.
pub struct Frame {
    pub ack_id: u32,
    payload: Vec<u64>,
    len: usize,
}

impl Frame {
    pub fn payload(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.payload.as_ptr() as *const u8, self.len) }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Read one frame, allocating an aligned payload buffer. Supervisor-side
/// convenience; the interceptor uses [`recv_frame_into`].
pub fn recv_frame(fd: RawFd) -> io::Result<Frame> {
    let (len, ack) = recv_frame_header(fd)?;
    let len = len as usize;
    let mut payload = vec![0u64; len.div_ceil(8)];
    if len > 0 {
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(payload.as_mut_ptr() as *mut u8, len)
        };
        read_exact(fd, bytes)?;
    }
    Ok(Frame {
        ack_id: ack,
        payload,
        len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn frames_roundtrip_over_a_socketpair() {
        let (a, b) = UnixStream::pair().unwrap();

        let mut msg = wire::close::Builder::new();
        msg.set_fd(9);
        send_frame(a.as_raw_fd(), &msg, 77).unwrap();

        let frame = recv_frame(b.as_raw_fd()).unwrap();
        assert_eq!(frame.ack_id, 77);
        let v = wire::close::View::from_bytes(frame.payload());
        assert_eq!(v.fd(), 9);
    }

    #[test]
    fn empty_frame_is_a_bare_ack() {
        let (a, b) = UnixStream::pair().unwrap();
        send_empty_frame(a.as_raw_fd(), 123).unwrap();
        let frame = recv_frame(b.as_raw_fd()).unwrap();
        assert_eq!(frame.ack_id, 123);
        assert!(frame.is_empty());
    }

    #[test]
    fn recv_frame_into_rejects_oversized_payloads() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut msg = wire::fb_debug::Builder::new();
        msg.set_msg("a fairly long debug message that will not fit");
        send_frame(a.as_raw_fd(), &msg, 0).unwrap();

        let mut buf = [0u8; 8];
        assert!(recv_frame_into(b.as_raw_fd(), &mut buf).is_err());
    }
}
