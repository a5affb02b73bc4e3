//! Restart hand-off wire protocol: each open read/write-side descriptor is
//! handed to the successor process as an `SCM_RIGHTS` fd plus a small
//! header carrying its symbol, kind, and unconsumed read residue. Grounded
//! on `fdxfer.c`.
//!
//! Socket naming needs no negotiation: the pre-restart process connects
//! using a path derived from its own pid; the restarted child binds the
//! same path derived from `getppid()`, which is exactly that pid. Neither
//! side transmits the name.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::PathBuf;

use nix::cmsg_space;
use nix::sys::socket::{
    accept, bind, connect, listen, recvmsg, sendmsg, socket, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::sys::uio::IoSlice;
use nix::unistd;

use crate::descriptor::DescriptorKind;

#[derive(Debug, snafu::Snafu)]
pub enum HandoffError {
    #[snafu(display("failed to create control socket: {source}"))]
    Socket { source: nix::Error },
    #[snafu(display("failed to bind control socket {path}: {source}"))]
    Bind { path: String, source: nix::Error },
    #[snafu(display("failed to connect to control socket {path}: {source}"))]
    Connect { path: String, source: nix::Error },
    #[snafu(display("accept on control socket failed: {source}"))]
    Accept { source: nix::Error },
    #[snafu(display("send on control socket failed: {source}"))]
    Send { source: nix::Error },
    #[snafu(display("recv on control socket failed: {source}"))]
    Recv { source: nix::Error },
    #[snafu(display("malformed hand-off message: {reason}"))]
    Malformed { reason: String },
    #[snafu(display("no SCM_RIGHTS fd attached to hand-off message"))]
    MissingFd,
}

/// Wire header: native-endian, fixed 4x8-byte layout (buf_len widened to
/// u64 for a platform-independent wire size rather than raw `size_t`).
#[repr(C)]
struct WireHeader {
    in_fd: i32,
    desc_type: i32,
    buf_idx: u64,
    buf_len: u64,
}

const HEADER_SIZE: usize = std::mem::size_of::<WireHeader>();

fn kind_to_wire(kind: DescriptorKind) -> i32 {
    match kind {
        DescriptorKind::FileRead => 0,
        DescriptorKind::FileWrite => 1,
        DescriptorKind::FifoRead => 2,
        DescriptorKind::FifoWrite => 3,
        DescriptorKind::SocketRead => 4,
        DescriptorKind::SocketWrite => 5,
        DescriptorKind::ListenSocket => 6,
        DescriptorKind::Inotify => 7,
        DescriptorKind::RotatedLog => 8,
    }
}

fn wire_to_kind(code: i32) -> Result<DescriptorKind, HandoffError> {
    Ok(match code {
        0 => DescriptorKind::FileRead,
        1 => DescriptorKind::FileWrite,
        2 => DescriptorKind::FifoRead,
        3 => DescriptorKind::FifoWrite,
        4 => DescriptorKind::SocketRead,
        5 => DescriptorKind::SocketWrite,
        6 => DescriptorKind::ListenSocket,
        7 => DescriptorKind::Inotify,
        8 => DescriptorKind::RotatedLog,
        other => return Err(HandoffError::Malformed { reason: format!("unknown descriptor kind code {other}") }),
    })
}

pub fn socket_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/.logrelay_xfer_{pid}"))
}

/// A single descriptor's hand-off payload, one per control-socket message.
pub struct HandoffMessage {
    pub fd: RawFd,
    pub kind: DescriptorKind,
    pub symbol: String,
    pub buf_idx: usize,
    pub residual: Vec<u8>,
}

/// Pre-restart side: connects as client to the socket named after this
/// process's own pid.
pub fn connect_as_parent() -> Result<RawFd, HandoffError> {
    let pid = std::process::id();
    let path = socket_path(pid);
    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)
        .map_err(|source| HandoffError::Socket { source })?;
    let addr = UnixAddr::new(&path).map_err(|source| HandoffError::Connect { path: path.display().to_string(), source })?;
    connect(fd, &addr).map_err(|source| HandoffError::Connect { path: path.display().to_string(), source })?;
    Ok(fd)
}

/// Restarted-child side: binds the socket named after the parent's pid
/// (`getppid()`) and accepts exactly one connection.
pub fn accept_from_parent() -> Result<RawFd, HandoffError> {
    let parent_pid = unistd::getppid().as_raw() as u32;
    let path = socket_path(parent_pid);
    let _ = std::fs::remove_file(&path);
    let listener = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)
        .map_err(|source| HandoffError::Socket { source })?;
    let addr = UnixAddr::new(&path).map_err(|source| HandoffError::Bind { path: path.display().to_string(), source })?;
    bind(listener, &addr).map_err(|source| HandoffError::Bind { path: path.display().to_string(), source })?;
    listen(listener, 1).map_err(|source| HandoffError::Bind { path: path.display().to_string(), source })?;
    let conn = accept(listener).map_err(|source| HandoffError::Accept { source })?;
    let _ = unistd::close(listener);
    let _ = std::fs::remove_file(&path);
    Ok(conn)
}

/// Sends one descriptor's hand-off message over `sock`, with the open fd
/// riding along as an `SCM_RIGHTS` ancillary message.
pub fn send_message(sock: RawFd, msg: &HandoffMessage) -> Result<(), HandoffError> {
    let symbol_c = CString::new(msg.symbol.clone()).unwrap_or_default();
    let header = WireHeader {
        in_fd: msg.fd,
        desc_type: kind_to_wire(msg.kind),
        buf_idx: msg.buf_idx as u64,
        buf_len: msg.residual.len() as u64,
    };
    let header_bytes = unsafe {
        std::slice::from_raw_parts(&header as *const WireHeader as *const u8, HEADER_SIZE)
    };

    let iov = [
        IoSlice::new(header_bytes),
        IoSlice::new(symbol_c.as_bytes_with_nul()),
        IoSlice::new(&msg.residual),
    ];
    let fds = [msg.fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];

    sendmsg::<()>(sock, &iov, &cmsg, MsgFlags::empty(), None).map_err(|source| HandoffError::Send { source })?;
    Ok(())
}

/// Receives one hand-off message, or `Ok(None)` on a clean peer close
/// (end of the hand-off stream).
pub fn recv_message(sock: RawFd) -> Result<Option<HandoffMessage>, HandoffError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut payload_buf = vec![0u8; 64 * 1024];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);

    let mut iov = [
        nix::sys::uio::IoSliceMut::new(&mut header_buf),
        nix::sys::uio::IoSliceMut::new(&mut payload_buf),
    ];

    let msg = recvmsg::<()>(sock, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
        .map_err(|source| HandoffError::Recv { source })?;

    if msg.bytes == 0 {
        return Ok(None);
    }
    if msg.bytes < HEADER_SIZE {
        return Err(HandoffError::Malformed { reason: "short header".to_owned() });
    }

    let header = unsafe { std::ptr::read_unaligned(header_buf.as_ptr() as *const WireHeader) };
    let kind = wire_to_kind(header.desc_type)?;

    let payload_len = msg.bytes - HEADER_SIZE;
    let payload = &payload_buf[..payload_len];

    let nul = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| HandoffError::Malformed { reason: "symbol not null-terminated".to_owned() })?;
    let symbol = String::from_utf8_lossy(&payload[..nul]).into_owned();
    let residual_start = nul + 1;
    let residual_len = header.buf_len as usize;
    if residual_start + residual_len > payload.len() {
        return Err(HandoffError::Malformed { reason: "residual buffer truncated".to_owned() });
    }
    let residual = payload[residual_start..residual_start + residual_len].to_vec();

    let fd = msg
        .cmsgs()
        .find_map(|c| match c {
            ControlMessageOwned::ScmRights(fds) => fds.first().copied(),
            _ => None,
        })
        .ok_or(HandoffError::MissingFd)?;

    Ok(Some(HandoffMessage {
        fd,
        kind,
        symbol,
        buf_idx: header.buf_idx as usize,
        residual,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_is_derived_from_pid_with_no_negotiation() {
        assert_eq!(socket_path(1234), PathBuf::from("/tmp/.logrelay_xfer_1234"));
    }

    #[test]
    fn descriptor_kind_round_trips_through_wire_codes() {
        for kind in [
            DescriptorKind::FileRead,
            DescriptorKind::FileWrite,
            DescriptorKind::FifoRead,
            DescriptorKind::FifoWrite,
            DescriptorKind::SocketRead,
            DescriptorKind::SocketWrite,
            DescriptorKind::ListenSocket,
            DescriptorKind::Inotify,
            DescriptorKind::RotatedLog,
        ] {
            assert_eq!(wire_to_kind(kind_to_wire(kind)).unwrap(), kind);
        }
    }

    #[test]
    fn send_recv_round_trip_over_a_socketpair() {
        use nix::sys::socket::{socketpair, SockFlag, SockType};
        let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).unwrap();

        let (pr, _pw) = nix::unistd::pipe().unwrap();
        let msg = HandoffMessage {
            fd: pr,
            kind: DescriptorKind::FileRead,
            symbol: "A".to_owned(),
            buf_idx: 3,
            residual: b"partial".to_vec(),
        };
        send_message(a, &msg).unwrap();
        let received = recv_message(b).unwrap().expect("message present");
        assert_eq!(received.kind, DescriptorKind::FileRead);
        assert_eq!(received.symbol, "A");
        assert_eq!(received.buf_idx, 3);
        assert_eq!(received.residual, b"partial");

        let _ = unistd::close(a);
        let _ = unistd::close(b);
        let _ = unistd::close(pr);
        let _ = unistd::close(received.fd);
    }
}
