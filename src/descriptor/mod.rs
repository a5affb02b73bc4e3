//! Polymorphic I/O endpoint with a unified state machine. Grounded on
//! `coredesc.c`; the state-machine shape mirrors `vector`'s
//! `lib/file-source/src/file_watcher.rs`.

pub mod hooks;

use std::fs::OpenOptions;
use std::net::ToSocketAddrs;
use std::os::fd::RawFd;
use std::os::unix::fs::OpenOptionsExt as _;
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::unistd;

use crate::buf::SlabArena;
use crate::io::{LineReader, WriteQueue};
use crate::reactor::{Reactor, Token};

pub use hooks::{DescriptorHooks, ListenSocketHooks, NoopHooks, PreReadOutcome, RotatedLogHooks, SocketWriteHooks, WriteErrorOutcome};

#[derive(Debug, snafu::Snafu)]
pub enum DescriptorError {
    #[snafu(display("i/o error opening {path}: {source}"))]
    Open { path: String, source: std::io::Error },
    #[snafu(display("mkfifo {path}: {source}"))]
    Mkfifo { path: String, source: Errno },
    #[snafu(display("failed to resolve address {host}:{port}: {source}"))]
    Resolve { host: String, port: u16, source: std::io::Error },
    #[snafu(display("no addresses resolved for {host}:{port}"))]
    NoAddress { host: String, port: u16 },
    #[snafu(display("connect to {host}:{port} failed: {source}"))]
    Connect { host: String, port: u16, source: Errno },
    #[snafu(display("bind failed on port {port}: {source}"))]
    Bind { port: u16, source: Errno },
    #[snafu(display("listen failed: {source}"))]
    Listen { source: Errno },
    #[snafu(display("socket() failed: {source}"))]
    Socket { source: Errno },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    FileRead,
    FileWrite,
    FifoRead,
    FifoWrite,
    SocketRead,
    SocketWrite,
    ListenSocket,
    Inotify,
    RotatedLog,
}

impl DescriptorKind {
    /// The set of kinds the idle-loop pending-reads drain applies to.
    /// Expressed as an explicit match rather than a bitmask -- see
    /// SPEC_FULL.md's open-question resolution for why.
    pub fn is_read_side(self) -> bool {
        matches!(
            self,
            DescriptorKind::FileRead | DescriptorKind::FifoRead | DescriptorKind::SocketRead
        )
    }

    pub fn is_write_side(self) -> bool {
        matches!(
            self,
            DescriptorKind::FileWrite | DescriptorKind::FifoWrite | DescriptorKind::SocketWrite | DescriptorKind::RotatedLog
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    Init,
    Pending,
    Active,
    Drain,
    DrainRotate,
    Dead,
}

/// Immutable configuration entry naming a prospective endpoint. Origins
/// form an append-only list owned by the runtime; a descriptor holds only
/// a non-owning index back into it.
#[derive(Debug, Clone)]
pub struct Origin {
    pub symbol: String,
    pub kind: DescriptorKind,
    pub path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub rotate_threshold: Option<u64>,
}

pub type OriginId = usize;

/// Hand-off payload for a descriptor inherited across restart: the open
/// fd plus whatever the line reader had buffered but not yet yielded.
pub struct Inherited {
    pub fd: RawFd,
    pub buffer: Vec<u8>,
    pub buf_idx: usize,
    pub kind: DescriptorKind,
}

#[derive(Debug, Clone, Default)]
pub struct OpenFlags {
    pub seek_to_start: bool,
    pub seek_to_end: bool,
    pub truncate: bool,
    /// Carry a predecessor descriptor's unterminated partial line across
    /// the reopen. Set alongside `residual` -- the (bytes, cursor) a
    /// `LineReader` was holding right before the old descriptor closed.
    pub keep_buffers: bool,
    pub residual: Option<(Vec<u8>, usize)>,
}

pub enum DescriptorIo {
    Reader(LineReader),
    Writer(WriteQueue),
    None,
}

pub struct Descriptor {
    pub kind: DescriptorKind,
    pub fd: RawFd,
    pub state: DescriptorState,
    pub origin: OriginId,
    pub symbol: Option<String>,
    pub path: Option<PathBuf>,
    pub io: DescriptorIo,
    pub hooks: Box<dyn DescriptorHooks>,
    pub token: Token,
}

impl Descriptor {
    fn base(kind: DescriptorKind, fd: RawFd, origin: OriginId, token: Token) -> Self {
        let hooks: Box<dyn DescriptorHooks> = match kind {
            DescriptorKind::ListenSocket => Box::new(ListenSocketHooks::default()),
            DescriptorKind::SocketWrite => Box::new(SocketWriteHooks::default()),
            DescriptorKind::RotatedLog => Box::new(RotatedLogHooks::default()),
            _ => Box::new(NoopHooks),
        };
        Descriptor {
            kind,
            fd,
            state: DescriptorState::Init,
            origin,
            symbol: None,
            path: None,
            io: DescriptorIo::None,
            hooks,
            token,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == DescriptorState::Active
    }

    /// The single constructor/reopener for origin-driven descriptors
    /// (first open, or rotate/reconnect reopen of an existing origin).
    pub fn open_from_origin(
        origin_id: OriginId,
        origin: &Origin,
        flags: OpenFlags,
        reactor: &mut dyn Reactor,
        arena: &mut SlabArena,
        token: Token,
    ) -> Result<Descriptor, DescriptorError> {
        match origin.kind {
            DescriptorKind::FileRead | DescriptorKind::FifoRead => {
                let path = origin.path.clone().expect("file/fifo origin requires a path");

                if origin.kind == DescriptorKind::FifoRead {
                    make_fifo(&path)?;
                }

                if !path.exists() {
                    let mut desc = Descriptor::base(origin.kind, -1, origin_id, token);
                    desc.path = Some(path.clone());
                    desc.symbol = Some(origin.symbol.clone());
                    desc.state = DescriptorState::Pending;
                    reactor
                        .watch_vnode_appear(&path, token)
                        .map_err(|_| DescriptorError::Open {
                            path: path.display().to_string(),
                            source: std::io::Error::new(std::io::ErrorKind::Other, "watch_vnode_appear failed"),
                        })?;
                    return Ok(desc);
                }

                let file = OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&path)
                    .map_err(|e| DescriptorError::Open { path: path.display().to_string(), source: e })?;
                let fd = file.into_raw_fd();

                if flags.seek_to_end && !flags.seek_to_start {
                    unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
                }

                let mut reader = LineReader::new(arena);
                if flags.keep_buffers {
                    if let Some((bytes, cur_idx)) = &flags.residual {
                        reader.reset_with_buffer(arena, bytes, *cur_idx);
                    }
                }

                let mut desc = Descriptor::base(origin.kind, fd, origin_id, token);
                desc.path = Some(path.clone());
                desc.symbol = Some(origin.symbol.clone());
                desc.io = DescriptorIo::Reader(reader);
                desc.state = DescriptorState::Active;
                reactor
                    .register_read(fd, Some(&path), token)
                    .map_err(|_| DescriptorError::Open { path: path.display().to_string(), source: std::io::Error::new(std::io::ErrorKind::Other, "register_read failed") })?;
                reactor
                    .watch_vnode_delete(fd, &path, token)
                    .map_err(|_| DescriptorError::Open { path: path.display().to_string(), source: std::io::Error::new(std::io::ErrorKind::Other, "watch_vnode_delete failed") })?;
                desc.hooks.on_activate(desc.path.as_deref());
                Ok(desc)
            }

            DescriptorKind::FileWrite | DescriptorKind::FifoWrite | DescriptorKind::RotatedLog => {
                let path = origin.path.clone().expect("file/fifo/rotated origin requires a path");

                if origin.kind == DescriptorKind::FifoWrite {
                    make_fifo(&path)?;
                }

                let mut open_opts = OpenOptions::new();
                open_opts.write(true).create(true).append(true);
                if flags.truncate {
                    open_opts.truncate(true);
                }
                let file = open_opts
                    .open(&path)
                    .map_err(|e| DescriptorError::Open { path: path.display().to_string(), source: e })?;
                let fd = file.into_raw_fd();
                set_nonblocking(fd).map_err(|_| DescriptorError::Open {
                    path: path.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "fcntl O_NONBLOCK failed"),
                })?;
                let mut desc = Descriptor::base(origin.kind, fd, origin_id, token);
                desc.path = Some(path.clone());
                desc.symbol = Some(origin.symbol.clone());
                desc.io = DescriptorIo::Writer(WriteQueue::new());
                desc.state = DescriptorState::Active;
                if origin.kind == DescriptorKind::RotatedLog {
                    desc.hooks = Box::new(RotatedLogHooks::new(origin.rotate_threshold.unwrap_or(u64::MAX)));
                }
                desc.hooks.on_activate(desc.path.as_deref());
                Ok(desc)
            }

            DescriptorKind::SocketWrite => {
                let host = origin.host.clone().expect("socket-write origin requires a host");
                let port = origin.port.expect("socket-write origin requires a port");

                let addr = (host.as_str(), port)
                    .to_socket_addrs()
                    .map_err(|e| DescriptorError::Resolve { host: host.clone(), port, source: e })?
                    .next()
                    .ok_or_else(|| DescriptorError::NoAddress { host: host.clone(), port })?;

                let family = if addr.is_ipv6() { AddressFamily::Inet6 } else { AddressFamily::Inet };
                let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)
                    .map_err(|source| DescriptorError::Socket { source })?;

                let sockaddr = socket::SockaddrStorage::from(addr);
                let mut desc = Descriptor::base(origin.kind, fd, origin_id, token);
                desc.symbol = Some(origin.symbol.clone());
                desc.io = DescriptorIo::Writer(WriteQueue::new());

                match socket::connect(fd, &sockaddr) {
                    Ok(()) => {
                        desc.state = DescriptorState::Active;
                        desc.hooks.on_activate(None);
                    }
                    Err(Errno::EINPROGRESS) => {
                        desc.state = DescriptorState::Pending;
                        reactor
                            .register_write(fd, token)
                            .map_err(|_| DescriptorError::Connect { host: host.clone(), port, source: Errno::EINPROGRESS })?;
                    }
                    Err(Errno::ECONNREFUSED) => {
                        desc.state = DescriptorState::Pending;
                    }
                    Err(source) => return Err(DescriptorError::Connect { host, port, source }),
                }
                Ok(desc)
            }

            DescriptorKind::ListenSocket => {
                let port = origin.port.expect("listen-socket origin requires a port");
                let fd = socket::socket(AddressFamily::Inet, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)
                    .map_err(|source| DescriptorError::Socket { source })?;
                socket::setsockopt(fd, socket::sockopt::ReuseAddr, &true).ok();
                let addr = socket::SockaddrIn::new(0, 0, 0, 0, port);
                socket::bind(fd, &addr).map_err(|source| DescriptorError::Bind { port, source })?;
                socket::listen(fd, 10).map_err(|source| DescriptorError::Listen { source })?;

                let mut desc = Descriptor::base(origin.kind, fd, origin_id, token);
                desc.symbol = Some(origin.symbol.clone());
                desc.state = DescriptorState::Active;
                reactor
                    .register_read(fd, None, token)
                    .map_err(|_| DescriptorError::Bind { port, source: Errno::EIO })?;
                Ok(desc)
            }

            DescriptorKind::SocketRead | DescriptorKind::Inotify => {
                unreachable!("socket-read and inotify descriptors are never origin-driven")
            }
        }
    }

    /// Attach an inherited fd + residual buffer from a restart hand-off
    /// message. Separate from `open_from_origin` (per `coredesc.c`'s split
    /// between origin-driven reopen and hand-off-driven attach) but funnels
    /// into the same state: ACTIVE, reader pre-seeded with residue.
    pub fn attach_inherited(
        origin_id: OriginId,
        origin: &Origin,
        inherited: Inherited,
        reactor: &mut dyn Reactor,
        arena: &mut SlabArena,
        token: Token,
    ) -> Result<Descriptor, DescriptorError> {
        let mut desc = Descriptor::base(inherited.kind, inherited.fd, origin_id, token);
        desc.symbol = Some(origin.symbol.clone());
        desc.path = origin.path.clone();
        desc.state = DescriptorState::Active;

        if inherited.kind.is_read_side() {
            let mut reader = LineReader::new(arena);
            reader.reset_with_buffer(arena, &inherited.buffer, inherited.buf_idx);
            desc.io = DescriptorIo::Reader(reader);
            reactor
                .register_read(inherited.fd, desc.path.as_deref(), token)
                .map_err(|_| DescriptorError::Open {
                    path: desc.path.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "register_read failed"),
                })?;
        } else {
            desc.io = DescriptorIo::Writer(WriteQueue::new());
        }
        desc.hooks.on_activate(desc.path.as_deref());
        Ok(desc)
    }

    /// Idempotent teardown: closes the fd and transitions to DEAD. Callers
    /// (the runtime) are responsible for removing the descriptor's slab
    /// key from every auxiliary table (symbol table, active list,
    /// pending-reads) -- this method only owns the fd and hook state.
    pub fn close(&mut self, reactor: &mut dyn Reactor) {
        if self.state == DescriptorState::Dead {
            return;
        }
        self.hooks.on_deactivate();
        if self.fd >= 0 {
            let _ = reactor.unregister(self.fd);
            let _ = unistd::close(self.fd);
        }
        self.fd = -1;
        self.state = DescriptorState::Dead;
    }
}

fn make_fifo(path: &Path) -> Result<(), DescriptorError> {
    match unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o644)) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(source) => Err(DescriptorError::Mkfifo { path: path.display().to_string(), source }),
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_side_kind_set_is_explicit() {
        assert!(DescriptorKind::FileRead.is_read_side());
        assert!(DescriptorKind::FifoRead.is_read_side());
        assert!(DescriptorKind::SocketRead.is_read_side());
        assert!(!DescriptorKind::FileWrite.is_read_side());
        assert!(!DescriptorKind::ListenSocket.is_read_side());
    }

    #[test]
    fn write_side_kind_set_is_explicit() {
        assert!(DescriptorKind::FileWrite.is_write_side());
        assert!(DescriptorKind::RotatedLog.is_write_side());
        assert!(!DescriptorKind::FileRead.is_write_side());
    }
}
