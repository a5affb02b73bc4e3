//! Linux backend: epoll for readiness, inotify for file-presence and
//! file-modification watching. Grounded on `evt_inotify.c`.
//!
//! Files are never registered with epoll directly -- epoll considers
//! regular files always-ready, which is useless for backpressure. Instead
//! a file's "read readiness" is synthesized from inotify `IN_MODIFY`
//! events, and the inotify fd itself is the one thing registered with
//! epoll for readability.

use std::ffi::OsStr;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};

use super::{Direction, Event, ReactorError, ReadyEvent, Reactor, Token};

struct DirWatch {
    wd: i32,
    dirname: PathBuf,
    files: Vec<(Token, String)>, // (token, basename we're waiting for)
}

struct FileWatch {
    wd: i32,
    token: Token,
    fd: RawFd,
    link_count: i64,
}

pub struct EpollReactor {
    epfd: RawFd,
    inotify_fd: RawFd,
    dir_watchers: Vec<DirWatch>,
    file_watchers: Vec<FileWatch>,
}

const INOTIFY_EVENT_BUF: usize = 4096;
/// Sentinel `epoll_data` value identifying the inotify fd's own readiness,
/// distinct from any real descriptor token (slab keys start at 0).
const INOTIFY_TOKEN: u64 = u64::MAX;

// Mirrors <sys/inotify.h>'s inotify_event layout; parsed manually to avoid
// depending on a second crate for what is, at its core, one read() loop.
#[repr(C)]
struct RawInotifyEvent {
    wd: i32,
    mask: u32,
    cookie: u32,
    len: u32,
}

const IN_MODIFY: u32 = 0x0000_0002;
const IN_ATTRIB: u32 = 0x0000_0004;
const IN_CREATE: u32 = 0x0000_0100;
const IN_MOVED_TO: u32 = 0x0000_0080;
const IN_IGNORED: u32 = 0x0000_8000;
const IN_ONLYDIR: u32 = 0x0100_0000;
const IN_MASK_ADD: u32 = 0x2000_0000;

impl EpollReactor {
    pub fn new() -> Result<Self, ReactorError> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| ReactorError::Create { source: e.into() })?;

        let inotify_fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if inotify_fd < 0 {
            return Err(ReactorError::Create {
                source: std::io::Error::last_os_error(),
            });
        }

        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, INOTIFY_TOKEN);
        epoll_ctl(epfd, EpollOp::EpollCtlAdd, inotify_fd, &mut ev)
            .map_err(|e| ReactorError::Register { fd: inotify_fd, source: e.into() })?;

        Ok(EpollReactor {
            epfd,
            inotify_fd,
            dir_watchers: Vec::new(),
            file_watchers: Vec::new(),
        })
    }

    fn find_dir(&mut self, wd: i32) -> Option<&mut DirWatch> {
        self.dir_watchers.iter_mut().find(|d| d.wd == wd)
    }

    fn find_file(&mut self, wd: i32) -> Option<&mut FileWatch> {
        self.file_watchers.iter_mut().find(|f| f.wd == wd)
    }

    fn process_inotify(&mut self, events: &mut Vec<Event>) -> Result<(), ReactorError> {
        let mut buf = [0u8; INOTIFY_EVENT_BUF];
        loop {
            let n = unsafe {
                libc::read(
                    self.inotify_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Ok(());
                }
                return Err(ReactorError::Wait { source: err });
            }
            if n == 0 {
                return Ok(());
            }

            let mut offset = 0usize;
            let n = n as usize;
            while offset < n {
                let hdr_size = std::mem::size_of::<RawInotifyEvent>();
                let raw = unsafe { &*(buf[offset..].as_ptr() as *const RawInotifyEvent) };
                let name_bytes = &buf[offset + hdr_size..offset + hdr_size + raw.len as usize];
                let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
                let name = OsStr::from_bytes(&name_bytes[..name_end]).to_string_lossy().into_owned();

                if let Some(dir) = self.find_dir(raw.wd) {
                    if raw.mask & (IN_CREATE | IN_MOVED_TO) != 0 {
                        if let Some(pos) = dir.files.iter().position(|(_, base)| *base == name) {
                            let (token, _) = dir.files.remove(pos);
                            events.push(Event::VnodeAppear { token });
                        }
                    }
                } else if raw.mask & IN_IGNORED == 0 {
                    if let Some(file) = self.find_file(raw.wd) {
                        if raw.mask & IN_MODIFY != 0 {
                            events.push(Event::Ready(ReadyEvent {
                                token: file.token,
                                readable: true,
                                writable: false,
                                eof: false,
                                error: false,
                                size_hint: 0,
                            }));
                        } else if raw.mask & IN_ATTRIB != 0 {
                            let token = file.token;
                            let prev = file.link_count;
                            let current = stat_nlink(file.fd);
                            file.link_count = current;
                            if prev >= 0 && current < prev {
                                events.push(Event::VnodeGone { token });
                            }
                        }
                    }
                }

                offset += hdr_size + raw.len as usize;
            }
        }
    }
}

fn stat_nlink(fd: RawFd) -> i64 {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } == 0 {
        st.st_nlink as i64
    } else {
        -1
    }
}

impl Reactor for EpollReactor {
    fn register_read(
        &mut self,
        fd: RawFd,
        file_path: Option<&Path>,
        token: Token,
    ) -> Result<(), ReactorError> {
        match file_path {
            None => {
                let mut ev = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, token as u64);
                epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut ev)
                    .map_err(|e| ReactorError::Register { fd, source: e.into() })
            }
            Some(path) => {
                let path_c = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
                let wd = unsafe {
                    libc::inotify_add_watch(self.inotify_fd, path_c.as_ptr(), IN_MODIFY | IN_MASK_ADD)
                };
                if wd < 0 {
                    return Err(ReactorError::Register {
                        fd,
                        source: std::io::Error::last_os_error(),
                    });
                }
                self.file_watchers.push(FileWatch {
                    wd,
                    token,
                    fd,
                    link_count: stat_nlink(fd),
                });
                Ok(())
            }
        }
    }

    fn register_write(&mut self, fd: RawFd, token: Token) -> Result<(), ReactorError> {
        let mut ev = EpollEvent::new(
            EpollFlags::EPOLLOUT | EpollFlags::EPOLLET | EpollFlags::EPOLLONESHOT,
            token as u64,
        );
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut ev)
            .map_err(|e| ReactorError::Register { fd, source: e.into() })
    }

    fn unregister(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None)
            .map_err(|e| ReactorError::Unregister { fd, source: e.into() })
    }

    fn watch_vnode_appear(&mut self, path: &Path, token: Token) -> Result<(), ReactorError> {
        let dirname = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let basename = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let existing_wd = self
            .dir_watchers
            .iter()
            .find(|d| d.dirname == dirname)
            .map(|d| d.wd);

        let wd = if let Some(wd) = existing_wd {
            wd
        } else {
            let dir_c = std::ffi::CString::new(dirname.as_os_str().as_bytes()).unwrap();
            let wd = unsafe {
                libc::inotify_add_watch(self.inotify_fd, dir_c.as_ptr(), IN_CREATE | IN_ONLYDIR)
            };
            if wd < 0 {
                return Err(ReactorError::WatchAppear {
                    source: std::io::Error::last_os_error(),
                });
            }
            self.dir_watchers.push(DirWatch {
                wd,
                dirname: dirname.clone(),
                files: Vec::new(),
            });
            wd
        };

        if let Some(dir) = self.find_dir(wd) {
            if !dir.files.iter().any(|(t, _)| *t == token) {
                dir.files.push((token, basename));
            }
        }
        Ok(())
    }

    fn watch_vnode_delete(
        &mut self,
        fd: RawFd,
        path: &Path,
        token: Token,
    ) -> Result<(), ReactorError> {
        let path_c = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
        let wd = unsafe { libc::inotify_add_watch(self.inotify_fd, path_c.as_ptr(), IN_ATTRIB | IN_MASK_ADD) };
        if wd < 0 {
            return Err(ReactorError::WatchDelete {
                source: std::io::Error::last_os_error(),
            });
        }
        self.file_watchers.push(FileWatch {
            wd,
            token,
            fd,
            link_count: stat_nlink(fd),
        });
        Ok(())
    }

    fn clear_state(&mut self, _fd: RawFd, _direction: Direction) -> Result<(), ReactorError> {
        // epoll doesn't need edge-state clearing distinct from re-arming.
        Ok(())
    }

    fn poll(&mut self, timeout_ms: u32) -> Result<Vec<Event>, ReactorError> {
        let mut raw_events = vec![EpollEvent::empty(); 64];
        let n = epoll_wait(self.epfd, &mut raw_events, timeout_ms as isize)
            .map_err(|e| ReactorError::Wait { source: e.into() })?;

        let mut out = Vec::with_capacity(n);
        for ev in &raw_events[..n] {
            let token = ev.data();
            if token == INOTIFY_TOKEN {
                self.process_inotify(&mut out)?;
                continue;
            }
            let flags = ev.events();
            out.push(Event::Ready(ReadyEvent {
                token: token as Token,
                readable: flags.contains(EpollFlags::EPOLLIN),
                writable: flags.contains(EpollFlags::EPOLLOUT),
                eof: flags.contains(EpollFlags::EPOLLRDHUP) || flags.contains(EpollFlags::EPOLLHUP),
                error: flags.contains(EpollFlags::EPOLLERR),
                size_hint: 0,
            }));
        }
        Ok(out)
    }
}
