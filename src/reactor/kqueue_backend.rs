//! BSD/macOS backend: kqueue for readiness and for vnode watching via
//! `EVFILT_VNODE`. Grounded on `evt_kq.c`.
//!
//! Unlike epoll, kqueue can register `EVFILT_READ`/`EVFILT_WRITE` on a
//! regular file fd directly, so (unlike the Linux backend) files need no
//! special-casing in `register_read`. Directory watching is still required
//! to detect a not-yet-existing path's appearance, since kqueue has no
//! filename-based watch -- only fd-keyed ones.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::event::{kevent, kqueue, EventFilter, EventFlag, FilterFlag, KEvent};

use super::{Direction, Event, ReactorError, ReadyEvent, Reactor, Token};

struct DirWatch {
    dirfd: RawFd,
    dirname: PathBuf,
    files: Vec<(Token, PathBuf)>,
}

struct DeleteWatch {
    fd: RawFd,
    token: Token,
}

pub struct KqueueReactor {
    kq: RawFd,
    dir_watchers: Vec<DirWatch>,
    delete_watchers: Vec<DeleteWatch>,
}

impl KqueueReactor {
    pub fn new() -> Result<Self, ReactorError> {
        let kq = kqueue().map_err(|e| ReactorError::Create { source: e.into() })?;
        Ok(KqueueReactor {
            kq,
            dir_watchers: Vec::new(),
            delete_watchers: Vec::new(),
        })
    }

    fn submit(&self, ev: &KEvent) -> Result<(), ReactorError> {
        kevent(self.kq, &[*ev], &mut [], 0)
            .map(|_| ())
            .map_err(|e| ReactorError::Register {
                fd: ev.ident() as RawFd,
                source: e.into(),
            })
    }

    fn find_dir_mut(&mut self, dirfd: RawFd) -> Option<&mut DirWatch> {
        self.dir_watchers.iter_mut().find(|d| d.dirfd == dirfd)
    }

    fn find_delete(&self, fd: RawFd) -> Option<&DeleteWatch> {
        self.delete_watchers.iter().find(|d| d.fd == fd)
    }
}

impl Reactor for KqueueReactor {
    fn register_read(
        &mut self,
        fd: RawFd,
        _file_path: Option<&Path>,
        token: Token,
    ) -> Result<(), ReactorError> {
        let ev = KEvent::new(
            fd as usize,
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
            FilterFlag::empty(),
            0,
            token as isize,
        );
        self.submit(&ev)
    }

    fn register_write(&mut self, fd: RawFd, token: Token) -> Result<(), ReactorError> {
        let ev = KEvent::new(
            fd as usize,
            EventFilter::EVFILT_WRITE,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR | EventFlag::EV_ONESHOT,
            FilterFlag::empty(),
            0,
            token as isize,
        );
        self.submit(&ev)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        for filter in [EventFilter::EVFILT_READ, EventFilter::EVFILT_WRITE, EventFilter::EVFILT_VNODE] {
            let ev = KEvent::new(fd as usize, filter, EventFlag::EV_DELETE, FilterFlag::empty(), 0, 0);
            // Deleting a filter that was never added returns ENOENT; harmless.
            let _ = kevent(self.kq, &[ev], &mut [], 0);
        }
        Ok(())
    }

    fn watch_vnode_appear(&mut self, path: &Path, token: Token) -> Result<(), ReactorError> {
        let dirname = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

        let existing = self.dir_watchers.iter().find(|d| d.dirname == dirname).map(|d| d.dirfd);
        let dirfd = match existing {
            Some(fd) => fd,
            None => {
                let dir = OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_DIRECTORY | libc::O_NONBLOCK)
                    .open(&dirname)
                    .map_err(|e| ReactorError::WatchAppear { source: e })?;
                let fd = dir.as_raw_fd();
                std::mem::forget(dir); // ownership now lives in dir_watchers / the kernel watch
                let ev = KEvent::new(
                    fd as usize,
                    EventFilter::EVFILT_VNODE,
                    EventFlag::EV_ADD | EventFlag::EV_CLEAR,
                    FilterFlag::NOTE_WRITE | FilterFlag::NOTE_EXTEND,
                    0,
                    0,
                );
                self.submit(&ev)?;
                self.dir_watchers.push(DirWatch {
                    dirfd: fd,
                    dirname: dirname.clone(),
                    files: Vec::new(),
                });
                fd
            }
        };

        if let Some(dir) = self.find_dir_mut(dirfd) {
            if !dir.files.iter().any(|(t, _)| *t == token) {
                dir.files.push((token, path.to_path_buf()));
            }
        }
        Ok(())
    }

    fn watch_vnode_delete(
        &mut self,
        fd: RawFd,
        _path: &Path,
        token: Token,
    ) -> Result<(), ReactorError> {
        let ev = KEvent::new(
            fd as usize,
            EventFilter::EVFILT_VNODE,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR | EventFlag::EV_ONESHOT,
            FilterFlag::NOTE_DELETE | FilterFlag::NOTE_RENAME,
            0,
            0,
        );
        self.submit(&ev)?;
        self.delete_watchers.push(DeleteWatch { fd, token });
        Ok(())
    }

    fn clear_state(&mut self, fd: RawFd, direction: Direction) -> Result<(), ReactorError> {
        let filter = match direction {
            Direction::Read => EventFilter::EVFILT_READ,
            Direction::Write => EventFilter::EVFILT_WRITE,
        };
        let ev = KEvent::new(fd as usize, filter, EventFlag::EV_CLEAR, FilterFlag::empty(), 0, 0);
        self.submit(&ev)
    }

    fn poll(&mut self, timeout_ms: u32) -> Result<Vec<Event>, ReactorError> {
        let mut raw = vec![
            KEvent::new(0, EventFilter::EVFILT_READ, EventFlag::empty(), FilterFlag::empty(), 0, 0);
            64
        ];
        let n = kevent(self.kq, &[], &mut raw, timeout_ms as usize)
            .map_err(|e| ReactorError::Wait { source: e.into() })?;

        let mut out = Vec::with_capacity(n);
        for ev in &raw[..n] {
            let ident = ev.ident() as RawFd;

            match ev.filter() {
                Ok(EventFilter::EVFILT_READ) => out.push(Event::Ready(ReadyEvent {
                    token: ev.udata() as Token,
                    readable: true,
                    writable: false,
                    eof: ev.flags().contains(EventFlag::EV_EOF),
                    error: ev.flags().contains(EventFlag::EV_ERROR),
                    size_hint: ev.data().max(0) as usize,
                })),
                Ok(EventFilter::EVFILT_WRITE) => out.push(Event::Ready(ReadyEvent {
                    token: ev.udata() as Token,
                    readable: false,
                    writable: true,
                    eof: ev.flags().contains(EventFlag::EV_EOF),
                    error: ev.flags().contains(EventFlag::EV_ERROR),
                    size_hint: 0,
                })),
                Ok(EventFilter::EVFILT_VNODE) => {
                    if let Some(delete) = self.find_delete(ident) {
                        out.push(Event::VnodeGone { token: delete.token });
                    } else if let Some(dir) = self.find_dir_mut(ident) {
                        let found: Vec<(Token, PathBuf)> = dir
                            .files
                            .iter()
                            .filter(|(_, p)| p.exists())
                            .cloned()
                            .collect();
                        dir.files.retain(|(_, p)| !p.exists());
                        for (token, _) in found {
                            out.push(Event::VnodeAppear { token });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }
}
