use crate::error::Result;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::IpAddr;
use std::ptr;

// ---- Socket Operations ----

/// Create an optimized non-blocking TCP listener with SO_REUSEPORT so every
/// worker can bind the same address and let the kernel balance accepts.
///
/// Platform notes:
/// - **Both**: SO_REUSEADDR, SO_REUSEPORT, TCP_NODELAY (inherited by accepted sockets)
/// - **Linux**: SOCK_NONBLOCK (atomic), TCP_DEFER_ACCEPT
/// - **macOS**: SO_NOSIGPIPE (no MSG_NOSIGNAL on this platform)
pub fn create_listen_socket_reuseport(host: &str, port: u16, backlog: u32) -> Result<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: std::net::SocketAddr = addr_str
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid listen address"))?;

    let domain = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };

    #[cfg(target_os = "linux")]
    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // Inherited by every accepted socket, so no per-accept setsockopt
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        // Kernel holds the connection until data arrives
        let defer_secs: c_int = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            &defer_secs as *const _ as *const c_void,
            mem::size_of_val(&defer_secs) as socklen_t,
        );

        bind_addr(fd, &addr)?;

        if libc::listen(fd, backlog as c_int) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }

    #[cfg(target_os = "macos")]
    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        bind_addr(fd, &addr)?;

        if libc::listen(fd, backlog.min(libc::SOMAXCONN as u32) as c_int) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &std::net::SocketAddr) -> Result<()> {
    unsafe {
        match addr {
            std::net::SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    #[cfg(target_os = "macos")]
                    sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
            std::net::SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    #[cfg(target_os = "macos")]
                    sin6_len: mem::size_of::<libc::sockaddr_in6>() as u8,
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

/// Port the socket actually bound to (needed when binding port 0 in tests).
pub fn local_port(fd: c_int) -> Result<u16> {
    unsafe {
        let mut ss: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        match ss.ss_family as c_int {
            libc::AF_INET => {
                let sin = &ss as *const _ as *const libc::sockaddr_in;
                Ok(u16::from_be((*sin).sin_port))
            }
            libc::AF_INET6 => {
                let sin6 = &ss as *const _ as *const libc::sockaddr_in6;
                Ok(u16::from_be((*sin6).sin6_port))
            }
            _ => Err(io::Error::new(io::ErrorKind::Other, "unknown socket family").into()),
        }
    }
}

fn peer_from_storage(ss: &libc::sockaddr_storage) -> Option<IpAddr> {
    match ss.ss_family as c_int {
        libc::AF_INET => {
            let sin = ss as *const _ as *const libc::sockaddr_in;
            let raw = unsafe { (*sin).sin_addr.s_addr };
            // s_addr is network order; its memory bytes are already a.b.c.d
            Some(IpAddr::V4(std::net::Ipv4Addr::from(raw.to_ne_bytes())))
        }
        libc::AF_INET6 => {
            let sin6 = ss as *const _ as *const libc::sockaddr_in6;
            Some(IpAddr::V6(std::net::Ipv6Addr::from(unsafe {
                (*sin6).sin6_addr.s6_addr
            })))
        }
        _ => None,
    }
}

/// Accept one pending connection. `Ok(None)` means the queue is drained.
/// A connection from an unrecognized address family yields `(fd, None)` so
/// the caller can drop it.
pub fn accept_connection(listen_fd: c_int) -> Result<Option<(c_int, Option<IpAddr>)>> {
    unsafe {
        let mut ss: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

        #[cfg(target_os = "linux")]
        let fd = libc::accept4(
            listen_fd,
            &mut ss as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );
        #[cfg(target_os = "macos")]
        let fd = libc::accept(listen_fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len);

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }

        #[cfg(target_os = "macos")]
        {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }
            let one: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }

        // TCP_NODELAY is inherited from the listener
        Ok(Some((fd, peer_from_storage(&ss))))
    }
}

// ---- Socket I/O ----

/// recv(2). `Ok(0)` is EOF; would-block surfaces as `ErrorKind::WouldBlock`.
pub fn recv(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// send(2) with SIGPIPE suppressed.
pub fn send(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    #[cfg(target_os = "linux")]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(target_os = "macos")]
    let flags = 0; // SO_NOSIGPIPE set at accept time

    unsafe {
        let res = libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Zero-copy file-to-socket transfer. Advances `*offset` by the bytes sent.
pub fn sendfile(sock: c_int, file_fd: c_int, offset: &mut i64, count: usize) -> io::Result<usize> {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut off: libc::off_t = *offset;
        let res = libc::sendfile(sock, file_fd, &mut off, count);
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        *offset = off;
        Ok(res as usize)
    }

    #[cfg(target_os = "macos")]
    unsafe {
        let mut len: libc::off_t = count as libc::off_t;
        let res = libc::sendfile(file_fd, sock, *offset, &mut len, ptr::null_mut(), 0);
        // macOS reports partial progress through `len` even on EAGAIN
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock && len > 0 {
                *offset += len;
                return Ok(len as usize);
            }
            return Err(err);
        }
        *offset += len;
        Ok(len as usize)
    }
}

/// pread(2), used by the streaming fallback when TLS rules out sendfile.
pub fn pread(fd: c_int, buf: &mut [u8], offset: i64) -> io::Result<usize> {
    unsafe {
        let res = libc::pread(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), offset);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Wake Pipe ----

/// Non-blocking Unix pipe, `(read_fd, write_fd)`. The reactor registers the
/// read end and `Server` writes one byte to break `epoll_wait`.
pub fn create_pipe() -> Result<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        for fd in fds {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fds[0]);
                libc::close(fds[1]);
                return Err(err.into());
            }
        }
    }
    Ok((fds[0], fds[1]))
}

pub fn pipe_wake(write_fd: c_int) {
    let byte = [1u8; 1];
    unsafe {
        let _ = libc::write(write_fd, byte.as_ptr() as *const c_void, 1);
    }
}

pub fn pipe_drain(read_fd: c_int) {
    let mut buf = [0u8; 64];
    unsafe {
        while libc::read(read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) > 0 {}
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll Operations (Linux) ----

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    use libc::{epoll_event, EPOLLET, EPOLLIN, EPOLLOUT};

    pub const EV_READ: i32 = EPOLLIN;
    pub const EV_WRITE: i32 = EPOLLOUT;
    pub const EV_ERR_HUP: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

    #[derive(Clone, Copy)]
    pub struct Event {
        pub events: u32,
        pub token: u64,
    }

    impl Event {
        pub const fn empty() -> Self {
            Self { events: 0, token: 0 }
        }
        pub fn readable(&self) -> bool {
            self.events & EPOLLIN as u32 != 0
        }
        pub fn writable(&self) -> bool {
            self.events & EPOLLOUT as u32 != 0
        }
        pub fn err_or_hup(&self) -> bool {
            self.events & EV_ERR_HUP != 0
        }
    }

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> Result<Self> {
            unsafe {
                let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        /// Register edge-triggered. The fd is polled once at registration and
        /// never re-armed; `Conn::event_type` gates what each wakeup means.
        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> Result<()> {
            let mut event = epoll_event {
                events: (interests | EPOLLET) as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        /// Level-triggered registration, used for the timer and wake fds.
        pub fn add_level(&self, fd: c_int, token: u64, interests: i32) -> Result<()> {
            let mut event = epoll_event {
                events: interests as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> Result<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [Event], timeout_ms: i32) -> Result<usize> {
            let mut raw = [epoll_event { events: 0, u64: 0 }; 1024];
            let cap = events.len().min(raw.len());
            unsafe {
                let res = libc::epoll_wait(self.fd, raw.as_mut_ptr(), cap as c_int, timeout_ms);
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                let n = res as usize;
                for i in 0..n {
                    events[i] = Event {
                        events: raw[i].events,
                        token: raw[i].u64,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- Kqueue Shim (macOS development) ----

#[cfg(target_os = "macos")]
pub use macos_epoll::*;

#[cfg(target_os = "macos")]
mod macos_epoll {
    use super::*;
    use libc::{kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF};

    pub const EV_READ: i32 = 1;
    pub const EV_WRITE: i32 = 4;

    #[derive(Clone, Copy)]
    pub struct Event {
        pub events: u32,
        pub token: u64,
    }

    impl Event {
        pub const fn empty() -> Self {
            Self { events: 0, token: 0 }
        }
        pub fn readable(&self) -> bool {
            self.events & EV_READ as u32 != 0
        }
        pub fn writable(&self) -> bool {
            self.events & EV_WRITE as u32 != 0
        }
        pub fn err_or_hup(&self) -> bool {
            // EOF is folded into the read path on kqueue
            false
        }
    }

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> Result<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> Result<()> {
            self.modify_kqueue(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn add_level(&self, fd: c_int, token: u64, interests: i32) -> Result<()> {
            self.modify_kqueue(fd, token, interests, EV_ADD | EV_ENABLE)
        }

        pub fn delete(&self, fd: c_int) -> Result<()> {
            self.modify_kqueue(fd, 0, EV_READ | EV_WRITE, EV_DELETE)
        }

        fn modify_kqueue(&self, fd: c_int, token: u64, interests: i32, action: u16) -> Result<()> {
            let mut changes = [unsafe { mem::zeroed::<kevent>() }; 2];
            let mut n = 0;

            if (interests & EV_READ) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_READ,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }
            if (interests & EV_WRITE) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_WRITE,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }

            unsafe {
                let res = libc::kevent(self.fd, changes.as_ptr(), n as c_int, ptr::null_mut(), 0, ptr::null());
                // EV_DELETE on a half-registered fd is harmless
                if res < 0 && action != EV_DELETE {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub(super) fn set_timer(&self, ident: usize, token: u64, ms: i64, oneshot: bool) -> Result<()> {
            let flags = if oneshot {
                EV_ADD | EV_ENABLE | libc::EV_ONESHOT
            } else {
                EV_ADD | EV_ENABLE
            };
            let ev = kevent {
                ident,
                filter: libc::EVFILT_TIMER,
                flags,
                fflags: 0,
                data: ms.max(1) as isize,
                udata: token as *mut c_void,
            };
            unsafe {
                if libc::kevent(self.fd, &ev, 1, ptr::null_mut(), 0, ptr::null()) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub(super) fn cancel_timer(&self, ident: usize) {
            let ev = kevent {
                ident,
                filter: libc::EVFILT_TIMER,
                flags: EV_DELETE,
                fflags: 0,
                data: 0,
                udata: ptr::null_mut(),
            };
            unsafe {
                let _ = libc::kevent(self.fd, &ev, 1, ptr::null_mut(), 0, ptr::null());
            }
        }

        pub fn wait(&self, events: &mut [Event], timeout_ms: i32) -> Result<usize> {
            const MAX_BATCH: usize = 128;
            let mut kevents = [unsafe { mem::zeroed::<kevent>() }; MAX_BATCH];
            let batch = events.len().min(MAX_BATCH);

            let ts = if timeout_ms >= 0 {
                Some(timespec {
                    tv_sec: (timeout_ms / 1000) as libc::time_t,
                    tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
                })
            } else {
                None
            };
            let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const timespec);

            unsafe {
                let res = libc::kevent(self.fd, ptr::null(), 0, kevents.as_mut_ptr(), batch as c_int, ts_ptr);
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }

                let n = res as usize;
                for i in 0..n {
                    let mut ev = 0;
                    if kevents[i].filter == EVFILT_READ || kevents[i].filter == libc::EVFILT_TIMER {
                        ev |= EV_READ;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        ev |= EV_WRITE;
                    }
                    if kevents[i].flags & EV_EOF != 0 {
                        ev |= EV_READ;
                    }
                    events[i] = Event {
                        events: ev as u32,
                        token: kevents[i].udata as u64,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- Reactor Timers ----
//
// Two special descriptors per worker: a periodic tick driving the timeout
// wheel and a one-shot timer re-armed to the async heap minimum. Both carry
// a generation-zero completion token. Linux backs them with timerfds; the
// kqueue shim uses EVFILT_TIMER idents instead.

#[cfg(target_os = "linux")]
pub struct ReactorTimers {
    tick_fd: c_int,
    async_fd: c_int,
}

#[cfg(target_os = "linux")]
impl ReactorTimers {
    pub fn new(epoll: &Epoll, tick_token: u64, async_token: u64, tick_secs: u32) -> Result<Self> {
        unsafe {
            let tick_fd = libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC);
            if tick_fd < 0 {
                return Err(io::Error::last_os_error().into());
            }

            let ts = libc::itimerspec {
                it_interval: libc::timespec {
                    tv_sec: tick_secs as libc::time_t,
                    tv_nsec: 0,
                },
                it_value: libc::timespec {
                    tv_sec: tick_secs as libc::time_t,
                    tv_nsec: 0,
                },
            };
            if libc::timerfd_settime(tick_fd, 0, &ts, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                libc::close(tick_fd);
                return Err(err.into());
            }

            let async_fd = libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC);
            if async_fd < 0 {
                let err = io::Error::last_os_error();
                libc::close(tick_fd);
                return Err(err.into());
            }

            let timers = Self { tick_fd, async_fd };
            epoll.add_level(tick_fd, tick_token, EV_READ)?;
            epoll.add_level(async_fd, async_token, EV_READ)?;
            Ok(timers)
        }
    }

    pub fn drain_tick(&self) {
        let mut expirations = 0u64;
        unsafe {
            let _ = libc::read(self.tick_fd, &mut expirations as *mut _ as *mut c_void, 8);
        }
    }

    pub fn drain_async(&self) {
        let mut expirations = 0u64;
        unsafe {
            let _ = libc::read(self.async_fd, &mut expirations as *mut _ as *mut c_void, 8);
        }
    }

    /// One-shot re-arm to fire in `remain_ms` (clamped to at least 1 ms).
    pub fn arm_async_ms(&self, _epoll: &Epoll, remain_ms: u64) -> Result<()> {
        let remain = remain_ms.max(1);
        let ts = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: (remain / 1000) as libc::time_t,
                tv_nsec: ((remain % 1000) * 1_000_000) as libc::c_long,
            },
        };
        unsafe {
            loop {
                if libc::timerfd_settime(self.async_fd, 0, &ts, ptr::null_mut()) == 0 {
                    return Ok(());
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(err.into());
                }
            }
        }
    }

    pub fn disarm_async(&self, _epoll: &Epoll) -> Result<()> {
        let ts: libc::itimerspec = unsafe { mem::zeroed() };
        unsafe {
            if libc::timerfd_settime(self.async_fd, 0, &ts, ptr::null_mut()) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Drop for ReactorTimers {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.tick_fd);
            libc::close(self.async_fd);
        }
    }
}

#[cfg(target_os = "macos")]
pub struct ReactorTimers {
    async_ident: usize,
    async_token: u64,
}

#[cfg(target_os = "macos")]
impl ReactorTimers {
    const TICK_IDENT: usize = usize::MAX - 1;
    const ASYNC_IDENT: usize = usize::MAX - 2;

    pub fn new(epoll: &Epoll, tick_token: u64, async_token: u64, tick_secs: u32) -> Result<Self> {
        epoll.set_timer(Self::TICK_IDENT, tick_token, tick_secs as i64 * 1000, false)?;
        Ok(Self {
            async_ident: Self::ASYNC_IDENT,
            async_token,
        })
    }

    pub fn drain_tick(&self) {}

    pub fn drain_async(&self) {}

    pub fn arm_async_ms(&self, epoll: &Epoll, remain_ms: u64) -> Result<()> {
        epoll.set_timer(self.async_ident, self.async_token, remain_ms.max(1) as i64, true)
    }

    pub fn disarm_async(&self, epoll: &Epoll) -> Result<()> {
        epoll.cancel_timer(self.async_ident);
        Ok(())
    }
}
