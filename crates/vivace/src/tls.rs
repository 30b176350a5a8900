use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use libc::c_int;
use rustls::{ServerConfig, ServerConnection};

use crate::error::{Error, Result};

/// Outcome codes shared by every adapter operation. `NoImpl` is only ever
/// produced by [`TlsSession::write_file`] and tells the reactor to fall back
/// to generator streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    Success,
    WantRead,
    WantWrite,
    Closed,
    Syscall,
    Fatal,
    NoImpl,
}

/// Server-side TLS context: one per server, shared read-only by all workers.
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl TlsContext {
    /// Build from PEM cert chain + private key. TLS 1.2 is the floor (the
    /// rustls defaults); ALPN pins http/1.1.
    pub fn from_pem_files(cert_path: &str, key_path: &str) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<io::Result<Vec<_>>>()?;
        if certs.is_empty() {
            return Err(Error::Tls(format!("no certificates found in {cert_path}")));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| Error::Tls(format!("no private key found in {key_path}")))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Wrap an accepted socket in a fresh session. `None` mirrors an
    /// allocation/setup failure; the caller closes the socket.
    pub fn wrap(&self, fd: c_int) -> Option<Box<TlsSession>> {
        let mut conn = ServerConnection::new(Arc::clone(&self.config)).ok()?;
        conn.set_buffer_limit(Some(64 * 1024));
        Some(Box::new(TlsSession {
            conn,
            fd,
            close_notify_sent: false,
        }))
    }
}

/// Raw-fd shim for the rustls record layer; would-block surfaces as
/// `ErrorKind::WouldBlock`, exactly what the non-blocking loops expect.
struct SockIo {
    fd: c_int,
}

impl Read for SockIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        crate::syscalls::recv(self.fd, buf)
    }
}

impl Write for SockIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        crate::syscalls::send(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One TLS session over one connection, owned by the connection context.
pub struct TlsSession {
    conn: ServerConnection,
    fd: c_int,
    close_notify_sent: bool,
}

impl TlsSession {
    /// Drive the handshake as far as the socket allows.
    pub fn handshake(&mut self) -> TlsStatus {
        let mut sock = SockIo { fd: self.fd };

        loop {
            if !self.conn.is_handshaking() {
                return self.flush_records(&mut sock);
            }

            if self.conn.wants_write() {
                match self.conn.write_tls(&mut sock) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TlsStatus::WantWrite,
                    Err(_) => return TlsStatus::Syscall,
                }
            }

            if self.conn.wants_read() {
                match self.conn.read_tls(&mut sock) {
                    Ok(0) => return TlsStatus::Closed,
                    Ok(_) => match self.conn.process_new_packets() {
                        Ok(_) => continue,
                        Err(_) => return TlsStatus::Fatal,
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TlsStatus::WantRead,
                    Err(_) => return TlsStatus::Syscall,
                }
            }

            return TlsStatus::Fatal;
        }
    }

    /// Decrypt into `buf`. `(Success, n)` with n > 0, or a code describing
    /// why no plaintext is available.
    pub fn read(&mut self, buf: &mut [u8]) -> (TlsStatus, usize) {
        let mut sock = SockIo { fd: self.fd };

        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return (TlsStatus::Closed, 0),
                Ok(n) => return (TlsStatus::Success, n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No buffered plaintext; pull more records off the wire
                    match self.conn.read_tls(&mut sock) {
                        Ok(0) => return (TlsStatus::Closed, 0),
                        Ok(_) => match self.conn.process_new_packets() {
                            Ok(_) => continue,
                            Err(_) => return (TlsStatus::Fatal, 0),
                        },
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return (TlsStatus::WantRead, 0),
                        Err(_) => return (TlsStatus::Syscall, 0),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return (TlsStatus::Closed, 0),
                Err(_) => return (TlsStatus::Fatal, 0),
            }
        }
    }

    /// Encrypt and send as much of `buf` as possible. `(WantWrite, n)` means
    /// `n` bytes were consumed but encrypted records are still queued; the
    /// caller must call [`Self::flush`] (or write again) once the socket is
    /// writable before treating the response as sent.
    pub fn write(&mut self, buf: &[u8]) -> (TlsStatus, usize) {
        let mut sock = SockIo { fd: self.fd };

        // Never consume new plaintext while old records are stuck
        match self.flush_records(&mut sock) {
            TlsStatus::Success => {}
            other => return (other, 0),
        }

        let n = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(_) => return (TlsStatus::Fatal, 0),
        };

        match self.flush_records(&mut sock) {
            TlsStatus::Success => (TlsStatus::Success, n),
            other => (other, n),
        }
    }

    /// Push queued records to the socket; `Success` means the record layer
    /// is empty.
    pub fn flush(&mut self) -> TlsStatus {
        let mut sock = SockIo { fd: self.fd };
        self.flush_records(&mut sock)
    }

    /// Kernel zero-copy is not possible through the record layer; the
    /// reactor switches the transfer to a pread-driven stream.
    pub fn write_file(&mut self, _fd: c_int, _offset: i64, _len: u64) -> TlsStatus {
        TlsStatus::NoImpl
    }

    /// Graceful close: queue close_notify once, then drain it. The caller
    /// drops the session on `Success` or `Fatal`.
    pub fn shutdown(&mut self) -> TlsStatus {
        if !self.close_notify_sent {
            self.conn.send_close_notify();
            self.close_notify_sent = true;
        }

        let mut sock = SockIo { fd: self.fd };
        self.flush_records(&mut sock)
    }

    fn flush_records(&mut self, sock: &mut SockIo) -> TlsStatus {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TlsStatus::WantWrite,
                Err(_) => return TlsStatus::Syscall,
            }
        }
        TlsStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_files_error_out() {
        assert!(TlsContext::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem").is_err());
    }

    #[test]
    fn empty_pem_is_rejected() {
        let dir = std::env::temp_dir().join(format!("vivace-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.pem");
        std::fs::write(&cert, "").unwrap();
        let err = TlsContext::from_pem_files(cert.to_str().unwrap(), cert.to_str().unwrap());
        assert!(err.is_err());
    }
}
