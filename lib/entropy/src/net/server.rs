//! Platform-agnostic local server contract and the Unix domain socket
//! implementation.

use crate::config::{ConnectionConfig, ConnectionType, LocalServerConfig};
use crate::error::{Error, NetResult};
use crate::net::manager::{ConnectionHandle, ConnectionManager};
use std::sync::Arc;

/// Accepts local IPC connections and adopts them into a connection manager.
///
/// `accept` blocks until a peer connects or `close` is called;
/// implementations poll a shutdown flag on a bounded interval so `close`
/// unblocks them promptly.
pub trait LocalServer: Send + Sync {
    /// Binds the endpoint and starts listening.
    fn listen(&self) -> NetResult<()>;

    /// Blocks until a peer connects, returning the adopted connection's
    /// handle, or fails with `ConnectionClosed` once the server is closed.
    fn accept(&self) -> NetResult<ConnectionHandle>;

    /// Stops listening and cancels an in-flight accept. Idempotent.
    fn close(&self) -> NetResult<()>;

    fn is_listening(&self) -> bool;
}

/// Creates the platform-appropriate local server for the endpoint.
pub fn create_local_server(
    manager: Arc<ConnectionManager>,
    endpoint: impl Into<String>,
) -> NetResult<Box<dyn LocalServer>> {
    create_local_server_with_config(manager, endpoint, LocalServerConfig::default())
}

/// Creates a local server with explicit configuration.
#[cfg(unix)]
pub fn create_local_server_with_config(
    manager: Arc<ConnectionManager>,
    endpoint: impl Into<String>,
    config: LocalServerConfig,
) -> NetResult<Box<dyn LocalServer>> {
    Ok(Box::new(unix_server::UnixSocketServer::new(manager, endpoint, config)))
}

#[cfg(not(unix))]
pub fn create_local_server_with_config(
    _manager: Arc<ConnectionManager>,
    _endpoint: impl Into<String>,
    _config: LocalServerConfig,
) -> NetResult<Box<dyn LocalServer>> {
    Err(Error::invalid_parameter("No local server implementation for this platform"))
}

#[cfg(unix)]
mod unix_server {
    use super::*;
    use crate::net::unix::UnixSocketConnection;
    use enthalpy::logging::{self, Logger};
    use std::io;
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::Mutex;

    pub struct UnixSocketServer {
        manager: Arc<ConnectionManager>,
        socket_path: String,
        config: LocalServerConfig,
        listener: Mutex<Option<UnixListener>>,
        listener_fd: AtomicI32,
        listening: AtomicBool,
        log: Logger,
    }

    impl UnixSocketServer {
        pub fn new(
            manager: Arc<ConnectionManager>,
            socket_path: impl Into<String>,
            config: LocalServerConfig,
        ) -> UnixSocketServer {
            let log = manager.logger().new(logging::o!());
            UnixSocketServer {
                manager,
                socket_path: socket_path.into(),
                config,
                listener: Mutex::new(None),
                listener_fd: AtomicI32::new(-1),
                listening: AtomicBool::new(false),
                log,
            }
        }

        fn poll_accept(&self, fd: RawFd) -> NetResult<Option<RawFd>> {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };

            let rc = unsafe { libc::poll(&mut pfd, 1, self.config.accept_poll_interval_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(None);
                }
                return Err(Error::network(format!("Poll failed during accept: {}", err)));
            }

            if rc == 0 || pfd.revents & libc::POLLIN == 0 {
                // Timeout; loop so the listening flag is re-checked.
                return Ok(None);
            }

            let client = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if client < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    // Spurious wakeup or signal; keep polling.
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                    _ => Err(Error::network(format!("Accept failed: {}", err))),
                };
            }

            Ok(Some(client))
        }
    }

    impl LocalServer for UnixSocketServer {
        fn listen(&self) -> NetResult<()> {
            if self.listening.load(Ordering::Acquire) {
                return Err(Error::invalid_parameter("Already listening"));
            }

            if self.config.unlink_on_start {
                let _ = std::fs::remove_file(&self.socket_path);
            }

            let listener = UnixListener::bind(&self.socket_path)
                .map_err(|err| Error::connection_closed(format!("Failed to bind socket: {}", err)))?;
            listener.set_nonblocking(true).map_err(Error::from)?;

            if self.config.chmod_mode >= 0 {
                use std::os::unix::fs::PermissionsExt;
                let permissions = std::fs::Permissions::from_mode(self.config.chmod_mode as u32);
                std::fs::set_permissions(&self.socket_path, permissions).map_err(Error::from)?;
            }

            logging::info!(self.log, "server listening"; "path" => &self.socket_path);

            self.listener_fd.store(listener.as_raw_fd(), Ordering::Release);
            *self.listener.lock().unwrap() = Some(listener);
            self.listening.store(true, Ordering::Release);

            Ok(())
        }

        fn accept(&self) -> NetResult<ConnectionHandle> {
            if !self.listening.load(Ordering::Acquire) {
                return Err(Error::connection_closed("Server is not listening"));
            }

            while self.listening.load(Ordering::Acquire) {
                let fd = self.listener_fd.load(Ordering::Acquire);
                if fd < 0 {
                    break;
                }

                let polled = match self.poll_accept(fd) {
                    Ok(polled) => polled,
                    // A poll error against a just-closed listener is an
                    // orderly shutdown, not a failure.
                    Err(_) if !self.listening.load(Ordering::Acquire) => break,
                    Err(err) => return Err(err),
                };

                match polled {
                    Some(client) => {
                        let config = ConnectionConfig::local(&self.socket_path);
                        let backend = UnixSocketConnection::from_accepted(client, "accepted", &config, &self.log)?;

                        logging::debug!(self.log, "connection accepted"; "path" => &self.socket_path);
                        return self
                            .manager
                            .adopt_connection(Box::new(backend), ConnectionType::Local);
                    }
                    None => continue,
                }
            }

            Err(Error::connection_closed("Server closed while waiting for connections"))
        }

        fn close(&self) -> NetResult<()> {
            if !self.listening.swap(false, Ordering::AcqRel) {
                return Ok(());
            }

            self.listener_fd.store(-1, Ordering::Release);
            // Dropping the listener closes the socket and unblocks the next
            // accept poll round.
            *self.listener.lock().unwrap() = None;

            let _ = std::fs::remove_file(&self.socket_path);
            logging::info!(self.log, "server closed"; "path" => &self.socket_path);

            Ok(())
        }

        fn is_listening(&self) -> bool {
            self.listening.load(Ordering::Acquire)
        }
    }

    impl Drop for UnixSocketServer {
        fn drop(&mut self) {
            let _ = self.close();
        }
    }
}
