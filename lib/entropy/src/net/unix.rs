//! Unix domain socket transport backend.
//!
//! Sockets run non-blocking. Sends block with bounded `poll(2)` waits; a
//! dedicated receive thread drains the socket through the frame decoder and
//! dispatches payloads through the callback hub.

use crate::config::{ConnectionConfig, ConnectionType};
use crate::error::{Error, NetResult};
use crate::net::connection::{
    CallbackHub, ConnectionState, ConnectionStats, MessageCallback, NetworkConnection, StatCounters,
    StateCallback, StateCell,
};
use crate::net::framing::{encode_header, FrameReader, FRAME_HEADER_SIZE};
use enthalpy::logging::{self, Logger};
use enthalpy::time;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const RECV_BUF_SIZE: usize = 65536;

/// Waits for readiness on `fd`, retrying on EINTR. Returns false on poll
/// timeout.
fn wait_fd(fd: RawFd, events: libc::c_short, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };

    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

fn set_cloexec_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_socket_buffer(fd: RawFd, option: libc::c_int, size: i32) {
    if size > 0 {
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                &size as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            );
        }
    }
}

/// Builds a `sockaddr_un` for the given path, rejecting paths that do not
/// fit the fixed-size `sun_path` field.
fn socket_address(path: &str) -> NetResult<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(Error::invalid_parameter("Socket path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len();
    Ok((addr, len as libc::socklen_t))
}

pub struct UnixSocketConnection {
    endpoint: String,
    connect_timeout_ms: i32,
    send_poll_timeout_ms: i32,
    send_max_polls: i32,
    recv_idle_poll_ms: i32,
    max_message_size: usize,
    socket_send_buf: i32,
    socket_recv_buf: i32,

    stream: Mutex<Option<UnixStream>>,
    fd: AtomicI32,
    state: Arc<StateCell>,
    hub: Arc<CallbackHub>,
    stats: Arc<StatCounters>,
    should_stop: Arc<AtomicBool>,
    receive_thread: Mutex<Option<thread::JoinHandle<()>>>,
    log: Logger,
}

impl UnixSocketConnection {
    /// A client-side connection to `endpoint`, not yet connected.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: &ConnectionConfig, log: L) -> UnixSocketConnection {
        UnixSocketConnection {
            endpoint: config.endpoint.clone(),
            connect_timeout_ms: config.connect_timeout_ms,
            send_poll_timeout_ms: config.send_poll_timeout_ms,
            send_max_polls: config.send_max_polls,
            recv_idle_poll_ms: config.recv_idle_poll_ms,
            max_message_size: config.max_message_size as usize,
            socket_send_buf: config.socket_send_buf,
            socket_recv_buf: config.socket_recv_buf,
            stream: Mutex::new(None),
            fd: AtomicI32::new(-1),
            state: Arc::new(StateCell::new(ConnectionState::Disconnected)),
            hub: Arc::new(CallbackHub::new()),
            stats: Arc::new(StatCounters::default()),
            should_stop: Arc::new(AtomicBool::new(false)),
            receive_thread: Mutex::new(None),
            log: logging::child(log),
        }
    }

    /// Wraps an already-connected socket accepted by a server. The
    /// connection starts in `Connected` with its receive thread running.
    pub fn from_accepted<'a, L: Into<Option<&'a Logger>>>(
        fd: RawFd,
        peer: impl Into<String>,
        config: &ConnectionConfig,
        log: L,
    ) -> NetResult<UnixSocketConnection> {
        set_cloexec_nonblocking(fd).map_err(Error::from)?;

        let connection = UnixSocketConnection {
            endpoint: peer.into(),
            connect_timeout_ms: config.connect_timeout_ms,
            send_poll_timeout_ms: config.send_poll_timeout_ms,
            send_max_polls: config.send_max_polls,
            recv_idle_poll_ms: config.recv_idle_poll_ms,
            max_message_size: config.max_message_size as usize,
            socket_send_buf: config.socket_send_buf,
            socket_recv_buf: config.socket_recv_buf,
            stream: Mutex::new(Some(unsafe { UnixStream::from_raw_fd(fd) })),
            fd: AtomicI32::new(fd),
            state: Arc::new(StateCell::new(ConnectionState::Connected)),
            hub: Arc::new(CallbackHub::new()),
            stats: Arc::new(StatCounters::default()),
            should_stop: Arc::new(AtomicBool::new(false)),
            receive_thread: Mutex::new(None),
            log: logging::child(log),
        };

        connection.stats.connect_time.store(time::timestamp_millis(), Ordering::Release);
        connection.spawn_receive_thread()?;
        Ok(connection)
    }

    fn spawn_receive_thread(&self) -> NetResult<()> {
        let stream = {
            let guard = self.stream.lock().unwrap();
            guard
                .as_ref()
                .ok_or_else(|| Error::connection_closed("No socket to receive on"))?
                .try_clone()
                .map_err(Error::from)?
        };

        let state = self.state.clone();
        let hub = self.hub.clone();
        let stats = self.stats.clone();
        let should_stop = self.should_stop.clone();
        let max_message_size = self.max_message_size;
        let recv_idle_poll_ms = self.recv_idle_poll_ms;
        let log = self.log.new(logging::o!());

        let handle = thread::Builder::new()
            .name("entropy-recv".to_string())
            .spawn(move || {
                receive_loop(
                    stream,
                    state,
                    hub,
                    stats,
                    should_stop,
                    max_message_size,
                    recv_idle_poll_ms,
                    log,
                )
            })
            .map_err(Error::from)?;

        *self.receive_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn fail_connect(&self, fd: RawFd, error: Error) -> Error {
        unsafe { libc::close(fd) };
        self.state.transition(ConnectionState::Failed, &self.hub);
        logging::warn!(self.log, "connect failed";
                       "endpoint" => &self.endpoint,
                       "error" => %error);
        error
    }

    /// Writes the whole buffer, waiting for writability with bounded polls
    /// whenever the socket pushes back.
    fn write_all_polled(&self, stream: &UnixStream, mut buf: &[u8]) -> NetResult<()> {
        let fd = stream.as_raw_fd();
        let mut poll_timeouts = 0;

        while !buf.is_empty() {
            match (&*stream).write(buf) {
                Ok(0) => return Err(Error::connection_closed("Socket wrote zero bytes")),
                Ok(written) => {
                    buf = &buf[written..];
                    poll_timeouts = 0;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let ready = wait_fd(fd, libc::POLLOUT, self.send_poll_timeout_ms)
                        .map_err(|err| Error::connection_closed(format!("Poll failed during send: {}", err)))?;
                    if !ready {
                        poll_timeouts += 1;
                        if poll_timeouts > self.send_max_polls {
                            logging::warn!(self.log, "send timeout"; "endpoint" => &self.endpoint);
                            return Err(Error::timeout("Send timeout"));
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    return Err(Error::connection_closed(format!("Failed to send data: {}", err)));
                }
            }
        }

        Ok(())
    }

    fn send_frame(&self, data: &[u8]) -> NetResult<()> {
        if self.state.get() != ConnectionState::Connected {
            return Err(Error::connection_closed("Not connected"));
        }

        if data.len() > self.max_message_size {
            return Err(Error::invalid_parameter("Message too large"));
        }

        let guard = self.stream.lock().unwrap();
        let stream = guard
            .as_ref()
            .ok_or_else(|| Error::connection_closed("Not connected"))?;

        self.write_all_polled(stream, &encode_header(data.len()))?;
        self.write_all_polled(stream, data)?;

        self.stats
            .bytes_sent
            .fetch_add((FRAME_HEADER_SIZE + data.len()) as u64, Ordering::Relaxed);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.touch(time::timestamp_millis());

        Ok(())
    }
}

impl NetworkConnection for UnixSocketConnection {
    fn connect(&self) -> NetResult<()> {
        if self.state.get() != ConnectionState::Disconnected {
            return Err(Error::invalid_parameter("Already connected or connecting"));
        }

        self.state.transition(ConnectionState::Connecting, &self.hub);
        logging::info!(self.log, "connecting"; "endpoint" => &self.endpoint);

        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            self.state.transition(ConnectionState::Failed, &self.hub);
            return Err(Error::connection_closed(format!("Failed to create socket: {}", err)));
        }

        if let Err(err) = set_cloexec_nonblocking(fd) {
            return Err(self.fail_connect(fd, Error::connection_closed(format!("fcntl failed: {}", err))));
        }

        set_socket_buffer(fd, libc::SO_SNDBUF, self.socket_send_buf);
        set_socket_buffer(fd, libc::SO_RCVBUF, self.socket_recv_buf);

        let (addr, addr_len) = match socket_address(&self.endpoint) {
            Ok(addr) => addr,
            Err(err) => return Err(self.fail_connect(fd, err)),
        };

        let rc = unsafe { libc::connect(fd, &addr as *const libc::sockaddr_un as *const libc::sockaddr, addr_len) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINPROGRESS) {
                // Wait for the connect to complete, bounded by the timeout.
                match wait_fd(fd, libc::POLLOUT, self.connect_timeout_ms) {
                    Ok(true) => {}
                    Ok(false) => return Err(self.fail_connect(fd, Error::timeout("Connection timeout"))),
                    Err(err) => {
                        return Err(self.fail_connect(
                            fd,
                            Error::connection_closed(format!("Poll failed during connect: {}", err)),
                        ))
                    }
                }

                let mut so_error: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut so_error as *mut libc::c_int as *mut libc::c_void,
                        &mut len,
                    )
                };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    return Err(self.fail_connect(fd, Error::connection_closed(format!("getsockopt failed: {}", err))));
                }
                if so_error != 0 {
                    let err = io::Error::from_raw_os_error(so_error);
                    return Err(self.fail_connect(fd, Error::connection_closed(format!("Connection failed: {}", err))));
                }
            } else {
                return Err(self.fail_connect(fd, Error::connection_closed(format!("Failed to connect: {}", err))));
            }
        }

        *self.stream.lock().unwrap() = Some(unsafe { UnixStream::from_raw_fd(fd) });
        self.fd.store(fd, Ordering::Release);

        self.should_stop.store(false, Ordering::Release);
        self.state.transition(ConnectionState::Connected, &self.hub);
        self.stats.connect_time.store(time::timestamp_millis(), Ordering::Release);
        logging::info!(self.log, "connected"; "endpoint" => &self.endpoint);

        self.spawn_receive_thread()
    }

    fn disconnect(&self) -> NetResult<()> {
        if self.state.get() == ConnectionState::Disconnected {
            return Ok(());
        }

        self.state.transition(ConnectionState::Disconnecting, &self.hub);
        logging::info!(self.log, "disconnecting"; "endpoint" => &self.endpoint);

        self.should_stop.store(true, Ordering::Release);

        // Shut the socket down through the cached fd rather than the stream
        // lock: a send blocked in its poll loop holds that lock, and the
        // shutdown is what makes it fail fast.
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
        }

        if let Some(handle) = self.receive_thread.lock().unwrap().take() {
            // A disconnect triggered from inside the receive thread's own
            // dispatch cannot join itself; the thread exits right after the
            // callback returns because the stop flag is already set.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        *self.stream.lock().unwrap() = None;
        self.state.transition(ConnectionState::Disconnected, &self.hub);

        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Local
    }

    fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    fn send(&self, data: &[u8]) -> NetResult<()> {
        self.send_frame(data)
    }

    fn send_unreliable(&self, data: &[u8]) -> NetResult<()> {
        // Unix sockets are always reliable; same path as send().
        self.send_frame(data)
    }

    fn try_send(&self, data: &[u8]) -> NetResult<()> {
        if self.state.get() != ConnectionState::Connected {
            return Err(Error::connection_closed("Not connected"));
        }
        if data.len() > self.max_message_size {
            return Err(Error::invalid_parameter("Message too large"));
        }
        // Without an internal send queue a partial non-blocking write would
        // corrupt the framing, so backpressure is always reported.
        Err(Error::would_block("Non-blocking send not supported for Unix sockets"))
    }

    fn set_message_callback(&self, callback: MessageCallback) {
        self.hub.set_message_callback(callback);
    }

    fn set_state_callback(&self, callback: StateCallback) {
        self.hub.set_state_callback(callback);
    }

    fn shutdown_callbacks(&self) {
        self.hub.shutdown();
    }
}

impl Drop for UnixSocketConnection {
    fn drop(&mut self) {
        let _ = self.disconnect();
        // No callback may run past this point; the receive thread is joined
        // and in-flight dispatches have drained.
        self.hub.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn receive_loop(
    stream: UnixStream,
    state: Arc<StateCell>,
    hub: Arc<CallbackHub>,
    stats: Arc<StatCounters>,
    should_stop: Arc<AtomicBool>,
    max_message_size: usize,
    recv_idle_poll_ms: i32,
    log: Logger,
) {
    let fd = stream.as_raw_fd();
    let mut reader = FrameReader::new(max_message_size);
    let mut buf = vec![0u8; RECV_BUF_SIZE];

    while !should_stop.load(Ordering::Acquire) && state.get() == ConnectionState::Connected {
        match (&stream).read(&mut buf) {
            Ok(0) => break, // peer closed
            Ok(received) => {
                stats.bytes_received.fetch_add(received as u64, Ordering::Relaxed);
                stats.touch(time::timestamp_millis());

                let result = reader.push(&buf[..received], |payload| {
                    stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    hub.dispatch_message(&payload);
                });

                if let Err(err) = result {
                    logging::warn!(log, "frame limit exceeded"; "error" => %err);
                    state.transition(ConnectionState::Failed, &hub);
                    return;
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                if recv_idle_poll_ms >= 0 {
                    let _ = wait_fd(fd, libc::POLLIN, recv_idle_poll_ms);
                } else {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                logging::warn!(log, "receive error"; "error" => %err);
                state.transition(ConnectionState::Failed, &hub);
                return;
            }
        }
    }

    if state.get() == ConnectionState::Connected {
        state.transition(ConnectionState::Disconnected, &hub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::sync::atomic::AtomicUsize;

    fn config() -> ConnectionConfig {
        let mut config = ConnectionConfig::local("test-pair");
        config.send_poll_timeout_ms = 50;
        config.send_max_polls = 20;
        config.recv_idle_poll_ms = 10;
        config
    }

    fn connected_pair() -> (UnixSocketConnection, UnixSocketConnection) {
        let (a, b) = UnixStream::pair().unwrap();
        let a = UnixSocketConnection::from_accepted(a.into_raw_fd(), "pair-a", &config(), None).unwrap();
        let b = UnixSocketConnection::from_accepted(b.into_raw_fd(), "pair-b", &config(), None).unwrap();
        (a, b)
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) -> bool {
        for _ in 0..200 {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        predicate()
    }

    #[test]
    fn test_send_delivers_framed_message() {
        let (a, b) = connected_pair();

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        b.set_message_callback(Arc::new(move |payload: &[u8]| {
            r.lock().unwrap().push(payload.to_vec());
        }));

        a.send(b"ping").unwrap();
        assert!(wait_for(|| !received.lock().unwrap().is_empty()));
        assert_eq!(received.lock().unwrap()[0], b"ping");

        let stats = a.stats();
        assert_eq!(stats.messages_sent, 1);
        assert!(stats.bytes_sent >= 4 + 4);

        assert!(wait_for(|| b.stats().messages_received == 1));
    }

    #[test]
    fn test_send_when_disconnected_fails() {
        let (a, _b) = connected_pair();
        a.disconnect().unwrap();

        let err = a.send(b"ping").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectionClosed);
    }

    #[test]
    fn test_oversize_send_is_invalid_parameter() {
        let (a, _b) = connected_pair();
        let big = vec![0u8; a.max_message_size + 1];
        let err = a.send(&big).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_try_send_reports_would_block() {
        let (a, _b) = connected_pair();
        let err = a.try_send(b"ping").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_peer_close_transitions_to_disconnected() {
        let (a, b) = connected_pair();

        let states = Arc::new(Mutex::new(Vec::new()));
        let s = states.clone();
        a.set_state_callback(Arc::new(move |state| {
            s.lock().unwrap().push(state);
        }));

        b.disconnect().unwrap();
        assert!(wait_for(|| a.state() == ConnectionState::Disconnected));
        assert!(states.lock().unwrap().contains(&ConnectionState::Disconnected));
    }

    #[test]
    fn test_oversize_incoming_header_fails_connection() {
        let (raw, peer) = UnixStream::pair().unwrap();
        let mut config = config();
        config.max_message_size = 1024;
        let conn = UnixSocketConnection::from_accepted(peer.into_raw_fd(), "victim", &config, None).unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        conn.set_message_callback(Arc::new(move |_: &[u8]| {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        // Header declares one byte more than the limit.
        (&raw).write_all(&encode_header(1025)).unwrap();
        (&raw).write_all(&[0u8; 32]).unwrap();

        assert!(wait_for(|| conn.state() == ConnectionState::Failed));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (a, _b) = connected_pair();
        a.disconnect().unwrap();
        a.disconnect().unwrap();
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_large_payload_round_trips() {
        let (a, b) = connected_pair();

        let payload: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| i as u8).collect();

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        b.set_message_callback(Arc::new(move |payload: &[u8]| {
            r.lock().unwrap().push(payload.to_vec());
        }));

        a.send(&payload).unwrap();
        assert!(wait_for(|| !received.lock().unwrap().is_empty()));
        assert_eq!(received.lock().unwrap()[0], payload);
    }

    #[test]
    fn test_connect_to_missing_endpoint_fails() {
        let mut config = config();
        config.endpoint = "/tmp/entropy_no_such_socket.sock".to_string();
        config.connect_timeout_ms = 200;

        let conn = UnixSocketConnection::new(&config, None);
        assert!(conn.connect().is_err());
        assert_eq!(conn.state(), ConnectionState::Failed);
    }
}
