//! # Single Node Connection
//!
//! Purpose: Own one TCP socket plus its codec state and run commands on it.
//!
//! ## Design Principles
//! 1. **Close on Failure**: Any transport or framing error closes the socket
//!    before the error is returned, so a desynchronized stream is never reused.
//! 2. **Lazy Authentication**: The `auth` handshake runs in front of the first
//!    command after every open; the password copy is dropped once accepted.
//! 3. **Bounded Retry**: With retry enabled, one reopen-and-resend is made for
//!    transport failures; a second failure is returned as is.
//! 4. **Plain Composition**: Pools hold `Connection`s, they do not extend them.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use lkv_common::{LkvError, LkvResult, NodeConfig, Value};
use tracing::{debug, warn};

use crate::codec::{Codec, Reply};

/// Command used for health probes.
const PING_COMMAND: &str = "info";

/// One TCP connection to a node.
pub struct Connection {
    config: Arc<NodeConfig>,
    addr: String,
    stream: Option<TcpStream>,
    codec: Codec,
    // Pending credentials; `None` once the server accepted them.
    password: Option<String>,
}

impl Connection {
    /// Creates a closed connection for the node described by `config`.
    pub fn new(config: Arc<NodeConfig>) -> Self {
        let addr = config.id();
        let codec = Codec::new(config.encoding);
        Connection {
            config,
            addr,
            stream: None,
            codec,
            password: None,
        }
    }

    /// Node address this connection targets, `host:port`.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Connects to the node, trying every resolved address in turn.
    pub fn open(&mut self) -> LkvResult<()> {
        if self.is_open() {
            return Ok(());
        }

        let stream = self.connect_stream()?;
        // Small commands dominate; Nagle only adds latency here.
        stream.set_nodelay(true)?;

        self.codec.reset();
        self.password = self.config.password.clone();
        self.stream = Some(stream);
        debug!(node = %self.addr, "connection opened");
        Ok(())
    }

    fn connect_stream(&self) -> LkvResult<TcpStream> {
        let addrs: Vec<SocketAddr> = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|source| LkvError::Connect {
                addr: self.addr.clone(),
                source,
            })?
            .collect();

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for addr in addrs {
            let attempt = if self.config.connect_timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = err,
            }
        }
        Err(LkvError::Connect {
            addr: self.addr.clone(),
            source: last_err,
        })
    }

    /// Closes the socket and discards buffered protocol state.
    pub fn close(&mut self) -> LkvResult<()> {
        self.codec.reset();
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => return Ok(()),
        };
        debug!(node = %self.addr, "connection closed");
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Closes the socket on a path that is already returning another error;
    /// a failed shutdown is logged instead of replacing that error.
    pub fn close_logged(&mut self) {
        if let Err(err) = self.close() {
            warn!(node = %self.addr, error = %err, "socket shutdown failed");
        }
    }

    /// Probes the node with a lightweight introspection command.
    ///
    /// Never retries; a failed probe leaves the connection closed.
    pub fn ping(&mut self) -> bool {
        match self.attempt(&[Value::from(PING_COMMAND)]) {
            Ok(reply) => reply.is_ok(),
            Err(err) => {
                debug!(node = %self.addr, error = %err, "ping failed");
                false
            }
        }
    }

    /// Sends one command and returns the raw reply, status unchecked.
    pub fn execute(&mut self, args: &[Value]) -> LkvResult<Reply> {
        match self.attempt(args) {
            Err(err) if self.config.retry_enabled && err.is_retryable() => {
                warn!(node = %self.addr, error = %err, "command failed, reconnecting once");
                self.close_logged();
                self.open()?;
                self.attempt(args)
            }
            result => result,
        }
    }

    fn attempt(&mut self, args: &[Value]) -> LkvResult<Reply> {
        if !self.is_open() {
            return Err(LkvError::Closed);
        }
        if self.password.is_some() {
            self.authenticate()?;
        }
        self.roundtrip(args)
    }

    fn authenticate(&mut self) -> LkvResult<()> {
        let password = match self.password.as_deref() {
            Some(password) => Value::from(password),
            None => return Ok(()),
        };
        let reply = self.roundtrip(&[Value::from("auth"), password])?;
        if reply.is_ok() {
            self.password = None;
            debug!(node = %self.addr, "authenticated");
            return Ok(());
        }

        let status = reply
            .status()
            .map(|status| String::from_utf8_lossy(status).into_owned())
            .unwrap_or_else(|| "empty response".to_string());
        // Rejected credentials: this socket must not be reused.
        self.close_logged();
        Err(LkvError::Auth(status))
    }

    fn roundtrip(&mut self, args: &[Value]) -> LkvResult<Reply> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(LkvError::Closed),
        };

        let result = self
            .codec
            .send(stream, args, self.config.write_timeout)
            .and_then(|()| self.codec.receive(stream, self.config.read_timeout));

        if let Err(err) = &result {
            if err.is_connection_error() {
                debug!(node = %self.addr, error = %err, "closing connection after failure");
                self.close_logged();
            }
        }
        result
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("open", &self.is_open())
            .finish()
    }
}
