//! Byte-stream view of the stack's single TCP connection

use core::fmt;

use embedded_hal_async::delay::DelayNs;
use embedded_io_async::{ErrorKind, ErrorType, Read, Write};
use log::warn;

use crate::net::context::NetworkContext;
use crate::net::stack::NetworkStack;

/// Errors of the connection byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// The stack refused the call or is gone
    Stack,
    /// The connection closed while sending
    Closed,
    /// The deadline passed before the transfer finished
    TimedOut,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stack => write!(f, "stack error"),
            Self::Closed => write!(f, "connection closed"),
            Self::TimedOut => write!(f, "connection timed out"),
        }
    }
}

impl core::error::Error for ConnectionError {}

impl embedded_io_async::Error for ConnectionError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Stack => ErrorKind::Other,
            Self::Closed => ErrorKind::BrokenPipe,
            Self::TimedOut => ErrorKind::TimedOut,
        }
    }
}

/// The open TCP connection, read and written by polling the stack.
///
/// The packet pump moves the segments; this only copies bytes in and out of
/// the stack's socket buffers and sleeps while there is nothing to do.
///
/// All sleeps count against one deadline, shared by every read and write
/// until [`TcpConnection::rearm`] starts a new one.
pub struct TcpConnection<'c, S, D> {
    ctx: &'c NetworkContext<S>,
    delay: &'c mut D,
    poll_interval_ms: u32,
    timeout_ms: u32,
    waited_ms: u32,
}

impl<'c, S: NetworkStack, D: DelayNs> TcpConnection<'c, S, D> {
    pub fn new(
        ctx: &'c NetworkContext<S>,
        delay: &'c mut D,
        poll_interval_ms: u32,
        timeout_ms: u32,
    ) -> Self {
        Self {
            ctx,
            delay,
            poll_interval_ms: poll_interval_ms.max(1),
            timeout_ms,
            waited_ms: 0,
        }
    }

    /// Start a fresh deadline of the full timeout
    pub fn rearm(&mut self) {
        self.waited_ms = 0;
    }

    async fn wait(&mut self) -> Result<(), ConnectionError> {
        if self.waited_ms >= self.timeout_ms {
            return Err(ConnectionError::TimedOut);
        }
        self.delay.delay_ms(self.poll_interval_ms).await;
        self.waited_ms = self.waited_ms.saturating_add(self.poll_interval_ms);
        Ok(())
    }
}

impl<S, D> ErrorType for TcpConnection<'_, S, D> {
    type Error = ConnectionError;
}

impl<S: NetworkStack, D: DelayNs> Read for TcpConnection<'_, S, D> {
    /// Returns 0 once the peer has finished sending and everything buffered
    /// has been read.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let (received, state) = self
                .ctx
                .with_stack(|stack| (stack.tcp_recv(buf), stack.tcp_state()))
                .map_err(|_| ConnectionError::Stack)?;

            let n = received.map_err(|e| {
                warn!("Receiving from connection failed: {:?}", e);
                ConnectionError::Stack
            })?;
            if n > 0 {
                return Ok(n);
            }
            if state.peer_finished() {
                return Ok(0);
            }
            self.wait().await?;
        }
    }
}

impl<S: NetworkStack, D: DelayNs> Write for TcpConnection<'_, S, D> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let (sent, state) = self
                .ctx
                .with_stack(|stack| (stack.tcp_send(buf), stack.tcp_state()))
                .map_err(|_| ConnectionError::Stack)?;

            let n = sent.map_err(|e| {
                warn!("Sending on connection failed: {:?}", e);
                ConnectionError::Stack
            })?;
            if n > 0 {
                return Ok(n);
            }
            if state.is_closed() {
                return Err(ConnectionError::Closed);
            }
            // Send buffer full
            self.wait().await?;
        }
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
