//! One Modbus/TCP session with retry, throttled reconnect and keep-alive.
//!
//! The connection serializes all operations through a single mutex; poll
//! loops own exactly one connection, so contention is not a concern. State
//! machine: Disconnected to Connected on a successful connect; back to
//! Disconnected on read failure after retries, TCP error, or disconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use super::frame::{decode_header, decode_read_response, ReadRequest, MBAP_LEN};
use crate::core::config::ModbusDeviceConfig;
use crate::utils::{CounterSrvError, Result};

/// Minimum spacing between externally triggered connection attempts.
pub const CONNECTION_RETRY_COOLDOWN: Duration = Duration::from_secs(5);

/// Base delay of the read retry backoff.
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Backoff cap.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
#[cfg(unix)]
const KEEPALIVE_RETRIES: u32 = 3;

/// Delay after closing a socket before the slot is reused.
const POST_CLOSE_DELAY: Duration = Duration::from_millis(100);

/// Backoff before attempt `k + 1`, `min(base * 2^(k-1), 30 s)`.
pub fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    let delay = RETRY_BACKOFF_BASE.saturating_mul(factor as u32);
    delay.min(MAX_RETRY_BACKOFF)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Default)]
struct Inner {
    stream: Option<TcpStream>,
    last_attempt: Option<Instant>,
    transaction_id: u16,
}

enum ReadFailure {
    /// The device answered with a Modbus exception; the session is fine.
    Device(CounterSrvError),
    /// Socket, timeout or framing failure; the session is torn down.
    Transport(CounterSrvError),
}

/// A single Modbus/TCP client session.
#[derive(Debug)]
pub struct ModbusConnection {
    config: Arc<ModbusDeviceConfig>,
    inner: Mutex<Inner>,
}

impl ModbusConnection {
    pub fn new(config: Arc<ModbusDeviceConfig>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        if self.inner.lock().await.stream.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Establish the TCP session. No-op when already connected; within the
    /// cooldown window of the previous attempt it returns the current state
    /// without touching the socket.
    pub async fn connect(&self) -> Result<ConnectionState> {
        let mut inner = self.inner.lock().await;
        if inner.stream.is_some() {
            return Ok(ConnectionState::Connected);
        }
        if let Some(last) = inner.last_attempt {
            if last.elapsed() < CONNECTION_RETRY_COOLDOWN {
                debug!(
                    device_id = %self.config.device_id,
                    "connect throttled, {}ms since previous attempt",
                    last.elapsed().as_millis()
                );
                return Ok(ConnectionState::Disconnected);
            }
        }
        self.establish(&mut inner).await?;
        Ok(ConnectionState::Connected)
    }

    /// Read `count` holding registers starting at `start`, with the retry
    /// policy applied. Always returns the elapsed wall time alongside the
    /// outcome so the health tracker can record response durations.
    pub async fn read_registers(&self, start: u16, count: u16) -> (Result<Vec<u16>>, Duration) {
        let started = Instant::now();
        let mut inner = self.inner.lock().await;
        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = CounterSrvError::ConnectionError("no attempt made".to_string());

        for attempt in 1..=max_attempts {
            match self.try_read(&mut inner, start, count).await {
                Ok(words) => return (Ok(words), started.elapsed()),
                Err(ReadFailure::Device(err)) => {
                    // Device answered; retrying the same request will not help.
                    return (Err(err), started.elapsed());
                }
                Err(ReadFailure::Transport(err)) => {
                    warn!(
                        device_id = %self.config.device_id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "modbus read failed"
                    );
                    inner.stream = None;
                    last_error = err;
                    if attempt < max_attempts {
                        sleep(retry_delay(attempt)).await;
                    }
                }
            }
        }

        (Err(last_error), started.elapsed())
    }

    /// One-register read used as a liveness probe.
    pub async fn test_connection(&self) -> bool {
        let probe = self
            .config
            .channels
            .iter()
            .find(|c| c.enabled)
            .map(|c| c.start_register)
            .unwrap_or(0);
        self.read_registers(probe, 1).await.0.is_ok()
    }

    /// Close the session cleanly.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut stream) = inner.stream.take() {
            let _ = stream.shutdown().await;
            drop(stream);
            // Let the OS reap the socket before the slot is reused.
            sleep(POST_CLOSE_DELAY).await;
            debug!(device_id = %self.config.device_id, "modbus session closed");
        }
    }

    async fn try_read(
        &self,
        inner: &mut Inner,
        start: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, ReadFailure> {
        if inner.stream.is_none() {
            // Reconnects on the read path are paced by the retry backoff,
            // not the external connect cooldown.
            self.establish(inner)
                .await
                .map_err(ReadFailure::Transport)?;
        }

        let request = ReadRequest {
            transaction_id: inner.transaction_id,
            unit_id: self.config.unit_id,
            start,
            count,
        };
        inner.transaction_id = inner.transaction_id.wrapping_add(1);

        let io_timeout = self.config.timeout();
        let stream = inner
            .stream
            .as_mut()
            .expect("stream present after establish");

        let frame = request.encode();
        Self::with_deadline(io_timeout, stream.write_all(&frame), "request write")
            .await
            .map_err(ReadFailure::Transport)?;

        let mut header_buf = [0u8; MBAP_LEN];
        Self::with_deadline(io_timeout, stream.read_exact(&mut header_buf), "header read")
            .await
            .map_err(ReadFailure::Transport)?;
        let header = decode_header(&header_buf).map_err(ReadFailure::Transport)?;

        if header.transaction_id != request.transaction_id {
            return Err(ReadFailure::Transport(CounterSrvError::ModbusError(
                format!(
                    "transaction id mismatch: sent {}, got {}",
                    request.transaction_id, header.transaction_id
                ),
            )));
        }

        let mut pdu = vec![0u8; header.pdu_len];
        Self::with_deadline(io_timeout, stream.read_exact(&mut pdu), "response read")
            .await
            .map_err(ReadFailure::Transport)?;

        if pdu.first().is_some_and(|fc| fc & 0x80 != 0) {
            return Err(ReadFailure::Device(
                decode_read_response(&request, &pdu).unwrap_err(),
            ));
        }

        decode_read_response(&request, &pdu).map_err(ReadFailure::Transport)
    }

    async fn establish(&self, inner: &mut Inner) -> Result<()> {
        inner.last_attempt = Some(Instant::now());
        if let Some(mut old) = inner.stream.take() {
            let _ = old.shutdown().await;
        }

        let ip = self.config.ip_address.parse().map_err(|_| {
            CounterSrvError::ConfigError(format!(
                "device {}: invalid ip_address {}",
                self.config.device_id, self.config.ip_address
            ))
        })?;
        let addr = SocketAddr::new(ip, self.config.port);

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| CounterSrvError::ConnectionError(format!("socket create: {e}")))?;

        if let Some(size) = self.config.recv_buffer_size {
            socket
                .set_recv_buffer_size(size)
                .map_err(|e| CounterSrvError::ConnectionError(format!("recv buffer: {e}")))?;
        }
        if let Some(size) = self.config.send_buffer_size {
            socket
                .set_send_buffer_size(size)
                .map_err(|e| CounterSrvError::ConnectionError(format!("send buffer: {e}")))?;
        }

        let stream = match timeout(self.config.timeout(), socket.connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(CounterSrvError::ConnectionError(format!(
                    "connect {addr}: {e}"
                )))
            }
            Err(_) => {
                return Err(CounterSrvError::TimeoutError(format!(
                    "connect {addr} timed out after {}ms",
                    self.config.timeout_ms
                )))
            }
        };

        stream
            .set_nodelay(true)
            .map_err(|e| CounterSrvError::ConnectionError(format!("nodelay: {e}")))?;

        if self.config.keep_alive {
            let keepalive = {
                let ka = TcpKeepalive::new()
                    .with_time(KEEPALIVE_TIME)
                    .with_interval(KEEPALIVE_INTERVAL);
                #[cfg(unix)]
                let ka = ka.with_retries(KEEPALIVE_RETRIES);
                ka
            };
            if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                warn!(device_id = %self.config.device_id, "failed to set keep-alive: {e}");
            }
        }

        debug!(device_id = %self.config.device_id, %addr, "modbus session established");
        inner.stream = Some(stream);
        Ok(())
    }

    async fn with_deadline<T>(
        deadline: Duration,
        fut: impl std::future::Future<Output = std::io::Result<T>>,
        what: &str,
    ) -> Result<T> {
        match timeout(deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CounterSrvError::ConnectionError(format!("{what}: {e}"))),
            Err(_) => Err(CounterSrvError::TimeoutError(format!(
                "{what} timed out after {}ms",
                deadline.as_millis()
            ))),
        }
    }
}
