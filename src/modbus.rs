//! Modbus TCP transport and batch reader for the Sinapsi Alfa
//!
//! The transport speaks MBAP-framed "read holding registers" requests
//! directly over a [`TcpStream`]. Owning the framing (instead of delegating
//! to a protocol crate) is what makes desync recovery possible: the reader
//! can drain stray bytes without closing the socket, verify transaction
//! identifiers on every reply, and hard-reset the connection when the device
//! keeps answering out of step.
//!
//! Retry policy lives in [`AlfaModbusClient`]; the transport itself never
//! retries.

use crate::error::{AlfaError, Result};
use crate::logging::get_logger;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Attempts per batch before the cycle fails
pub const MAX_READ_ATTEMPTS: u32 = 3;
/// Fixed delay between retry attempts
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Per-cycle protocol-error count at which a retry hard-resets the connection
pub const PROTOCOL_ERROR_RESET_THRESHOLD: u32 = 3;
/// Per-cycle protocol-error count at which the whole cycle aborts
pub const PROTOCOL_ERROR_LIMIT: u32 = 5;
/// Settle delay between close and reopen during a hard reset, letting
/// device-side buffers clear
pub const RESET_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Modbus "read holding registers" function code
const FN_READ_HOLDING: u8 = 0x03;
/// MBAP header length in bytes
const MBAP_HEADER_LEN: usize = 7;

/// Wire-level fault, classified so the retry loop can branch on kind
#[derive(Debug)]
pub enum WireFault {
    /// Socket-level failure: refused, reset, broken pipe, not connected
    Connection(String),
    /// No reply within the per-request timeout
    Timeout,
    /// Reply carried a transaction id we did not send
    TransactionMismatch { expected: u16, actual: u16 },
    /// Reply violated the MBAP/PDU framing rules
    Malformed(String),
    /// Device rejected the request semantically (Modbus exception code)
    Exception(u8),
}

impl WireFault {
    /// Transient wire noise worth retrying; device exceptions are
    /// deterministic and are not
    pub fn is_transient(&self) -> bool {
        !matches!(self, WireFault::Exception(_))
    }

    /// Whether this fault counts against the per-cycle protocol-error budget
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            WireFault::Timeout | WireFault::TransactionMismatch { .. } | WireFault::Malformed(_)
        )
    }
}

impl std::fmt::Display for WireFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireFault::Connection(msg) => write!(f, "connection failure: {}", msg),
            WireFault::Timeout => write!(f, "request timed out"),
            WireFault::TransactionMismatch { expected, actual } => {
                write!(
                    f,
                    "transaction id mismatch (expected {}, got {})",
                    expected, actual
                )
            }
            WireFault::Malformed(msg) => write!(f, "malformed reply: {}", msg),
            WireFault::Exception(code) => write!(f, "device exception 0x{:02X}", code),
        }
    }
}

/// Connection health, owned by the transport layer and reset per cycle
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    /// Whether the last cycle reached the device
    pub healthy: bool,
    /// Timestamp of the last successful batch read
    pub last_success: Option<DateTime<Utc>>,
    /// Protocol errors accumulated in the current cycle (shared across
    /// batches, reset only between cycles)
    pub protocol_errors: u32,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            healthy: false,
            last_success: None,
            protocol_errors: 0,
        }
    }
}

/// Raw MBAP transport: socket lifecycle plus one framed request/reply
pub struct AlfaTransport {
    host: String,
    port: u16,
    unit_id: u8,
    request_timeout: Duration,
    stream: Option<TcpStream>,
    next_transaction_id: u16,
}

impl AlfaTransport {
    /// Create an unconnected transport
    pub fn new(host: &str, port: u16, unit_id: u8, request_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            unit_id,
            request_timeout,
            stream: None,
            next_transaction_id: 1,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether a socket is currently open
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Liveness probe: raw TCP connect-and-close within the timeout.
    /// Refusal and timeout both map to `false`; this never errors.
    pub async fn probe(&self) -> bool {
        matches!(
            timeout(self.request_timeout, TcpStream::connect(self.address())).await,
            Ok(Ok(_))
        )
    }

    /// Open the device connection. Idempotent: an already-open socket is
    /// left untouched.
    pub async fn open(&mut self) -> std::result::Result<(), WireFault> {
        if self.stream.is_some() {
            return Ok(());
        }
        match timeout(self.request_timeout, TcpStream::connect(self.address())).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                self.stream = Some(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(WireFault::Connection(e.to_string())),
            Err(_) => Err(WireFault::Timeout),
        }
    }

    /// Close the device connection. Tolerates an already-closed socket.
    pub async fn close(&mut self) {
        if let Some(_stream) = self.stream.take() {
            // Dropped here; the kernel sends the FIN for us
        }
    }

    /// Drain unread bytes without closing the socket, the cheap first-line
    /// recovery for desynchronized replies. Returns the number of bytes
    /// discarded.
    pub async fn flush(&mut self) -> usize {
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };
        let mut discarded = 0usize;
        let mut buf = [0u8; 256];
        loop {
            match stream.try_read(&mut buf) {
                Ok(0) => break, // peer closed; the next read will fault
                Ok(n) => discarded += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        discarded
    }

    /// Hard reset: close, settle, reopen. The settle delay lets device-side
    /// buffers clear before the new connection.
    pub async fn reset(&mut self) -> std::result::Result<(), WireFault> {
        self.close().await;
        sleep(RESET_SETTLE_DELAY).await;
        self.open().await
    }

    /// One framed "read holding registers" request, no retries
    pub async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, WireFault> {
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1).max(1);

        let unit_id = self.unit_id;
        let request_timeout = self.request_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| WireFault::Connection("not connected".to_string()))?;

        // MBAP(7) + PDU(5)
        let request = [
            (transaction_id >> 8) as u8,
            transaction_id as u8,
            0x00,
            0x00,
            0x00,
            0x06,
            unit_id,
            FN_READ_HOLDING,
            (address >> 8) as u8,
            address as u8,
            (count >> 8) as u8,
            count as u8,
        ];

        match timeout(request_timeout, stream.write_all(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(WireFault::Connection(e.to_string())),
            Err(_) => return Err(WireFault::Timeout),
        }

        let mut header = [0u8; MBAP_HEADER_LEN];
        match timeout(request_timeout, stream.read_exact(&mut header)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(WireFault::Connection(e.to_string())),
            Err(_) => return Err(WireFault::Timeout),
        }

        let reply_transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let remaining = u16::from_be_bytes([header[4], header[5]]) as usize;

        if protocol_id != 0 {
            return Err(WireFault::Malformed(format!(
                "protocol id {} is not Modbus TCP",
                protocol_id
            )));
        }
        // Unit id + function code at minimum; 250 bytes of data at most
        if !(2..=2 + 250).contains(&remaining) {
            return Err(WireFault::Malformed(format!(
                "implausible frame length {}",
                remaining
            )));
        }

        let mut pdu = vec![0u8; remaining - 1];
        match timeout(request_timeout, stream.read_exact(&mut pdu)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(WireFault::Connection(e.to_string())),
            Err(_) => return Err(WireFault::Timeout),
        }

        if reply_transaction_id != transaction_id {
            return Err(WireFault::TransactionMismatch {
                expected: transaction_id,
                actual: reply_transaction_id,
            });
        }

        let function = pdu[0];
        if function == FN_READ_HOLDING | 0x80 {
            let code = pdu.get(1).copied().unwrap_or(0);
            return Err(WireFault::Exception(code));
        }
        if function != FN_READ_HOLDING {
            return Err(WireFault::Malformed(format!(
                "unexpected function code 0x{:02X}",
                function
            )));
        }

        let byte_count = *pdu
            .get(1)
            .ok_or_else(|| WireFault::Malformed("reply missing byte count".to_string()))?
            as usize;
        if byte_count != count as usize * 2 || pdu.len() != 2 + byte_count {
            return Err(WireFault::Malformed(format!(
                "byte count {} does not match {} requested registers",
                byte_count, count
            )));
        }

        let words = pdu[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(words)
    }
}

/// Batch reader: the bounded, error-class-sensitive retry state machine
/// layered over the raw transport
pub struct AlfaModbusClient {
    transport: AlfaTransport,
    health: ConnectionHealth,
    logger: crate::logging::StructuredLogger,
}

impl AlfaModbusClient {
    /// Create a new client for one device
    pub fn new(host: &str, port: u16, unit_id: u8, request_timeout: Duration) -> Self {
        Self {
            transport: AlfaTransport::new(host, port, unit_id, request_timeout),
            health: ConnectionHealth::default(),
            logger: get_logger("modbus"),
        }
    }

    /// Current connection health
    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    /// Mutable connection health (cycle bookkeeping lives in the orchestrator)
    pub fn health_mut(&mut self) -> &mut ConnectionHealth {
        &mut self.health
    }

    /// Reset the per-cycle protocol-error counter. Called once at the start
    /// of every poll cycle, never between batches.
    pub fn begin_cycle(&mut self) {
        self.health.protocol_errors = 0;
    }

    /// Mark the cycle successful
    pub fn mark_cycle_success(&mut self) {
        self.health.healthy = true;
        self.health.last_success = Some(Utc::now());
    }

    /// Liveness probe, see [`AlfaTransport::probe`]
    pub async fn probe(&self) -> bool {
        self.transport.probe().await
    }

    /// Open the device connection
    pub async fn connect(&mut self) -> Result<()> {
        self.transport.open().await.map_err(|fault| match fault {
            WireFault::Timeout => AlfaError::timeout("connect timed out"),
            other => AlfaError::connection(other.to_string()),
        })
    }

    /// Close the device connection; idempotent and infallible
    pub async fn disconnect(&mut self) {
        self.transport.close().await;
    }

    /// Whether the socket is currently open
    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// Read one batch of holding registers with bounded retries.
    ///
    /// Error handling by class:
    /// - connection faults: wait, reconnect, retry; exhaustion fails the
    ///   cycle with a connection error and marks the link unhealthy
    /// - timeout / transaction mismatch / malformed reply: count against the
    ///   per-cycle protocol-error budget, flush (or hard-reset past the
    ///   reset threshold), wait, retry; exhaustion fails as above
    /// - device exception: deterministic, fails immediately as a Modbus error
    ///
    /// If the per-cycle budget is already spent the call fails before any
    /// bytes are written, so a thrashing device aborts the cycle early
    /// instead of burning the full retry budget on every remaining batch.
    pub async fn read_batch(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        if self.health.protocol_errors >= PROTOCOL_ERROR_LIMIT {
            return Err(AlfaError::modbus(format!(
                "protocol error budget exhausted ({} errors this cycle)",
                self.health.protocol_errors
            )));
        }

        let mut attempt = 1u32;
        loop {
            match self.transport.read_holding_registers(start, count).await {
                Ok(words) => {
                    self.logger.trace(&format!(
                        "Read batch {}+{} on attempt {}",
                        start, count, attempt
                    ));
                    return Ok(words);
                }
                Err(WireFault::Exception(code)) => {
                    self.logger.warn(&format!(
                        "Device rejected read of {}+{}: exception 0x{:02X}",
                        start, count, code
                    ));
                    return Err(AlfaError::modbus(format!(
                        "device exception 0x{:02X} reading registers {}..{}",
                        code,
                        start,
                        start + count
                    )));
                }
                Err(fault) => {
                    let protocol_error = fault.is_protocol_error();
                    if protocol_error {
                        self.health.protocol_errors += 1;
                    }
                    self.logger.warn(&format!(
                        "Batch {}+{} attempt {}/{} failed: {} (cycle protocol errors: {})",
                        start, count, attempt, MAX_READ_ATTEMPTS, fault, self.health.protocol_errors
                    ));

                    if attempt >= MAX_READ_ATTEMPTS {
                        self.health.healthy = false;
                        return Err(AlfaError::connection(format!(
                            "giving up on registers {}..{} after {} attempts: {}",
                            start,
                            start + count,
                            attempt,
                            fault
                        )));
                    }

                    if protocol_error {
                        if self.health.protocol_errors >= PROTOCOL_ERROR_RESET_THRESHOLD {
                            if let Err(e) = self.transport.reset().await {
                                self.health.healthy = false;
                                return Err(AlfaError::connection(format!(
                                    "reconnect during hard reset failed: {}",
                                    e
                                )));
                            }
                        } else {
                            let discarded = self.transport.flush().await;
                            if discarded > 0 {
                                self.logger
                                    .debug(&format!("Flushed {} stray bytes", discarded));
                            }
                        }
                        sleep(READ_RETRY_DELAY).await;
                    } else {
                        // Connection fault: drop the socket and try a fresh one
                        self.transport.close().await;
                        sleep(READ_RETRY_DELAY).await;
                        if let Err(e) = self.transport.open().await {
                            self.logger
                                .debug(&format!("Reconnect attempt failed: {}", e));
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Decode a single 16-bit register at `offset`
pub fn decode_u16(registers: &[u16], offset: usize) -> Result<u16> {
    registers
        .get(offset)
        .copied()
        .ok_or_else(|| AlfaError::modbus(format!("offset {} outside batch", offset)))
}

/// Decode a big-endian 32-bit composite: high word at `offset`, low word at
/// `offset + 1`
pub fn decode_u32(registers: &[u16], offset: usize) -> Result<u32> {
    let high = decode_u16(registers, offset)? as u32;
    let low = decode_u16(registers, offset + 1)? as u32;
    Ok((high << 16) | low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_u32_is_big_endian() {
        assert_eq!(decode_u32(&[1, 2], 0).unwrap(), 65538);
        assert_eq!(decode_u32(&[1, 65535], 0).unwrap(), 131071);
        assert_eq!(decode_u32(&[0, 42, 1, 0], 2).unwrap(), 65536);
    }

    #[test]
    fn decode_out_of_bounds_errors() {
        assert!(decode_u16(&[1, 2], 2).is_err());
        assert!(decode_u32(&[1, 2], 1).is_err());
        assert!(decode_u32(&[], 0).is_err());
    }

    #[test]
    fn fault_classification() {
        assert!(WireFault::Timeout.is_transient());
        assert!(WireFault::Timeout.is_protocol_error());
        assert!(
            WireFault::TransactionMismatch {
                expected: 1,
                actual: 2
            }
            .is_protocol_error()
        );
        assert!(WireFault::Malformed("x".to_string()).is_protocol_error());
        assert!(WireFault::Connection("refused".to_string()).is_transient());
        assert!(!WireFault::Connection("refused".to_string()).is_protocol_error());
        assert!(!WireFault::Exception(2).is_transient());
        assert!(!WireFault::Exception(2).is_protocol_error());
    }

    #[test]
    fn health_defaults_unhealthy() {
        let health = ConnectionHealth::default();
        assert!(!health.healthy);
        assert!(health.last_success.is_none());
        assert_eq!(health.protocol_errors, 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_leaves_health_unhealthy() {
        let mut client = AlfaModbusClient::new("127.0.0.1", 502, 1, Duration::from_millis(100));
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected());
        assert!(!client.health().healthy);
    }

    #[tokio::test]
    async fn exhausted_protocol_budget_aborts_before_any_wire_request() {
        let mut client = AlfaModbusClient::new("127.0.0.1", 1, 1, Duration::from_millis(100));
        client.health_mut().protocol_errors = PROTOCOL_ERROR_LIMIT;
        // No connection exists, yet the guard fires first: the error is a
        // Modbus budget error, not a connection error.
        let err = client.read_batch(2, 18).await.unwrap_err();
        assert!(matches!(err, AlfaError::Modbus { .. }));
    }

    #[tokio::test]
    async fn read_without_connection_is_a_connection_error() {
        let mut client = AlfaModbusClient::new("127.0.0.1", 1, 1, Duration::from_millis(50));
        let err = client.read_batch(2, 1).await.unwrap_err();
        assert!(matches!(err, AlfaError::Connection { .. }));
        assert!(!client.health().healthy);
    }
}
