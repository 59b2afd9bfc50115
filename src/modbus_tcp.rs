use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::PollError;
use crate::connection::{Connection, ConnectionConfig, Connector, TransportError};
use crate::unit::{self, FunctionCode, ProtocolError};

const MBAP_HEADER_LEN: usize = 7;

/// Opens [`TcpConnection`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn open(&self, config: &ConnectionConfig) -> Result<TcpConnection, TransportError> {
        TcpConnection::open(config)
    }
}

/// Blocking Modbus TCP client connection
pub struct TcpConnection {
    stream: Option<TcpStream>,
    transaction_id: u16,
    timeout: Duration,
}

impl TcpConnection {
    pub fn open(config: &ConnectionConfig) -> Result<TcpConnection, TransportError> {
        let target = config.to_string();
        let addrs = (config.host(), config.port())
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(target.clone(), e))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.timeout()) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(config.timeout()))?;
                    stream.set_write_timeout(Some(config.timeout()))?;
                    stream.set_nodelay(true)?;
                    debug!("connected to {} ({})", target, addr);
                    return Ok(TcpConnection {
                        stream: Some(stream),
                        transaction_id: 0,
                        timeout: config.timeout(),
                    });
                }
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(TransportError::Connect(target, e)),
            None => Err(TransportError::NoAddress(target)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read_frame(&mut self, deadline: Instant) -> Result<Vec<u8>, PollError> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        let mut frame = vec![0u8; MBAP_HEADER_LEN];
        read_until(stream, &mut frame, deadline, timeout)?;

        let body_len = frame_body_len(&frame)?;
        frame.resize(MBAP_HEADER_LEN + body_len, 0);
        read_until(stream, &mut frame[MBAP_HEADER_LEN..], deadline, timeout)?;
        Ok(frame)
    }
}

impl Connection for TcpConnection {
    fn execute(
        &mut self,
        unit_id: u8,
        function: FunctionCode,
        start_addr: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, PollError> {
        let deadline = Instant::now() + self.timeout;
        let transaction_id = self.transaction_id.wrapping_add(1);
        let pdu = unit::create_read_request(function, start_addr, quantity);
        let request = wrap_tcp(transaction_id, unit_id, &pdu);

        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        stream.write_all(&request).map_err(TransportError::Io)?;
        self.transaction_id = transaction_id;
        debug!(
            "sent {} request #{} (unit {}, address {}, quantity {})",
            function, transaction_id, unit_id, start_addr, quantity
        );

        let frame = self.read_frame(deadline)?;
        let pdu = unwrap_tcp(&frame, transaction_id, unit_id)?;
        Ok(unit::parse_read_response(function, quantity, pdu)?)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                // The peer may already have dropped the socket
                debug!("shutdown failed: {}", e);
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Prepends the MBAP header to a PDU.
pub fn wrap_tcp(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());

    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);

    frame
}

/// Validates the MBAP header of a response and returns its PDU.
pub fn unwrap_tcp(frame: &[u8], transaction_id: u16, unit_id: u8) -> Result<&[u8], ProtocolError> {
    let expected_len = MBAP_HEADER_LEN + frame_body_len(frame)?;
    if frame.len() < expected_len {
        return Err(ProtocolError::FrameTooShort);
    }

    let received_tid = u16::from_be_bytes([frame[0], frame[1]]);
    if received_tid != transaction_id {
        return Err(ProtocolError::TransactionIdMismatch {
            expected: transaction_id,
            received: received_tid,
        });
    }

    if frame[6] != unit_id {
        return Err(ProtocolError::UnitIdMismatch {
            expected: unit_id,
            received: frame[6],
        });
    }

    Ok(&frame[MBAP_HEADER_LEN..expected_len])
}

/// Number of PDU bytes announced by an MBAP header.
fn frame_body_len(header: &[u8]) -> Result<usize, ProtocolError> {
    if header.len() < MBAP_HEADER_LEN {
        return Err(ProtocolError::FrameTooShort);
    }

    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    if protocol_id != 0 {
        return Err(ProtocolError::InvalidProtocolId(protocol_id));
    }

    // Length counts the unit id plus the PDU, and a PDU has at least a function code
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if length < 2 {
        return Err(ProtocolError::FrameTooShort);
    }
    Ok(length - 1)
}

/// Fills `buf`, giving up once `deadline` passes however the bytes trickle in.
fn read_until(
    stream: &mut TcpStream,
    buf: &mut [u8],
    deadline: Instant,
    timeout: Duration,
) -> Result<(), PollError> {
    let timed_out = || {
        warn!("no response within {:?}", timeout);
        PollError::Protocol(ProtocolError::Timeout(timeout))
    };

    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out());
        }
        stream
            .set_read_timeout(Some(remaining))
            .map_err(TransportError::Io)?;

        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(TransportError::ClosedByPeer.into()),
            Ok(n) => filled += n,
            Err(e) => match e.kind() {
                io::ErrorKind::Interrupted => {}
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => return Err(timed_out()),
                _ => return Err(TransportError::Io(e).into()),
            },
        }
    }
    Ok(())
}
