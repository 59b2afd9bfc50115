use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Unit id every poll request is addressed to.
pub const UNIT_ID: u8 = 1;

/// First item address every poll request reads from.
pub const START_ADDRESS: u16 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame too short")]
    FrameTooShort,

    #[error("Invalid protocol ID: {0}")]
    InvalidProtocolId(u16),

    #[error("Transaction ID mismatch: expected {expected}, received {received}")]
    TransactionIdMismatch { expected: u16, received: u16 },

    #[error("Unit ID mismatch: expected {expected}, received {received}")]
    UnitIdMismatch { expected: u8, received: u8 },

    #[error("Empty response received")]
    EmptyResponse,

    #[error("Modbus exception: function code {0:#x}, exception code {1:#x}")]
    ModbusException(u8, u8),

    #[error("Unexpected function code: expected {0:#x}, got {1:#x}")]
    UnexpectedFunctionCode(u8, u8),

    #[error("Invalid response length")]
    InvalidResponseLength,

    #[error("No response within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Host is empty")]
    EmptyHost,

    #[error("Invalid port: {0}, expected 1..=65535")]
    InvalidPort(u16),

    #[error("Response timeout must be positive")]
    InvalidTimeout,

    #[error("Poll cycle must be positive")]
    InvalidCycle,

    #[error("Invalid quantity {quantity} for {function}: expected 1..={max}")]
    InvalidQuantity {
        function: FunctionCode,
        quantity: u16,
        max: u16,
    },

    #[error("Unknown function code: {0}")]
    UnknownFunctionCode(String),
}

/// The four Modbus read operations a session can poll with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
}

impl FunctionCode {
    pub const ALL: [FunctionCode; 4] = [
        FunctionCode::ReadCoils,
        FunctionCode::ReadDiscreteInputs,
        FunctionCode::ReadHoldingRegisters,
        FunctionCode::ReadInputRegisters,
    ];

    /// Function code byte on the wire.
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadCoils => 0x01,
            FunctionCode::ReadDiscreteInputs => 0x02,
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
        }
    }

    /// Largest quantity a single request may ask for.
    pub fn max_quantity(self) -> u16 {
        if self.is_bit_access() { 2000 } else { 125 }
    }

    pub fn is_bit_access(self) -> bool {
        matches!(self, FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs)
    }

    pub fn name(self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "coils",
            FunctionCode::ReadDiscreteInputs => "discrete-inputs",
            FunctionCode::ReadHoldingRegisters => "holding-registers",
            FunctionCode::ReadInputRegisters => "input-registers",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FunctionCode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FunctionCode::ALL
            .into_iter()
            .find(|function| function.name() == s)
            .ok_or_else(|| ConfigurationError::UnknownFunctionCode(s.to_string()))
    }
}

/// What one polling run reads on every cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadSpec {
    function: FunctionCode,
    unit_id: u8,
    start_addr: u16,
    quantity: u16,
}

impl ReadSpec {
    pub fn new(function: FunctionCode, quantity: u16) -> Result<ReadSpec, ConfigurationError> {
        let max = function.max_quantity();
        if quantity == 0 || quantity > max {
            return Err(ConfigurationError::InvalidQuantity { function, quantity, max });
        }
        Ok(ReadSpec {
            function,
            unit_id: UNIT_ID,
            start_addr: START_ADDRESS,
            quantity,
        })
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn start_addr(&self) -> u16 {
        self.start_addr
    }

    pub fn quantity(&self) -> u16 {
        self.quantity
    }
}

/// Builds the PDU of a read request: function code, start address, quantity.
pub fn create_read_request(function: FunctionCode, start_addr: u16, quantity: u16) -> Vec<u8> {
    let mut msg: [u8; 5] = [0; 5];
    msg[0] = function.code();
    msg[1] = (start_addr >> 8) as u8;
    msg[2] = start_addr as u8;
    msg[3] = (quantity >> 8) as u8;
    msg[4] = quantity as u8;
    Vec::from(msg)
}

/// Parses the PDU of a read response into `quantity` values.
///
/// Bit reads produce one value (0 or 1) per coil or input.
pub fn parse_read_response(
    function: FunctionCode,
    quantity: u16,
    pdu: &[u8],
) -> Result<Vec<u16>, ProtocolError> {
    if pdu.is_empty() {
        return Err(ProtocolError::EmptyResponse);
    }

    let function_code = pdu[0];

    // Exception responses echo the function code with the high bit set
    if (function_code & 0x80) != 0 {
        let exception_code = if pdu.len() > 1 { pdu[1] } else { 0 };
        return Err(ProtocolError::ModbusException(function_code, exception_code));
    }

    let expected_fc = function.code();
    if function_code != expected_fc {
        return Err(ProtocolError::UnexpectedFunctionCode(expected_fc, function_code));
    }

    if function.is_bit_access() {
        parse_bits(quantity, pdu)
    } else {
        parse_registers(quantity, pdu)
    }
}

fn parse_registers(quantity: u16, pdu: &[u8]) -> Result<Vec<u16>, ProtocolError> {
    if pdu.len() < 2 {
        return Err(ProtocolError::InvalidResponseLength);
    }

    let byte_count = pdu[1] as usize;
    let expected_bytes = quantity as usize * 2;

    if byte_count != expected_bytes || pdu.len() < 2 + byte_count {
        return Err(ProtocolError::InvalidResponseLength);
    }

    let result = pdu[2..2 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(result)
}

fn parse_bits(quantity: u16, pdu: &[u8]) -> Result<Vec<u16>, ProtocolError> {
    if pdu.len() < 2 {
        return Err(ProtocolError::InvalidResponseLength);
    }

    let byte_count = pdu[1] as usize;
    let expected_bytes = (quantity as usize).div_ceil(8);

    if byte_count != expected_bytes || pdu.len() < 2 + byte_count {
        return Err(ProtocolError::InvalidResponseLength);
    }

    let result = (0..quantity as usize)
        .map(|i| ((pdu[2 + i / 8] >> (i % 8)) & 0x01) as u16)
        .collect();
    Ok(result)
}
