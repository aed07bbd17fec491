//! Modbus RTU framing as carried over BLE notifications.
//!
//! Requests go out as a single characteristic write. Responses arrive split
//! over any number of notifications, so decoding is done against an
//! accumulating [`FrameBuffer`] and must be repeatable until enough bytes are
//! present.
//!
//! Read response layout:
//!
//! Start Byte | End Byte     | Meaning
//! 0          | 0            | Unit id of the responding device
//! 1          | 1            | Function code (high bit set for an exception)
//! 2          | 2            | The length in bytes of the register data
//! 3          | x            | The register data, big endian words
//! x+1        | x+2          | A MODBUS CRC over the bytes 0-x, little endian

use crc16::{State, MODBUS};

use crate::error::{GatewayError, Result};

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Devices in this family answer broadcast reads with "acknowledge" instead of data.
pub const BROADCAST_UNIT_ID: u8 = 0xFF;

/// The Modbus limit on registers per read request.
pub const MAX_READ_WORDS: u16 = 125;

const EXCEPTION_FLAG: u8 = 0x80;
const EXCEPTION_FRAME_LEN: usize = 5;
const WRITE_ECHO_FRAME_LEN: usize = 8;

/// A complete, CRC-checked response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub unit_id: u8,
    pub function_code: u8,
    /// Register data for reads, the echoed address and value for writes.
    pub payload: Vec<u8>,
}

impl DecodedFrame {
    /// The payload as big endian registers.
    pub fn registers(&self) -> Vec<u16> {
        self.payload
            .chunks_exact(2)
            .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDecodeResult {
    /// More bytes are needed. Keep accumulating into the same buffer.
    Incomplete,
    /// The bytes can never become a valid frame. Discard them.
    Invalid(&'static str),
    Exception { unit_id: u8, function_code: u8, code: u8 },
    Complete(DecodedFrame),
}

/// What a response to a particular request must look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedResponse {
    pub unit_id: u8,
    pub function_code: u8,
    /// Register data length for reads.
    pub byte_count: Option<usize>,
}

impl ExpectedResponse {
    /// Derive the expectation from an encoded request frame.
    pub fn for_request(request: &[u8]) -> Option<Self> {
        if request.len() < 6 {
            return None;
        }
        let byte_count = match request[1] {
            READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS => {
                Some(u16::from_be_bytes([request[4], request[5]]) as usize * 2)
            }
            _ => None,
        };
        Some(Self { unit_id: request[0], function_code: request[1], byte_count })
    }
}

/// Build a read holding registers request.
pub fn encode_read_request(unit_id: u8, start_address: u16, word_count: u16) -> Result<Vec<u8>> {
    if unit_id == BROADCAST_UNIT_ID || unit_id == 0 {
        return Err(GatewayError::InvalidConfig(format!(
            "unit id {unit_id} cannot be used for reads"
        )));
    }
    if word_count == 0 || word_count > MAX_READ_WORDS {
        return Err(GatewayError::InvalidConfig(format!(
            "cannot read {word_count} registers in one request"
        )));
    }
    let mut frame = vec![unit_id, READ_HOLDING_REGISTERS];
    frame.extend_from_slice(&start_address.to_be_bytes());
    frame.extend_from_slice(&word_count.to_be_bytes());
    Ok(with_crc(frame))
}

pub fn encode_write_single_register(unit_id: u8, register: u16, value: u16) -> Result<Vec<u8>> {
    if unit_id == 0 {
        return Err(GatewayError::InvalidConfig("unit id 0 cannot be addressed".into()));
    }
    let mut frame = vec![unit_id, WRITE_SINGLE_REGISTER];
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    Ok(with_crc(frame))
}

/// Build the response a device sends for a register read. Used by simulators.
///
/// At most [`MAX_READ_WORDS`] registers fit in one response, any beyond that are dropped.
pub fn encode_read_response(unit_id: u8, registers: &[u16]) -> Vec<u8> {
    let registers = &registers[..registers.len().min(MAX_READ_WORDS as usize)];
    let mut frame = vec![unit_id, READ_HOLDING_REGISTERS, (registers.len() * 2) as u8];
    for register in registers {
        frame.extend_from_slice(&register.to_be_bytes());
    }
    with_crc(frame)
}

pub fn encode_exception_response(unit_id: u8, function_code: u8, code: u8) -> Vec<u8> {
    with_crc(vec![unit_id, function_code | EXCEPTION_FLAG, code])
}

/// Decode a frame without knowing which request it answers.
pub fn try_decode(buffer: &[u8]) -> FrameDecodeResult {
    decode(buffer, None)
}

/// Decode a frame, rejecting anything that cannot be the answer to `expected`.
pub fn try_decode_response(buffer: &[u8], expected: &ExpectedResponse) -> FrameDecodeResult {
    decode(buffer, Some(expected))
}

fn decode(buffer: &[u8], expected: Option<&ExpectedResponse>) -> FrameDecodeResult {
    if buffer.is_empty() {
        return FrameDecodeResult::Incomplete;
    }
    if let Some(expected) = expected {
        if buffer[0] != expected.unit_id {
            return FrameDecodeResult::Invalid("Unexpected unit id");
        }
    }
    if buffer.len() < 2 {
        return FrameDecodeResult::Incomplete;
    }

    let function_code = buffer[1];
    let is_exception = function_code & EXCEPTION_FLAG != 0;
    if let Some(expected) = expected {
        if function_code & !EXCEPTION_FLAG != expected.function_code {
            return FrameDecodeResult::Invalid("Unexpected function code");
        }
    }

    let expected_len = if is_exception {
        EXCEPTION_FRAME_LEN
    } else {
        match function_code {
            READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS => {
                if buffer.len() < 3 {
                    return FrameDecodeResult::Incomplete;
                }
                let byte_count = buffer[2] as usize;
                if byte_count % 2 != 0 {
                    return FrameDecodeResult::Invalid("Odd register byte count");
                }
                if let Some(expected_count) = expected.and_then(|e| e.byte_count) {
                    if byte_count != expected_count {
                        return FrameDecodeResult::Invalid("Unexpected register byte count");
                    }
                }
                byte_count + 5
            }
            WRITE_SINGLE_REGISTER => WRITE_ECHO_FRAME_LEN,
            _ => return FrameDecodeResult::Invalid("Unsupported function code"),
        }
    };

    if buffer.len() < expected_len {
        return FrameDecodeResult::Incomplete;
    }

    if buffer.len() > expected_len {
        return FrameDecodeResult::Invalid("Too long");
    }

    let crc_actual = &buffer[buffer.len() - 2..];
    let crc_expected = crc(&buffer[0..buffer.len() - 2]);
    if crc_actual != crc_expected {
        return FrameDecodeResult::Invalid("CRC check failed");
    }

    let unit_id = buffer[0];
    if is_exception {
        return FrameDecodeResult::Exception {
            unit_id,
            function_code: function_code & !EXCEPTION_FLAG,
            code: buffer[2],
        };
    }

    let payload = match function_code {
        WRITE_SINGLE_REGISTER => buffer[2..6].to_vec(),
        _ => buffer[3..buffer.len() - 2].to_vec(),
    };
    FrameDecodeResult::Complete(DecodedFrame { unit_id, function_code, payload })
}

/// Accumulates notification fragments for one in-flight request.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
    expected: Option<ExpectedResponse>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the buffer and start waiting for the answer to `request`.
    pub fn expect_response_to(&mut self, request: &[u8]) {
        self.bytes.clear();
        self.expected = ExpectedResponse::for_request(request);
    }

    pub fn push(&mut self, fragment: &[u8]) {
        self.bytes.extend_from_slice(fragment);
    }

    pub fn try_decode(&self) -> FrameDecodeResult {
        decode(&self.bytes, self.expected.as_ref())
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.expected = None;
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Compute the CRC check value for the given bytes
fn crc(data: &[u8]) -> [u8; 2] {
    State::<MODBUS>::calculate(data).to_le_bytes()
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc(&frame);
    frame.extend_from_slice(&crc);
    frame
}

#[test]
fn test_encode_read_request() {
    // A known-good request captured from a battery BMS sharing this framing
    let frame = encode_read_request(0x01, 0xd026, 0x0019).unwrap();
    assert_eq!(frame, vec![0x01, 0x03, 0xd0, 0x26, 0x00, 0x19, 0x5d, 0x0b]);
}

#[test]
fn test_encode_rejects_broadcast_and_bad_counts() {
    assert!(encode_read_request(BROADCAST_UNIT_ID, 0x0100, 10).is_err());
    assert!(encode_read_request(0, 0x0100, 10).is_err());
    assert!(encode_read_request(0x20, 0x0100, 0).is_err());
    assert!(encode_read_request(0x20, 0x0100, MAX_READ_WORDS + 1).is_err());
}

#[test]
fn test_try_decode_happy() {
    let message =
        hex::decode("010318240c000002a7000000000000000000000000000000000000bc90").unwrap();
    let payload = hex::decode("240c000002a7000000000000000000000000000000000000").unwrap();
    assert_eq!(
        try_decode(&message),
        FrameDecodeResult::Complete(DecodedFrame { unit_id: 1, function_code: 3, payload })
    );
}

#[test]
fn test_try_decode_incomplete() {
    let message = hex::decode("010318240c000002a700000000000000000000000000000000bc").unwrap();
    assert_eq!(try_decode(&message), FrameDecodeResult::Incomplete);
    assert_eq!(try_decode(&message[..2]), FrameDecodeResult::Incomplete);
    assert_eq!(try_decode(&[]), FrameDecodeResult::Incomplete);
}

#[test]
fn test_try_decode_bad_crc() {
    let message =
        hex::decode("010318240c000002a7000000000000000000000000000000000000bc91").unwrap();
    assert_eq!(try_decode(&message), FrameDecodeResult::Invalid("CRC check failed"));
}

#[test]
fn test_try_decode_too_long() {
    let mut message = encode_read_response(0x20, &[1, 2]);
    message.push(0x00);
    assert_eq!(try_decode(&message), FrameDecodeResult::Invalid("Too long"));
}

#[test]
fn test_try_decode_exception() {
    let message = encode_exception_response(0x20, READ_HOLDING_REGISTERS, 0x06);
    assert_eq!(
        try_decode(&message),
        FrameDecodeResult::Exception { unit_id: 0x20, function_code: READ_HOLDING_REGISTERS, code: 0x06 }
    );
}

#[test]
fn test_try_decode_write_echo() {
    let request = encode_write_single_register(0x61, 0x010a, 0x0001).unwrap();
    let expected = ExpectedResponse::for_request(&request).unwrap();
    match try_decode_response(&request, &expected) {
        FrameDecodeResult::Complete(frame) => {
            assert_eq!(frame.function_code, WRITE_SINGLE_REGISTER);
            assert_eq!(frame.payload, vec![0x01, 0x0a, 0x00, 0x01]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_decode_is_idempotent_on_incomplete() {
    let message = encode_read_response(0x20, &[0x1234, 0x5678]);
    let partial = &message[..5];
    assert_eq!(try_decode(partial), FrameDecodeResult::Incomplete);
    assert_eq!(try_decode(partial), FrameDecodeResult::Incomplete);
    assert_eq!(partial, &message[..5]);
}

#[test]
fn test_round_trip_against_request() {
    for (unit_id, start, count) in [(0x01u8, 0x0000u16, 1u16), (0x20, 0x0fa0, 10), (0x61, 0x0100, 34), (0xf7, 0xffff, 125)] {
        let request = encode_read_request(unit_id, start, count).unwrap();
        let registers: Vec<u16> = (0..count).map(|i| i.wrapping_mul(257) ^ start).collect();
        let response = encode_read_response(unit_id, &registers);
        let expected = ExpectedResponse::for_request(&request).unwrap();
        match try_decode_response(&response, &expected) {
            FrameDecodeResult::Complete(frame) => {
                assert_eq!(frame.unit_id, unit_id);
                assert_eq!(frame.registers(), registers);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn test_any_corrupted_byte_is_invalid() {
    let request = encode_read_request(0x20, 0x0fa0, 10).unwrap();
    let expected = ExpectedResponse::for_request(&request).unwrap();
    let response = encode_read_response(0x20, &[230, 150, 1200, 80, 5000, 262, 251, 5000, 640, 0]);
    for index in 0..response.len() {
        for flip in [0x01u8, 0x10, 0x80, 0xff] {
            let mut corrupted = response.clone();
            corrupted[index] ^= flip;
            assert!(
                matches!(try_decode_response(&corrupted, &expected), FrameDecodeResult::Invalid(_)),
                "byte {index} ^ {flip:#04x} was not rejected"
            );
        }
    }
}

#[test]
fn test_fragmentation_invariance() {
    let request = encode_read_request(0x61, 0x0100, 10).unwrap();
    let response = encode_read_response(0x61, &[87, 132, 250, 0x1419, 0, 0, 0, 190, 120, 228]);
    let whole = try_decode(&response);

    for chunk_size in 1..=response.len() {
        let mut buffer = FrameBuffer::new();
        buffer.expect_response_to(&request);
        let mut completed = Vec::new();
        for chunk in response.chunks(chunk_size) {
            buffer.push(chunk);
            match buffer.try_decode() {
                FrameDecodeResult::Incomplete => {}
                other => completed.push(other),
            }
        }
        assert_eq!(completed, vec![whole.clone()], "chunk size {chunk_size}");
    }
}

#[test]
fn test_checksum() {
    let payload = [
        0x01, 0x03, 0x18, 0x24, 0x0c, 0x00, 0x00, 0x02, 0xa7, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    let expected = 0x90bc;
    assert_eq!(State::<MODBUS>::calculate(&payload), expected);
}

#[test]
fn test_read_response_is_limited_to_one_frame() {
    let registers = vec![0x1234u16; 200];
    let frame = encode_read_response(0x20, &registers);
    assert_eq!(frame[2] as usize, MAX_READ_WORDS as usize * 2);
    assert_eq!(frame.len(), MAX_READ_WORDS as usize * 2 + 5);
    match try_decode(&frame) {
        FrameDecodeResult::Complete(decoded) => assert_eq!(decoded.registers().len(), MAX_READ_WORDS as usize),
        other => panic!("unexpected {other:?}"),
    }
}
