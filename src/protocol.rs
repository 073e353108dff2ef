//! HAT command/reply framing.
//!
//! Request: `[0xDB][opcode][len lo][len hi][payload...]`
//! Reply:   `[0xDB][opcode][status][len lo][len hi][payload...]`
//!
//! Replies are clocked out of the device a chunk at a time, so the parser is
//! run repeatedly over a growing buffer until it reports a complete frame.

use crate::errors::{HatError, Result};

pub const MSG_START: u8 = 0xDB;

pub const TX_HEADER_SIZE: usize = 4;
pub const RX_HEADER_SIZE: usize = 5;

/// Largest request payload the firmware accepts.
pub const MAX_TX_DATA_SIZE: usize = 256;

/// Largest single transfer the spidev driver allows.
pub const MAX_SPI_TRANSFER: usize = 4096;

// Firmware opcodes shared by the scanning boards
pub const CMD_AIN_SCAN_START: u8 = 0x11;
pub const CMD_AIN_SCAN_STATUS: u8 = 0x12;
pub const CMD_AIN_SCAN_DATA: u8 = 0x13;
pub const CMD_AIN_SCAN_STOP: u8 = 0x14;
pub const CMD_AIN_CLOCK_CONFIG_R: u8 = 0x15; // synchronized-clock boards only
pub const CMD_AIN_CLOCK_CONFIG_W: u8 = 0x16; // synchronized-clock boards only
pub const CMD_TRIGGER_CONFIG_W: u8 = 0x18; // synchronized-clock boards only
pub const CMD_ID: u8 = 0x41;

// Firmware reply status codes
const FW_RES_SUCCESS: u8 = 0x00;
const FW_RES_BAD_PARAMETER: u8 = 0x02;
const FW_RES_BUSY: u8 = 0x03;
const FW_RES_TIMEOUT: u8 = 0x05;

/// Build a request frame.
pub fn encode_request(opcode: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_TX_DATA_SIZE {
        return Err(HatError::bad_param(format!(
            "payload of {} bytes exceeds {MAX_TX_DATA_SIZE}",
            payload.len()
        )));
    }
    let len = payload.len() as u16;
    let mut frame = Vec::with_capacity(TX_HEADER_SIZE + payload.len());
    frame.push(MSG_START);
    frame.push(opcode);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Build a reply frame. Used by the simulated device.
pub fn encode_reply(opcode: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u16;
    let mut frame = Vec::with_capacity(RX_HEADER_SIZE + payload.len());
    frame.push(MSG_START);
    frame.push(opcode);
    frame.push(status);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Location of a complete reply inside a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyFrame {
    pub start: usize,
    pub len: usize,
}

impl ReplyFrame {
    pub fn opcode(&self, buf: &[u8]) -> u8 {
        buf[self.start + 1]
    }

    pub fn status(&self, buf: &[u8]) -> u8 {
        buf[self.start + 2]
    }

    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start + RX_HEADER_SIZE..self.start + self.len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Start,
    Opcode,
    Status,
    CountLow,
    CountHigh,
    Data,
}

/// Scan `buf` for a complete reply frame.
///
/// Returns `None` until the start marker, header and `len` payload bytes have
/// all arrived.
pub fn parse_reply(buf: &[u8]) -> Option<ReplyFrame> {
    let mut state = ParseState::Start;
    let mut start = 0usize;
    let mut count = 0usize;
    let mut seen = 0usize;

    for (index, &byte) in buf.iter().enumerate() {
        match state {
            ParseState::Start => {
                if byte == MSG_START {
                    start = index;
                    state = ParseState::Opcode;
                }
            }
            ParseState::Opcode => state = ParseState::Status,
            ParseState::Status => state = ParseState::CountLow,
            ParseState::CountLow => {
                count = byte as usize;
                state = ParseState::CountHigh;
            }
            ParseState::CountHigh => {
                count |= (byte as usize) << 8;
                if count == 0 {
                    return Some(ReplyFrame {
                        start,
                        len: RX_HEADER_SIZE,
                    });
                }
                seen = 0;
                state = ParseState::Data;
            }
            ParseState::Data => {
                seen += 1;
                if seen >= count {
                    return Some(ReplyFrame {
                        start,
                        len: RX_HEADER_SIZE + count,
                    });
                }
            }
        }
    }
    None
}

/// Map a firmware status byte onto the engine's error taxonomy.
pub fn check_status(status: u8) -> Result<()> {
    match status {
        FW_RES_SUCCESS => Ok(()),
        FW_RES_BAD_PARAMETER => Err(HatError::bad_param("rejected by device")),
        FW_RES_TIMEOUT => Err(HatError::Timeout),
        FW_RES_BUSY => Err(HatError::Busy),
        other => Err(HatError::Undefined(other)),
    }
}
