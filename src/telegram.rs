/*!
    telegram framing of the Basik register protocol

    a telegram on the wire looks like

    ```text
    START | ADDRESS REGISTER OPERATION LENGTH PAYLOAD.. CRC_HI CRC_LO | END
    ```

    everything between the delimiters is byte-stuffed: a reserved byte (start, end or escape) is sent as [ESCAPE] followed by the byte plus [ESCAPE_OFFSET], so delimiters never appear inside a frame body.
    The checksum is a CRC-16/XMODEM over the unstuffed header and payload, most significant byte first.
*/

use bilge::prelude::*;
use packbytes::{FromBytes, ToBytes, ByteArray};
use log::*;
use thiserror::Error;

use crate::pack_enum;


/// first byte of every frame
pub const START: u8 = 0x0D;
/// last byte of every frame
pub const END: u8 = 0x0A;
/// introduces a stuffed byte
pub const ESCAPE: u8 = 0x5E;
/// added to a reserved byte when it is stuffed
pub const ESCAPE_OFFSET: u8 = 0x40;

/// maximum number of payload bytes a telegram can carry
pub const MAX_PAYLOAD: usize = 240;
const _: () = assert!(MAX_PAYLOAD <= u8::MAX as usize);

/// size of the fixed header following the start delimiter
pub const HEADER: usize = <Header as FromBytes>::Bytes::SIZE;
/// size of the checksum trailer
pub const CHECKSUM: usize = 2;
/// longest possible frame on the wire, with every body byte stuffed
pub const MAX_FRAME: usize = 2 + 2 * (HEADER + MAX_PAYLOAD + CHECKSUM);

const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);


/// fixed header of a telegram, packed in declaration order
#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default, PartialEq)]
pub struct Header {
    /// module the telegram is addressed to or coming from
    pub address: u8,
    /// register accessed in that module
    pub register: u8,
    /// what is requested or answered
    pub operation: Operation,
    /// number of payload bytes following this header
    pub length: u8,
}

/// operation code of a telegram
#[bitsize(8)]
#[derive(Copy, Clone, Default, FromBits, Debug, PartialEq, Eq)]
pub enum Operation {
    /// module refused the request, for instance an unknown register
    Nack = 0x00,
    /// module received a request with a bad checksum
    CrcError = 0x01,
    /// module cannot process the request right now
    Busy = 0x02,
    /// module accepted a write
    Ack = 0x03,
    /// host asks for the content of a register
    #[default]
    Read = 0x04,
    /// host sets the content of a register
    Write = 0x05,
    /// module answers a read with the register content
    Datagram = 0x08,
    #[fallback]
    Unknown = 0xFF,
}
pack_enum!(Operation);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Operation {
    pub fn direction(self) -> Direction {
        match self {
            Operation::Read | Operation::Write => Direction::Request,
            _ => Direction::Response,
        }
    }
}


/// error raised when decoding bytes received from the bus
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// no complete frame yet, keep reading
    #[error("more bytes are needed to complete a telegram")]
    Incomplete,
    #[error("malformed telegram: {0}")]
    Malformed(&'static str),
    #[error("checksum mismatch, computed {expected:#06x} but received {received:#06x}")]
    ChecksumMismatch {expected: u16, received: u16},
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("payload of {0} bytes exceeds the {MAX_PAYLOAD} bytes a telegram can carry")]
pub struct PayloadTooLong(pub usize);


/// one complete message of the protocol, request or response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Telegram {
    pub address: u8,
    pub register: u8,
    pub operation: Operation,
    pub payload: heapless::Vec<u8, MAX_PAYLOAD>,
}

impl Telegram {
    pub fn new(address: u8, register: u8, operation: Operation, payload: &[u8]) -> Result<Self, PayloadTooLong> {
        let payload = heapless::Vec::from_slice(payload)
            .map_err(|_| PayloadTooLong(payload.len()))?;
        Ok(Self {address, register, operation, payload})
    }
    pub fn header(&self) -> Header {
        Header {
            address: self.address,
            register: self.register,
            operation: self.operation,
            // payload capacity fits in a byte
            length: self.payload.len() as u8,
        }
    }
    pub fn direction(&self) -> Direction {
        self.operation.direction()
    }
    /// checksum transmitted with this telegram
    pub fn checksum(&self) -> u16 {
        checksum(&self.body())
    }
    /// complete stuffed frame ready to be written on the bus
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body();
        frame(&body, checksum(&body))
    }
    /// frame carrying an arbitrary checksum, used to emulate transmission errors
    #[cfg(any(test, feature = "simulator"))]
    pub(crate) fn encode_with_checksum(&self, checksum: u16) -> Vec<u8> {
        frame(&self.body(), checksum)
    }
    /**
        true if this telegram is the module's response to the given request

        a read is answered by a datagram and a write by an acknowledge, any request can be refused with a nack, busy or crc error
    */
    pub fn answers(&self, request: &Telegram) -> bool {
        let paired = match (request.operation, self.operation) {
            (_, Operation::Nack | Operation::Busy | Operation::CrcError) => true,
            (Operation::Read, Operation::Datagram) => true,
            (Operation::Write, Operation::Ack) => true,
            _ => false,
        };
        paired
        && request.direction() == Direction::Request
        && self.address == request.address
        && self.register == request.register
    }

    fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(HEADER + self.payload.len());
        body.extend_from_slice(&self.header().to_be_bytes());
        body.extend_from_slice(&self.payload);
        body
    }
}

/// build a complete frame for the given fields
pub fn encode(address: u8, register: u8, operation: Operation, payload: &[u8]) -> Result<Vec<u8>, PayloadTooLong> {
    Ok(Telegram::new(address, register, operation, payload)?.encode())
}

/// decode a single frame held entirely in `frame`
pub fn decode(frame: &[u8]) -> Result<Telegram, DecodeError> {
    let mut decoder = Decoder::new();
    decoder.extend(frame);
    decoder.decode()
}

/// CRC-16/XMODEM as used by the protocol
pub fn checksum(data: &[u8]) -> u16 {
    CRC.checksum(data)
}

/// true for bytes that must be stuffed inside a frame body
pub fn is_reserved(byte: u8) -> bool {
    matches!(byte, START | END | ESCAPE)
}

/// delimit and stuff an unstuffed body with the given checksum
fn frame(body: &[u8], checksum: u16) -> Vec<u8> {
    let trailer = checksum.to_be_bytes();
    let mut frame = Vec::with_capacity(2 * (body.len() + CHECKSUM) + 2);
    frame.push(START);
    for &byte in body.iter().chain(trailer.iter()) {
        if is_reserved(byte) {
            frame.push(ESCAPE);
            frame.push(byte + ESCAPE_OFFSET);
        }
        else {
            frame.push(byte);
        }
    }
    frame.push(END);
    frame
}


/**
    incremental telegram decoder

    bytes are appended with [Decoder::extend] as they come from the bus, and [Decoder::decode] is called until it returns [DecodeError::Incomplete].
    Bytes preceding a start delimiter are dropped, and a frame interrupted by a new start delimiter is dropped as malformed so decoding resynchronizes on the next frame.
*/
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {buffer: Vec::with_capacity(MAX_FRAME)}
    }
    /// append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }
    /// number of bytes waiting to be decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
    /// forget all bytes received so far
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// try to extract the next telegram from the bytes received so far
    pub fn decode(&mut self) -> Result<Telegram, DecodeError> {
        // discard garbage until a frame starts
        match self.buffer.iter().position(|&byte| byte == START) {
            Some(0) => {},
            Some(start) => {
                trace!("discard {} bytes preceding start delimiter", start);
                self.buffer.drain(.. start);
            },
            None => {
                if !self.buffer.is_empty()
                    {trace!("discard {} bytes without start delimiter", self.buffer.len())}
                self.buffer.clear();
                return Err(DecodeError::Incomplete)
            },
        }
        // find where the frame ends
        let Some(end) = self.buffer[1 ..].iter()
            .position(|&byte| byte == END || byte == START)
            .map(|index| index + 1)
        else {
            if self.buffer.len() > MAX_FRAME {
                self.buffer.clear();
                return Err(DecodeError::Malformed("frame exceeds maximum length"))
            }
            return Err(DecodeError::Incomplete)
        };
        if self.buffer[end] == START {
            // keep the new start delimiter, the previous frame was cut
            self.buffer.drain(.. end);
            return Err(DecodeError::Malformed("frame interrupted by a start delimiter"))
        }
        let frame: Vec<u8> = self.buffer.drain(..= end).collect();
        parse(&frame[1 .. end])
    }
}

/// interpret the stuffed content between delimiters
fn parse(stuffed: &[u8]) -> Result<Telegram, DecodeError> {
    let body = unstuff(stuffed)?;
    if body.len() < HEADER + CHECKSUM
        {return Err(DecodeError::Malformed("frame too short"))}

    // integrity first, so any corrupted byte is reported as such
    let (content, trailer) = body.split_at(body.len() - CHECKSUM);
    let received = u16::from_be_bytes([trailer[0], trailer[1]]);
    let expected = checksum(content);
    if received != expected
        {return Err(DecodeError::ChecksumMismatch {expected, received})}

    let [address, register, operation, length, payload @ ..] = content
        else {return Err(DecodeError::Malformed("frame too short"))};
    let header = Header::from_be_bytes([*address, *register, *operation, *length]);
    if header.operation == Operation::Unknown
        {return Err(DecodeError::Malformed("unknown operation"))}
    if usize::from(header.length) != payload.len()
        {return Err(DecodeError::Malformed("length field disagrees with payload"))}

    Ok(Telegram {
        address: header.address,
        register: header.register,
        operation: header.operation,
        payload: heapless::Vec::from_slice(payload)
            .map_err(|_| DecodeError::Malformed("payload too long"))?,
    })
}

fn unstuff(stuffed: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut body = Vec::with_capacity(stuffed.len());
    let mut bytes = stuffed.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            let Some(&next) = bytes.next()
                else {return Err(DecodeError::Malformed("dangling escape"))};
            let unescaped = next.wrapping_sub(ESCAPE_OFFSET);
            if !is_reserved(unescaped)
                {return Err(DecodeError::Malformed("invalid escape sequence"))}
            body.push(unescaped);
        }
        else {
            body.push(byte);
        }
    }
    Ok(body)
}
