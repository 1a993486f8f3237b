/*!
    simulated module answering the register protocol

    a [Simulator] behaves like a Basik module on the other end of any async byte stream (typically one half of [tokio::io::duplex]).
    Faults can be queued to emulate a noisy or overloaded line, and every request received is logged so the host side behavior can be checked.
*/

use std::collections::{BTreeMap, VecDeque};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use log::*;

use crate::telegram::{Telegram, Operation, Direction, Decoder, DecodeError};


/// misbehavior applied to the answer of one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// lose the request, nothing is processed nor answered
    Silent,
    /// answer with a wrong checksum
    Corrupt,
    /// refuse the request because the module is busy
    Busy,
    /// claim the request arrived with a wrong checksum
    CrcError,
    /// send a datagram of the given register before the real answer
    Stale(u8),
    /// send these bytes before the real answer
    Garbage(Vec<u8>),
    /// send a response with the given operation for the requested register before the real answer
    Unexpected(Operation),
}

struct Cell {
    value: Vec<u8>,
    writable: bool,
}

/// register memory of a simulated module
pub struct Simulator {
    address: u8,
    memory: BTreeMap<u8, Cell>,
    faults: VecDeque<Fault>,
    muted: bool,
    requests: Vec<Telegram>,
}

impl Simulator {
    /// module without any register
    pub fn new(address: u8) -> Self {
        Self {
            address,
            memory: BTreeMap::new(),
            faults: VecDeque::new(),
            muted: false,
            requests: Vec::new(),
        }
    }
    /// Basik module with plausible content in every register, emission off and wavelength stabilized
    pub fn basik(address: u8) -> Self {
        Self::new(address)
            .with_register(0x17, &1000u16.to_le_bytes())
            .with_register(0x1C, &235i16.to_le_bytes())
            .with_register(0x1E, &12000u16.to_le_bytes())
            .with_writable(0x22, &1000u16.to_le_bytes())
            .with_writable(0x2A, &0i16.to_le_bytes())
            .with_register(0x2B, &0u16.to_le_bytes())
            .with_register(0x2C, &0u16.to_le_bytes())
            .with_register(0x2F, &0i16.to_le_bytes())
            .with_writable(0x30, &[0])
            .with_writable(0x31, &0u16.to_le_bytes())
            .with_writable(0x32, &10_867_700u32.to_le_bytes())
            .with_register(0x65, b"BK000042")
            .with_register(0x66, &0x4000u16.to_le_bytes())
            .with_register(0x67, &0u16.to_le_bytes())
            .with_register(0x72, &0i16.to_le_bytes())
            .with_writable(0x8D, b"Basik")
            .with_register(0x90, &1000i16.to_le_bytes())
            .with_writable(0xA0, &1000i16.to_le_bytes())
            .with_writable(0xB5, &[0])
            .with_writable(0xB7, &0u16.to_le_bytes())
            .with_writable(0xB8, &1000f32.to_le_bytes())
            .with_register(0xBA, &100f32.to_le_bytes())
    }
    /// add a read-only register with the given raw content
    pub fn with_register(mut self, register: u8, raw: &[u8]) -> Self {
        self.memory.insert(register, Cell {value: raw.to_vec(), writable: false});
        self
    }
    /// add a writable register with the given initial raw content
    pub fn with_writable(mut self, register: u8, raw: &[u8]) -> Self {
        self.memory.insert(register, Cell {value: raw.to_vec(), writable: true});
        self
    }
    /// queue a fault, applied to the next request not yet affected by a fault
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push_back(fault);
        self
    }
    /// never answer any request
    pub fn muted(self) -> Self {
        Self {muted: true, .. self}
    }

    pub fn address(&self) -> u8 {self.address}
    /// current raw content of a register
    pub fn register(&self, register: u8) -> Option<&[u8]> {
        self.memory.get(&register).map(|cell| cell.value.as_slice())
    }
    /// every request addressed to this module so far, in reception order
    pub fn requests(&self) -> &[Telegram] {
        &self.requests
    }

    /// bytes to send back for a received telegram, possibly none
    pub fn answer(&mut self, request: &Telegram) -> Vec<u8> {
        if request.address != self.address || request.direction() != Direction::Request {
            trace!("ignoring telegram {:?} for module {:#04x}", request.operation, request.address);
            return Vec::new();
        }
        self.requests.push(request.clone());
        if self.muted
            {return Vec::new()}

        // a lost or refused request is not processed
        let fault = match self.faults.pop_front() {
            Some(Fault::Silent) => return Vec::new(),
            Some(Fault::Busy) => return self.reply(request.register, Operation::Busy, &[]).encode(),
            Some(Fault::CrcError) => return self.reply(request.register, Operation::CrcError, &[]).encode(),
            fault => fault,
        };
        let response = self.process(request);
        match fault {
            None | Some(Fault::Silent | Fault::Busy | Fault::CrcError) => response.encode(),
            Some(Fault::Corrupt) => response.encode_with_checksum(!response.checksum()),
            Some(Fault::Stale(register)) => {
                let content = self.register(register).unwrap_or_default().to_vec();
                let mut bytes = self.reply(register, Operation::Datagram, &content).encode();
                bytes.extend(response.encode());
                bytes
            },
            Some(Fault::Garbage(mut bytes)) => {
                bytes.extend(response.encode());
                bytes
            },
            Some(Fault::Unexpected(operation)) => {
                let mut bytes = self.reply(request.register, operation, &[]).encode();
                bytes.extend(response.encode());
                bytes
            },
        }
    }

    /**
        answer requests received on the bus until the other end closes it

        the simulator is returned at the end for inspection
    */
    pub async fn run<B: AsyncRead + AsyncWrite + Unpin>(mut self, mut bus: B) -> Result<Self, std::io::Error> {
        let mut decoder = Decoder::new();
        let mut chunk = [0; 64];
        loop {
            match decoder.decode() {
                Ok(request) => {
                    let answer = self.answer(&request);
                    if ! answer.is_empty() {
                        bus.write_all(&answer).await?;
                        bus.flush().await?;
                    }
                },
                Err(DecodeError::Incomplete) => {
                    let size = bus.read(&mut chunk).await?;
                    if size == 0
                        {return Ok(self)}
                    decoder.extend(&chunk[.. size]);
                },
                Err(error) => debug!("simulator dropping request: {}", error),
            }
        }
    }

    fn process(&mut self, request: &Telegram) -> Telegram {
        let (operation, payload) = match (request.operation, self.memory.get_mut(&request.register)) {
            (Operation::Read, Some(cell)) => (Operation::Datagram, cell.value.clone()),
            (Operation::Write, Some(cell)) if cell.writable => {
                cell.value = request.payload.to_vec();
                (Operation::Ack, Vec::new())
            },
            _ => (Operation::Nack, Vec::new()),
        };
        if operation == Operation::Ack {
            self.on_write(request.register);
        }
        self.reply(request.register, operation, &payload)
    }
    /// side effects of writing a register
    fn on_write(&mut self, register: u8) {
        // emission register reflects in the status emission bit
        if register == 0x30 {
            let emission = self.register(0x30).is_some_and(|raw| raw.iter().any(|&byte| byte != 0));
            if let Some(low) = self.memory.get_mut(&0x66).and_then(|status| status.value.first_mut()) {
                *low = (*low & !1) | u8::from(emission);
            }
        }
    }
    fn reply(&self, register: u8, operation: Operation, payload: &[u8]) -> Telegram {
        Telegram::new(self.address, register, operation, payload)
            // register content is bounded by requests, which are bounded by the payload capacity
            .unwrap_or_else(|_| Telegram {
                address: self.address,
                register,
                operation: Operation::Nack,
                payload: heapless::Vec::new(),
                })
    }
}
