use std::{
    io,
    sync::atomic::{AtomicU8, Ordering::*},
    };
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt},
    sync::MutexGuard,
    };
use log::*;

use crate::telegram::{Telegram, Operation, Decoder, DecodeError};
use super::{Session, Channel, Config, Statistics, TransportError};


/// progress of the exchange currently running on a session
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    /// no exchange running
    Idle = 0,
    /// a request is being written
    RequestSent = 1,
    /// the request is written, waiting for its response
    AwaitingResponse = 2,
    /// the response was received
    Resolved = 3,
    /// the last attempt received no usable response in time, or the module was busy
    TimedOut = 4,
    /// the last attempt received a corrupt response
    ChecksumFailed = 5,
}
impl From<u8> for ExchangeState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::RequestSent,
            2 => Self::AwaitingResponse,
            3 => Self::Resolved,
            4 => Self::TimedOut,
            5 => Self::ChecksumFailed,
            _ => Self::Idle,
        }
    }
}

/// reason an attempt did not resolve
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Failure {
    Timeout,
    Corrupt,
    Busy,
}
impl Failure {
    /// state of the exchange once an attempt failed this way
    fn state(self) -> ExchangeState {
        match self {
            // a busy module gave no usable response in time either
            Failure::Timeout | Failure::Busy => ExchangeState::TimedOut,
            Failure::Corrupt => ExchangeState::ChecksumFailed,
        }
    }
}

/// what stopped the reception of a response
enum Reception {
    Corrupt(DecodeError),
    Lost(io::Error),
}


impl<P: AsyncRead + AsyncWrite + Unpin> Session<P> {
    /// send a raw request to the configured module and return its response
    pub async fn request(&self, register: u8, operation: Operation, payload: &[u8]) -> Result<Telegram, TransportError> {
        self.request_to(self.config.address, register, operation, payload).await
    }
    /**
        send a raw request to the given module address and return its response

        waits for the previous exchanges on this session to finish first. The returned telegram is the response of the module, which is never a [Operation::Nack] (reported as [TransportError::Rejected]) nor [Operation::Busy] (retried).
        Dropping the returned future cancels the exchange.
    */
    pub async fn request_to(&self, address: u8, register: u8, operation: Operation, payload: &[u8]) -> Result<Telegram, TransportError> {
        let request = Telegram::new(address, register, operation, payload)?;
        let frame = request.encode();

        // callers are served in the order they arrived
        let mut exchange = Exchange {
            channel: self.channel.lock().await,
            state: &self.state,
            finished: false,
        };
        let result = exchange.run(&self.config, &request, &frame).await;
        exchange.finished = true;
        if let Err(TransportError::ConnectionLost(error)) = &result {
            if exchange.channel.port.take().is_some() {
                error!("connection to module {:#04x} lost: {}", address, error);
            }
        }
        result
    }
}


/**
    exchange in progress, holding the channel of its session

    when dropped, either at the end of the exchange or because the caller gave up, any partially received bytes are discarded and the session becomes idle
*/
struct Exchange<'s, P> {
    channel: MutexGuard<'s, Channel<P>>,
    state: &'s AtomicU8,
    finished: bool,
}

impl<P> Drop for Exchange<'_, P> {
    fn drop(&mut self) {
        if ! self.finished {
            debug!("exchange cancelled, discarding {} received bytes", self.channel.decoder.buffered());
        }
        self.channel.decoder.clear();
        set(self.state, ExchangeState::Idle);
    }
}

impl<P: AsyncRead + AsyncWrite + Unpin> Exchange<'_, P> {
    async fn run(&mut self, config: &Config, request: &Telegram, frame: &[u8]) -> Result<Telegram, TransportError> {
        let state = self.state;
        let Channel {port, decoder, statistics} = &mut *self.channel;
        let Some(bus) = port.as_mut()
            else {return Err(TransportError::ConnectionLost(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection was lost earlier, the session must be reconnected",
                )))};

        statistics.exchanges += 1;
        let attempts = config.attempts.max(1);
        let mut failure = Failure::Timeout;

        for attempt in 1 ..= attempts {
            if attempt > 1 {
                statistics.retries += 1;
                debug!("retrying register {:#04x}, attempt {}/{}", request.register, attempt, attempts);
            }
            // nothing received before this request can answer it
            decoder.clear();

            set(state, ExchangeState::RequestSent);
            if let Err(error) = send(bus, frame).await {
                statistics.failures += 1;
                return Err(TransportError::ConnectionLost(error));
            }
            set(state, ExchangeState::AwaitingResponse);

            failure = match tokio::time::timeout(config.timeout, receive(bus, decoder, request, statistics)).await {
                Err(_) => {
                    statistics.timeouts += 1;
                    debug!("no response for register {:#04x} within {:?}", request.register, config.timeout);
                    Failure::Timeout
                },
                Ok(Err(Reception::Corrupt(error))) => {
                    statistics.corrupt += 1;
                    warn!("corrupt response for register {:#04x}: {}", request.register, error);
                    Failure::Corrupt
                },
                Ok(Err(Reception::Lost(error))) => {
                    statistics.failures += 1;
                    return Err(TransportError::ConnectionLost(error));
                },
                Ok(Ok(response)) => match response.operation {
                    Operation::Busy => {
                        debug!("module {:#04x} busy", request.address);
                        Failure::Busy
                    },
                    Operation::CrcError => {
                        statistics.corrupt += 1;
                        warn!("module {:#04x} received a corrupt request", request.address);
                        Failure::Corrupt
                    },
                    Operation::Nack => {
                        set(state, ExchangeState::Resolved);
                        statistics.failures += 1;
                        return Err(TransportError::Rejected {
                            address: request.address,
                            register: request.register,
                            });
                    },
                    _ => {
                        set(state, ExchangeState::Resolved);
                        return Ok(response);
                    },
                },
            };
            set(state, failure.state());
        }

        statistics.failures += 1;
        let (address, register) = (request.address, request.register);
        Err(match failure {
            Failure::Timeout => TransportError::NoResponse {address, register, attempts},
            Failure::Corrupt => TransportError::CorruptResponse {address, register, attempts},
            Failure::Busy => TransportError::Busy {address, register, attempts},
        })
    }
}

fn set(state: &AtomicU8, value: ExchangeState) {
    state.store(value as u8, Release);
}

async fn send<P: AsyncWrite + Unpin>(bus: &mut P, frame: &[u8]) -> Result<(), io::Error> {
    bus.write_all(frame).await?;
    bus.flush().await
}

/// read from the bus until a response to the request is decoded, discarding any other telegram or malformed fragment
async fn receive<P: AsyncRead + Unpin>(
    bus: &mut P,
    decoder: &mut Decoder,
    request: &Telegram,
    statistics: &mut Statistics,
    ) -> Result<Telegram, Reception>
{
    let mut chunk = [0; 64];
    loop {
        match decoder.decode() {
            Ok(response) if response.answers(request) => return Ok(response),
            Ok(stale) => {
                statistics.stale += 1;
                debug!("discarding stale telegram {:?} from module {:#04x} register {:#04x}",
                    stale.operation, stale.address, stale.register);
            },
            Err(DecodeError::Incomplete) => {
                let size = bus.read(&mut chunk).await.map_err(Reception::Lost)?;
                if size == 0 {
                    return Err(Reception::Lost(io::ErrorKind::UnexpectedEof.into()));
                }
                decoder.extend(&chunk[.. size]);
            },
            // a cut or garbled fragment, the decoder already resynchronized on what follows
            Err(DecodeError::Malformed(reason)) => {
                statistics.malformed += 1;
                debug!("discarding malformed fragment: {}", reason);
            },
            Err(error) => return Err(Reception::Corrupt(error)),
        }
    }
}
