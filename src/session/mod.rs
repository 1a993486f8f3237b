/*!
    asynchronous transport session with a Basik module

    The central resource is the [Session] struct which exclusively owns the byte stream to the module (usually a serial port) and runs request/response exchanges on it.

    - only one exchange is ever outstanding on a session, concurrent callers wait their turn in arrival order
    - each attempt is bounded by [Config::timeout], a failed attempt is retried up to [Config::attempts] times in total
    - dropping a pending request cancels it, and the session is immediately available for the next caller

    Registers are accessed by logical name with [Session::read] and [Session::write], or raw with [Session::request].
*/

/// implementation of the exchanges with the module, this is the tricky part of the code
mod exchange;
/// convenient methods to read/write registers by name
mod accessing;

pub use exchange::ExchangeState;

use std::{
    io,
    time::Duration,
    sync::atomic::{AtomicU8, Ordering::*},
    };
use tokio::sync::Mutex;
use thiserror::Error;
use log::*;

use crate::{
    registers::Catalog,
    telegram::{Decoder, PayloadTooLong},
    };


/// transport settings of a session
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// serial port the module is connected to
    pub port: String,
    pub baud_rate: u32,
    /// address of the module on the bus
    pub address: u8,
    /// maximum time waiting for a response, per attempt
    pub timeout: Duration,
    /// total number of attempts of an exchange before giving up
    pub attempts: u8,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            port: String::from("/dev/ttyUSB0"),
            baud_rate: 115_200,
            address: 1,
            timeout: Duration::from_millis(100),
            attempts: 3,
        }
    }
}
impl Config {
    pub fn with_port(self, port: impl Into<String>) -> Self {
        Self {port: port.into(), .. self}
    }
    pub fn with_baud_rate(self, baud_rate: u32) -> Self {
        Self {baud_rate, .. self}
    }
    pub fn with_address(self, address: u8) -> Self {
        Self {address, .. self}
    }
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {timeout, .. self}
    }
    pub fn with_attempts(self, attempts: u8) -> Self {
        Self {attempts, .. self}
    }
}


/// error regarding the exchanges with the module
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no response from module {address:#04x} for register {register:#04x} after {attempts} attempts")]
    NoResponse {address: u8, register: u8, attempts: u8},
    #[error("only corrupt responses from module {address:#04x} for register {register:#04x} after {attempts} attempts")]
    CorruptResponse {address: u8, register: u8, attempts: u8},
    #[error("module {address:#04x} stayed busy for register {register:#04x} after {attempts} attempts")]
    Busy {address: u8, register: u8, attempts: u8},
    #[error("module {address:#04x} rejected the request for register {register:#04x}")]
    Rejected {address: u8, register: u8},
    /// the session cannot be used anymore until reconnected
    #[error("connection to the module lost")]
    ConnectionLost(#[source] io::Error),
    #[error(transparent)]
    Payload(#[from] PayloadTooLong),
}

/// counters of what happened on a session since it was created
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// exchanges started
    pub exchanges: u64,
    /// requests sent again after a failed attempt
    pub retries: u64,
    /// attempts without a complete response in time
    pub timeouts: u64,
    /// attempts ended by a corrupt response, or by the module reporting a corrupt request
    pub corrupt: u64,
    /// cut or garbled fragments skipped while waiting for a response
    pub malformed: u64,
    /// well-formed telegrams discarded because they did not answer the request
    pub stale: u64,
    /// exchanges that ended in an error
    pub failures: u64,
}


/**
    session with one module over an exclusively owned byte stream

    `P` is the stream to the module, typically a serial port (see [Session::open]) but any [tokio::io::AsyncRead] + [tokio::io::AsyncWrite] works.
*/
pub struct Session<P> {
    config: Config,
    catalog: Catalog,
    /// state of the exchange in progress, readable without waiting for it
    state: AtomicU8,
    /// owned stream and reception buffer, locked for the duration of an exchange
    channel: Mutex<Channel<P>>,
}
struct Channel<P> {
    /// `None` once the connection is lost
    port: Option<P>,
    decoder: Decoder,
    statistics: Statistics,
}

impl<P> Session<P> {
    /// session on an already opened stream, accessing registers of the [Basik](crate::registers::BASIK) catalog
    pub fn new(port: P, config: Config) -> Self {
        Self {
            config,
            catalog: Catalog::default(),
            state: AtomicU8::new(ExchangeState::Idle as u8),
            channel: Mutex::new(Channel {
                port: Some(port),
                decoder: Decoder::new(),
                statistics: Statistics::default(),
            }),
        }
    }
    /// use another register catalog, for a different device variant
    pub fn with_catalog(self, catalog: Catalog) -> Self {
        Self {catalog, .. self}
    }
    pub fn config(&self) -> &Config {&self.config}
    pub fn catalog(&self) -> &Catalog {&self.catalog}

    /// state of the current exchange
    pub fn state(&self) -> ExchangeState {
        ExchangeState::from(self.state.load(Acquire))
    }
    /// counters of the session, available once the current exchange is over
    pub async fn statistics(&self) -> Statistics {
        self.channel.lock().await.statistics
    }
    /// false once the connection was lost and until [Session::reconnect]
    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.port.is_some()
    }
    /// replace the stream to the module, typically after the connection was lost
    pub async fn reconnect(&self, port: P) {
        let mut channel = self.channel.lock().await;
        channel.decoder.clear();
        if channel.port.replace(port).is_some() {
            debug!("replacing a working connection");
        }
        info!("reconnected to module {:#04x}", self.config.address);
    }
}


#[cfg(feature = "serial")]
mod serial {
    use serial2_tokio::{SerialPort, CharSize, StopBits, Parity};
    use super::*;

    fn open_port(config: &Config) -> Result<SerialPort, io::Error> {
        SerialPort::open(&config.port, |mut settings: serial2_tokio::Settings| {
            settings.set_raw();
            settings.set_baud_rate(config.baud_rate)?;
            settings.set_char_size(CharSize::Bits8);
            settings.set_stop_bits(StopBits::One);
            settings.set_parity(Parity::None);
            Ok(settings)
            })
    }

    impl Session<SerialPort> {
        /// open the serial port given in the config
        pub fn open(config: Config) -> Result<Self, io::Error> {
            let port = open_port(&config)?;
            info!("opened {} at {} baud", config.port, config.baud_rate);
            Ok(Self::new(port, config))
        }
        /// open the configured serial port again after the connection was lost
        pub async fn reopen(&self) -> Result<(), io::Error> {
            let port = open_port(&self.config)?;
            self.reconnect(port).await;
            Ok(())
        }
    }
}
