/*!
    host side driver for NKT Photonics Basik seed laser modules

    - [telegram] frames and unframes the telegrams of the register protocol
    - [registers] describes the registers of a device, by logical name
    - [convert] translates raw register content to and from engineering values
    - [session] runs request/response exchanges with a module over a serial port

    ```ignore
    let session = Session::open(Config::default().with_port("/dev/ttyUSB0"))?;
    session.write("WAVELENGTH_OFFSET", 12.5).await?;
    let center = session.read("WAVELENGTH_CENTER").await?;
    ```
*/

mod utils;

pub mod telegram;
pub mod registers;
pub mod convert;
pub mod session;
#[cfg(feature = "simulator")]
pub mod simulator;

pub use convert::Value;
pub use registers::{Catalog, BASIK};
pub use session::{Session, Config};

use thiserror::Error;


/// any error of a register access by name
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Catalog(#[from] registers::CatalogError),
    #[error(transparent)]
    Conversion(#[from] convert::ConversionError),
    #[error(transparent)]
    Transport(#[from] session::TransportError),
}
