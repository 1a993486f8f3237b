use tokio::io::{AsyncRead, AsyncWrite};
use log::*;

use crate::{
    Error,
    convert::{self, Value},
    registers::{RegisterDescriptor, CatalogError},
    telegram::Operation,
    };
use super::Session;


impl<P: AsyncRead + AsyncWrite + Unpin> Session<P> {
    /// read a register by its logical name, converted to engineering units
    pub async fn read(&self, name: &str) -> Result<Value, Error> {
        let descriptor = self.catalog.lookup(name)?;
        let response = self.request_to(self.address_of(descriptor), descriptor.register, Operation::Read, &[]).await?;
        let value = convert::from_raw(descriptor, &response.payload)?;
        trace!("read {} = {:?}", descriptor.name, value);
        Ok(value)
    }

    /**
        write a register by its logical name from a value in engineering units

        the value is validated before anything is sent, so a rejected value never reaches the module
    */
    pub async fn write(&self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        let descriptor = self.catalog.lookup(name)?;
        if ! descriptor.writable
            {return Err(CatalogError::ReadOnly(descriptor.name).into())}
        let value = value.into();
        let raw = convert::to_raw(descriptor, &value)?;
        self.request_to(self.address_of(descriptor), descriptor.register, Operation::Write, &raw).await?;
        trace!("wrote {} = {:?}", descriptor.name, value);
        Ok(())
    }

    /// module address of a register, the session's module unless pinned by the catalog
    fn address_of(&self, descriptor: &RegisterDescriptor) -> u8 {
        descriptor.address.unwrap_or(self.config.address)
    }
}
