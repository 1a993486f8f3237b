/*!
    register catalogs

    a [Catalog] maps logical register names to [RegisterDescriptor]s telling where a register lives and how its raw bytes translate to engineering values.
    Catalogs are plain static tables: supporting a new device variant means writing a new table, not new code.

    [BASIK] is the catalog of the NKT Photonics Basik K1x2 seed laser module.
*/

use thiserror::Error;


/// exact rational factor from raw integer to engineering unit
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Scale {
    pub numerator: i64,
    pub denominator: i64,
}
impl Scale {
    pub const UNIT: Self = Self::new(1, 1);

    pub const fn new(numerator: i64, denominator: i64) -> Self {
        Self {numerator, denominator}
    }
}

/// how the raw content of a register is interpreted
#[derive(Copy, Clone, Debug)]
pub enum Kind {
    /// integer value, scaled without rounding
    Integer,
    /// physical quantity stored as a scaled integer
    Float,
    /// IEEE-754 single precision float
    Single,
    /// symbolic value from a closed domain
    Enum(&'static EnumDomain),
    /// set of named flags
    Bitfield(&'static BitfieldSpec),
    /// ASCII text, `width` is its maximum length
    Ascii,
}

/// exhaustive set of legal raw values of a symbolic register, with their tags
#[derive(Debug)]
pub struct EnumDomain {
    pub name: &'static str,
    pub values: &'static [(i64, &'static str)],
}
impl EnumDomain {
    /// tag of a raw value, if legal
    pub fn tag(&self, raw: i64) -> Option<&'static str> {
        self.values.iter()
            .find(|&&(value, _)| value == raw)
            .map(|&(_, tag)| tag)
    }
    /// raw value of a tag, compared regardless of ASCII case
    pub fn raw(&self, tag: &str) -> Option<i64> {
        self.values.iter()
            .find(|(_, known)| known.eq_ignore_ascii_case(tag))
            .map(|&(value, _)| value)
    }
    pub fn contains(&self, raw: i64) -> bool {
        self.tag(raw).is_some()
    }
    /// all legal raw values
    pub fn legal(&self) -> Vec<i64> {
        self.values.iter().map(|&(value, _)| value).collect()
    }
}

/// named bits of a status or setup register
#[derive(Debug)]
pub struct BitfieldSpec {
    pub name: &'static str,
    pub flags: &'static [Flag],
}
impl BitfieldSpec {
    pub fn flag(&self, name: &str) -> Option<&'static Flag> {
        self.flags.iter().find(|flag| flag.name.eq_ignore_ascii_case(name))
    }
    /// bits covered by the declared flags
    pub fn mask(&self) -> u64 {
        self.flags.iter().fold(0, |mask, flag| mask | flag.mask())
    }
}

/**
    one flag in a bitfield

    a flag without `states` is active when any of its bits is set.
    A flag with `states` always has one of the states of its domain, reported as `NAME=TAG`
*/
#[derive(Debug)]
pub struct Flag {
    pub name: &'static str,
    pub offset: u8,
    pub width: u8,
    pub states: Option<&'static EnumDomain>,
}
impl Flag {
    pub const fn bit(name: &'static str, offset: u8) -> Self {
        Self {name, offset, width: 1, states: None}
    }
    pub const fn field(name: &'static str, offset: u8, width: u8, states: &'static EnumDomain) -> Self {
        Self {name, offset, width, states: Some(states)}
    }
    /// bits of this flag in the register value
    pub fn mask(&self) -> u64 {
        ((1u64 << self.width) - 1) << self.offset
    }
}


/// location and encoding of a register
#[derive(Copy, Clone, Debug)]
pub struct RegisterDescriptor {
    /// logical name used by callers
    pub name: &'static str,
    /// module holding the register, `None` for the module configured for the session
    pub address: Option<u8>,
    /// register id in the protocol
    pub register: u8,
    /// number of bytes, or maximum length for text
    pub width: u8,
    pub signed: bool,
    pub scale: Scale,
    /// added to the raw integer before scaling
    pub offset: i64,
    pub kind: Kind,
    pub unit: &'static str,
    pub writable: bool,
}

impl RegisterDescriptor {
    pub const fn unsigned(name: &'static str, register: u8, width: u8, kind: Kind) -> Self {
        Self {
            name,
            address: None,
            register,
            width,
            signed: false,
            scale: Scale::UNIT,
            offset: 0,
            kind,
            unit: "",
            writable: false,
        }
    }
    pub const fn signed(name: &'static str, register: u8, width: u8, kind: Kind) -> Self {
        Self {signed: true, .. Self::unsigned(name, register, width, kind)}
    }
    pub const fn scaled(self, numerator: i64, denominator: i64) -> Self {
        Self {scale: Scale::new(numerator, denominator), .. self}
    }
    pub const fn offset(self, offset: i64) -> Self {
        Self {offset, .. self}
    }
    pub const fn unit(self, unit: &'static str) -> Self {
        Self {unit, .. self}
    }
    pub const fn writable(self) -> Self {
        Self {writable: true, .. self}
    }
    /// pin the register to a given module address
    pub const fn at(self, address: u8) -> Self {
        Self {address: Some(address), .. self}
    }
}


/// error in a catalog access
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("no register named {0:?} for this device")]
    UnknownRegister(String),
    #[error("register {0} is read-only")]
    ReadOnly(&'static str),
}

/// static register table of a device type
#[derive(Copy, Clone, Debug)]
pub struct Catalog {
    device: &'static str,
    registers: &'static [RegisterDescriptor],
}
impl Catalog {
    pub const fn new(device: &'static str, registers: &'static [RegisterDescriptor]) -> Self {
        Self {device, registers}
    }
    /// device type this catalog describes
    pub fn device(&self) -> &'static str {self.device}

    /// descriptor of a register by logical name, regardless of ASCII case
    pub fn lookup(&self, name: &str) -> Result<&'static RegisterDescriptor, CatalogError> {
        self.registers.iter()
            .find(|descriptor| descriptor.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| CatalogError::UnknownRegister(name.to_owned()))
    }
    /// descriptor of a register by protocol id
    pub fn by_register(&self, register: u8) -> Option<&'static RegisterDescriptor> {
        self.registers.iter().find(|descriptor| descriptor.register == register)
    }
    pub fn iter(&self) -> impl Iterator<Item = &'static RegisterDescriptor> {
        self.registers.iter()
    }
}
impl Default for Catalog {
    fn default() -> Self {BASIK}
}



pub static EMISSION_STATE: EnumDomain = EnumDomain {
    name: "EMISSION_STATE",
    values: &[(0, "OFF"), (1, "ON")],
};
pub static MODULATION_RANGE: EnumDomain = EnumDomain {
    name: "MODULATION_RANGE",
    values: &[(0, "WIDE"), (1, "NARROW")],
};
pub static MODULATION_COUPLING: EnumDomain = EnumDomain {
    name: "MODULATION_COUPLING",
    values: &[(0, "AC"), (1, "DC")],
};
pub static LASER_MODE: EnumDomain = EnumDomain {
    name: "LASER_MODE",
    values: &[(0, "POWER"), (1, "CURRENT")],
};
pub static AMPLITUDE_WAVEFORM: EnumDomain = EnumDomain {
    name: "AMPLITUDE_WAVEFORM",
    values: &[(0, "SINE"), (1, "TRIANGLE")],
};
pub static WAVELENGTH_WAVEFORM: EnumDomain = EnumDomain {
    name: "WAVELENGTH_WAVEFORM",
    values: &[(0, "SINE"), (1, "TRIANGLE"), (2, "SAWTOOTH"), (3, "INVERSE_SAWTOOTH")],
};

pub static STATUS_BITS: BitfieldSpec = BitfieldSpec {
    name: "STATUS",
    flags: &[
        Flag::bit("EMISSION", 0),
        Flag::bit("INTERLOCK_OFF", 1),
        Flag::bit("DISABLED", 4),
        Flag::bit("SUPPLY_VOLTAGE_LOW", 5),
        Flag::bit("MODULE_TEMP_RANGE", 6),
        Flag::bit("WAITING_TEMPERATURE", 11),
        Flag::bit("WAVELENGTH_STABILIZED", 14),
        Flag::bit("ERROR_CODE_PRESENT", 15),
    ],
};
pub static ERROR_BITS: BitfieldSpec = BitfieldSpec {
    name: "ERROR",
    flags: &[
        Flag::bit("NO_ERROR", 0),
        Flag::bit("INTERLOCK", 2),
        Flag::bit("LOW_VOLTAGE", 3),
        Flag::bit("MODULE_TEMPERATURE_RANGE", 7),
        Flag::bit("MODULE_DISABLED", 8),
    ],
};
pub static SETUP_BITS: BitfieldSpec = BitfieldSpec {
    name: "SETUP",
    flags: &[
        Flag::field("MODULATION_RANGE", 1, 1, &MODULATION_RANGE),
        Flag::bit("EXTERNAL_WAVELENGTH_MODULATION", 2),
        Flag::field("MODULATION_COUPLING", 3, 1, &MODULATION_COUPLING),
        Flag::bit("INTERNAL_WAVELENGTH_MODULATION", 4),
        // output the wavelength modulation signal on the wavelength pins
        Flag::bit("MODULATION_OUTPUT", 5),
        Flag::field("LASER_MODE", 8, 1, &LASER_MODE),
        Flag::bit("EXTERNAL_AMPLITUDE_MODULATION_SOURCE", 9),
    ],
};
pub static MODULATION_SETUP_BITS: BitfieldSpec = BitfieldSpec {
    name: "MODULATION_SETUP",
    flags: &[
        Flag::bit("AMPLITUDE_MODULATION_FREQUENCY_SELECTOR", 0),
        Flag::field("AMPLITUDE_MODULATION_WAVEFORM", 2, 1, &AMPLITUDE_WAVEFORM),
        Flag::bit("WAVELENGTH_MODULATION_FREQUENCY_SELECTOR", 4),
        Flag::field("WAVELENGTH_MODULATION_WAVEFORM", 6, 2, &WAVELENGTH_WAVEFORM),
    ],
};

/// NKT Photonics Basik K1x2 module
pub static BASIK: Catalog = Catalog::new("Basik K1x2", &BASIK_REGISTERS);

static BASIK_REGISTERS: [RegisterDescriptor; 22] = [
    RegisterDescriptor::unsigned("OUTPUT_POWER_MW", 0x17, 2, Kind::Float).scaled(1, 100).unit("mW"),
    RegisterDescriptor::signed("TEMPERATURE", 0x1C, 2, Kind::Float).scaled(1, 10).unit("°C"),
    RegisterDescriptor::unsigned("SUPPLY_VOLTAGE", 0x1E, 2, Kind::Float).scaled(1, 1000).unit("V"),
    RegisterDescriptor::unsigned("OUTPUT_POWER_SETPOINT_MW", 0x22, 2, Kind::Float).scaled(1, 100).unit("mW").writable(),
    RegisterDescriptor::signed("WAVELENGTH_OFFSET", 0x2A, 2, Kind::Float).scaled(1, 10).unit("pm").writable(),
    RegisterDescriptor::unsigned("WAVELENGTH_MODULATION_LEVEL", 0x2B, 2, Kind::Float).scaled(1, 10).unit("‰"),
    RegisterDescriptor::unsigned("AMPLITUDE_MODULATION_DEPTH", 0x2C, 2, Kind::Float).scaled(1, 10).unit("‰"),
    RegisterDescriptor::signed("WAVELENGTH_MODULATION_OFFSET", 0x2F, 2, Kind::Float).scaled(1, 10).unit("‰"),
    RegisterDescriptor::unsigned("EMISSION", 0x30, 1, Kind::Enum(&EMISSION_STATE)).writable(),
    RegisterDescriptor::unsigned("SETUP", 0x31, 2, Kind::Bitfield(&SETUP_BITS)).writable(),
    RegisterDescriptor::unsigned("WAVELENGTH_CENTER", 0x32, 4, Kind::Float).scaled(1, 10_000).unit("nm").writable(),
    RegisterDescriptor::unsigned("SERIAL_NUMBER", 0x65, 8, Kind::Ascii),
    RegisterDescriptor::unsigned("STATUS", 0x66, 2, Kind::Bitfield(&STATUS_BITS)),
    RegisterDescriptor::unsigned("ERROR", 0x67, 2, Kind::Bitfield(&ERROR_BITS)),
    RegisterDescriptor::signed("WAVELENGTH_OFFSET_READOUT", 0x72, 2, Kind::Float).scaled(1, 10).unit("pm"),
    RegisterDescriptor::unsigned("NAME", 0x8D, 8, Kind::Ascii).writable(),
    RegisterDescriptor::signed("OUTPUT_POWER_DBM", 0x90, 2, Kind::Float).scaled(1, 100).unit("dBm"),
    RegisterDescriptor::signed("OUTPUT_POWER_SETPOINT_DBM", 0xA0, 2, Kind::Float).scaled(1, 100).unit("dBm").writable(),
    RegisterDescriptor::unsigned("WAVELENGTH_MODULATION", 0xB5, 1, Kind::Enum(&EMISSION_STATE)).writable(),
    RegisterDescriptor::unsigned("MODULATION_SETUP", 0xB7, 2, Kind::Bitfield(&MODULATION_SETUP_BITS)).writable(),
    RegisterDescriptor::unsigned("WAVELENGTH_MODULATION_FREQUENCY", 0xB8, 4, Kind::Single).unit("Hz").writable(),
    RegisterDescriptor::unsigned("AMPLITUDE_MODULATION_FREQUENCY", 0xBA, 4, Kind::Single).unit("Hz"),
];
