//! Per-vendor request plans.
//!
//! A plan is the fixed, ordered list of commands that make up one poll cycle of a meter. Order
//! matters: some plans select a tariff and then read the selector register straight back.

use std::collections::BTreeMap;

use crate::decode::{self, Decoder, Value};
use crate::modbus::{MAX_SAFE_READ_COUNT, MAX_WRITE_COUNT};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("device `{0}` is not supported")]
    UnsupportedDevice(String),
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum DeviceCategory {
    Abb,
    Schneider,
}

impl DeviceCategory {
    /// Parse a device category by its name, as given on the command line.
    pub fn parse(name: &str) -> Result<Self, Error> {
        name.parse::<Self>().map_err(|_| Error::UnsupportedDevice(name.to_string()))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReadCommand {
    pub name: &'static str,
    pub register: u16,
    pub count: u16,
    pub decoder: Decoder,
}

impl ReadCommand {
    pub fn decode(&self, words: &[u16]) -> Result<Value, decode::Error> {
        let expected = usize::from(self.count);
        if words.len() != expected {
            return Err(decode::Error::SizeMismatch { expected, actual: words.len() });
        }
        self.decoder.decode(words)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WriteCommand {
    pub name: &'static str,
    pub register: u16,
    pub values: &'static [u16],
}

#[derive(Clone, Copy, Debug)]
pub enum Command {
    Read(ReadCommand),
    Write(WriteCommand),
}

impl Command {
    pub const fn read(name: &'static str, register: u16, count: u16, decoder: Decoder) -> Self {
        Self::Read(ReadCommand { name, register, count, decoder })
    }

    pub const fn write(name: &'static str, register: u16, values: &'static [u16]) -> Self {
        Self::Write(WriteCommand { name, register, values })
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Read(r) => r.name,
            Self::Write(w) => w.name,
        }
    }

    pub const fn register(&self) -> u16 {
        match self {
            Self::Read(r) => r.register,
            Self::Write(w) => w.register,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Plan {
    category: DeviceCategory,
    commands: &'static [Command],
}

impl Plan {
    /// Panics if a read asks for a word count its decoder cannot consume, or if a command
    /// exceeds what a single Modbus request can carry. For the `static` plans below this
    /// happens at compile time.
    pub const fn new(category: DeviceCategory, commands: &'static [Command]) -> Self {
        let mut idx = 0;
        while idx < commands.len() {
            match commands[idx] {
                Command::Read(read) => {
                    assert!(read.count > 0, "reads must request at least one register");
                    assert!(
                        read.count <= MAX_SAFE_READ_COUNT,
                        "reads of > 123 registers aren't universally supported"
                    );
                    if let Some(words) = read.decoder.words() {
                        assert!(words == read.count, "read count does not match its decoder");
                    }
                }
                Command::Write(write) => {
                    assert!(!write.values.is_empty(), "writes must carry at least one value");
                    assert!(
                        write.values.len() <= MAX_WRITE_COUNT as usize,
                        "writes of > 123 registers aren't supported"
                    );
                }
            }
            idx += 1;
        }
        Self { category, commands }
    }

    pub const fn category(&self) -> DeviceCategory {
        self.category
    }

    pub const fn commands(&self) -> &'static [Command] {
        self.commands
    }
}

pub static ABB: Plan = Plan::new(
    DeviceCategory::Abb,
    &[
        Command::read("Type designation", 0x8960, 6, Decoder::Ascii),
        Command::read("Serial number", 0x8900, 2, Decoder::U32),
        Command::read("Active power", 0x5B14, 2, Decoder::I32),
        Command::read("Active power export L1", 0x546C, 4, Decoder::RawBytes),
        Command::read("Reactive power", 0x5B1C, 2, Decoder::RawBytes),
        Command::read("Reactive import", 0x500C, 2, Decoder::U32),
        Command::read("Reactive export", 0x5010, 2, Decoder::U32),
        Command::read("Reactive net", 0x5014, 2, Decoder::I32),
        Command::read("Active import", 0x5000, 2, Decoder::U32),
        Command::read("Active export", 0x5004, 2, Decoder::U32),
        Command::read("Active net", 0x5008, 2, Decoder::I32),
        // NB: the encoding of these two is not known yet.
        Command::read("Tariff configuration", 0x8C90, 1, Decoder::RawBytes),
        Command::read("Tariff", 0x8A07, 1, Decoder::RawBytes),
    ],
);

const SCHNEIDER_TARIFF: u16 = 0x105E;

pub static SCHNEIDER: Plan = Plan::new(
    DeviceCategory::Schneider,
    &[
        Command::read("Model", 0x0031, 20, Decoder::Utf8),
        Command::read("Serial number", 0x0081, 2, Decoder::U32),
        Command::read("Active power", 0x0BF3, 2, Decoder::F32),
        Command::read("Active energy import total", 0x0C83, 4, Decoder::I64),
        Command::read("Active energy import L1", 0x0DBD, 4, Decoder::I64),
        Command::read("Active energy import L2", 0x0DC1, 4, Decoder::I64),
        Command::read("Active energy import L3", 0x0DC5, 4, Decoder::I64),
        // Each tariff selection is read back to check that the meter accepted it.
        Command::write("Tariff daily", SCHNEIDER_TARIFF, &[0x0001]),
        Command::read("Tariff", SCHNEIDER_TARIFF, 1, Decoder::RawBytes),
        Command::write("Tariff nightly", SCHNEIDER_TARIFF, &[0x0002]),
        Command::read("Tariff", SCHNEIDER_TARIFF, 1, Decoder::RawBytes),
    ],
);

/// The plans available to an executor, keyed by device category.
#[derive(Clone, Debug, Default)]
pub struct PlanRegistry {
    plans: BTreeMap<DeviceCategory, Plan>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a plan for every supported meter.
    pub fn builtin() -> Self {
        Self::new().with(ABB).with(SCHNEIDER)
    }

    pub fn with(mut self, plan: Plan) -> Self {
        self.plans.insert(plan.category(), plan);
        self
    }

    pub fn get(&self, category: DeviceCategory) -> Result<&Plan, Error> {
        self.plans.get(&category).ok_or_else(|| Error::UnsupportedDevice(category.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator as _;

    #[test]
    fn builtin_registry_covers_all_categories() {
        let registry = PlanRegistry::builtin();
        for category in DeviceCategory::iter() {
            let plan = registry.get(category).unwrap();
            assert_eq!(plan.category(), category);
            assert!(!plan.commands().is_empty());
        }
        assert_eq!(registry.get(DeviceCategory::Abb).unwrap().commands().len(), 13);
        assert_eq!(registry.get(DeviceCategory::Schneider).unwrap().commands().len(), 11);
    }

    #[test]
    fn unsupported_category() {
        let registry = PlanRegistry::new().with(ABB);
        assert!(registry.get(DeviceCategory::Abb).is_ok());
        match registry.get(DeviceCategory::Schneider) {
            Err(Error::UnsupportedDevice(name)) => assert_eq!(name, "schneider"),
            Ok(plan) => panic!("got a plan for {}", plan.category()),
        }
        assert!(PlanRegistry::new().get(DeviceCategory::Abb).is_err());
    }

    #[test]
    fn parse_category() {
        assert_eq!(DeviceCategory::parse("abb").unwrap(), DeviceCategory::Abb);
        assert_eq!(DeviceCategory::parse("schneider").unwrap(), DeviceCategory::Schneider);
        assert!(matches!(
            DeviceCategory::parse("janitza"),
            Err(Error::UnsupportedDevice(name)) if name == "janitza"
        ));
    }

    #[test]
    fn tariff_writes_are_read_back() {
        let commands = SCHNEIDER.commands();
        let writes = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Command::Write(_)))
            .collect::<Vec<_>>();
        assert_eq!(writes.len(), 2);
        for (idx, write) in writes {
            let Command::Read(read) = commands[idx + 1] else {
                panic!("{} is not followed by a read", write.name());
            };
            assert_eq!(read.register, write.register());
        }
    }

    #[test]
    fn read_command_checks_word_count() {
        let Command::Read(read) = ABB.commands()[0] else { unreachable!() };
        assert!(matches!(
            read.decode(&[0x4142; 5]),
            Err(decode::Error::SizeMismatch { expected: 6, actual: 5 })
        ));
        let Command::Read(raw) = ABB.commands()[3] else { unreachable!() };
        assert!(matches!(
            raw.decode(&[0, 0, 0, 0, 0]),
            Err(decode::Error::SizeMismatch { expected: 4, actual: 5 })
        ));
        assert_eq!(raw.decode(&[0, 1, 2, 3]).unwrap(), Value::Bytes(vec![0, 0, 0, 1, 0, 2, 0, 3]));
    }
}
