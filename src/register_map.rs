use crate::prelude::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Descriptors closer than this many words share one register block; the
/// words in between read as 0.
pub const BLOCK_GAP_LIMIT: u16 = 32;

// Role {{{
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    CurrentL1,
    CurrentL2,
    CurrentL3,
    CurrentNeutral,
    PowerL1,
    PowerL2,
    PowerL3,
    PowerTotal,
    ReactivePowerL1,
    ReactivePowerL2,
    ReactivePowerL3,
    ReactivePowerTotal,
    PowerFactorL1,
    PowerFactorL2,
    PowerFactorL3,
    PowerFactorTotal,
    EnergyImportTotal,
    EnergyExportTotal,
    Frequency,
    VoltageL1L2,
    VoltageL2L3,
    VoltageL3L1,
    VoltageL1,
    VoltageL2,
    VoltageL3,
}

impl Role {
    pub const ALL: [Role; 25] = [
        Role::CurrentL1,
        Role::CurrentL2,
        Role::CurrentL3,
        Role::CurrentNeutral,
        Role::PowerL1,
        Role::PowerL2,
        Role::PowerL3,
        Role::PowerTotal,
        Role::ReactivePowerL1,
        Role::ReactivePowerL2,
        Role::ReactivePowerL3,
        Role::ReactivePowerTotal,
        Role::PowerFactorL1,
        Role::PowerFactorL2,
        Role::PowerFactorL3,
        Role::PowerFactorTotal,
        Role::EnergyImportTotal,
        Role::EnergyExportTotal,
        Role::Frequency,
        Role::VoltageL1L2,
        Role::VoltageL2L3,
        Role::VoltageL3L1,
        Role::VoltageL1,
        Role::VoltageL2,
        Role::VoltageL3,
    ];

    pub fn as_str(&self) -> &'static str {
        use Role::*;

        match self {
            CurrentL1 => "current_l1",
            CurrentL2 => "current_l2",
            CurrentL3 => "current_l3",
            CurrentNeutral => "current_neutral",
            PowerL1 => "power_l1",
            PowerL2 => "power_l2",
            PowerL3 => "power_l3",
            PowerTotal => "power_total",
            ReactivePowerL1 => "reactive_power_l1",
            ReactivePowerL2 => "reactive_power_l2",
            ReactivePowerL3 => "reactive_power_l3",
            ReactivePowerTotal => "reactive_power_total",
            PowerFactorL1 => "power_factor_l1",
            PowerFactorL2 => "power_factor_l2",
            PowerFactorL3 => "power_factor_l3",
            PowerFactorTotal => "power_factor_total",
            EnergyImportTotal => "energy_import_total",
            EnergyExportTotal => "energy_export_total",
            Frequency => "frequency",
            VoltageL1L2 => "voltage_l1_l2",
            VoltageL2L3 => "voltage_l2_l3",
            VoltageL3L1 => "voltage_l3_l1",
            VoltageL1 => "voltage_l1",
            VoltageL2 => "voltage_l2",
            VoltageL3 => "voltage_l3",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .find(|role| role.as_str() == s)
            .copied()
            .ok_or_else(|| MeterError::UnknownRole(s.to_string()))
    }
} // }}}

// Unit {{{
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "V")]
    Volt,
    #[serde(rename = "A")]
    Ampere,
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "kW")]
    Kilowatt,
    #[serde(rename = "var")]
    Var,
    #[serde(rename = "kvar")]
    Kilovar,
    #[serde(rename = "Wh")]
    WattHour,
    #[serde(rename = "kWh")]
    KilowattHour,
    #[serde(rename = "Hz")]
    Hertz,
    #[serde(rename = "none")]
    Unitless,
}

impl Unit {
    // (dimension, multiplier to the dimension's base unit)
    fn dimension(&self) -> (&'static str, f64) {
        use Unit::*;

        match self {
            Volt => ("voltage", 1.0),
            Ampere => ("current", 1.0),
            Watt => ("power", 1.0),
            Kilowatt => ("power", 1000.0),
            Var => ("reactive_power", 1.0),
            Kilovar => ("reactive_power", 1000.0),
            WattHour => ("energy", 1.0),
            KilowattHour => ("energy", 1000.0),
            Hertz => ("frequency", 1.0),
            Unitless => ("ratio", 1.0),
        }
    }

    pub fn is_compatible(&self, other: Unit) -> bool {
        self.dimension().0 == other.dimension().0
    }

    /// Converts `value` from `self` into `target`, or `None` across dimensions.
    pub fn convert(&self, value: f64, target: Unit) -> Option<f64> {
        let (from_dim, from_factor) = self.dimension();
        let (to_dim, to_factor) = target.dimension();
        if from_dim != to_dim {
            return None;
        }
        if from_factor == to_factor {
            return Some(value);
        }
        Some(value * from_factor / to_factor)
    }

    pub fn symbol(&self) -> &'static str {
        use Unit::*;

        match self {
            Volt => "V",
            Ampere => "A",
            Watt => "W",
            Kilowatt => "kW",
            Var => "var",
            Kilovar => "kvar",
            WattHour => "Wh",
            KilowattHour => "kWh",
            Hertz => "Hz",
            Unitless => "",
        }
    }
} // }}}

// RegisterDescriptor {{{
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegisterDescriptor {
    pub role: Role,
    pub address: u16,
    /// Number of 16-bit words; 1 is a signed 16-bit value, 2 a signed 32-bit
    /// value with the high word first.
    pub width: u8,
    pub scale: f64,
    pub unit: Unit,
    pub default: f64,
    pub required: bool,
}

impl RegisterDescriptor {
    const fn new(
        role: Role,
        address: u16,
        width: u8,
        scale: f64,
        unit: Unit,
        default: f64,
    ) -> Self {
        Self {
            role,
            address,
            width,
            scale,
            unit,
            default,
            required: false,
        }
    }

    const fn required(self) -> Self {
        Self {
            required: true,
            ..self
        }
    }

    /// First address after this register.
    pub fn end(&self) -> u32 {
        self.address as u32 + self.width as u32
    }

    pub fn encode(&self, value: f64) -> Vec<u16> {
        encode(value, self)
    }

    pub fn decode(&self, words: &[u16]) -> f64 {
        decode(words, self)
    }
}

/// `round(value / scale)`, clamped to the signed range of the register width
/// so an out-of-range reading saturates instead of wrapping.
pub fn encode(value: f64, descriptor: &RegisterDescriptor) -> Vec<u16> {
    let raw = (value / descriptor.scale).round();

    match descriptor.width {
        1 => {
            let v = raw.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            vec![v as u16]
        }
        _ => {
            let v = raw.clamp(i32::MIN as f64, i32::MAX as f64) as i32;
            vec![(v >> 16) as u16, v as u16]
        }
    }
}

pub fn decode(words: &[u16], descriptor: &RegisterDescriptor) -> f64 {
    let raw = match (descriptor.width, words) {
        (1, [w, ..]) => *w as i16 as f64,
        (_, [hi, lo, ..]) => (((*hi as u32) << 16) | *lo as u32) as i32 as f64,
        _ => 0.0,
    };

    raw * descriptor.scale
} // }}}

use Role::*;
use Unit::*;

/// DTSU666 register layout as polled by Huawei inverters.
pub const DTSU666_REGISTERS: &[RegisterDescriptor] = &[
    RegisterDescriptor::new(CurrentL1, 0x0836, 1, 0.001, Ampere, 0.0),
    RegisterDescriptor::new(CurrentL2, 0x0838, 1, 0.001, Ampere, 0.0),
    RegisterDescriptor::new(CurrentL3, 0x083A, 1, 0.001, Ampere, 0.0),
    RegisterDescriptor::new(CurrentNeutral, 0x083C, 1, 0.001, Ampere, 0.0),
    RegisterDescriptor::new(PowerL1, 0x084A, 1, 0.001, Kilowatt, 0.0),
    RegisterDescriptor::new(PowerL2, 0x084C, 1, 0.001, Kilowatt, 0.0),
    RegisterDescriptor::new(PowerL3, 0x084E, 1, 0.001, Kilowatt, 0.0),
    RegisterDescriptor::new(PowerTotal, 0x0850, 1, 0.001, Kilowatt, 0.0).required(),
    RegisterDescriptor::new(ReactivePowerL1, 0x0852, 1, 0.001, Kilovar, 0.0),
    RegisterDescriptor::new(ReactivePowerL2, 0x0854, 1, 0.001, Kilovar, 0.0),
    RegisterDescriptor::new(ReactivePowerL3, 0x0856, 1, 0.001, Kilovar, 0.0),
    RegisterDescriptor::new(ReactivePowerTotal, 0x0858, 1, 0.001, Kilovar, 0.0),
    RegisterDescriptor::new(PowerFactorL1, 0x085A, 1, 0.001, Unitless, 0.95),
    RegisterDescriptor::new(PowerFactorL2, 0x085C, 1, 0.001, Unitless, 0.95),
    RegisterDescriptor::new(PowerFactorL3, 0x085E, 1, 0.001, Unitless, 0.95),
    RegisterDescriptor::new(PowerFactorTotal, 0x0860, 1, 0.001, Unitless, 0.95),
    RegisterDescriptor::new(EnergyImportTotal, 0x0862, 2, 0.01, KilowattHour, 0.0),
    RegisterDescriptor::new(EnergyExportTotal, 0x0864, 2, 0.01, KilowattHour, 0.0),
    RegisterDescriptor::new(Frequency, 0x0866, 1, 0.01, Hertz, 50.0).required(),
    RegisterDescriptor::new(VoltageL1L2, 0x1836, 1, 0.1, Volt, 400.0),
    RegisterDescriptor::new(VoltageL2L3, 0x1838, 1, 0.1, Volt, 400.0),
    RegisterDescriptor::new(VoltageL3L1, 0x183A, 1, 0.1, Volt, 400.0),
    RegisterDescriptor::new(VoltageL1, 0x183C, 1, 0.1, Volt, 230.0).required(),
    RegisterDescriptor::new(VoltageL2, 0x183E, 1, 0.1, Volt, 230.0),
    RegisterDescriptor::new(VoltageL3, 0x1840, 1, 0.1, Volt, 230.0),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterBlock {
    pub start: u16,
    pub len: u16,
}

impl RegisterBlock {
    pub fn contains(&self, address: u16, count: u16) -> bool {
        let end = address as u32 + count as u32;
        count > 0 && address >= self.start && end <= self.start as u32 + self.len as u32
    }
}

/// Immutable role/address lookup over a validated descriptor table.
#[derive(Clone, Debug)]
pub struct RegisterMap {
    descriptors: Vec<RegisterDescriptor>,
    by_role: HashMap<Role, usize>,
    blocks: Vec<RegisterBlock>,
}

impl RegisterMap {
    pub fn dtsu666() -> Result<Self, MeterError> {
        Self::new(DTSU666_REGISTERS)
    }

    pub fn new(table: &[RegisterDescriptor]) -> Result<Self, MeterError> {
        let mut descriptors = table.to_vec();
        descriptors.sort_by_key(|d| d.address);

        let mut by_role = HashMap::new();
        for (index, d) in descriptors.iter().enumerate() {
            if d.width != 1 && d.width != 2 {
                return Err(MeterError::InvalidRegisterTable(format!(
                    "{} has width {}",
                    d.role, d.width
                )));
            }
            if !(d.scale.is_finite() && d.scale > 0.0) {
                return Err(MeterError::InvalidRegisterTable(format!(
                    "{} has scale {}",
                    d.role, d.scale
                )));
            }
            if !d.default.is_finite() {
                return Err(MeterError::InvalidRegisterTable(format!(
                    "{} has default {}",
                    d.role, d.default
                )));
            }
            if d.end() > u16::MAX as u32 + 1 {
                return Err(MeterError::InvalidRegisterTable(format!(
                    "{} runs past the end of the address space",
                    d.role
                )));
            }
            if by_role.insert(d.role, index).is_some() {
                return Err(MeterError::InvalidRegisterTable(format!(
                    "duplicate role {}",
                    d.role
                )));
            }
        }

        for pair in descriptors.windows(2) {
            if pair[0].end() > pair[1].address as u32 {
                return Err(MeterError::InvalidRegisterTable(format!(
                    "{} at 0x{:04X} overlaps {} at 0x{:04X}",
                    pair[0].role, pair[0].address, pair[1].role, pair[1].address
                )));
            }
        }

        let blocks = Self::build_blocks(&descriptors);

        Ok(Self {
            descriptors,
            by_role,
            blocks,
        })
    }

    fn build_blocks(descriptors: &[RegisterDescriptor]) -> Vec<RegisterBlock> {
        let mut blocks: Vec<RegisterBlock> = Vec::new();

        for d in descriptors {
            match blocks.last_mut() {
                Some(block)
                    if (d.address as u32)
                        < block.start as u32 + block.len as u32 + BLOCK_GAP_LIMIT as u32 =>
                {
                    block.len = (d.end() - block.start as u32) as u16;
                }
                _ => blocks.push(RegisterBlock {
                    start: d.address,
                    len: d.width as u16,
                }),
            }
        }

        blocks
    }

    pub fn descriptor(&self, role: Role) -> Result<&RegisterDescriptor, MeterError> {
        self.by_role
            .get(&role)
            .map(|&index| &self.descriptors[index])
            .ok_or_else(|| MeterError::UnknownRole(role.to_string()))
    }

    pub fn descriptor_by_name(&self, name: &str) -> Result<&RegisterDescriptor, MeterError> {
        self.descriptor(name.parse()?)
    }

    /// The descriptor whose words cover `address`.
    pub fn descriptor_at(&self, address: u16) -> Result<&RegisterDescriptor, MeterError> {
        self.descriptors
            .iter()
            .find(|d| address >= d.address && (address as u32) < d.end())
            .ok_or(MeterError::NoSuchAddress { address, count: 1 })
    }

    pub fn block_for(&self, address: u16, count: u16) -> Result<&RegisterBlock, MeterError> {
        self.blocks
            .iter()
            .find(|b| b.contains(address, count))
            .ok_or(MeterError::NoSuchAddress { address, count })
    }

    pub fn blocks(&self) -> &[RegisterBlock] {
        &self.blocks
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.descriptors.iter()
    }

    pub fn required(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.descriptors.iter().filter(|d| d.required)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
