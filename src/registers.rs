//! Deye hybrid inverter register maps
//!
//! Three-phase and single-phase hybrids expose the same quantities at
//! different holding-register addresses. Each quantity is described by a
//! [`FieldSpec`] carrying its address and fixed-point conversion; the active
//! [`RegisterLayout`] is chosen once from the detected capabilities.

use crate::device::DeviceCapabilities;
use crate::modbus::to_signed;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw value a PV-string register reports when no string is fitted.
pub const PV_ABSENT: u16 = 0xFFFF;

/// A decoded telemetry quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    Pv1Power,
    Pv2Power,
    BatteryVoltage,
    BatteryCurrent,
    BatterySoc,
    GridVoltage,
    GridPower,
    LoadPower,
    LoadL1,
    LoadL2,
    LoadL3,
    VoltageL1,
    VoltageL2,
    VoltageL3,
    DcTemperature,
    HeatsinkTemperature,
    DailyPv,
    DailyGridImport,
    DailyGridExport,
    DailyLoad,
}

/// Which capability a field depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Needs {
    Always,
    Battery,
    SecondPvString,
}

/// Address and conversion of one register.
///
/// `value = (raw - offset) * scale`, with `raw` read as two's complement
/// when `signed`, then negated when `negate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub field: Field,
    pub address: u16,
    pub scale: f64,
    pub offset: f64,
    pub signed: bool,
    pub negate: bool,
    /// `0xFFFF` means "not fitted" rather than a number
    pub absent_marker: bool,
    pub needs: Needs,
}

impl FieldSpec {
    const fn plain(field: Field, address: u16, scale: f64) -> Self {
        Self {
            field,
            address,
            scale,
            offset: 0.0,
            signed: false,
            negate: false,
            absent_marker: false,
            needs: Needs::Always,
        }
    }

    const fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    const fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    const fn offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    const fn pv_string(mut self) -> Self {
        self.absent_marker = true;
        self
    }

    const fn needs(mut self, needs: Needs) -> Self {
        self.needs = needs;
        self
    }

    /// Convert a raw register. `None` when the register reports the
    /// absent marker.
    pub fn decode(&self, raw: u16) -> Option<f64> {
        if self.absent_marker && raw == PV_ABSENT {
            return None;
        }
        let base = if self.signed {
            f64::from(to_signed(raw))
        } else {
            f64::from(raw)
        };
        let value = (base - self.offset) * self.scale;
        if self.negate && value != 0.0 {
            Some(-value)
        } else {
            Some(value)
        }
    }

    pub fn is_active(&self, capabilities: &DeviceCapabilities) -> bool {
        match self.needs {
            Needs::Always => true,
            Needs::Battery => capabilities.has_battery,
            Needs::SecondPvString => capabilities.pv_string_count >= 2,
        }
    }
}

use Field::*;

// Temperatures are reported in 0.1 degC with a +100 degC bias.
const TEMP_OFFSET: f64 = 1000.0;

static THREE_PHASE: [FieldSpec; 20] = [
    FieldSpec::plain(Pv1Power, 514, 1.0).pv_string(),
    FieldSpec::plain(Pv2Power, 515, 1.0)
        .pv_string()
        .needs(Needs::SecondPvString),
    // Battery current is positive when discharging on the wire
    FieldSpec::plain(BatteryCurrent, 586, 0.01)
        .signed()
        .negated()
        .needs(Needs::Battery),
    FieldSpec::plain(BatteryVoltage, 587, 0.01).needs(Needs::Battery),
    FieldSpec::plain(BatterySoc, 588, 1.0).needs(Needs::Battery),
    FieldSpec::plain(GridVoltage, 598, 0.1),
    FieldSpec::plain(GridPower, 607, 1.0).signed(),
    FieldSpec::plain(LoadPower, 653, 1.0),
    FieldSpec::plain(LoadL1, 650, 1.0),
    FieldSpec::plain(LoadL2, 651, 1.0),
    FieldSpec::plain(LoadL3, 652, 1.0),
    FieldSpec::plain(VoltageL1, 644, 0.1),
    FieldSpec::plain(VoltageL2, 645, 0.1),
    FieldSpec::plain(VoltageL3, 646, 0.1),
    FieldSpec::plain(DcTemperature, 540, 0.1).offset(TEMP_OFFSET),
    FieldSpec::plain(HeatsinkTemperature, 541, 0.1).offset(TEMP_OFFSET),
    FieldSpec::plain(DailyPv, 502, 0.1),
    FieldSpec::plain(DailyGridImport, 520, 0.1),
    FieldSpec::plain(DailyGridExport, 521, 0.1),
    FieldSpec::plain(DailyLoad, 526, 0.1),
];

static SINGLE_PHASE: [FieldSpec; 16] = [
    FieldSpec::plain(Pv1Power, 186, 1.0).pv_string(),
    FieldSpec::plain(Pv2Power, 187, 1.0)
        .pv_string()
        .needs(Needs::SecondPvString),
    FieldSpec::plain(BatteryVoltage, 183, 0.01).needs(Needs::Battery),
    FieldSpec::plain(BatterySoc, 184, 1.0).needs(Needs::Battery),
    FieldSpec::plain(BatteryCurrent, 191, 0.01)
        .signed()
        .negated()
        .needs(Needs::Battery),
    FieldSpec::plain(GridVoltage, 150, 0.1),
    FieldSpec::plain(GridPower, 169, 1.0).signed(),
    FieldSpec::plain(LoadPower, 178, 1.0),
    FieldSpec::plain(LoadL1, 176, 1.0),
    FieldSpec::plain(VoltageL1, 150, 0.1),
    FieldSpec::plain(DcTemperature, 90, 0.1).offset(TEMP_OFFSET),
    FieldSpec::plain(HeatsinkTemperature, 91, 0.1).offset(TEMP_OFFSET),
    FieldSpec::plain(DailyPv, 108, 0.1),
    FieldSpec::plain(DailyGridImport, 76, 0.1),
    FieldSpec::plain(DailyGridExport, 77, 0.1),
    FieldSpec::plain(DailyLoad, 84, 0.1),
];

/// Register map in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterLayout {
    ThreePhase,
    SinglePhase,
}

impl RegisterLayout {
    pub fn for_capabilities(capabilities: &DeviceCapabilities) -> Self {
        if capabilities.phase_count >= 3 {
            RegisterLayout::ThreePhase
        } else {
            RegisterLayout::SinglePhase
        }
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            RegisterLayout::ThreePhase => &THREE_PHASE,
            RegisterLayout::SinglePhase => &SINGLE_PHASE,
        }
    }

    pub fn spec(&self, field: Field) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|spec| spec.field == field)
    }

    pub fn address_of(&self, field: Field) -> Option<u16> {
        self.spec(field).map(|spec| spec.address)
    }

    /// Per-phase load fields, L1 first
    pub fn phase_load_fields(&self) -> &'static [Field] {
        match self {
            RegisterLayout::ThreePhase => &[LoadL1, LoadL2, LoadL3],
            RegisterLayout::SinglePhase => &[LoadL1],
        }
    }

    /// Per-phase voltage fields, L1 first
    pub fn phase_voltage_fields(&self) -> &'static [Field] {
        match self {
            RegisterLayout::ThreePhase => &[VoltageL1, VoltageL2, VoltageL3],
            RegisterLayout::SinglePhase => &[VoltageL1],
        }
    }

    pub fn active_fields(&self, capabilities: &DeviceCapabilities) -> Vec<&'static FieldSpec> {
        self.fields()
            .iter()
            .filter(|spec| spec.is_active(capabilities))
            .collect()
    }

    /// Fields the battery sampler needs
    pub fn battery_fields(&self) -> Vec<&'static FieldSpec> {
        self.fields()
            .iter()
            .filter(|spec| spec.needs == Needs::Battery)
            .collect()
    }
}

/// A contiguous read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlock {
    pub start: u16,
    pub count: u16,
}

/// Merge addresses into as few reads as the limits allow.
///
/// Neighbouring addresses join one block when the hole between them is at
/// most `max_gap` registers and the block stays within `max_len`.
pub fn plan_reads<I>(addresses: I, max_gap: u16, max_len: u16) -> Vec<ReadBlock>
where
    I: IntoIterator<Item = u16>,
{
    let mut sorted: Vec<u16> = addresses.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let max_len = u32::from(max_len.max(1));
    let mut blocks: Vec<ReadBlock> = Vec::new();
    let mut current: Option<(u16, u16)> = None;

    for address in sorted {
        current = match current {
            Some((start, end))
                if u32::from(address - end) <= u32::from(max_gap) + 1
                    && u32::from(address - start) < max_len =>
            {
                Some((start, address))
            }
            Some((start, end)) => {
                blocks.push(ReadBlock {
                    start,
                    count: end - start + 1,
                });
                Some((address, address))
            }
            None => Some((address, address)),
        };
    }
    if let Some((start, end)) = current {
        blocks.push(ReadBlock {
            start,
            count: end - start + 1,
        });
    }
    blocks
}

/// The fields to read on one cycle and how to read them
#[derive(Debug, Clone)]
pub struct ReadPlan {
    pub layout: RegisterLayout,
    pub fields: Vec<&'static FieldSpec>,
    pub blocks: Vec<ReadBlock>,
}

impl ReadPlan {
    fn from_fields(
        layout: RegisterLayout,
        fields: Vec<&'static FieldSpec>,
        max_gap: u16,
        max_len: u16,
    ) -> Self {
        let blocks = plan_reads(fields.iter().map(|spec| spec.address), max_gap, max_len);
        Self {
            layout,
            fields,
            blocks,
        }
    }

    /// Everything the capabilities allow
    pub fn full(capabilities: &DeviceCapabilities, max_gap: u16, max_len: u16) -> Self {
        let layout = RegisterLayout::for_capabilities(capabilities);
        Self::from_fields(layout, layout.active_fields(capabilities), max_gap, max_len)
    }

    /// Battery voltage, current and SOC only
    pub fn battery(capabilities: &DeviceCapabilities, max_gap: u16, max_len: u16) -> Self {
        let layout = RegisterLayout::for_capabilities(capabilities);
        Self::from_fields(layout, layout.battery_fields(), max_gap, max_len)
    }
}

/// Register values gathered during one cycle, keyed by address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRegisters {
    words: BTreeMap<u16, u16>,
}

impl RawRegisters {
    pub fn insert_block(&mut self, start: u16, words: &[u16]) {
        for (offset, word) in words.iter().enumerate() {
            self.words.insert(start.wrapping_add(offset as u16), *word);
        }
    }

    pub fn insert(&mut self, address: u16, word: u16) {
        self.words.insert(address, word);
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        self.words.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}
