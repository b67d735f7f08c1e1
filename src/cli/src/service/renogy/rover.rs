//! Register layout of Rover, Wanderer and Adventurer charge controllers.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::register::*;
use super::span::Address;

pub(crate) const MAP_VERSION: u32 = 1;

pub(crate) const IDENTITY_ADDRESS: Address = 0x000C;
pub(crate) const TELEMETRY_ADDRESS: Address = 0x0100;
pub(crate) const BATTERY_ADDRESS: Address = 0xE004;

pub(crate) const CHARGING_STATUSES: EnumTable = &[
  (0, "deactivated"),
  (1, "activated"),
  (2, "mppt"),
  (3, "equalizing"),
  (4, "boost"),
  (5, "floating"),
  (6, "current limiting"),
];

pub(crate) const LOAD_STATUSES: EnumTable = &[(0, "off"), (1, "on")];

pub(crate) const BATTERY_TYPES: EnumTable = &[
  (1, "open"),
  (2, "sealed"),
  (3, "gel"),
  (4, "lithium"),
  (5, "custom"),
];

pub(crate) const MODEL: &str = "model";
pub(crate) const SOFTWARE_VERSION: &str = "software_version";
pub(crate) const SERIAL_NUMBER: &str = "serial_number";

pub(crate) fn sections() -> Result<Vec<Section>, RegisterMapError> {
  Ok(vec![
    Section {
      name: "identity",
      address: IDENTITY_ADDRESS,
      map: identity()?,
      identity: true,
    },
    Section {
      name: "telemetry",
      address: TELEMETRY_ADDRESS,
      map: telemetry()?,
      identity: false,
    },
    Section {
      name: "battery",
      address: BATTERY_ADDRESS,
      map: battery()?,
      identity: false,
    },
  ])
}

fn identity() -> Result<RegisterMap, RegisterMapError> {
  RegisterMap::new(
    MAP_VERSION,
    vec![
      Entry::text(0, MODEL, 8),
      Entry::unsigned(8, SOFTWARE_VERSION, Unit::None, Decimal::ONE).wide(),
      Entry::unsigned(10, "hardware_version", Unit::None, Decimal::ONE).wide(),
      Entry::unsigned(12, SERIAL_NUMBER, Unit::None, Decimal::ONE).wide(),
      Entry::unsigned(14, "device_address", Unit::None, Decimal::ONE),
    ],
  )
}

fn telemetry() -> Result<RegisterMap, RegisterMapError> {
  let volts = dec!(0.1);
  let amps = dec!(0.01);
  let one = Decimal::ONE;

  RegisterMap::new(
    MAP_VERSION,
    vec![
      Entry::unsigned(0, "battery_percentage", Unit::Percent, one),
      Entry::unsigned(1, "battery_voltage", Unit::Volt, volts),
      Entry::unsigned(2, "battery_current", Unit::Ampere, amps),
      Entry::signed(3, "controller_temperature", Unit::Celsius, one)
        .part(Part::High),
      Entry::signed(3, "battery_temperature", Unit::Celsius, one)
        .part(Part::Low),
      Entry::unsigned(4, "load_voltage", Unit::Volt, volts),
      Entry::unsigned(5, "load_current", Unit::Ampere, amps),
      Entry::unsigned(6, "load_power", Unit::Watt, one),
      Entry::unsigned(7, "pv_voltage", Unit::Volt, volts),
      Entry::unsigned(8, "pv_current", Unit::Ampere, amps),
      Entry::unsigned(9, "pv_power", Unit::Watt, one),
      Entry::unsigned(11, "min_battery_voltage_today", Unit::Volt, volts),
      Entry::unsigned(12, "max_battery_voltage_today", Unit::Volt, volts),
      Entry::unsigned(13, "max_charging_current_today", Unit::Ampere, amps),
      Entry::unsigned(14, "max_discharging_current_today", Unit::Ampere, amps),
      Entry::unsigned(15, "max_charging_power_today", Unit::Watt, one),
      Entry::unsigned(16, "max_discharging_power_today", Unit::Watt, one),
      Entry::unsigned(17, "charging_amp_hours_today", Unit::AmpereHour, one),
      Entry::unsigned(18, "discharging_amp_hours_today", Unit::AmpereHour, one),
      Entry::unsigned(19, "power_generation_today", Unit::WattHour, one),
      Entry::unsigned(20, "power_consumption_today", Unit::WattHour, one),
      Entry::unsigned(21, "total_operating_days", Unit::Day, one),
      Entry::unsigned(22, "total_battery_over_discharges", Unit::None, one),
      Entry::unsigned(23, "total_battery_full_charges", Unit::None, one),
      Entry::unsigned(24, "total_charging_amp_hours", Unit::AmpereHour, one)
        .wide(),
      Entry::unsigned(26, "total_discharging_amp_hours", Unit::AmpereHour, one)
        .wide(),
      Entry::unsigned(28, "power_generation_total", Unit::KilowattHour, one)
        .wide(),
      Entry::unsigned(30, "power_consumption_total", Unit::KilowattHour, one)
        .wide(),
      Entry::enumeration(32, "load_status", LOAD_STATUSES).part(Part::Bit(15)),
      Entry::enumeration(32, "charging_status", CHARGING_STATUSES)
        .part(Part::Low),
    ],
  )
}

fn battery() -> Result<RegisterMap, RegisterMapError> {
  RegisterMap::new(
    MAP_VERSION,
    vec![Entry::enumeration(0, "battery_type", BATTERY_TYPES)],
  )
}
