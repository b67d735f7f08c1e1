use std::fmt::Display;

use itertools::Itertools;
use rust_decimal::Decimal;
use serde::Serialize;

use super::span::*;

pub(crate) type EnumTable = &'static [(u16, &'static str)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) enum Unit {
  #[serde(rename = "")]
  None,
  #[serde(rename = "V")]
  Volt,
  #[serde(rename = "A")]
  Ampere,
  #[serde(rename = "W")]
  Watt,
  #[serde(rename = "Wh")]
  WattHour,
  #[serde(rename = "kWh")]
  KilowattHour,
  #[serde(rename = "Ah")]
  AmpereHour,
  #[serde(rename = "°C")]
  Celsius,
  #[serde(rename = "%")]
  Percent,
  #[serde(rename = "d")]
  Day,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
  Unsigned,
  /// Two's complement for words, sign-magnitude (bit 7) for single bytes.
  Signed,
  Enum(EnumTable),
  Text,
}

/// Which bits of the entry's words carry the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Part {
  Word,
  High,
  Low,
  Bit(u8),
}

impl Part {
  fn mask(self) -> u16 {
    match self {
      Part::Word => u16::MAX,
      Part::High => 0xFF00,
      Part::Low => 0x00FF,
      Part::Bit(bit) => 1u16.checked_shl(bit as u32).unwrap_or(0),
    }
  }
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
  pub(crate) offset: Address,
  pub(crate) length: Quantity,
  pub(crate) name: &'static str,
  pub(crate) unit: Unit,
  pub(crate) scale: Decimal,
  pub(crate) kind: Kind,
  pub(crate) part: Part,
}

impl Entry {
  pub(crate) fn unsigned(
    offset: Address,
    name: &'static str,
    unit: Unit,
    scale: Decimal,
  ) -> Self {
    Self {
      offset,
      length: 1,
      name,
      unit,
      scale,
      kind: Kind::Unsigned,
      part: Part::Word,
    }
  }

  pub(crate) fn signed(
    offset: Address,
    name: &'static str,
    unit: Unit,
    scale: Decimal,
  ) -> Self {
    Self {
      kind: Kind::Signed,
      ..Self::unsigned(offset, name, unit, scale)
    }
  }

  pub(crate) fn enumeration(
    offset: Address,
    name: &'static str,
    table: EnumTable,
  ) -> Self {
    Self {
      kind: Kind::Enum(table),
      ..Self::unsigned(offset, name, Unit::None, Decimal::ONE)
    }
  }

  pub(crate) fn text(
    offset: Address,
    name: &'static str,
    length: Quantity,
  ) -> Self {
    Self {
      length,
      kind: Kind::Text,
      ..Self::unsigned(offset, name, Unit::None, Decimal::ONE)
    }
  }

  pub(crate) fn wide(self) -> Self {
    Self { length: 2, ..self }
  }

  pub(crate) fn part(self, part: Part) -> Self {
    Self { part, ..self }
  }

  fn end(&self) -> u32 {
    self.offset as u32 + self.length as u32
  }

  fn coverage(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
    (self.offset as u32..self.end()).map(|word| (word, self.part.mask()))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum RegisterMapError {
  #[error("Register map has no entries")]
  Empty,

  #[error("Register map has duplicate entry {0:?}")]
  DuplicateName(&'static str),

  #[error("Entry {0:?} has an unsupported length")]
  InvalidLength(&'static str),

  #[error("Entry {0:?} selects an invalid part of its register")]
  InvalidPart(&'static str),

  #[error("Entries {0:?} and {1:?} overlap")]
  Overlap(&'static str, &'static str),
}

#[derive(Debug, Clone)]
pub(crate) struct RegisterMap {
  version: u32,
  entries: Vec<Entry>,
}

impl RegisterMap {
  pub(crate) fn new(
    version: u32,
    entries: Vec<Entry>,
  ) -> Result<Self, RegisterMapError> {
    if entries.is_empty() {
      return Err(RegisterMapError::Empty);
    }

    if let Some(name) =
      entries.iter().map(|entry| entry.name).duplicates().next()
    {
      return Err(RegisterMapError::DuplicateName(name));
    }

    for entry in &entries {
      let length_ok = match entry.kind {
        Kind::Text => entry.length >= 1,
        _ => entry.length == 1 || entry.length == 2,
      };
      if !length_ok {
        return Err(RegisterMapError::InvalidLength(entry.name));
      }

      let part_ok = match entry.part {
        Part::Word => true,
        Part::Bit(bit) => bit < 16 && entry.length == 1,
        Part::High | Part::Low => entry.length == 1,
      } && !(matches!(entry.kind, Kind::Text) && entry.part != Part::Word);
      if !part_ok {
        return Err(RegisterMapError::InvalidPart(entry.name));
      }
    }

    let coverage = entries
      .iter()
      .flat_map(|entry| {
        entry
          .coverage()
          .map(move |(word, mask)| (word, mask, entry.name))
      })
      .collect::<Vec<_>>();
    let overlap = coverage.iter().tuple_combinations().find(
      |((left_word, left_mask, _), (right_word, right_mask, _))| {
        left_word == right_word && (left_mask & right_mask) != 0
      },
    );
    if let Some(((_, _, left), (_, _, right))) = overlap {
      return Err(RegisterMapError::Overlap(*left, *right));
    }

    Ok(Self { version, entries })
  }

  pub(crate) fn version(&self) -> u32 {
    self.version
  }

  pub(crate) fn entries(&self) -> &[Entry] {
    &self.entries
  }

  /// Number of words a block must carry to cover every entry.
  pub(crate) fn words(&self) -> Quantity {
    self
      .entries
      .iter()
      .map(Entry::end)
      .max()
      .unwrap_or(0) as Quantity
  }
}

/// A register map anchored at a device register address.
#[derive(Debug, Clone)]
pub(crate) struct Section {
  pub(crate) name: &'static str,
  pub(crate) address: Address,
  pub(crate) map: RegisterMap,
  pub(crate) identity: bool,
}

impl Span for Section {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.map.words()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawBlock {
  pub(crate) version: u32,
  pub(crate) words: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub(crate) enum Value {
  Number(Decimal),
  Enum(&'static str),
  Text(String),
}

impl Display for Value {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Value::Number(value) => Display::fmt(value, f),
      Value::Enum(value) => Display::fmt(value, f),
      Value::Text(value) => Display::fmt(value, f),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Measurement {
  pub(crate) name: &'static str,
  pub(crate) value: Value,
  pub(crate) unit: Unit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum DecodeFailure {
  #[error("Block has {actual} words but the map needs {expected}")]
  LengthMismatch { expected: usize, actual: usize },

  #[error("Block was requested with map version {actual}, expected {expected}")]
  VersionMismatch { expected: u32, actual: u32 },

  #[error("Unknown code {code} for {field} (raw {})", hex::encode(.raw))]
  UnknownEnumCode {
    field: &'static str,
    code: u32,
    raw: Vec<u8>,
  },

  #[error("Invalid text in {field} (raw {})", hex::encode(.raw))]
  InvalidText { field: &'static str, raw: Vec<u8> },

  #[error("Scaling {field} overflowed (raw {})", hex::encode(.raw))]
  Overflow { field: &'static str, raw: Vec<u8> },
}

impl DecodeFailure {
  pub(crate) fn field(&self) -> Option<&'static str> {
    match self {
      DecodeFailure::LengthMismatch { .. } => None,
      DecodeFailure::VersionMismatch { .. } => None,
      DecodeFailure::UnknownEnumCode { field, .. } => Some(*field),
      DecodeFailure::InvalidText { field, .. } => Some(*field),
      DecodeFailure::Overflow { field, .. } => Some(*field),
    }
  }
}

/// Decodes every entry of `map` out of `block`.
///
/// Fails the whole batch on the first entry that does not decode.
pub(crate) fn decode(
  block: &RawBlock,
  map: &RegisterMap,
) -> Result<Vec<Measurement>, DecodeFailure> {
  if block.version != map.version {
    return Err(DecodeFailure::VersionMismatch {
      expected: map.version,
      actual: block.version,
    });
  }

  let expected = map.words() as usize;
  if block.words.len() != expected {
    return Err(DecodeFailure::LengthMismatch {
      expected,
      actual: block.words.len(),
    });
  }

  map
    .entries
    .iter()
    .map(|entry| decode_entry(entry, &block.words))
    .collect()
}

fn decode_entry(
  entry: &Entry,
  words: &[u16],
) -> Result<Measurement, DecodeFailure> {
  let start = entry.offset as usize;
  let end = entry.end() as usize;
  let data = match words.get(start..end) {
    Some(data) => data,
    None => {
      return Err(DecodeFailure::LengthMismatch {
        expected: end,
        actual: words.len(),
      })
    }
  };

  let value = match entry.kind {
    Kind::Unsigned => scale(entry, data, Decimal::from(raw(entry, data)))?,
    Kind::Signed => scale(entry, data, Decimal::from(signed(entry, data)))?,
    Kind::Enum(table) => {
      let code = raw(entry, data);
      match table.iter().find(|(known, _)| u32::from(*known) == code) {
        Some((_, label)) => Value::Enum(*label),
        None => {
          return Err(DecodeFailure::UnknownEnumCode {
            field: entry.name,
            code,
            raw: to_bytes(data),
          })
        }
      }
    }
    Kind::Text => {
      let mut bytes = to_bytes(data);
      while let Some(0x00 | b' ') = bytes.last() {
        bytes.pop();
      }
      match String::from_utf8(bytes) {
        Ok(text) => Value::Text(text),
        Err(_) => {
          return Err(DecodeFailure::InvalidText {
            field: entry.name,
            raw: to_bytes(data),
          })
        }
      }
    }
  };

  Ok(Measurement {
    name: entry.name,
    value,
    unit: entry.unit,
  })
}

fn scale(
  entry: &Entry,
  data: &[u16],
  value: Decimal,
) -> Result<Value, DecodeFailure> {
  match value.checked_mul(entry.scale) {
    Some(value) => Ok(Value::Number(value)),
    None => Err(DecodeFailure::Overflow {
      field: entry.name,
      raw: to_bytes(data),
    }),
  }
}

fn compose(data: &[u16]) -> u32 {
  data
    .iter()
    .fold(0u32, |acc, word| (acc << 16) | *word as u32)
}

fn raw(entry: &Entry, data: &[u16]) -> u32 {
  let composed = compose(data);
  match entry.part {
    Part::Word => composed,
    Part::High => (composed >> 8) & 0xFF,
    Part::Low => composed & 0xFF,
    Part::Bit(bit) => (composed >> bit) & 1,
  }
}

fn signed(entry: &Entry, data: &[u16]) -> i64 {
  let raw = raw(entry, data);
  match (entry.part, entry.length) {
    (Part::High | Part::Low, _) => {
      let magnitude = (raw & 0x7F) as i64;
      if raw & 0x80 != 0 {
        -magnitude
      } else {
        magnitude
      }
    }
    (Part::Bit(_), _) => raw as i64,
    (Part::Word, 1) => raw as u16 as i16 as i64,
    (Part::Word, _) => raw as i32 as i64,
  }
}

fn to_bytes(data: &[u16]) -> Vec<u8> {
  data.iter().flat_map(|word| word.to_be_bytes()).collect()
}
