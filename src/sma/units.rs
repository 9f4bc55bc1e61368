use crate::prelude::*;

use nom::{
    bytes::complete::{take_till, take_while1},
    character::complete::{char, hex_digit1, space0, space1},
    combinator::map_res,
    number::complete::double,
    sequence::{delimited, tuple},
    IResult,
};

const SECTION_START: &str = ":unit conversions";
const SECTION_END: &str = ":end unit conversions";

/// How to present one `(key1, key2)` spot value.
#[derive(Clone, Debug, PartialEq)]
pub struct Unit {
    pub key1: u8,
    pub key2: u8,
    pub description: String,
    pub units: String,
    pub divisor: f64,
}

impl Unit {
    pub fn scale(&self, raw: u32) -> f64 {
        if self.divisor == 0.0 {
            raw as f64
        } else {
            raw as f64 / self.divisor
        }
    }
}

/// Conversion table read from the `:unit conversions` section of a command
/// script, one `key1 key2 "description" units divisor` line per entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnitTable {
    entries: Vec<Unit>,
}

impl UnitTable {
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        let mut in_section = false;

        for (number, line) in text.lines().enumerate() {
            if line.starts_with('#') {
                continue;
            }
            if line.starts_with(SECTION_END) {
                in_section = false;
                continue;
            }
            if line.starts_with(SECTION_START) {
                in_section = true;
                continue;
            }
            if !in_section || line.trim().is_empty() {
                continue;
            }

            match entry(line) {
                Ok((_, unit)) => entries.push(unit),
                Err(err) => warn!("line {}: ignoring unit conversion {:?}: {}", number + 1, line, err),
            }
        }

        debug!("loaded {} unit conversions", entries.len());
        Self { entries }
    }

    pub fn lookup(&self, key1: u8, key2: u8) -> Option<&Unit> {
        self.entries.iter().find(|u| u.key1 == key1 && u.key2 == key2)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn hex_byte(input: &str) -> IResult<&str, u8> {
    map_res(hex_digit1, |s| u8::from_str_radix(s, 16))(input)
}

fn entry(input: &str) -> IResult<&str, Unit> {
    let (rest, (_, key1, _, key2, _, description, _, units, _, divisor)) = tuple((
        space0,
        hex_byte,
        space1,
        hex_byte,
        space1,
        delimited(char('"'), take_till(|c| c == '"'), char('"')),
        space1,
        take_while1(|c: char| !c.is_whitespace()),
        space1,
        double,
    ))(input)?;

    Ok((
        rest,
        Unit {
            key1,
            key2,
            description: description.to_string(),
            units: units.to_string(),
            divisor,
        },
    ))
}
