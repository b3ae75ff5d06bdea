//! Reader for the `desc:`, `cmd:` and `time_unit:` lines that open a massif file.

use crate::lines::{Line, LineSource};
use crate::{ParseError, Result, TimeUnit};
use log::debug;
use std::io;

const DESC: &str = "desc";
const CMD: &str = "cmd";
const TIME_UNIT: &str = "time_unit";

/// Metadata read from the header lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub description: String,
    pub command: String,
    pub time_unit: TimeUnit,
}

/// Consume header lines up to the first line that is not a known header key.
///
/// That line is pushed back for the snapshot reader.
pub(crate) fn read_header<I>(source: &mut LineSource<I>) -> Result<Header>
where
    I: Iterator<Item = io::Result<String>>,
{
    let mut description: Option<String> = None;
    let mut command: Option<String> = None;
    let mut time_unit: Option<TimeUnit> = None;

    let stop_line = loop {
        let Some(line) = source.next_field_line()? else {
            break source.end_line();
        };

        let Some((key, value)) = line.text.split_once(':') else {
            break push_back(source, line);
        };
        let value = value.trim();

        match key {
            DESC => set_once(&mut description, DESC, value.to_string(), &line)?,
            CMD => set_once(&mut command, CMD, value.to_string(), &line)?,
            TIME_UNIT => {
                let unit = value
                    .parse::<TimeUnit>()
                    .map_err(|reason| ParseError::MalformedHeader {
                        line: line.number,
                        key: TIME_UNIT,
                        reason,
                    })?;
                set_once(&mut time_unit, TIME_UNIT, unit, &line)?;
            }
            _ => break push_back(source, line),
        }
    };

    let missing = |key: &'static str| ParseError::MalformedHeader {
        line: stop_line,
        key,
        reason: "is missing".to_string(),
    };

    let header = Header {
        description: description.ok_or_else(|| missing(DESC))?,
        command: command.ok_or_else(|| missing(CMD))?,
        time_unit: time_unit.ok_or_else(|| missing(TIME_UNIT))?,
    };

    debug!(
        "massif header: cmd='{}' desc='{}' time_unit={}",
        header.command, header.description, header.time_unit
    );

    Ok(header)
}

fn push_back<I>(source: &mut LineSource<I>, line: Line) -> usize
where
    I: Iterator<Item = io::Result<String>>,
{
    let number = line.number;
    source.push_back(line);
    number
}

fn set_once<T>(slot: &mut Option<T>, key: &'static str, value: T, line: &Line) -> Result<()> {
    if slot.is_some() {
        return Err(ParseError::MalformedHeader {
            line: line.number,
            key,
            reason: "appears more than once".to_string(),
        });
    }
    *slot = Some(value);
    Ok(())
}
