//! Emulator command grammar.
//!
//! ```text
//! stage <size> [version]   reserved <index> [value]
//! boot                     cut <steps>
//! confirm                  status
//! help [topic]
//! ```
//!
//! Numbers are decimal or `0x`-prefixed hex.

use winnow::ascii::{dec_uint, hex_uint, space0, space1};
use winnow::combinator::{alt, eof, opt, preceded, terminated};
use winnow::prelude::*;
use winnow::token::take_while;

pub const VERSION_BYTES: usize = bootloader_core::env::record::VERSION_BYTES;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Writes a synthetic image into the update region and requests the swap.
    Stage {
        size: u32,
        version: Option<[u8; VERSION_BYTES]>,
    },
    Boot,
    Confirm,
    /// Arms a power cut after this many flash steps.
    Cut { steps: u32 },
    Status,
    Reserved { index: u32, value: Option<u32> },
    Help { topic: Option<String> },
}

pub fn parse(line: &str) -> Result<Command, String> {
    command.parse(line).map_err(|err| err.to_string())
}

fn command(input: &mut &str) -> ModalResult<Command> {
    let _ = space0.parse_next(input)?;
    terminated(
        alt((
            stage,
            "boot".value(Command::Boot),
            "confirm".value(Command::Confirm),
            preceded(("cut", space1), number).map(|steps| Command::Cut { steps }),
            "status".value(Command::Status),
            reserved,
            help,
        )),
        (space0, eof),
    )
    .parse_next(input)
}

fn stage(input: &mut &str) -> ModalResult<Command> {
    preceded(("stage", space1), (number, opt(preceded(space1, version))))
        .map(|(size, version)| Command::Stage { size, version })
        .parse_next(input)
}

fn reserved(input: &mut &str) -> ModalResult<Command> {
    preceded(("reserved", space1), (number, opt(preceded(space1, number))))
        .map(|(index, value)| Command::Reserved { index, value })
        .parse_next(input)
}

fn help(input: &mut &str) -> ModalResult<Command> {
    preceded("help", opt(preceded(space1, word)))
        .map(|topic| Command::Help {
            topic: topic.map(str::to_owned),
        })
        .parse_next(input)
}

fn number(input: &mut &str) -> ModalResult<u32> {
    alt((preceded(alt(("0x", "0X")), hex_uint), dec_uint)).parse_next(input)
}

fn version(input: &mut &str) -> ModalResult<[u8; VERSION_BYTES]> {
    take_while(1..=VERSION_BYTES, |c: char| c.is_ascii_graphic())
        .map(|text: &str| {
            let mut version = [0; VERSION_BYTES];
            version[..text.len()].copy_from_slice(text.as_bytes());
            version
        })
        .parse_next(input)
}

fn word<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric()).parse_next(input)
}
