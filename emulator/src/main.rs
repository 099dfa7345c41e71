mod command;
mod session;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use session::Session;

const USAGE: &str = "Usage: bootloader-emulator [--transcript <path>] [--scratch-kib <n>]";

#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    transcript: Option<PathBuf>,
    scratch_kib: Option<u32>,
}

fn main() -> io::Result<()> {
    let options = parse_options(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });
    let layout = session::layout(options.scratch_kib).unwrap_or_else(|err| {
        eprintln!("{err}");
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(layout, options.transcript.as_deref())?;
    let mut line = String::new();

    writeln!(
        writer,
        "Swap bootloader emulator ready (scratch {:#x} bytes). Type `help` for commands or `exit` to quit.",
        layout.scratch.size
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        let responses = session.handle_command(trimmed)?;
        for response in responses {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_options(args: impl IntoIterator<Item = String>) -> Result<Options, String> {
    let mut options = Options::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_owned(), Some(value.to_owned())),
            None => (arg, None),
        };
        let mut value = || {
            inline
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| format!("Expected value after {flag}"))
        };

        match flag.as_str() {
            "--transcript" => options.transcript = Some(PathBuf::from(value()?)),
            "--scratch-kib" => {
                let raw = value()?;
                let kib = raw
                    .parse()
                    .map_err(|_| format!("Invalid scratch size `{raw}`"))?;
                options.scratch_kib = Some(kib);
            }
            other => return Err(format!("Unknown option `{other}`")),
        }
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| (*arg).to_owned()).collect()
    }

    #[test]
    fn options_accept_separate_and_inline_values() {
        assert_eq!(
            parse_options(args(&["--transcript", "out.log", "--scratch-kib=8"])),
            Ok(Options {
                transcript: Some(PathBuf::from("out.log")),
                scratch_kib: Some(8),
            })
        );
        assert_eq!(parse_options(args(&[])), Ok(Options::default()));
    }

    #[test]
    fn options_reject_unknown_or_incomplete_flags() {
        assert!(parse_options(args(&["--scratch-kib"])).is_err());
        assert!(parse_options(args(&["--scratch-kib", "lots"])).is_err());
        assert!(parse_options(args(&["--verbose"])).is_err());
    }
}
