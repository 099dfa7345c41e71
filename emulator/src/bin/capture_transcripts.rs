//! Records scripted emulator sessions as transcripts under `transcripts/`.

use std::io;
use std::path::Path;

#[allow(dead_code)]
#[path = "../command.rs"]
mod command;
#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::Session;

const SCRIPTS: &[(&str, &[&str])] = &[
    (
        "transcripts/update-commit.log",
        &["boot", "stage 0x8000 2.0", "boot", "status", "confirm", "boot", "status"],
    ),
    (
        "transcripts/update-rollback.log",
        &["boot", "stage 0x8000 2.0", "boot", "boot", "status"],
    ),
    (
        "transcripts/power-cut.log",
        &[
            "boot",
            "stage 0x8000 2.0",
            "cut 5000",
            "boot",
            "status",
            "boot",
            "status",
        ],
    ),
];

fn main() -> io::Result<()> {
    let layout = session::layout(None).map_err(io::Error::other)?;
    for (path, script) in SCRIPTS {
        let mut session = Session::new(layout, Some(Path::new(path)))?;
        for line in *script {
            let _ = session.handle_command(line)?;
        }
        println!("wrote {path}");
    }
    Ok(())
}
