use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant as HostInstant};

use bootloader_core::app_env::{AppEnv, AppEnvError};
use bootloader_core::boot::{BootConfig, Bootloader, Delay, Terminal};
use bootloader_core::env::{BootFlag, EnvRecord, EnvStore, ImageDescriptor};
use bootloader_core::flash::sim::RamFlash;
use bootloader_core::flash::{Flash, FlashIoError, Word};
use bootloader_core::layout::{FlashLayout, Region, RegionId, STM32F103_LAYOUT};
use bootloader_core::telemetry::{BootEvent, TelemetrySink};
use crc::{CRC_32_ISO_HDLC, Crc};

use crate::command::{self, Command, VERSION_BYTES};

/// Words of simulated flash: the full 256 KiB part.
pub const FLASH_WORDS: usize = 0x1_0000;

const FACTORY_IMAGE_SIZE: u32 = 0x1_2345;
const FACTORY_VERSION: [u8; VERSION_BYTES] = *b"1.0\0";

const FINGERPRINT: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "stage",
        "stage <size> [version]      - write an update image and request the swap",
    ),
    (
        "boot",
        "boot                        - run the bootloader once",
    ),
    (
        "confirm",
        "confirm                     - mark the running update as good",
    ),
    (
        "cut",
        "cut <steps>                 - lose power after <steps> flash operations",
    ),
    (
        "status",
        "status                      - show the environment record and log banks",
    ),
    (
        "reserved",
        "reserved <index> [value]    - read or write an application word",
    ),
    (
        "help",
        "help [topic]                - show help for a command",
    ),
];

/// Layout used by the emulator, optionally with a different scratch size.
pub fn layout(scratch_kib: Option<u32>) -> Result<FlashLayout, String> {
    let mut layout = STM32F103_LAYOUT;
    if let Some(kib) = scratch_kib {
        let size = kib
            .checked_mul(1024)
            .ok_or_else(|| format!("scratch of {kib} KiB is too large"))?;
        layout.scratch = Region::new(layout.scratch.offset, size);
    }
    layout.validate().map_err(|err| format!("invalid layout: {err}"))?;
    Ok(layout)
}

pub struct Session {
    flash: Box<RamFlash<FLASH_WORDS>>,
    config: BootConfig,
    app: AppEnv,
    store: EnvStore,
    transcript: Option<TranscriptLogger>,
    started_at: HostInstant,
    boots: u32,
}

impl Session {
    /// Creates a device with a factory image in the current region and blank
    /// environment banks.
    pub fn new(layout: FlashLayout, transcript: Option<&Path>) -> io::Result<Self> {
        let transcript = transcript.map(TranscriptLogger::new).transpose()?;
        let mut flash = Box::new(RamFlash::new(layout.base, layout.page_size));
        let current = layout.address(RegionId::Current, 0);
        write_image(&mut *flash, current, FACTORY_IMAGE_SIZE, &FACTORY_VERSION)
            .map_err(|err| io::Error::other(err.to_string()))?;

        Ok(Self {
            flash,
            config: BootConfig::new(layout),
            app: AppEnv::new(&layout),
            store: EnvStore::new(&layout),
            transcript,
            started_at: HostInstant::now(),
            boots: 0,
        })
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.append_line(elapsed, TranscriptRole::Host, trimmed)?;
        }

        let lines = match command::parse(trimmed) {
            Ok(command) => self.execute(command),
            Err(err) => vec![format!("ERR syntax {}", err.lines().last().unwrap_or(""))],
        };

        if let Some(transcript) = self.transcript.as_mut() {
            for line in &lines {
                transcript.append_line(elapsed, TranscriptRole::Emulator, line)?;
            }
        }
        Ok(lines)
    }

    fn execute(&mut self, command: Command) -> Vec<String> {
        match command {
            Command::Stage { size, version } => self.stage(size, version),
            Command::Boot => self.boot(),
            Command::Confirm => match self.app.confirm_update(&mut *self.flash) {
                Ok(record) => vec![format!("OK flag={}", record.boot_flag)],
                Err(err) => vec![format!("ERR confirm {err}")],
            },
            Command::Cut { steps } => {
                self.flash.cut_after(steps);
                vec![format!("OK power fails after {steps} flash steps")]
            }
            Command::Status => self.status(),
            Command::Reserved { index, value } => self.reserved(index, value),
            Command::Help { topic } => help(topic.as_deref()),
        }
    }

    fn stage(&mut self, size: u32, version: Option<[u8; VERSION_BYTES]>) -> Vec<String> {
        let version = version.unwrap_or(*b"next");
        let layout = self.config.layout;
        if size > layout.update.size {
            return vec![format!(
                "ERR stage image of {size:#x} bytes exceeds region of {:#x}",
                layout.update.size
            )];
        }

        if size == 0 {
            return vec![format!("ERR stage {}", AppEnvError::EmptyImage)];
        }
        // Outside NORMAL the update region may hold the image a rollback needs.
        let idle = self
            .app
            .read(&mut *self.flash)
            .and_then(|record| match record.boot_flag {
                BootFlag::Normal => Ok(()),
                flag => Err(AppEnvError::NotIdle(flag)),
            });
        if let Err(err) = idle {
            return vec![format!("ERR stage {err}")];
        }

        let update = layout.address(RegionId::Update, 0);
        if let Err(err) = write_image(&mut *self.flash, update, size, &version) {
            return vec![format!("ERR stage {err}")];
        }
        let descriptor = ImageDescriptor::new(version, [0; 36], size);
        match self.app.request_update(&mut *self.flash, descriptor) {
            Ok(record) => vec![format!(
                "OK staged {} ({size:#x} bytes) flag={}",
                version_label(&version),
                record.boot_flag
            )],
            Err(err) => vec![format!("ERR stage {err}")],
        }
    }

    fn boot(&mut self) -> Vec<String> {
        self.boots += 1;
        let mut lines = vec![format!("-- power-on #{} --", self.boots)];
        let mut console = ConsoleTelemetry::default();
        let mut delay = HostDelay::default();

        let terminal = {
            let mut bootloader = Bootloader::new(self.config, &mut *self.flash, &mut console);
            bootloader.execute(&mut delay)
        };

        lines.append(&mut console.lines);
        lines.push(match terminal {
            Terminal::Handoff { address } => {
                format!("hand-off to {address:#010x} after {} ms", delay.total.as_millis())
            }
            Terminal::Reset => format!("reset after {} ms", delay.total.as_millis()),
        });

        if !self.flash.is_powered() {
            self.flash.restore_power();
            lines.push("power restored".to_owned());
        }
        lines
    }

    fn status(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let powered = if self.flash.is_powered() { "on" } else { "off" };
        lines.push(format!(
            "power={powered} steps={} erases={} programs={}",
            self.flash.steps(),
            self.flash.erase_count(),
            self.flash.program_count()
        ));

        match self.store.inspect(&mut *self.flash) {
            Ok(loaded) => lines.extend(self.describe_record(&loaded.record)),
            Err(err) => lines.push(format!("environment: {err}")),
        }

        match self.store.occupancy(&mut *self.flash) {
            Ok(occupancy) => lines.push(format!(
                "log bank A sealed={} torn={} blank={} | bank B sealed={} torn={} blank={}",
                occupancy.primary.sealed,
                occupancy.primary.torn,
                occupancy.primary.blank,
                occupancy.rescue.sealed,
                occupancy.rescue.torn,
                occupancy.rescue.blank
            )),
            Err(err) => lines.push(format!("log: {err}")),
        }
        lines
    }

    fn describe_record(&self, record: &EnvRecord) -> Vec<String> {
        let layout = self.config.layout;
        let progress = record.swap_progress;
        let position = if progress.phase.is_chunk_boundary() {
            "between chunks"
        } else {
            "mid-chunk"
        };
        vec![
            format!("flag={}", record.boot_flag),
            format!(
                "current {} size={:#x} fingerprint={:08x}",
                version_label(&record.image_current.version),
                record.image_current.size,
                self.fingerprint(layout.current, record.image_current.size)
            ),
            format!(
                "update  {} size={:#x} fingerprint={:08x}",
                version_label(&record.image_update.version),
                record.image_update.size,
                self.fingerprint(layout.update, record.image_update.size)
            ),
            format!(
                "progress phase={} origin={:#x} update={:#x} carried={:#x} ({position})",
                progress.phase,
                progress.origin_offset,
                progress.update_offset,
                progress.carried_size
            ),
        ]
    }

    fn reserved(&mut self, index: u32, value: Option<u32>) -> Vec<String> {
        let Ok(index) = usize::try_from(index) else {
            return vec![format!("ERR reserved index {index} out of range")];
        };
        let result = match value {
            Some(value) => self
                .app
                .set_reserved(&mut *self.flash, index, value)
                .map(|_| value),
            None => self.app.reserved(&mut *self.flash, index),
        };
        match result {
            Ok(value) => vec![format!("reserved[{index}]={value:#010x}")],
            Err(err) => vec![format!("ERR reserved {err}")],
        }
    }

    fn fingerprint(&self, region: Region, bytes: u32) -> Word {
        let address = self.config.layout.base + region.offset;
        let words = usize::try_from(bytes.div_ceil(4)).unwrap_or(0);
        self.flash.peek(address, words).map_or(0, |words| {
            let mut digest = FINGERPRINT.digest();
            for word in words {
                digest.update(&word.to_le_bytes());
            }
            digest.finalize()
        })
    }
}

/// Fills `bytes` at `address` with a pattern derived from `version`.
fn write_image<F: Flash + ?Sized>(
    flash: &mut F,
    address: u32,
    bytes: u32,
    version: &[u8; VERSION_BYTES],
) -> Result<(), FlashIoError> {
    let seed = Word::from_le_bytes(*version);
    let words: Vec<Word> = (0..bytes.div_ceil(4))
        .map(|index| seed.rotate_left(index % 32) ^ index.wrapping_mul(0x9E37_79B9))
        .collect();
    flash.erase(address, bytes)?;
    flash.program(address, &words)
}

fn version_label(version: &[u8; VERSION_BYTES]) -> String {
    let end = version.iter().position(|&b| b == 0).unwrap_or(VERSION_BYTES);
    if end == 0 {
        "-".to_owned()
    } else {
        String::from_utf8_lossy(&version[..end]).into_owned()
    }
}

fn help(topic: Option<&str>) -> Vec<String> {
    match topic {
        None => HELP_TOPICS.iter().map(|(_, line)| (*line).to_owned()).collect(),
        Some(topic) => match HELP_TOPICS.iter().find(|(name, _)| *name == topic) {
            Some((_, line)) => vec![(*line).to_owned()],
            None => vec![format!("ERR unknown help topic `{topic}`")],
        },
    }
}

/// Formats boot events as they are recorded.
#[derive(Default)]
struct ConsoleTelemetry {
    lines: Vec<String>,
}

impl TelemetrySink for ConsoleTelemetry {
    fn record(&mut self, event: BootEvent) {
        self.lines.push(format!("{:?} {event}", event.severity()));
    }
}

/// Accounts for requested delays without sleeping.
#[derive(Default)]
struct HostDelay {
    total: Duration,
}

impl Delay for HostDelay {
    fn delay(&mut self, duration: Duration) {
        self.total += duration;
    }
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };

        logger.write_header()?;
        Ok(logger)
    }

    fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.writer, "# Swap bootloader emulator transcript")?;
        writeln!(
            self.writer,
            "# Timestamps are milliseconds since session start"
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(layout(None).unwrap(), None).unwrap()
    }

    fn run(session: &mut Session, line: &str) -> Vec<String> {
        session.handle_command(line).unwrap()
    }

    fn flag(session: &mut Session) -> String {
        run(session, "status")
            .into_iter()
            .find(|line| line.starts_with("flag="))
            .expect("status shows the flag")
    }

    #[test]
    fn first_boot_initializes_and_hands_off() {
        let mut session = session();
        let lines = run(&mut session, "boot");
        assert!(lines.iter().any(|line| line.contains("factory default")));
        assert_eq!(
            lines.last().map(String::as_str),
            Some("hand-off to 0x08007000 after 500 ms")
        );
    }

    #[test]
    fn update_lifecycle_through_commands() {
        let mut session = session();
        run(&mut session, "boot");
        assert!(run(&mut session, "stage 0x8000 2.0")[0].starts_with("OK staged 2.0"));

        run(&mut session, "boot");
        assert_eq!(flag(&mut session), "flag=update-complete");

        assert_eq!(run(&mut session, "confirm"), ["OK flag=update-ok"]);
        run(&mut session, "boot");
        assert_eq!(flag(&mut session), "flag=normal");
    }

    #[test]
    fn power_cut_during_swap_is_resumed() {
        let mut session = session();
        run(&mut session, "boot");
        run(&mut session, "stage 0x8000 2.0");
        run(&mut session, "cut 40");

        let interrupted = run(&mut session, "boot");
        assert!(interrupted.iter().any(|line| line.starts_with("reset after")));
        assert_eq!(interrupted.last().map(String::as_str), Some("power restored"));

        run(&mut session, "boot");
        assert_eq!(flag(&mut session), "flag=update-complete");
    }

    #[test]
    fn reserved_words_and_errors_are_reported() {
        let mut session = session();
        run(&mut session, "boot");
        assert_eq!(run(&mut session, "reserved 2 0x10"), ["reserved[2]=0x00000010"]);
        assert_eq!(run(&mut session, "reserved 2"), ["reserved[2]=0x00000010"]);
        assert!(run(&mut session, "reserved 40")[0].starts_with("ERR reserved"));
        assert!(run(&mut session, "launch")[0].starts_with("ERR syntax"));
    }

    fn region_words(session: &Session, region: Region, bytes: u32) -> Vec<Word> {
        let address = session.config.layout.base + region.offset;
        session
            .flash
            .peek(address, bytes.div_ceil(4) as usize)
            .unwrap()
            .to_vec()
    }

    fn fingerprint_of(session: &mut Session, prefix: &str) -> String {
        let line = run(session, "status")
            .into_iter()
            .find(|line| line.starts_with(prefix))
            .expect("status describes the image");
        line.split("fingerprint=").nth(1).unwrap().to_owned()
    }

    #[test]
    fn refused_stage_keeps_the_rollback_image() {
        let mut session = session();
        let layout = session.config.layout;
        let factory = region_words(&session, layout.current, FACTORY_IMAGE_SIZE);
        run(&mut session, "boot");
        run(&mut session, "stage 0x8000 2.0");
        run(&mut session, "boot");
        assert_eq!(flag(&mut session), "flag=update-complete");

        let before = region_words(&session, layout.update, layout.update.size);
        let steps = session.flash.steps();
        let refused = run(&mut session, "stage 0x8000 9.9");
        assert_eq!(refused, ["ERR stage cannot request update while update-complete"]);
        assert_eq!(region_words(&session, layout.update, layout.update.size), before);
        assert_eq!(session.flash.steps(), steps);

        run(&mut session, "boot");
        assert_eq!(flag(&mut session), "flag=normal");
        assert_eq!(
            region_words(&session, layout.current, FACTORY_IMAGE_SIZE),
            factory
        );
    }

    #[test]
    fn empty_stage_is_refused_before_writing() {
        let mut session = session();
        run(&mut session, "boot");
        let steps = session.flash.steps();
        assert_eq!(run(&mut session, "stage 0"), ["ERR stage update image is empty"]);
        assert_eq!(session.flash.steps(), steps);
    }

    #[test]
    fn fingerprints_tell_staged_versions_apart() {
        let mut first = session();
        run(&mut first, "boot");
        run(&mut first, "stage 0x8000 2.0");
        let mut second = session();
        run(&mut second, "boot");
        run(&mut second, "stage 0x8000 9.9");

        assert_ne!(
            fingerprint_of(&mut first, "update "),
            fingerprint_of(&mut second, "update ")
        );
    }

    #[test]
    fn status_leaves_a_rescue_copy_in_place() {
        let mut session = session();
        run(&mut session, "boot");
        let record = session.app.read(&mut *session.flash).unwrap();
        let rescue = session.config.layout.address(RegionId::EnvBankB, 0);
        session.flash.program(rescue, &record.encode()).unwrap();
        let steps = session.flash.steps();

        let lines = run(&mut session, "status");

        assert_eq!(session.flash.steps(), steps);
        assert!(lines.iter().any(|line| line.contains("bank B sealed=1")));
        assert!(lines.iter().any(|line| line == "flag=normal"));
    }

    #[test]
    fn scratch_size_must_keep_layout_valid() {
        assert_eq!(layout(Some(4)).unwrap().scratch.size, 0x1000);
        assert!(layout(Some(3)).is_err());
    }
}
