use bootloader_core::boot::{BootConfig, Bootloader};
use bootloader_core::env::{BootFlag, EnvError, EnvRecord, EnvStore, ImageDescriptor, SwapPhase};
use bootloader_core::flash::sim::RamFlash;
use bootloader_core::flash::{Flash, Word};
use bootloader_core::layout::{FlashLayout, Region};
use bootloader_core::swap::{self, StepOutcome, SwapEngine};
use bootloader_core::telemetry::NoopTelemetry;

type TestFlash = RamFlash<0x800>;

fn layout(scratch: u32) -> FlashLayout {
    FlashLayout {
        base: 0,
        flash_size: 0x2000,
        page_size: 0x100,
        env_bank_a: Region::new(0, 0x400),
        env_bank_b: Region::new(0x400, 0x400),
        current: Region::new(0x800, 0x700),
        update: Region::new(0xF00, 0x700),
        scratch: Region::new(0x1600, scratch),
    }
}

fn stage(flash: &mut TestFlash, region: Region, bytes: u32, seed: Word) {
    let words: Vec<Word> = (0..bytes.div_ceil(4))
        .map(|index| seed.wrapping_add(index.wrapping_mul(0x9E37_79B9)))
        .collect();
    flash.program(region.offset, &words).unwrap();
}

fn contents(flash: &TestFlash, region: Region, bytes: u32) -> Vec<Word> {
    flash
        .peek(region.offset, bytes.div_ceil(4) as usize)
        .expect("region inside flash")
        .to_vec()
}

fn tagged(tag: Word) -> EnvRecord {
    let mut record = EnvRecord::factory_default(0x700);
    record.reserved[0] = tag;
    record
}

struct Armed {
    flash: TestFlash,
    layout: FlashLayout,
    current_size: u32,
    update_size: u32,
    expected_current: Vec<Word>,
    expected_update: Vec<Word>,
}

impl Armed {
    fn new(current_size: u32, update_size: u32, scratch: u32) -> Self {
        let layout = layout(scratch);
        let mut flash = TestFlash::new(0, 0x100);
        stage(&mut flash, layout.current, current_size, 0x1000_0001);
        stage(&mut flash, layout.update, update_size, 0x2000_0002);

        let mut record = EnvRecord::factory_default(layout.current.size).with_flag(BootFlag::Update);
        record.image_current = ImageDescriptor::sized(current_size);
        record.image_update = ImageDescriptor::sized(update_size);
        EnvStore::new(&layout).save(&mut flash, &record).unwrap();

        Self {
            expected_current: contents(&flash, layout.update, update_size),
            expected_update: contents(&flash, layout.current, current_size),
            flash,
            layout,
            current_size,
            update_size,
        }
    }

    fn load(&mut self) -> EnvRecord {
        EnvStore::new(&self.layout)
            .load(&mut self.flash)
            .expect("a sealed record must survive")
            .record
    }

    fn boot(&mut self) -> Result<(), bootloader_core::boot::BootError> {
        Bootloader::new(BootConfig::new(self.layout), &mut self.flash, NoopTelemetry)
            .boot()
            .map(|_| ())
    }

    fn assert_swapped(&self) {
        assert_eq!(
            contents(&self.flash, self.layout.current, self.update_size),
            self.expected_current,
            "current region should hold the update image"
        );
        assert_eq!(
            contents(&self.flash, self.layout.update, self.current_size),
            self.expected_update,
            "update region should hold the previous image"
        );
    }
}

#[test]
fn log_survives_a_cut_at_every_flash_step() {
    let layout = layout(0x200);
    let store = EnvStore::new(&layout);
    let saves = 11;

    let total_steps = {
        let mut flash = TestFlash::new(0, 0x100);
        for tag in 0..saves {
            store.save(&mut flash, &tagged(tag)).unwrap();
        }
        flash.steps()
    };

    for cut in 0..total_steps {
        let mut flash = TestFlash::new(0, 0x100);
        flash.cut_after(cut);

        let mut completed = None;
        let mut interrupted = None;
        for tag in 0..saves {
            match store.save(&mut flash, &tagged(tag)) {
                Ok(_) => completed = Some(tag),
                Err(_) => {
                    interrupted = Some(tag);
                    break;
                }
            }
        }
        flash.restore_power();

        match store.load(&mut flash) {
            Ok(loaded) => {
                let tag = Some(loaded.record.reserved[0]);
                assert!(
                    tag == completed || tag == interrupted,
                    "cut {cut}: loaded {tag:?}, completed {completed:?}, interrupted {interrupted:?}"
                );
            }
            Err(EnvError::NoEnvironment) => assert_eq!(completed, None, "cut {cut}"),
            Err(other) => panic!("cut {cut}: unexpected load error {other:?}"),
        }

        // The log keeps working after recovery.
        store.save(&mut flash, &tagged(1000)).unwrap();
        assert_eq!(store.load(&mut flash).unwrap().record.reserved[0], 1000);
        let occupancy = store.occupancy(&mut flash).unwrap();
        assert_eq!(occupancy.rescue.sealed, 0, "cut {cut}");
    }
}

#[test]
fn swap_resumes_after_every_persisted_phase() {
    let grid = [
        (0x700, 0x700, 0x200),
        (0x6C4, 0x352, 0x200),
        (0x250, 0x6F0, 0x100),
        (0x401, 0x3FC, 0x300),
        (0x300, 0x300, 0x100),
    ];

    for (current_size, update_size, scratch) in grid {
        let phases = 3 * swap::iterations(current_size, update_size, scratch);
        for stop_after in 0..=phases {
            let mut device = Armed::new(current_size, update_size, scratch);
            let engine = SwapEngine::new(&device.layout);

            let mut record = device.load();
            for _ in 0..stop_after {
                let (next, outcome) = engine.step(&mut device.flash, record, &mut NoopTelemetry).unwrap();
                assert!(matches!(outcome, StepOutcome::Advanced(_)));
                record = next;
            }

            // Power cycle: only flash state carries over.
            let resumed = device.load();
            let finished = engine.swap(&mut device.flash, resumed, &mut NoopTelemetry).unwrap();

            assert_eq!(finished.image_current.size, update_size);
            assert_eq!(finished.image_update.size, current_size);
            device.assert_swapped();
        }
    }
}

#[test]
fn resume_after_update_to_user_phase_matches_uninterrupted_swap() {
    let mut device = Armed::new(0x6C4, 0x5A0, 0x200);
    let engine = SwapEngine::new(&device.layout);

    let mut record = device.load();
    while record.swap_progress.phase != SwapPhase::UpdateToUserDone {
        record = engine.step(&mut device.flash, record, &mut NoopTelemetry).unwrap().0;
    }
    assert_eq!(device.load().swap_progress.phase, SwapPhase::UpdateToUserDone);

    device.boot().unwrap();

    assert_eq!(device.load().boot_flag, BootFlag::UpdateComplete);
    device.assert_swapped();
}

#[test]
fn update_boot_survives_a_cut_at_every_flash_step() {
    let total_steps = {
        let mut device = Armed::new(0x300, 0x280, 0x100);
        let before = device.flash.steps();
        device.boot().unwrap();
        device.flash.steps() - before
    };

    for cut in 0..total_steps {
        let mut device = Armed::new(0x300, 0x280, 0x100);
        device.flash.cut_after(cut);
        assert!(device.boot().is_err(), "cut {cut} should interrupt the boot");
        device.flash.restore_power();

        match device.load().boot_flag {
            BootFlag::Update => {
                device.boot().unwrap();
                assert_eq!(device.load().boot_flag, BootFlag::UpdateComplete);
            }
            // The final flag write landed before the cut.
            BootFlag::UpdateComplete => {}
            other => panic!("cut {cut}: unexpected flag {other}"),
        }
        device.assert_swapped();
    }
}

#[test]
fn rollback_survives_a_cut_at_every_flash_step() {
    let original = Armed::new(0x300, 0x280, 0x100).expected_update;

    let total_steps = {
        let mut device = Armed::new(0x300, 0x280, 0x100);
        device.boot().unwrap();
        let before = device.flash.steps();
        device.boot().unwrap();
        device.flash.steps() - before
    };

    for cut in 0..total_steps {
        let mut device = Armed::new(0x300, 0x280, 0x100);
        device.boot().unwrap();
        device.flash.cut_after(cut);
        assert!(device.boot().is_err(), "cut {cut} should interrupt the rollback");
        device.flash.restore_power();

        if device.load().boot_flag == BootFlag::UpdateComplete {
            device.boot().unwrap();
        }
        let record = device.load();
        assert_eq!(record.boot_flag, BootFlag::Normal, "cut {cut}");
        assert_eq!(record.image_current.size, 0x300);
        assert_eq!(contents(&device.flash, device.layout.current, 0x300), original);
    }
}

#[test]
fn swap_phase_count_is_bounded_by_chunk_counts() {
    for (current_size, update_size, scratch) in [
        (0x700, 0x100, 0x200),
        (0x100, 0x700, 0x200),
        (0x6FC, 0x6FC, 0x300),
        (0x204, 0x1FC, 0x100),
    ] {
        let mut device = Armed::new(current_size, update_size, scratch);
        let engine = SwapEngine::new(&device.layout);
        let mut record = device.load();
        let mut advanced = 0;

        loop {
            let (next, outcome) = engine.step(&mut device.flash, record, &mut NoopTelemetry).unwrap();
            record = next;
            match outcome {
                StepOutcome::Advanced(_) => advanced += 1,
                StepOutcome::Finished => break,
            }
            assert!(advanced <= 3 * (current_size.div_ceil(scratch) + update_size.div_ceil(scratch)));
        }

        assert_eq!(advanced, 3 * swap::iterations(current_size, update_size, scratch));
        device.assert_swapped();
    }
}
