//! Environment record model and its on-flash word encoding.
//!
//! Slot layout, one word each unless noted:
//!
//! | words | field |
//! |---|---|
//! | 1 | boot flag |
//! | 32 | reserved for the application |
//! | 11 | update image descriptor |
//! | 11 | current image descriptor |
//! | 4 | swap progress |
//! | 1 | CRC-32 of everything above |
//! | 1 | status marker |
//!
//! The status marker is always the last word programmed, so a slot that lost
//! power mid-write never reads back as sealed.

use core::fmt;

use crc::{CRC_32_ISO_HDLC, Crc};

use crate::flash::{ERASED_WORD, WORD_BYTES, Word};

/// Words of opaque storage owned by the running application.
pub const RESERVED_WORDS: usize = 32;
pub const VERSION_BYTES: usize = 4;
pub const HASH_BYTES: usize = 36;
pub const DESCRIPTOR_WORDS: usize = (VERSION_BYTES + HASH_BYTES) / WORD_BYTES as usize + 1;
pub const PROGRESS_WORDS: usize = 4;
pub const RECORD_WORDS: usize = 1 + RESERVED_WORDS + 2 * DESCRIPTOR_WORDS + PROGRESS_WORDS + 2;
#[allow(clippy::cast_possible_truncation)]
pub const RECORD_BYTES: u32 = (RECORD_WORDS * WORD_BYTES as usize) as u32;

/// Marker stored in the final word of a completely written slot.
pub const STATUS_VALID: Word = 0x1122_3344;

const FLAG_INDEX: usize = 0;
const RESERVED_INDEX: usize = FLAG_INDEX + 1;
const UPDATE_INDEX: usize = RESERVED_INDEX + RESERVED_WORDS;
const CURRENT_INDEX: usize = UPDATE_INDEX + DESCRIPTOR_WORDS;
const PROGRESS_INDEX: usize = CURRENT_INDEX + DESCRIPTOR_WORDS;
const CHECKSUM_INDEX: usize = PROGRESS_INDEX + PROGRESS_WORDS;
const STATUS_INDEX: usize = CHECKSUM_INDEX + 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Raw slot contents as read from or written to flash.
pub type RecordWords = [Word; RECORD_WORDS];

/// Boot intent. Each value is exactly one above its predecessor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootFlag {
    Normal,
    Update,
    UpdateComplete,
    UpdateOk,
}

impl BootFlag {
    const NORMAL_CODE: Word = 0x1234_0000;
    const UPDATE_CODE: Word = Self::NORMAL_CODE + 1;
    const UPDATE_COMPLETE_CODE: Word = Self::NORMAL_CODE + 2;
    const UPDATE_OK_CODE: Word = Self::NORMAL_CODE + 3;

    #[must_use]
    pub const fn to_raw(self) -> Word {
        match self {
            BootFlag::Normal => Self::NORMAL_CODE,
            BootFlag::Update => Self::UPDATE_CODE,
            BootFlag::UpdateComplete => Self::UPDATE_COMPLETE_CODE,
            BootFlag::UpdateOk => Self::UPDATE_OK_CODE,
        }
    }

    #[must_use]
    pub const fn from_raw(raw: Word) -> Option<Self> {
        match raw {
            Self::NORMAL_CODE => Some(BootFlag::Normal),
            Self::UPDATE_CODE => Some(BootFlag::Update),
            Self::UPDATE_COMPLETE_CODE => Some(BootFlag::UpdateComplete),
            Self::UPDATE_OK_CODE => Some(BootFlag::UpdateOk),
            _ => None,
        }
    }
}

impl fmt::Display for BootFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BootFlag::Normal => "normal",
            BootFlag::Update => "update",
            BootFlag::UpdateComplete => "update-complete",
            BootFlag::UpdateOk => "update-ok",
        };
        f.write_str(label)
    }
}

/// Swap engine resumption marker.
///
/// `SwapToUpdateDone` closes a chunk and is treated exactly like `Init` when
/// the next chunk starts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapPhase {
    Init,
    UserToSwapDone,
    UpdateToUserDone,
    SwapToUpdateDone,
}

impl SwapPhase {
    const INIT_CODE: Word = 0;
    const USER_TO_SWAP_CODE: Word = 0x2233_4455;
    const UPDATE_TO_USER_CODE: Word = Self::USER_TO_SWAP_CODE + 1;
    const SWAP_TO_UPDATE_CODE: Word = Self::USER_TO_SWAP_CODE + 2;

    #[must_use]
    pub const fn to_raw(self) -> Word {
        match self {
            SwapPhase::Init => Self::INIT_CODE,
            SwapPhase::UserToSwapDone => Self::USER_TO_SWAP_CODE,
            SwapPhase::UpdateToUserDone => Self::UPDATE_TO_USER_CODE,
            SwapPhase::SwapToUpdateDone => Self::SWAP_TO_UPDATE_CODE,
        }
    }

    #[must_use]
    pub const fn from_raw(raw: Word) -> Option<Self> {
        match raw {
            Self::INIT_CODE => Some(SwapPhase::Init),
            Self::USER_TO_SWAP_CODE => Some(SwapPhase::UserToSwapDone),
            Self::UPDATE_TO_USER_CODE => Some(SwapPhase::UpdateToUserDone),
            Self::SWAP_TO_UPDATE_CODE => Some(SwapPhase::SwapToUpdateDone),
            _ => None,
        }
    }

    /// Returns `true` between chunks.
    #[must_use]
    pub const fn is_chunk_boundary(self) -> bool {
        matches!(self, SwapPhase::Init | SwapPhase::SwapToUpdateDone)
    }
}

impl fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SwapPhase::Init => "init",
            SwapPhase::UserToSwapDone => "user-to-swap-done",
            SwapPhase::UpdateToUserDone => "update-to-user-done",
            SwapPhase::SwapToUpdateDone => "swap-to-update-done",
        };
        f.write_str(label)
    }
}

/// Version, content hash, and length of a firmware image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub version: [u8; VERSION_BYTES],
    pub hash: [u8; HASH_BYTES],
    pub size: u32,
}

impl ImageDescriptor {
    pub const EMPTY: Self = Self::sized(0);

    #[must_use]
    pub const fn new(version: [u8; VERSION_BYTES], hash: [u8; HASH_BYTES], size: u32) -> Self {
        Self {
            version,
            hash,
            size,
        }
    }

    /// Descriptor with zeroed version and hash fields.
    #[must_use]
    pub const fn sized(size: u32) -> Self {
        Self::new([0; VERSION_BYTES], [0; HASH_BYTES], size)
    }

    fn encode(&self, out: &mut [Word]) {
        let mut bytes = [0u8; VERSION_BYTES + HASH_BYTES];
        bytes[..VERSION_BYTES].copy_from_slice(&self.version);
        bytes[VERSION_BYTES..].copy_from_slice(&self.hash);
        for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = Word::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        out[DESCRIPTOR_WORDS - 1] = self.size;
    }

    fn decode(words: &[Word]) -> Self {
        let mut bytes = [0u8; VERSION_BYTES + HASH_BYTES];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        let mut version = [0u8; VERSION_BYTES];
        let mut hash = [0u8; HASH_BYTES];
        version.copy_from_slice(&bytes[..VERSION_BYTES]);
        hash.copy_from_slice(&bytes[VERSION_BYTES..]);
        Self::new(version, hash, words[DESCRIPTOR_WORDS - 1])
    }
}

/// Resumption state for the swap engine and for rollback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwapProgress {
    /// Bytes of the current image already parked in the update region.
    pub origin_offset: u32,
    /// Bytes of the update image already written into the current region.
    /// Rollback reuses it as its bytes-copied counter.
    pub update_offset: u32,
    /// Length of the chunk sitting in scratch.
    pub carried_size: u32,
    pub phase: SwapPhase,
}

impl SwapProgress {
    pub const ZERO: Self = Self {
        origin_offset: 0,
        update_offset: 0,
        carried_size: 0,
        phase: SwapPhase::Init,
    };

    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// Decoding failures for slots that are sealed but semantically unusable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordError {
    NotSealed,
    UnknownFlag(Word),
    UnknownPhase(Word),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::NotSealed => f.write_str("slot is not sealed"),
            RecordError::UnknownFlag(raw) => write!(f, "unknown boot flag {raw:#010x}"),
            RecordError::UnknownPhase(raw) => write!(f, "unknown swap phase {raw:#010x}"),
        }
    }
}

/// What a slot holds after reading it back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Every word erased; available for the next append.
    Blank,
    /// Partially written or corrupted; never reused until the bank is erased.
    Torn,
    Sealed,
}

impl SlotState {
    #[must_use]
    pub fn classify(words: &RecordWords) -> Self {
        if words.iter().all(|word| *word == ERASED_WORD) {
            SlotState::Blank
        } else if words[STATUS_INDEX] == STATUS_VALID
            && words[CHECKSUM_INDEX] == checksum(&words[..CHECKSUM_INDEX])
        {
            SlotState::Sealed
        } else {
            SlotState::Torn
        }
    }
}

fn checksum(words: &[Word]) -> Word {
    let mut digest = CRC32.digest();
    for word in words {
        digest.update(&word.to_le_bytes());
    }
    digest.finalize()
}

/// The persisted boot environment.
///
/// Stages of the boot flow take the record by value and hand back a new one,
/// so the value in hand is always the value that gets persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvRecord {
    pub boot_flag: BootFlag,
    pub reserved: [Word; RESERVED_WORDS],
    pub image_update: ImageDescriptor,
    pub image_current: ImageDescriptor,
    pub swap_progress: SwapProgress,
}

impl EnvRecord {
    /// First-boot record: the factory image fills the whole current region.
    #[must_use]
    pub const fn factory_default(current_capacity: u32) -> Self {
        Self {
            boot_flag: BootFlag::Normal,
            reserved: [0; RESERVED_WORDS],
            image_update: ImageDescriptor::EMPTY,
            image_current: ImageDescriptor::sized(current_capacity),
            swap_progress: SwapProgress::ZERO,
        }
    }

    #[must_use]
    pub fn with_flag(mut self, boot_flag: BootFlag) -> Self {
        self.boot_flag = boot_flag;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, swap_progress: SwapProgress) -> Self {
        self.swap_progress = swap_progress;
        self
    }

    /// Encodes the record into a sealed slot image.
    #[must_use]
    pub fn encode(&self) -> RecordWords {
        let mut words = [0; RECORD_WORDS];
        words[FLAG_INDEX] = self.boot_flag.to_raw();
        words[RESERVED_INDEX..UPDATE_INDEX].copy_from_slice(&self.reserved);
        self.image_update
            .encode(&mut words[UPDATE_INDEX..CURRENT_INDEX]);
        self.image_current
            .encode(&mut words[CURRENT_INDEX..PROGRESS_INDEX]);
        words[PROGRESS_INDEX] = self.swap_progress.origin_offset;
        words[PROGRESS_INDEX + 1] = self.swap_progress.update_offset;
        words[PROGRESS_INDEX + 2] = self.swap_progress.carried_size;
        words[PROGRESS_INDEX + 3] = self.swap_progress.phase.to_raw();
        words[CHECKSUM_INDEX] = checksum(&words[..CHECKSUM_INDEX]);
        words[STATUS_INDEX] = STATUS_VALID;
        words
    }

    /// Decodes a slot, which must classify as [`SlotState::Sealed`].
    pub fn decode(words: &RecordWords) -> Result<Self, RecordError> {
        if SlotState::classify(words) != SlotState::Sealed {
            return Err(RecordError::NotSealed);
        }

        let boot_flag = BootFlag::from_raw(words[FLAG_INDEX])
            .ok_or(RecordError::UnknownFlag(words[FLAG_INDEX]))?;
        let raw_phase = words[PROGRESS_INDEX + 3];
        let phase = SwapPhase::from_raw(raw_phase).ok_or(RecordError::UnknownPhase(raw_phase))?;

        let mut reserved = [0; RESERVED_WORDS];
        reserved.copy_from_slice(&words[RESERVED_INDEX..UPDATE_INDEX]);

        Ok(Self {
            boot_flag,
            reserved,
            image_update: ImageDescriptor::decode(&words[UPDATE_INDEX..CURRENT_INDEX]),
            image_current: ImageDescriptor::decode(&words[CURRENT_INDEX..PROGRESS_INDEX]),
            swap_progress: SwapProgress {
                origin_offset: words[PROGRESS_INDEX],
                update_offset: words[PROGRESS_INDEX + 1],
                carried_size: words[PROGRESS_INDEX + 2],
                phase,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EnvRecord {
        let mut record = EnvRecord::factory_default(0x1_9000).with_flag(BootFlag::Update);
        record.reserved[3] = 0xDEAD_BEEF;
        record.image_update = ImageDescriptor::new(*b"v2.1", [0x5A; HASH_BYTES], 0x1_2345);
        record.swap_progress = SwapProgress {
            origin_offset: 0x5000,
            update_offset: 0xA000,
            carried_size: 0x5000,
            phase: SwapPhase::UpdateToUserDone,
        };
        record
    }

    #[test]
    fn record_occupies_sixty_one_words() {
        assert_eq!(DESCRIPTOR_WORDS, 11);
        assert_eq!(RECORD_WORDS, 61);
        assert_eq!(RECORD_BYTES, 244);
    }

    #[test]
    fn flag_codes_are_consecutive() {
        assert_eq!(BootFlag::Normal.to_raw(), 0x1234_0000);
        assert_eq!(BootFlag::UpdateOk.to_raw(), 0x1234_0003);
        assert_eq!(BootFlag::from_raw(0x1234_0002), Some(BootFlag::UpdateComplete));
        assert_eq!(BootFlag::from_raw(0x1234_0004), None);
    }

    #[test]
    fn encoded_record_is_sealed_and_decodes() {
        let record = sample();
        let words = record.encode();

        assert_eq!(words[0], 0x1234_0001);
        assert_eq!(words[RECORD_WORDS - 1], STATUS_VALID);
        assert_eq!(SlotState::classify(&words), SlotState::Sealed);
        assert_eq!(EnvRecord::decode(&words), Ok(record));
    }

    #[test]
    fn version_bytes_pack_little_endian() {
        let words = sample().encode();
        assert_eq!(words[UPDATE_INDEX], u32::from_le_bytes(*b"v2.1"));
        assert_eq!(words[CURRENT_INDEX - 1], 0x1_2345);
    }

    #[test]
    fn missing_status_word_reads_as_torn() {
        let mut words = sample().encode();
        words[STATUS_INDEX] = ERASED_WORD;
        assert_eq!(SlotState::classify(&words), SlotState::Torn);
        assert_eq!(EnvRecord::decode(&words), Err(RecordError::NotSealed));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut words = sample().encode();
        words[RESERVED_INDEX + 3] &= 0x0000_FFFF;
        assert_eq!(SlotState::classify(&words), SlotState::Torn);
    }

    #[test]
    fn erased_slot_is_blank() {
        assert_eq!(
            SlotState::classify(&[ERASED_WORD; RECORD_WORDS]),
            SlotState::Blank
        );
    }

    #[test]
    fn sealed_slot_with_unknown_flag_is_rejected() {
        let mut words = sample().encode();
        words[FLAG_INDEX] = 0x1234_0009;
        words[CHECKSUM_INDEX] = checksum(&words[..CHECKSUM_INDEX]);
        assert_eq!(
            EnvRecord::decode(&words),
            Err(RecordError::UnknownFlag(0x1234_0009))
        );
    }
}
