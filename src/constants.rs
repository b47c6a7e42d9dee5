// Each queue is two files, <path>.stat and <path>.buf. All integers are
// stored big-endian so a queue can be shared between hosts of either byte
// order over a network filesystem.

// stat file layout
//  0  -- u32 magic cookie
//  4  -- u32 format version
//  8  -- u64 queue uid, regenerated on create/clear
// 16  -- u32 n_slots
// 20  -- u32 buffer_size
// 24  -- u32 youngest_id
// 28  -- u32 youngest_slot
// 32  -- u32 oldest_slot
// 36  -- u32 begin_insert
// 40  -- u32 end_insert
// 44  -- u32 begin_append
// 48  -- u8 append_mode
// 49  -- u8 blocking_write
// 50  -- u8[2] padding
// 52  -- u32 last_id_read
// 56  -- u64 time_written
// 64  -- u32 checksum over bytes 0..64
// 68  -- u8[4] padding
// 72  -- end

// For each slot in n_slots, starting at 72:
// ------ Repeat every 48 bytes ----
// u8   0 -- active
// u8   1 -- compress
//      2 -- u8[2] padding
// u32  4 -- id
// u64  8 -- time
// u32 16 -- msg_len
// u32 20 -- stored_len
// u32 24 -- offset
// i32 28 -- type
// i32 32 -- subtype
// u32 36 -- checksum of the stored entry
// u32 40 -- checksum of bytes 0..40
//     44 -- u8[4] padding
//     48 -- end

pub const STAT_MAGIC: u32 = 0x464d_5153; // "FMQS"
pub const BUF_MAGIC: u32 = 0x464d_5142; // "FMQB"
pub const FORMAT_VERSION: u32 = 1;

pub const STATUS_HEADER_SIZE: usize = 72;
pub const SLOT_SIZE: usize = 48;

// Absolute positions in the status header
pub const HDR_POS_MAGIC: usize = 0;
pub const HDR_POS_VERSION: usize = 4;
pub const HDR_POS_QUEUE_UID: usize = 8;
pub const HDR_POS_N_SLOTS: usize = 16;
pub const HDR_POS_BUFFER_SIZE: usize = 20;
pub const HDR_POS_YOUNGEST_ID: usize = 24;
pub const HDR_POS_YOUNGEST_SLOT: usize = 28;
pub const HDR_POS_OLDEST_SLOT: usize = 32;
pub const HDR_POS_BEGIN_INSERT: usize = 36;
pub const HDR_POS_END_INSERT: usize = 40;
pub const HDR_POS_BEGIN_APPEND: usize = 44;
pub const HDR_POS_APPEND_MODE: usize = 48;
pub const HDR_POS_BLOCKING_WRITE: usize = 49;
pub const HDR_POS_LAST_ID_READ: usize = 52;
pub const HDR_POS_TIME_WRITTEN: usize = 56;
pub const HDR_POS_CHECKSUM: usize = 64;

// Positions within a slot record
pub const SLOT_POS_ACTIVE: usize = 0;
pub const SLOT_POS_COMPRESS: usize = 1;
pub const SLOT_POS_ID: usize = 4;
pub const SLOT_POS_TIME: usize = 8;
pub const SLOT_POS_MSG_LEN: usize = 16;
pub const SLOT_POS_STORED_LEN: usize = 20;
pub const SLOT_POS_OFFSET: usize = 24;
pub const SLOT_POS_TYPE: usize = 28;
pub const SLOT_POS_SUBTYPE: usize = 32;
pub const SLOT_POS_CHECKSUM: usize = 36;
pub const SLOT_POS_SLOT_CHECKSUM: usize = 40;

// Entry framing in the buf file, may wrap past the end of the buffer:
// | u32 BUF_MAGIC | u32 slot index | u32 data len | data | pad to 4 | u32 id |
pub const ENTRY_PREFIX_SIZE: usize = 12;
pub const ENTRY_SUFFIX_SIZE: usize = 4;
pub const ENTRY_POS_MAGIC: usize = 0;
pub const ENTRY_POS_SLOT: usize = 4;
pub const ENTRY_POS_DATA_LEN: usize = 8;
pub const ENTRY_OVERHEAD: usize = ENTRY_PREFIX_SIZE + ENTRY_SUFFIX_SIZE;

// youngest_slot/oldest_slot value when there is no such slot
pub const NO_SLOT: u32 = u32::MAX;

// a header whose checksum fails is re-read this many times before we give up,
// the writer may have been mid-commit
pub const HEADER_READ_ATTEMPTS: usize = 5;

pub const STAT_SUFFIX: &str = "stat";
pub const BUF_SUFFIX: &str = "buf";
pub const CURSOR_SUFFIX: &str = "cursor";

pub const DEFAULT_N_SLOTS: u32 = 1000;
pub const DEFAULT_BUFFER_SIZE: u32 = 10_000_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_BLOCKED_WRITE_INTERVAL_MS: u64 = 200;
