//! GEOTUCO STORAGE CONSTANTs

// Row index
pub const ROWS_PER_PAGE: u32 = 1024;
pub const INDEX_VERSION: u32 = 3;
pub const INDEX_HEADER_SIZE: u64 = 16;
pub const TRAILER_FIXED_SIZE: u64 = 16;
pub const BITMAP_WORD_BITS: u32 = 32;
pub const DEFAULT_OFFSET_WIDTH: u32 = 4;

// Heap
pub const HEAP_VERSION: u32 = 3;
pub const HEAP_MAGIC: u32 = 5;
pub const HEAP_HEADER_SIZE: u64 = 40;
pub const RECORD_PREFIX_SIZE: u64 = 4;
pub const FIELD_DESC_VERSION: u32 = 4;

// File names
pub const HEAP_EXT: &str = "tucotable";
pub const INDEX_EXT: &str = "tucotablx";
pub const FREELIST_EXT: &str = "tucofree";
pub const BACKUP_SUFFIX: &str = "_backup";
pub const COMPRESS_SUFFIX: &str = "_compress";
pub const BACKUP_MARKER_SUFFIX: &str = ".backup_valid";

// Free list sidecar
pub const FREELIST_MAGIC: &[u8; 8] = b"TUCOFREE";
pub const FREELIST_VERSION: u32 = 1;

// Geometry blobs
pub const SHAPE_FLAG_Z: u32 = 0x8000_0000;
pub const SHAPE_FLAG_M: u32 = 0x4000_0000;
pub const SHAPE_FLAG_CURVES: u32 = 0x2000_0000;
pub const SHAPE_TYPE_MASK: u32 = 0xFF;
pub const SEGMENT_ARC: u8 = 1;
pub const SEGMENT_BEZIER: u8 = 4;
pub const SEGMENT_ELLIPSE: u8 = 5;
pub const ARC_FLAG_DEFINED_IP: u32 = 1 << 7;
pub const M_ABSENT_MARKER: u8 = 66;

// Field values
pub const GUID_TEXT_LEN: usize = 38;
pub const GUID_BYTES: usize = 16;
pub const SECONDS_PER_DAY: f64 = 86_400.0;
