//! Table options and the few process-wide knobs read from the environment.
//!
//! | Variable                   | Effect                                            |
//! |----------------------------|---------------------------------------------------|
//! | `GEOTUCO_CREATOR`          | creator string stamped into new/repacked heaps    |
//! | `GEOTUCO_MODIFY_IN_PLACE`  | `YES`/`NO`: repack with backups or with temp files |
//! | `GEOTUCO_SIMUL_WIN32`      | `YES`: use the rename strategy needed on Windows  |
//!
//! Each variable is read once per process.

use std::sync::OnceLock;

use crate::constant::DEFAULT_OFFSET_WIDTH;
use crate::dberror::DbError;

/// How string fields are stored in records. XML fields are always UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    /// Legacy tables: varuint byte count followed by UTF-16LE code units.
    Utf16,
}

/// How `repack` protects the original files while it rewrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepackStrategy {
    /// Copy both files to `_backup`, rewrite the originals, delete the backups.
    InPlace,
    /// Write `_compress` files next to the originals, then rename them over.
    TempFiles,
}

#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Byte width of one row index slot: 4 or 8.
    pub offset_width: u32,
    pub text_encoding: TextEncoding,
    /// `None` writes no creator block at all.
    pub creator: Option<String>,
    pub repack_strategy: RepackStrategy,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            offset_width: DEFAULT_OFFSET_WIDTH,
            text_encoding: TextEncoding::Utf8,
            creator: Some(default_creator().to_string()),
            repack_strategy: default_repack_strategy(),
        }
    }
}

impl TableOptions {
    pub fn with_offset_width(mut self, width: u32) -> Self {
        self.offset_width = width;
        self
    }

    pub fn with_text_encoding(mut self, encoding: TextEncoding) -> Self {
        self.text_encoding = encoding;
        self
    }

    pub fn with_creator(mut self, creator: Option<String>) -> Self {
        self.creator = creator;
        self
    }

    pub fn with_repack_strategy(mut self, strategy: RepackStrategy) -> Self {
        self.repack_strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if self.offset_width != 4 && self.offset_width != 8 {
            return Err(DbError::InvalidOperation(format!(
                "offset width must be 4 or 8, got {}",
                self.offset_width
            )));
        }
        if let Some(c) = &self.creator {
            if c.len() > u32::MAX as usize {
                return Err(DbError::InvalidOperation("creator string too long".to_string()));
            }
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(
            v.trim().to_ascii_uppercase().as_str(),
            "YES" | "ON" | "TRUE" | "1"
        )
    })
}

pub fn default_creator() -> &'static str {
    static CREATOR: OnceLock<String> = OnceLock::new();
    CREATOR.get_or_init(|| {
        std::env::var("GEOTUCO_CREATOR")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("geotuco {}", env!("CARGO_PKG_VERSION")))
    })
}

/// In-place is the default on Windows, where renaming over an open file fails.
pub fn default_repack_strategy() -> RepackStrategy {
    static STRATEGY: OnceLock<RepackStrategy> = OnceLock::new();
    *STRATEGY.get_or_init(|| {
        let in_place = env_flag("GEOTUCO_MODIFY_IN_PLACE").unwrap_or(cfg!(windows));
        if in_place {
            RepackStrategy::InPlace
        } else {
            RepackStrategy::TempFiles
        }
    })
}

pub fn simulate_win32() -> bool {
    static SIMUL: OnceLock<bool> = OnceLock::new();
    *SIMUL.get_or_init(|| env_flag("GEOTUCO_SIMUL_WIN32").unwrap_or(false))
}
