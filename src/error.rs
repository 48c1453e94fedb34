use thiserror::Error;

/// Construction-time failures. Per-frame and per-call failures never use this
/// type; they report through the plain `bool`/`Option`/sentinel conventions
/// documented on each registry.
#[derive(Debug, Error)]
pub enum WorldError {
    #[error("world dimensions {width}x{height} are invalid (must be non-zero and chunk-aligned)")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("material table must contain at least the Air entry")]
    MaterialTableEmpty,

    #[error("config.chunk_size {given} does not match the compiled-in chunk size {expected}; chunk storage is sized at compile time")]
    InvalidChunkSize { given: u16, expected: u16 },

    #[error("config.belt_block_size {given} does not match the compiled-in belt block size {expected}; belt placement assumes an 8-cell power-of-two block")]
    InvalidBeltBlockSize { given: u16, expected: u16 },
}
