//! Index directory and its on-medium record format.

mod directory;
mod record;

pub use directory::{IndexDirectory, Relink};
pub use record::RecordCodec;
