//! External input loading and artifact persistence.

pub mod annotation;
pub mod artifacts;
pub mod reads;

pub use annotation::load_orfs;
pub use artifacts::{read_json, write_json_atomic, ArtifactLayout};
pub use reads::{filter_reads, load_aligned_reads, ReadFilter};
