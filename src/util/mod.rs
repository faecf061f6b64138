pub mod bits;
pub mod hash;
pub mod lru_visit;
pub mod octahedra;

pub use bits::{deposit_bits, extract_bits};
pub use hash::xxh64_fixed;
pub use lru_visit::LruVisitOrdering;
pub use octahedra::ConcentricOctahedraWalker;
