pub mod constants;
pub mod hash_id;
pub mod lengths;

pub use hash_id::Id20;
