pub mod atomic_map;
pub mod backoff;
pub mod buf;
pub mod random;
