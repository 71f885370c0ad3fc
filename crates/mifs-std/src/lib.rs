//! Reusable building blocks shared by the MIFS daemons.
pub mod collections;
pub mod sync;
pub mod time;
pub mod tx;
