//! Command implementations for canflash

pub mod check;
pub mod replay;
pub mod simulate;

pub use check::check;
pub use replay::replay;
pub use simulate::simulate_update;
