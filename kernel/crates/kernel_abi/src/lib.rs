#![no_std]

mod errno;
mod exit;
mod signal;

pub use errno::*;
pub use exit::*;
pub use signal::*;
