mod automaton;
mod device;
mod interface;
mod timestamp;

pub mod events;
pub mod triggers;

pub use automaton::*;
pub use device::*;
pub use interface::*;
pub use timestamp::*;
