pub mod core;
pub mod exchange;
pub mod positions;
pub mod roster;
pub mod setup;
pub mod sheet;
pub mod submission;
