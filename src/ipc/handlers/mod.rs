pub mod core;
pub mod substitutions;
pub mod timetables;
