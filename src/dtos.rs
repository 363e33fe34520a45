pub mod commanddtos;

pub use commanddtos::*;
