pub mod duration;
pub mod models;
pub mod power_state;
