pub mod api;
pub mod db;
pub mod probe;
pub mod telegram;
