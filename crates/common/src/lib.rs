pub mod backend;
pub mod config;
pub mod error;
pub mod identifier;
pub mod types;

pub const APP_ID: &str = "usbgate";
