//! Persistence for driftlock: the binary pin record, background save/load,
//! and TOML settings files.

pub mod background;
pub mod config;
pub mod error;
pub mod pins;

pub use background::PinStore;
pub use config::{load_settings, parse_settings};
pub use error::{Result, StoreError};
pub use pins::{decode_pins, encode_pins, load_pins, save_pins};
