//! Xray engine family

mod runner;

pub use runner::{xray_version, XrayRunner};
