#![doc = include_str!("../README.md")]

pub mod client;
pub mod connection;
pub mod descriptors;
pub mod device;
pub mod engine;
pub mod error;
pub mod transport;
pub mod wire;

pub use client::{
    AttachFailure, AttachOptions, AttachReport, AttachSuccess, UsbipClient,
    USBIP_PORT,
};
pub use connection::Connection;
pub use device::{ClassRequest, HardwareId, LineCoding};
pub use error::Error;
