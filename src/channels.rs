//! Channel adapters and the registry that owns them.

pub mod adapter;
pub mod discord;
pub mod registry;
pub mod telegram;
pub mod web;
pub mod whatsapp;

pub use adapter::{
    Adapter, AdapterDyn, AdapterEvent, AdapterStatus, EventStream, StatusCell, StreamHandle,
};
pub use registry::ChannelRegistry;
