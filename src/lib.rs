#[macro_use]
extern crate tracing;

pub mod api;
pub mod cmd;
pub mod config;
pub mod events;
pub mod joblogs;
pub mod launcher;
pub mod object_storage;
pub mod repository;
pub mod scheduler;
pub mod watcher;
