pub mod client;

pub use client::{ControllerClient, Organization, User, WatchEvent};
