//! Account settings and download policy

mod account;
mod strategy;

pub use account::{Account, AccountSettings, normalize_multi_fetch_size};
pub use strategy::DownloadStrategy;
