//! retrodock - desktop manager for game emulators
//!
//! Downloads, installs, updates, and launches emulators (Dolphin, Ryujinx,
//! yuzu, Xenia), scans ROM directories, and keeps results in a JSON-indexed
//! artifact cache. Long-running work (downloads, extraction, directory
//! copies) runs on worker threads, reports progress through a shared
//! [`progress::ProgressHandler`], and supports cooperative cancellation with
//! rollback; outcomes are marshalled back to the controlling thread by
//! [`events::ThreadEventManager`].

pub mod cache;
pub mod config;
pub mod emulators;
pub mod events;
pub mod fileops;
pub mod progress;
pub mod releases;
