//! Client-side state synchronization for a multi-window dictation app.
//!
//! The backend process owns all ground truth. This crate mirrors it:
//! [`app::EventCoordinator`] fans backend events out to per-window handlers,
//! [`app::RecordingMachine`] tracks recording state, [`app::DownloadOrchestrator`]
//! tracks model downloads and [`app::ReadinessAggregator`] derives the
//! "can we record" flags. [`app::Client`] owns one of each.

pub mod app;
pub mod backend;
pub mod bus;
pub mod config;
pub mod notice;
pub mod sidecar;
