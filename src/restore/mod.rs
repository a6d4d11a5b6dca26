// restore-sidecar/src/restore/mod.rs
//! Restore job orchestration: per-instance slice tracking, admission
//! controlled processing and cleanup of obsolete staging data.

pub(crate) mod archive;
pub(crate) mod discoverer;
pub(crate) mod job;
pub(crate) mod manager;
pub(crate) mod manager_group;
pub(crate) mod processor;
pub(crate) mod s3_download;
pub(crate) mod slice;
pub(crate) mod tracker;
pub(crate) mod util;
