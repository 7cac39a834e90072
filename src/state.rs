//! Process-wide switches the host owns: the pause flag and the admin list.
//! The admin list is seeded from config and only carried here; the chat
//! transport decides what admins may do.
//!
//! A [`SystemState`] is passed by reference into every
//! [`crate::pipeline::Resolver::resolve`] call. Persisting it across restarts
//! is up to the host.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::ResolverConfig;

#[derive(Debug, Default)]
pub struct SystemState {
    paused: AtomicBool,
    pub admins: HashSet<String>,
}

impl SystemState {
    pub fn new<I, S>(paused: bool, admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paused: AtomicBool::new(paused),
            admins: admins
                .into_iter()
                .map(Into::into)
                .map(|id: String| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &ResolverConfig) -> Self {
        Self::new(config.start_paused, config.admins.iter().cloned())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!("resolution paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("resolution resumed");
        }
    }
}
