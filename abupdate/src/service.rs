// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The external update service driving downloads and installs
//!
//! The service answers requests immediately and reports completion later,
//! through notifications delivered on a [`Watch`] per [`Signal`].

use std::{collections::HashMap, path::Path};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::Error;

/// Notification kinds a caller may subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    UpdateAvailableStatus,
    UpdateDownloaded,
    UpdateFailed,
    UpdateProgress,
    Rebooting,
}

/// Result of a `check_for_update` request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateStatus {
    pub is_available: bool,
    pub downloading: bool,
    pub available_version: String,
    pub update_size: Option<u64>,
    pub last_update_date: Option<String>,

    /// Set when the check itself failed
    pub error_reason: Option<String>,
}

/// Asynchronous notification from the update service
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    UpdateAvailableStatus(UpdateStatus),
    UpdateDownloaded,
    UpdateFailed { attempts: u32, reason: String },
    UpdateProgress { percentage: u8, eta: f64 },

    /// The update was applied; `false` means the service refused to apply it
    Rebooting(bool),
}

impl Notification {
    pub fn signal(&self) -> Signal {
        match self {
            Notification::UpdateAvailableStatus(_) => Signal::UpdateAvailableStatus,
            Notification::UpdateDownloaded => Signal::UpdateDownloaded,
            Notification::UpdateFailed { .. } => Signal::UpdateFailed,
            Notification::UpdateProgress { .. } => Signal::UpdateProgress,
            Notification::Rebooting(_) => Signal::Rebooting,
        }
    }
}

/// Subscription to one [`Signal`]
///
/// Dropping the watch disconnects it, services must stop delivering to a
/// sender once `send` fails.
#[derive(Debug)]
pub struct Watch {
    signal: Signal,
    receiver: Receiver<Notification>,
}

impl Watch {
    /// New subscription, returning the sending half for the service
    pub fn new(signal: Signal) -> (Sender<Notification>, Self) {
        let (sender, receiver) = unbounded();
        (sender, Self { signal, receiver })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn receiver(&self) -> &Receiver<Notification> {
        &self.receiver
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        log::trace!("Cancelled watch for {:?}", self.signal);
    }
}

/// Requests understood by the update service
///
/// Every request returns once accepted. Completion is only ever reported
/// through notifications.
pub trait UpdateService {
    fn check_for_update(&self) -> Result<(), Error>;

    fn download_update(&self) -> Result<(), Error>;

    fn apply_update(&self) -> Result<(), Error>;

    /// Free form description of the running system
    fn information(&self) -> Result<HashMap<String, String>, Error>;

    fn get_setting(&self, key: &str) -> Result<Option<String>, Error>;

    /// Use the client configuration at `path` from now on
    fn reload_configuration(&self, path: &Path) -> Result<(), Error>;

    fn subscribe(&self, signal: Signal) -> Watch;
}

#[cfg(test)]
mod tests {
    use super::{Notification, Signal, Watch};

    #[test]
    fn dropped_watch_disconnects() {
        let (sender, watch) = Watch::new(Signal::UpdateDownloaded);
        assert_eq!(watch.signal(), Notification::UpdateDownloaded.signal());
        sender.send(Notification::UpdateDownloaded).expect("connected");
        assert_eq!(watch.receiver().recv(), Ok(Notification::UpdateDownloaded));

        drop(watch);
        assert!(sender.send(Notification::UpdateDownloaded).is_err());
    }
}
