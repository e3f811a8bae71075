// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Drive a full system update through the external update service

use std::{cmp::Ordering, collections::HashMap, fmt, time::Duration};

use crossbeam_channel::{after, never, select, RecvError};

use crate::{
    image::{version_compare, ImageInfo, CLIENT_CONFIG},
    partition::{MountMode, Partition},
    service::{Notification, Signal, UpdateService, UpdateStatus, Watch},
    Error,
};

/// Where an update run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    SyncingBootFiles,
    Downloading,
    Applying,
    Verifying,
    Done,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::SyncingBootFiles => "syncing boot files",
            State::Downloading => "downloading",
            State::Applying => "applying",
            State::Verifying => "verifying",
            State::Done => "done",
            State::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// An update offered by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTarget {
    /// Version the updated slot must report afterwards
    pub version: String,

    pub size: Option<u64>,

    pub channel: Option<String>,
}

/// Progress rendering, supplied by the caller
pub trait Progress {
    fn start(&mut self, label: &str, total: f64);

    fn set(&mut self, current: f64);

    fn finished(&mut self);
}

/// Used when the caller does not render progress
struct Silent;

impl Progress for Silent {
    fn start(&mut self, _label: &str, _total: f64) {}

    fn set(&mut self, _current: f64) {}

    fn finished(&mut self) {}
}

/// Sequences boot file sync, download, apply, verification and the boot switch
pub struct Orchestrator {
    partition: Partition,
    service: Box<dyn UpdateService>,
    timeout: Duration,
    state: State,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("partition", &self.partition)
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(partition: Partition, service: Box<dyn UpdateService>) -> Self {
        let timeout = partition.config().timeout;
        Self {
            partition,
            service,
            timeout,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Pass through of the service's system description
    pub fn information(&self) -> Result<HashMap<String, String>, Error> {
        self.service.information()
    }

    pub fn setting(&self, key: &str) -> Result<Option<String>, Error> {
        self.service.get_setting(key)
    }

    /// Have the service pick up the client configuration shipped by the other slot
    ///
    /// No other slot, or no configuration in it, leaves the service untouched.
    pub fn reload_configuration(&self) -> Result<(), Error> {
        let res = self.partition.run_with_other(MountMode::ReadOnly, |root| {
            let path = root.join(CLIENT_CONFIG);
            if !path.exists() {
                log::debug!("No client configuration in other rootfs");
                return Ok(());
            }
            self.service.reload_configuration(&path)
        });
        match res {
            Err(Error::NoDualPartition) => Ok(()),
            res => res,
        }
    }

    /// Ask the service whether an update is available
    pub fn check_for_update(&self) -> Result<UpdateStatus, Error> {
        self.reload_configuration()?;

        let available = self.service.subscribe(Signal::UpdateAvailableStatus);
        self.service.check_for_update()?;

        let deadline = after(self.timeout);
        let status = select! {
            recv(available.receiver()) -> msg => match msg {
                Ok(Notification::UpdateAvailableStatus(status)) => status,
                Ok(other) => return Err(Error::Service(format!("unexpected notification {other:?}"))),
                Err(RecvError) => return Err(Error::Disconnected),
            },
            recv(deadline) -> _ => return Err(Error::Timeout(self.timeout)),
        };

        match status.error_reason.as_deref() {
            Some(reason) if !reason.is_empty() => Err(Error::Service(reason.to_string())),
            _ => Ok(status),
        }
    }

    /// The update to install, if the service offers a newer version than ours
    pub fn updates(&self) -> Result<Option<UpdateTarget>, Error> {
        let status = self.check_for_update()?;
        if !status.is_available {
            return Ok(None);
        }

        let current = self.partition.current_image()?;
        let newer = match current.as_ref() {
            Some(c) => version_compare(&status.available_version, &c.version) == Ordering::Greater,
            None => true,
        };
        if !newer {
            log::debug!("Offered version {} is not newer", status.available_version);
            return Ok(None);
        }

        Ok(Some(UpdateTarget {
            version: status.available_version,
            size: status.update_size,
            channel: current.and_then(|c| c.channel),
        }))
    }

    /// Images on the running slot and, if present, the other one
    pub fn installed(&self) -> Result<Vec<ImageInfo>, Error> {
        let mut images = vec![];
        images.extend(self.partition.current_image()?);
        images.extend(self.partition.other_image()?);
        Ok(images)
    }

    /// Install `target`, switching the next boot to it
    ///
    /// A failure leaves the boot variables untouched by this run and the
    /// state at [`State::Failed`].
    pub fn install(&mut self, target: &UpdateTarget, progress: Option<&mut dyn Progress>) -> Result<(), Error> {
        self.state = State::Idle;
        let res = self.run_install(target, progress);
        if let Err(e) = &res {
            log::error!("Update to {} failed while {}: {e}", target.version, self.state);
            self.state = State::Failed;
        }
        res
    }

    /// Confirm the running slot, a no-op unless it is in try mode
    pub fn mark_boot_successful(&self) -> Result<(), Error> {
        self.partition.mark_boot_successful()
    }

    fn transition(&mut self, state: State) {
        log::debug!("{} -> {}", self.state, state);
        self.state = state;
    }

    fn run_install(&mut self, target: &UpdateTarget, progress: Option<&mut dyn Progress>) -> Result<(), Error> {
        let report = progress.is_some();
        let mut silent = Silent;
        let progress: &mut dyn Progress = match progress {
            Some(p) => p,
            None => &mut silent,
        };

        // Always first, the other slot must stay bootable whatever happens next
        self.transition(State::SyncingBootFiles);
        self.partition.sync_bootloader_files()?;

        self.transition(State::Downloading);
        let failed = self.service.subscribe(Signal::UpdateFailed);
        {
            let downloaded = self.service.subscribe(Signal::UpdateDownloaded);
            let updates = report.then(|| self.service.subscribe(Signal::UpdateProgress));
            progress.start(&format!("Downloading {}", target.version), 100.0);
            self.service.download_update()?;
            self.wait_downloaded(&downloaded, &failed, updates.as_ref(), &mut *progress)?;
            progress.finished();
        }

        self.transition(State::Applying);
        {
            let applied = self.service.subscribe(Signal::Rebooting);
            self.service.apply_update()?;
            self.wait_applied(&applied, &failed)?;
        }
        drop(failed);

        self.transition(State::Verifying);
        self.verify(target)?;

        self.partition.update_bootloader()?;
        self.transition(State::Done);
        log::info!("Installed update {}", target.version);

        Ok(())
    }

    /// First of downloaded, failed, timeout or the service hanging up
    fn wait_downloaded(
        &self,
        downloaded: &Watch,
        failed: &Watch,
        updates: Option<&Watch>,
        progress: &mut dyn Progress,
    ) -> Result<(), Error> {
        let deadline = after(self.timeout);
        let updates = updates.map(|w| w.receiver().clone()).unwrap_or_else(never);
        let mut forward = |msg: Notification| {
            if let Notification::UpdateProgress { percentage, .. } = msg {
                progress.set(f64::from(percentage));
            }
        };

        loop {
            select! {
                recv(downloaded.receiver()) -> msg => {
                    msg.map_err(|_| Error::Disconnected)?;
                    updates.try_iter().for_each(&mut forward);
                    return Ok(());
                },
                recv(failed.receiver()) -> msg => return Err(self.failure(msg)),
                recv(updates) -> msg => match msg {
                    Ok(msg) => forward(msg),
                    Err(RecvError) => return Err(Error::Disconnected),
                },
                recv(deadline) -> _ => return Err(Error::Timeout(self.timeout)),
                }
        }
    }

    /// Applying may reboot the device, so there is no deadline
    fn wait_applied(&self, applied: &Watch, failed: &Watch) -> Result<(), Error> {
        select! {
            recv(applied.receiver()) -> msg => match msg {
                Ok(Notification::Rebooting(true)) => Ok(()),
                Ok(_) => Err(Error::UpdateFailed {
                    phase: self.state,
                    reason: "update service refused to apply the update".into(),
                }),
                Err(RecvError) => Err(Error::Disconnected),
            },
            recv(failed.receiver()) -> msg => Err(self.failure(msg)),
        }
    }

    fn failure(&self, msg: Result<Notification, RecvError>) -> Error {
        match msg {
            Ok(Notification::UpdateFailed { attempts, reason }) => {
                log::debug!("update service gave up after {attempts} attempts");
                Error::UpdateFailed {
                    phase: self.state,
                    reason,
                }
            }
            Ok(other) => Error::Service(format!("unexpected notification {other:?}")),
            Err(RecvError) => Error::Disconnected,
        }
    }

    /// The freshly installed slot must carry the version we asked for
    fn verify(&self, target: &UpdateTarget) -> Result<(), Error> {
        let latest = if self.partition.dual_root_partitions() {
            self.partition.other_image()?
        } else {
            self.partition.current_image()?
        };
        let latest = latest.ok_or(Error::NoLatestPartition)?;

        if latest.version != target.version {
            return Err(Error::VerificationFailed {
                expected: target.version.clone(),
                found: latest.version,
            });
        }
        log::debug!("Verified installed version {}", latest.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, fs, path::Path, rc::Rc, time::Duration};

    use crossbeam_channel::Sender;
    use topology::disk::builder;

    use super::{Orchestrator, Progress, State, UpdateTarget};
    use crate::{
        image::{CHANNEL_CONFIG, CLIENT_CONFIG},
        partition::{
            tests::{uboot_root, FakeMounter, DUAL},
            Partition,
        },
        service::{Notification, Signal, UpdateService, UpdateStatus, Watch},
        Configuration, Error,
    };

    #[derive(Debug, Default)]
    struct Script {
        on_check: Vec<Notification>,
        on_download: Vec<Notification>,
        on_apply: Vec<Notification>,
        calls: Vec<String>,
        subscribers: Vec<(Signal, Sender<Notification>)>,
        /// Request after which every watch is disconnected
        hang_up: Option<&'static str>,
    }

    /// Replays scripted notifications when a request arrives
    #[derive(Debug, Default, Clone)]
    struct FakeService(Rc<RefCell<Script>>);

    impl FakeService {
        fn request(&self, name: &str, notifications: impl Fn(&Script) -> Vec<Notification>) {
            let mut script = self.0.borrow_mut();
            script.calls.push(name.to_string());
            for n in notifications(&*script) {
                script
                    .subscribers
                    .retain(|(signal, sender)| *signal != n.signal() || sender.send(n.clone()).is_ok());
            }
            if script.hang_up == Some(name) {
                script.subscribers.clear();
            }
        }

        fn calls(&self) -> Vec<String> {
            self.0.borrow().calls.clone()
        }
    }

    impl UpdateService for FakeService {
        fn check_for_update(&self) -> Result<(), Error> {
            self.request("check", |s| s.on_check.clone());
            Ok(())
        }

        fn download_update(&self) -> Result<(), Error> {
            self.request("download", |s| s.on_download.clone());
            Ok(())
        }

        fn apply_update(&self) -> Result<(), Error> {
            self.request("apply", |s| s.on_apply.clone());
            Ok(())
        }

        fn information(&self) -> Result<HashMap<String, String>, Error> {
            Ok(HashMap::from([("target_build_number".to_string(), "43".to_string())]))
        }

        fn get_setting(&self, _key: &str) -> Result<Option<String>, Error> {
            Ok(None)
        }

        fn reload_configuration(&self, path: &Path) -> Result<(), Error> {
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            self.0.borrow_mut().calls.push(format!("reload {name}"));
            Ok(())
        }

        fn subscribe(&self, signal: Signal) -> Watch {
            let (sender, watch) = Watch::new(signal);
            self.0.borrow_mut().subscribers.push((signal, sender));
            watch
        }
    }

    #[derive(Debug, Default)]
    struct Recorder(Vec<String>);

    impl Progress for Recorder {
        fn start(&mut self, label: &str, total: f64) {
            self.0.push(format!("start {label} {total}"));
        }

        fn set(&mut self, current: f64) {
            self.0.push(format!("set {current}"));
        }

        fn finished(&mut self) {
            self.0.push("finished".into());
        }
    }

    fn write_image(root: &Path, build: &str) {
        let path = root.join(CHANNEL_CONFIG);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("[service]\nbuild_number: {build}\nchannel: stable\n")).unwrap();
    }

    /// Dual slot u-boot device running build 42
    fn orchestrator(root: &Path, script: Script, timeout: Duration) -> (Orchestrator, FakeService) {
        uboot_root(root);
        write_image(root, "42");

        let config = Configuration {
            timeout,
            ..Configuration::with_root(root)
        };
        let probe = builder::new().with_lsblk_output(DUAL).build().expect("probe");
        let partition = Partition::new(config, &probe, Box::new(FakeMounter::default())).expect("partition");
        let service = FakeService(Rc::new(RefCell::new(script)));
        (Orchestrator::new(partition, Box::new(service.clone())), service)
    }

    fn target(version: &str) -> UpdateTarget {
        UpdateTarget {
            version: version.into(),
            size: None,
            channel: None,
        }
    }

    /// The other slot as seen through the (fake) mount
    fn other_root(o: &Orchestrator) -> std::path::PathBuf {
        o.partition().config().mount_target()
    }

    fn success_script() -> Script {
        Script {
            on_download: vec![
                Notification::UpdateProgress {
                    percentage: 50,
                    eta: 1.0,
                },
                Notification::UpdateDownloaded,
            ],
            on_apply: vec![Notification::Rebooting(true)],
            ..Default::default()
        }
    }

    #[test]
    fn install_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut o, service) = orchestrator(dir.path(), success_script(), Duration::from_secs(5));
        write_image(&other_root(&o), "43");

        let mut progress = Recorder::default();
        o.install(&target("43"), Some(&mut progress)).expect("install");

        assert_eq!(o.state(), State::Done);
        assert_eq!(service.calls(), vec!["download", "apply"]);
        assert_eq!(progress.0, vec!["start Downloading 43 100", "set 50", "finished"]);

        // Boot files synced to b, and b is tried next
        let boot = dir.path().join("boot").join("uboot");
        assert_eq!(fs::read_to_string(boot.join("b").join("vmlinuz")).unwrap(), "kernel a");
        assert!(o.partition().next_boot_is_other());

        o.mark_boot_successful().expect("mark");
        o.mark_boot_successful().expect("mark twice");
        assert!(!o.partition().next_boot_is_other());
    }

    #[test]
    fn download_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut o, service) = orchestrator(dir.path(), Script::default(), Duration::from_millis(50));

        let err = o.install(&target("43"), None).unwrap_err();
        assert!(matches!(err, Error::Timeout(t) if t == Duration::from_millis(50)));
        assert_eq!(o.state(), State::Failed);
        assert_eq!(service.calls(), vec!["download"]);
        assert!(!o.partition().next_boot_is_other());
    }

    #[test]
    fn download_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = Script {
            on_download: vec![Notification::UpdateFailed {
                attempts: 1,
                reason: "no space left".into(),
            }],
            ..Default::default()
        };
        let (mut o, service) = orchestrator(dir.path(), script, Duration::from_secs(5));

        match o.install(&target("43"), None) {
            Err(Error::UpdateFailed { phase, reason }) => {
                assert_eq!(phase, State::Downloading);
                assert_eq!(reason, "no space left");
            }
            res => panic!("unexpected result {res:?}"),
        }
        assert_eq!(service.calls(), vec!["download"]);
    }

    #[test]
    fn apply_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = Script {
            on_download: vec![Notification::UpdateDownloaded],
            on_apply: vec![Notification::UpdateFailed {
                attempts: 2,
                reason: "bad signature".into(),
            }],
            ..Default::default()
        };
        let (mut o, _) = orchestrator(dir.path(), script, Duration::from_secs(5));

        let err = o.install(&target("43"), None).unwrap_err();
        assert!(matches!(err, Error::UpdateFailed { phase: State::Applying, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn verification_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut o, _) = orchestrator(dir.path(), success_script(), Duration::from_secs(5));
        write_image(&other_root(&o), "42");

        let err = o.install(&target("43"), None).unwrap_err();
        assert!(matches!(err, Error::VerificationFailed { .. }));
        assert!(err.is_fatal());
        assert!(!o.partition().next_boot_is_other());
    }

    #[test]
    fn missing_latest_partition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut o, _) = orchestrator(dir.path(), success_script(), Duration::from_secs(5));

        let err = o.install(&target("43"), None).unwrap_err();
        assert!(matches!(err, Error::NoLatestPartition));
        assert!(err.is_fatal());
    }

    #[test]
    fn service_hang_up_ends_wait() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = Script {
            on_download: vec![Notification::UpdateDownloaded],
            hang_up: Some("apply"),
            ..Default::default()
        };
        let (mut o, service) = orchestrator(dir.path(), script, Duration::from_secs(30));

        let err = o.install(&target("43"), None).unwrap_err();
        assert!(matches!(err, Error::Disconnected));
        assert_eq!(o.state(), State::Failed);
        assert_eq!(service.calls(), vec!["download", "apply"]);
        assert!(!o.partition().next_boot_is_other());
    }

    #[test]
    fn failed_run_does_not_leak_into_next() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut o, service) = orchestrator(dir.path(), Script::default(), Duration::from_millis(50));
        write_image(&other_root(&o), "43");

        assert!(matches!(o.install(&target("43"), None), Err(Error::Timeout(_))));
        assert_eq!(o.state(), State::Failed);

        // Same orchestrator, service now answers every request
        *service.0.borrow_mut() = Script {
            calls: service.calls(),
            ..success_script()
        };
        for _ in 0..3 {
            o.install(&target("43"), None).expect("install");
            assert_eq!(o.state(), State::Done);
        }
        assert_eq!(
            service.calls(),
            vec!["download", "download", "apply", "download", "apply", "download", "apply"]
        );
    }

    #[test]
    fn check_and_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = Script {
            on_check: vec![Notification::UpdateAvailableStatus(UpdateStatus {
                is_available: true,
                available_version: "43".into(),
                update_size: Some(1024),
                ..Default::default()
            })],
            ..Default::default()
        };
        let (o, service) = orchestrator(dir.path(), script, Duration::from_secs(5));
        let client = other_root(&o).join(CLIENT_CONFIG);
        fs::create_dir_all(client.parent().unwrap()).unwrap();
        fs::write(&client, "[service]\n").unwrap();

        let update = o.updates().expect("updates").expect("newer");
        assert_eq!(update.version, "43");
        assert_eq!(update.size, Some(1024));
        assert_eq!(update.channel.as_deref(), Some("stable"));
        assert_eq!(service.calls(), vec!["reload client.ini", "check"]);
    }

    #[test]
    fn no_newer_update() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = Script {
            on_check: vec![Notification::UpdateAvailableStatus(UpdateStatus {
                is_available: true,
                available_version: "9".into(),
                ..Default::default()
            })],
            ..Default::default()
        };
        let (o, service) = orchestrator(dir.path(), script, Duration::from_secs(5));
        assert!(o.updates().expect("updates").is_none());
        // No client.ini in the other slot, nothing to reload
        assert_eq!(service.calls(), vec!["check"]);
    }

    #[test]
    fn check_error_reason() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = Script {
            on_check: vec![Notification::UpdateAvailableStatus(UpdateStatus {
                error_reason: Some("network unreachable".into()),
                ..Default::default()
            })],
            ..Default::default()
        };
        let (o, _) = orchestrator(dir.path(), script, Duration::from_secs(5));
        assert!(matches!(o.check_for_update(), Err(Error::Service(r)) if r == "network unreachable"));
    }

    #[test]
    fn installed_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (o, _) = orchestrator(dir.path(), Script::default(), Duration::from_secs(5));
        write_image(&other_root(&o), "41");

        let images = o.installed().expect("installed");
        assert_eq!(images.len(), 2);
        assert!(images[0].active);
        assert_eq!(images[1].version, "41");
        assert_eq!(o.information().expect("info").get("target_build_number").map(String::as_str), Some("43"));
    }
}
