//! Device repository: owns every open device handle and tears them all down
//! with one awaited shutdown.
//!
//! **Why**: Devices are exclusive and release asynchronously. Callers need a
//! single completion meaning "every device is gone", even when shutdown is
//! requested again while a previous drain is still running.
//!
//! **Used by**: Application session setup/teardown, consumer groups (as a
//! `GroupStateListener`)
//!
//! # Shutdown protocol
//!
//! `shutdown_all()` moves every tracked device into the releasing set and asks
//! it to release. All calls made before the releasing set drains share one
//! completion, so a later call can never resolve early because it saw a
//! shrinking set. Once the set is empty the shared completion resolves and the
//! bookkeeping is cleared, so `register_all` starts clean.
//!
//! Devices leave the acquirable table as soon as shutdown is requested:
//! `acquire` fails with `UnknownDevice` while they drain and afterwards.
//! `device_state` keeps reporting `Releasing` until the release finishes.
//!
//! Handles are never called with the repository lock held.

use log::{debug, error, info, trace, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::completion::{self, Completer, Completion};
use super::observable::BroadcastState;
use crate::entities::{ConsumerGroup, ConsumerId, DeviceHandle, DevicePlatform, GroupStateListener};
use crate::error::{Abandoned, DeviceError, RepositoryError};

/// Lifecycle of a tracked device. Released devices are no longer tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Open, no consumers
    Registered,
    /// Open with at least one consumer attached
    Attached,
    /// Shutdown requested, release not yet confirmed
    Releasing,
}

struct DeviceEntry {
    handle: Arc<dyn DeviceHandle>,
    consumers: HashSet<ConsumerId>,
}

/// Shutdown in progress
struct Drain {
    completer: Completer<()>,
    completion: Completion<()>,
}

#[derive(Default)]
struct RepoState {
    devices: BTreeMap<String, DeviceEntry>,
    /// Release token -> device id
    releasing: HashMap<u64, String>,
    drain: Option<Drain>,
    next_token: u64,
}

struct Shared {
    state: Mutex<RepoState>,
    releases: BroadcastState<String, DeviceError>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, RepoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_released(&self, token: u64, id: String, outcome: Result<Result<(), DeviceError>, Abandoned>) {
        match outcome {
            Ok(Ok(())) => {
                debug!("Device {} released", id);
                self.releases.publish_value(id);
            }
            Ok(Err(err)) => {
                error!("Device {} release failed: {}", id, err);
                self.releases.publish_error(err);
            }
            Err(Abandoned) => {
                error!("Device {} release abandoned", id);
                self.releases.publish_error(DeviceError::Release {
                    id,
                    reason: Abandoned.to_string(),
                });
            }
        }

        let finished = {
            let mut state = self.lock();
            state.releasing.remove(&token);
            trace!("{} device releases outstanding", state.releasing.len());
            if state.releasing.is_empty() {
                state.drain.take()
            } else {
                None
            }
        };
        if let Some(drain) = finished {
            info!("All devices released");
            drain.completer.complete(());
        }
    }
}

/// Mapping from device id to open device handle, one per application session.
pub struct DeviceRepository {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DeviceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("DeviceRepository")
            .field("devices", &state.devices.keys().collect::<Vec<_>>())
            .field("releasing", &state.releasing.len())
            .finish()
    }
}

impl Default for DeviceRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRepository {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RepoState::default()),
                releases: BroadcastState::new(),
            }),
        }
    }

    /// Open every available device not already tracked.
    ///
    /// Returns the number of newly registered devices. Safe to call again,
    /// including after (or during) a shutdown.
    pub fn register_all(&self, platform: &dyn DevicePlatform) -> Result<usize, RepositoryError> {
        let available = platform.list_available_device_ids()?;
        let missing: Vec<String> = {
            let state = self.shared.lock();
            available
                .into_iter()
                .filter(|id| !state.devices.contains_key(id))
                .collect()
        };

        let mut registered = 0;
        for id in missing {
            let handle = platform.open_device(&id)?;
            let duplicate = {
                let mut state = self.shared.lock();
                if state.devices.contains_key(&id) {
                    // Tracked like a shutdown release so a drain waits for it
                    let token = state.next_token;
                    state.next_token += 1;
                    state.releasing.insert(token, id.clone());
                    Some((token, handle))
                } else {
                    state.devices.insert(
                        id.clone(),
                        DeviceEntry {
                            handle,
                            consumers: HashSet::new(),
                        },
                    );
                    None
                }
            };
            match duplicate {
                // Registered concurrently by another caller
                Some((token, handle)) => {
                    warn!("Device {} opened twice, releasing the extra handle", id);
                    let shared = Arc::clone(&self.shared);
                    handle
                        .release()
                        .on_complete(move |outcome| shared.on_released(token, id, outcome));
                }
                None => {
                    debug!("Device {} registered", id);
                    registered += 1;
                }
            }
        }
        Ok(registered)
    }

    /// Handle for `id`. Fails for unknown devices and devices being shut down.
    pub fn acquire(&self, id: &str) -> Result<Arc<dyn DeviceHandle>, RepositoryError> {
        self.shared
            .lock()
            .devices
            .get(id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| RepositoryError::UnknownDevice(id.to_string()))
    }

    /// Ids of acquirable devices
    pub fn device_ids(&self) -> BTreeSet<String> {
        self.shared.lock().devices.keys().cloned().collect()
    }

    pub fn device_state(&self, id: &str) -> Option<DeviceState> {
        let state = self.shared.lock();
        if let Some(entry) = state.devices.get(id) {
            return Some(if entry.consumers.is_empty() {
                DeviceState::Registered
            } else {
                DeviceState::Attached
            });
        }
        state
            .releasing
            .values()
            .any(|releasing| releasing == id)
            .then_some(DeviceState::Releasing)
    }

    /// Clean releases (device id) and release failures
    pub fn releases(&self) -> &BroadcastState<String, DeviceError> {
        &self.shared.releases
    }

    /// Release every tracked device.
    ///
    /// The returned completion resolves once every device handed to any
    /// `shutdown_all` call since the last full drain has finished releasing,
    /// along with any extra handle a concurrent `register_all` is releasing.
    /// Failed releases are logged, published on `releases()` and count as
    /// finished.
    pub fn shutdown_all(&self) -> Completion<()> {
        let (completion, to_release) = {
            let mut state = self.shared.lock();
            if state.devices.is_empty() && state.releasing.is_empty() {
                return Completion::ready(());
            }

            let completion = match &state.drain {
                Some(drain) => drain.completion.clone(),
                None => {
                    let (completer, completion) = completion::pair();
                    state.drain = Some(Drain {
                        completer,
                        completion: completion.clone(),
                    });
                    completion
                }
            };

            // Every device joins the releasing set before any release starts,
            // so an inline release cannot drain the set early.
            let devices = std::mem::take(&mut state.devices);
            let mut to_release = Vec::with_capacity(devices.len());
            for (id, entry) in devices {
                let token = state.next_token;
                state.next_token += 1;
                state.releasing.insert(token, id.clone());
                to_release.push((token, id, entry.handle));
            }
            (completion, to_release)
        };

        info!("Shutting down {} devices", to_release.len());
        for (token, id, handle) in to_release {
            let shared = Arc::clone(&self.shared);
            handle
                .release()
                .on_complete(move |outcome| shared.on_released(token, id, outcome));
        }
        completion
    }

    // ========== Consumers ==========

    /// Attach `consumers` to device `id`.
    pub fn attach(&self, id: &str, consumers: &HashSet<ConsumerId>) -> Result<(), RepositoryError> {
        let handle = {
            let mut state = self.shared.lock();
            let entry = state
                .devices
                .get_mut(id)
                .ok_or_else(|| RepositoryError::UnknownDevice(id.to_string()))?;
            entry.consumers.extend(consumers.iter().copied());
            Arc::clone(&entry.handle)
        };
        handle.attach_consumers(consumers);
        Ok(())
    }

    /// Detach `consumers` from device `id`. The device stays open.
    pub fn detach(&self, id: &str, consumers: &HashSet<ConsumerId>) -> Result<(), RepositoryError> {
        let handle = {
            let mut state = self.shared.lock();
            let entry = state
                .devices
                .get_mut(id)
                .ok_or_else(|| RepositoryError::UnknownDevice(id.to_string()))?;
            entry.consumers.retain(|c| !consumers.contains(c));
            Arc::clone(&entry.handle)
        };
        handle.detach_consumers(consumers);
        Ok(())
    }

    /// Attach every consumer of `group` to its target device.
    ///
    /// All target devices are validated first; nothing is attached if one is
    /// unknown.
    pub fn attach_group(&self, group: &ConsumerGroup) -> Result<(), RepositoryError> {
        let targets = self.update_group(group, |entry, consumers| {
            entry.consumers.extend(consumers.iter().copied());
        })?;
        for (handle, consumers) in targets {
            handle.attach_consumers(&consumers);
        }
        Ok(())
    }

    /// Detach every consumer of `group` from its target device.
    pub fn detach_group(&self, group: &ConsumerGroup) -> Result<(), RepositoryError> {
        let targets = self.update_group(group, |entry, consumers| {
            entry.consumers.retain(|c| !consumers.contains(c));
        })?;
        for (handle, consumers) in targets {
            handle.detach_consumers(&consumers);
        }
        Ok(())
    }

    fn update_group(
        &self,
        group: &ConsumerGroup,
        update: impl Fn(&mut DeviceEntry, &HashSet<ConsumerId>),
    ) -> Result<Vec<(Arc<dyn DeviceHandle>, HashSet<ConsumerId>)>, RepositoryError> {
        let by_device = group.device_consumers();
        let mut state = self.shared.lock();
        if let Some(unknown) = by_device.keys().find(|id| !state.devices.contains_key(*id)) {
            return Err(RepositoryError::UnknownDevice(unknown.clone()));
        }

        let mut targets = Vec::with_capacity(by_device.len());
        for (id, consumers) in by_device {
            if let Some(entry) = state.devices.get_mut(&id) {
                update(entry, &consumers);
                targets.push((Arc::clone(&entry.handle), consumers));
            }
        }
        Ok(targets)
    }
}

impl GroupStateListener for DeviceRepository {
    fn on_group_active(&self, group: &ConsumerGroup) {
        if let Err(err) = self.attach_group(group) {
            error!("Failed to attach consumer group {}: {}", group.uuid(), err);
        }
    }

    fn on_group_inactive(&self, group: &ConsumerGroup) {
        if let Err(err) = self.detach_group(group) {
            error!("Failed to detach consumer group {}: {}", group.uuid(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observable::Observer;
    use crate::core::workers::DirectExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Device whose release is finished by the test.
    struct FakeDevice {
        id: String,
        pending: Mutex<Option<Completer<Result<(), DeviceError>>>>,
        release_calls: AtomicUsize,
        attached: Mutex<HashSet<ConsumerId>>,
    }

    impl FakeDevice {
        fn finish(&self, result: Result<(), DeviceError>) {
            let completer = self.pending.lock().unwrap().take().expect("release requested");
            completer.complete(result);
        }

        fn abandon(&self) {
            drop(self.pending.lock().unwrap().take());
        }

        fn attached(&self) -> HashSet<ConsumerId> {
            self.attached.lock().unwrap().clone()
        }
    }

    impl DeviceHandle for FakeDevice {
        fn id(&self) -> &str {
            &self.id
        }

        fn attach_consumers(&self, consumers: &HashSet<ConsumerId>) {
            self.attached.lock().unwrap().extend(consumers.iter().copied());
        }

        fn detach_consumers(&self, consumers: &HashSet<ConsumerId>) {
            self.attached.lock().unwrap().retain(|c| !consumers.contains(c));
        }

        fn release(&self) -> Completion<Result<(), DeviceError>> {
            self.release_calls.fetch_add(1, Ordering::SeqCst);
            let (completer, completion) = completion::pair();
            *self.pending.lock().unwrap() = Some(completer);
            completion
        }
    }

    #[derive(Default)]
    struct FakePlatform {
        ids: Mutex<BTreeSet<String>>,
        opened: Mutex<Vec<Arc<FakeDevice>>>,
        fail_enumeration: bool,
    }

    impl FakePlatform {
        fn with_ids(ids: &[&str]) -> Self {
            let platform = Self::default();
            platform.set_ids(ids);
            platform
        }

        fn set_ids(&self, ids: &[&str]) {
            *self.ids.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
        }

        /// Most recently opened device with `id`
        fn device(&self, id: &str) -> Arc<FakeDevice> {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|d| d.id == id)
                .cloned()
                .unwrap()
        }

        fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    impl DevicePlatform for FakePlatform {
        fn list_available_device_ids(&self) -> Result<BTreeSet<String>, DeviceError> {
            if self.fail_enumeration {
                return Err(DeviceError::Enumeration("service unavailable".into()));
            }
            Ok(self.ids.lock().unwrap().clone())
        }

        fn open_device(&self, id: &str) -> Result<Arc<dyn DeviceHandle>, DeviceError> {
            let device = Arc::new(FakeDevice {
                id: id.to_string(),
                pending: Mutex::new(None),
                release_calls: AtomicUsize::new(0),
                attached: Mutex::new(HashSet::new()),
            });
            self.opened.lock().unwrap().push(Arc::clone(&device));
            Ok(device)
        }
    }

    #[derive(Default)]
    struct ReleaseLog {
        released: Mutex<Vec<String>>,
        failed: Mutex<Vec<DeviceError>>,
    }

    impl Observer<String, DeviceError> for ReleaseLog {
        fn on_new_data(&self, id: String) {
            self.released.lock().unwrap().push(id);
        }
        fn on_error(&self, error: DeviceError) {
            self.failed.lock().unwrap().push(error);
        }
    }

    #[test]
    fn test_shutdown_empty_resolves_immediately() {
        let repo = DeviceRepository::new();
        assert!(repo.shutdown_all().is_complete());
    }

    #[test]
    fn test_acquire_unknown_while_draining_and_after() {
        let platform = FakePlatform::with_ids(&["0", "1"]);
        let repo = DeviceRepository::new();
        assert_eq!(repo.register_all(&platform), Ok(2));
        assert!(repo.acquire("0").is_ok());

        let done = repo.shutdown_all();
        assert!(matches!(repo.acquire("0"), Err(RepositoryError::UnknownDevice(_))));
        assert_eq!(repo.device_state("0"), Some(DeviceState::Releasing));

        platform.device("0").finish(Ok(()));
        assert!(!done.is_complete());
        assert_eq!(repo.device_state("0"), None);
        assert_eq!(repo.device_state("1"), Some(DeviceState::Releasing));

        platform.device("1").finish(Ok(()));
        assert_eq!(done.try_get(), Some(Ok(())));
        assert!(matches!(repo.acquire("0"), Err(RepositoryError::UnknownDevice(_))));
        assert_eq!(repo.device_state("1"), None);
    }

    #[test]
    fn test_repeated_shutdown_shares_one_completion() {
        let platform = FakePlatform::with_ids(&["0", "1"]);
        let repo = DeviceRepository::new();
        repo.register_all(&platform).unwrap();

        let first = repo.shutdown_all();
        let second = repo.shutdown_all();
        assert!(second.same_as(&first));

        platform.device("0").finish(Ok(()));
        let third = repo.shutdown_all();
        assert!(third.same_as(&first));
        assert!(!third.is_complete());

        platform.device("1").finish(Ok(()));
        assert!(first.is_complete());
        assert!(second.is_complete());
        assert!(third.is_complete());
        assert_eq!(platform.device("0").release_calls.load(Ordering::SeqCst), 1);
        assert_eq!(platform.device("1").release_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_during_drain_waits_for_new_devices() {
        let platform = FakePlatform::with_ids(&["0"]);
        let repo = DeviceRepository::new();
        repo.register_all(&platform).unwrap();
        let first = repo.shutdown_all();

        platform.set_ids(&["0", "1"]);
        assert_eq!(repo.register_all(&platform), Ok(2));
        let second = repo.shutdown_all();
        assert!(second.same_as(&first));

        // The old "0" drains, the new "0" and "1" still hold the completion
        platform.opened.lock().unwrap()[0].finish(Ok(()));
        assert!(!first.is_complete());
        platform.device("0").finish(Ok(()));
        assert!(!first.is_complete());
        platform.device("1").finish(Ok(()));
        assert!(first.is_complete());
    }

    #[test]
    fn test_failed_release_still_finishes() {
        let platform = FakePlatform::with_ids(&["0", "1", "2"]);
        let repo = DeviceRepository::new();
        let log = Arc::new(ReleaseLog::default());
        repo.releases().add_observer(Arc::new(DirectExecutor), log.clone());
        repo.register_all(&platform).unwrap();

        let done = repo.shutdown_all();
        platform.device("0").finish(Err(DeviceError::Release {
            id: "0".into(),
            reason: "bus reset".into(),
        }));
        platform.device("1").abandon();
        platform.device("2").finish(Ok(()));

        assert_eq!(done.wait(), Ok(()));
        assert_eq!(*log.released.lock().unwrap(), vec!["2".to_string()]);
        assert_eq!(log.failed.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_register_again_after_shutdown() {
        let platform = FakePlatform::with_ids(&["0"]);
        let repo = DeviceRepository::new();
        repo.register_all(&platform).unwrap();
        assert_eq!(repo.register_all(&platform), Ok(0));
        assert_eq!(platform.open_count(), 1);

        let done = repo.shutdown_all();
        platform.device("0").finish(Ok(()));
        assert!(done.is_complete());

        assert_eq!(repo.register_all(&platform), Ok(1));
        assert_eq!(platform.open_count(), 2);
        assert_eq!(repo.acquire("0").unwrap().id(), "0");
        assert_eq!(repo.device_ids().len(), 1);

        // A fresh drain gets a fresh completion
        let again = repo.shutdown_all();
        assert!(!again.same_as(&done));
        platform.device("0").finish(Ok(()));
        assert!(again.is_complete());
    }

    /// Platform that registers the same devices again from inside its first open.
    struct RacingPlatform {
        inner: FakePlatform,
        repo: std::sync::OnceLock<std::sync::Weak<DeviceRepository>>,
        raced: std::sync::atomic::AtomicBool,
    }

    impl DevicePlatform for RacingPlatform {
        fn list_available_device_ids(&self) -> Result<BTreeSet<String>, DeviceError> {
            self.inner.list_available_device_ids()
        }

        fn open_device(&self, id: &str) -> Result<Arc<dyn DeviceHandle>, DeviceError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                if let Some(repo) = self.repo.get().and_then(std::sync::Weak::upgrade) {
                    assert_eq!(repo.register_all(self), Ok(1));
                }
            }
            self.inner.open_device(id)
        }
    }

    #[test]
    fn test_shutdown_waits_for_extra_handle_from_concurrent_register() {
        let repo = Arc::new(DeviceRepository::new());
        let platform = RacingPlatform {
            inner: FakePlatform::with_ids(&["0"]),
            repo: std::sync::OnceLock::new(),
            raced: std::sync::atomic::AtomicBool::new(false),
        };
        let _ = platform.repo.set(Arc::downgrade(&repo));

        assert_eq!(repo.register_all(&platform), Ok(0));
        let (kept, extra) = {
            let opened = platform.inner.opened.lock().unwrap();
            (Arc::clone(&opened[0]), Arc::clone(&opened[1]))
        };
        assert_eq!(extra.release_calls.load(Ordering::SeqCst), 1);
        assert_eq!(repo.device_state("0"), Some(DeviceState::Registered));

        let done = repo.shutdown_all();
        kept.finish(Ok(()));
        assert!(!done.is_complete());
        extra.finish(Ok(()));
        assert_eq!(done.try_get(), Some(Ok(())));
        assert!(repo.device_ids().is_empty());
    }

    #[test]
    fn test_enumeration_failure() {
        let platform = FakePlatform {
            fail_enumeration: true,
            ..FakePlatform::default()
        };
        let repo = DeviceRepository::new();
        assert!(matches!(
            repo.register_all(&platform),
            Err(RepositoryError::Device(DeviceError::Enumeration(_)))
        ));
        assert!(repo.device_ids().is_empty());
    }

    #[test]
    fn test_group_activation_attaches_and_detaches() {
        let platform = FakePlatform::with_ids(&["0", "1"]);
        let repo = Arc::new(DeviceRepository::new());
        repo.register_all(&platform).unwrap();

        let group = ConsumerGroup::new();
        let preview = Uuid::new_v4();
        group.add_consumer("0", preview);
        group.add_listener(repo.clone());

        group.start();
        assert!(platform.device("0").attached().contains(&preview));
        assert_eq!(repo.device_state("0"), Some(DeviceState::Attached));
        assert_eq!(repo.device_state("1"), Some(DeviceState::Registered));

        group.stop();
        assert!(platform.device("0").attached().is_empty());
        // No implicit idle-close
        assert_eq!(repo.device_state("0"), Some(DeviceState::Registered));
        assert_eq!(platform.device("0").release_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_group_with_unknown_device_touches_nothing() {
        let platform = FakePlatform::with_ids(&["0"]);
        let repo = DeviceRepository::new();
        repo.register_all(&platform).unwrap();

        let group = ConsumerGroup::new();
        group.add_consumer("0", Uuid::new_v4());
        group.add_consumer("9", Uuid::new_v4());

        assert_eq!(
            repo.attach_group(&group),
            Err(RepositoryError::UnknownDevice("9".into()))
        );
        assert!(platform.device("0").attached().is_empty());

        let consumers: HashSet<ConsumerId> = [Uuid::new_v4()].into_iter().collect();
        assert!(repo.attach("9", &consumers).is_err());
        repo.attach("0", &consumers).unwrap();
        assert_eq!(platform.device("0").attached(), consumers);
        repo.detach("0", &consumers).unwrap();
        assert!(platform.device("0").attached().is_empty());
    }
}
