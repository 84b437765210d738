//! Container creation watcher.
//!
//! Download progress notifications start as soon as a create request is
//! accepted, so a [`CreationWatcher`] must be opened before
//! [`Container::create`](super::Container::create) is called. One
//! subscription carries both the download and created signals for the
//! container's correlation key.

use super::{created_outcome, Container};
use crate::context::Context;
use crate::error::{Error, Result, ResultExt};
use crate::signal::{wait_for_signal, Subscription};
use vmorch_protocol::{
    signals, CorrelationKey, DownloadingStatus, LxdContainerCreatedSignal,
    LxdContainerDownloadingSignal,
};

/// Observes download progress and completion of one container's creation.
pub struct CreationWatcher {
    key: CorrelationKey,
    subscription: Subscription,
}

impl CreationWatcher {
    /// Start watching `container`.
    pub async fn new(container: &Container) -> Result<Self> {
        let key = container.key();
        let subscription = container
            .session()
            .dispatcher()
            .subscribe(
                &[signals::LXD_CONTAINER_DOWNLOADING, signals::LXD_CONTAINER_CREATED],
                Some(key.clone()),
            )
            .await
            .with_context(|| format!("{}: watch creation", key))?;

        Ok(Self { key, subscription })
    }

    /// Correlation key being watched.
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Wait for a download progress notification.
    ///
    /// With `pct < 0` the next progress notification is returned. Otherwise
    /// only a notification reporting exactly `pct` percent is. A download
    /// that stops for any reason is an error.
    pub async fn wait_for_download(&mut self, ctx: &Context, pct: i32) -> Result<i32> {
        loop {
            let signal: LxdContainerDownloadingSignal = wait_for_signal(
                ctx,
                &mut self.subscription,
                Some(signals::LXD_CONTAINER_DOWNLOADING),
            )
            .await
            .with_context(|| format!("{}: wait for download", self.key))?;

            if signal.key != self.key {
                continue;
            }
            if signal.status != DownloadingStatus::Downloading {
                return Err(Error::failed(
                    "download container image",
                    signal.status,
                    signal.failure_reason,
                ))
                .with_context(|| format!("{}: wait for download", self.key));
            }

            tracing::debug!(container = %self.key, progress = signal.download_progress, "download progress");
            if pct < 0 || signal.download_progress == pct {
                return Ok(signal.download_progress);
            }
        }
    }

    /// Wait until creation finishes.
    pub async fn wait_for_creation(&mut self, ctx: &Context) -> Result<()> {
        loop {
            let signal: LxdContainerCreatedSignal = wait_for_signal(
                ctx,
                &mut self.subscription,
                Some(signals::LXD_CONTAINER_CREATED),
            )
            .await
            .with_context(|| format!("{}: wait for creation", self.key))?;

            if signal.key == self.key {
                return created_outcome(signal)
                    .with_context(|| format!("{}: wait for creation", self.key));
            }
        }
    }

    /// Stop watching.
    pub async fn close(self) -> Result<()> {
        self.subscription.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{session, vm};
    use super::super::ImageSource;
    use super::*;
    use crate::bus::MemoryBus;
    use std::time::Duration;
    use vmorch_protocol::{
        methods, services, CreateLxdContainerRequest, CreateLxdContainerResponse, CreateStatus,
        CreatedStatus,
    };

    fn downloading(vm: &str, status: DownloadingStatus, pct: i32) -> LxdContainerDownloadingSignal {
        LxdContainerDownloadingSignal {
            key: CorrelationKey::new(vm, "c1", "owner1"),
            status,
            download_progress: pct,
            failure_reason: "network unreachable".into(),
        }
    }

    fn created() -> LxdContainerCreatedSignal {
        LxdContainerCreatedSignal {
            key: CorrelationKey::new("vm1", "c1", "owner1"),
            status: CreatedStatus::Created,
            failure_reason: String::new(),
        }
    }

    fn ctx() -> Context {
        Context::with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_exact_percentage_skips_others() {
        let (bus, session) = session();
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");
        let mut watcher = CreationWatcher::new(&container).await.unwrap();

        bus.emit(downloading("vm1", DownloadingStatus::Downloading, 10));
        bus.emit(downloading("vm2", DownloadingStatus::Downloading, 50));
        bus.emit(downloading("vm1", DownloadingStatus::Downloading, 40));
        bus.emit(downloading("vm1", DownloadingStatus::Downloading, 50));

        assert_eq!(watcher.wait_for_download(&ctx(), 50).await.unwrap(), 50);
        watcher.close().await.unwrap();
        assert_eq!(bus.active_matches(), 0);
    }

    #[tokio::test]
    async fn test_exact_percentage_never_reached_times_out() {
        let (bus, session) = session();
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");
        let mut watcher = CreationWatcher::new(&container).await.unwrap();

        bus.emit(downloading("vm1", DownloadingStatus::Downloading, 49));
        bus.emit(downloading("vm1", DownloadingStatus::Downloading, 51));

        let err = watcher
            .wait_for_download(&Context::with_timeout(Duration::from_millis(50)), 50)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_any_percentage() {
        let (bus, session) = session();
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");
        let mut watcher = CreationWatcher::new(&container).await.unwrap();

        bus.emit(downloading("vm1", DownloadingStatus::Downloading, 3));
        assert_eq!(watcher.wait_for_download(&ctx(), -1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_download_failure() {
        let (bus, session) = session();
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");
        let mut watcher = CreationWatcher::new(&container).await.unwrap();

        bus.emit(downloading("vm1", DownloadingStatus::DownloadTimedOut, 0));
        let err = watcher.wait_for_download(&ctx(), -1).await.unwrap_err();
        assert!(matches!(err.root(), Error::Failed { .. }));
        assert!(err.to_string().contains("network unreachable"));
    }

    #[tokio::test]
    async fn test_watch_alongside_create() {
        let (bus, session) = session();
        bus.handle(
            services::CONTAINERS,
            methods::CREATE_LXD_CONTAINER,
            |_req: CreateLxdContainerRequest, bus: &MemoryBus| {
                bus.emit(downloading("vm1", DownloadingStatus::Downloading, 100));
                bus.emit(created());
                CreateLxdContainerResponse {
                    status: CreateStatus::Creating,
                    failure_reason: String::new(),
                }
            },
        );
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");
        let mut watcher = CreationWatcher::new(&container).await.unwrap();

        container
            .create(&ctx(), &ImageSource::from_config(session.config()))
            .await
            .unwrap();

        // The created notification arrived before the download one was consumed.
        assert_eq!(watcher.wait_for_download(&ctx(), 100).await.unwrap(), 100);
        watcher.wait_for_creation(&ctx()).await.unwrap();
        watcher.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.active_matches(), 0);
    }

    #[tokio::test]
    async fn test_dropped_watcher_releases_match_rules() {
        let (bus, session) = session();
        let container = Container::new(&vm(&session, "vm1"), "c1", "testuser");
        let watcher = CreationWatcher::new(&container).await.unwrap();
        assert_eq!(bus.active_matches(), 2);

        drop(watcher);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.active_matches(), 0);
        assert_eq!(session.dispatcher().waiter_count(), 0);
    }
}
