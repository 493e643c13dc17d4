//! Datafile fetching and a background poller thread that keeps a [`ConfigurationStore`] current.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};
use reqwest::{StatusCode, Url};

use crate::{
    config_source::{ConfigSource, ConfigUpdates, ConfigurationStore},
    project_config::ProjectConfig,
    Error, Result,
};

/// Where and how to fetch an application's datafile.
#[derive(Debug, Clone)]
pub struct ConfigurationFetcherConfig {
    pub base_url: String,
    /// Path appended to `base_url`; `{sdk_key}` is substituted with `sdk_key`.
    pub datafile_path: String,
    pub sdk_key: String,
    pub request_timeout: Duration,
}

impl ConfigurationFetcherConfig {
    fn datafile_url(&self) -> Result<Url> {
        let path = self.datafile_path.replace("{sdk_key}", &self.sdk_key);
        Url::parse(&format!("{}{}", self.base_url, path)).map_err(Error::InvalidBaseUrl)
    }
}

/// A client that fetches the datafile from the configuration origin.
pub struct ConfigurationFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    /// If we receive a 401/403 during a request, the SDK key is not valid. We cache this so we
    /// don't issue additional requests to the server.
    unauthorized: bool,
}

impl ConfigurationFetcher {
    /// Create a fetcher. Must not be called from within an async context, as the blocking client
    /// owns its own runtime.
    pub fn new(config: &ConfigurationFetcherConfig) -> Result<ConfigurationFetcher> {
        let url = config.datafile_url()?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(ConfigurationFetcher {
            client,
            url,
            unauthorized: false,
        })
    }

    pub fn fetch_configuration(&mut self) -> Result<ProjectConfig> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "decision_agent", "fetching datafile");
        let response = self.client.get(self.url.clone()).send()?;

        let response = response.error_for_status().map_err(|err| {
            if matches!(
                err.status(),
                Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            ) {
                log::warn!(target: "decision_agent", "datafile request is not authorized. Check your SDK key");
                self.unauthorized = true;
                Error::Unauthorized
            } else {
                log::warn!(target: "decision_agent", "received non-200 response while fetching datafile: {:?}", err);
                Error::from(err)
            }
        })?;

        let bytes = response.bytes()?;
        let config = ProjectConfig::from_datafile(&bytes)?;

        log::debug!(target: "decision_agent", revision = config.revision(); "successfully fetched datafile");

        Ok(config)
    }
}

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between requests for configuration.
    pub interval: Duration,
    /// Randomized duration subtracted from `interval`, so that multiple agents do not synchronize
    /// their requests.
    pub jitter: Duration,
}

impl PollerThreadConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// A configuration poller thread.
///
/// Polls the configuration origin periodically and stores new snapshots in a
/// [`ConfigurationStore`]. The outcome of the first fetch is kept so that callers can find out
/// whether the origin is reachable at all; later failures are logged and retried on the next tick.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` until the first fetch attempt completes, then its outcome.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    pub fn start(
        fetcher_config: ConfigurationFetcherConfig,
        store: Arc<ConfigurationStore>,
        config: PollerThreadConfig,
    ) -> Result<PollerThread> {
        // Fail early on a malformed URL instead of inside the thread.
        fetcher_config.datafile_url()?;

        // Buffer of 1 is enough: stop is sent with `try_send()` and a full buffer means another
        // caller already asked the thread to stop.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            let result = Arc::clone(&result);
            let update_result = move |value: Result<()>| {
                let mut slot = result.0.lock().unwrap_or_else(|e| e.into_inner());
                if slot.is_none() || value.is_ok() {
                    *slot = Some(value);
                }
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("decision-agent-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let mut fetcher = match ConfigurationFetcher::new(&fetcher_config) {
                            Ok(fetcher) => fetcher,
                            Err(err) => {
                                update_result(Err(err));
                                return;
                            }
                        };

                        loop {
                            match fetcher.fetch_configuration() {
                                Ok(configuration) => {
                                    let unchanged = store.get_configuration().is_some_and(|current| {
                                        current.revision() == configuration.revision()
                                    });
                                    if unchanged {
                                        log::trace!(target: "decision_agent", "datafile revision unchanged");
                                    } else {
                                        store.set_configuration(Arc::new(configuration));
                                    }
                                    update_result(Ok(()));
                                }
                                Err(err @ Error::Unauthorized) => {
                                    // Unrecoverable.
                                    update_result(Err(err));
                                    return;
                                }
                                Err(err) => {
                                    log::warn!(target: "decision_agent", "error while fetching datafile: {:?}", err);
                                    update_result(Err(err));
                                }
                            };

                            let timeout = jitter(config.interval, config.jitter);
                            match stop_receiver.recv_timeout(timeout) {
                                Err(RecvTimeoutError::Timeout) => {
                                    // Loop back to fetch a new datafile.
                                }
                                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                                    log::debug!(target: "decision_agent", "poller thread stopping");
                                    return;
                                }
                            }
                        }
                    }));

                    if result.is_err() {
                        update_result(Err(Error::PollerThreadPanicked));
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Block until the first fetch attempt completes and return its outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`]
    /// - [`Error::Unauthorized`]
    /// - network or datafile errors from the first attempt
    pub fn wait_for_configuration(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::PollerThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread. Does not wait for the thread to exit.
    pub fn stop(&self) {
        // An error means the thread already exited or a stop command is already queued.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

/// A [`ConfigSource`] backed by a poller thread fetching the application's datafile.
pub struct PolledConfigSource {
    store: Arc<ConfigurationStore>,
    poller: PollerThread,
}

impl PolledConfigSource {
    pub fn start(
        fetcher_config: ConfigurationFetcherConfig,
        poller_config: PollerThreadConfig,
    ) -> Result<PolledConfigSource> {
        let store = Arc::new(ConfigurationStore::new());
        let poller = PollerThread::start(fetcher_config, store.clone(), poller_config)?;
        Ok(PolledConfigSource { store, poller })
    }

    /// Block until the first datafile fetch completes.
    pub fn wait_for_configuration(&self) -> Result<()> {
        self.poller.wait_for_configuration()
    }
}

impl ConfigSource for PolledConfigSource {
    fn get_config(&self) -> Result<Arc<ProjectConfig>> {
        self.store.get_config()
    }

    fn subscribe(&self) -> Result<ConfigUpdates> {
        Ok(self.store.watch())
    }

    fn close(&self) {
        self.poller.stop();
    }
}

impl Drop for PolledConfigSource {
    fn drop(&mut self) {
        self.poller.stop();
    }
}
