//! Event loop of the updater.
//!
//! Kubernetes updates mounted ConfigMaps by swapping a `..data` symlink, so
//! which path an event names says little about what changed. Every event
//! therefore triggers a rescan that compares the files with what was last
//! processed.
use std::collections::HashMap;
use std::future::Future;
use std::io;

use log::{debug, error, info, trace, warn};
use notify::{RecursiveMode, Watcher};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::error::SvnOperatorError;
use crate::svnconfig::{AUTHZ_SVN_ACCESS_FILE, AUTH_USER_FILE, REPOS_MANIFEST};
use crate::updater::Updater;

/// Handlers run by one or more dispatches.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Dispatched {
    pub reloads: usize,
    pub provisions: usize,
    pub failures: usize,
}

impl Dispatched {
    fn add(&mut self, other: Dispatched) {
        self.reloads += other.reloads;
        self.provisions += other.provisions;
        self.failures += other.failures;
    }
}

/// Runs the handlers for configuration files whose content changed.
pub struct Dispatcher {
    updater: Updater,
    /// Content of each file when its handler last succeeded; `None` for a
    /// file that was missing.
    processed: HashMap<&'static str, Option<String>>,
}

impl Dispatcher {
    pub fn new(updater: Updater) -> Self {
        Dispatcher {
            updater,
            processed: HashMap::new(),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<String>, io::Error> {
        match tokio::fs::read_to_string(self.updater.config_file(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Returns the current content of `key` if it differs from the processed one.
    async fn changed(&self, key: &'static str) -> Option<Option<String>> {
        match self.read(key).await {
            Ok(current) if self.processed.get(key) != Some(&current) => Some(current),
            Ok(_) => None,
            Err(error) => {
                warn!("Unable to read [{}], skipping it: {}", key, error);
                None
            }
        }
    }

    /// Compares all files with what was processed last and runs the handlers
    /// of those that changed. Nothing has been processed initially, so the
    /// first call runs every handler.
    ///
    /// The content of a file is only remembered if its handler succeeded, so
    /// a failed handler is retried on the next call.
    pub async fn dispatch(&mut self) -> Dispatched {
        let mut dispatched = Dispatched::default();

        let auth_user_file = self.changed(AUTH_USER_FILE).await;
        let authz_svn_access_file = self.changed(AUTHZ_SVN_ACCESS_FILE).await;
        // Both files are picked up by the same reload
        let reload = match (&auth_user_file, &authz_svn_access_file) {
            (Some(_), _) => Some(self.updater.on_auth_user_file_changed().await),
            (None, Some(_)) => Some(self.updater.on_authz_svn_access_file_changed().await),
            (None, None) => None,
        };
        if let Some(result) = reload {
            dispatched.reloads += 1;
            match result {
                Ok(()) => {
                    for (key, content) in vec![
                        (AUTH_USER_FILE, auth_user_file),
                        (AUTHZ_SVN_ACCESS_FILE, authz_svn_access_file),
                    ] {
                        if let Some(content) = content {
                            self.processed.insert(key, content);
                        }
                    }
                }
                Err(error) => {
                    dispatched.failures += 1;
                    error!("Reloading the server failed, will retry on the next change: {}", error);
                }
            }
        }

        if let Some(manifest) = self.changed(REPOS_MANIFEST).await {
            dispatched.provisions += 1;
            match self.updater.on_repos_config_changed().await {
                Ok(()) => {
                    self.processed.insert(REPOS_MANIFEST, manifest);
                }
                Err(error) => {
                    dispatched.failures += 1;
                    error!(
                        "Provisioning repositories failed, will retry on the next change: {}",
                        error
                    );
                }
            }
        }

        dispatched
    }
}

/// Processes events until `shutdown` completes or the event source closes.
///
/// One full pass runs before the first event, as the configuration may
/// already be in place. Events are handled one at a time; events queued up
/// while a dispatch runs are coalesced into a single rescan. Shutdown also
/// interrupts a running dispatch, killing the command it waits for.
pub async fn event_loop<F>(
    mut dispatcher: Dispatcher,
    mut events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    shutdown: F,
) -> Dispatched
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut total = Dispatched::default();

    tokio::select! {
        biased;
        _ = &mut shutdown => return total,
        dispatched = dispatcher.dispatch() => total.add(dispatched),
    }

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(Ok(event)) => {
                    trace!("Filesystem event: {:?}", event);
                    while let Ok(queued) = events.try_recv() {
                        trace!("Coalescing filesystem event: {:?}", queued);
                    }
                    debug!("Configuration directory changed, rescanning");
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => {
                            info!("Interrupted a running rescan");
                            break;
                        }
                        dispatched = dispatcher.dispatch() => total.add(dispatched),
                    }
                }
                Some(Err(error)) => warn!("Error while watching the configuration: {}", error),
                None => {
                    warn!("Filesystem watch ended");
                    break;
                }
            },
        }
    }
    total
}

/// Watches the configuration directory of `updater` until SIGINT or SIGTERM
/// is received.
pub async fn run(updater: Updater) -> Result<(), SvnOperatorError> {
    let config_dir = updater.config_dir().to_path_buf();
    let (sender, receiver) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event| {
        // Only fails once the loop has stopped
        let _ = sender.send(event);
    })
    .map_err(|source| SvnOperatorError::WatchError {
        path: config_dir.clone(),
        source,
    })?;
    watcher
        .watch(&config_dir, RecursiveMode::NonRecursive)
        .map_err(|source| SvnOperatorError::WatchError {
            path: config_dir.clone(),
            source,
        })?;
    info!("Watching [{}] for configuration changes", config_dir.display());

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT, shutting down"),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        }
    };

    let total = event_loop(Dispatcher::new(updater), receiver, shutdown).await;
    info!(
        "Stopped after {} reloads and {} provisioning runs, {} of them failed",
        total.reloads, total.provisions, total.failures
    );
    Ok(())
}
