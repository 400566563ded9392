//! mDNS discovery of audio stations.
//!
//! Browses for the station service type and forwards resolved and removed
//! services to the supervisor as [`DiscoveryEvent`]s. Re-resolving a known
//! service is reported as another announcement.

use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;

/// How often the browse thread checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A station was resolved, or resolved again with new details.
    Announced { name: String, host: String, port: u16 },
    /// A previously announced station went away.
    Withdrawn { name: String, host: String },
}

/// Running mDNS browse. Dropping it leaves the daemon running; call
/// [`Discovery::shutdown`].
pub struct Discovery {
    daemon: ServiceDaemon,
    service_type: String,
    browser: JoinHandle<()>,
}

impl Discovery {
    pub fn start(
        service_type: &str,
        events: mpsc::Sender<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        let receiver = daemon
            .browse(service_type)
            .map_err(|e| DiscoveryError::Browse {
                service_type: service_type.to_string(),
                message: e.to_string(),
            })?;
        info!(service_type, "browsing for stations");

        let browser = tokio::task::spawn_blocking(move || {
            let mut tracker = ServiceTracker::default();
            while !shutdown.is_cancelled() {
                let event = match receiver.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => event,
                    Err(_) if receiver.is_disconnected() => break,
                    Err(_) => continue,
                };
                let Some(event) = tracker.translate(event) else {
                    continue;
                };
                if events.blocking_send(event).is_err() {
                    break;
                }
            }
            debug!("browse loop finished");
        });

        Ok(Self {
            daemon,
            service_type: service_type.to_string(),
            browser,
        })
    }

    /// Stop browsing and wait for the browse thread. The shutdown token
    /// passed to [`Discovery::start`] should already be cancelled.
    pub async fn shutdown(self) {
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            debug!(error = %e, "stop_browse failed");
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "mDNS daemon shutdown failed");
        }
        if let Err(e) = self.browser.await {
            warn!(error = %e, "browse thread panicked");
        }
    }
}

/// Remembers which host each service resolved to, so removals (which only
/// carry the service name) can be mapped back to a station.
#[derive(Debug, Default)]
struct ServiceTracker {
    hosts: HashMap<String, String>,
}

impl ServiceTracker {
    fn translate(&mut self, event: ServiceEvent) -> Option<DiscoveryEvent> {
        match event {
            ServiceEvent::ServiceResolved(info) => Some(self.resolved(
                info.get_fullname(),
                info.get_hostname(),
                info.get_port(),
            )),
            ServiceEvent::ServiceRemoved(_, fullname) => self.removed(&fullname),
            other => {
                debug!(event = ?other, "ignoring mDNS event");
                None
            }
        }
    }

    fn resolved(&mut self, fullname: &str, host: &str, port: u16) -> DiscoveryEvent {
        info!(name = fullname, host, port, "station resolved");
        self.hosts.insert(fullname.to_string(), host.to_string());
        DiscoveryEvent::Announced {
            name: fullname.to_string(),
            host: host.to_string(),
            port,
        }
    }

    fn removed(&mut self, fullname: &str) -> Option<DiscoveryEvent> {
        match self.hosts.remove(fullname) {
            Some(host) => {
                info!(name = fullname, %host, "station removed");
                Some(DiscoveryEvent::Withdrawn {
                    name: fullname.to_string(),
                    host,
                })
            }
            None => {
                warn!(name = fullname, "removal of a station that never resolved");
                None
            }
        }
    }
}
