//! The top-level [`MessageCenter`]: listener loop, service-center registry,
//! process-wide send APIs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rsa::RsaPrivateKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use hermod_wire::Message;
use hermod_wire::command::{CMD_BYE, Command};

use crate::auth::{self, Authenticator};
use crate::center::{CenterError, ServiceCenter};
use crate::config::ServiceConfigReader;
use crate::handlers::{ErrorHandler, ForwardRequest};
use crate::valid_identifier;

/// Owns the accept loop and the per-service centers.
///
/// Lifecycle is explicit: [`MessageCenter::new`] constructs,
/// [`MessageCenter::start`] spawns the accept loop and returns a
/// [`CenterHandle`], [`CenterHandle::stop`] signals shutdown and
/// [`CenterHandle::join`] waits for the loop to exit.
pub struct MessageCenter {
    privkey:       RsaPrivateKey,
    authenticator: Arc<dyn Authenticator>,
    auth_timeout:  Duration,
    config_reader: Arc<dyn ServiceConfigReader>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    fwd_tx:        mpsc::Sender<ForwardRequest>,
    centers:       StdMutex<HashMap<String, Arc<ServiceCenter>>>,
}

impl MessageCenter {
    /// Construct a center around the server's RSA identity and its external
    /// collaborators.
    pub fn new(
        privkey:       RsaPrivateKey,
        authenticator: Arc<dyn Authenticator>,
        config_reader: Arc<dyn ServiceConfigReader>,
        error_handler: Option<Arc<dyn ErrorHandler>>,
        fwd_tx:        mpsc::Sender<ForwardRequest>,
        auth_timeout:  Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            privkey,
            authenticator,
            auth_timeout,
            config_reader,
            error_handler,
            fwd_tx,
            centers: StdMutex::new(HashMap::new()),
        })
    }

    fn report_error(&self, service: &str, username: &str, conn_id: &str, err: &dyn std::error::Error) {
        if let Some(handler) = &self.error_handler {
            handler.on_error(service, username, conn_id, err);
        }
    }

    /// Spawn the accept loop on `listener`.
    pub fn start(self: &Arc<Self>, listener: TcpListener) -> CenterHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let center = self.clone();

        let task = tokio::spawn(async move {
            tracing::info!(addr = ?listener.local_addr().ok(), "message center listening");
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let center = center.clone();
                            tokio::spawn(async move { center.serve_conn(stream).await });
                        }
                        Err(e) => {
                            center.report_error("", "", "", &e);
                        }
                    },
                }
            }
        });

        CenterHandle { center: self.clone(), stop: stop_tx, task }
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let authed = match auth::auth_conn(
            stream,
            &self.privkey,
            self.authenticator.as_ref(),
            self.auth_timeout,
        )
        .await
        {
            Ok(authed) => authed,
            Err(e) => {
                self.report_error("", "", &peer, &e);
                return;
            }
        };

        let service = authed.service.clone();
        let username = authed.username.clone();

        // Lookup (or lazy creation) happens under the registry lock; the
        // lock is released before any connection work.
        let center = {
            let mut centers = self.centers.lock().expect("center registry lock");
            match centers.get(&service) {
                Some(center) => Some(center.clone()),
                None => self.config_reader.read_config(&service).map(|config| {
                    let center = ServiceCenter::new(&service, config, self.fwd_tx.clone());
                    centers.insert(service.clone(), center.clone());
                    center
                }),
            }
        };

        let Some(center) = center else {
            let _ = authed
                .cmdio
                .write_command(&Command::new(CMD_BYE), false, true)
                .await;
            authed.cmdio.shutdown().await;
            self.report_error(
                &service,
                &username,
                &peer,
                &CenterError::NoConfig { service: service.clone() },
            );
            return;
        };

        if let Err(e) = center.new_conn(authed).await {
            self.report_error(&service, &username, &peer, &e);
        }
    }

    fn lookup(&self, service: &str) -> Option<Arc<ServiceCenter>> {
        self.centers.lock().expect("center registry lock").get(service).cloned()
    }

    /// Process-wide mail send. An unloaded service delivers to nobody and
    /// is not an error.
    pub async fn send_mail(
        &self,
        service:  &str,
        username: &str,
        msg:      &Message,
        extra:    Option<&BTreeMap<String, String>>,
        ttl:      Duration,
    ) -> (usize, Vec<CenterError>) {
        if !valid_identifier(username) {
            return (0, vec![CenterError::BadIdentifier(username.into())]);
        }
        match self.lookup(service) {
            Some(center) => center.send_mail(username, msg, extra, ttl).await,
            None => (0, Vec::new()),
        }
    }

    /// Process-wide poster send; see [`MessageCenter::send_mail`].
    pub async fn send_poster(
        &self,
        service:  &str,
        username: &str,
        msg:      &Message,
        extra:    Option<&BTreeMap<String, String>>,
        key:      &str,
        ttl:      Duration,
    ) -> (usize, Vec<CenterError>) {
        if !valid_identifier(username) {
            return (0, vec![CenterError::BadIdentifier(username.into())]);
        }
        match self.lookup(service) {
            Some(center) => center.send_poster(username, msg, extra, key, ttl).await,
            None => (0, Vec::new()),
        }
    }

    /// The service center currently loaded for `service`, if any.
    pub fn service_center(&self, service: &str) -> Option<Arc<ServiceCenter>> {
        self.lookup(service)
    }

    /// Close every service center and its connections.
    pub async fn shutdown(&self) {
        let centers: Vec<_> = {
            let mut map = self.centers.lock().expect("center registry lock");
            map.drain().map(|(_, c)| c).collect()
        };
        for center in centers {
            center.shutdown().await;
        }
    }
}

/// Control handle returned by [`MessageCenter::start`].
pub struct CenterHandle {
    center: Arc<MessageCenter>,
    stop:   watch::Sender<bool>,
    task:   JoinHandle<()>,
}

impl CenterHandle {
    /// Signal the accept loop to exit. Existing connections are closed via
    /// [`MessageCenter::shutdown`].
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Stop accepting, close everything, and wait for the loop to finish.
    pub async fn join(self) {
        self.stop();
        self.center.shutdown().await;
        let _ = self.task.await;
    }
}
