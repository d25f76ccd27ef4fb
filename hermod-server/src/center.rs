//! Per-service multiplexer: the live-user table, fan-out, digest/cache
//! decisions, and the server-side control-command processor.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;

use hermod_proto::cmdio::{CmdIoError, CommandIo};
use hermod_proto::conn::{
    CommandProcessor, ConnSettings, MsgConnection, ProcessError, ProcessFuture,
};
use hermod_wire::Message;
use hermod_wire::command::{self, Command};

use crate::auth::AuthedConn;
use crate::cache::{CacheError, MessageCache};
use crate::config::ServiceConfig;
use crate::handlers::ForwardRequest;
use crate::valid_identifier;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Per-call errors from the send APIs and connection registration.
#[derive(Debug)]
pub enum CenterError {
    /// Service or username contains ':' or a newline, or is empty.
    BadIdentifier(String),
    /// The config reader knows nothing about the requested service.
    NoConfig {
        /// The service that could not be resolved.
        service: String,
    },
    /// The per-user connection cap is already reached.
    TooManyConns {
        /// The user whose cap was hit.
        username: String,
    },
    /// The backing cache failed.
    Cache(CacheError),
    /// A write to one live connection failed (partial delivery).
    Conn {
        /// Connection the write failed on.
        conn_id: String,
        /// The underlying failure.
        source: CmdIoError,
    },
}

impl fmt::Display for CenterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadIdentifier(s)        => write!(f, "bad identifier: {s:?}"),
            Self::NoConfig { service }    => write!(f, "no config for service {service:?}"),
            Self::TooManyConns { username } => {
                write!(f, "too many connections for user {username:?}")
            }
            Self::Cache(e)                => write!(f, "{e}"),
            Self::Conn { conn_id, source } => write!(f, "write to conn {conn_id}: {source}"),
        }
    }
}

impl std::error::Error for CenterError {}

impl From<CacheError> for CenterError {
    fn from(e: CacheError) -> Self { Self::Cache(e) }
}

enum CacheKind<'a> {
    Mail,
    Poster(&'a str),
}

// ─── Server-side processor ───────────────────────────────────────────────────

/// Handles control commands arriving from one client connection. Holds the
/// pieces it needs directly (command I/O, cache, forward channel, shared
/// settings/visibility) rather than a back-reference to the connection, so
/// there is no ownership cycle.
struct ServerProcessor {
    service:  String,
    username: String,
    cmdio:    Arc<CommandIo>,
    cache:    Arc<dyn MessageCache>,
    fwd_tx:   mpsc::Sender<ForwardRequest>,
    settings: Arc<StdMutex<ConnSettings>>,
    visible:  Arc<AtomicBool>,
}

impl ServerProcessor {
    fn settings(&self) -> ConnSettings {
        self.settings.lock().expect("settings lock").clone()
    }

    async fn handle_forward_request(&self, cmd: Command) -> Result<(), ProcessError> {
        let receiver = cmd
            .params
            .first()
            .ok_or_else(|| ProcessError::BadPeer("FWD_REQ without receiver".into()))?;
        if !valid_identifier(receiver) {
            return Err(ProcessError::BadPeer(format!("bad receiver {receiver:?}")));
        }
        let receiver_service = match cmd.params.get(1) {
            Some(s) if !s.is_empty() => {
                if !valid_identifier(s) {
                    return Err(ProcessError::BadPeer(format!("bad receiver service {s:?}")));
                }
                s.clone()
            }
            _ => self.service.clone(),
        };

        let request = ForwardRequest {
            sender:           self.username.clone(),
            sender_service:   self.service.clone(),
            receiver:         receiver.clone(),
            receiver_service,
            message:          cmd.message.unwrap_or_default(),
        };
        // A full channel blocks here; that is the backpressure contract.
        self.fwd_tx
            .send(request)
            .await
            .map_err(|_| ProcessError::Internal("forward channel closed".into()))
    }

    async fn handle_retrieve(&self, cmd: Command) -> Result<(), ProcessError> {
        let id = cmd
            .params
            .first()
            .ok_or_else(|| ProcessError::BadPeer("MSG_RETRIEVE without id".into()))?;

        let cached = self
            .cache
            .get_or_del(&self.service, &self.username, id)
            .map_err(|e| ProcessError::Internal(e.to_string()))?;

        // A miss is answered in-band with an empty message and a marker
        // header; the client never sees a protocol-level error.
        let msg = match cached {
            Some(mut msg) => {
                msg.id = Some(id.clone());
                msg
            }
            None => {
                let mut miss = Message::default();
                miss.header.insert("status".into(), "miss".into());
                miss.header.insert("id".into(), id.clone());
                miss
            }
        };

        let settings = self.settings();
        let compress = settings.should_compress(msg.size());
        self.cmdio
            .write_command(&Command::data(msg), compress, settings.encrypt)
            .await
            .map_err(ProcessError::Fatal)
    }

    fn set_visibility(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
        tracing::debug!(
            service = %self.service,
            username = %self.username,
            visible,
            "visibility changed"
        );
    }
}

impl CommandProcessor for ServerProcessor {
    fn process_command(&self, cmd: Command) -> ProcessFuture<'_> {
        Box::pin(async move {
            match cmd.opcode {
                command::CMD_FWD_REQ => self.handle_forward_request(cmd).await?,
                command::CMD_MSG_RETRIEVE => self.handle_retrieve(cmd).await?,
                command::CMD_SET_VISIBILITY => match cmd.params.first().map(String::as_str) {
                    Some("1") => self.set_visibility(true),
                    Some("0") => self.set_visibility(false),
                    _ => return Err(ProcessError::BadPeer("SET_VISIBILITY needs \"0\"/\"1\"".into())),
                },
                command::CMD_INVIS => self.set_visibility(false),
                command::CMD_VIS => self.set_visibility(true),
                command::CMD_SETTING => match ConnSettings::from_params(&cmd.params) {
                    Some(new) => *self.settings.lock().expect("settings lock") = new,
                    None => return Err(ProcessError::BadPeer("malformed SETTING".into())),
                },
                command::CMD_DIGEST_MODE => {}
                op if command::known_opcode(op) => {
                    // Recognized but not ours to handle; ignored for forward
                    // compatibility.
                }
                op => return Err(ProcessError::BadPeer(format!("unknown opcode {op}"))),
            }
            Ok(None)
        })
    }
}

// ─── ServiceCenter ───────────────────────────────────────────────────────────

/// The per-service registry of live connections plus fan-out logic.
pub struct ServiceCenter {
    service: String,
    config:  ServiceConfig,
    users:   StdMutex<HashMap<String, Vec<Arc<MsgConnection>>>>,
    fwd_tx:  mpsc::Sender<ForwardRequest>,
}

impl ServiceCenter {
    /// Build a center for `service`.
    pub fn new(
        service: impl Into<String>,
        config:  ServiceConfig,
        fwd_tx:  mpsc::Sender<ForwardRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service: service.into(),
            config,
            users: StdMutex::new(HashMap::new()),
            fwd_tx,
        })
    }

    /// The service this center multiplexes.
    pub fn service(&self) -> &str { &self.service }

    /// Number of live connections for `username`.
    pub fn user_conn_count(&self, username: &str) -> usize {
        self.users
            .lock()
            .expect("user table lock")
            .get(username)
            .map_or(0, Vec::len)
    }

    fn report_error(&self, username: &str, conn_id: &str, err: &dyn std::error::Error) {
        if let Some(handler) = &self.config.error_handler {
            handler.on_error(&self.service, username, conn_id, err);
        }
    }

    /// Register a freshly authenticated connection: enforce the per-user
    /// cap, install the server-side processor, push initial settings, and
    /// start the inbound consumer.
    pub async fn new_conn(
        self:   &Arc<Self>,
        authed: AuthedConn,
    ) -> Result<Arc<MsgConnection>, CenterError> {
        let username = authed.username;
        let settings = Arc::new(StdMutex::new(ConnSettings {
            digest_threshold:   self.config.digest_threshold,
            compress_threshold: self.config.compress_threshold,
            encrypt:            self.config.encrypt,
            digest_fields:      self.config.digest_fields.clone(),
        }));
        let visible = Arc::new(AtomicBool::new(true));

        let processor = Arc::new(ServerProcessor {
            service:  self.service.clone(),
            username: username.clone(),
            cmdio:    authed.cmdio.clone(),
            cache:    self.config.cache.clone(),
            fwd_tx:   self.fwd_tx.clone(),
            settings: settings.clone(),
            visible:  visible.clone(),
        });

        // Cap check and insert happen under one lock so racing accepts
        // cannot both slip under the limit.
        let admitted = {
            let mut users = self.users.lock().expect("user table lock");
            let entry = users.entry(username.clone()).or_default();
            if self.config.max_conns_per_user > 0
                && entry.len() >= self.config.max_conns_per_user
            {
                None
            } else {
                let conn = MsgConnection::new(
                    authed.cmdio.clone(),
                    &self.service,
                    &username,
                    processor,
                    settings.clone(),
                    visible,
                );
                entry.push(conn.clone());
                Some(conn)
            }
        };
        let Some(conn) = admitted else {
            let _ = authed
                .cmdio
                .write_command(&Command::new(command::CMD_BYE), false, true)
                .await;
            authed.cmdio.shutdown().await;
            return Err(CenterError::TooManyConns { username });
        };

        // Tell the client which thresholds the service runs with.
        let initial = settings.lock().expect("settings lock").to_params();
        if let Err(e) = conn
            .write_command(&Command::with_params(command::CMD_SETTING, initial), false, true)
            .await
        {
            self.remove_conn(&conn);
            return Err(CenterError::Conn { conn_id: conn.uniq_id().into(), source: e });
        }

        tracing::info!(
            service = %self.service,
            username = %conn.username(),
            conn_id = %conn.uniq_id(),
            "connection registered"
        );

        tokio::spawn(consume(self.clone(), conn.clone()));
        Ok(conn)
    }

    fn remove_conn(&self, conn: &MsgConnection) {
        let mut users = self.users.lock().expect("user table lock");
        if let Some(conns) = users.get_mut(conn.username()) {
            conns.retain(|c| c.uniq_id() != conn.uniq_id());
            if conns.is_empty() {
                users.remove(conn.username());
            }
        }
    }

    fn snapshot(&self, username: &str) -> Vec<Arc<MsgConnection>> {
        self.users
            .lock()
            .expect("user table lock")
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver `msg` to `username` as mail: directly to visible live
    /// connections, or through the cache + digest path when the message is
    /// large or nobody can receive it.
    ///
    /// Returns how many frames were delivered and any per-connection
    /// failures; one bad connection does not abort the rest.
    pub async fn send_mail(
        &self,
        username: &str,
        msg:      &Message,
        extra:    Option<&BTreeMap<String, String>>,
        ttl:      Duration,
    ) -> (usize, Vec<CenterError>) {
        self.send(username, msg, extra, ttl, CacheKind::Mail).await
    }

    /// Like [`ServiceCenter::send_mail`], but the cache entry is a keyed
    /// poster; direct delivery is still permitted.
    pub async fn send_poster(
        &self,
        username: &str,
        msg:      &Message,
        extra:    Option<&BTreeMap<String, String>>,
        key:      &str,
        ttl:      Duration,
    ) -> (usize, Vec<CenterError>) {
        self.send(username, msg, extra, ttl, CacheKind::Poster(key)).await
    }

    async fn send(
        &self,
        username: &str,
        msg:      &Message,
        extra:    Option<&BTreeMap<String, String>>,
        ttl:      Duration,
        kind:     CacheKind<'_>,
    ) -> (usize, Vec<CenterError>) {
        if !valid_identifier(username) {
            return (0, vec![CenterError::BadIdentifier(username.into())]);
        }

        let size = msg.size();
        let conns = self.snapshot(username);
        let visible: Vec<_> = conns.iter().filter(|c| c.is_visible()).cloned().collect();

        let oversize = self.config.digest_threshold > 0 && size >= self.config.digest_threshold;
        if !oversize && !visible.is_empty() {
            return self.send_direct(&visible, msg, size).await;
        }
        self.send_digest(username, &conns, msg, size, extra, ttl, kind).await
    }

    async fn send_direct(
        &self,
        conns: &[Arc<MsgConnection>],
        msg:   &Message,
        size:  usize,
    ) -> (usize, Vec<CenterError>) {
        let mut delivered = 0;
        let mut errors = Vec::new();

        for conn in conns {
            let settings = conn.settings();
            let compress = settings.should_compress(size);
            let result = match &msg.sender {
                // Relayed messages go out as FWD so the client learns the
                // sender; locally originated ones are plain DATA.
                Some(sender) => {
                    let mut params = vec![sender.clone()];
                    let sender_service = msg
                        .sender_service
                        .clone()
                        .unwrap_or_else(|| self.service.clone());
                    match &msg.id {
                        Some(id) => {
                            params.push(sender_service);
                            params.push(id.clone());
                        }
                        None if sender_service != self.service => params.push(sender_service),
                        None => {}
                    }
                    let cmd = Command {
                        opcode:  command::CMD_FWD,
                        params,
                        message: Some(Message {
                            header: msg.header.clone(),
                            body:   msg.body.clone(),
                            ..Message::default()
                        }),
                        ack_id:  None,
                    };
                    conn.write_command(&cmd, compress, settings.encrypt).await
                }
                None => conn.write_message(msg, compress, settings.encrypt).await,
            };

            match result {
                Ok(()) => delivered += 1,
                Err(e) => errors.push(CenterError::Conn {
                    conn_id: conn.uniq_id().into(),
                    source:  e,
                }),
            }
        }
        (delivered, errors)
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_digest(
        &self,
        username: &str,
        conns:    &[Arc<MsgConnection>],
        msg:      &Message,
        size:     usize,
        extra:    Option<&BTreeMap<String, String>>,
        ttl:      Duration,
        kind:     CacheKind<'_>,
    ) -> (usize, Vec<CenterError>) {
        let stored = match kind {
            CacheKind::Mail => self.config.cache.set_mail(&self.service, username, msg, ttl),
            CacheKind::Poster(key) => {
                self.config.cache.set_poster(&self.service, username, key, msg, ttl)
            }
        };
        let id = match stored {
            Ok(id) => id,
            Err(e) => return (0, vec![CenterError::Cache(e)]),
        };

        let mut delivered = 0;
        let mut errors = Vec::new();

        // Digests go to every live connection, visible or not.
        for conn in conns {
            let settings = conn.settings();
            let mut info: BTreeMap<String, String> = msg
                .header
                .iter()
                .filter(|(k, _)| settings.digest_fields.iter().any(|f| f == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if let Some(extra) = extra {
                info.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
            }

            let cmd = Command {
                opcode:  command::CMD_DIGEST,
                params:  vec![size.to_string(), id.clone()],
                message: if info.is_empty() {
                    None
                } else {
                    Some(Message { header: info, ..Message::default() })
                },
                ack_id:  None,
            };

            match conn.write_command(&cmd, false, settings.encrypt).await {
                Ok(()) => delivered += 1,
                Err(e) => errors.push(CenterError::Conn {
                    conn_id: conn.uniq_id().into(),
                    source:  e,
                }),
            }
        }
        (delivered, errors)
    }

    /// Close every live connection and clear the table.
    pub async fn shutdown(&self) {
        let conns: Vec<_> = {
            let mut users = self.users.lock().expect("user table lock");
            users.drain().flat_map(|(_, conns)| conns).collect()
        };
        for conn in conns {
            conn.close().await;
        }
    }
}

/// Per-connection inbound consumer: stamps sender metadata, reports
/// messages to the observer, removes the connection on terminal errors.
async fn consume(center: Arc<ServiceCenter>, conn: Arc<MsgConnection>) {
    loop {
        match conn.read_message().await {
            Ok(mut msg) => {
                msg.sender = Some(conn.username().to_owned());
                msg.sender_service = Some(center.service.clone());
                if let Some(handler) = &center.config.message_handler {
                    handler.on_message(conn.uniq_id(), &msg);
                }
            }
            Err(e) if e.is_fatal() => {
                center.remove_conn(&conn);
                if !matches!(e, hermod_proto::conn::ConnError::Eof) {
                    center.report_error(conn.username(), conn.uniq_id(), &e);
                }
                tracing::info!(
                    service = %center.service,
                    username = %conn.username(),
                    conn_id = %conn.uniq_id(),
                    "connection closed"
                );
                break;
            }
            Err(e) => {
                center.report_error(conn.username(), conn.uniq_id(), &e);
            }
        }
    }
}
