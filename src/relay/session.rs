use crate::config::{Config, BUFFER_SIZE};
use crate::relay::{ACK_CONNECTED, ACK_WAITING};
use crate::stats::Stats;
use crate::transport::{Transport, TransportReader, TransportWriter};
use std::collections::HashMap;
use std::io::{Error, ErrorKind::Other, Result};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::interval;
use tokio::{select, task};

/// Outcome of joining a session.
///
/// A full session hands the refused connection back so the caller can
/// answer and close it.
pub enum JoinOutcome {
    Waiting,
    Connected,
    SessionFull(Transport),
}

enum SessionState {
    Waiting,
    Connected,
}

enum JoinDecision {
    First(Arc<Session>),
    Second(Arc<Session>),
    Full,
}

struct Session {
    id: String,
    created_at: Instant,
    last_used: Mutex<Instant>,
    state: Mutex<SessionState>,
    first: Mutex<Option<Transport>>,
    first_ready: Notify,
    shutdown: Notify,
}

impl Session {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            created_at: Instant::now(),
            last_used: Mutex::new(Instant::now()),
            state: Mutex::new(SessionState::Waiting),
            first: Mutex::new(None),
            first_ready: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }

    fn deposit_first(&self, conn: Transport) {
        *self.first.lock().unwrap() = Some(conn);
        self.first_ready.notify_one();
    }

    /// Wait for the parked first endpoint. Returns `None` when the session
    /// is shut down before it ever arrives.
    async fn take_first(&self) -> Option<Transport> {
        loop {
            let parked = self.first.lock().unwrap().take();
            if let Some(conn) = parked {
                return Some(conn);
            }
            select! {
                _ = self.first_ready.notified() => {}
                _ = self.shutdown.notified() => return None,
            }
        }
    }
}

/// Owner of all relay sessions
///
/// pairs connections by identifier. No other component removes a session;
/// both removal paths (copy loops ending, idle sweep) funnel through
/// [`SessionRegistry::close`] under the one registry lock.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: Config,
    stats: Arc<Stats>,
}

impl SessionRegistry {
    pub fn new(config: Config, stats: Arc<Stats>) -> Self {
        Self {
            sessions: Default::default(),
            config,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join `conn` to the session named `id`, creating it if needed.
    ///
    /// The first arrival is acknowledged with `WAITING` and parked. The
    /// second receives `CONNECTED` (as does the parked one) and the two
    /// copy directions start. Any later arrival comes back as
    /// [`JoinOutcome::SessionFull`], untouched.
    pub async fn create_or_join(self: &Arc<Self>, id: &str, mut conn: Transport) -> Result<JoinOutcome> {
        let decision = {
            let mut sessions = self.sessions.write().unwrap();
            match sessions.get(id) {
                None => {
                    let session = Arc::new(Session::new(id));
                    sessions.insert(id.to_owned(), session.clone());
                    JoinDecision::First(session)
                }
                Some(session) => {
                    let mut state = session.state.lock().unwrap();
                    match *state {
                        SessionState::Waiting => {
                            *state = SessionState::Connected;
                            JoinDecision::Second(session.clone())
                        }
                        SessionState::Connected => JoinDecision::Full,
                    }
                }
            }
        };

        match decision {
            JoinDecision::First(session) => {
                if let Err(e) = conn.write_all(ACK_WAITING).await {
                    self.close(id).await;
                    return Err(e);
                }
                session.deposit_first(conn);
                log::debug!("created session {}, waiting for peer", id);
                Ok(JoinOutcome::Waiting)
            }
            JoinDecision::Second(session) => {
                let mut first = match session.take_first().await {
                    Some(conn) => conn,
                    None => {
                        let _ = conn.close().await;
                        return Err(Error::new(Other, "session evicted before pairing"));
                    }
                };

                if first.write_all(ACK_CONNECTED).await.is_err()
                    || conn.write_all(ACK_CONNECTED).await.is_err()
                {
                    let _ = first.close().await;
                    let _ = conn.close().await;
                    self.close(id).await;
                    return Err(Error::new(Other, "peer went away during handshake"));
                }

                session.touch();
                self.stats.record_event(&format!("session {} connected", id));
                log::debug!("session {} connected, relaying", id);

                task::spawn(run_session(self.clone(), session, first, conn));
                Ok(JoinOutcome::Connected)
            }
            JoinDecision::Full => Ok(JoinOutcome::SessionFull(conn)),
        }
    }

    /// Force-close both endpoints and drop the session. Closing a session
    /// that is already gone is a no-op.
    pub async fn close(&self, id: &str) {
        let session = { self.sessions.write().unwrap().remove(id) };
        if let Some(session) = session {
            // a session has at most one shutdown waiter; notify_one keeps
            // the permit when the waiter has not registered yet
            session.shutdown.notify_one();

            let parked = session.first.lock().unwrap().take();
            if let Some(mut conn) = parked {
                let _ = conn.close().await;
            }

            self.stats.record_event(&format!("session {} closed", id));
            log::debug!("closed session {} after {:?}", id, session.created_at.elapsed());
        }
    }

    /// Evict every session idle for longer than `threshold`.
    pub async fn evict_idle(&self, threshold: Duration) {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .filter(|(_, session)| session.idle_for() > threshold)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in expired {
            log::debug!("evicting idle session {}", id);
            self.close(&id).await;
        }
    }

    /// Spawn the periodic idle sweep.
    pub fn start_sweeper(self: Arc<Self>) {
        task::spawn(async move {
            let mut tick = interval(self.config.sweep_interval);
            tick.tick().await; // the first tick completes immediately
            loop {
                tick.tick().await;
                self.evict_idle(self.config.idle_timeout).await;
            }
        });
    }
}

async fn run_session(registry: Arc<SessionRegistry>, session: Arc<Session>, a: Transport, b: Transport) {
    log::debug!(
        "session {}: {} <-> {}",
        session.id,
        a.peer_addr(),
        b.peer_addr()
    );

    let (mut ar, mut aw) = a.into_split();
    let (mut br, mut bw) = b.into_split();

    // either direction ending, or eviction, ends the whole session
    select! {
        _ = copy_direction(&mut ar, &mut bw, &session, &registry.stats) => {}
        _ = copy_direction(&mut br, &mut aw, &session, &registry.stats) => {}
        _ = session.shutdown.notified() => {}
    }

    let _ = aw.close().await;
    let _ = bw.close().await;
    registry.close(&session.id).await;
}

async fn copy_direction(
    src: &mut TransportReader,
    dst: &mut TransportWriter,
    session: &Session,
    stats: &Stats,
) {
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("session {}: read error: {}", session.id, e);
                break;
            }
        };

        session.touch();

        if let Err(e) = dst.write_all(&buf[..n]).await {
            log::debug!("session {}: write error: {}", session.id, e);
            break;
        }

        stats.add_received(n as u64);
        stats.add_sent(n as u64);
        log::trace!("session {}: relayed {} bytes", session.id, n);
    }
}
