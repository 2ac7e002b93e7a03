//! Multi-turn collection of a deploy request.
//!
//! A front end that talks to users one message at a time opens a session,
//! feeds it the archive, then the entry point, then an optional secret. The
//! session yields a complete [`DeployRequest`] once all three are in.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::supervisor::DeployRequest;
use crate::types::{EntryPoint, OwnerId};

/// Idle sessions older than this are purged (5 minutes).
pub const SESSION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
enum Stage {
    AwaitingArchive,
    AwaitingEntryPoint {
        archive: Vec<u8>,
        archive_name: Option<String>,
    },
    AwaitingSecret {
        archive: Vec<u8>,
        archive_name: Option<String>,
        entry_point: EntryPoint,
    },
}

impl Stage {
    const fn expects(&self) -> &'static str {
        match self {
            Self::AwaitingArchive => "archive",
            Self::AwaitingEntryPoint { .. } => "entry_point",
            Self::AwaitingSecret { .. } => "secret",
        }
    }
}

/// One message from the user.
#[derive(Debug, Clone)]
pub enum Input {
    Archive {
        bytes: Vec<u8>,
        name: Option<String>,
    },
    EntryPoint(String),
    /// `None` skips the secret.
    Secret(Option<String>),
}

impl Input {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Archive { .. } => "archive",
            Self::EntryPoint(_) => "entry_point",
            Self::Secret(_) => "secret",
        }
    }
}

/// Result of feeding a session one input.
#[derive(Debug)]
pub enum Step {
    /// Waiting for the named input.
    Awaiting(&'static str),
    Ready(DeployRequest),
}

#[derive(Debug)]
pub struct DeploySession {
    owner: OwnerId,
    stage: Stage,
    created_at: Instant,
    last_used: Instant,
}

impl DeploySession {
    #[must_use]
    pub fn new(owner: OwnerId) -> Self {
        let now = Instant::now();
        Self {
            owner,
            stage: Stage::AwaitingArchive,
            created_at: now,
            last_used: now,
        }
    }

    /// Name of the input the session wants next.
    #[must_use]
    pub fn awaiting(&self) -> &'static str {
        self.stage.expects()
    }

    /// Apply one input. On error the session is left as it was.
    pub fn advance(&mut self, input: Input) -> Result<Step, SessionError> {
        let step = match (&mut self.stage, input) {
            (Stage::AwaitingArchive, Input::Archive { bytes, name }) => {
                self.stage = Stage::AwaitingEntryPoint {
                    archive: bytes,
                    archive_name: name,
                };
                Step::Awaiting(self.stage.expects())
            }
            (
                Stage::AwaitingEntryPoint {
                    archive,
                    archive_name,
                },
                Input::EntryPoint(raw),
            ) => {
                let entry_point = EntryPoint::new(raw)?;
                self.stage = Stage::AwaitingSecret {
                    archive: mem::take(archive),
                    archive_name: archive_name.take(),
                    entry_point,
                };
                Step::Awaiting(self.stage.expects())
            }
            (
                Stage::AwaitingSecret {
                    archive,
                    archive_name,
                    entry_point,
                },
                Input::Secret(secret),
            ) => {
                let request = DeployRequest {
                    owner: self.owner.clone(),
                    archive: mem::take(archive),
                    archive_name: archive_name.take(),
                    entry_point: entry_point.clone(),
                    secret: secret.filter(|s| !s.trim().is_empty()),
                };
                self.stage = Stage::AwaitingArchive;
                Step::Ready(request)
            }
            (stage, input) => {
                return Err(SessionError::UnexpectedInput {
                    expected: stage.expects(),
                    got: input.kind(),
                })
            }
        };
        self.last_used = Instant::now();
        Ok(step)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub owner: OwnerId,
    pub awaiting: &'static str,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// Open deploy sessions, at most one per owner.
pub struct SessionBook {
    sessions: RwLock<HashMap<OwnerId, DeploySession>>,
    ttl: Duration,
}

impl Default for SessionBook {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl SessionBook {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Open a fresh session for `owner`. Returns true if one was replaced.
    pub async fn start(&self, owner: &OwnerId) -> bool {
        let replaced = self
            .sessions
            .write()
            .await
            .insert(owner.clone(), DeploySession::new(owner.clone()))
            .is_some();
        debug!(%owner, replaced, "deploy session started");
        replaced
    }

    /// Feed `input` to the owner's session. A completed session is removed.
    pub async fn submit(&self, owner: &OwnerId, input: Input) -> Result<Step, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(owner).ok_or(SessionError::NoSession)?;
        let step = session.advance(input)?;
        if matches!(step, Step::Ready(_)) {
            sessions.remove(owner);
            debug!(%owner, "deploy session complete");
        }
        Ok(step)
    }

    pub async fn cancel(&self, owner: &OwnerId) -> bool {
        self.sessions.write().await.remove(owner).is_some()
    }

    pub async fn info(&self, owner: &OwnerId) -> Option<SessionInfo> {
        let now = Instant::now();
        self.sessions.read().await.get(owner).map(|s| SessionInfo {
            owner: s.owner.clone(),
            awaiting: s.awaiting(),
            age_secs: now.duration_since(s.created_at).as_secs(),
            idle_secs: now.duration_since(s.last_used).as_secs(),
        })
    }

    /// Drop sessions idle for longer than the TTL. Returns how many.
    pub async fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|owner, s| {
            let keep = now.duration_since(s.last_used) <= self.ttl;
            if !keep {
                info!(%owner, "expiring idle deploy session");
            }
            keep
        });
        before - sessions.len()
    }

    /// Purge expired sessions every `period`.
    pub fn spawn_janitor(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let book = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                book.purge_expired().await;
            }
        })
    }
}
