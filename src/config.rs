//! Process configuration and the composition root.
//!
//! Every stateful piece (backend, stores, limiter, CSRF tokens) is built
//! here once per process and injected; nothing in this crate is a
//! module-level singleton, so tests construct fresh instances freely.

use crate::backend::{Backend, MemoryBackend, RelationalBackend};
use crate::credential::IteratedSha256;
use crate::csrf::CsrfTokens;
use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::session::SessionService;
use crate::store::{GameStore, DEFAULT_ROOM_TTL_HOURS};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// Only read when `backend` is `Sqlite`.
    pub sqlite_path: PathBuf,
    pub room_ttl_hours: i64,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub hash_iterations: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            sqlite_path: PathBuf::from("parlor.db"),
            room_ttl_hours: DEFAULT_ROOM_TTL_HOURS,
            rate_limit_max: 100,
            rate_limit_window_secs: 60,
            hash_iterations: 10_000,
        }
    }
}

impl StoreConfig {
    /// Load `.env` if present, then read the environment.
    pub fn load() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            if !matches!(e, dotenvy::Error::Io(_)) {
                tracing::warn!("failed to load .env file: {e}");
            }
        }
        Self::from_env()
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();

        let backend = match std::env::var("PARLOR_BACKEND").as_deref() {
            Ok("sqlite") => BackendKind::Sqlite,
            Ok("memory") | Err(_) => BackendKind::Memory,
            Ok(other) => {
                tracing::warn!(backend = other, "unknown PARLOR_BACKEND, using memory");
                BackendKind::Memory
            }
        };

        let config = Self {
            backend,
            sqlite_path: std::env::var("PARLOR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.sqlite_path),
            room_ttl_hours: env_parsed("PARLOR_ROOM_TTL_HOURS", defaults.room_ttl_hours),
            rate_limit_max: env_parsed("PARLOR_RATE_LIMIT_MAX", defaults.rate_limit_max),
            rate_limit_window_secs: env_parsed(
                "PARLOR_RATE_LIMIT_WINDOW",
                defaults.rate_limit_window_secs,
            ),
            hash_iterations: env_parsed("PARLOR_HASH_ITERATIONS", defaults.hash_iterations),
        };

        tracing::info!(
            backend = ?config.backend,
            room_ttl_hours = config.room_ttl_hours,
            rate_limit_max = config.rate_limit_max,
            rate_limit_window_secs = config.rate_limit_window_secs,
            "store config loaded"
        );
        config
    }

    pub fn build_backend(&self) -> Result<Arc<dyn Backend>> {
        Ok(match self.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::default()),
            BackendKind::Sqlite => Arc::new(RelationalBackend::open(&self.sqlite_path)?),
        })
    }

    /// Build the full set of per-process services over one shared backend.
    pub fn build(&self) -> Result<Services> {
        let backend = self.build_backend()?;
        Ok(Services {
            games: GameStore::with_ttl(
                Arc::clone(&backend),
                chrono::Duration::hours(self.room_ttl_hours),
            ),
            sessions: SessionService::new(
                Arc::clone(&backend),
                Arc::new(IteratedSha256::new(self.hash_iterations)),
            ),
            rate_limiter: RateLimiter::new(
                self.rate_limit_max,
                Duration::from_secs(self.rate_limit_window_secs),
            ),
            csrf: CsrfTokens::new(),
            backend,
        })
    }
}

fn env_parsed<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Everything the route layer needs, owned by the process that built it.
pub struct Services {
    pub games: GameStore,
    pub sessions: SessionService,
    pub rate_limiter: RateLimiter,
    pub csrf: CsrfTokens,
    pub backend: Arc<dyn Backend>,
}
