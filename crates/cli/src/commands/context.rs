use std::sync::Arc;

use clap::Args;
use fieldpo_client::{DataStore, RemoteBackend, SessionContext};
use fieldpo_core::backend::Identity;
use fieldpo_core::config::AppConfig;
use fieldpo_core::domain::profile::UserId;
use fieldpo_db::{
    connect_with_settings, migrations, DbPool, SqlAccessRepository, SqlRequestRepository,
};
use secrecy::ExposeSecret;

use crate::commands::{CommandFailure, EXIT_CONFIG, EXIT_CONNECTIVITY, EXIT_PERSISTENCE};

/// Bearer token the local store accepts; it only checks the user id.
const LOCAL_TOKEN: &str = "local";

#[derive(Debug, Clone, Args)]
pub struct ActingAs {
    /// User id to act as
    #[arg(long = "as", value_name = "USER_ID")]
    pub user_id: String,
}

/// A started session and its loaded data cache, against either the local database or the remote
/// backend depending on `backend.url`.
pub struct MemberSession {
    pub session: Arc<SessionContext>,
    pub store: DataStore,
    pool: Option<DbPool>,
}

impl MemberSession {
    pub async fn open(config: &AppConfig, acting_as: &ActingAs) -> Result<Self, CommandFailure> {
        let user_id = acting_as.user_id.trim();
        if user_id.is_empty() {
            return Err(CommandFailure::invalid_argument("--as needs a user id"));
        }
        let user_id = UserId(user_id.to_owned());

        if config.backend.is_remote() {
            Self::open_remote(config, user_id).await
        } else {
            Self::open_local(config, user_id).await
        }
    }

    async fn open_local(config: &AppConfig, user_id: UserId) -> Result<Self, CommandFailure> {
        let pool = open_database(config).await?;

        let access = Arc::new(SqlAccessRepository::new(pool.clone()));
        let requests = Arc::new(
            SqlRequestRepository::new(pool.clone()).with_po_seed(config.organization.po_seed),
        );
        let session = Arc::new(SessionContext::new(access.clone(), access));
        let store = DataStore::new(requests, session.clone());

        let member = Self { session, store, pool: Some(pool) };
        member.start(Identity::new(user_id, LOCAL_TOKEN)).await
    }

    async fn open_remote(config: &AppConfig, user_id: UserId) -> Result<Self, CommandFailure> {
        let token = config
            .backend
            .access_token
            .as_ref()
            .map(|token| token.expose_secret().to_owned())
            .ok_or_else(|| {
                CommandFailure::new(
                    "config_validation",
                    "FIELDPO_ACCESS_TOKEN is required when backend.url is set",
                    EXIT_CONFIG,
                )
            })?;

        let remote = Arc::new(RemoteBackend::from_config(&config.backend)?);
        let session = Arc::new(SessionContext::for_backend(remote.clone()));
        let store = DataStore::new(remote, session.clone());

        let member = Self { session, store, pool: None };
        member.start(Identity::new(user_id, token)).await
    }

    async fn start(self, identity: Identity) -> Result<Self, CommandFailure> {
        tracing::debug!(
            event_name = "cli.session.starting",
            user_id = %identity.user_id,
            remote = self.pool.is_none(),
            "starting session"
        );

        let started = match self.session.start(identity).await {
            Ok(access) if access.organization.is_none() => Ok(()),
            Ok(_) => self.store.initialize().await,
            Err(error) => Err(error),
        };

        match started {
            Ok(()) => Ok(self),
            Err(error) => {
                self.close().await;
                Err(error.into())
            }
        }
    }

    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }
}

/// Connects and brings the schema up to date.
pub async fn open_database(config: &AppConfig) -> Result<DbPool, CommandFailure> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| CommandFailure::new("db_connectivity", error.to_string(), EXIT_CONNECTIVITY))?;

    if let Err(error) = migrations::run_pending(&pool).await {
        pool.close().await;
        return Err(CommandFailure::new("migration", error.to_string(), EXIT_PERSISTENCE));
    }
    Ok(pool)
}
