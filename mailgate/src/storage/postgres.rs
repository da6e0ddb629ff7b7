use crate::config::CfgStore;
use crate::storage::sql::{ParamStyle, Statements};
use crate::storage::{Backend, StoreError};
use async_trait::async_trait;
use tokio_postgres::{error::SqlState, Client, Config, NoTls};
use tracing::{info, warn};

pub struct PostgresBackend {
    config: Config,
    client: Client,
    statements: Statements,
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() || caused_by_io(&err) {
            StoreError::ConnectionLost(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// A socket torn down mid-query surfaces as an I/O error somewhere in the
/// source chain rather than as a closed client.
fn caused_by_io(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.is::<std::io::Error>() {
            return true;
        }
        current = err.source();
    }
    false
}

impl PostgresBackend {
    pub async fn open(cfg: &CfgStore, name: &str) -> Result<Self, StoreError> {
        let mut config = Config::new();
        config
            .host(cfg.host.as_deref().unwrap_or("localhost"))
            .port(cfg.port.unwrap_or(5432))
            .dbname(cfg.database.as_deref().unwrap_or("mailgate"));
        if let Some(user) = &cfg.user {
            config.user(user);
        }
        if let Some(password) = &cfg.password {
            config.password(password);
        }

        let client = Self::connect(&config)
            .await
            .map_err(|e| StoreError::open(name, e))?;
        let statements = Statements::new(name, ParamStyle::Numeric);
        client
            .batch_execute(statements.create_table.as_str())
            .await
            .map_err(|e| StoreError::open(name, e))?;

        Ok(PostgresBackend {
            config,
            client,
            statements,
        })
    }

    async fn connect(config: &Config) -> Result<Client, tokio_postgres::Error> {
        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "PostgreSQL connection closed");
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn get(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        let row = self
            .client
            .query_opt(self.statements.select.as_str(), &[&key])
            .await?;
        Ok(row.map(|row| row.get::<_, i64>(0)))
    }

    async fn set(&mut self, key: &str, value: i64) -> Result<(), StoreError> {
        match self
            .client
            .execute(self.statements.insert.as_str(), &[&key, &value])
            .await
        {
            Err(err) if err.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                self.client
                    .execute(self.statements.update.as_str(), &[&value, &key])
                    .await?;
            }
            result => {
                result?;
            }
        }
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.client
            .execute(self.statements.delete.as_str(), &[&key])
            .await?;
        Ok(())
    }

    async fn purge_older_than(&mut self, cutoff: i64) -> Result<u64, StoreError> {
        Ok(self
            .client
            .execute(self.statements.purge.as_str(), &[&cutoff])
            .await?)
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.client = Self::connect(&self.config).await?;
        info!("Reconnected to PostgreSQL");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, thiserror::Error)]
    #[error("error communicating with the server")]
    struct Wrapped(#[source] io::Error);

    #[derive(Debug, thiserror::Error)]
    #[error("duplicate key value violates unique constraint")]
    struct Constraint;

    #[test]
    fn test_io_failures_count_as_lost_connections() {
        let reset = Wrapped(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        assert!(caused_by_io(&reset));
        assert!(caused_by_io(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!caused_by_io(&Constraint));
    }
}
