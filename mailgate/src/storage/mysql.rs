use crate::config::CfgStore;
use crate::storage::sql::{ParamStyle, Statements};
use crate::storage::{Backend, StoreError};
use async_trait::async_trait;
use mysql_async::{prelude::Queryable, Conn, DriverError, Opts, OptsBuilder};
use tracing::info;

/// MySQL error number for a duplicate primary key.
const ER_DUP_ENTRY: u16 = 1062;

pub struct MysqlBackend {
    opts: Opts,
    conn: Conn,
    statements: Statements,
}

impl From<mysql_async::Error> for StoreError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Io(_) | mysql_async::Error::Driver(DriverError::ConnectionClosed) => {
                StoreError::ConnectionLost(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

impl MysqlBackend {
    pub async fn open(cfg: &CfgStore, name: &str) -> Result<Self, StoreError> {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(cfg.host.clone().unwrap_or_else(|| "localhost".to_string()))
            .tcp_port(cfg.port.unwrap_or(3306))
            .user(cfg.user.clone())
            .pass(cfg.password.clone())
            .db_name(Some(cfg.database.clone().unwrap_or_else(|| "mailgate".to_string())))
            .into();

        let mut conn = Conn::new(opts.clone())
            .await
            .map_err(|e| StoreError::open(name, e))?;
        let statements = Statements::new(name, ParamStyle::Qmark);
        conn.query_drop(statements.create_table.as_str())
            .await
            .map_err(|e| StoreError::open(name, e))?;

        Ok(MysqlBackend {
            opts,
            conn,
            statements,
        })
    }
}

#[async_trait]
impl Backend for MysqlBackend {
    async fn get(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .conn
            .exec_first::<i64, _, _>(self.statements.select.as_str(), (key,))
            .await?)
    }

    async fn set(&mut self, key: &str, value: i64) -> Result<(), StoreError> {
        match self
            .conn
            .exec_drop(self.statements.insert.as_str(), (key, value))
            .await
        {
            Err(mysql_async::Error::Server(ref err)) if err.code == ER_DUP_ENTRY => {
                self.conn
                    .exec_drop(self.statements.update.as_str(), (value, key))
                    .await?;
            }
            result => {
                result?;
            }
        }
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.conn
            .exec_drop(self.statements.delete.as_str(), (key,))
            .await?;
        Ok(())
    }

    async fn purge_older_than(&mut self, cutoff: i64) -> Result<u64, StoreError> {
        self.conn
            .exec_drop(self.statements.purge.as_str(), (cutoff,))
            .await?;
        Ok(self.conn.affected_rows())
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.conn = Conn::new(self.opts.clone()).await?;
        info!("Reconnected to MySQL");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "mysql"
    }
}
