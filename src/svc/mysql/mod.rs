//! # MySQL probe module
//!
//! This module provides the thin wrapper around the mysql driver exposing
//! the few queries the health observer needs

use std::time::Duration;

use mysql_async::{prelude::*, Conn, OptsBuilder, Row};
use tokio::time::timeout;

use crate::svc::crd::cluster::ConditionStatus;

// -----------------------------------------------------------------------------
// Constants

/// connection establishment budget
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// pause between two replication probe attempts
pub const SLAVE_STATUS_RETRY_GAP: Duration = Duration::from_secs(3);

/// replication io states describing a transient connection to the leader, a
/// node in one of them is not replicating yet
pub const ERROR_CONNECTION_STATES: [&str; 5] = [
    "connecting to master",
    "reconnecting after a failed binlog dump request",
    "reconnecting after a failed master event read",
    "waiting to reconnect after a failed binlog dump request",
    "waiting to reconnect after a failed master event read",
];

/// a node lags when it runs behind the leader by more than a hundred times
/// the slow query threshold
const LAG_FACTOR: f64 = 100.0;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to connect to mysql on '{0}' within {1:?}")]
    ConnectTimeout(String, Duration),
    #[error("failed to execute request on mysql, {0}")]
    Mysql(mysql_async::Error),
    #[error("failed to read global variable '{0}', no row returned")]
    MissingVariable(String),
}

impl From<mysql_async::Error> for Error {
    fn from(err: mysql_async::Error) -> Self {
        Self::Mysql(err)
    }
}

// -----------------------------------------------------------------------------
// SlaveStatus structure

/// outcome of one replication probe, the message carries the reason a node
/// is not replicating
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct SlaveStatus {
    pub lagged: ConditionStatus,
    pub replicating: ConditionStatus,
    pub message: Option<String>,
}

// -----------------------------------------------------------------------------
// SqlRunner structure

pub struct SqlRunner {
    conn: Conn,
}

impl SqlRunner {
    /// open a connection to the given host with the probe credentials
    pub async fn connect(user: &str, password: &str, host: &str, port: u16) -> Result<Self, Error> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(user))
            .pass(Some(password));

        let conn = timeout(CONNECT_TIMEOUT, Conn::new(opts))
            .await
            .map_err(|_| Error::ConnectTimeout(host.to_string(), CONNECT_TIMEOUT))??;

        Ok(Self { conn })
    }

    /// probe the replication state, retrying up to `retry` times with a
    /// fixed gap while the node reports a transient error
    pub async fn check_slave_status_with_retry(
        &mut self,
        retry: u32,
    ) -> Result<SlaveStatus, Error> {
        let mut attempt = 0;

        loop {
            let result = self.check_slave_status().await;

            match &result {
                Ok(status) if status.message.is_none() => return result,
                _ => {
                    attempt += 1;
                    if attempt >= retry {
                        return result;
                    }
                }
            }

            tokio::time::sleep(SLAVE_STATUS_RETRY_GAP).await;
        }
    }

    async fn check_slave_status(&mut self) -> Result<SlaveStatus, Error> {
        let row: Option<Row> = self.conn.query_first("SHOW SLAVE STATUS").await?;

        let row = match row {
            // a node without replication configured is neither lagged nor
            // replicating
            None => {
                return Ok(SlaveStatus {
                    lagged: ConditionStatus::False,
                    replicating: ConditionStatus::False,
                    message: None,
                })
            }
            Some(row) => row,
        };

        let io_state = column_string(&row, "Slave_IO_State").to_lowercase();
        let sql_running = column_string(&row, "Slave_SQL_Running");
        let last_sql_error = column_string(&row, "Last_SQL_Error");
        let seconds_behind = column_string(&row, "Seconds_Behind_Master")
            .parse::<f64>()
            .ok();

        if let Some(status) = classify_slave_row(&io_state, &sql_running, &last_sql_error) {
            return Ok(status);
        }

        let long_query_time: f64 = self.get_global_variable("long_query_time").await?;

        Ok(SlaveStatus {
            lagged: lagged(seconds_behind, long_query_time),
            replicating: ConditionStatus::True,
            message: None,
        })
    }

    /// probe the global read-only flag
    pub async fn check_read_only(&mut self) -> Result<ConditionStatus, Error> {
        let read_only: u8 = self.get_global_variable("read_only").await?;

        Ok(if read_only == 0 {
            ConditionStatus::False
        } else {
            ConditionStatus::True
        })
    }

    /// read a global variable into the destination type
    pub async fn get_global_variable<T>(&mut self, name: &str) -> Result<T, Error>
    where
        T: FromValue + Send + 'static,
    {
        let row: Option<Row> = self
            .conn
            .query_first(format!("SELECT @@global.{}", name))
            .await?;

        row.and_then(|row| row.get::<T, _>(0))
            .ok_or_else(|| Error::MissingVariable(name.to_string()))
    }

    /// execute a statement without reading a result
    pub async fn run_query(&mut self, query: &str) -> Result<(), Error> {
        Ok(self.conn.query_drop(query).await?)
    }

    /// terminate the connection
    pub async fn close(self) -> Result<(), Error> {
        Ok(self.conn.disconnect().await?)
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// classify a replication row, returning the not-replicating outcome when
/// the io thread reports a transient connect state or the sql thread is down
pub fn classify_slave_row(
    io_state_lowercase: &str,
    sql_running: &str,
    last_sql_error: &str,
) -> Option<SlaveStatus> {
    if ERROR_CONNECTION_STATES.contains(&io_state_lowercase) {
        return Some(SlaveStatus {
            lagged: ConditionStatus::Unknown,
            replicating: ConditionStatus::False,
            message: Some(format!("Slave_IO_State: {}", io_state_lowercase)),
        });
    }

    if sql_running != "Yes" {
        return Some(SlaveStatus {
            lagged: ConditionStatus::Unknown,
            replicating: ConditionStatus::False,
            message: Some(format!("Last_SQL_Error: {}", last_sql_error)),
        });
    }

    None
}

/// returns whether the node runs too far behind the leader
pub fn lagged(seconds_behind: Option<f64>, long_query_time: f64) -> ConditionStatus {
    match seconds_behind {
        Some(seconds) if seconds > long_query_time * LAG_FACTOR => ConditionStatus::True,
        _ => ConditionStatus::False,
    }
}

fn column_string(row: &Row, column: &str) -> String {
    row.get::<Option<String>, _>(column)
        .flatten()
        .unwrap_or_default()
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_connect_states_stop_replication() {
        let status = classify_slave_row("connecting to master", "Yes", "").unwrap();

        assert_eq!(status.replicating, ConditionStatus::False);
        assert_eq!(status.lagged, ConditionStatus::Unknown);
        assert_eq!(
            status.message.as_deref(),
            Some("Slave_IO_State: connecting to master")
        );

        for state in ERROR_CONNECTION_STATES {
            assert!(classify_slave_row(state, "Yes", "").is_some());
        }
    }

    #[test]
    fn a_stopped_sql_thread_carries_its_error() {
        let status = classify_slave_row("waiting for master to send event", "No", "deadlock")
            .unwrap();

        assert_eq!(status.replicating, ConditionStatus::False);
        assert_eq!(status.message.as_deref(), Some("Last_SQL_Error: deadlock"));
    }

    #[test]
    fn a_running_replica_is_not_classified() {
        assert!(classify_slave_row("waiting for master to send event", "Yes", "").is_none());
    }

    #[test]
    fn lag_compares_against_a_hundred_times_the_slow_query_threshold() {
        assert_eq!(lagged(Some(400.0), 3.0), ConditionStatus::True);
        assert_eq!(lagged(Some(250.0), 3.0), ConditionStatus::False);
        assert_eq!(lagged(Some(300.0), 3.0), ConditionStatus::False);
        assert_eq!(lagged(None, 3.0), ConditionStatus::False);
    }
}
