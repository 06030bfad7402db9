use std::{fmt, future::Future, str::FromStr};

use anyhow::{Context as _, bail};
use sqlx::{
    Connection as _, MySqlConnection,
    mysql::{MySqlConnectOptions, MySqlDatabaseError},
};

/// Failure reported by the target server or its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    Server { code: Option<u16>, message: String },
    Connection(String),
    Other(String),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server {
                code: Some(code),
                message,
            } => write!(f, "server error {code}: {message}"),
            Self::Server {
                code: None,
                message,
            } => write!(f, "server error: {message}"),
            Self::Connection(message) => write!(f, "connection error: {message}"),
            Self::Other(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<sqlx::Error> for ExecError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err
                    .try_downcast_ref::<MySqlDatabaseError>()
                    .map(MySqlDatabaseError::number);
                Self::Server {
                    code,
                    message: db_err.message().to_owned(),
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err.to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

/// The server being replayed against.
pub trait Database: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, ExecError>> + Send;
}

/// One client connection owned by a single session.
pub trait Connection: Send + 'static {
    /// Runs `statement` and discards any result set.
    fn execute(&mut self, statement: &str) -> impl Future<Output = Result<(), ExecError>> + Send;

    fn close(self) -> impl Future<Output = Result<(), ExecError>> + Send;
}

#[derive(Debug, Clone)]
pub struct MySqlDatabase {
    options: MySqlConnectOptions,
}

impl MySqlDatabase {
    pub fn new(options: MySqlConnectOptions) -> Self {
        Self { options }
    }

    pub fn from_dsn(dsn: &str) -> anyhow::Result<Self> {
        Ok(Self::new(connect_options(dsn)?))
    }
}

impl Database for MySqlDatabase {
    type Connection = MySqlSession;

    async fn connect(&self) -> Result<MySqlSession, ExecError> {
        let inner = MySqlConnection::connect_with(&self.options)
            .await
            .map_err(|err| match ExecError::from(err) {
                ExecError::Other(message) => ExecError::Connection(message),
                other => other,
            })?;
        Ok(MySqlSession { inner })
    }
}

#[derive(Debug)]
pub struct MySqlSession {
    inner: MySqlConnection,
}

impl Connection for MySqlSession {
    async fn execute(&mut self, statement: &str) -> Result<(), ExecError> {
        sqlx::Executor::execute(&mut self.inner, sqlx::raw_sql(statement))
            .await
            .map(|_| ())
            .map_err(ExecError::from)
    }

    async fn close(self) -> Result<(), ExecError> {
        self.inner.close().await.map_err(ExecError::from)
    }
}

/// Accepts either a `mysql://` URL or a driver-style DSN such as
/// `user:pass@tcp(host:3306)/db?charset=utf8mb4`.
pub fn connect_options(dsn: &str) -> anyhow::Result<MySqlConnectOptions> {
    let dsn = dsn.trim();
    if dsn.is_empty() {
        bail!("dsn is empty");
    }
    if dsn.starts_with("mysql://") || dsn.starts_with("mariadb://") {
        // The URL may carry a password, so it stays out of the error message.
        return MySqlConnectOptions::from_str(dsn).context("parse dsn URL");
    }
    Ok(DsnParts::parse(dsn)?.into_options())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct DsnParts {
    username: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    socket: Option<String>,
    database: Option<String>,
    charset: Option<String>,
    collation: Option<String>,
}

impl DsnParts {
    fn parse(dsn: &str) -> anyhow::Result<Self> {
        let mut parts = Self::default();

        let (credentials, rest) = match dsn.rsplit_once('@') {
            Some((credentials, rest)) => (Some(credentials), rest),
            None => (None, dsn),
        };
        if let Some(credentials) = credentials {
            let (username, password) = match credentials.split_once(':') {
                Some((username, password)) => (username, Some(password)),
                None => (credentials, None),
            };
            parts.username = Some(username.to_owned()).filter(|name| !name.is_empty());
            parts.password = password.map(str::to_owned);
        }

        let (network, address, path) = match rest.split_once('(') {
            Some((network, after)) => {
                let Some((address, path)) = after.split_once(')') else {
                    bail!("dsn address is missing a closing `)`");
                };
                (network, Some(address), path)
            }
            None => match rest.find('/') {
                Some(slash) => (&rest[..slash], None, &rest[slash..]),
                None => (rest, None, ""),
            },
        };

        let Some(path) = path.strip_prefix('/') else {
            bail!("dsn is missing the `/dbname` section");
        };
        let (database, params) = path.split_once('?').unwrap_or((path, ""));
        parts.database = Some(database.to_owned()).filter(|name| !name.is_empty());

        match network {
            "" | "tcp" => {
                if let Some(address) = address.filter(|address| !address.is_empty()) {
                    let (host, port) = split_host_port(address)?;
                    parts.host = Some(host.to_owned());
                    parts.port = port;
                }
            }
            "unix" => {
                let Some(socket) = address.filter(|address| !address.is_empty()) else {
                    bail!("dsn `unix` network needs a socket path");
                };
                parts.socket = Some(socket.to_owned());
            }
            other => bail!("unsupported dsn network `{other}`"),
        }

        for param in params.split('&').filter(|param| !param.is_empty()) {
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            match key {
                "charset" => {
                    parts.charset = value.split(',').next().map(str::to_owned);
                }
                "collation" => parts.collation = Some(value.to_owned()),
                other => tracing::warn!(parameter = other, "ignoring unsupported dsn parameter"),
            }
        }

        Ok(parts)
    }

    fn into_options(self) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new();
        if let Some(username) = self.username.as_deref() {
            options = options.username(username);
        }
        if let Some(password) = self.password.as_deref() {
            options = options.password(password);
        }
        if let Some(host) = self.host.as_deref() {
            options = options.host(host);
        }
        if let Some(port) = self.port {
            options = options.port(port);
        }
        if let Some(socket) = self.socket.as_deref() {
            options = options.socket(socket);
        }
        if let Some(database) = self.database.as_deref() {
            options = options.database(database);
        }
        if let Some(charset) = self.charset.as_deref() {
            options = options.charset(charset);
        }
        if let Some(collation) = self.collation.as_deref() {
            options = options.collation(collation);
        }
        options
    }
}

fn split_host_port(address: &str) -> anyhow::Result<(&str, Option<u16>)> {
    if let Some(bracketed) = address.strip_prefix('[') {
        let Some((host, rest)) = bracketed.split_once(']') else {
            bail!("dsn address `{address}` has an unterminated `[`");
        };
        let port = match rest.strip_prefix(':') {
            Some(port) => Some(parse_port(port)?),
            None if rest.is_empty() => None,
            None => bail!("dsn address `{address}` is malformed"),
        };
        return Ok((host, port));
    }
    match address.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((address, None)),
    }
}

fn parse_port(port: &str) -> anyhow::Result<u16> {
    port.parse()
        .with_context(|| format!("invalid dsn port `{port}`"))
}
