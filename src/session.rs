//! Database session
//!
//! Owns the single PostgreSQL connection shared by the resolver and the
//! emitter, and streams table rows out of it with `COPY ... TO STDOUT`.

use crate::config::Settings;
use crate::error::{connection_error, BoxError, DumpResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::pin::pin;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, error, info, warn};

/// Bulk row export into the output stream
#[async_trait(?Send)]
pub trait RowStreamer {
    /// Copy every row produced by `source` into `sink`
    ///
    /// `source` is either a bare table name or a parenthesized query. Rows
    /// arrive in COPY text format: one line per row, tab separated fields.
    /// Returns the number of bytes written.
    async fn stream_out<W>(&self, source: &str, sink: &mut W) -> Result<u64, BoxError>
    where
        W: AsyncWrite + Unpin + ?Sized;
}

/// Parameters for opening a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub use_tls: bool,
}

impl From<&Settings> for ConnectionParams {
    fn from(settings: &Settings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            user: settings.username.clone(),
            database: settings.database.clone(),
            use_tls: settings.use_tls,
        }
    }
}

impl ConnectionParams {
    fn to_config(&self, password: Option<&str>) -> Config {
        let mut cfg = Config::new();
        cfg.host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.database);
        if let Some(password) = password {
            cfg.password(password);
        }
        cfg
    }

    /// Human readable target, never includes the password
    pub fn to_display_string(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

/// A live database session
pub struct Session {
    client: Client,
}

impl Session {
    /// Connect, prompting for a password if the first attempt is rejected
    ///
    /// The first attempt carries no password. When it fails the user is
    /// prompted (unless `no_password` is set, in which case an empty
    /// password is used) and the connection is retried exactly once.
    pub async fn connect_with_prompt(params: &ConnectionParams, no_password: bool) -> DumpResult<Self> {
        match Self::connect(params, None).await {
            Ok(session) => Ok(session),
            Err(first) => {
                debug!("Connection without password failed: {}", first);
                let password = if no_password {
                    String::new()
                } else {
                    rpassword::prompt_password(format!("Password for {}: ", params.user))
                        .map_err(|e| connection_error(format!("failed to read password: {}", e)))?
                };
                Self::connect(params, Some(&password)).await
            }
        }
    }

    /// Open a session and verify it with a trivial query
    pub async fn connect(params: &ConnectionParams, password: Option<&str>) -> DumpResult<Self> {
        let cfg = params.to_config(password);

        let client = if params.use_tls {
            let certs = rustls_native_certs::load_native_certs();
            for err in &certs.errors {
                warn!("Skipping unreadable native certificate: {}", err);
            }
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

            let (client, connection) = cfg.connect(tls).await.map_err(|e| {
                connection_error(format!("failed to connect to {}: {}", params.to_display_string(), e))
            })?;
            spawn_driver(connection);
            client
        } else {
            let (client, connection) = cfg.connect(NoTls).await.map_err(|e| {
                connection_error(format!("failed to connect to {}: {}", params.to_display_string(), e))
            })?;
            spawn_driver(connection);
            client
        };

        client
            .query_one("SELECT 1 AS ok", &[])
            .await
            .map_err(|e| connection_error(format!("connection test failed: {}", e)))?;

        info!(
            "✅ Connected to {} (TLS: {})",
            params.to_display_string(),
            params.use_tls
        );
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Drive the connection in the background until the client is dropped
fn spawn_driver<S, T>(connection: tokio_postgres::Connection<S, T>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Database connection error: {}", e);
        }
    });
}

#[async_trait(?Send)]
impl RowStreamer for Session {
    async fn stream_out<W>(&self, source: &str, sink: &mut W) -> Result<u64, BoxError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let statement = format!("COPY {} TO STDOUT", source);
        let mut stream = pin!(self.client.copy_out(statement.as_str()).await?);

        let mut written = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }
}
