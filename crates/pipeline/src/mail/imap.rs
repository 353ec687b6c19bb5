use async_trait::async_trait;
use futures::TryStreamExt;
use shared_types::EmailAccount;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use super::{MailConnector, MailSession, RawMessage};
use crate::credentials::CredentialCipher;
use crate::error::MailError;

type ImapStream = Compat<TlsStream<TcpStream>>;

/// Default bound on TCP connect, TLS handshake and LOGIN together
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens IMAP sessions over implicit TLS, decrypting the stored account secret.
pub struct ImapConnector {
    cipher: CredentialCipher,
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl ImapConnector {
    pub fn new(cipher: CredentialCipher) -> Self {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            cipher,
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn open(
        &self,
        account: &EmailAccount,
        host: &str,
        port: u16,
        password: &str,
    ) -> Result<ImapSession, MailError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|source| MailError::Connect {
                server: format!("{}:{}", host, port),
                source,
            })?;

        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| MailError::Tls(format!("Invalid server name {}: {}", host, e)))?;
        let tls_stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| MailError::Tls(e.to_string()))?;

        let client = async_imap::Client::new(tls_stream.compat());
        let session = client
            .login(&account.username, password)
            .await
            .map_err(|(e, _)| MailError::Auth(e.to_string()))?;

        Ok(ImapSession { session })
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self, account: &EmailAccount) -> Result<Box<dyn MailSession>, MailError> {
        let password = self.cipher.decrypt(&account.encrypted_secret)?;
        let host = account.imap_server.as_str();
        let port = u16::try_from(account.imap_port)
            .map_err(|_| MailError::Protocol(format!("Invalid IMAP port {}", account.imap_port)))?;

        info!(host = %host, port = port, account = %account.email_address, "Connecting to IMAP server");

        let session = tokio::time::timeout(
            self.connect_timeout,
            self.open(account, host, port, &password),
        )
        .await
        .map_err(|_| MailError::Timeout {
            server: format!("{}:{}", host, port),
            after: self.connect_timeout,
        })??;

        debug!(account = %account.email_address, "IMAP login succeeded");
        Ok(Box::new(session))
    }
}

pub struct ImapSession {
    session: async_imap::Session<ImapStream>,
}

#[async_trait]
impl MailSession for ImapSession {
    async fn fetch_recent(
        &mut self,
        mailbox: &str,
        limit: u32,
    ) -> Result<Vec<RawMessage>, MailError> {
        let selected = self
            .session
            .select(mailbox)
            .await
            .map_err(|e| MailError::Protocol(format!("Failed to select {}: {}", mailbox, e)))?;

        let total = selected.exists;
        if total == 0 || limit == 0 {
            return Ok(vec![]);
        }

        // Last N sequence numbers are the N most recent arrivals
        let start = total.saturating_sub(limit) + 1;
        let range = format!("{}:{}", start, total);

        let fetches: Vec<_> = self
            .session
            .fetch(&range, "(UID RFC822)")
            .await
            .map_err(|e| MailError::Protocol(format!("Failed to fetch messages: {}", e)))?
            .try_collect()
            .await
            .map_err(|e| MailError::Protocol(format!("Failed to read fetch response: {}", e)))?;

        let mut messages = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let uid = fetch.uid.unwrap_or(fetch.message);
            let Some(body) = fetch.body() else {
                continue;
            };
            match RawMessage::parse(uid, mailbox, body) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping unparseable message {}: {}", uid, e),
            }
        }

        messages.reverse();
        Ok(messages)
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        self.session
            .logout()
            .await
            .map_err(|e| MailError::Protocol(format!("Logout failed: {}", e)))
    }
}
