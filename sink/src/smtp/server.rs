use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::session::{SessionAction, SmtpResponse, SmtpSession, Transaction};
use crate::services::Ledger;
use crate::types::{ReceivedMail, Result, SinkError};

pub struct SmtpServer {
    ledger: Arc<Ledger>,
    hostname: String,
}

impl SmtpServer {
    pub fn new(ledger: Arc<Ledger>, hostname: impl Into<String>) -> Self {
        Self {
            ledger,
            hostname: hostname.into(),
        }
    }

    pub async fn bind(port: u16) -> Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        TcpListener::bind(addr)
            .await
            .map_err(|e| SinkError::Io(format!("cannot listen on {}: {}", addr, e)))
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// open keep running to completion.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr()?;
        info!("Accepting SMTP connections on {}", local);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("SMTP listener on {} shutting down", local);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            warn!("Connection from {} ended with error: {}", peer, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        debug!("Connection opened from {}", peer);
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut session = SmtpSession::new(self.hostname.clone());

        writer.write_all(session.greeting().to_wire().as_bytes()).await?;

        let mut line = Vec::new();
        loop {
            line.clear();
            let limit = session.max_line_bytes();
            let read = (&mut reader)
                .take(limit as u64)
                .read_until(b'\n', &mut line)
                .await?;
            if read == 0 {
                debug!("Connection closed by {}", peer);
                return Ok(());
            }
            if read == limit && !line.ends_with(b"\n") {
                let reply = SmtpResponse::new(500, "Line too long");
                writer.write_all(reply.to_wire().as_bytes()).await?;
                return Err(SinkError::Protocol(format!("line over {} bytes", limit)));
            }

            match session.handle_line(&line) {
                SessionAction::Continue => {}
                SessionAction::Reply(reply) => {
                    writer.write_all(reply.to_wire().as_bytes()).await?;
                }
                SessionAction::Deliver(transaction) => {
                    let reply = self.deliver(transaction, peer).await;
                    writer.write_all(reply.to_wire().as_bytes()).await?;
                }
                SessionAction::Close(reply) => {
                    writer.write_all(reply.to_wire().as_bytes()).await?;
                    writer.shutdown().await?;
                    debug!("Connection closed with {}", peer);
                    return Ok(());
                }
            }
        }
    }

    /// Record one copy per recipient. A failed recipient is logged and does
    /// not stop the others.
    async fn deliver(&self, transaction: Transaction, peer: SocketAddr) -> SmtpResponse {
        let data = self.with_trace_header(&transaction, peer);
        let total = transaction.recipients.len();
        let mut recorded = 0;

        for recipient in transaction.recipients {
            let mail = ReceivedMail::new(transaction.sender.clone(), recipient.clone(), data.clone());
            let ledger = self.ledger.clone();
            match tokio::task::spawn_blocking(move || ledger.insert(mail)).await {
                Ok(Ok(true)) => recorded += 1,
                Ok(Ok(false)) => warn!("Mail for {} was not recorded", recipient),
                Ok(Err(e)) => error!("Failed to record mail for {}: {}", recipient, e),
                Err(e) => error!("Delivery task for {} failed: {}", recipient, e),
            }
        }

        info!(
            "Mail from <{}> via {}: {}/{} recipients recorded",
            transaction.sender, peer, recorded, total
        );
        if recorded > 0 {
            SmtpResponse::ok()
        } else {
            SmtpResponse::new(451, "Requested action aborted: local error in processing")
        }
    }

    fn with_trace_header(&self, transaction: &Transaction, peer: SocketAddr) -> Vec<u8> {
        let header = format!(
            "Received: from {} ([{}])\r\n        by {} with SMTP;\r\n        {}\r\n",
            transaction.helo,
            peer.ip(),
            self.hostname,
            chrono::Utc::now().to_rfc2822()
        );
        let mut data = Vec::with_capacity(header.len() + transaction.data.len());
        data.extend_from_slice(header.as_bytes());
        data.extend_from_slice(&transaction.data);
        data
    }
}
