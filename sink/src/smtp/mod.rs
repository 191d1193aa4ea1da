//! Mail-receiving side: accepts SMTP connections and hands every accepted
//! recipient of every transaction to the ledger.

pub mod server;
pub mod session;

pub use server::SmtpServer;
pub use session::{SessionAction, SmtpResponse, SmtpSession, SmtpState, Transaction};
