use std::sync::atomic::{AtomicBool, Ordering};

use crate::connection::{Connection, SendOptions};
use crate::error::StompError;
use crate::message::Message;

/// A STOMP transaction started with [`Connection::begin`].
///
/// Frames sent through it carry the `transaction` header. After `commit`
/// or `abort` every further call fails.
#[derive(Debug)]
pub struct Transaction {
    conn: Connection,
    id: String,
    finished: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(conn: Connection, id: String) -> Self {
        Self {
            conn,
            id,
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StompError> {
        if self.is_finished() {
            return Err(StompError::Protocol(format!(
                "transaction '{}' is already finished",
                self.id
            )));
        }
        Ok(())
    }

    pub async fn send(
        &self,
        destination: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
        opts: SendOptions,
    ) -> Result<(), StompError> {
        self.ensure_open()?;
        self.conn
            .send_in(destination, content_type, body.into(), opts, Some(&self.id))
            .await
    }

    pub async fn ack(&self, message: &Message) -> Result<(), StompError> {
        self.ensure_open()?;
        self.conn.settle("ACK", message, Some(&self.id)).await
    }

    pub async fn nack(&self, message: &Message) -> Result<(), StompError> {
        self.ensure_open()?;
        self.conn.settle("NACK", message, Some(&self.id)).await
    }

    pub async fn commit(&self) -> Result<(), StompError> {
        self.finish("COMMIT").await
    }

    pub async fn abort(&self) -> Result<(), StompError> {
        self.finish("ABORT").await
    }

    async fn finish(&self, command: &'static str) -> Result<(), StompError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(StompError::Protocol(format!(
                "transaction '{}' is already finished",
                self.id
            )));
        }
        self.conn.transaction_frame(command, &self.id).await
    }
}
