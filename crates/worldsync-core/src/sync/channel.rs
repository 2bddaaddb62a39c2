//! Where changes go and where they come from
//!
//! The endpoints only need "send one change" and "receive one change". The
//! network halves implement these, and so do tokio channels so that two
//! endpoints can be wired together in-process.

use std::future::Future;

use tokio::sync::mpsc;

use super::protocol::{FileChanged, StatusCode, SyncMessage};
use super::transport::{FrameReader, FrameWriter};
use crate::error::{SyncError, SyncResult};

/// Destination of outbound changes
pub trait ChangeSink: Send {
    /// Deliver one change, in order
    fn send_change(&mut self, change: FileChanged) -> impl Future<Output = SyncResult<()>> + Send;
}

/// Source of inbound changes
pub trait ChangeSource: Send {
    /// Next change, or `None` once the stream ended normally
    fn next_change(&mut self) -> impl Future<Output = SyncResult<Option<FileChanged>>> + Send;
}

impl ChangeSink for FrameWriter {
    async fn send_change(&mut self, change: FileChanged) -> SyncResult<()> {
        self.send(SyncMessage::FileChanged(change)).await
    }
}

impl ChangeSource for FrameReader {
    async fn next_change(&mut self) -> SyncResult<Option<FileChanged>> {
        match self.recv().await? {
            Some(SyncMessage::FileChanged(change)) => Ok(Some(change)),
            Some(SyncMessage::Status {
                code: StatusCode::Ok,
                ..
            })
            | None => Ok(None),
            Some(SyncMessage::Status {
                code: StatusCode::Cancelled,
                ..
            }) => Err(SyncError::Cancelled),
            Some(SyncMessage::Status { code, message }) => {
                Err(SyncError::SessionFailed { code, message })
            }
            Some(other) => Err(SyncError::Protocol(format!(
                "unexpected {} on change stream",
                other.kind()
            ))),
        }
    }
}

impl ChangeSink for mpsc::Sender<FileChanged> {
    async fn send_change(&mut self, change: FileChanged) -> SyncResult<()> {
        self.send(change)
            .await
            .map_err(|_| SyncError::Transport("change channel closed".into()))
    }
}

impl ChangeSource for mpsc::Receiver<FileChanged> {
    async fn next_change(&mut self) -> SyncResult<Option<FileChanged>> {
        Ok(self.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(sequence: u64) -> FileChanged {
        FileChanged {
            sequence,
            old_path: String::new(),
            new_path: "a.txt".into(),
            is_directory: false,
            contents: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_channel_pair_preserves_order() {
        let (mut tx, mut rx) = mpsc::channel(8);
        tx.send_change(change(1)).await.unwrap();
        tx.send_change(change(2)).await.unwrap();
        drop(tx);

        assert_eq!(rx.next_change().await.unwrap().unwrap().sequence, 1);
        assert_eq!(rx.next_change().await.unwrap().unwrap().sequence, 2);
        assert!(rx.next_change().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_fails() {
        let (mut tx, rx) = mpsc::channel::<FileChanged>(1);
        drop(rx);
        assert!(matches!(
            tx.send_change(change(1)).await,
            Err(SyncError::Transport(_))
        ));
    }
}
