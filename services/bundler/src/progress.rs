//! Single-line progress rendering on stderr.

use std::fmt::Display;
use std::io::Write;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Background task redrawing the latest published value
pub struct ProgressRenderer {
    task: JoinHandle<()>,
}

impl ProgressRenderer {
    pub fn spawn<T>(mut rx: watch::Receiver<T>) -> Self
    where
        T: Display + Send + Sync + 'static,
    {
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let line = rx.borrow_and_update().to_string();
                let mut stderr = std::io::stderr().lock();
                let _ = write!(stderr, "\r{line}");
                let _ = stderr.flush();
            }
        });

        Self { task }
    }

    /// Stop rendering and terminate the progress line
    pub fn finish(self) {
        self.task.abort();
        eprintln!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_renderer_stops_on_finish() {
        let (tx, rx) = watch::channel(0u64);
        let renderer = ProgressRenderer::spawn(rx);
        tx.send_replace(5);
        tokio::task::yield_now().await;

        let handle = renderer.task.abort_handle();
        renderer.finish();
        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.is_finished());
    }
}
