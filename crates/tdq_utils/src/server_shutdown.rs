//! Coordinated shutdown of the queue's server loop and background pollers.

use std::io;

use tokio::sync::broadcast;

/// Issues the shutdown signal to every [ShutdownReceiver] it handed out.
pub struct ShutdownManager {
    tx: broadcast::Sender<()>,
    shutdown: bool,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            shutdown: false,
        }
    }
}

impl ShutdownManager {
    pub fn new_pair() -> (Self, ShutdownReceiver) {
        let mut manager = Self::default();
        let receiver = manager.add_receiver();
        (manager, receiver)
    }

    pub fn add_receiver(&mut self) -> ShutdownReceiver {
        ShutdownReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Signals all receivers. Returns the number of receivers that were still listening.
    pub fn shutdown_immediately(&mut self) -> io::Result<usize> {
        if self.shutdown {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "shutdown was already requested",
            ));
        }
        self.shutdown = true;
        self.tx.send(()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "no receivers were listening for shutdown",
            )
        })
    }
}

pub struct ShutdownReceiver {
    rx: broadcast::Receiver<()>,
}

impl ShutdownReceiver {
    /// Resolves once shutdown is requested. Cancel-safe.
    pub async fn recv_shutdown_immediately(&mut self) -> io::Result<()> {
        self.rx
            .recv()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))
    }
}
