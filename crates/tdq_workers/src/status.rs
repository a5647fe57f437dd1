//! The endpoint a worker serves so the queue can ask what it is working on.

use std::{collections::BTreeSet, io, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tdq_utils::{
    error::{ErrorWorker, ResultLocation},
    here, log_connection_error,
    net_async::{ServerListener, ServerStream},
    net_protocol::{
        self,
        ids::BucketId,
        workers::{CurrentlyProcessingBucketsResponse, WorkerStatusRequest},
    },
    server_shutdown::{ShutdownManager, ShutdownReceiver},
};
use tokio::task::JoinHandle;

/// Buckets this worker has fetched and not yet reported.
#[derive(Debug, Clone, Default)]
pub struct CurrentlyProcessingBuckets {
    bucket_ids: Arc<Mutex<BTreeSet<BucketId>>>,
}

impl CurrentlyProcessingBuckets {
    pub fn insert(&self, bucket_id: BucketId) {
        self.bucket_ids.lock().insert(bucket_id);
    }

    pub fn remove(&self, bucket_id: &BucketId) {
        self.bucket_ids.lock().remove(bucket_id);
    }

    pub fn bucket_ids(&self) -> Vec<BucketId> {
        self.bucket_ids.lock().iter().cloned().collect()
    }
}

pub struct WorkerStatusServer {
    addr: SocketAddr,
    shutdown_manager: ShutdownManager,
    handle: Option<JoinHandle<()>>,
}

impl WorkerStatusServer {
    pub async fn start(
        bind_addr: SocketAddr,
        processing: CurrentlyProcessingBuckets,
    ) -> io::Result<Self> {
        let listener = ServerListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown_manager, shutdown_rx) = ShutdownManager::new_pair();

        let handle = tokio::spawn(serve(listener, processing, shutdown_rx));

        Ok(Self {
            addr,
            shutdown_manager,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        if let Some(handle) = self.handle.take() {
            self.shutdown_manager.shutdown_immediately()?;
            handle
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        Ok(())
    }
}

impl Drop for WorkerStatusServer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.shutdown_manager.shutdown_immediately();
        }
    }
}

async fn serve(
    listener: ServerListener,
    processing: CurrentlyProcessingBuckets,
    mut shutdown: ShutdownReceiver,
) {
    loop {
        let conn = tokio::select! {
            conn = listener.accept() => match conn {
                Ok((conn, _)) => conn,
                Err(e) => {
                    tracing::error!("error accepting status connection: {:?}", e);
                    continue;
                }
            },
            _ = shutdown.recv_shutdown_immediately() => break,
        };

        let processing = processing.clone();
        tokio::spawn(async move {
            if let Err(error) = answer(conn, processing).await {
                log_connection_error!(error, "error answering status request: {}")
            }
        });
    }
}

async fn answer(
    mut conn: ServerStream,
    processing: CurrentlyProcessingBuckets,
) -> Result<(), tdq_utils::error::ConnectionError> {
    let request: WorkerStatusRequest = net_protocol::async_read(&mut conn)
        .await
        .located(here!())
        .no_worker()?;
    match request {
        WorkerStatusRequest::CurrentlyProcessingBuckets => {
            let response = CurrentlyProcessingBucketsResponse {
                bucket_ids: processing.bucket_ids(),
            };
            net_protocol::async_write(&mut conn, &response)
                .await
                .located(here!())
                .no_worker()
        }
    }
}
