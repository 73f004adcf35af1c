//! Lifecycle coordinator fusing several source servers and one
//! weighted-fair scheduler behind a single [`Server`](crate::Server)
//! contract.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{ConfigError, WeightedFairScheduler};
use crate::api::{Receiver, ServeError, Server};

/// A source server paired with its throughput weight.
pub struct ServerWeight {
    pub server: Arc<dyn Server>,
    pub weight: f64,
}

/// Serves messages from several underlying servers to a single receiver,
/// distributing completions in the ratio of the configured weights.
pub struct MultiServer {
    servers: Vec<Arc<dyn Server>>,
    weights: Vec<f64>,
    concurrency: usize,
    queue_wait_time: Duration,
    scheduler: Mutex<Option<WeightedFairScheduler>>,
}

impl MultiServer {
    /// Creates a coordinator over `server_weights` with at most
    /// `concurrency` concurrent receiver invocations across all sources.
    ///
    /// Fails fast on an empty server list, non-positive weights, or zero
    /// concurrency: callers never observe a half-initialized coordinator.
    pub fn new(concurrency: usize, server_weights: Vec<ServerWeight>) -> Result<Self, ConfigError> {
        if server_weights.is_empty() {
            return Err(ConfigError::NoWeights);
        }
        if concurrency == 0 {
            return Err(ConfigError::NonPositiveConcurrency);
        }

        let mut servers = Vec::with_capacity(server_weights.len());
        let mut weights = Vec::with_capacity(server_weights.len());
        for sw in server_weights {
            if !sw.weight.is_finite() || sw.weight <= 0.0 {
                return Err(ConfigError::NonPositiveWeight);
            }
            servers.push(sw.server);
            weights.push(sw.weight);
        }

        Ok(Self {
            servers,
            weights,
            concurrency,
            queue_wait_time: Duration::from_millis(1),
            scheduler: Mutex::new(None),
        })
    }

    /// Sets the scheduler's dispatch tick period.
    #[must_use]
    pub fn queue_wait_time(mut self, queue_wait_time: Duration) -> Self {
        self.queue_wait_time = queue_wait_time;
        self
    }
}

#[async_trait]
impl Server for MultiServer {
    async fn serve(&self, receiver: Arc<dyn Receiver>) -> Result<(), ServeError> {
        let sched = WeightedFairScheduler::builder(self.weights.clone())
            .max_concurrent(self.concurrency)
            .queue_wait_time(self.queue_wait_time)
            .build(receiver)?;
        *self.scheduler.lock().unwrap() = Some(sched.clone());

        let mut workers = JoinSet::new();
        for (priority, server) in self.servers.iter().enumerate() {
            let server = server.clone();
            let by_priority: Arc<dyn Receiver> = Arc::new(sched.with_priority_receiver(priority));
            workers.spawn(async move { server.serve(by_priority).await });
        }

        let mut first: Option<ServeError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "source server task failed");
                    continue;
                }
            };
            if let Err(e) = result {
                first.get_or_insert(e);
            }
        }

        Err(first.unwrap_or(ServeError::Closed))
    }

    async fn shutdown(&self, deadline: CancellationToken) -> Result<(), ServeError> {
        let mut shutdowns = JoinSet::new();
        for server in &self.servers {
            let server = server.clone();
            let deadline = deadline.clone();
            shutdowns.spawn(async move { server.shutdown(deadline).await });
        }

        // A clean source shutdown reports Closed; anything else is a real
        // failure worth surfacing over it.
        let mut failure: Option<ServeError> = None;
        while let Some(joined) = shutdowns.join_next().await {
            match joined {
                Ok(Err(ServeError::Closed)) | Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    warn!(error = %e, "source shutdown task failed");
                }
            }
        }

        let sched = self.scheduler.lock().unwrap().take();
        if let Some(sched) = sched {
            sched.close(deadline).await?;
        }

        match failure {
            Some(e) => Err(e),
            None => Err(ServeError::Closed),
        }
    }
}
