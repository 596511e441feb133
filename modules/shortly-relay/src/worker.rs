//! Dispatch and consume loops for one service.

use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::{BoxFuture, Shared};
use sqlx::PgPool;
use tracing::{info, warn};

use shortly_replication::postgres::{PgLinkReplica, PgLookupStore, PgUserReplica};
use shortly_replication::{
    Batch, ChangeConsumer, ChangeMessage, DeadLetterHandler, Disposition, Dispatcher,
    LookupAggregator, LookupFact, LookupNotifier, NoopNotifier, OutboxTable, PgOutbox, Route,
    Service, SyncReport, TopicNotifier,
};

use crate::config::RelayConfig;
use crate::transport::QueueTransport;

pub type Shutdown = Shared<BoxFuture<'static, ()>>;

/// Pause between pulls when a queue came back empty or errored.
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

pub struct Relay {
    config: RelayConfig,
    pool: PgPool,
    transport: QueueTransport,
    notifier: Box<dyn LookupNotifier>,
}

impl Relay {
    pub fn new(config: RelayConfig, pool: PgPool, transport: QueueTransport) -> Self {
        let notifier: Box<dyn LookupNotifier> = match &config.live_analytics_topic {
            Some(topic) => Box::new(TopicNotifier::new(transport.clone(), topic.clone())),
            None => Box::new(NoopNotifier),
        };
        Self {
            config,
            pool,
            transport,
            notifier,
        }
    }

    fn service(&self) -> Service {
        self.config.service
    }

    fn dispatcher(&self, table: OutboxTable) -> Dispatcher<PgOutbox, QueueTransport> {
        Dispatcher::new(PgOutbox::new(self.pool.clone(), table), self.transport.clone())
            .with_batch_limit(self.config.dispatch_batch_limit)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Sweep every outbox the service owns until shutdown.
    pub async fn run_dispatch(&self, shutdown: Shutdown) {
        let outboxes = self.service().outboxes();
        if outboxes.is_empty() {
            info!(service = %self.service(), "Service owns no outbox, nothing to dispatch");
            return;
        }

        let loops = outboxes.iter().map(|table| {
            let shutdown = shutdown.clone();
            async move {
                info!(outbox = table.name(), "Dispatch loop starting");
                self.dispatcher(*table)
                    .run(self.config.dispatch_interval, shutdown)
                    .await;
            }
        });
        futures::future::join_all(loops).await;
    }

    // -----------------------------------------------------------------------
    // Consume
    // -----------------------------------------------------------------------

    /// Consume `queues` (or every queue the service consumes) until shutdown.
    pub async fn run_consume(&self, queues: &[String], shutdown: Shutdown) -> Result<()> {
        let queues: Vec<String> = if queues.is_empty() {
            self.service()
                .consumed_queues()
                .iter()
                .map(|q| q.to_string())
                .collect()
        } else {
            queues.to_vec()
        };

        let mut routed = Vec::with_capacity(queues.len());
        for queue in queues {
            let route = self.service().route(&queue).ok_or_else(|| {
                anyhow!("service {} does not consume queue {queue}", self.service())
            })?;
            routed.push((queue, route));
        }

        let loops = routed
            .iter()
            .map(|(queue, route)| self.consume_loop(queue, *route, shutdown.clone()));
        futures::future::join_all(loops).await;
        Ok(())
    }

    async fn consume_loop(&self, queue: &str, route: Route, shutdown: Shutdown) {
        info!(queue, ?route, "Consume loop starting");

        loop {
            let pulled = tokio::select! {
                _ = shutdown.clone() => break,
                pulled = self.transport.pull(
                    queue,
                    self.config.pull_batch_size,
                    self.config.pull_visibility,
                ) => pulled,
            };

            let batch = match pulled {
                Ok(batch) if !batch.is_empty() => batch,
                Ok(_) => {
                    if idle(&shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(queue, error = %e, "Pull failed");
                    if idle(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let dispositions = self.handle(route, batch).await;
            // Unsettled leases expire and are redelivered.
            if let Err(e) = self.transport.settle(queue, &dispositions).await {
                warn!(queue, error = %e, "Settle failed, leases will expire");
            }
        }

        info!(queue, "Consume loop stopping");
    }

    /// Route one batch to its handler and collect a disposition per message.
    pub async fn handle(&self, route: Route, batch: Batch<serde_json::Value>) -> Vec<Disposition> {
        match route {
            Route::UserReplica { cascade_links } => {
                let (batch, rejected) = batch.decode::<ChangeMessage>();
                let mut target = PgUserReplica::new(self.pool.clone());
                if cascade_links {
                    target = target.cascade_links(OutboxTable::LINKS);
                }
                let report = ChangeConsumer::new(target).sync(&batch).await;
                log_replicated(&batch.queue, &report);

                // Cascaded link records are waiting in the local outbox.
                if cascade_links && report.acked() > 0 {
                    self.dispatch_now(OutboxTable::LINKS).await;
                }
                with_retries(report.dispositions, &rejected)
            }
            Route::LinkReplica => {
                let (batch, rejected) = batch.decode::<ChangeMessage>();
                let consumer = ChangeConsumer::new(PgLinkReplica::new(self.pool.clone()));
                let report = consumer.sync(&batch).await;
                log_replicated(&batch.queue, &report);
                with_retries(report.dispositions, &rejected)
            }
            Route::Lookups => {
                let (batch, rejected) = batch.decode::<LookupFact>();
                let aggregator = LookupAggregator::new(PgLookupStore::new(self.pool.clone()));
                let report = aggregator.process(&batch).await;
                if !report.updates.is_empty() {
                    if let Err(e) = self.notifier.notify(&report.updates).await {
                        warn!(queue = batch.queue.as_str(), error = %e, "Lookup notification failed");
                    }
                }
                with_retries(report.dispositions, &rejected)
            }
            Route::DeadLetter(table) => {
                let (batch, rejected) = batch.decode::<ChangeMessage>();
                let handler = DeadLetterHandler::new(PgOutbox::new(self.pool.clone(), table));
                let mut dispositions = handler.handle(&batch).await;
                // Nothing to correlate; a dead letter is never retried on its own account.
                dispositions.extend(rejected.iter().map(|m| Disposition::ack(&m.id)));
                dispositions
            }
        }
    }

    async fn dispatch_now(&self, table: OutboxTable) {
        match self.dispatcher(table).dispatch().await {
            Ok(report) if report.selected > 0 => {
                info!(outbox = table.name(), %report, "Dispatched after commit")
            }
            Ok(_) => {}
            Err(e) => warn!(outbox = table.name(), error = %e, "Post-commit dispatch failed"),
        }
    }
}

/// Sleep for the idle backoff. Returns true if shutdown fired meanwhile.
async fn idle(shutdown: &Shutdown) -> bool {
    tokio::select! {
        _ = shutdown.clone() => true,
        _ = tokio::time::sleep(IDLE_BACKOFF) => false,
    }
}

fn with_retries(
    mut dispositions: Vec<Disposition>,
    rejected: &[shortly_replication::Message<serde_json::Value>],
) -> Vec<Disposition> {
    dispositions.extend(rejected.iter().map(|m| Disposition::retry(&m.id)));
    dispositions
}

fn log_replicated(queue: &str, report: &SyncReport) {
    if !report.replicated.is_empty() {
        info!(queue, ids = ?report.replicated, "Replicated entities");
    }
}
