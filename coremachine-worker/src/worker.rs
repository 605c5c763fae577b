use std::sync::Arc;
use std::time;

use coremachine_core::CoreMachine;
use health::HealthHandle;
use tracing::error;

/// A pool of identical consumer loops over the job and task queues. Each
/// loop handles one message at a time; parallelism comes from loop
/// multiplicity. Contention on a single (job, stage) is serialized by the
/// database's advisory locks, so no queue affinity is needed here.
pub struct MachineWorker {
    machine: Arc<CoreMachine>,
    poll_interval: time::Duration,
    concurrency: usize,
    liveness: HealthHandle,
}

impl MachineWorker {
    pub fn new(
        machine: Arc<CoreMachine>,
        poll_interval: time::Duration,
        concurrency: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            machine,
            poll_interval,
            concurrency,
            liveness,
        }
    }

    /// Run the consumer loops forever.
    pub async fn run(&self) {
        for worker_index in 0..self.concurrency {
            let machine = self.machine.clone();
            let poll_interval = self.poll_interval;
            tokio::spawn(async move {
                consumer_loop(machine, poll_interval, worker_index).await;
            });
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            self.liveness.report_healthy();

            let depth = self
                .machine
                .task_queue()
                .depth()
                .await
                .unwrap_or_default();
            metrics::gauge!("coremachine_task_queue_depth").set(depth as f64);
        }
    }
}

/// One consumer: alternate between the two queues, backing off to the poll
/// interval only when both are empty. Message-level failures are settled
/// inside the machine (retry, dead-letter); errors surfacing here are
/// broker-level and only logged, the lease backoff redelivers.
async fn consumer_loop(
    machine: Arc<CoreMachine>,
    poll_interval: time::Duration,
    worker_index: usize,
) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        let handled_job = match machine.process_job_queue().await {
            Ok(handled) => handled,
            Err(e) => {
                error!("worker {} failed to process job message: {}", worker_index, e);
                false
            }
        };

        let handled_task = match machine.process_task_queue().await {
            Ok(handled) => handled,
            Err(e) => {
                error!("worker {} failed to process task message: {}", worker_index, e);
                false
            }
        };

        if !handled_job && !handled_task {
            interval.tick().await;
        }
    }
}
