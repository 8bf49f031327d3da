//! Application state shared by all handlers

use std::sync::Arc;

use openem_ingestor::{
    BroadcastNotifier, Config, FanoutNotifier, LoggingNotifier, Orchestrator, ProgressNotifier,
    QueueOptions, Result, TaskEvent, TaskQueue, TaskRunner,
};
use tokio::sync::broadcast;

/// Capacity of the event channel feeding `/events` subscribers
pub const EVENT_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<TaskQueue>,
    pub orchestrator: Arc<Orchestrator>,
    events: BroadcastNotifier,
}

impl AppState {
    /// Build the state with the real SciCat, broker and Globus clients
    pub fn from_config(config: Config) -> Result<Self> {
        Self::build(config, Orchestrator::from_config)
    }

    /// Build the state around an orchestrator produced by `make_orchestrator`
    ///
    /// The orchestrator and the queue share one notifier that writes every
    /// event to the log and publishes it on the event channel.
    pub fn build<F>(config: Config, make_orchestrator: F) -> Result<Self>
    where
        F: FnOnce(&Config, Arc<dyn ProgressNotifier>) -> Result<Orchestrator>,
    {
        let events = BroadcastNotifier::new(EVENT_CAPACITY);
        let notifier: Arc<dyn ProgressNotifier> = Arc::new(FanoutNotifier::new(vec![
            Arc::new(LoggingNotifier),
            Arc::new(events.clone()),
        ]));

        let orchestrator = Arc::new(make_orchestrator(&config, notifier.clone())?);
        let runner: Arc<dyn TaskRunner> = orchestrator.clone();
        let queue = TaskQueue::start(QueueOptions::from(&config.transfer), runner, notifier);

        Ok(Self {
            config: Arc::new(config),
            queue,
            orchestrator,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }
}
