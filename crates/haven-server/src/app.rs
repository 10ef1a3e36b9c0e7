//! Startup wiring: one `CoreHandles` bundle built once, no hidden statics.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::sync::{mpsc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::info;

use haven_a2a::A2aState;
use haven_agent::context::{ClockContextProvider, ContextProvider, NotesContextProvider};
use haven_agent::handlers::{llm_callback_handler, script_execution_handler, HandlerDeps};
use haven_agent::openai::OpenAiClient;
use haven_agent::Orchestrator;
use haven_attachments::{AttachmentRegistry, BlobStore};
use haven_automations::tools::register_automation_tools;
use haven_automations::{EventDispatcher, ScheduleAfterHook};
use haven_core::types::Event;
use haven_core::HavenConfig;
use haven_events::indexing::index_document_handler;
use haven_events::webhook::{self, WebhookState};
use haven_events::{DocumentIndexer, EventSource, EventSourceRegistry, HashEmbeddingGenerator, PushSource};
use haven_queue::TaskWorker;
use haven_storage::Db;
use haven_tools::{CompositeToolsProvider, ConfirmingToolsProvider, LocalToolsProvider, RemoteToolsProvider, ToolsProvider};

/// Everything the process holds at runtime.
pub struct CoreHandles {
    pub config: HavenConfig,
    pub db: Db,
    pub attachments: AttachmentRegistry,
    pub tools: Arc<dyn ToolsProvider>,
    pub orchestrator: Arc<Orchestrator>,
    pub worker: Arc<TaskWorker>,
    pub dispatcher: Arc<EventDispatcher>,
    pub sources: Arc<EventSourceRegistry>,
    /// Taken once by main to feed the dispatcher loop.
    pub events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    pub router: Router,
}

pub async fn build(config: HavenConfig) -> anyhow::Result<CoreHandles> {
    // Storage first — everything else sits on it.
    let db = Db::open(&config.database.path)?;
    let store = BlobStore::new(&config.attachments.dir)?;
    let attachments =
        AttachmentRegistry::new(db.clone(), store, config.attachments.base_url.clone());

    // Worker shell (handlers registered below, once the orchestrator exists).
    let mut worker = TaskWorker::new(db.clone(), config.worker.clone());
    let signal = worker.signal();

    // Event dispatcher + the fixed source set.
    let dispatcher = Arc::new(EventDispatcher::new(
        db.clone(),
        signal.clone(),
        config.automations.max_daily_executions,
    ));
    dispatcher.rebuild_index()?;

    let ha_source = PushSource::new("home_assistant");
    let indexing_source = PushSource::new("document_indexing");
    let webhook_source = PushSource::new("webhook");
    let sources = Arc::new(EventSourceRegistry::new(vec![
        ha_source.clone() as Arc<dyn EventSource>,
        indexing_source.clone(),
        webhook_source.clone(),
    ]));
    let (events_tx, events_rx) = mpsc::channel(256);
    sources.start_all(events_tx).await?;

    // Tool surface: local registry + remote servers behind the composite,
    // wrapped by the confirmation gate for the profile-configured set.
    let mut local = LocalToolsProvider::new();
    crate::tools::register_builtin_tools(&mut local, &config)?;
    register_automation_tools(&mut local, dispatcher.clone())?;

    let remote = RemoteToolsProvider::connect(&config.remote_tools).await?;
    let composite: Arc<dyn ToolsProvider> = Arc::new(CompositeToolsProvider::new(vec![
        Arc::new(local),
        Arc::new(remote),
    ]));

    let confirmation_set: HashSet<String> = config
        .profiles
        .values()
        .flat_map(|profile| profile.tools.require_confirmation.iter().cloned())
        .collect();
    let tools: Arc<dyn ToolsProvider> = Arc::new(ConfirmingToolsProvider::new(
        composite,
        confirmation_set,
        std::time::Duration::from_secs(config.orchestrator.confirmation_timeout_secs),
    ));

    // LLM + orchestrator.
    let llm = Arc::new(OpenAiClient::new(
        &config.llm,
        config.orchestrator.llm_timeout_secs,
    ));
    let context_providers: Vec<Arc<dyn ContextProvider>> = vec![
        Arc::new(ClockContextProvider),
        Arc::new(NotesContextProvider::new(db.clone())),
    ];
    let orchestrator = Arc::new(
        Orchestrator::new(
            db.clone(),
            attachments.clone(),
            tools.clone(),
            llm,
            config.clone(),
        )
        .with_context_providers(context_providers),
    );

    // Task handlers + the schedule recurrence hook.
    let deps = Arc::new(HandlerDeps {
        orchestrator: orchestrator.clone(),
        db: db.clone(),
        attachments: attachments.clone(),
        tools: tools.clone(),
        signal: signal.clone(),
        config: config.clone(),
        chat: None,
    });
    worker.register_handler("llm_callback", llm_callback_handler(deps.clone()));
    worker.register_handler("script_execution", script_execution_handler(deps.clone()));

    let indexer = Arc::new(
        DocumentIndexer::new(db.clone(), Arc::new(HashEmbeddingGenerator::new()))
            .with_completion_source(indexing_source.clone()),
    );
    worker.register_handler("index_document", index_document_handler(indexer));

    worker.add_after_hook(Arc::new(ScheduleAfterHook::new(db.clone(), signal.clone())));
    let worker = Arc::new(worker);

    // HTTP surface: A2A + webhooks + health.
    let a2a_state = A2aState::new(db.clone(), orchestrator.clone(), config.clone());
    let webhook_state = WebhookState {
        config: config.webhooks.clone(),
        source: webhook_source,
        db: db.clone(),
    };
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(haven_a2a::router(a2a_state))
        .merge(webhook::router(webhook_state))
        .layer(TraceLayer::new_for_http());

    info!("core handles built");
    Ok(CoreHandles {
        config,
        db,
        attachments,
        tools,
        orchestrator,
        worker,
        dispatcher,
        sources,
        events_rx: Mutex::new(Some(events_rx)),
        router,
    })
}
