//! Shared application state and bootstrap.
//!
//! [`AppState`] aggregates every service behind `Arc`s; it is cheap to
//! clone and handed to the turn driver, handlers, and the facade.

use std::sync::Arc;

use butler_conversations::ConversationStore;
use butler_domain::config::Config;
use butler_executor::Executor;
use butler_knowledge::{Ingestor, KnowledgeStore, RetrievalOrchestrator};
use butler_llm::{DisplaySanitizer, EmbeddingClient, LlmClient, MockEmbedder, RateLimited};
use butler_store::{TaskStore, UsageStore, WorkflowStore};
use butler_tools::builtins::builtin_registry;
use butler_tools::{Dispatcher, ToolRegistry};
use butler_triggers::{LoadProbe, TriggerService};

use crate::bus::EventBus;
use crate::handlers::{KindRouter, LlmConditionEvaluator};

/// Shared application state passed to all runtime components.
///
/// Fields are grouped by concern:
/// - **Core services** — config, LLM client, tool dispatch
/// - **Stores** — tasks, workflows, conversations, usage, knowledge
/// - **Orchestration** — executor, triggers, retrieval, event bus
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmClient>,
    pub dispatcher: Arc<Dispatcher>,
    /// Per-tool leak patterns, compiled once at startup.
    pub sanitizer: Arc<DisplaySanitizer>,

    // ── Stores ────────────────────────────────────────────────────────
    pub tasks: Arc<TaskStore>,
    pub workflows: Arc<WorkflowStore>,
    pub conversations: Arc<ConversationStore>,
    pub usage: Arc<UsageStore>,
    pub knowledge: Arc<KnowledgeStore>,

    // ── Orchestration ─────────────────────────────────────────────────
    pub executor: Arc<Executor>,
    pub triggers: Arc<TriggerService>,
    pub retrieval: Arc<RetrievalOrchestrator>,
    pub ingestor: Arc<Ingestor>,
    pub bus: Arc<EventBus>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Executor-backed load signal for the trigger service.
struct ExecutorLoad(Arc<Executor>);

impl LoadProbe for ExecutorLoad {
    fn is_backpressured(&self) -> bool {
        self.0.is_backpressured()
    }
}

/// Bootstrap builder. The LLM client is the only mandatory collaborator;
/// everything else has a working default (in-memory stores, mock
/// embedder, built-in tool registry).
pub struct AppStateBuilder {
    config: Config,
    llm: Option<Arc<dyn LlmClient>>,
    embedder: Option<Arc<dyn EmbeddingClient>>,
    registry: Option<ToolRegistry>,
    persistent: bool,
}

impl AppStateBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            llm: None,
            embedder: None,
            registry: None,
            persistent: false,
        }
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingClient>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Snapshot state to `config.state_dir` instead of staying in memory.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn build(self) -> butler_domain::Result<AppState> {
        let config = Arc::new(self.config);

        let llm_inner = self
            .llm
            .ok_or_else(|| butler_domain::Error::Validation("no LLM client configured".into()))?;
        let llm: Arc<dyn LlmClient> = Arc::new(RateLimited::new(
            llm_inner,
            config.llm.max_concurrent_requests,
        ));
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(MockEmbedder::default()));

        let registry = match self.registry {
            Some(registry) => registry,
            None => builtin_registry()?.build(),
        };
        let sanitizer = Arc::new(DisplaySanitizer::new(&registry.names()));
        let dispatcher = Arc::new(Dispatcher::new(registry));

        let (tasks, workflows, conversations, usage, knowledge) = if self.persistent {
            let dir = &config.state_dir;
            (
                Arc::new(TaskStore::with_persistence(dir)),
                Arc::new(WorkflowStore::with_persistence(dir)),
                Arc::new(ConversationStore::with_persistence(dir)),
                Arc::new(UsageStore::with_persistence(dir)),
                Arc::new(KnowledgeStore::with_persistence(dir)),
            )
        } else {
            (
                Arc::new(TaskStore::new()),
                Arc::new(WorkflowStore::new()),
                Arc::new(ConversationStore::new()),
                Arc::new(UsageStore::new()),
                Arc::new(KnowledgeStore::new()),
            )
        };

        let retrieval = Arc::new(RetrievalOrchestrator::new(
            Arc::clone(&knowledge),
            Arc::clone(&embedder),
            config.retrieval.clone(),
        ));
        let ingestor = Arc::new(Ingestor::new(Arc::clone(&knowledge), embedder));
        let bus = Arc::new(EventBus::new());

        let handler = Arc::new(KindRouter {
            llm: Arc::clone(&llm),
            dispatcher: Arc::clone(&dispatcher),
            retrieval: Arc::clone(&retrieval),
            usage: Arc::clone(&usage),
            bus: Arc::clone(&bus),
            config: Arc::clone(&config),
        });
        let evaluator = Arc::new(LlmConditionEvaluator {
            llm: Arc::clone(&llm),
            usage: Arc::clone(&usage),
            model: config.llm.model.clone(),
        });
        let executor = Executor::new(
            Arc::clone(&tasks),
            handler,
            evaluator,
            config.executor.clone(),
        );

        let triggers = if self.persistent {
            Arc::new(TriggerService::with_persistence(
                Arc::clone(&tasks),
                Arc::new(ExecutorLoad(Arc::clone(&executor))),
                config.triggers.clone(),
                &config.state_dir,
            ))
        } else {
            Arc::new(TriggerService::new(
                Arc::clone(&tasks),
                Arc::new(ExecutorLoad(Arc::clone(&executor))),
                config.triggers.clone(),
            ))
        };

        Ok(AppState {
            config,
            llm,
            dispatcher,
            sanitizer,
            tasks,
            workflows,
            conversations,
            usage,
            knowledge,
            executor,
            triggers,
            retrieval,
            ingestor,
            bus,
        })
    }
}

impl AppState {
    /// Persist every snapshot-backed store. No-op for in-memory state.
    pub fn save_all(&self) -> butler_domain::Result<()> {
        self.tasks.save()?;
        self.workflows.save()?;
        self.conversations.save()?;
        self.usage.save()?;
        self.knowledge.save()?;
        self.triggers.save()?;
        Ok(())
    }
}
