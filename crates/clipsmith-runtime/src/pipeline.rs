//! Pipeline assembly and the top-level run: discovery, then the ordered
//! stages, then the report.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use clipsmith_cache::ResultCache;
use clipsmith_consensus::{ConsensusEngine, QuorumSettings};
use clipsmith_core::{
    stages, Error, PipelineConfig, PrinciplesSnapshot, ResolvedModels, Result, Transcript,
};
use clipsmith_gateway::{BudgetTracker, GatewaySettings, ModelGateway, ModelProvider};

use crate::discovery::Discovery;
use crate::gate;
use crate::orchestrator::Orchestrator;
use crate::report::PipelineReport;
use crate::stage::{RunContext, Stage};
use crate::stages::standard_stages;

pub struct PipelineBuilder {
    config: PipelineConfig,
    providers: Vec<Arc<dyn ModelProvider>>,
    cache: Option<Arc<ResultCache>>,
    principles: PrinciplesSnapshot,
    models: Option<ResolvedModels>,
    stages: Option<Vec<Arc<dyn Stage>>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            cache: None,
            principles: PrinciplesSnapshot::empty(),
            models: None,
            stages: None,
        }
    }

    /// Register a provider instance; matched to its config entry by id.
    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn providers(mut self, providers: impl IntoIterator<Item = Arc<dyn ModelProvider>>) -> Self {
        self.providers.extend(providers);
        self
    }

    /// Defaults to an in-memory cache with the configured TTL.
    pub fn cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn principles(mut self, principles: PrinciplesSnapshot) -> Self {
        self.principles = principles;
        self
    }

    /// Defaults to whatever model each provider instance reports.
    pub fn models(mut self, models: ResolvedModels) -> Self {
        self.models = Some(models);
        self
    }

    /// Replace the standard stage list.
    pub fn stages(mut self, stages: Vec<Arc<dyn Stage>>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let by_id: BTreeMap<&str, &Arc<dyn ModelProvider>> =
            self.providers.iter().map(|p| (p.id(), p)).collect();
        for spec in &self.config.providers {
            if !by_id.contains_key(spec.id.as_str()) {
                return Err(Error::Config(format!(
                    "provider '{}' is configured but has no instance",
                    spec.id
                )));
            }
        }

        let stage_list = match self.stages {
            Some(stages) => stages,
            None => standard_stages(&self.config),
        };
        let orchestrator = Orchestrator::new(stage_list)?;

        let mut per_stage: BTreeMap<String, Vec<Arc<dyn ModelProvider>>> = BTreeMap::new();
        let stage_names = std::iter::once(stages::DISCOVER.to_string())
            .chain(orchestrator.stages().iter().map(|s| s.id().to_string()));
        for name in stage_names {
            let members: Vec<Arc<dyn ModelProvider>> = self
                .config
                .providers_for(&name)
                .into_iter()
                .filter_map(|spec| by_id.get(spec.id.as_str()).map(|p| Arc::clone(p)))
                .collect();
            per_stage.insert(name, members);
        }

        let fallback = self
            .config
            .fallback_provider
            .as_deref()
            .and_then(|id| by_id.get(id).map(|p| Arc::clone(p)));

        let models = self.models.unwrap_or_else(|| ResolvedModels {
            models: self
                .providers
                .iter()
                .map(|p| (p.id().to_string(), p.model().to_string()))
                .collect(),
            resolved_at: Utc::now(),
        });

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(ResultCache::in_memory(self.config.cache_ttl())));
        let budget = Arc::new(BudgetTracker::new(self.config.budget_cap_usd));
        let gateway = Arc::new(ModelGateway::new(
            budget,
            GatewaySettings::from_config(&self.config),
        ));
        let engine = Arc::new(ConsensusEngine::new(
            gateway,
            cache,
            QuorumSettings {
                min_quorum: self.config.min_quorum,
                policy: self.config.quorum_policy,
                fallback,
            },
        ));

        info!(
            "Pipeline ready: {} providers, stages [{}]",
            self.providers.len(),
            orchestrator
                .stages()
                .iter()
                .map(|s| s.id().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Pipeline {
            discovery: Discovery::new(&self.config),
            config: Arc::new(self.config),
            principles: Arc::new(self.principles),
            models: Arc::new(models),
            engine,
            providers: per_stage,
            orchestrator,
        })
    }
}

/// A configured pipeline. Runs one transcript at a time; the budget is
/// reset at the start of each run.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    principles: Arc<PrinciplesSnapshot>,
    models: Arc<ResolvedModels>,
    engine: Arc<ConsensusEngine>,
    providers: BTreeMap<String, Vec<Arc<dyn ModelProvider>>>,
    discovery: Discovery,
    orchestrator: Orchestrator,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ConsensusEngine> {
        &self.engine
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        self.engine.gateway().budget()
    }

    pub fn stage_ids(&self) -> Vec<String> {
        std::iter::once(self.discovery.id().to_string())
            .chain(self.orchestrator.stages().iter().map(|s| s.id().to_string()))
            .collect()
    }

    /// Process one transcript end to end.
    pub async fn run(&self, transcript: Transcript) -> Result<PipelineReport> {
        if transcript.is_empty() {
            return Err(Error::Config(format!(
                "transcript '{}' has no segments",
                transcript.source_id
            )));
        }
        self.budget().reset();
        let started_at = Utc::now();
        let ctx = RunContext::new(
            Arc::clone(&self.config),
            Arc::new(transcript),
            Arc::clone(&self.principles),
            Arc::clone(&self.models),
            Arc::clone(&self.engine),
            self.providers.clone(),
        );
        info!(
            "Run {} started for '{}' ({:.1}s of transcript, principles {})",
            ctx.run_id,
            ctx.transcript.source_id,
            ctx.transcript.duration(),
            ctx.principles.digest()
        );

        let (mut items, discovery_summary) = self.discovery.run(&ctx).await;
        if items.is_empty() {
            warn!("Run {}: discovery produced no candidates", ctx.run_id);
        }
        let mut summaries = vec![discovery_summary];
        summaries.extend(self.orchestrator.run(&mut items, &ctx).await);

        let gates = self
            .orchestrator
            .stages()
            .iter()
            .filter(|s| s.traits().is_gate)
            .count();
        let [accepted, rejected, discarded, ungated] = PipelineReport::partition(items);
        let report = PipelineReport {
            run_id: ctx.run_id,
            source_id: ctx.transcript.source_id.clone(),
            started_at,
            finished_at: Utc::now(),
            principles_digest: ctx.principles.digest().to_string(),
            models: (*self.models).clone(),
            accepted,
            rejected,
            discarded,
            ungated,
            stages: summaries,
            budget: self.budget().report(),
            cache: self.engine.cache().metrics().snapshot(),
            gate: gate::analysis(gates),
        };
        info!("Run {} finished: {}", report.run_id, report.summary_line());
        Ok(report)
    }
}
