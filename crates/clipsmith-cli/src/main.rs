//! Clipsmith: cut short clips out of long-form transcripts with an ensemble
//! of language models.

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use clipsmith_cache::{ResultCache, ResultStore, SqliteStore};
use clipsmith_core::{
    DataPaths, ModelResolver, PipelineConfig, PrinciplesSnapshot, ProviderKind, ResolvedModels,
    Transcript,
};
use clipsmith_gateway::{HttpProvider, ModelProvider};
use clipsmith_runtime::{
    compounded_false_negative_rate, dry_run_provider, simulate_gate_chain, Pipeline,
};

const SIMULATION_TRIALS: usize = 100_000;

fn print_help() {
    println!("Clipsmith - ensemble clip pipeline");
    println!();
    println!("Usage: clipsmith <command>");
    println!();
    println!("Commands:");
    println!("  run <transcript.json> [config.json]   Run the pipeline and write a report");
    println!("  check-config <config.json>            Validate a config and resolve models");
    println!("  cache-stats [config.json]             Show cached entries per stage");
    println!("  cache-clear [config.json]             Drop every cached result");
    println!("  gate-math <p> <k> [correlation]       False-negative rate of k gates");
    println!("  help                                  Show this help message");
    println!();
    println!("Providers of kind \"scripted\" answer offline (dry run).");
}

/// Config from `path`, or the defaults with one offline provider.
fn load_config(path: Option<&str>) -> anyhow::Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(Path::new(path))?,
        None => {
            info!("No config given, using a single offline provider");
            serde_json::from_value(serde_json::json!({
                "providers": [{"id": "dry-run", "kind": "scripted"}]
            }))?
        }
    };
    config.apply_env();
    Ok(config)
}

fn open_cache(paths: &DataPaths) -> anyhow::Result<SqliteStore> {
    SqliteStore::open(&paths.cache_db)
        .map_err(|e| anyhow::anyhow!("Failed to open cache: {}", e))
}

fn build_providers(
    config: &PipelineConfig,
    models: &ResolvedModels,
) -> anyhow::Result<Vec<Arc<dyn ModelProvider>>> {
    let client = reqwest::Client::new();
    let mut providers: Vec<Arc<dyn ModelProvider>> = Vec::new();
    for spec in &config.providers {
        if spec.kind == ProviderKind::Scripted {
            providers.push(Arc::new(dry_run_provider(spec.id.clone())));
            continue;
        }
        let model = models
            .model_for(&spec.id)
            .ok_or_else(|| anyhow::anyhow!("No model resolved for provider '{}'", spec.id))?;
        let Some(key_var) = spec.kind.api_key_env() else {
            anyhow::bail!("Provider '{}' has no API key variable", spec.id);
        };
        let api_key = std::env::var(key_var).map_err(|_| {
            anyhow::anyhow!("Provider '{}' needs {} to be set", spec.id, key_var)
        })?;
        providers.push(Arc::new(HttpProvider::new(
            client.clone(),
            spec.id.clone(),
            spec.kind,
            model,
            api_key,
        )));
    }
    Ok(providers)
}

async fn run(transcript_path: &str, config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    let paths = DataPaths::new(&config.data_dir)?;
    info!("Data directory: {}", paths.root.display());

    let transcript = Transcript::load(Path::new(transcript_path))?;
    let principles = PrinciplesSnapshot::load(&paths.principles_file)?;
    let models = ModelResolver::new(Some(paths.models_file.clone())).resolve_all(&config.providers)?;
    for (id, model) in &models.models {
        info!("Provider {} -> {}", id, model);
    }

    let providers = build_providers(&config, &models)?;
    let store = open_cache(&paths)?;
    match store.purge_expired() {
        Ok(0) => {}
        Ok(n) => info!("Purged {} expired cache entries", n),
        Err(e) => tracing::warn!("Cache purge failed: {}", e),
    }
    let cache = Arc::new(ResultCache::new(Arc::new(store), config.cache_ttl()));

    let pipeline = Pipeline::builder(config)
        .providers(providers)
        .cache(cache)
        .principles(principles)
        .models(models)
        .build()?;
    let report = pipeline.run(transcript).await?;
    let path = report.write_to(&paths.reports)?;

    println!("{}", report.summary_line());
    for item in &report.accepted {
        println!(
            "  {}  {}  gate={:.1}",
            item.id(),
            item.span(),
            item.score(clipsmith_runtime::GATE_SCORE).unwrap_or_default()
        );
    }
    println!("Report: {}", path.display());
    Ok(())
}

fn check_config(path: &str) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    config.validate()?;
    let paths = DataPaths::new(&config.data_dir)?;
    let models = ModelResolver::new(Some(paths.models_file)).resolve_all(&config.providers)?;
    println!("Config OK: {} providers", config.providers.len());
    for spec in &config.providers {
        let stages = if spec.stages.is_empty() {
            "all stages".to_string()
        } else {
            spec.stages.join(", ")
        };
        println!(
            "  {:<12} {:<10} {:<32} {}",
            spec.id,
            spec.kind.as_str(),
            models.model_for(&spec.id).unwrap_or("?"),
            stages
        );
    }
    Ok(())
}

fn cache_stats(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let paths = DataPaths::new(&config.data_dir)?;
    let store = open_cache(&paths)?;
    let entries = store.entries_by_stage()?;
    println!("Cache: {}", store.path().display());
    if entries.is_empty() {
        println!("  (empty)");
    }
    for (stage, count) in entries {
        println!("  {:<20} {}", stage, count);
    }
    Ok(())
}

fn cache_clear(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let paths = DataPaths::new(&config.data_dir)?;
    let removed = open_cache(&paths)?.clear()?;
    println!("Removed {} cache entries", removed);
    Ok(())
}

fn gate_math(p: &str, k: &str, correlation: Option<&str>) -> anyhow::Result<()> {
    let p: f64 = p.parse()?;
    let k: u32 = k.parse()?;
    let correlation: f64 = correlation.map(str::parse::<f64>).transpose()?.unwrap_or(0.0);
    let sim = simulate_gate_chain(p, k, correlation, SIMULATION_TRIALS, 0x5eed);
    println!(
        "{} gates at p={}: independent model loses {:.2}% of good items",
        k,
        p,
        compounded_false_negative_rate(p, k) * 100.0
    );
    println!(
        "simulation ({} trials, correlation {}): {:.2}%",
        sim.trials,
        correlation,
        sim.rate * 100.0
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let arg = |i: usize| args.get(i).map(String::as_str);

    match arg(1) {
        Some("run") => {
            let Some(transcript) = arg(2) else {
                eprintln!("Usage: clipsmith run <transcript.json> [config.json]");
                std::process::exit(1);
            };
            run(transcript, arg(3)).await
        }
        Some("check-config") => {
            let Some(path) = arg(2) else {
                eprintln!("Usage: clipsmith check-config <config.json>");
                std::process::exit(1);
            };
            check_config(path)
        }
        Some("cache-stats") => cache_stats(arg(2)),
        Some("cache-clear") => cache_clear(arg(2)),
        Some("gate-math") => {
            let (Some(p), Some(k)) = (arg(2), arg(3)) else {
                eprintln!("Usage: clipsmith gate-math <p> <k> [correlation]");
                std::process::exit(1);
            };
            gate_math(p, k, arg(4))
        }
        Some("help" | "--help" | "-h") | None => {
            print_help();
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {}. Use 'clipsmith help' for usage.", other);
            std::process::exit(1);
        }
    }
}
