use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info, warn};

use riskcore::config::Config;
use riskcore::domain::{RuleConfig, Transaction};
use riskcore::fusion::RiskPipeline;
use riskcore::observability::{init_tracing, MetricsRegistry};
use riskcore::patterns::PatternMatcher;
use riskcore::rules::{CallbackError, FileRuleSource, ReloadCallback, RuleStore};

/// One line of replay input: a transaction plus optional model scores.
#[derive(Debug, Deserialize)]
struct ScoringInput {
    #[serde(flatten)]
    transaction: Transaction,
    #[serde(default)]
    model_scores: Vec<f64>,
}

fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    init_tracing(&config.log_level, config.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting riskcore replay"
    );

    let metrics = Arc::new(MetricsRegistry::new());

    let store = RuleStore::new(FileRuleSource::new(config.rules_path.clone()))
        .with_metrics(Arc::clone(&metrics));
    store
        .reload()
        .with_context(|| format!("loading rules from {}", config.rules_path.display()))?;
    let store = Arc::new(store);

    if let Some(interval) = config.hot_reload_interval() {
        let on_reload: ReloadCallback = Box::new(move |rules: &RuleConfig| {
            info!(version = %rules.version, rules = rules.rules.len(), "Rules reloaded");
            Ok::<(), CallbackError>(())
        });
        store.enable_hot_reload(interval, Some(on_reload))?;
    }

    let matcher = Arc::new(build_matcher(&config)?);

    let pipeline = RiskPipeline::new(Arc::clone(&store), matcher, Arc::clone(&metrics))
        .with_model_version(config.model_version.clone());

    let reader: Box<dyn BufRead> = if config.reads_stdin() {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&config.input)
            .with_context(|| format!("opening input {}", config.input))?;
        Box::new(BufReader::new(file))
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();

    for (index, line) in reader.lines().enumerate() {
        let line = line.context("reading input")?;
        if line.trim().is_empty() {
            continue;
        }

        let input: ScoringInput = match serde_json::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed input line");
                continue;
            }
        };

        match pipeline.score(&input.transaction, &input.model_scores) {
            Ok(record) => {
                serde_json::to_writer(&mut out, &record)?;
                writeln!(out)?;
            }
            Err(e) => {
                warn!(
                    line = index + 1,
                    request_id = %input.transaction.request_id,
                    error = %e,
                    "Skipping invalid transaction"
                );
            }
        }
    }
    out.flush()?;

    store.disable_hot_reload();

    if let Some(e) = store.last_error() {
        error!(error = %e, "Last rule reload failed");
    }

    let snapshot = metrics.snapshot();
    info!(
        decisions = snapshot.decisions_total,
        approve = snapshot.decisions_approve,
        review = snapshot.decisions_review,
        decline = snapshot.decisions_decline,
        reloads = snapshot.rule_reloads_total,
        "Replay complete"
    );

    Ok(())
}

fn build_matcher(config: &Config) -> anyhow::Result<PatternMatcher> {
    let mut matcher = PatternMatcher::new(config.backend);

    match (&config.blacklist_path, &config.whitelist_path) {
        (Some(black), Some(white)) => matcher
            .load_patterns(black, white)
            .context("loading pattern files")?,
        (None, None) => info!("No pattern files configured"),
        _ => anyhow::bail!("blacklist and whitelist paths must be given together"),
    }

    matcher.compile_patterns().context("compiling patterns")?;

    info!(
        backend = matcher.active_backend(),
        patterns = matcher.loaded_patterns().len(),
        "Pattern matcher ready"
    );

    Ok(matcher)
}
