use super::args::{Cli, Command};
use anyhow::{bail, Context};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracefold_core::{ClaimScheduler, Ingestor, NoopRequester, ProcessingConfig, Store};

pub fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => ProcessingConfig::from_yaml_file(path)?,
        None => ProcessingConfig::from_env(),
    };
    if let Some(db) = &cli.db {
        config = config.with_database_path(db);
    }
    config.validate()?;

    let store = open_store(config.database_path.as_deref())?;
    // Passes are driven explicitly by `process`.
    let requester = Arc::new(NoopRequester);
    let ingestor = Ingestor::new(store.clone(), requester.clone());
    let now = chrono::Utc::now();

    match cli.cmd {
        Command::Ingest {
            collection,
            payload,
        } => {
            let bytes = std::fs::read(&payload)
                .with_context(|| format!("failed to read {}", payload.display()))?;
            let decoded = ingestor.submit_spans(&collection, &bytes)?;
            println!("decoded {} spans", decoded);
        }
        Command::Score {
            collection,
            run,
            name,
            value,
        } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            ingestor.submit_score(&collection, &run, &name, value, now)?;
        }
        Command::Metadata {
            collection,
            run,
            json,
        } => {
            ingestor.submit_metadata(&collection, &run, parse_object(&json)?, now)?;
        }
        Command::Group {
            collection,
            run,
            group,
            json,
        } => {
            ingestor.submit_transcript_group_metadata(&collection, &run, &group, parse_object(&json)?, now)?;
        }
        Command::Transcript {
            collection,
            run,
            transcript,
            json,
        } => {
            ingestor.submit_transcript_metadata(&collection, &run, &transcript, parse_object(&json)?, now)?;
        }
        Command::Process { collection } => {
            let scheduler = ClaimScheduler::with_lease(store.clone(), requester, config);
            let reports = scheduler.drain(&collection)?;
            for (i, report) in reports.iter().enumerate() {
                println!("pass {}: {}", i + 1, serde_json::to_string(report)?);
            }
            if store.has_remaining_work(&collection)? {
                println!("work remains; run `process` again");
            }
        }
        Command::Status { collection } => {
            for status in store.list_run_statuses(&collection)? {
                println!(
                    "{}\t{}\tv{}/{}\terrors={}",
                    status.run_id,
                    status.status.as_str(),
                    status.processed_version,
                    status.current_version,
                    status.error_count
                );
                if let Some(last) = status.error_history.last() {
                    println!("\tlast error: {}", last.message);
                }
            }
        }
        Command::Show { run } => match store.load_agent_run(&run)? {
            Some(run) => println!("{}", serde_json::to_string_pretty(&run)?),
            None => bail!("run {} has not been reconstructed", run),
        },
    }
    Ok(())
}

fn open_store(path: Option<&Path>) -> anyhow::Result<Store> {
    match path {
        Some(path) => Store::open(path).with_context(|| format!("failed to open {}", path.display())),
        None => {
            tracing::warn!("no database configured; using an in-memory store");
            Ok(Store::memory()?)
        }
    }
}

fn parse_object(raw: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("expected a JSON object")? {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, got {}", other),
    }
}
