//! `docflow` command line: validate definitions, inspect audit runs and instances

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use docflow_audit::{AuditService, MemoryAuditStore, RunId, RunQuery};
use docflow_workflow::{validate, EngineConfig, InstanceId, InstanceStore, JsonFileInstanceStore, WorkflowDefinition};
use std::path::PathBuf;
use std::sync::Arc;

mod logging;

fn cli() -> Command {
    let audit_arg = Arg::new("audit")
        .long("audit")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Audit journal file");
    let json_arg = Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Output as JSON");

    Command::new("docflow")
        .version(docflow_workflow::VERSION)
        .about("Governed document workflows: definitions, audit runs and instances")
        .subcommand_required(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit diagnostics on stderr as JSON lines"),
        )
        .subcommand(
            Command::new("validate")
                .about("Validate a workflow definition (JSON or YAML)")
                .arg(
                    Arg::new("definition")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Definition file"),
                )
                .arg(json_arg.clone()),
        )
        .subcommand(
            Command::new("runs")
                .about("List logged model runs, oldest first")
                .arg(audit_arg.clone())
                .arg(
                    Arg::new("artifact-type")
                        .long("artifact-type")
                        .help("Only runs producing this document type"),
                )
                .arg(
                    Arg::new("correlation")
                        .long("correlation")
                        .help("Only runs with this correlation id"),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(value_parser!(usize))
                        .help("Maximum number of runs"),
                )
                .arg(json_arg.clone()),
        )
        .subcommand(
            Command::new("inputs")
                .about("Show the reconstructed inputs of a run")
                .arg(audit_arg)
                .arg(Arg::new("run-id").required(true).help("Run id"))
                .arg(
                    Arg::new("full")
                        .long("full")
                        .action(ArgAction::SetTrue)
                        .help("Print full input text instead of a preview"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show instance status, or list instances when no id is given")
                .arg(
                    Arg::new("instances")
                        .long("instances")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Instance store directory"),
                )
                .arg(Arg::new("instance-id").help("Instance id"))
                .arg(json_arg),
        )
        .subcommand(
            Command::new("config")
                .about("Check an engine config file and print the effective values")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML config file"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    logging::init(matches.get_flag("log-json"));
    tracing::debug!(command = matches.subcommand_name().unwrap_or_default(), "dispatching");

    match matches.subcommand() {
        Some(("validate", args)) => validate_definition(args),
        Some(("runs", args)) => list_runs(args).await,
        Some(("inputs", args)) => show_inputs(args).await,
        Some(("status", args)) => show_status(args).await,
        Some(("config", args)) => check_config(args),
        Some((other, _)) => bail!("unknown command {other}"),
        None => bail!("no command given"),
    }
}

fn required<'a, T: Clone + Send + Sync + 'static>(args: &'a ArgMatches, name: &str) -> Result<&'a T> {
    args.get_one::<T>(name)
        .with_context(|| format!("missing argument --{name}"))
}

fn validate_definition(args: &ArgMatches) -> Result<()> {
    let path = required::<PathBuf>(args, "definition")?;
    let definition = WorkflowDefinition::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let workflow = validate(definition).with_context(|| format!("{} is invalid", path.display()))?;
    let report = workflow.report();

    if args.get_flag("json") {
        let out = serde_json::json!({
            "workflow_id": report.workflow.workflow_id,
            "version": report.workflow.version,
            "document_types": report.document_types,
            "entity_types": report.entity_types,
            "produce_steps": report.produce_steps,
            "iteration_blocks": report.iteration_blocks,
            "max_scope_depth": report.max_scope_depth,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{} is valid", report.workflow);
        println!("  document types:   {}", report.document_types);
        println!("  entity types:     {}", report.entity_types);
        println!("  produce steps:    {}", report.produce_steps);
        println!("  iteration blocks: {}", report.iteration_blocks);
        println!("  max scope depth:  {}", report.max_scope_depth);
    }
    Ok(())
}

fn open_audit(args: &ArgMatches) -> Result<AuditService> {
    let path = required::<PathBuf>(args, "audit")?;
    if !path.exists() {
        bail!("audit journal {} does not exist", path.display());
    }
    let store = MemoryAuditStore::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    tracing::debug!(path = %path.display(), runs = store.run_count(), "audit journal opened");
    Ok(AuditService::new(Arc::new(store)))
}

async fn list_runs(args: &ArgMatches) -> Result<()> {
    let service = open_audit(args)?;
    let mut query = RunQuery::new();
    if let Some(artifact_type) = args.get_one::<String>("artifact-type") {
        query = query.artifact_type(artifact_type.as_str());
    }
    if let Some(correlation) = args.get_one::<String>("correlation") {
        query = query.correlation(correlation.as_str());
    }
    if let Some(limit) = args.get_one::<usize>("limit") {
        query = query.limit(*limit);
    }
    let runs = service.list_runs(&query).await?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    for run in &runs {
        let tokens = run
            .usage()
            .map_or_else(|| "-".to_string(), |u| format!("{}/{}", u.input_tokens, u.output_tokens));
        let replay = if run.is_replay { " replay" } else { "" };
        println!(
            "{}  {:<9} {:<20} {:<12} tokens {}{}",
            run.id,
            run.status.to_string(),
            run.artifact_type,
            run.role,
            tokens,
            replay
        );
        if let Some(code) = &run.primary_error_code {
            println!("    error {code}: {}", run.primary_error_message.as_deref().unwrap_or(""));
        }
    }
    println!("{} run(s)", runs.len());
    Ok(())
}

async fn show_inputs(args: &ArgMatches) -> Result<()> {
    let service = open_audit(args)?;
    let raw = required::<String>(args, "run-id")?;
    let run_id: RunId = raw.parse().with_context(|| format!("invalid run id {raw}"))?;
    let inputs = service.reconstruct_inputs(run_id).await?;
    let full = args.get_flag("full");

    for entry in &inputs.entries {
        println!("[{}] {} {}", entry.ordinal, entry.kind, entry.content_hash.short());
        if full {
            println!("{}", entry.text);
        } else {
            let preview: String = entry.text.chars().take(120).collect();
            let ellipsis = if preview.len() < entry.text.len() { "..." } else { "" };
            println!("    {}{ellipsis}", preview.replace('\n', " "));
        }
    }
    Ok(())
}

async fn show_status(args: &ArgMatches) -> Result<()> {
    let dir = required::<PathBuf>(args, "instances")?;
    let store = JsonFileInstanceStore::new(dir.clone());

    let Some(raw) = args.get_one::<String>("instance-id") else {
        for id in store.list().await? {
            println!("{id}");
        }
        return Ok(());
    };
    let instance_id: InstanceId = raw.parse().with_context(|| format!("invalid instance id {raw}"))?;
    let instance = store.load(instance_id).await?;
    tracing::debug!(instance_id = %instance_id, revision = instance.revision, "instance loaded");

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&instance)?);
        return Ok(());
    }
    println!(
        "{} {} project={} lifecycle={:?} revision={}",
        instance.instance_id, instance.workflow, instance.project_id, instance.lifecycle, instance.revision
    );
    for scope in instance.scopes() {
        println!("{}", scope.path);
        for state in scope.steps.values() {
            let reason = state
                .failure
                .as_ref()
                .map(|f| format!(" ({f})"))
                .unwrap_or_default();
            println!("  step {:<24} {}{reason}", state.step_id, state.status);
        }
        for doc in scope.documents.values() {
            let stale = if doc.stale { " stale" } else { "" };
            let accepted = doc
                .accepted_by
                .as_deref()
                .map(|role| format!(" accepted by {role}"))
                .unwrap_or_default();
            println!(
                "  doc  {:<24} v{} {}{stale}{accepted}",
                doc.doc_type,
                doc.version,
                doc.content_hash.short()
            );
        }
    }
    Ok(())
}

fn check_config(args: &ArgMatches) -> Result<()> {
    let path = required::<PathBuf>(args, "file")?;
    let config = EngineConfig::load(path).with_context(|| format!("invalid config {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn status_lists_without_an_id() {
        let matches = cli()
            .try_get_matches_from(["docflow", "status", "--instances", "/tmp/instances"])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "status");
        assert!(args.get_one::<String>("instance-id").is_none());
    }

    #[test]
    fn runs_requires_an_audit_file() {
        assert!(cli().try_get_matches_from(["docflow", "runs"]).is_err());
    }
}
