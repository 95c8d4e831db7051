use clap::parser::ValueSource;
use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use pacs_select::config::toml_config::{default_config_toml, load_config, load_config_or_default};
use pacs_select::config::Config;
use pacs_select::{
    FindscuBackend, InputRow, QueryBackend, QueryPlanner, ReplayBackend, RuleSet, RunLedger,
    RunOrchestrator,
};
use std::path::PathBuf;
use std::process;

#[tokio::main]
async fn main() {
    let matches = Command::new("pacs-select")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Selects studies from a PACS and compiles the anonymizer filter script")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/pacs-select.toml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("rules")
                .short('r')
                .long("rules")
                .value_name("FILE")
                .help("Filter rule set (YAML or JSON), overrides [rules] path")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-rules")
                .long("test-rules")
                .help("Validate the rule set and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("compile")
                .long("compile")
                .help("Print the compiled filter script and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("readable")
                .long("readable")
                .help("With --compile, print the script as AND/OR text")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_name("FILE")
                .help("Input rows (JSON or YAML list)")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("plan-only")
                .long("plan-only")
                .help("Print the planned queries without contacting the PACS")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("replay")
                .long("replay")
                .value_name("FILE")
                .help("Answer queries from recorded responses instead of findscu")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("DIR")
                .help("Directory for run artifacts, overrides [ledger] output_dir")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    // Gated by the global max level, which the config may change later.
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Trace)
        .init();
    log::set_max_level(log_level);

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config = load_configuration(&matches);

    if !verbose {
        if let Some(level) = config.log_level().and_then(|level| level.parse::<LevelFilter>().ok()) {
            log::set_max_level(level);
        }
    }

    let rules = load_rules(&matches, &config);

    if matches.get_flag("test-rules") {
        println!("✅ Rule set is valid");
        println!("  General rules: {}", rules.general.len());
        for (modality, bucket) in &rules.modality_filters {
            println!("  {modality} rules: {}", bucket.len());
        }
        if !rules.modality_filtering {
            println!("  Modality filtering is disabled");
        }
        return;
    }

    if matches.get_flag("compile") {
        match pacs_select::compile(&rules) {
            Ok(script) if matches.get_flag("readable") => println!("{}", script.readable()),
            Ok(script) => println!("{script}"),
            Err(e) => {
                eprintln!("❌ {e}");
                process::exit(1);
            }
        }
        return;
    }

    let Some(rows_path) = matches.get_one::<String>("rows") else {
        eprintln!("Error: --rows is required unless --compile, --test-rules or --generate-config is given");
        process::exit(2);
    };
    let rows = match InputRow::load_all(rows_path) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("Error loading input rows: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("plan-only") {
        print_plan(&config, &rows);
        return;
    }

    let output_dir = matches
        .get_one::<String>("output")
        .cloned()
        .unwrap_or_else(|| config.ledger.output_dir.clone());

    let outcome = if let Some(replay_path) = matches.get_one::<String>("replay") {
        match ReplayBackend::from_file(replay_path) {
            Ok(backend) => execute_run(&config, backend, &rules, &rows, &output_dir).await,
            Err(e) => Err(e),
        }
    } else {
        let backend = FindscuBackend::new(
            &config.backend.findscu_path,
            &config.backend.host,
            config.backend.port,
        )
        .with_ae_titles(&config.backend.calling_aet, &config.backend.called_aet)
        .with_dictionary(config.backend.dictionary_path.as_ref().map(PathBuf::from))
        .with_timeout(config.backend.timeout_seconds);
        execute_run(&config, backend, &rules, &rows, &output_dir).await
    };

    if let Err(e) = outcome {
        log::error!("Run failed: {e:#}");
        process::exit(1);
    }
}

fn load_configuration(matches: &ArgMatches) -> Config {
    let Some(path) = matches.get_one::<String>("config") else {
        return Config::default();
    };

    let loaded = if matches.value_source("config") == Some(ValueSource::DefaultValue) {
        load_config_or_default(path)
    } else {
        load_config(path)
    };

    match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    }
}

fn load_rules(matches: &ArgMatches, config: &Config) -> RuleSet {
    let path = matches
        .get_one::<String>("rules")
        .cloned()
        .or_else(|| config.rules.path.clone());

    let Some(path) = path else {
        log::warn!("No rule set configured, every instance will pass the rule filter");
        return RuleSet::new();
    };

    match RuleSet::from_file(&path) {
        Ok(rules) => {
            log::info!("Loaded rule set from {path}");
            rules
        }
        Err(e) => {
            eprintln!("❌ Rule set validation failed: {e:#}");
            process::exit(1);
        }
    }
}

fn generate_default_config(path: &str) {
    let written = default_config_toml().and_then(|toml| {
        std::fs::write(path, toml).map_err(anyhow::Error::from)
    });
    match written {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn print_plan(config: &Config, rows: &[InputRow]) {
    let planner = match QueryPlanner::new(config.query.mode, config.query.date_window_days) {
        Ok(planner) => planner.with_return_tags(config.query.return_tags.iter().cloned()),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    let plan = planner.plan(rows);

    for spec in &plan.specs {
        let constraints: Vec<String> = spec
            .rendered_constraints()
            .into_iter()
            .map(|(tag, value)| format!("{tag}={value}"))
            .collect();
        println!(
            "Row {}: {} -> {}",
            spec.row_index,
            constraints.join(" "),
            spec.return_tags.join(",")
        );
    }
    for failure in &plan.failures {
        println!("Row {}: not queried ({})", failure.row_index, failure.error);
    }
    if let Some(selection) = plan.selection_filter() {
        println!();
        println!("Selection filter: {}", selection.readable());
    }
}

async fn execute_run<B: QueryBackend>(
    config: &Config,
    backend: B,
    rules: &RuleSet,
    rows: &[InputRow],
    output_dir: &str,
) -> anyhow::Result<()> {
    let orchestrator = RunOrchestrator::new(config, backend)?;
    let ledger = RunLedger::create(output_dir)?;
    let report = orchestrator.run_and_record(rules, rows, &ledger).await?;
    let summary = report.summary();

    println!("📊 Run summary");
    println!("  Input rows:          {}", summary.input_rows);
    println!("  Accepted rows:       {}", summary.accepted_rows);
    println!("  Rejected candidates: {}", summary.rejected_candidates);
    println!("  Failed rows:         {}", summary.failed_rows);
    println!("  Studies to retrieve: {}", summary.retrieval_targets.len());
    println!("  Artifacts:           {}", ledger.run_dir().display());
    Ok(())
}
