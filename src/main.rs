use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netscenario::cli::{
    all_passed, exec, format_provisioned, format_reports, format_teardown, format_validation,
    load_hops, provision, release, run_scenario, validate_file, Cli, CommandResult, Commands,
    ExecArgs,
};
use netscenario::cloud::{CloudApi, OpenStackCloud};
use netscenario::config::load_topology_file;
use netscenario::scenario::{LocalShellFactory, ScenarioContext};
use netscenario::settings::{load_settings, Settings};
use netscenario::simulate::{lab_settings, SimulatedCloud, SimulatedTransport};
use netscenario::tunnel::{CommandChannel, LocalShell, OpenSshTransport, Transport};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    match execute(&cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

async fn execute(cli: &Cli) -> CommandResult<bool> {
    if let Commands::Validate(args) = &cli.command {
        let summaries = validate_file(&args.file)?;
        println!("{}", format_validation(&args.file.display().to_string(), &summaries));
        return Ok(true);
    }

    let settings = load_settings(cli.config.as_deref())?;

    if cli.simulate {
        info!("Running against the simulated lab");
        let settings = lab_settings(settings);
        let cloud = Arc::new(SimulatedCloud::new());
        let transport = SimulatedTransport::new(cloud.clone());
        let local_shell = transport.local_shells();
        return dispatch(cli, cloud.as_ref(), &transport, &settings, local_shell.as_ref()).await;
    }

    let transport = OpenSshTransport::new(settings.ssh.clone());
    let local_shell: Box<LocalShellFactory> =
        Box::new(|| Box::new(LocalShell::new()) as Box<dyn CommandChannel>);
    if let Commands::Exec(args) = &cli.command {
        return run_exec(&transport, args).await;
    }

    let cloud = OpenStackCloud::connect(&settings.cloud).await?;
    dispatch(cli, &cloud, &transport, &settings, local_shell.as_ref()).await
}

async fn dispatch<T: Transport>(
    cli: &Cli,
    cloud: &dyn CloudApi,
    transport: &T,
    settings: &Settings,
    local_shell: &LocalShellFactory,
) -> CommandResult<bool> {
    let ctx = ScenarioContext::new(cloud, transport, settings, local_shell);
    match &cli.command {
        Commands::Provision(args) => {
            let document = load_topology_file(&args.file)?;
            let tenants = provision(&ctx, &document).await;
            println!("{}", format_provisioned(&tenants));
            let succeeded = tenants.iter().all(|t| t.error.is_none());

            if args.hold && succeeded {
                println!("Holding resources, press Ctrl-C to release them");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Could not wait for Ctrl-C: {}", e);
                }
            }
            let summaries = release(&ctx, tenants).await;
            println!("{}", format_teardown(&summaries));
            Ok(succeeded && summaries.iter().all(|(_, s)| s.is_clean()))
        }
        Commands::Run(args) => {
            let reports = run_scenario(&ctx, args.scenario, &args.file).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                println!("{}", format_reports(&reports));
            }
            Ok(all_passed(&reports))
        }
        Commands::Exec(args) => run_exec(transport, args).await,
        Commands::Validate(_) => Ok(true),
    }
}

async fn run_exec<T: Transport>(transport: &T, args: &ExecArgs) -> CommandResult<bool> {
    let hops = load_hops(&args.hops)?;
    let command = args.command.join(" ");
    let output = exec(transport, &hops, &command, Duration::from_secs(args.timeout)).await?;
    println!("{}", output);
    Ok(true)
}
