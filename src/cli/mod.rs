//! CLI module for netscenario
//!
//! Subcommands:
//! - `netscenario validate` - Check a topology file without touching the cloud
//! - `netscenario provision` - Build a topology, print its endpoints, tear it down
//! - `netscenario run` - Run a scenario end to end
//! - `netscenario exec` - Run one command through a chain of ssh hops

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::scenario::ScenarioKind;

#[derive(Parser, Debug)]
#[command(name = "netscenario")]
#[command(
    about = "Provision throwaway tenant topologies and verify how traffic flows through them"
)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to settings file (default: ~/.netscenario/config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to a .env file holding the cloud password
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    /// Run against the in-memory lab instead of a real cloud
    #[arg(long, global = true)]
    pub simulate: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a topology file
    Validate(ValidateArgs),

    /// Provision a topology and tear it down again
    Provision(ProvisionArgs),

    /// Run a scenario against a topology
    Run(RunArgs),

    /// Run a command on the last of a chain of hops
    Exec(ExecArgs),
}

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to the topology file (YAML or JSON)
    pub file: PathBuf,
}

#[derive(Parser, Debug)]
pub struct ProvisionArgs {
    /// Path to the topology file (YAML or JSON)
    pub file: PathBuf,

    /// Keep the resources until Ctrl-C
    #[arg(long)]
    pub hold: bool,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Scenario to run
    #[arg(value_enum)]
    pub scenario: ScenarioKind,

    /// Path to the topology file (YAML or JSON)
    pub file: PathBuf,

    /// Print the reports as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// Hop as ADDRESS=KEY_FILE, repeated in order
    #[arg(long = "hop", required = true, value_name = "ADDRESS=KEY_FILE")]
    pub hops: Vec<String>,

    /// Command timeout in seconds
    #[arg(long, default_value = "60")]
    pub timeout: u64,

    /// Command to run on the last hop
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_validate() {
        let cli = Cli::try_parse_from(["netscenario", "validate", "topology.yaml"]).unwrap();
        match cli.command {
            Commands::Validate(args) => assert_eq!(args.file, PathBuf::from("topology.yaml")),
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_parse_provision_hold() {
        let cli =
            Cli::try_parse_from(["netscenario", "provision", "t.yaml", "--hold"]).unwrap();
        match cli.command {
            Commands::Provision(args) => assert!(args.hold),
            _ => panic!("Expected Provision command"),
        }
    }

    #[test]
    fn test_parse_run_scenario() {
        let cli = Cli::try_parse_from([
            "netscenario",
            "run",
            "lbaas-persistence",
            "t.yaml",
            "--json",
            "--simulate",
        ])
        .unwrap();
        assert!(cli.simulate);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.scenario, ScenarioKind::LbaasPersistence);
                assert!(args.json);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_parse_unknown_scenario_rejected() {
        assert!(Cli::try_parse_from(["netscenario", "run", "lbaas-magic", "t.yaml"]).is_err());
    }

    #[test]
    fn test_parse_exec() {
        let cli = Cli::try_parse_from([
            "netscenario",
            "exec",
            "--hop",
            "172.24.4.100=gw.pem",
            "--hop",
            "10.0.0.3=backend.pem",
            "ip",
            "-4",
            "addr",
        ])
        .unwrap();
        match cli.command {
            Commands::Exec(args) => {
                assert_eq!(args.hops.len(), 2);
                assert_eq!(args.command, vec!["ip", "-4", "addr"]);
            }
            _ => panic!("Expected Exec command"),
        }
    }

    #[test]
    fn test_verbose_global() {
        let cli = Cli::try_parse_from(["netscenario", "-vv", "validate", "t.yaml"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
