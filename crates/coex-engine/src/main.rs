//! `coexd`: operator command line for the migration engine

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use coex_core::MigrationConfig;
use coex_engine::catalog::DetectionCatalog;
#[cfg(feature = "simulator")]
use coex_engine::simulator::{run_simulator, SimulatorConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn cli() -> Command {
    let cmd = Command::new("coexd")
        .version(coex_engine::VERSION)
        .about("Coexistence migration engine")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("check-config")
                .about("Validate a configuration file and print the effective settings")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .help("TOML configuration file"),
                ),
        )
        .subcommand(
            Command::new("catalog")
                .about("Print the incumbent detection catalog as JSON")
                .arg(
                    Arg::new("path")
                        .long("path")
                        .help("TOML catalog to load instead of the built-in one"),
                ),
        );
    with_simulate(cmd)
}

#[cfg(not(feature = "simulator"))]
fn with_simulate(cmd: Command) -> Command {
    cmd
}

#[cfg(feature = "simulator")]
fn with_simulate(cmd: Command) -> Command {
    cmd.subcommand(
        Command::new("simulate")
            .about("Run a seeded shadow-to-parallel simulation")
            .arg(
                Arg::new("members")
                    .long("members")
                    .default_value("200")
                    .value_parser(clap::value_parser!(usize))
                    .help("Number of simulated members"),
            )
            .arg(
                Arg::new("days")
                    .long("days")
                    .default_value("15")
                    .value_parser(clap::value_parser!(u32))
                    .help("Days of shadow observation"),
            )
            .arg(
                Arg::new("seed")
                    .long("seed")
                    .default_value("42")
                    .value_parser(clap::value_parser!(u64))
                    .help("Random seed for reproducibility"),
            ),
    )
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn check_config(args: &ArgMatches) -> Result<bool> {
    let path = args
        .get_one::<String>("path")
        .context("missing configuration path")?;
    let config = MigrationConfig::load(path).with_context(|| format!("loading {path}"))?;
    println!("{}", config.to_toml_string()?);
    info!(path, "configuration valid");
    Ok(true)
}

fn catalog(args: &ArgMatches) -> Result<bool> {
    let catalog = match args.get_one::<String>("path") {
        Some(path) => DetectionCatalog::load(path).with_context(|| format!("loading {path}"))?,
        None => DetectionCatalog::default(),
    };
    catalog.compile().context("catalog does not compile")?;
    println!("{}", serde_json::to_string_pretty(&catalog)?);
    Ok(true)
}

#[cfg(feature = "simulator")]
async fn simulate(args: &ArgMatches) -> Result<bool> {
    let config = SimulatorConfig {
        members: *args.get_one::<usize>("members").context("members")?,
        days: *args.get_one::<u32>("days").context("days")?,
        seed: *args.get_one::<u64>("seed").context("seed")?,
        ..SimulatorConfig::default()
    };
    let report = run_simulator(config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed() {
        for violation in &report.violations {
            tracing::error!(%violation, "simulation violation");
        }
    }
    Ok(report.passed())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("log-json"));

    let ok = match matches.subcommand() {
        Some(("check-config", args)) => check_config(args)?,
        Some(("catalog", args)) => catalog(args)?,
        #[cfg(feature = "simulator")]
        Some(("simulate", args)) => simulate(args).await?,
        _ => unreachable!("subcommand_required"),
    };
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[cfg(feature = "simulator")]
    #[test]
    fn simulate_defaults_parse() {
        let matches = cli().try_get_matches_from(["coexd", "simulate"]).unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "simulate");
        assert_eq!(*args.get_one::<u64>("seed").unwrap(), 42);
        assert_eq!(*args.get_one::<usize>("members").unwrap(), 200);
    }
}
