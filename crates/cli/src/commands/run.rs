//! Run Command

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use netcheck_harness::dataplane::DataplaneTransport;
use netcheck_harness::probe::CommandTransport;
use netcheck_harness::{
    CaseEngine, ExitStatus, PortAdapter, ProbeAdapter, RunnerConfig, ShellTransport, SuiteRunner, SuiteSpec,
};

use crate::output::{print_result, OutputFormat};

#[derive(Args)]
pub struct RunArgs {
    /// Suite file, or a directory of suite files
    #[arg(short, long, env = "NETCHECK_SUITE", default_value = "suites")]
    pub suite: PathBuf,

    /// Run against the in-process simulated lab described by each suite
    #[arg(long)]
    pub simulate: bool,

    /// Only run cases carrying this tag
    #[arg(long)]
    pub tag: Option<String>,

    /// Only run the case with this name
    #[arg(long)]
    pub name: Option<String>,

    /// Directory for the JSON report
    #[arg(short, long, env = "NETCHECK_OUTPUT", default_value = "test-results")]
    pub output: PathBuf,

    /// Command template with {endpoint} and {command} placeholders
    /// (default: "docker exec {endpoint} sh -c {command}")
    #[arg(long, env = "NETCHECK_EXEC", value_delimiter = ' ', num_args = 1..)]
    pub exec: Option<Vec<String>>,

    /// Run probe commands on this host instead of inside endpoints
    #[arg(long, conflicts_with = "exec")]
    pub local: bool,
}

pub async fn execute(args: RunArgs, format: OutputFormat) -> Result<i32> {
    let suites = SuiteSpec::load_all(&args.suite)
        .with_context(|| format!("loading suites from {}", args.suite.display()))?;
    if suites.is_empty() {
        anyhow::bail!("no suite files found in {}", args.suite.display());
    }

    let mut worst = ExitStatus::Success;
    let per_suite_dirs = suites.len() > 1;

    for (index, suite) in suites.iter().enumerate() {
        let engine = build_engine(&args, suite)?;
        let config = RunnerConfig {
            output_dir: if per_suite_dirs {
                args.output.join(&suite.name)
            } else {
                args.output.clone()
            },
            tag: args.tag.clone(),
            name: args.name.clone(),
        };
        let runner = SuiteRunner::with_config(engine, config);

        let token = runner.cancel_token();
        let interrupted = token.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing the in-flight case");
                token.cancel();
            }
        });

        let result = runner.run_suite(suite).await;
        interrupt.abort();

        runner.write_report(&result)?;
        print_result(&result, format);

        worst = worst.max(result.exit_status());
        if result.aborted() {
            break;
        }
        let remaining = suites.len() - index - 1;
        if interrupted.is_cancelled() && remaining > 0 {
            warn!("run aborted; skipping {} remaining suite(s)", remaining);
            worst = ExitStatus::Errors;
            break;
        }
    }

    info!("exit status {:?}", worst);
    Ok(worst.code())
}

fn build_engine(args: &RunArgs, suite: &SuiteSpec) -> Result<CaseEngine> {
    let (dataplane, commands): (Arc<dyn DataplaneTransport>, Arc<dyn CommandTransport>) = if args.simulate {
        let (switch, commands) = suite
            .simulation
            .clone()
            .unwrap_or_default()
            .build(&suite.topology);
        (switch as Arc<dyn DataplaneTransport>, commands as Arc<dyn CommandTransport>)
    } else {
        (open_dataplane(suite)?, command_transport(args)?)
    };

    Ok(CaseEngine::new(
        PortAdapter::new(dataplane).with_poll_interval(suite.defaults.poll_interval()),
        ProbeAdapter::new(commands),
    ))
}

fn command_transport(args: &RunArgs) -> Result<Arc<dyn CommandTransport>> {
    let transport = match (&args.exec, args.local) {
        (Some(argv), _) => ShellTransport::new(argv.clone())?,
        (None, true) => ShellTransport::local(),
        (None, false) => ShellTransport::docker(),
    };
    Ok(Arc::new(transport))
}

#[cfg(target_os = "linux")]
fn open_dataplane(suite: &SuiteSpec) -> Result<Arc<dyn DataplaneTransport>> {
    let transport = netcheck_harness::raw::RawSocketTransport::open(&suite.topology)
        .with_context(|| format!("opening raw sockets for suite {}", suite.name))?;
    Ok(Arc::new(transport))
}

#[cfg(not(target_os = "linux"))]
fn open_dataplane(_suite: &SuiteSpec) -> Result<Arc<dyn DataplaneTransport>> {
    anyhow::bail!("live dataplane capture needs AF_PACKET sockets (Linux); use --simulate")
}
