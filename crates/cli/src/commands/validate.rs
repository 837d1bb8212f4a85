//! Validate Command

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use netcheck_harness::case;
use netcheck_harness::SuiteSpec;

use crate::output::{print_error, print_success};

#[derive(Args)]
pub struct ValidateArgs {
    /// Suite file, or a directory of suite files
    #[arg(short, long, env = "NETCHECK_SUITE", default_value = "suites")]
    pub suite: PathBuf,
}

/// Exit code 2 when any case would be rejected before running
pub fn execute(args: ValidateArgs) -> Result<i32> {
    let suites = SuiteSpec::load_all(&args.suite)
        .with_context(|| format!("loading suites from {}", args.suite.display()))?;

    let mut invalid = 0;
    for suite in &suites {
        for spec in &suite.cases {
            match case::validate(spec, &suite.topology, &suite.defaults) {
                Ok(()) => print_success(&format!("{}/{}", suite.name, spec.name)),
                Err(e) => {
                    invalid += 1;
                    print_error(&format!("{}/{}: {}", suite.name, spec.name, e));
                }
            }
        }
    }

    if invalid > 0 {
        print_error(&format!("{} invalid case(s)", invalid));
        Ok(2)
    } else {
        Ok(0)
    }
}
