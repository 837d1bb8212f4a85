//! List Command

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;

use netcheck_harness::{CaseSpec, Intent, SuiteSpec};

use crate::output::{print_list, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ListArgs {
    /// Suite file, or a directory of suite files
    #[arg(short, long, env = "NETCHECK_SUITE", default_value = "suites")]
    pub suite: PathBuf,

    /// Only list cases carrying this tag
    #[arg(long)]
    pub tag: Option<String>,
}

/// Case listing row
#[derive(Serialize)]
pub struct CaseDisplay {
    pub suite: String,
    pub name: String,
    pub tags: Vec<String>,
    pub traffic: usize,
    pub probes: usize,
    pub description: String,
}

impl CaseDisplay {
    fn new(suite: &SuiteSpec, case: &CaseSpec) -> Self {
        let traffic = case
            .intents
            .iter()
            .filter(|i| matches!(i, Intent::Traffic(_)))
            .count();
        Self {
            suite: suite.name.clone(),
            name: case.name.clone(),
            tags: case.tags.clone(),
            traffic,
            probes: case.intents.len() - traffic,
            description: case.description.clone(),
        }
    }
}

impl TableDisplay for CaseDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Suite", "Case", "Tags", "Traffic", "Probes", "Description"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.suite.clone(),
            self.name.clone(),
            self.tags.join(", "),
            self.traffic.to_string(),
            self.probes.to_string(),
            self.description.clone(),
        ]
    }
}

pub fn execute(args: ListArgs, format: OutputFormat) -> Result<i32> {
    let suites = SuiteSpec::load_all(&args.suite)
        .with_context(|| format!("loading suites from {}", args.suite.display()))?;

    let rows: Vec<CaseDisplay> = suites
        .iter()
        .flat_map(|suite| {
            suite
                .select(args.tag.as_deref(), None)
                .into_iter()
                .map(move |case| CaseDisplay::new(suite, case))
        })
        .collect();

    print_list(&rows, format);
    Ok(0)
}
