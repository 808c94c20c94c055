use std::path::PathBuf;

use anyhow::Result;

use crate::cli::actions::Action;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    Ok(Action::Run {
        port: matches.get_one::<u16>("port").copied().unwrap_or(5000),
        config: matches
            .get_one::<String>("config")
            .map(PathBuf::from)
            .unwrap_or_else(crate::config::default_path),
    })
}
