pub mod run;

use std::path::PathBuf;

#[derive(Debug)]
pub enum Action {
    Run { port: u16, config: PathBuf },
}
