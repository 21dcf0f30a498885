use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "skillpassd")]
#[command(about = "Skill Passport sidecar: competency levels, KRS approvals and exports over stdio", long_about = None)]
pub struct Config {
    /// Workspace directory to open at startup
    #[arg(long, env = "SKILLPASS_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Shared password for staff accounts
    #[arg(
        long,
        env = "SKILLPASS_STAFF_PASSWORD",
        default_value = "skillpass",
        hide_env_values = true
    )]
    pub staff_password: String,

    /// Refuse reads while no workspace is open instead of serving the demo dataset
    #[arg(long, env = "SKILLPASS_NO_FALLBACK")]
    pub no_fallback: bool,
}
