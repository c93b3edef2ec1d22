use anyhow::{bail, Context};
use clap::Args;

use crate::leaderboard::Exclusions;
use crate::store::SchoolPaths;

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// School whose documents are read and written
    #[arg(long, env = "ATTENDANCE_SCHOOL_ID", default_value = "default", global = true)]
    pub school: String,

    #[arg(long, env = "ATTENDANCE_DB_MAX_CONNECTIONS", default_value_t = 5, global = true)]
    pub max_connections: u32,

    /// Emit logs as JSON lines
    #[arg(long, env = "ATTENDANCE_LOG_JSON", global = true)]
    pub log_json: bool,

    /// Extra roll classes kept off the leaderboard (comma separated)
    #[arg(
        long = "exclude-roll",
        env = "ATTENDANCE_EXCLUDED_ROLLS",
        value_delimiter = ',',
        global = true
    )]
    pub exclude_rolls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub school_id: String,
    pub max_connections: u32,
    pub exclusions: Exclusions,
}

impl Config {
    pub fn from_args(args: &GlobalArgs) -> anyhow::Result<Self> {
        let database_url = args
            .database_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let school_id = args.school.trim().to_string();
        if school_id.is_empty() {
            bail!("school id must not be empty");
        }
        if school_id.contains('/') {
            bail!("school id {school_id:?} must not contain '/'");
        }
        // the term lock pins one connection for the whole upload
        if args.max_connections < 2 {
            bail!("max connections must be at least 2");
        }

        Ok(Self {
            database_url,
            school_id,
            max_connections: args.max_connections,
            exclusions: Exclusions::with_extra(&args.exclude_rolls),
        })
    }

    pub fn paths(&self) -> SchoolPaths {
        SchoolPaths::new(&self.school_id)
    }
}
