use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use crate::admin::AdminServer;
use crate::config::Config;
use crate::dryrun::dry_run;
use crate::env::ScEnv;
use crate::error::ScError;
use crate::meta_store::SqliteMetaStore;
use crate::orchestrator::{ScOutcome, SchemaChangeManager};
use crate::partition::ViewPartitionOps;
use crate::request::{snapshot, ChangeFlags, RequestBody, SchemaChangeRequest, TableChange};
use crate::resume::{resume_or_abort, ResumeOutcome};
use crate::traits::ThreadSpawner;

#[derive(Parser)]
#[command(
    name = "livesc",
    version,
    about = "livesc: online schema change coordinator"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Resume any interrupted schema change, then serve the admin socket (default)
    Serve,

    /// Show in-flight schema changes recorded in the metadata store
    Status,

    /// Check a schema change without running it
    Dryrun {
        /// Table to change
        #[arg(long = "table", short = 't')]
        table: String,

        /// File holding the new schema definition
        #[arg(long = "schema-file", short = 's')]
        schema_file: PathBuf,

        /// The table must not exist yet
        #[arg(long = "add-only", conflicts_with_all = ["alter_only", "fast_reinit"])]
        add_only: bool,

        /// The table must already exist
        #[arg(long = "alter-only", conflicts_with = "fast_reinit")]
        alter_only: bool,

        /// Truncate the table instead of altering it
        #[arg(long = "fast-reinit")]
        fast_reinit: bool,
    },

    /// Make the next startup discard the interrupted schema change
    #[command(name = "abort-resume")]
    AbortResume {
        /// Remove the marker instead of creating it
        #[arg(long = "clear")]
        clear: bool,
    },
}

impl Cli {
    pub fn handle_command_line(config: &Config) -> Result<(), ScError> {
        let args = Cli::parse();

        match args.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::serve(config),
            Command::Status => Self::status(config),
            Command::Dryrun {
                table,
                schema_file,
                add_only,
                alter_only,
                fast_reinit,
            } => Self::dryrun(config, &table, &schema_file, add_only, alter_only, fast_reinit),
            Command::AbortResume { clear } => Self::abort_resume(config, clear),
        }
    }

    fn open_env(config: &Config) -> Result<Arc<ScEnv>, ScError> {
        let store = Arc::new(SqliteMetaStore::open(&config.storage.meta_db_path())?);
        Ok(ScEnv::single_node(config, store))
    }

    fn serve(config: &Config) -> Result<(), ScError> {
        let env = Self::open_env(config)?;
        let manager = SchemaChangeManager::new(Arc::clone(&env), Arc::new(ThreadSpawner));

        match resume_or_abort(&env)? {
            ResumeOutcome::Aborted { table } => {
                warn!("Interrupted schema change on '{}' discarded", table);
            }
            ResumeOutcome::Dropped { table } => {
                warn!("Interrupted schema change on '{}' not resumed", table);
            }
            outcome => {
                if let Some(request) = outcome.into_request() {
                    let table = request.table.clone();
                    match manager.request_schema_change(request) {
                        ScOutcome::Rejected(rejection) => {
                            error!("Couldn't restart schema change on '{}': {:?}", table, rejection)
                        }
                        _ => info!("Restarted schema change on '{}'", table),
                    }
                }
            }
        }

        let host = config.admin.host.clone();
        let port = config.admin.port;
        info!("Starting admin socket on {}:{}", host, port);

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| ScError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let ops = Arc::new(ViewPartitionOps::new(manager));
            let server = AdminServer::new(host, port, env, ops);
            server.start().await
        })
    }

    fn status(config: &Config) -> Result<(), ScError> {
        let env = Self::open_env(config)?;
        let pending = env.meta.pending_tables()?;

        if pending.is_empty() {
            println!("No schema change in progress");
        }
        for table in pending {
            let bytes = match env.meta.in_schema_change(&table)? {
                Some(bytes) => bytes,
                None => continue,
            };
            match snapshot::unpack(&bytes) {
                Ok(request) => println!(
                    "{}: {} seed={} live={} finalize={}",
                    table,
                    request.kind().full_name(),
                    request
                        .seed
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".into()),
                    request.flags.live,
                    request.flags.finalize
                ),
                Err(e) => println!("{}: unreadable checkpoint ({})", table, e),
            }
        }

        match env.meta.disable_plan_seed()? {
            Some(seed) => println!("Plan disabled for seed {}", seed),
            None => println!("Plan not disabled"),
        }
        if env.settings.abort_marker().exists() {
            println!(
                "Abort marker present: {}",
                env.settings.abort_marker().display()
            );
        }
        Ok(())
    }

    fn dryrun(
        config: &Config,
        table: &str,
        schema_file: &Path,
        add_only: bool,
        alter_only: bool,
        fast_reinit: bool,
    ) -> Result<(), ScError> {
        let schema_text = fs::read_to_string(schema_file)?;
        let env = Self::open_env(config)?;

        let change = TableChange {
            schema_text,
            add_only,
            alter_only,
            fast_reinit,
            same_schema: fast_reinit,
            ..Default::default()
        };
        let request =
            SchemaChangeRequest::new(table, RequestBody::Table(change), ChangeFlags::default());

        let report = dry_run(&env, &request);
        print!("{}", report.text());
        if report.success {
            Ok(())
        } else {
            Err(ScError::Error(format!("dry run of '{}' failed", table)))
        }
    }

    fn abort_resume(config: &Config, clear: bool) -> Result<(), ScError> {
        let settings = crate::env::ScSettings::from_config(config);
        let marker = settings.abort_marker();
        if clear {
            match fs::remove_file(&marker) {
                Ok(()) => println!("Removed {}", marker.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    println!("No abort marker at {}", marker.display())
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            if let Some(parent) = marker.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&marker, b"")?;
            println!("Created {}", marker.display());
        }
        Ok(())
    }
}
