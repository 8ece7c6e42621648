use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use recommdo_core::{init_logging, load_dotenv, LogConfig, LogFormat};
use recommdo_engine::{CatalogColumns, ColumnMapping, InteractionColumns};
use uuid::Uuid;

mod commands;

#[derive(Parser)]
#[command(name = "recommdo-admin")]
#[command(about = "Administrative CLI for recommdo projects", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Preview changes without applying them")]
    dry_run: bool,

    #[arg(
        long,
        global = true,
        env = "DATABASE_URL",
        help = "Database connection URL"
    )]
    database_url: Option<String>,

    #[arg(
        long = "as-user",
        global = true,
        help = "Act as this regular user instead of as staff"
    )]
    as_user: Option<Uuid>,
}

/// Where the catalog and interaction fields live in the uploaded files
#[derive(Args, Clone)]
struct ColumnArgs {
    #[arg(long, help = "File name of the catalog upload")]
    catalog_file: String,

    #[arg(long, default_value = "id", help = "Catalog item id column")]
    id_header: String,

    #[arg(long, help = "Catalog item display name column")]
    name_header: Option<String>,

    #[arg(long = "payload-header", help = "Extra catalog column kept as payload")]
    payload_headers: Vec<String>,

    #[arg(long, help = "File name of the interaction upload")]
    interactions_file: String,

    #[arg(long, default_value = "user_id", help = "Interaction user id column")]
    user_header: String,

    #[arg(long, default_value = "item_id", help = "Interaction item id column")]
    item_header: String,

    #[arg(long, help = "Interaction start timestamp column")]
    started_at_header: Option<String>,

    #[arg(long, help = "Interaction end timestamp column")]
    ended_at_header: Option<String>,
}

impl From<ColumnArgs> for ColumnMapping {
    fn from(args: ColumnArgs) -> Self {
        ColumnMapping {
            catalog: CatalogColumns {
                file_name: args.catalog_file,
                id_header: args.id_header,
                name_header: args.name_header,
                payload_headers: args.payload_headers,
            },
            interactions: InteractionColumns {
                file_name: args.interactions_file,
                user_id_header: args.user_header,
                item_id_header: args.item_header,
                started_at_header: args.started_at_header,
                ended_at_header: args.ended_at_header,
            },
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Apply all pending schema migrations")]
    Migrate,

    #[command(about = "List projects and their state")]
    Projects,

    #[command(about = "Create a project from uploaded files and queue its import")]
    Create {
        #[arg(help = "Project name")]
        name: String,

        #[arg(
            long = "file",
            required = true,
            help = "Uploaded file, relative to the upload root"
        )]
        files: Vec<String>,

        #[command(flatten)]
        columns: ColumnArgs,
    },

    #[command(about = "Clear recommendations and queue a new analysis")]
    Reanalyze {
        #[arg(help = "Project id")]
        project_id: String,

        #[command(flatten)]
        columns: ColumnArgs,
    },

    #[command(about = "Replace the users allowed to see a project")]
    AllowUsers {
        #[arg(help = "Project id")]
        project_id: String,

        #[arg(help = "User ids")]
        users: Vec<Uuid>,
    },

    #[command(about = "Mark a project as deleted")]
    Delete {
        #[arg(help = "Project id")]
        project_id: String,
    },

    #[command(about = "Show recommendation star statistics")]
    Stats {
        #[arg(help = "Project id")]
        project_id: String,

        #[arg(long, help = "Restrict to one catalog item")]
        item: Option<i64>,
    },

    #[command(about = "Show job queue depth")]
    Queue,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    load_dotenv();

    let cli = Cli::parse();
    init_logging(&LogConfig {
        filter: std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()),
        format: LogFormat::Pretty,
    })?;

    // The queue command doesn't need the database
    if let Commands::Queue = cli.command {
        return commands::queue().await;
    }

    let database_url = cli
        .database_url
        .context("DATABASE_URL must be set either as environment variable or --database-url flag")?;
    let ctx = commands::Context::new(&database_url, cli.as_user, cli.dry_run).await?;

    match cli.command {
        Commands::Migrate => ctx.migrate().await?,
        Commands::Projects => ctx.projects().await?,
        Commands::Create {
            name,
            files,
            columns,
        } => ctx.create(name, files, columns.into()).await?,
        Commands::Reanalyze {
            project_id,
            columns,
        } => ctx.reanalyze(&project_id, columns.into()).await?,
        Commands::AllowUsers { project_id, users } => {
            ctx.allow_users(&project_id, users).await?
        }
        Commands::Delete { project_id } => ctx.delete(&project_id).await?,
        Commands::Stats { project_id, item } => ctx.stats(&project_id, item).await?,
        Commands::Queue => unreachable!("Queue command handled above"),
    }

    ctx.close().await;
    Ok(())
}
