use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use colored::Colorize;
use recommdo_core::{
    ConfigLoader, DatabaseConfig, DatabasePool, PipelineConfig, PostgresStore, ProjectState,
    RedisConfig, Store,
};
use recommdo_engine::{
    Caller, ColumnMapping, CreateProject, IngestionPreprocessor, JobQueue, ProjectService,
    QueryService, RedisJobQueue, UploadedFile,
};
use uuid::Uuid;

/// Connections and identity shared by the database-backed commands
pub struct Context {
    db: DatabasePool,
    store: Arc<dyn Store>,
    caller: Caller,
    dry_run: bool,
}

impl Context {
    pub async fn new(database_url: &str, as_user: Option<Uuid>, dry_run: bool) -> Result<Self> {
        let config = DatabaseConfig {
            url: database_url.to_string(),
            max_connections: 2,
            min_connections: 1,
            ..DatabaseConfig::default()
        };
        config.validate()?;

        let db = DatabasePool::new(&config)
            .await
            .context("Failed to connect to database")?;
        let store: Arc<dyn Store> = Arc::new(PostgresStore::new(db.pool().clone()));

        let caller = match as_user {
            Some(user_id) => Caller::user(user_id),
            None => Caller::staff(Uuid::nil()),
        };

        Ok(Self {
            db,
            store,
            caller,
            dry_run,
        })
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    pub async fn migrate(&self) -> Result<()> {
        println!("{}", "Running migrations...".cyan().bold());

        if self.dry_run {
            println!("{}", "DRY RUN - No changes applied".yellow().bold());
            return Ok(());
        }

        self.db.migrate().await?;
        println!("{}", "All migrations applied successfully!".green().bold());
        Ok(())
    }

    pub async fn projects(&self) -> Result<()> {
        let projects = QueryService::new(self.store.clone())
            .projects(&self.caller)
            .await?;

        if projects.is_empty() {
            println!("{}", "No projects.".yellow());
            return Ok(());
        }

        println!("{}\n", "Projects".cyan().bold());
        println!("{:<38} {:<30} {:<10} {}", "ID", "Name", "State", "Created");
        println!("{}", "-".repeat(100));

        for project in projects {
            let state = match project.state() {
                ProjectState::Analyzed => "analyzed".green(),
                ProjectState::Imported => "imported".cyan(),
                ProjectState::Fresh => "fresh".yellow(),
                ProjectState::Deleted => "deleted".red(),
            };
            println!(
                "{:<38} {:<30} {:<10} {}",
                project.id.to_string().white(),
                project.name,
                state,
                project.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }

        Ok(())
    }

    pub async fn create(
        &self,
        name: String,
        files: Vec<String>,
        columns: ColumnMapping,
    ) -> Result<()> {
        let files: Vec<UploadedFile> = files
            .into_iter()
            .map(|location| {
                let name = Path::new(&location)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| location.clone());
                UploadedFile { name, location }
            })
            .collect();

        println!("{} {}", "Creating project".cyan().bold(), name.white());
        for file in &files {
            let role = columns
                .classify(&file.name)
                .map(|kind| kind.as_str())
                .unwrap_or("ignored");
            println!("  {} {} ({})", "→".cyan(), file.location, role);
        }

        if self.dry_run {
            columns.validate()?;
            println!("\n{}", "DRY RUN - No changes applied".yellow().bold());
            return Ok(());
        }

        let project = self
            .service()
            .await?
            .create_project(
                &self.caller,
                CreateProject {
                    name,
                    files,
                    columns,
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("{} (code {})", e, e.code()))?;

        println!(
            "\n{} {}",
            "Project created:".green().bold(),
            project.id.to_string().white()
        );
        Ok(())
    }

    pub async fn reanalyze(&self, project_id: &str, columns: ColumnMapping) -> Result<()> {
        println!("{} {}", "Requesting analysis of".cyan().bold(), project_id);

        if self.dry_run {
            columns.validate()?;
            println!("{}", "DRY RUN - No changes applied".yellow().bold());
            return Ok(());
        }

        self.service()
            .await?
            .reanalyze(&self.caller, project_id, columns)
            .await
            .map_err(|e| anyhow::anyhow!("{} (code {})", e, e.code()))?;

        println!("{}", "Analysis queued.".green().bold());
        Ok(())
    }

    pub async fn allow_users(&self, project_id: &str, users: Vec<Uuid>) -> Result<()> {
        println!(
            "{} {} user(s) on {}",
            "Assigning".cyan().bold(),
            users.len(),
            project_id
        );

        if self.dry_run {
            println!("{}", "DRY RUN - No changes applied".yellow().bold());
            return Ok(());
        }

        self.service()
            .await?
            .set_allowed_users(&self.caller, project_id, users)
            .await
            .map_err(|e| anyhow::anyhow!("{} (code {})", e, e.code()))?;

        println!(
            "{}",
            "Users have been successfully assigned to the project.".green()
        );
        Ok(())
    }

    pub async fn delete(&self, project_id: &str) -> Result<()> {
        println!("{} {}", "Deleting project".cyan().bold(), project_id);

        if self.dry_run {
            println!("{}", "DRY RUN - No changes applied".yellow().bold());
            return Ok(());
        }

        self.service()
            .await?
            .delete_project(&self.caller, project_id)
            .await
            .map_err(|e| anyhow::anyhow!("{} (code {})", e, e.code()))?;

        println!("{}", "Project deleted.".green().bold());
        Ok(())
    }

    pub async fn stats(&self, project_id: &str, item: Option<i64>) -> Result<()> {
        let stats = QueryService::new(self.store.clone())
            .project_statistics(&self.caller, project_id, item)
            .await
            .map_err(|e| anyhow::anyhow!("{} (code {})", e, e.code()))?;

        println!("{}\n", "Recommendation Statistics".cyan().bold());
        if let Some(item) = &stats.item {
            println!(
                "Item {} {}\n",
                item.meta_id,
                item.name.as_deref().unwrap_or("")
            );
        }

        println!("{:<8} {:<10} {}", "Stars", "Count", "Share");
        println!("{}", "-".repeat(30));
        for star in &stats.stars {
            println!(
                "{:<8} {:<10} {:>5.1}%",
                "★".repeat(star.stars as usize).yellow(),
                star.count,
                star.percentage * 100.0
            );
        }
        println!("\nTotal: {}", stats.total);

        Ok(())
    }

    async fn service(&self) -> Result<ProjectService> {
        let queue = connect_queue().await?;
        let pipeline = PipelineConfig::from_env().context("Failed to load pipeline config")?;

        Ok(ProjectService::new(
            self.store.clone(),
            Arc::new(queue),
            IngestionPreprocessor::from_config(&pipeline),
        ))
    }
}

async fn connect_queue() -> Result<RedisJobQueue> {
    let config = RedisConfig::from_env().context("Failed to load Redis config")?;
    config.validate()?;
    RedisJobQueue::connect(&config)
        .await
        .context("Failed to connect to Redis")
}

pub async fn queue() -> Result<()> {
    let stats = connect_queue().await?.stats().await?;

    println!("{}\n", "Job Queue".cyan().bold());
    println!("{:<14} {}", "high", stats.high);
    println!("{:<14} {}", "normal", stats.normal);
    println!("{:<14} {}", "in flight", stats.in_flight);

    let dead = format!("{}", stats.dead_letter);
    println!(
        "{:<14} {}",
        "dead-letter",
        if stats.dead_letter > 0 { dead.red() } else { dead.green() }
    );

    Ok(())
}
