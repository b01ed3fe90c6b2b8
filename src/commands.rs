//! CLI command implementations for the `topics` binary.
//!
//! Each function opens the database (applying the schema if needed), calls
//! into the library, and prints results to stdout.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::path::Path;

use topic_discovery::citation::{context_block, extract_citations, FragmentRef};
use topic_discovery::config::Config;
use topic_discovery::discovery::{self, Services};
use topic_discovery::embedding::create_provider;
use topic_discovery::generation::create_generator;
use topic_discovery::job::{DiscoveryJob, JobStatus};
use topic_discovery::models::Fragment;
use topic_discovery::relationships::neighbors;
use topic_discovery::{db, ingest, migrate, store};

async fn open(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(pool)
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

pub async fn init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized successfully.");
    Ok(())
}

pub async fn create_collection(
    config: &Config,
    name: &str,
    description: Option<&str>,
) -> Result<()> {
    let pool = open(config).await?;
    let id = store::create_collection(&pool, name, description).await?;
    println!("{}", id);
    pool.close().await;
    Ok(())
}

pub async fn list_collections(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    let collections = store::list_collections(&pool).await?;
    pool.close().await;

    if collections.is_empty() {
        println!("No collections.");
        return Ok(());
    }

    println!("{:<6} {:<30} {:>6}  STALE", "ID", "NAME", "DOCS");
    for c in collections {
        println!(
            "{:<6} {:<30} {:>6}  {}",
            c.collection.id,
            c.collection.name,
            c.document_count,
            if c.collection.is_stale { "yes" } else { "no" }
        );
    }
    Ok(())
}

pub async fn ingest(config: &Config, collection_id: i64, path: &Path) -> Result<()> {
    let pool = open(config).await?;
    let ids = ingest::ingest_path(&pool, collection_id, path, &config.ingest).await?;
    pool.close().await;

    println!(
        "ingested {} documents into collection {}",
        ids.len(),
        collection_id
    );
    Ok(())
}

pub async fn discover(config: &Config, collection_id: i64) -> Result<()> {
    let embeddings = create_provider(&config.embedding)?;
    let generator = create_generator(&config.generation)?;
    let services = Services {
        embeddings: embeddings.as_ref(),
        generator: generator.as_ref(),
    };

    let pool = open(config).await?;
    let job = discovery::discover(&pool, config, &services, collection_id).await;
    pool.close().await;

    report(&job?)
}

pub async fn run_job(config: &Config, job_id: i64) -> Result<()> {
    let embeddings = create_provider(&config.embedding)?;
    let generator = create_generator(&config.generation)?;
    let services = Services {
        embeddings: embeddings.as_ref(),
        generator: generator.as_ref(),
    };

    let pool = open(config).await?;
    let job = discovery::run_job(&pool, config, &services, job_id).await;
    pool.close().await;

    report(&job?)
}

/// Print a finished job; a FAILED job becomes the command's error.
fn report(job: &DiscoveryJob) -> Result<()> {
    print_job(job);
    if job.status == JobStatus::Failed {
        bail!("discovery job {} failed", job.id);
    }
    Ok(())
}

pub async fn show_job(config: &Config, job_id: i64) -> Result<()> {
    let pool = open(config).await?;
    let job = store::get_job(&pool, job_id).await;
    pool.close().await;

    print_job(&job?);
    Ok(())
}

fn print_job(job: &DiscoveryJob) {
    println!("job {} (collection {})", job.id, job.collection_id);
    println!("  status: {}", job.status);
    println!(
        "  progress: {}/{} {}",
        job.progress_step,
        job.progress_total,
        job.progress_label.as_deref().unwrap_or("")
    );
    println!("  created: {}", format_ts(job.created_at));
    if let Some(ts) = job.started_at {
        println!("  started: {}", format_ts(ts));
    }
    if let Some(ts) = job.finished_at {
        println!("  finished: {}", format_ts(ts));
    }
    if let Some(ref error) = job.error_message {
        println!("  error: {}", error);
    }
}

pub async fn list_topics(config: &Config, collection_id: i64, json: bool) -> Result<()> {
    let pool = open(config).await?;
    store::get_collection(&pool, collection_id).await?;
    let details = store::topic_details(&pool, collection_id).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&details)?);
        return Ok(());
    }

    if details.is_empty() {
        println!("No topics.");
        return Ok(());
    }

    let names: std::collections::HashMap<i64, &str> = details
        .iter()
        .map(|d| (d.topic.id, d.topic.name.as_str()))
        .collect();

    for (i, detail) in details.iter().enumerate() {
        let topic = &detail.topic;
        println!(
            "{}. {} ({} documents, size {:.2})",
            i + 1,
            topic.name,
            topic.document_count,
            topic.size_score
        );
        println!("    {}", topic.summary);
        if !topic.keywords.is_empty() {
            println!("    keywords: {}", topic.keywords.join(", "));
        }
        if let Some(ref insight) = detail.insight {
            println!("    insight: {}", insight.summary);
            if !insight.themes.is_empty() {
                println!("    themes: {}", insight.themes.join("; "));
            }
            for q in &insight.questions {
                println!("    ? {}", q);
            }
        }
        for doc in &detail.documents {
            println!(
                "    [{}] {} ({:.2})",
                doc.classification, doc.document_title, doc.relevance_score
            );
        }
        for (other, similarity) in neighbors(&detail.related, topic.id) {
            println!(
                "    ~ {} ({:.2})",
                names.get(&other).copied().unwrap_or("?"),
                similarity
            );
        }
    }
    Ok(())
}

pub async fn cite(config: &Config, marker: &str) -> Result<()> {
    let refs: Vec<FragmentRef> = match marker.parse::<FragmentRef>() {
        Ok(r) => vec![r],
        Err(e) => {
            let found = extract_citations(marker);
            if found.is_empty() {
                return Err(e);
            }
            found
        }
    };

    let pool = open(config).await?;
    let mut fragments = Vec::new();
    let mut missing = Vec::new();
    for r in refs {
        match store::resolve_citation(&pool, r).await? {
            Some(resolved) => {
                println!("{}  {}", resolved.reference, resolved.document_title);
                fragments.push(Fragment {
                    document_id: r.document_id,
                    fragment_index: r.fragment_index,
                    text: resolved.text,
                    embedding: None,
                });
            }
            None => missing.push(r.to_string()),
        }
    }
    pool.close().await;

    if !fragments.is_empty() {
        println!();
        println!("{}", context_block(&fragments));
    }
    if !missing.is_empty() {
        bail!("fragment not found: {}", missing.join(", "));
    }
    Ok(())
}
