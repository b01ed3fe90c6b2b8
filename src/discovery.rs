//! Discovery job orchestration.
//!
//! [`run_job`] drives one job through the pipeline, strictly in sequence:
//!
//! 1. fragment every document of the collection
//! 2. embed the fragments (failed batches become zero vectors)
//! 3. choose `k` and cluster the embedded fragments
//! 4. name each cluster from its representative fragments
//! 5. generate insights for each named topic
//! 6. score every document against every topic
//! 7. link topics whose centroids are similar
//! 8. commit the new topic generation and mark the job SUCCEEDED
//!
//! Progress is written between stages and renews the job's lease. Any
//! error before the commit marks the job FAILED with a truncated message
//! and leaves the previously committed topics untouched. A collection with
//! no embeddable fragments commits an empty generation and succeeds.
//!
//! A RUNNING job whose lease (`[discovery] job_lease_secs`) has run out is
//! failed the next time the collection is discovered or the job is
//! redelivered, so a dead worker never blocks the collection for good.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{choose_k, select_representatives, KMeans};
use crate::config::Config;
use crate::embedding::{Embedder, EmbeddingProvider};
use crate::fragment::Fragmenter;
use crate::generation::TextGenerator;
use crate::job::{self, DiscoveryError, DiscoveryJob, JobStatus, Stage};
use crate::labeling::Labeler;
use crate::models::{Fragment, TopicDraft, TopicSet};
use crate::relationships::build_relationships;
use crate::relevance::RelevanceScorer;
use crate::store;

/// External services a run talks to.
pub struct Services<'a> {
    pub embeddings: &'a dyn EmbeddingProvider,
    pub generator: &'a dyn TextGenerator,
}

/// Enqueue a job for `collection_id` and run it to completion.
pub async fn discover(
    pool: &SqlitePool,
    config: &Config,
    services: &Services<'_>,
    collection_id: i64,
) -> Result<DiscoveryJob> {
    expire_stale_jobs(pool, config, collection_id).await?;
    let job_id = store::create_job(pool, collection_id).await?;
    info!(collection_id, job_id, "discovery job enqueued");
    run_job(pool, config, services, job_id).await
}

/// Run a PENDING job and return it in its final state.
///
/// A job that is no longer PENDING (for example a redelivered one) is not
/// run again. If it is RUNNING past its lease it is failed first; either
/// way it is returned as stored.
#[instrument(skip(pool, config, services))]
pub async fn run_job(
    pool: &SqlitePool,
    config: &Config,
    services: &Services<'_>,
    job_id: i64,
) -> Result<DiscoveryJob> {
    let job = store::get_job(pool, job_id).await?;
    if job.status == JobStatus::Running {
        expire_stale_jobs(pool, config, job.collection_id).await?;
        let job = store::get_job(pool, job_id).await?;
        info!(status = %job.status, "job was already started; skipping");
        return Ok(job);
    }
    if job.status != JobStatus::Pending {
        info!(status = %job.status, "job is not pending; skipping");
        return Ok(job);
    }

    store::mark_running(pool, job_id).await?;
    let collection_id = job.collection_id;
    info!(collection_id, "discovery job started");

    let outcome: Result<usize> = async {
        let set = build_topic_set(pool, config, services, job_id, collection_id).await?;
        store::update_progress(pool, job_id, job::COMMITTING).await?;
        store::commit_topic_set(pool, collection_id, job_id, &set).await?;
        Ok(set.topics.len())
    }
    .await;

    match outcome {
        Ok(topics) => info!(collection_id, topics, "discovery job succeeded"),
        Err(e) => {
            let message = format!("{:#}", e);
            warn!(collection_id, error = %message, "discovery job failed");
            record_failure(pool, job_id, &message).await?;
        }
    }

    store::get_job(pool, job_id).await
}

const FAILURE_ATTEMPTS: u32 = 3;

/// Mark the job FAILED, retrying transient database errors.
///
/// A job that already left RUNNING (its lease expired and someone else
/// failed it) is left as it is. If every attempt fails the job stays
/// RUNNING until its lease runs out.
async fn record_failure(pool: &SqlitePool, job_id: i64, message: &str) -> Result<()> {
    let mut attempt = 1;
    loop {
        match store::mark_failed(pool, job_id, message).await {
            Ok(()) => return Ok(()),
            Err(e) if e.downcast_ref::<DiscoveryError>().is_some() => {
                warn!(job_id, error = %e, "job already left RUNNING; not marking it failed");
                return Ok(());
            }
            Err(e) if attempt < FAILURE_ATTEMPTS => {
                warn!(job_id, attempt, error = %e, "could not mark job failed; retrying");
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => {
                error!(job_id, error = %e, "could not mark job failed; its lease will expire it");
                return Err(e);
            }
        }
    }
}

async fn expire_stale_jobs(pool: &SqlitePool, config: &Config, collection_id: i64) -> Result<()> {
    let lease = config.discovery.job_lease_secs;
    for job_id in store::expire_stale_jobs(pool, collection_id, lease).await? {
        warn!(collection_id, job_id, lease_secs = lease, "failed a RUNNING job whose lease expired");
    }
    Ok(())
}

async fn progress(pool: &SqlitePool, job_id: i64, stage: Stage) -> Result<()> {
    debug!(job_id, step = stage.step, stage = stage.label, "progress");
    store::update_progress(pool, job_id, stage).await
}

/// Compute a full topic generation for the collection without writing it.
#[instrument(skip(pool, config, services, job_id))]
pub async fn build_topic_set(
    pool: &SqlitePool,
    config: &Config,
    services: &Services<'_>,
    job_id: i64,
    collection_id: i64,
) -> Result<TopicSet> {
    let discovery = &config.discovery;

    // 1. Fragments
    progress(pool, job_id, job::FRAGMENTING).await?;
    let fragmenter = Fragmenter::from_config(&config.fragmenting);
    let documents = store::list_documents(pool, collection_id).await?;
    let max_document_id = documents.iter().map(|d| d.id).max().unwrap_or(0);
    let mut fragments: Vec<Fragment> = documents
        .iter()
        .flat_map(|doc| fragmenter.fragment_document(doc.id, &doc.body))
        .collect();
    info!(
        documents = documents.len(),
        fragments = fragments.len(),
        "documents fragmented"
    );

    let embeddable: Vec<usize> = fragments
        .iter()
        .enumerate()
        .filter(|(_, f)| !f.text.trim().is_empty())
        .map(|(i, _)| i)
        .collect();
    if embeddable.is_empty() {
        info!("no embeddable fragments; committing an empty topic set");
        return Ok(TopicSet {
            max_document_id,
            fragments,
            ..Default::default()
        });
    }

    // 2. Embeddings
    progress(pool, job_id, job::EMBEDDING).await?;
    let texts: Vec<String> = fragments.iter().map(|f| f.text.clone()).collect();
    let embedded = Embedder::new(services.embeddings, &config.embedding)
        .embed_all(&texts)
        .await;
    if embedded.all_failed() {
        bail!(
            "embedding provider failed for all {} batches: {}",
            embedded.batches,
            embedded.last_error.unwrap_or_default()
        );
    }
    if embedded.failed_batches > 0 {
        warn!(
            failed = embedded.failed_batches,
            batches = embedded.batches,
            "some embedding batches failed; their fragments carry zero vectors"
        );
    }
    for (fragment, vector) in fragments.iter_mut().zip(embedded.vectors) {
        fragment.embedding = Some(vector);
    }

    // 3. Clusters
    progress(pool, job_id, job::CLUSTERING).await?;
    let points: Vec<Vec<f32>> = embeddable
        .iter()
        .map(|&i| fragments[i].embedding.clone().unwrap_or_default())
        .collect();
    let k = choose_k(points.len());
    let clustering = KMeans::new(k, discovery.seed)
        .n_init(discovery.n_init)
        .max_iterations(discovery.max_iterations)
        .fit(&points)?;
    let members = clustering.members();
    info!(n = points.len(), k, inertia = clustering.inertia, "fragments clustered");

    let representatives: Vec<Vec<&str>> = members
        .iter()
        .zip(clustering.centroids.iter())
        .map(|(cluster, centroid)| {
            select_representatives(cluster, &points, centroid, discovery.representatives)
                .into_iter()
                .map(|p| fragments[embeddable[p]].text.as_str())
                .collect()
        })
        .collect();

    let document_counts: Vec<i64> = members
        .iter()
        .map(|cluster| {
            cluster
                .iter()
                .map(|&p| fragments[embeddable[p]].document_id)
                .collect::<HashSet<_>>()
                .len() as i64
        })
        .collect();
    let max_documents = document_counts.iter().copied().max().unwrap_or(0);

    // 4. Names
    progress(pool, job_id, job::LABELING).await?;
    let labeler = Labeler::new(services.generator, config.generation.temperature);
    let mut labels = Vec::with_capacity(k);
    for (ordinal, reps) in representatives.iter().enumerate() {
        labels.push(labeler.label_topic(reps, ordinal).await);
    }

    // 5. Insights
    progress(pool, job_id, job::INSIGHTS).await?;
    let mut topics = Vec::with_capacity(k);
    for (((label, reps), centroid), &document_count) in labels
        .into_iter()
        .zip(representatives.iter())
        .zip(clustering.centroids.iter())
        .zip(document_counts.iter())
    {
        let insight = labeler.generate_insights(reps, &label.name).await;
        topics.push(TopicDraft {
            name: label.name,
            summary: label.summary,
            keywords: label.keywords,
            insight,
            centroid: centroid.clone(),
            document_count,
            size_score: size_score(document_count, max_documents),
        });
    }

    // 6. Document relevance
    progress(pool, job_id, job::SCORING).await?;
    let mut by_document: BTreeMap<i64, Vec<&[f32]>> = BTreeMap::new();
    for fragment in &fragments {
        if let Some(vector) = fragment.embedding.as_deref() {
            by_document
                .entry(fragment.document_id)
                .or_default()
                .push(vector);
        }
    }
    let by_document: Vec<(i64, Vec<&[f32]>)> = by_document.into_iter().collect();
    let document_topics =
        RelevanceScorer::from_config(discovery).score(&by_document, &clustering.centroids);
    debug!(edges = document_topics.len(), "documents scored");

    // 7. Relationships
    progress(pool, job_id, job::RELATIONSHIPS).await?;
    let relationships =
        build_relationships(&clustering.centroids, discovery.relationship_threshold);
    debug!(edges = relationships.len(), "topic relationships built");

    Ok(TopicSet {
        max_document_id,
        fragments,
        topics,
        document_topics,
        relationships,
    })
}

/// `min(1, ln(count + 1) / ln(max + 1))`, or 0 when `max` is 0.
pub fn size_score(document_count: i64, max_document_count: i64) -> f64 {
    let denominator = ((max_document_count + 1) as f64).ln();
    if denominator <= 0.0 {
        return 0.0;
    }
    (((document_count + 1) as f64).ln() / denominator).min(1.0)
}
