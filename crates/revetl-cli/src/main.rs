use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use revetl_core::{CategoryBatch, RawReview};
use revetl_document::{DocumentConfig, DocumentStore, DEFAULT_BATCH_SIZE, SHARED_COLLECTION};
use revetl_graph::{
    GraphConfig, GraphStore, DEFAULT_MAX_REVIEWS, DEFAULT_POPULAR_TOP_N, DEFAULT_TOP_USERS,
    DEFAULT_USER_LIMIT,
};
use revetl_relational::{RelationalConfig, RelationalStore};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "revetl")]
#[command(about = "Review tri-store ETL and graph analytics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bootstrap the relational schema and bulk-load a whole dataset
    /// directory into the relational and document stores.
    Load {
        data_dir: PathBuf,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Append one category file to the existing relational and document
    /// stores, inserting only identities not yet present.
    Append {
        file: PathBuf,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Load every category into one shared collection with a `type`
    /// discriminator field, for the reporting database.
    PrepareReporting {
        data_dir: PathBuf,
        #[arg(long, default_value = SHARED_COLLECTION)]
        collection: String,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Rebuild the graph store with one analytics algorithm.
    Analyze {
        data_dir: PathBuf,
        #[command(subcommand)]
        algorithm: Analytics,
    },
}

#[derive(Debug, Subcommand)]
enum Analytics {
    /// SIMILAR edges between the most active users, by Jaccard similarity
    /// of their reviewed-product sets.
    Similarity {
        #[arg(long, default_value_t = DEFAULT_TOP_USERS)]
        top_users: usize,
    },
    /// Subgraph of randomly sampled articles of one type with their reviews.
    ArticleReviews {
        #[arg(long)]
        article_type: String,
        #[arg(long)]
        count: usize,
    },
    /// User x article-type bipartite graph for multi-type reviewers.
    UserTypes {
        #[arg(long, default_value_t = DEFAULT_USER_LIMIT)]
        user_limit: usize,
    },
    /// Popular-but-under-reviewed articles plus shared-review links
    /// between their reviewers.
    SharedReviews {
        #[arg(long, default_value_t = DEFAULT_MAX_REVIEWS)]
        max_reviews: usize,
        #[arg(long, default_value_t = DEFAULT_POPULAR_TOP_N)]
        top_n: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let run_id = Uuid::new_v4();

    match cli.command {
        Commands::Load { data_dir, batch_size } => load(run_id, &data_dir, batch_size).await,
        Commands::Append { file, batch_size } => append(run_id, &file, batch_size).await,
        Commands::PrepareReporting {
            data_dir,
            collection,
            batch_size,
        } => prepare_reporting(run_id, &data_dir, &collection, batch_size).await,
        Commands::Analyze { data_dir, algorithm } => analyze(run_id, &data_dir, algorithm).await,
    }
}

async fn load(run_id: Uuid, data_dir: &Path, batch_size: usize) -> Result<()> {
    let relational_config = RelationalConfig::from_env();
    revetl_relational::create_schema(&relational_config)
        .await
        .context("creating relational schema")?;

    let batches = revetl_ingest::read_dataset(data_dir).context("reading dataset")?;
    let identities = revetl_identity::extract_bulk(&batches);
    info!(
        reviewers = identities.reviewers.len(),
        product_types = identities.product_types.len(),
        items = identities.items.len(),
        "extracted identities"
    );

    let relational = RelationalStore::connect(&relational_config).await?;
    let summary = relational
        .bulk_load(&identities)
        .await
        .context("bulk relational load")?;

    let documents = DocumentStore::connect(&DocumentConfig::from_env()).await?;
    let doc_summary = documents
        .load_category_collections(&batches, batch_size)
        .await
        .context("document load")?;

    println!(
        "load complete: run_id={run_id} reviewers={} products={} items={} documents={} flushes={}",
        summary.reviewers_inserted,
        summary.products_inserted,
        summary.items_inserted,
        doc_summary.documents,
        doc_summary.flushes,
    );
    Ok(())
}

async fn append(run_id: Uuid, file: &Path, batch_size: usize) -> Result<()> {
    let filename = file
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("no usable filename in {}", file.display()))?;
    let category = revetl_ingest::category_from_filename(filename);
    let records = revetl_ingest::read_records(file).context("reading category file")?;

    let relational = RelationalStore::connect(&RelationalConfig::from_env()).await?;

    let existing = relational.fetch_reviewer_ids().await?;
    let merge =
        revetl_identity::merge_new_reviewers(revetl_identity::reviewer_rows(&records), &existing);
    let reviewers_inserted = relational.insert_reviewers(&merge.rows).await?;

    let product = revetl_identity::product_type_row(&category, relational.count_products().await?);
    relational
        .insert_products(std::slice::from_ref(&product))
        .await?;

    let items = revetl_identity::item_rows(&records, product.id, relational.count_items().await?);
    let items_inserted = relational.insert_items(&items).await?;

    let documents = DocumentStore::connect(&DocumentConfig::from_env()).await?;
    let doc_summary = documents
        .load_records(&category, &records, None, batch_size)
        .await
        .context("document load")?;

    println!(
        "append complete: run_id={run_id} category={category} reviewers={reviewers_inserted} \
         (skipped {} existing) items={items_inserted} documents={} flushes={}",
        merge.skipped_existing, doc_summary.documents, doc_summary.flushes,
    );
    Ok(())
}

async fn prepare_reporting(
    run_id: Uuid,
    data_dir: &Path,
    collection: &str,
    batch_size: usize,
) -> Result<()> {
    let batches = revetl_ingest::read_dataset(data_dir).context("reading dataset")?;
    let documents = DocumentStore::connect(&DocumentConfig::from_env()).await?;
    let summary = documents
        .load_shared_collection(&batches, collection, batch_size)
        .await
        .context("shared collection load")?;

    println!(
        "reporting load complete: run_id={run_id} collection={collection} documents={} flushes={}",
        summary.documents, summary.flushes,
    );
    Ok(())
}

async fn analyze(run_id: Uuid, data_dir: &Path, algorithm: Analytics) -> Result<()> {
    let batches = revetl_ingest::read_dataset(data_dir).context("reading dataset")?;
    let graph = GraphStore::connect(&GraphConfig::from_env()).await?;

    match algorithm {
        Analytics::Similarity { top_users } => {
            let records = all_records(&batches);
            let run = graph.run_user_similarity(&records, top_users).await?;
            println!(
                "similarity graph rebuilt: run_id={run_id} top_users={} edges={}",
                run.top_users, run.edges,
            );
            match run.most_connected {
                Some(user) => println!(
                    "most connected user: {} with {} neighbors",
                    user.user_id, user.neighbors
                ),
                None => println!("most connected user: none (no SIMILAR edges persisted)"),
            }
        }
        Analytics::ArticleReviews {
            article_type,
            count,
        } => {
            let run = graph
                .run_article_reviews(&batches, &article_type, count)
                .await?;
            println!(
                "article graph rebuilt: run_id={run_id} type={article_type} articles={}/{} review_edges={}",
                run.sampled, run.requested, run.review_edges,
            );
        }
        Analytics::UserTypes { user_limit } => {
            let run = graph.run_user_types(&batches, user_limit).await?;
            println!(
                "user/type graph rebuilt: run_id={run_id} users={} edges={}",
                run.users, run.edges,
            );
        }
        Analytics::SharedReviews { max_reviews, top_n } => {
            let records = all_records(&batches);
            let run = graph
                .run_shared_reviews(&records, max_reviews, top_n)
                .await?;
            println!(
                "shared-review graph rebuilt: run_id={run_id} articles={} review_edges={}",
                run.articles, run.review_edges,
            );
        }
    }
    Ok(())
}

fn all_records(batches: &[CategoryBatch]) -> Vec<RawReview> {
    batches
        .iter()
        .flat_map(|batch| batch.records.iter().cloned())
        .collect()
}
