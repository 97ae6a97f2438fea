//! Graph analytics engine: four algorithms that rebuild the graph store
//! from the raw review dataset.
//!
//! Every algorithm follows the same shape: compute in memory, then clear
//! the graph and persist inside one transaction, committed only when every
//! statement succeeds. Compute stages are pure functions with
//! deterministic ordering (ties break on id / asin / name) so they can be
//! tested without a live store. All persistence goes through parameterized
//! queries; no value is ever interpolated into query text.

use std::collections::{BTreeMap, BTreeSet};

use neo4rs::{query, Graph, Txn};
use rand::seq::SliceRandom;
use rand::Rng;
use revetl_core::{format_review_date, CategoryBatch, EtlError, RawReview};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "revetl-graph";

pub const DEFAULT_TOP_USERS: usize = 30;
pub const DEFAULT_USER_LIMIT: usize = 400;
pub const DEFAULT_MAX_REVIEWS: usize = 40;
pub const DEFAULT_POPULAR_TOP_N: usize = 5;

const CLEAR_GRAPH: &str = "MATCH (n) DETACH DELETE n";

const MERGE_SIMILAR: &str = "MERGE (u1:User {id: $from}) \
     MERGE (u2:User {id: $to}) \
     MERGE (u1)-[:SIMILAR {similarity: $similarity}]->(u2)";

const MOST_CONNECTED: &str = "MATCH (u:User)-[:SIMILAR]-() \
     RETURN u.id AS user, count(*) AS neighbors \
     ORDER BY neighbors DESC LIMIT 1";

const MERGE_ARTICLE: &str =
    "MERGE (a:Article {id: $id}) ON CREATE SET a.firstSeen = timestamp()";

const MERGE_ARTICLE_REVIEW: &str = "MERGE (u:User {id: $user_id, name: $user_name}) \
     ON CREATE SET u.firstSeen = timestamp() \
     MERGE (a:Article {id: $article_id}) \
     MERGE (u)-[:REVIEWED {text: $text, score: $score, date: $date}]->(a)";

const MERGE_USER_TYPE: &str = "MERGE (u:User {id: $user_id}) \
     MERGE (t:ArticleType {type: $article_type}) \
     MERGE (u)-[r:REVIEWED]->(t) \
     SET r.count = $count";

const MERGE_POPULAR_REVIEW: &str = "MERGE (a:Article {id: $article_id}) \
     MERGE (u:User {id: $user_id}) \
     MERGE (u)-[r:REVIEWED]->(a) \
     ON CREATE SET r.rating = $rating, r.reviewTime = $review_time";

const CREATE_SHARED_REVIEWS: &str =
    "MATCH (u1:User)-[:REVIEWED]->(a:Article)<-[:REVIEWED]-(u2:User) \
     WITH u1, u2, COUNT(a) AS sharedArticles \
     WHERE u1 <> u2 AND sharedArticles > 1 \
     MERGE (u1)-[r:SHARED_REVIEWS]->(u2) \
     SET r.count = sharedArticles";

/// Connection settings for the graph store.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

impl GraphConfig {
    pub fn from_env() -> Self {
        Self {
            uri: std::env::var("REVETL_NEO4J_URI")
                .unwrap_or_else(|_| "neo4j://localhost:7687".to_string()),
            user: std::env::var("REVETL_NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string()),
            password: std::env::var("REVETL_NEO4J_PASSWORD").unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Compute stages
// ---------------------------------------------------------------------------

/// Distinct reviewed products per user, over the whole record set.
pub fn products_per_user(records: &[RawReview]) -> BTreeMap<&str, BTreeSet<&str>> {
    let mut map: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for record in records {
        map.entry(record.reviewer_id.as_str())
            .or_default()
            .insert(record.asin.as_str());
    }
    map
}

/// Top-n users by distinct-product count, descending, ties broken by user id.
pub fn top_users<'a>(
    records: &'a [RawReview],
    n: usize,
) -> Vec<(&'a str, BTreeSet<&'a str>)> {
    let mut users: Vec<(&str, BTreeSet<&str>)> = products_per_user(records).into_iter().collect();
    users.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));
    users.truncate(n);
    users
}

pub fn jaccard(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Directed similarity edge between two users.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityEdge {
    pub from: String,
    pub to: String,
    pub similarity: f64,
}

/// Jaccard similarity over every ordered pair of distinct top users. Both
/// directions are emitted as separate edges; only similarities above zero
/// survive.
pub fn similarity_edges(top: &[(&str, BTreeSet<&str>)]) -> Vec<SimilarityEdge> {
    let mut edges = Vec::new();
    for (from, from_items) in top {
        for (to, to_items) in top {
            if from == to {
                continue;
            }
            let similarity = jaccard(from_items, to_items);
            if similarity > 0.0 {
                edges.push(SimilarityEdge {
                    from: (*from).to_string(),
                    to: (*to).to_string(),
                    similarity,
                });
            }
        }
    }
    edges
}

/// Distinct asins of one article type, sorted.
pub fn articles_of_type(batches: &[CategoryBatch], article_type: &str) -> Vec<String> {
    let mut asins = BTreeSet::new();
    for batch in batches {
        if batch.category != article_type {
            continue;
        }
        for record in &batch.records {
            asins.insert(record.asin.clone());
        }
    }
    asins.into_iter().collect()
}

/// Samples `count` articles without replacement. When fewer articles exist
/// than requested, every available article is returned and the caller is
/// expected to have been warned.
pub fn sample_articles(pool: Vec<String>, count: usize, rng: &mut impl Rng) -> Vec<String> {
    if pool.len() <= count {
        return pool;
    }
    pool.choose_multiple(rng, count).cloned().collect()
}

/// Review counts per article type for one user. Users are keyed by
/// (name, id): the dataset occasionally carries the same id under several
/// display names and each pairing is kept, matching the bipartite-graph
/// selection which sorts by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTypeCounts {
    pub user_id: String,
    pub user_name: String,
    pub counts: BTreeMap<String, u64>,
}

pub fn user_type_counts(batches: &[CategoryBatch]) -> Vec<UserTypeCounts> {
    let mut map: BTreeMap<(String, String), BTreeMap<String, u64>> = BTreeMap::new();
    for batch in batches {
        for record in &batch.records {
            let key = (record.reviewer_name.clone(), record.reviewer_id.clone());
            *map.entry(key)
                .or_default()
                .entry(batch.category.clone())
                .or_default() += 1;
        }
    }
    // BTreeMap iteration already sorts by (name, id).
    map.into_iter()
        .map(|((user_name, user_id), counts)| UserTypeCounts {
            user_id,
            user_name,
            counts,
        })
        .collect()
}

/// Restricts to the first `user_limit` users sorted by name, keeping only
/// users who reviewed more than one distinct article type.
pub fn multi_type_users(mut users: Vec<UserTypeCounts>, user_limit: usize) -> Vec<UserTypeCounts> {
    users.truncate(user_limit);
    users.retain(|user| user.counts.len() > 1);
    users
}

/// Top-n articles by review count among those with fewer reviews than
/// `max_reviews`, each with its reviews. Ties break on asin.
pub fn popular_under_reviewed<'a>(
    records: &'a [RawReview],
    max_reviews: usize,
    top_n: usize,
) -> Vec<(String, Vec<&'a RawReview>)> {
    let mut reviews_by_asin: BTreeMap<&str, Vec<&RawReview>> = BTreeMap::new();
    for record in records {
        reviews_by_asin
            .entry(record.asin.as_str())
            .or_default()
            .push(record);
    }

    let mut eligible: Vec<(&str, Vec<&RawReview>)> = reviews_by_asin
        .into_iter()
        .filter(|(_, reviews)| reviews.len() < max_reviews)
        .collect();
    eligible.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));
    eligible.truncate(top_n);
    eligible
        .into_iter()
        .map(|(asin, reviews)| (asin.to_string(), reviews))
        .collect()
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// User reported as having the most SIMILAR relationships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MostConnected {
    pub user_id: String,
    pub neighbors: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityRun {
    pub top_users: usize,
    pub edges: usize,
    pub most_connected: Option<MostConnected>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleReviewRun {
    pub requested: usize,
    pub sampled: usize,
    pub review_edges: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTypeRun {
    pub users: usize,
    pub edges: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedReviewsRun {
    pub articles: usize,
    pub review_edges: usize,
}

/// Handle to the graph store. Each `run_*` method destroys the current
/// graph content and rebuilds it for one algorithm.
pub struct GraphStore {
    graph: Graph,
}

impl GraphStore {
    pub async fn connect(config: &GraphConfig) -> Result<Self, EtlError> {
        let graph = Graph::new(&config.uri, &config.user, &config.password)
            .await
            .map_err(EtlError::connectivity)?;
        Ok(Self { graph })
    }

    /// Algorithm 1: SIMILAR edges between the top users by distinct-product
    /// count, then a report of the most connected user.
    pub async fn run_user_similarity(
        &self,
        records: &[RawReview],
        top_n: usize,
    ) -> Result<SimilarityRun, EtlError> {
        let top = top_users(records, top_n);
        let edges = similarity_edges(&top);
        info!(top_users = top.len(), edges = edges.len(), "computed user similarities");

        let mut txn = self.begin().await?;
        let persisted = async {
            clear(&mut txn).await?;
            for edge in &edges {
                run(
                    &mut txn,
                    query(MERGE_SIMILAR)
                        .param("from", edge.from.as_str())
                        .param("to", edge.to.as_str())
                        .param("similarity", edge.similarity),
                )
                .await?;
            }
            Ok::<_, EtlError>(())
        }
        .await;
        self.finish(txn, persisted).await?;

        let most_connected = self.most_connected_user().await?;
        Ok(SimilarityRun {
            top_users: top.len(),
            edges: edges.len(),
            most_connected,
        })
    }

    /// Algorithm 2: a random-article subgraph with one REVIEWED edge per
    /// matching review, carrying the raw text / score / date.
    pub async fn run_article_reviews(
        &self,
        batches: &[CategoryBatch],
        article_type: &str,
        count: usize,
    ) -> Result<ArticleReviewRun, EtlError> {
        let pool = articles_of_type(batches, article_type);
        if pool.len() < count {
            warn!(
                article_type,
                available = pool.len(),
                requested = count,
                "fewer articles than requested, using all available"
            );
        }
        let sampled = sample_articles(pool, count, &mut rand::thread_rng());
        let selected: BTreeSet<&str> = sampled.iter().map(String::as_str).collect();

        let mut review_edges = 0usize;
        let mut txn = self.begin().await?;
        let persisted = async {
            clear(&mut txn).await?;
            for article in &sampled {
                run(&mut txn, query(MERGE_ARTICLE).param("id", article.as_str())).await?;
            }
            for batch in batches {
                for record in &batch.records {
                    if !selected.contains(record.asin.as_str()) {
                        continue;
                    }
                    run(
                        &mut txn,
                        query(MERGE_ARTICLE_REVIEW)
                            .param("user_id", record.reviewer_id.as_str())
                            .param("user_name", record.reviewer_name.as_str())
                            .param("article_id", record.asin.as_str())
                            .param("text", record.review_text.as_str())
                            .param("score", record.overall)
                            .param("date", record.review_time.as_str()),
                    )
                    .await?;
                    review_edges += 1;
                }
            }
            Ok::<_, EtlError>(())
        }
        .await;
        self.finish(txn, persisted).await?;

        Ok(ArticleReviewRun {
            requested: count,
            sampled: sampled.len(),
            review_edges,
        })
    }

    /// Algorithm 3: user x article-type bipartite graph restricted to the
    /// first `user_limit` users by name, keeping multi-type reviewers only.
    pub async fn run_user_types(
        &self,
        batches: &[CategoryBatch],
        user_limit: usize,
    ) -> Result<UserTypeRun, EtlError> {
        let selected = multi_type_users(user_type_counts(batches), user_limit);
        let edge_count: usize = selected.iter().map(|u| u.counts.len()).sum();
        info!(users = selected.len(), edges = edge_count, "computed user/type graph");

        let mut txn = self.begin().await?;
        let persisted = async {
            clear(&mut txn).await?;
            for user in &selected {
                for (article_type, count) in &user.counts {
                    run(
                        &mut txn,
                        query(MERGE_USER_TYPE)
                            .param("user_id", user.user_id.as_str())
                            .param("article_type", article_type.as_str())
                            .param("count", *count as i64),
                    )
                    .await?;
                }
            }
            Ok::<_, EtlError>(())
        }
        .await;
        self.finish(txn, persisted).await?;

        Ok(UserTypeRun {
            users: selected.len(),
            edges: edge_count,
        })
    }

    /// Algorithm 4: popular-but-under-reviewed articles with their reviews,
    /// then a graph-native aggregation linking users who share more than one
    /// reviewed article.
    pub async fn run_shared_reviews(
        &self,
        records: &[RawReview],
        max_reviews: usize,
        top_n: usize,
    ) -> Result<SharedReviewsRun, EtlError> {
        let articles = popular_under_reviewed(records, max_reviews, top_n);
        let mut review_edges = 0usize;

        let mut txn = self.begin().await?;
        let persisted = async {
            clear(&mut txn).await?;
            for (asin, reviews) in &articles {
                for review in reviews {
                    let date = format_review_date(review.review_date()?);
                    run(
                        &mut txn,
                        query(MERGE_POPULAR_REVIEW)
                            .param("article_id", asin.as_str())
                            .param("user_id", review.reviewer_id.as_str())
                            .param("rating", review.overall)
                            .param("review_time", date),
                    )
                    .await?;
                    review_edges += 1;
                }
            }
            run(&mut txn, query(CREATE_SHARED_REVIEWS)).await?;
            Ok::<_, EtlError>(())
        }
        .await;
        self.finish(txn, persisted).await?;

        Ok(SharedReviewsRun {
            articles: articles.len(),
            review_edges,
        })
    }

    async fn most_connected_user(&self) -> Result<Option<MostConnected>, EtlError> {
        let mut stream = self
            .graph
            .execute(query(MOST_CONNECTED))
            .await
            .map_err(EtlError::connectivity)?;
        let row = stream.next().await.map_err(EtlError::connectivity)?;
        match row {
            Some(row) => {
                let user_id: String = row.get("user").map_err(EtlError::validation)?;
                let neighbors: i64 = row.get("neighbors").map_err(EtlError::validation)?;
                Ok(Some(MostConnected { user_id, neighbors }))
            }
            None => Ok(None),
        }
    }

    async fn begin(&self) -> Result<Txn, EtlError> {
        self.graph.start_txn().await.map_err(EtlError::connectivity)
    }

    /// Commits on success, rolls back on the first failed statement so a
    /// failed rebuild never leaves the graph partially replaced.
    async fn finish(&self, txn: Txn, result: Result<(), EtlError>) -> Result<(), EtlError> {
        match result {
            Ok(()) => txn.commit().await.map_err(EtlError::connectivity),
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }
}

async fn clear(txn: &mut Txn) -> Result<(), EtlError> {
    run(txn, query(CLEAR_GRAPH)).await
}

async fn run(txn: &mut Txn, q: neo4rs::Query) -> Result<(), EtlError> {
    txn.run(q).await.map_err(EtlError::connectivity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn review(user: &str, name: &str, asin: &str) -> RawReview {
        RawReview {
            reviewer_id: user.to_string(),
            reviewer_name: name.to_string(),
            asin: asin.to_string(),
            review_time: "01 15, 2014".to_string(),
            overall: 4.0,
            ..RawReview::default()
        }
    }

    fn batch(category: &str, records: Vec<RawReview>) -> CategoryBatch {
        CategoryBatch {
            category: category.to_string(),
            records,
        }
    }

    #[test]
    fn top_users_order_by_distinct_products() {
        let records = vec![
            review("A1", "", "B1"),
            review("A1", "", "B1"),
            review("A2", "", "B1"),
            review("A2", "", "B2"),
            review("A3", "", "B3"),
        ];
        let top = top_users(&records, 2);
        assert_eq!(top[0].0, "A2");
        assert_eq!(top[0].1.len(), 2);
        // A1 and A3 tie on one product; the lower id wins.
        assert_eq!(top[1].0, "A1");
    }

    #[test]
    fn jaccard_matches_hand_computed_values() {
        let a: BTreeSet<&str> = ["B1", "B2", "B3"].into_iter().collect();
        let b: BTreeSet<&str> = ["B2", "B3", "B4"].into_iter().collect();
        let c: BTreeSet<&str> = ["B9"].into_iter().collect();
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-9);
        assert_eq!(jaccard(&a, &c), 0.0);
        assert_eq!(jaccard(&a, &a), 1.0);
    }

    #[test]
    fn similarity_edges_carry_both_directions() {
        let records = vec![
            review("A1", "", "B1"),
            review("A1", "", "B2"),
            review("A2", "", "B2"),
            review("A2", "", "B3"),
            review("A3", "", "B9"),
        ];
        let top = top_users(&records, 3);
        let edges = similarity_edges(&top);

        let forward = edges.iter().find(|e| e.from == "A1" && e.to == "A2");
        let backward = edges.iter().find(|e| e.from == "A2" && e.to == "A1");
        let (forward, backward) = (forward.expect("A1->A2"), backward.expect("A2->A1"));
        assert_eq!(forward.similarity, backward.similarity);
        // A3 shares nothing, so no zero-similarity edges appear.
        assert!(edges.iter().all(|e| e.from != "A3" && e.to != "A3"));
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn sampling_without_replacement_caps_at_pool_size() {
        let mut rng = StdRng::seed_from_u64(7);
        let pool: Vec<String> = (0..5).map(|i| format!("B{i}")).collect();

        let all = sample_articles(pool.clone(), 10, &mut rng);
        assert_eq!(all, pool);

        let three = sample_articles(pool.clone(), 3, &mut rng);
        assert_eq!(three.len(), 3);
        let distinct: BTreeSet<&String> = three.iter().collect();
        assert_eq!(distinct.len(), 3);
        assert!(three.iter().all(|a| pool.contains(a)));
    }

    #[test]
    fn articles_of_type_filters_and_sorts() {
        let batches = vec![
            batch("Video_Games", vec![review("A1", "", "G2"), review("A2", "", "G1")]),
            batch("Digital_Music", vec![review("A1", "", "M1")]),
        ];
        assert_eq!(articles_of_type(&batches, "Video_Games"), vec!["G1", "G2"]);
        assert!(articles_of_type(&batches, "Books").is_empty());
    }

    #[test]
    fn bipartite_selection_keeps_multi_type_users_within_limit() {
        let batches = vec![
            batch(
                "Video_Games",
                vec![
                    review("A1", "Alice", "G1"),
                    review("A2", "Bob", "G2"),
                    review("A3", "Zoe", "G3"),
                ],
            ),
            batch(
                "Digital_Music",
                vec![
                    review("A1", "Alice", "M1"),
                    review("A1", "Alice", "M2"),
                    review("A3", "Zoe", "M3"),
                ],
            ),
        ];
        let counts = user_type_counts(&batches);
        // Sorted by name: Alice, Bob, Zoe.
        assert_eq!(counts[0].user_name, "Alice");
        assert_eq!(counts[0].counts["Digital_Music"], 2);

        // Limit of 2 cuts Zoe before the multi-type filter runs.
        let selected = multi_type_users(counts.clone(), 2);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].user_id, "A1");

        let selected_all = multi_type_users(counts, 400);
        assert_eq!(selected_all.len(), 2);
    }

    #[test]
    fn popular_filter_excludes_over_threshold_articles() {
        let mut records = Vec::new();
        for (asin, count) in [("B50", 50), ("B39", 39), ("Bx", 5), ("By", 5), ("Bz", 5)] {
            for i in 0..count {
                records.push(review(&format!("U{i}"), "", asin));
            }
        }

        let selected = popular_under_reviewed(&records, 40, 3);
        let asins: Vec<&str> = selected.iter().map(|(asin, _)| asin.as_str()).collect();
        assert_eq!(selected.len(), 3);
        assert!(!asins.contains(&"B50"));
        assert_eq!(asins[0], "B39");
        // Equal-count tie broken by asin order.
        assert_eq!(&asins[1..], &["Bx", "By"]);
    }

    #[test]
    fn persistence_queries_are_fully_parameterized() {
        for statement in [
            MERGE_SIMILAR,
            MERGE_ARTICLE,
            MERGE_ARTICLE_REVIEW,
            MERGE_USER_TYPE,
            MERGE_POPULAR_REVIEW,
        ] {
            assert!(statement.contains('$'), "{statement} should bind parameters");
            assert!(!statement.contains('\''), "{statement} should not inline values");
        }
    }
}
