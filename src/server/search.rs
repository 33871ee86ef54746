use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::common::models::{Community, GeoPoint, Suggestion};
use crate::server::agent::ConversationAgent;
use crate::server::config::{
    CANDIDATE_LIMIT, FUZZY_DISTANCE_THRESHOLD, FUZZY_SCORE, MATCHED_RESULT_LIMIT, MATCH_THRESHOLD,
    PROXIMITY_SCORE, SCORE_WEIGHT_ACTIVITY, SCORE_WEIGHT_FUZZY, SCORE_WEIGHT_KEYWORD,
    SCORE_WEIGHT_PROXIMITY, SCORE_WEIGHT_SEMANTIC, UNMATCHED_RESULT_LIMIT,
};
use crate::server::communities::community_from_row;
use crate::server::database::Database;
use crate::server::embedding::{cosine_similarity, EmbeddingProvider};
use crate::server::geo::{haversine_m, GeoResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Local,
    Global,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(SearchMode::Local),
            "global" => Some(SearchMode::Global),
            _ => None,
        }
    }
}

/// Per-candidate sub-scores plus the fused total. Lives only for the duration
/// of one search call.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub community: Community,
    pub keyword: f64,
    pub fuzzy: f64,
    pub semantic: f64,
    pub activity: f64,
    pub proximity: f64,
    pub total: f64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SearchOutcome {
    Matched {
        communities: Vec<Community>,
    },
    Unmatched {
        communities: Vec<Community>,
        suggestion: Suggestion,
    },
}

/// Weighted-sum fusion of the five sub-scores. The weights sum to 1.45 on
/// purpose; see config.rs.
pub fn fuse_scores(keyword: f64, fuzzy: f64, semantic: f64, activity: f64, proximity: f64) -> f64 {
    SCORE_WEIGHT_KEYWORD * keyword
        + SCORE_WEIGHT_FUZZY * fuzzy
        + SCORE_WEIGHT_SEMANTIC * semantic
        + SCORE_WEIGHT_ACTIVITY * activity
        + SCORE_WEIGHT_PROXIMITY * proximity
}

/// Classic two-row Levenshtein distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Edit distance scaled by the longer input, 0.0 = identical.
fn normalized_distance(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 0.0;
    }
    levenshtein(a, b) as f64 / longest as f64
}

fn searchable_terms(c: &Community) -> Vec<String> {
    let mut terms: Vec<String> = vec![c.name.to_lowercase()];
    terms.extend(c.tags.iter().cloned());
    terms.extend(
        c.name
            .split_whitespace()
            .chain(c.description.split_whitespace())
            .map(|w| w.to_lowercase()),
    );
    terms
}

/// 1.0 when the query or any expanded keyword appears as a substring of the
/// community's name, tags or description.
fn keyword_score(c: &Community, keywords: &[String]) -> f64 {
    let haystack = format!(
        "{} {} {}",
        c.name.to_lowercase(),
        c.tags.join(" "),
        c.description.to_lowercase()
    );
    if keywords.iter().any(|k| haystack.contains(k.as_str())) {
        1.0
    } else {
        0.0
    }
}

/// Binary typo-tolerant signal: 0.8 if any name/tag/description term is
/// within the permissive normalized-distance threshold of the query.
fn fuzzy_score(c: &Community, query: &str) -> f64 {
    let query = query.to_lowercase();
    let close = searchable_terms(c)
        .iter()
        .any(|term| normalized_distance(&query, term) <= FUZZY_DISTANCE_THRESHOLD);
    if close {
        FUZZY_SCORE
    } else {
        0.0
    }
}

fn matched_keyword_count(c: &Community, keywords: &[String]) -> usize {
    let haystack = format!(
        "{} {} {}",
        c.name.to_lowercase(),
        c.tags.join(" "),
        c.description.to_lowercase()
    );
    keywords.iter().filter(|k| haystack.contains(k.as_str())).count()
}

pub struct SearchService {
    db: Arc<Database>,
    geo: Arc<dyn GeoResolver>,
    embedder: Arc<dyn EmbeddingProvider>,
    agent: Arc<dyn ConversationAgent>,
    radius_m: f64,
}

impl SearchService {
    pub fn new(
        db: Arc<Database>,
        geo: Arc<dyn GeoResolver>,
        embedder: Arc<dyn EmbeddingProvider>,
        agent: Arc<dyn ConversationAgent>,
        radius_m: f64,
    ) -> Self {
        Self {
            db,
            geo,
            embedder,
            agent,
            radius_m,
        }
    }

    /// Bounded working set for one search. Local mode returns communities
    /// inside the radius most-proximate first, including ones whose location
    /// had to be resolved from their recorded admin IP; global mode returns
    /// the most recent ones.
    async fn retrieve_candidates(
        &self,
        mode: SearchMode,
        user_geo: Option<GeoPoint>,
    ) -> Vec<Community> {
        let origin = match (mode, user_geo) {
            (SearchMode::Local, Some(origin)) => origin,
            _ => {
                let rows = sqlx::query(
                    "SELECT * FROM communities ORDER BY created_at DESC, rowid DESC LIMIT ?",
                )
                .bind(CANDIDATE_LIMIT as i64)
                .fetch_all(&self.db.pool)
                .await;
                return match rows {
                    Ok(rows) => rows.iter().map(|r| community_from_row(r)).collect(),
                    Err(e) => {
                        warn!("[SEARCH] Candidate query failed: {}", e);
                        Vec::new()
                    }
                };
            }
        };

        let rows = match sqlx::query("SELECT * FROM communities").fetch_all(&self.db.pool).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("[SEARCH] Candidate query failed: {}", e);
                return Vec::new();
            }
        };

        let mut within: Vec<(f64, Community)> = Vec::new();
        for mut community in rows.iter().map(|r| community_from_row(r)) {
            if community.geo.is_known() {
                let d = haversine_m(origin, community.geo);
                if d <= self.radius_m {
                    within.push((d, community));
                }
                continue;
            }

            // Unresolved location: fall back to the creator's source IP. A
            // failed lookup just excludes this candidate; it never aborts the
            // retrieval. On success the coordinates are written back so the
            // next search takes the fast path above (concurrent duplicate
            // fills are harmless, last write wins).
            let Some(ip) = community.admin_ip.clone() else {
                continue;
            };
            let Some(resolved) = self.geo.try_resolve(&ip).await else {
                debug!("[SEARCH] Skipping {}: admin IP lookup failed", community.id);
                continue;
            };
            let point = resolved.point();
            let d = haversine_m(origin, point);
            if d > self.radius_m {
                continue;
            }
            let res = sqlx::query("UPDATE communities SET lng = ?, lat = ? WHERE id = ?")
                .bind(point.lng)
                .bind(point.lat)
                .bind(&community.id)
                .execute(&self.db.pool)
                .await;
            if let Err(e) = res {
                warn!("[SEARCH] Geo backfill failed for {}: {}", community.id, e);
            }
            community.geo = point;
            within.push((d, community));
        }

        within.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        within.truncate(CANDIDATE_LIMIT);
        within.into_iter().map(|(_, c)| c).collect()
    }

    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        user_geo: Option<GeoPoint>,
        user_id: &str,
    ) -> SearchOutcome {
        let candidates = self.retrieve_candidates(mode, user_geo).await;
        info!(
            "[SEARCH] '{}' ({:?}) over {} candidates",
            query,
            mode,
            candidates.len()
        );

        // Expanded keywords narrow the scored set; the expansion call itself
        // degrades to the raw query on any failure.
        let expanded = self.agent.expand_keywords(query, user_id).await;
        let mut keywords = vec![query.to_lowercase()];
        for k in &expanded {
            if !keywords.contains(k) {
                keywords.push(k.clone());
            }
        }

        let required = 2.min(expanded.len());
        let relevant: Vec<&Community> = candidates
            .iter()
            .filter(|c| matched_keyword_count(c, &expanded) >= required)
            .collect();
        let relevant: Vec<&Community> = if relevant.is_empty() {
            // Nothing survived the relevance filter: score the full set
            // rather than returning nothing at all.
            candidates.iter().collect()
        } else {
            relevant
        };

        let query_embedding = self.embedder.embed(query).await;

        let mut scored: Vec<ScoredCandidate> = relevant
            .into_iter()
            .map(|c| {
                let keyword = keyword_score(c, &keywords);
                let fuzzy = fuzzy_score(c, query);
                let semantic = match &query_embedding {
                    Some(qe) if !c.embedding.is_empty() => cosine_similarity(qe, &c.embedding),
                    _ => 0.0,
                };
                let activity = c.activity_score / 100.0;
                let proximity = if mode == SearchMode::Local { PROXIMITY_SCORE } else { 0.0 };
                let total = fuse_scores(keyword, fuzzy, semantic, activity, proximity);
                ScoredCandidate {
                    community: c.clone(),
                    keyword,
                    fuzzy,
                    semantic,
                    activity,
                    proximity,
                    total,
                }
            })
            .collect();

        // sort_by is stable, so equal totals keep their retrieval order.
        scored.sort_by(|a, b| b.total.partial_cmp(&a.total).unwrap_or(std::cmp::Ordering::Equal));

        let top_score = scored.first().map(|s| s.total).unwrap_or(0.0);
        if top_score >= MATCH_THRESHOLD {
            SearchOutcome::Matched {
                communities: scored
                    .into_iter()
                    .take(MATCHED_RESULT_LIMIT)
                    .map(|s| s.community)
                    .collect(),
            }
        } else {
            let suggestion = self.agent.community_proposal(query, &keywords).await;
            SearchOutcome::Unmatched {
                communities: scored
                    .into_iter()
                    .take(UNMATCHED_RESULT_LIMIT)
                    .map(|s| s.community)
                    .collect(),
                suggestion,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::Visibility;
    use crate::server::agent::fallback_suggestion;
    use crate::server::communities::create_community;
    use crate::server::geo::ResolvedLocation;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for NoEmbeddings {
        async fn embed(&self, _text: &str) -> Option<Vec<f32>> {
            None
        }
    }

    /// Echoes the raw query back as the only keyword and always falls back
    /// deterministically, like the production agent does when unconfigured.
    struct OfflineAgent;

    #[async_trait]
    impl ConversationAgent for OfflineAgent {
        async fn expand_keywords(&self, query: &str, _user_id: &str) -> Vec<String> {
            vec![query.to_lowercase()]
        }

        async fn community_proposal(&self, query: &str, keywords: &[String]) -> Suggestion {
            fallback_suggestion(query, keywords)
        }

        async fn icebreaker(&self, _tags: &[String]) -> String {
            crate::server::agent::ICEBREAKER_FALLBACK.to_string()
        }
    }

    struct CountingResolver {
        loc: Option<ResolvedLocation>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GeoResolver for CountingResolver {
        async fn try_resolve(&self, _ip: &str) -> Option<ResolvedLocation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.loc.clone()
        }
    }

    async fn test_db() -> Arc<Database> {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        Arc::new(db)
    }

    fn service_with(db: Arc<Database>, geo: Arc<dyn GeoResolver>) -> SearchService {
        SearchService::new(db, geo, Arc::new(NoEmbeddings), Arc::new(OfflineAgent), 10_000.0)
    }

    async fn seed(db: Arc<Database>, name: &str, tags: &[&str], geo: GeoPoint) -> Community {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        create_community(
            db,
            &NoEmbeddings,
            "user-1",
            name,
            &tags,
            "A place to hang out",
            Visibility::Global,
            geo,
            None,
        )
        .await
        .unwrap()
    }

    #[test]
    fn fusion_weights_are_pinned() {
        // The weights intentionally sum to 1.45; the 0.6 threshold was tuned
        // against that scale. Do not "fix" this.
        assert_eq!(SCORE_WEIGHT_KEYWORD, 0.6);
        assert_eq!(SCORE_WEIGHT_FUZZY, 0.25);
        assert_eq!(SCORE_WEIGHT_SEMANTIC, 0.45);
        assert_eq!(SCORE_WEIGHT_ACTIVITY, 0.1);
        assert_eq!(SCORE_WEIGHT_PROXIMITY, 0.05);
        let sum = SCORE_WEIGHT_KEYWORD
            + SCORE_WEIGHT_FUZZY
            + SCORE_WEIGHT_SEMANTIC
            + SCORE_WEIGHT_ACTIVITY
            + SCORE_WEIGHT_PROXIMITY;
        assert!((sum - 1.45).abs() < 1e-12);
    }

    #[test]
    fn keyword_alone_sits_exactly_on_the_match_boundary() {
        let total = fuse_scores(1.0, 0.0, 0.0, 0.0, 0.0);
        assert_eq!(total, 0.6);
        // The decision check is >=, so a bare keyword hit counts as matched.
        assert!(total >= MATCH_THRESHOLD);
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("chess", "chess"), 0);
        assert_eq!(levenshtein("chess", "chass"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert!(normalized_distance("chess", "chass") <= FUZZY_DISTANCE_THRESHOLD);
        assert!(normalized_distance("chess", "baking") > FUZZY_DISTANCE_THRESHOLD);
    }

    #[tokio::test]
    async fn local_search_matches_nearby_tagged_community() {
        let db = test_db().await;
        let c = seed(
            db.clone(),
            "Delhi Chess Circle",
            &["chess"],
            GeoPoint::new(77.21, 28.61),
        )
        .await;

        let resolver = Arc::new(CountingResolver { loc: None, calls: AtomicUsize::new(0) });
        let service = service_with(db, resolver);

        let outcome = service
            .search("chess", SearchMode::Local, Some(GeoPoint::new(77.20, 28.60)), "user-1")
            .await;

        match outcome {
            SearchOutcome::Matched { communities } => {
                assert!(communities.iter().any(|m| m.id == c.id));
            }
            SearchOutcome::Unmatched { .. } => panic!("expected a match at >= 0.6"),
        }
    }

    #[tokio::test]
    async fn out_of_radius_community_is_not_retrieved_locally() {
        let db = test_db().await;
        seed(db.clone(), "Far Chess", &["chess"], GeoPoint::new(79.0, 30.0)).await;

        let resolver = Arc::new(CountingResolver { loc: None, calls: AtomicUsize::new(0) });
        let service = service_with(db, resolver);

        let outcome = service
            .search("chess", SearchMode::Local, Some(GeoPoint::new(77.20, 28.60)), "user-1")
            .await;
        match outcome {
            SearchOutcome::Unmatched { communities, suggestion } => {
                assert!(communities.is_empty());
                assert_eq!(suggestion.name, "chess");
            }
            SearchOutcome::Matched { .. } => panic!("distant community should not match locally"),
        }
    }

    #[tokio::test]
    async fn admin_ip_backfill_resolves_only_once() {
        let db = test_db().await;
        let c = create_community(
            db.clone(),
            &NoEmbeddings,
            "user-1",
            "Hidden Chess Den",
            &["chess".to_string()],
            "A place to hang out",
            Visibility::Local,
            GeoPoint::UNKNOWN,
            Some("203.0.113.9"),
        )
        .await
        .unwrap();

        let resolver = Arc::new(CountingResolver {
            loc: Some(ResolvedLocation { lat: 28.605, lng: 77.205, city: "Delhi".into() }),
            calls: AtomicUsize::new(0),
        });
        let service = service_with(db.clone(), resolver.clone());
        let origin = Some(GeoPoint::new(77.20, 28.60));

        let first = service.search("chess", SearchMode::Local, origin, "user-1").await;
        match first {
            SearchOutcome::Matched { communities } => {
                assert!(communities.iter().any(|m| m.id == c.id))
            }
            _ => panic!("expected match via admin-IP path"),
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        // Second identical search finds it through the backfilled geo column
        // without another lookup.
        let second = service.search("chess", SearchMode::Local, origin, "user-1").await;
        match second {
            SearchOutcome::Matched { communities } => {
                let found = communities.iter().find(|m| m.id == c.id).unwrap();
                assert!(found.geo.is_known());
            }
            _ => panic!("expected match via backfilled geo"),
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_admin_ip_lookup_excludes_candidate_without_aborting() {
        let db = test_db().await;
        create_community(
            db.clone(),
            &NoEmbeddings,
            "user-1",
            "Unresolvable",
            &["chess".to_string()],
            "A place to hang out",
            Visibility::Local,
            GeoPoint::UNKNOWN,
            Some("203.0.113.10"),
        )
        .await
        .unwrap();
        let near = seed(db.clone(), "Near Chess", &["chess"], GeoPoint::new(77.201, 28.601)).await;

        let resolver = Arc::new(CountingResolver { loc: None, calls: AtomicUsize::new(0) });
        let service = service_with(db, resolver);

        let outcome = service
            .search("chess", SearchMode::Local, Some(GeoPoint::new(77.20, 28.60)), "user-1")
            .await;
        match outcome {
            SearchOutcome::Matched { communities } => {
                assert_eq!(communities.len(), 1);
                assert_eq!(communities[0].id, near.id);
            }
            _ => panic!("retrieval should survive a failed lookup"),
        }
    }

    #[tokio::test]
    async fn unmatched_query_returns_deterministic_suggestion() {
        let db = test_db().await;
        seed(db.clone(), "Sourdough Society", &["baking"], GeoPoint::UNKNOWN).await;

        let resolver = Arc::new(CountingResolver { loc: None, calls: AtomicUsize::new(0) });
        let service = service_with(db, resolver);

        let outcome = service
            .search("underwater hockey", SearchMode::Global, None, "user-1")
            .await;
        match outcome {
            SearchOutcome::Unmatched { suggestion, .. } => {
                assert_eq!(suggestion.name, "underwater hockey");
                assert_eq!(suggestion.description, "A community for underwater hockey");
            }
            SearchOutcome::Matched { .. } => panic!("nothing should match"),
        }
    }

    #[tokio::test]
    async fn equal_scores_keep_retrieval_order() {
        let db = test_db().await;
        let first = seed(db.clone(), "Chess Alpha", &["chess"], GeoPoint::UNKNOWN).await;
        let second = seed(db.clone(), "Chess Beta", &["chess"], GeoPoint::UNKNOWN).await;

        let resolver = Arc::new(CountingResolver { loc: None, calls: AtomicUsize::new(0) });
        let service = service_with(db, resolver);

        let outcome = service.search("chess", SearchMode::Global, None, "user-1").await;
        match outcome {
            SearchOutcome::Matched { communities } => {
                let ids: Vec<&str> = communities.iter().map(|c| c.id.as_str()).collect();
                // Global retrieval is most-recent-first; ties must not reorder.
                assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
            }
            _ => panic!("expected matches"),
        }
    }
}
